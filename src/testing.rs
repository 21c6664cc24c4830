//! Test doubles and DICOM fixtures shared by the unit tests.

use crate::backend::{
	IndexError, MetadataIndex, ObjectStore, ObjectStoreIndex, SinkProvider, StorageError,
};
use crate::config::AppConfig;
use crate::export::ExportDestination;
use crate::identifier::InstanceIdentifier;
use crate::transcoding::{write_dicom, Codec, CodecError, EXPLICIT_VR_LITTLE_ENDIAN};
use crate::AppState;
use async_trait::async_trait;
use axum::Router;
use bytes::Bytes;
use dicom::core::value::PixelFragmentSequence;
use dicom::core::{DataElement, DicomValue, PrimitiveValue, VR};
use dicom::dictionary_std::{tags, uids};
use dicom::object::{DefaultDicomObject, FileMetaTableBuilder, InMemDicomObject};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// An [`ObjectStore`] that keeps its objects in memory. Keys are listed in order.
#[derive(Default)]
pub struct MemoryStore {
	objects: Mutex<BTreeMap<String, Bytes>>,
	failing_gets: Mutex<HashSet<String>>,
	failing_puts: Mutex<Vec<String>>,
	transient_gets: Mutex<HashSet<String>>,
	/// Pattern and the number of matching writes until the failing one.
	transient_puts: Mutex<Vec<(String, usize)>>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert(&self, key: &str, body: Bytes) {
		self.objects.lock().unwrap().insert(key.to_owned(), body);
	}

	pub fn get(&self, key: &str) -> Option<Bytes> {
		self.objects.lock().unwrap().get(key).cloned()
	}

	pub fn keys(&self) -> Vec<String> {
		self.objects.lock().unwrap().keys().cloned().collect()
	}

	/// Reads of `key` fail with a backend error.
	pub fn fail_get(&self, key: &str) {
		self.failing_gets.lock().unwrap().insert(key.to_owned());
	}

	/// Writes to keys containing `pattern` fail with a backend error.
	pub fn fail_puts_containing(&self, pattern: &str) {
		self.failing_puts.lock().unwrap().push(pattern.to_owned());
	}

	/// The next read of `key` fails, later reads succeed.
	pub fn fail_get_once(&self, key: &str) {
		self.transient_gets.lock().unwrap().insert(key.to_owned());
	}

	/// The `nth` write (1-based) to a key containing `pattern` fails, all others succeed.
	pub fn fail_nth_put_containing(&self, pattern: &str, nth: usize) {
		self.transient_puts
			.lock()
			.unwrap()
			.push((pattern.to_owned(), nth.max(1)));
	}

	fn transient_put_failure(&self, key: &str) -> bool {
		let mut fails = false;
		self.transient_puts
			.lock()
			.unwrap()
			.retain_mut(|(pattern, remaining)| {
				if !key.contains(pattern.as_str()) {
					return true;
				}
				*remaining -= 1;
				fails |= *remaining == 0;
				*remaining > 0
			});
		fails
	}
}

#[async_trait]
impl ObjectStore for MemoryStore {
	async fn get_object(&self, key: &str) -> Result<Bytes, StorageError> {
		if self.failing_gets.lock().unwrap().contains(key)
			|| self.transient_gets.lock().unwrap().remove(key)
		{
			return Err(StorageError::Backend {
				source: anyhow::anyhow!("simulated read failure for {key}"),
			});
		}
		self.get(key).ok_or_else(|| StorageError::NotFound {
			key: key.to_owned(),
		})
	}

	async fn put_object(&self, key: &str, body: Bytes) -> Result<(), StorageError> {
		let fails = self
			.failing_puts
			.lock()
			.unwrap()
			.iter()
			.any(|pattern| key.contains(pattern.as_str()));
		if fails || self.transient_put_failure(key) {
			return Err(StorageError::Backend {
				source: anyhow::anyhow!("simulated write failure for {key}"),
			});
		}
		self.insert(key, body);
		Ok(())
	}

	async fn list_objects(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
		Ok(self
			.objects
			.lock()
			.unwrap()
			.keys()
			.filter(|key| key.starts_with(prefix))
			.cloned()
			.collect())
	}

	fn location(&self, key: &str) -> String {
		format!("memory://{key}")
	}
}

/// Hands out the same [`MemoryStore`] for every destination.
pub struct MemorySinkProvider {
	pub store: Arc<MemoryStore>,
}

impl MemorySinkProvider {
	pub const fn new(store: Arc<MemoryStore>) -> Self {
		Self { store }
	}
}

#[async_trait]
impl SinkProvider for MemorySinkProvider {
	async fn open(
		&self,
		_destination: &ExportDestination,
	) -> Result<Arc<dyn ObjectStore>, StorageError> {
		let store: Arc<dyn ObjectStore> = self.store.clone();
		Ok(store)
	}
}

/// A [`MetadataIndex`] over a fixed set of instances.
pub struct StaticIndex {
	instances: BTreeSet<InstanceIdentifier>,
}

impl StaticIndex {
	pub fn new<'a>(instances: impl IntoIterator<Item = &'a str>) -> Self {
		Self {
			instances: instances
				.into_iter()
				.map(|instance| instance.parse().unwrap())
				.collect(),
		}
	}
}

#[async_trait]
impl MetadataIndex for StaticIndex {
	async fn list_instances_in_study(
		&self,
		study_instance_uid: &str,
	) -> Result<Vec<InstanceIdentifier>, IndexError> {
		Ok(self
			.instances
			.iter()
			.filter(|instance| instance.study_instance_uid() == study_instance_uid)
			.cloned()
			.collect())
	}

	async fn list_instances_in_series(
		&self,
		study_instance_uid: &str,
		series_instance_uid: &str,
	) -> Result<Vec<InstanceIdentifier>, IndexError> {
		Ok(self
			.instances
			.iter()
			.filter(|instance| {
				instance.study_instance_uid() == study_instance_uid
					&& instance.series_instance_uid() == Some(series_instance_uid)
			})
			.cloned()
			.collect())
	}

	async fn contains_instance(&self, instance: &InstanceIdentifier) -> Result<bool, IndexError> {
		Ok(self.instances.contains(instance))
	}
}

/// Fails every lookup within one study.
pub struct FailingIndex {
	inner: StaticIndex,
	study_instance_uid: String,
}

impl FailingIndex {
	pub fn new(inner: StaticIndex, study_instance_uid: &str) -> Self {
		Self {
			inner,
			study_instance_uid: study_instance_uid.to_owned(),
		}
	}

	fn check(&self, study_instance_uid: &str) -> Result<(), IndexError> {
		if study_instance_uid == self.study_instance_uid {
			return Err(IndexError::Storage(StorageError::Backend {
				source: anyhow::anyhow!("simulated index failure"),
			}));
		}
		Ok(())
	}
}

#[async_trait]
impl MetadataIndex for FailingIndex {
	async fn list_instances_in_study(
		&self,
		study_instance_uid: &str,
	) -> Result<Vec<InstanceIdentifier>, IndexError> {
		self.check(study_instance_uid)?;
		self.inner.list_instances_in_study(study_instance_uid).await
	}

	async fn list_instances_in_series(
		&self,
		study_instance_uid: &str,
		series_instance_uid: &str,
	) -> Result<Vec<InstanceIdentifier>, IndexError> {
		self.check(study_instance_uid)?;
		self.inner
			.list_instances_in_series(study_instance_uid, series_instance_uid)
			.await
	}

	async fn contains_instance(&self, instance: &InstanceIdentifier) -> Result<bool, IndexError> {
		self.check(instance.study_instance_uid())?;
		self.inner.contains_instance(instance).await
	}
}

/// Builds small single- or multi-frame images.
///
/// Native pixel data is deterministic: byte `i` of frame `f` is `f * 16 + i`.
/// Encapsulated transfer syntaxes get one opaque fragment per frame.
#[derive(Debug, Clone)]
pub struct ImageFixture {
	pub study: String,
	pub series: String,
	pub sop: String,
	pub transfer_syntax: String,
	pub frames: u32,
	pub rows: u16,
	pub columns: u16,
	pub bits_allocated: u16,
	pub photometric: String,
	pub with_pixel_data: bool,
}

impl ImageFixture {
	pub fn new(study: &str, series: &str, sop: &str) -> Self {
		Self {
			study: study.to_owned(),
			series: series.to_owned(),
			sop: sop.to_owned(),
			transfer_syntax: String::from(EXPLICIT_VR_LITTLE_ENDIAN),
			frames: 1,
			rows: 2,
			columns: 2,
			bits_allocated: 8,
			photometric: String::from("MONOCHROME2"),
			with_pixel_data: true,
		}
	}

	pub fn frames(mut self, frames: u32) -> Self {
		self.frames = frames;
		self
	}

	pub fn transfer_syntax(mut self, uid: &str) -> Self {
		self.transfer_syntax = uid.to_owned();
		self
	}

	pub fn bits_allocated(mut self, bits_allocated: u16) -> Self {
		self.bits_allocated = bits_allocated;
		self
	}

	pub fn photometric(mut self, photometric: &str) -> Self {
		self.photometric = photometric.to_owned();
		self
	}

	pub fn without_pixel_data(mut self) -> Self {
		self.with_pixel_data = false;
		self
	}

	pub fn identifier(&self) -> InstanceIdentifier {
		InstanceIdentifier::instance(&self.study, &self.series, &self.sop).unwrap()
	}

	pub fn object_key(&self) -> String {
		self.identifier().object_key().unwrap()
	}

	fn frame_length(&self) -> usize {
		usize::from(self.rows) * usize::from(self.columns) * usize::from(self.bits_allocated) / 8
	}

	fn encapsulated(&self) -> bool {
		crate::transcoding::capability(&self.transfer_syntax)
			.is_some_and(|capability| capability.encapsulated)
	}

	/// The stored bytes of a frame (0-based).
	pub fn frame_bytes(&self, frame: u32) -> Bytes {
		if self.encapsulated() {
			return Bytes::from(format!("fragment-{frame}").into_bytes());
		}
		(0..self.frame_length())
			.map(|i| (frame as usize * 16 + i) as u8)
			.collect()
	}

	pub fn build(&self) -> DefaultDicomObject {
		let mut object = InMemDicomObject::from_element_iter([
			DataElement::new(
				tags::SOP_CLASS_UID,
				VR::UI,
				PrimitiveValue::from(uids::SECONDARY_CAPTURE_IMAGE_STORAGE),
			),
			DataElement::new(
				tags::SOP_INSTANCE_UID,
				VR::UI,
				PrimitiveValue::from(self.sop.as_str()),
			),
			DataElement::new(
				tags::STUDY_INSTANCE_UID,
				VR::UI,
				PrimitiveValue::from(self.study.as_str()),
			),
			DataElement::new(
				tags::SERIES_INSTANCE_UID,
				VR::UI,
				PrimitiveValue::from(self.series.as_str()),
			),
			DataElement::new(tags::SAMPLES_PER_PIXEL, VR::US, PrimitiveValue::from(1_u16)),
			DataElement::new(
				tags::PHOTOMETRIC_INTERPRETATION,
				VR::CS,
				PrimitiveValue::from(self.photometric.as_str()),
			),
			DataElement::new(
				tags::NUMBER_OF_FRAMES,
				VR::IS,
				PrimitiveValue::from(self.frames.to_string()),
			),
			DataElement::new(tags::ROWS, VR::US, PrimitiveValue::from(self.rows)),
			DataElement::new(tags::COLUMNS, VR::US, PrimitiveValue::from(self.columns)),
			DataElement::new(
				tags::BITS_ALLOCATED,
				VR::US,
				PrimitiveValue::from(self.bits_allocated),
			),
			DataElement::new(
				tags::BITS_STORED,
				VR::US,
				PrimitiveValue::from(self.bits_allocated),
			),
			DataElement::new(
				tags::HIGH_BIT,
				VR::US,
				PrimitiveValue::from(self.bits_allocated - 1),
			),
			DataElement::new(tags::PIXEL_REPRESENTATION, VR::US, PrimitiveValue::from(0_u16)),
		]);

		if self.with_pixel_data {
			if self.encapsulated() {
				let fragments: Vec<Vec<u8>> = (0..self.frames)
					.map(|frame| self.frame_bytes(frame).to_vec())
					.collect();
				object.put(DataElement::new(
					tags::PIXEL_DATA,
					VR::OB,
					DicomValue::PixelSequence(PixelFragmentSequence::new(Vec::<u32>::new(), fragments)),
				));
			} else {
				let data: Vec<u8> = (0..self.frames)
					.flat_map(|frame| self.frame_bytes(frame).to_vec())
					.collect();
				let vr = if self.bits_allocated > 8 { VR::OW } else { VR::OB };
				object.put(DataElement::new(tags::PIXEL_DATA, vr, PrimitiveValue::from(data)));
			}
		}

		object
			.with_meta(FileMetaTableBuilder::new().transfer_syntax(self.transfer_syntax.as_str()))
			.unwrap()
	}
}

/// Serialized DICOM file of the fixture.
pub fn dicom_file(fixture: &ImageFixture) -> Bytes {
	write_dicom(&fixture.build()).unwrap()
}

/// An archive holding the given images under their object keys.
pub fn archive(fixtures: &[ImageFixture]) -> Arc<MemoryStore> {
	let store = MemoryStore::new();
	for fixture in fixtures {
		store.insert(&fixture.object_key(), dicom_file(fixture));
	}
	Arc::new(store)
}

/// A [`Codec`] that records its invocations and leaves the objects untouched.
#[derive(Default)]
pub struct CountingCodec {
	pub transcodes: AtomicUsize,
	pub frame_decodes: AtomicUsize,
}

impl CountingCodec {
	pub fn transcodes(&self) -> usize {
		self.transcodes.load(Ordering::SeqCst)
	}

	pub fn frame_decodes(&self) -> usize {
		self.frame_decodes.load(Ordering::SeqCst)
	}
}

impl Codec for CountingCodec {
	fn transcode(
		&self,
		object: DefaultDicomObject,
		_target: &str,
	) -> Result<DefaultDicomObject, CodecError> {
		self.transcodes.fetch_add(1, Ordering::SeqCst);
		Ok(object)
	}

	fn decode_frame(
		&self,
		_object: &DefaultDicomObject,
		frame: u32,
		target: &str,
	) -> Result<Bytes, CodecError> {
		self.frame_decodes.fetch_add(1, Ordering::SeqCst);
		Ok(Bytes::from(format!("decoded-{frame}-{target}").into_bytes()))
	}
}

/// A [`Codec`] whose conversions always fail.
pub struct FailingCodec;

impl Codec for FailingCodec {
	fn transcode(
		&self,
		_object: DefaultDicomObject,
		target: &str,
	) -> Result<DefaultDicomObject, CodecError> {
		Err(CodecError::Transcode {
			target: target.to_owned(),
			reason: String::from("simulated codec failure"),
		})
	}

	fn decode_frame(
		&self,
		_object: &DefaultDicomObject,
		_frame: u32,
		target: &str,
	) -> Result<Bytes, CodecError> {
		Err(CodecError::Transcode {
			target: target.to_owned(),
			reason: String::from("simulated codec failure"),
		})
	}
}

/// The embedded default configuration.
pub fn test_config() -> AppConfig {
	config::Config::builder()
		.add_source(config::File::from_str(
			include_str!("config/defaults.toml"),
			config::FileFormat::Toml,
		))
		.build()
		.unwrap()
		.try_deserialize()
		.unwrap()
}

/// The HTTP application on top of in-memory storage. Every export writes to `sink`.
pub fn app(archive: Arc<MemoryStore>, codec: Arc<dyn Codec>, sink: Arc<MemoryStore>) -> Router {
	let archive: Arc<dyn ObjectStore> = archive;
	let index: Arc<dyn MetadataIndex> = Arc::new(ObjectStoreIndex::new(Arc::clone(&archive)));
	let state = AppState::new(
		test_config(),
		archive,
		index,
		codec,
		Arc::new(MemorySinkProvider::new(sink)),
	);
	crate::api::routes("/").with_state(state)
}
