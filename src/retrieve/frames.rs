use super::{RetrieveError, RetrieveItem, RetrievePipeline, RetrieveRequest, RetrieveResponse, RetrieveStatus};
use crate::lazy::{LazyTransformStream, TransformError};
use crate::transcoding::{
	can_transcode, frame_requires_codec, read_dicom, CodecError, FrameGeometry,
};
use dicom::dictionary_std::tags;
use dicom::object::DefaultDicomObject;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

impl RetrievePipeline {
	/// Frame retrieves are all or nothing: a missing pixel data attribute or a frame outside
	/// of the image fails the whole request.
	pub(super) async fn retrieve_frames(
		&self,
		request: RetrieveRequest,
		cancel: &CancellationToken,
	) -> Result<RetrieveResponse, RetrieveError> {
		if request.frames.is_empty() {
			return Err(RetrieveError::InvalidRequest {
				reason: String::from("at least one frame number is required"),
			});
		}

		let key = request
			.identifier
			.object_key()
			.ok_or_else(|| RetrieveError::InvalidRequest {
				reason: format!("{} is not an instance", request.identifier),
			})?;

		let data = tokio::select! {
			() = cancel.cancelled() => return Err(RetrieveError::Cancelled),
			data = self.store.get_object(&key) => data?,
		};

		let object = tokio::task::spawn_blocking(move || read_dicom(&data))
			.await
			.map_err(|err| RetrieveError::InvalidRequest {
				reason: err.to_string(),
			})?
			.map_err(|err| RetrieveError::InvalidRequest {
				reason: format!("{key} is not a readable DICOM file: {err}"),
			})?;

		let geometry = FrameGeometry::from_object(&object).map_err(|err| match err {
			CodecError::MissingAttribute { name } => RetrieveError::NotFound {
				resource: format!("{name} of {}", request.identifier),
			},
			err => RetrieveError::InvalidRequest {
				reason: err.to_string(),
			},
		})?;

		// frame numbers are 1-based on the outside
		let mut indices = Vec::with_capacity(request.frames.len());
		for &number in &request.frames {
			match number.checked_sub(1) {
				Some(index) if geometry.contains(index) => indices.push((number, index)),
				_ => {
					return Err(RetrieveError::NotFound {
						resource: format!(
							"Frame {number} of {} ({} frame(s))",
							request.identifier, geometry.number_of_frames
						),
					})
				}
			}
		}

		let source = object
			.meta()
			.transfer_syntax()
			.trim_end_matches('\0')
			.to_owned();
		let photometric = object
			.get(tags::PHOTOMETRIC_INTERPRETATION)
			.and_then(|element| element.to_str().ok())
			.map(|value| value.trim().to_owned());

		let target = &request.transfer_syntax;
		if !can_transcode(
			&source,
			geometry.bits_allocated,
			photometric.as_deref(),
			target,
		) {
			return Err(RetrieveError::NotAcceptable {
				transfer_syntax: target.to_string(),
			});
		}

		let decode = frame_requires_codec(&source, target);
		let output_syntax = target.uid().map_or_else(|| source.clone(), ToOwned::to_owned);
		debug!(frames = indices.len(), source, decode, "Preparing frames");

		let object = Arc::new(object);
		let items = indices
			.into_iter()
			.map(|(number, index)| RetrieveItem {
				identifier: request.identifier.clone(),
				frame: Some(number),
				transfer_syntax: output_syntax.clone(),
				content: self.frame_lazily(Arc::clone(&object), index, decode, &output_syntax),
			})
			.collect();

		Ok(RetrieveResponse {
			status: RetrieveStatus::Ok,
			items,
		})
	}

	fn frame_lazily(
		&self,
		object: Arc<DefaultDicomObject>,
		frame: u32,
		decode: bool,
		target: &str,
	) -> LazyTransformStream {
		let codec = Arc::clone(&self.codec);
		let target = target.to_owned();
		LazyTransformStream::new(move || {
			let frame = if decode {
				codec.decode_frame(&object, frame, &target)
			} else {
				codec.extract_frame(&object, frame)
			};
			frame.map_err(TransformError::new)
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::backend::ObjectStoreIndex;
	use crate::identifier::InstanceIdentifier;
	use crate::testing::{archive, CountingCodec, ImageFixture, MemoryStore};
	use crate::transcoding::{
		Codec, RequestedTransferSyntax, EXPLICIT_VR_LITTLE_ENDIAN, JPEG_2000, JPEG_BASELINE,
	};
	use crate::types::ResourceType;
	use bytes::Bytes;

	fn pipeline(store: Arc<MemoryStore>, codec: Arc<dyn Codec>) -> RetrievePipeline {
		let index = Arc::new(ObjectStoreIndex::new(store.clone()));
		RetrievePipeline::new(store, index, codec, 4)
	}

	fn frames_request(
		fixture: &ImageFixture,
		frames: &[u32],
		transfer_syntax: RequestedTransferSyntax,
	) -> RetrieveRequest {
		RetrieveRequest {
			resource: ResourceType::Frames,
			identifier: fixture.identifier(),
			transfer_syntax,
			frames: frames.to_vec(),
		}
	}

	#[tokio::test]
	async fn native_frames_are_extracted() {
		let fixture = ImageFixture::new("1.1", "2.1", "3.1").frames(3);
		let codec = Arc::new(CountingCodec::default());
		let pipeline = pipeline(archive(&[fixture.clone()]), codec.clone());

		let response = pipeline
			.retrieve(
				frames_request(&fixture, &[3, 1], RequestedTransferSyntax::default()),
				&CancellationToken::new(),
			)
			.await
			.unwrap();

		assert_eq!(response.items.len(), 2);
		assert_eq!(response.items[0].frame, Some(3));
		assert_eq!(response.items[0].content.content().await, fixture.frame_bytes(2));
		assert_eq!(response.items[1].content.content().await, fixture.frame_bytes(0));
		assert_eq!(codec.frame_decodes(), 0);
	}

	#[tokio::test]
	async fn compressed_frames_are_decoded_for_another_target() {
		let fixture = ImageFixture::new("1.1", "2.1", "3.1")
			.transfer_syntax(JPEG_BASELINE)
			.photometric("RGB")
			.frames(2);
		let codec = Arc::new(CountingCodec::default());
		let pipeline = pipeline(archive(&[fixture.clone()]), codec.clone());

		let response = pipeline
			.retrieve(
				frames_request(&fixture, &[2], RequestedTransferSyntax::default()),
				&CancellationToken::new(),
			)
			.await
			.unwrap();

		assert_eq!(response.items[0].transfer_syntax, EXPLICIT_VR_LITTLE_ENDIAN);
		assert_eq!(
			response.items[0].content.content().await,
			Bytes::from(format!("decoded-1-{EXPLICIT_VR_LITTLE_ENDIAN}"))
		);
		assert_eq!(codec.frame_decodes(), 1);
	}

	#[tokio::test]
	async fn compressed_frames_pass_through_for_wildcard() {
		let fixture = ImageFixture::new("1.1", "2.1", "3.1")
			.transfer_syntax(JPEG_BASELINE)
			.frames(2);
		let codec = Arc::new(CountingCodec::default());
		let pipeline = pipeline(archive(&[fixture.clone()]), codec.clone());

		let response = pipeline
			.retrieve(
				frames_request(&fixture, &[1, 2], RequestedTransferSyntax::Original),
				&CancellationToken::new(),
			)
			.await
			.unwrap();

		assert_eq!(response.items[1].transfer_syntax, JPEG_BASELINE);
		assert_eq!(response.items[1].content.content().await, fixture.frame_bytes(1));
		assert_eq!(codec.frame_decodes(), 0);
	}

	#[tokio::test]
	async fn frame_beyond_number_of_frames_is_not_found() {
		let fixture = ImageFixture::new("1.1", "2.1", "3.1").frames(2);
		let pipeline = pipeline(archive(&[fixture.clone()]), Arc::new(CountingCodec::default()));

		for frames in [&[1, 3][..], &[0][..]] {
			let result = pipeline
				.retrieve(
					frames_request(&fixture, frames, RequestedTransferSyntax::default()),
					&CancellationToken::new(),
				)
				.await;
			assert!(matches!(result, Err(RetrieveError::NotFound { .. })), "{frames:?}");
		}
	}

	#[tokio::test]
	async fn missing_pixel_data_is_not_found() {
		let fixture = ImageFixture::new("1.1", "2.1", "3.1").without_pixel_data();
		let pipeline = pipeline(archive(&[fixture.clone()]), Arc::new(CountingCodec::default()));

		let result = pipeline
			.retrieve(
				frames_request(&fixture, &[1], RequestedTransferSyntax::default()),
				&CancellationToken::new(),
			)
			.await;
		assert!(matches!(result, Err(RetrieveError::NotFound { .. })));
	}

	#[tokio::test]
	async fn incompatible_frames_are_not_acceptable() {
		let fixture = ImageFixture::new("1.1", "2.1", "3.1").bits_allocated(16);
		let pipeline = pipeline(archive(&[fixture.clone()]), Arc::new(CountingCodec::default()));

		let result = pipeline
			.retrieve(
				frames_request(
					&fixture,
					&[1],
					RequestedTransferSyntax::Uid(JPEG_2000.to_owned()),
				),
				&CancellationToken::new(),
			)
			.await;
		assert!(matches!(result, Err(RetrieveError::NotAcceptable { .. })));
	}

	#[tokio::test]
	async fn frames_require_an_instance() {
		let pipeline = pipeline(Arc::new(MemoryStore::new()), Arc::new(CountingCodec::default()));
		let result = pipeline
			.retrieve(
				RetrieveRequest {
					resource: ResourceType::Frames,
					identifier: InstanceIdentifier::instance("1.1", "2.1", "3.1").unwrap(),
					transfer_syntax: RequestedTransferSyntax::Original,
					frames: Vec::new(),
				},
				&CancellationToken::new(),
			)
			.await;
		assert!(matches!(result, Err(RetrieveError::InvalidRequest { .. })));
	}
}
