use crate::backend::{ObjectStore, StorageError};
use crate::identifier::{IdentifierError, InstanceIdentifier};
use crate::transcoding::{read_dicom, CodecError};
use crate::types::{UI, US};
use bytes::Bytes;
use dicom::core::value::{DataSetSequence, Value};
use dicom::core::{DataElement, Length, Tag, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::mem::InMemElement;
use dicom::object::{DefaultDicomObject, InMemDicomObject};
use thiserror::Error;

/// Processing failure.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part18/sect_I.2.html>
pub const PROCESSING_FAILURE: US = 0x0110;

/// The instance does not belong to the study of the request path.
pub const STUDY_MISMATCH: US = 0xA900;

/// <https://dicom.nema.org/medical/dicom/current/output/html/part03.html#table_10-11>
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceReference {
	pub sop_class_uid: UI,
	pub sop_instance_uid: UI,
	/// Only set for failed instances.
	pub failure_reason: Option<US>,
}

#[derive(Debug, Default)]
pub struct StoreResponse {
	pub failed_sequence: Vec<InstanceReference>,
	pub referenced_sequence: Vec<InstanceReference>,
	/// Parts that could not be read as DICOM files.
	pub unreadable: usize,
}

impl StoreResponse {
	pub fn is_empty(&self) -> bool {
		self.failed_sequence.is_empty() && self.referenced_sequence.is_empty() && self.unreadable == 0
	}

	pub fn has_failures(&self) -> bool {
		!self.failed_sequence.is_empty() || self.unreadable > 0
	}
}

fn reference_item(reference: &InstanceReference) -> InMemDicomObject {
	let mut item = InMemDicomObject::from_element_iter([
		DataElement::new(
			tags::REFERENCED_SOP_INSTANCE_UID,
			VR::UI,
			dicom_value!(Str, reference.sop_instance_uid.clone()),
		),
		DataElement::new(
			tags::REFERENCED_SOP_CLASS_UID,
			VR::UI,
			dicom_value!(Str, reference.sop_class_uid.clone()),
		),
	]);
	if let Some(reason) = reference.failure_reason {
		item.put(DataElement::new(
			tags::FAILURE_REASON,
			VR::US,
			dicom_value!(U16, [reason]),
		));
	}
	item
}

fn sequence(tag: Tag, references: &[InstanceReference]) -> InMemElement {
	let items: Vec<InMemDicomObject> = references.iter().map(reference_item).collect();
	InMemElement::new(tag, VR::SQ, Value::Sequence(DataSetSequence::new(items, Length::UNDEFINED)))
}

impl From<StoreResponse> for InMemDicomObject {
	fn from(response: StoreResponse) -> Self {
		let mut object = Self::new_empty();
		object.put(sequence(
			tags::REFERENCED_SOP_SEQUENCE,
			&response.referenced_sequence,
		));
		object.put(sequence(tags::FAILED_SOP_SEQUENCE, &response.failed_sequence));
		object
	}
}

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("The file exceeds the configured upload size limit")]
	UploadLimitExceeded,
	#[error(transparent)]
	Stream(#[from] multer::Error),
}

#[derive(Debug, Error)]
pub enum InstanceError {
	#[error("Not a readable DICOM file: {0}")]
	Unreadable(#[from] CodecError),
	#[error("Missing attribute {0}")]
	MissingAttribute(&'static str),
	#[error(transparent)]
	Identifier(#[from] IdentifierError),
	#[error("Instance belongs to study {actual}, expected {expected}")]
	StudyMismatch { expected: UI, actual: UI },
	#[error(transparent)]
	Storage(#[from] StorageError),
}

impl InstanceError {
	pub const fn failure_reason(&self) -> US {
		match self {
			Self::StudyMismatch { .. } => STUDY_MISMATCH,
			_ => PROCESSING_FAILURE,
		}
	}
}

/// An uploaded DICOM file together with the attributes that determine its archive key.
#[derive(Debug)]
pub struct UploadedInstance {
	pub reference: InstanceReference,
	pub identifier: InstanceIdentifier,
	data: Bytes,
}

impl UploadedInstance {
	pub fn read(data: Bytes) -> Result<Self, InstanceError> {
		let object = read_dicom(&data)?;

		let identifier = InstanceIdentifier::instance(
			&attribute(&object, tags::STUDY_INSTANCE_UID, "StudyInstanceUID")?,
			&attribute(&object, tags::SERIES_INSTANCE_UID, "SeriesInstanceUID")?,
			&attribute(&object, tags::SOP_INSTANCE_UID, "SOPInstanceUID")?,
		)?;
		let sop_class_uid = attribute(&object, tags::SOP_CLASS_UID, "SOPClassUID")
			.unwrap_or_else(|_| {
				object
					.meta()
					.media_storage_sop_class_uid()
					.trim_end_matches('\0')
					.to_owned()
			});

		Ok(Self {
			reference: InstanceReference {
				sop_class_uid,
				sop_instance_uid: identifier.sop_instance_uid().unwrap_or_default().to_owned(),
				failure_reason: None,
			},
			identifier,
			data,
		})
	}

	/// Writes the unmodified file to `{study}/{series}/{sop}.dcm`, replacing an earlier upload.
	pub async fn store(
		self,
		archive: &dyn ObjectStore,
		expected_study: Option<&str>,
	) -> Result<InstanceReference, (InstanceReference, InstanceError)> {
		let Self {
			reference,
			identifier,
			data,
		} = self;

		if let Some(expected) = expected_study {
			if expected != identifier.study_instance_uid() {
				let err = InstanceError::StudyMismatch {
					expected: expected.to_owned(),
					actual: identifier.study_instance_uid().to_owned(),
				};
				return Err((reference, err));
			}
		}

		let Some(key) = identifier.object_key() else {
			return Err((reference, InstanceError::MissingAttribute("SOPInstanceUID")));
		};
		match archive.put_object(&key, data).await {
			Ok(()) => Ok(reference),
			Err(err) => Err((reference, err.into())),
		}
	}
}

fn attribute(
	object: &DefaultDicomObject,
	tag: Tag,
	name: &'static str,
) -> Result<String, InstanceError> {
	object
		.get(tag)
		.and_then(|element| element.to_str().ok())
		.map(|value| value.trim_end_matches(['\0', ' ']).to_owned())
		.filter(|value| !value.is_empty())
		.ok_or(InstanceError::MissingAttribute(name))
}
