use super::{capability, extract_frame, FrameGeometry, EXPLICIT_VR_BIG_ENDIAN, EXPLICIT_VR_LITTLE_ENDIAN};
use bytes::{Bytes, BytesMut};
use dicom::core::{DataElement, DicomValue, PrimitiveValue, VR};
use dicom::dictionary_std::tags;
use dicom::encoding::TransferSyntaxIndex;
use dicom::object::{DefaultDicomObject, FileDicomObject, FileMetaTableBuilder};
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom_pixeldata::{PixelDecoder, Transcode};
use thiserror::Error;

/// Position of the `DICM` magic code after the file preamble.
const PREAMBLE_LENGTH: usize = 128;

#[derive(Debug, Error)]
pub enum CodecError {
	#[error("Failed to read DICOM file: {0}")]
	Read(#[from] dicom::object::ReadError),
	#[error("Failed to write DICOM file: {0}")]
	Write(#[from] dicom::object::WriteError),
	#[error("Transfer syntax {uid} is not supported")]
	UnsupportedTransferSyntax { uid: String },
	#[error("Required attribute {name} is missing")]
	MissingAttribute { name: &'static str },
	#[error("Frame {frame} does not exist, the object has {number_of_frames} frame(s)")]
	FrameOutOfRange { frame: u32, number_of_frames: u32 },
	#[error("Cannot locate frame {frame} in {fragments} pixel data fragment(s)")]
	UnlocatableFrame { frame: u32, fragments: usize },
	#[error("Failed to decode pixel data: {reason}")]
	Decode { reason: String },
	#[error("Failed to transcode to {target}: {reason}")]
	Transcode { target: String, reason: String },
}

/// Pixel data conversions. All methods are CPU-bound and must not be called on an async
/// worker thread.
pub trait Codec: Send + Sync {
	/// Converts the whole object into the target transfer syntax.
	fn transcode(
		&self,
		object: DefaultDicomObject,
		target: &str,
	) -> Result<DefaultDicomObject, CodecError>;

	/// Decodes a single frame (0-based) and encodes it in the target transfer syntax.
	fn decode_frame(
		&self,
		object: &DefaultDicomObject,
		frame: u32,
		target: &str,
	) -> Result<Bytes, CodecError>;

	/// Copies the stored bytes of a single frame (0-based).
	fn extract_frame(&self, object: &DefaultDicomObject, frame: u32) -> Result<Bytes, CodecError> {
		extract_frame(object, frame)
	}
}

/// The [`Codec`] backed by the codecs of `dicom-pixeldata`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DicomCodec;

impl Codec for DicomCodec {
	fn transcode(
		&self,
		mut object: DefaultDicomObject,
		target: &str,
	) -> Result<DefaultDicomObject, CodecError> {
		let ts = TransferSyntaxRegistry
			.get(target)
			.ok_or_else(|| CodecError::UnsupportedTransferSyntax {
				uid: target.to_owned(),
			})?;

		object.transcode(ts).map_err(|err| CodecError::Transcode {
			target: target.to_owned(),
			reason: err.to_string(),
		})?;
		Ok(object)
	}

	fn decode_frame(
		&self,
		object: &DefaultDicomObject,
		frame: u32,
		target: &str,
	) -> Result<Bytes, CodecError> {
		let geometry = FrameGeometry::from_object(object)?;
		if !geometry.contains(frame) {
			return Err(CodecError::FrameOutOfRange {
				frame,
				number_of_frames: geometry.number_of_frames,
			});
		}

		let decoded = object
			.decode_pixel_data_frame(frame)
			.map_err(|err| CodecError::Decode {
				reason: err.to_string(),
			})?;
		let data = decoded.data();

		let target_capability =
			capability(target).ok_or_else(|| CodecError::UnsupportedTransferSyntax {
				uid: target.to_owned(),
			})?;

		if !target_capability.encapsulated {
			if target_capability.uid == EXPLICIT_VR_BIG_ENDIAN && decoded.bits_allocated() > 8 {
				return Ok(swap_words(data));
			}
			return Ok(Bytes::copy_from_slice(data));
		}

		// Encode the decoded frame as a single-frame object and take its fragments.
		let mut single = object.clone().into_inner();
		single.put(DataElement::new(
			tags::NUMBER_OF_FRAMES,
			VR::IS,
			PrimitiveValue::from("1"),
		));
		single.put(DataElement::new(
			tags::PHOTOMETRIC_INTERPRETATION,
			VR::CS,
			PrimitiveValue::from(decoded.photometric_interpretation().as_str()),
		));
		if decoded.samples_per_pixel() > 1 {
			single.put(DataElement::new(
				tags::PLANAR_CONFIGURATION,
				VR::US,
				PrimitiveValue::from(0_u16),
			));
		}
		single.put(DataElement::new(
			tags::BITS_ALLOCATED,
			VR::US,
			PrimitiveValue::from(decoded.bits_allocated()),
		));
		single.put(DataElement::new(
			tags::PIXEL_DATA,
			if decoded.bits_allocated() > 8 {
				VR::OW
			} else {
				VR::OB
			},
			PrimitiveValue::from(data.to_vec()),
		));

		let single = single
			.with_meta(FileMetaTableBuilder::new().transfer_syntax(EXPLICIT_VR_LITTLE_ENDIAN))
			.map_err(|err| CodecError::Transcode {
				target: target.to_owned(),
				reason: err.to_string(),
			})?;
		let encoded = self.transcode(single, target)?;

		let fragments = encoded
			.get(tags::PIXEL_DATA)
			.map(|element| match element.value() {
				DicomValue::PixelSequence(sequence) => {
					let mut buffer = BytesMut::new();
					for fragment in sequence.fragments() {
						buffer.extend_from_slice(fragment);
					}
					Some(buffer.freeze())
				}
				_ => None,
			});

		match fragments {
			Some(Some(frame)) => Ok(frame),
			_ => Err(CodecError::Transcode {
				target: target.to_owned(),
				reason: String::from("encoder did not produce encapsulated pixel data"),
			}),
		}
	}
}

fn swap_words(data: &[u8]) -> Bytes {
	let mut swapped = BytesMut::with_capacity(data.len());
	for chunk in data.chunks(2) {
		match chunk {
			[low, high] => swapped.extend_from_slice(&[*high, *low]),
			rest => swapped.extend_from_slice(rest),
		}
	}
	swapped.freeze()
}

/// Parses a DICOM file with or without the 128 byte preamble.
pub fn read_dicom(data: &[u8]) -> Result<DefaultDicomObject, CodecError> {
	let has_preamble = data
		.get(PREAMBLE_LENGTH..PREAMBLE_LENGTH + 4)
		.is_some_and(|magic| magic == b"DICM");
	let data = if has_preamble {
		&data[PREAMBLE_LENGTH..]
	} else {
		data
	};

	Ok(FileDicomObject::from_reader(data)?)
}

/// Serializes the object including preamble and file meta group.
pub fn write_dicom(object: &DefaultDicomObject) -> Result<Bytes, CodecError> {
	let mut buffer = Vec::new();
	object.write_all(&mut buffer)?;
	Ok(Bytes::from(buffer))
}
