use super::CodecError;
use bytes::{Bytes, BytesMut};
use dicom::core::DicomValue;
use dicom::dictionary_std::tags;
use dicom::object::DefaultDicomObject;

/// Each item of an encapsulated pixel data sequence is prefixed by its tag and length.
const ITEM_HEADER_LENGTH: u64 = 8;

/// The attributes that describe the layout of the pixel data.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameGeometry {
	pub rows: u32,
	pub columns: u32,
	pub samples_per_pixel: u32,
	pub bits_allocated: u16,
	pub number_of_frames: u32,
}

impl FrameGeometry {
	/// Fails if the object has no pixel data or if Rows, Columns or BitsAllocated are missing.
	/// NumberOfFrames and SamplesPerPixel default to 1.
	pub fn from_object(object: &DefaultDicomObject) -> Result<Self, CodecError> {
		if object.get(tags::PIXEL_DATA).is_none() {
			return Err(CodecError::MissingAttribute { name: "PixelData" });
		}

		let int = |tag, name: &'static str| {
			object
				.get(tag)
				.and_then(|element| element.to_int::<u32>().ok())
				.ok_or(CodecError::MissingAttribute { name })
		};

		let bits_allocated = object
			.get(tags::BITS_ALLOCATED)
			.and_then(|element| element.to_int::<u16>().ok())
			.ok_or(CodecError::MissingAttribute {
				name: "BitsAllocated",
			})?;

		Ok(Self {
			rows: int(tags::ROWS, "Rows")?,
			columns: int(tags::COLUMNS, "Columns")?,
			samples_per_pixel: int(tags::SAMPLES_PER_PIXEL, "SamplesPerPixel").unwrap_or(1),
			bits_allocated,
			number_of_frames: int(tags::NUMBER_OF_FRAMES, "NumberOfFrames")
				.unwrap_or(1)
				.max(1),
		})
	}

	/// Size of a single uncompressed frame in bytes.
	pub fn frame_length(&self) -> u64 {
		let bits = u64::from(self.rows)
			* u64::from(self.columns)
			* u64::from(self.samples_per_pixel)
			* u64::from(self.bits_allocated);
		bits.div_ceil(8)
	}

	pub const fn contains(&self, frame: u32) -> bool {
		frame < self.number_of_frames
	}
}

/// Copies the stored bytes of a single frame (0-based) without decoding them.
///
/// Native pixel data is sliced by the frame length. For encapsulated pixel data the
/// fragments of the frame are located with the basic offset table. Without an offset table
/// the object must either contain a single frame or exactly one fragment per frame.
pub fn extract_frame(object: &DefaultDicomObject, frame: u32) -> Result<Bytes, CodecError> {
	let geometry = FrameGeometry::from_object(object)?;
	if !geometry.contains(frame) {
		return Err(CodecError::FrameOutOfRange {
			frame,
			number_of_frames: geometry.number_of_frames,
		});
	}

	let element = object
		.get(tags::PIXEL_DATA)
		.ok_or(CodecError::MissingAttribute { name: "PixelData" })?;

	match element.value() {
		DicomValue::PixelSequence(sequence) => encapsulated_frame(
			sequence.offset_table(),
			sequence.fragments(),
			frame,
			geometry.number_of_frames,
		),
		DicomValue::Primitive(_) => {
			let data = element.to_bytes().map_err(|err| CodecError::Decode {
				reason: err.to_string(),
			})?;
			native_frame(&data, frame, geometry.frame_length())
		}
		DicomValue::Sequence(_) => Err(CodecError::MissingAttribute { name: "PixelData" }),
	}
}

fn native_frame(data: &[u8], frame: u32, frame_length: u64) -> Result<Bytes, CodecError> {
	let start = u64::from(frame) * frame_length;
	let end = start + frame_length;
	let range = usize::try_from(start)
		.ok()
		.zip(usize::try_from(end).ok())
		.filter(|(_, end)| *end <= data.len());

	match range {
		Some((start, end)) => Ok(Bytes::copy_from_slice(&data[start..end])),
		None => Err(CodecError::Decode {
			reason: format!(
				"pixel data holds {} bytes, frame {frame} ends at byte {end}",
				data.len()
			),
		}),
	}
}

fn encapsulated_frame<F: AsRef<[u8]>>(
	offset_table: &[u32],
	fragments: &[F],
	frame: u32,
	number_of_frames: u32,
) -> Result<Bytes, CodecError> {
	if number_of_frames == 1 {
		return Ok(concat(fragments.iter()));
	}

	let frame_index = frame as usize;
	if offset_table.len() == number_of_frames as usize {
		let start = u64::from(offset_table[frame_index]);
		let end = offset_table
			.get(frame_index + 1)
			.map_or(u64::MAX, |offset| u64::from(*offset));

		// position of each fragment item relative to the first fragment item
		let mut position = 0u64;
		let mut selected = Vec::new();
		for fragment in fragments {
			if (start..end).contains(&position) {
				selected.push(fragment);
			}
			position += ITEM_HEADER_LENGTH + fragment.as_ref().len() as u64;
		}
		return Ok(concat(selected.into_iter()));
	}

	if fragments.len() == number_of_frames as usize {
		return Ok(Bytes::copy_from_slice(fragments[frame_index].as_ref()));
	}

	Err(CodecError::UnlocatableFrame {
		frame,
		fragments: fragments.len(),
	})
}

fn concat<'a, F: AsRef<[u8]> + 'a>(fragments: impl Iterator<Item = &'a F>) -> Bytes {
	let mut buffer = BytesMut::new();
	for fragment in fragments {
		buffer.extend_from_slice(fragment.as_ref());
	}
	buffer.freeze()
}
