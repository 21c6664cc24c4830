//! Decides whether archived objects can be delivered in a requested transfer syntax and
//! converts them if necessary.
//!
//! The decision is driven by [`CAPABILITIES`], a static table of the transfer syntaxes the
//! archive knows how to work with. Adding support for another encoding means adding a row.

mod codec;
mod frame;

pub use codec::{read_dicom, write_dicom, Codec, CodecError, DicomCodec};
pub use frame::{extract_frame, FrameGeometry};

use crate::types::UI;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

pub const IMPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2";
pub const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";
pub const DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1.99";
pub const EXPLICIT_VR_BIG_ENDIAN: &str = "1.2.840.10008.1.2.2";
pub const RLE_LOSSLESS: &str = "1.2.840.10008.1.2.5";
pub const JPEG_BASELINE: &str = "1.2.840.10008.1.2.4.50";
pub const JPEG_EXTENDED: &str = "1.2.840.10008.1.2.4.51";
pub const JPEG_2000_LOSSLESS: &str = "1.2.840.10008.1.2.4.90";
pub const JPEG_2000: &str = "1.2.840.10008.1.2.4.91";

/// Photometric interpretations that lossy JPEG encoders in the table cannot handle.
const MONOCHROME: [&str; 2] = ["MONOCHROME1", "MONOCHROME2"];

/// The two classes of pixel data the capability table distinguishes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BitDepthClass {
	/// Up to 8 bits allocated per sample.
	Low,
	/// More than 8 bits allocated per sample.
	High,
}

impl BitDepthClass {
	/// A missing BitsAllocated attribute is treated as 0 (low bit depth).
	pub const fn from_bits_allocated(bits_allocated: u16) -> Self {
		if bits_allocated <= 8 {
			Self::Low
		} else {
			Self::High
		}
	}
}

#[derive(Debug, PartialEq, Eq)]
pub struct TransferSyntaxCapability {
	pub uid: &'static str,
	pub name: &'static str,
	pub bit_depths: &'static [BitDepthClass],
	/// Pixel data is stored as a sequence of compressed fragments.
	pub encapsulated: bool,
	pub lossy: bool,
	/// Encoding monochrome images into this transfer syntax is not supported.
	pub rejects_monochrome: bool,
}

impl TransferSyntaxCapability {
	pub fn supports(&self, class: BitDepthClass) -> bool {
		self.bit_depths.contains(&class)
	}
}

const ALL_DEPTHS: &[BitDepthClass] = &[BitDepthClass::Low, BitDepthClass::High];
const LOW_DEPTH: &[BitDepthClass] = &[BitDepthClass::Low];

#[rustfmt::skip]
pub static CAPABILITIES: &[TransferSyntaxCapability] = &[
	TransferSyntaxCapability { uid: IMPLICIT_VR_LITTLE_ENDIAN, name: "Implicit VR Little Endian", bit_depths: ALL_DEPTHS, encapsulated: false, lossy: false, rejects_monochrome: false },
	TransferSyntaxCapability { uid: EXPLICIT_VR_LITTLE_ENDIAN, name: "Explicit VR Little Endian", bit_depths: ALL_DEPTHS, encapsulated: false, lossy: false, rejects_monochrome: false },
	TransferSyntaxCapability { uid: DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN, name: "Deflated Explicit VR Little Endian", bit_depths: ALL_DEPTHS, encapsulated: false, lossy: false, rejects_monochrome: false },
	TransferSyntaxCapability { uid: EXPLICIT_VR_BIG_ENDIAN, name: "Explicit VR Big Endian", bit_depths: ALL_DEPTHS, encapsulated: false, lossy: false, rejects_monochrome: false },
	TransferSyntaxCapability { uid: RLE_LOSSLESS, name: "RLE Lossless", bit_depths: ALL_DEPTHS, encapsulated: true, lossy: false, rejects_monochrome: false },
	TransferSyntaxCapability { uid: JPEG_BASELINE, name: "JPEG Baseline (Process 1)", bit_depths: LOW_DEPTH, encapsulated: true, lossy: true, rejects_monochrome: true },
	TransferSyntaxCapability { uid: JPEG_EXTENDED, name: "JPEG Extended (Process 2 & 4)", bit_depths: LOW_DEPTH, encapsulated: true, lossy: true, rejects_monochrome: true },
	TransferSyntaxCapability { uid: JPEG_2000_LOSSLESS, name: "JPEG 2000 Image Compression (Lossless Only)", bit_depths: LOW_DEPTH, encapsulated: true, lossy: false, rejects_monochrome: false },
	TransferSyntaxCapability { uid: JPEG_2000, name: "JPEG 2000 Image Compression", bit_depths: LOW_DEPTH, encapsulated: true, lossy: true, rejects_monochrome: false },
];

/// Looks up a transfer syntax in [`CAPABILITIES`]. Trailing padding is ignored.
pub fn capability(uid: &str) -> Option<&'static TransferSyntaxCapability> {
	let uid = normalize_ts(uid);
	CAPABILITIES.iter().find(|capability| capability.uid == uid)
}

/// All transfer syntaxes the given bit-depth class can be converted between.
pub fn supported_in(class: BitDepthClass) -> impl Iterator<Item = &'static str> {
	CAPABILITIES
		.iter()
		.filter(move |capability| capability.supports(class))
		.map(|capability| capability.uid)
}

fn normalize_ts(uid: &str) -> &str {
	uid.trim().trim_end_matches('\0')
}

/// The transfer syntax a client asked for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RequestedTransferSyntax {
	/// `*`: deliver the stored representation without conversion.
	Original,
	Uid(UI),
}

impl RequestedTransferSyntax {
	pub const WILDCARD: &'static str = "*";

	pub fn parse(value: &str) -> Self {
		match normalize_ts(value) {
			Self::WILDCARD => Self::Original,
			uid => Self::Uid(uid.to_owned()),
		}
	}

	pub fn uid(&self) -> Option<&str> {
		match self {
			Self::Original => None,
			Self::Uid(uid) => Some(uid),
		}
	}

	/// Whether an object stored with `source` has to be converted to satisfy this request.
	pub fn requires_transcoding(&self, source: &str) -> bool {
		self.uid()
			.is_some_and(|target| normalize_ts(target) != normalize_ts(source))
	}
}

impl Default for RequestedTransferSyntax {
	fn default() -> Self {
		Self::Uid(String::from(EXPLICIT_VR_LITTLE_ENDIAN))
	}
}

impl Display for RequestedTransferSyntax {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Original => f.write_str(Self::WILDCARD),
			Self::Uid(uid) => f.write_str(uid),
		}
	}
}

impl From<String> for RequestedTransferSyntax {
	fn from(value: String) -> Self {
		Self::parse(&value)
	}
}

impl From<RequestedTransferSyntax> for String {
	fn from(value: RequestedTransferSyntax) -> Self {
		value.to_string()
	}
}

/// Decides whether an object stored with `source` can be delivered as `target`.
///
/// Evaluation order:
/// 1. `*` always passes through.
/// 2. Monochrome images never go into a transfer syntax that rejects them, even if the
///    object is already stored that way.
/// 3. Otherwise both transfer syntaxes must be known and support the bit-depth class.
///    This applies to identical source and target as well.
pub fn can_transcode(
	source: &str,
	bits_allocated: u16,
	photometric_interpretation: Option<&str>,
	target: &RequestedTransferSyntax,
) -> bool {
	let Some(target) = target.uid().map(normalize_ts) else {
		return true;
	};
	let Some(target_capability) = capability(target) else {
		return false;
	};

	let is_monochrome = photometric_interpretation
		.map(|value| value.trim().trim_end_matches('\0'))
		.is_some_and(|value| MONOCHROME.contains(&value));
	if is_monochrome && target_capability.rejects_monochrome {
		return false;
	}

	let Some(source_capability) = capability(source) else {
		return false;
	};

	let class = BitDepthClass::from_bits_allocated(bits_allocated);
	source_capability.supports(class) && target_capability.supports(class)
}

/// Whether the frames of an object stored as `source` have to go through the codec to be
/// delivered as `target`. Native little endian frames are byte-identical across the
/// uncompressed transfer syntaxes and can be copied.
pub fn frame_requires_codec(source: &str, target: &RequestedTransferSyntax) -> bool {
	let Some(target) = target.uid().map(normalize_ts) else {
		return false;
	};
	let source = normalize_ts(source);
	if source == target {
		return false;
	}

	let copyable = |uid: &str| {
		uid != EXPLICIT_VR_BIG_ENDIAN
			&& capability(uid).is_some_and(|capability| !capability.encapsulated)
	};
	!(copyable(source) && copyable(target))
}
