use std::fmt::{Display, Formatter};

/// UI (Unique Identifier) value representation.
pub type UI = String;

/// US (Unsigned Short) value representation.
pub type US = u16;

/// The granularity of a DICOM resource, from coarse to fine.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceLevel {
	Study,
	Series,
	Instance,
}

impl Display for ResourceLevel {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Study => write!(f, "STUDY"),
			Self::Series => write!(f, "SERIES"),
			Self::Instance => write!(f, "IMAGE"),
		}
	}
}

/// The resource addressed by a retrieve transaction.
///
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part18/sect_10.4.html#table_10.4.1-1>
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ResourceType {
	Study,
	Series,
	Instance,
	Frames,
}

impl ResourceType {
	/// The identifier level a request for this resource type must carry.
	pub const fn required_level(self) -> ResourceLevel {
		match self {
			Self::Study => ResourceLevel::Study,
			Self::Series => ResourceLevel::Series,
			Self::Instance | Self::Frames => ResourceLevel::Instance,
		}
	}
}

impl Display for ResourceType {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Study => write!(f, "study"),
			Self::Series => write!(f, "series"),
			Self::Instance => write!(f, "instance"),
			Self::Frames => write!(f, "frames"),
		}
	}
}
