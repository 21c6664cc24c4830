use crate::types::{ResourceLevel, UI};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// Maximum length of a UI value.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part05/sect_6.2.html>
const MAX_UID_LENGTH: usize = 64;

/// Addresses a study, a series of a study or a single instance.
///
/// The string form joins the supplied segments with `/`, i.e. `study`, `study/series` or
/// `study/series/sop`. It is used for error logs and, with a `.dcm` suffix, as the archive
/// object key of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InstanceIdentifier {
	study_instance_uid: UI,
	series_instance_uid: Option<UI>,
	sop_instance_uid: Option<UI>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
	#[error("`{0}` is not a valid UID")]
	InvalidUid(String),
	#[error("a SOP Instance UID requires a Series Instance UID")]
	MissingSeries,
	#[error("expected 1 to 3 `/`-separated UIDs, got {0}")]
	SegmentCount(usize),
}

impl InstanceIdentifier {
	pub fn new(
		study_instance_uid: &str,
		series_instance_uid: Option<&str>,
		sop_instance_uid: Option<&str>,
	) -> Result<Self, IdentifierError> {
		if series_instance_uid.is_none() && sop_instance_uid.is_some() {
			return Err(IdentifierError::MissingSeries);
		}

		Ok(Self {
			study_instance_uid: normalize_uid(study_instance_uid)?,
			series_instance_uid: series_instance_uid.map(normalize_uid).transpose()?,
			sop_instance_uid: sop_instance_uid.map(normalize_uid).transpose()?,
		})
	}

	pub fn study(study_instance_uid: &str) -> Result<Self, IdentifierError> {
		Self::new(study_instance_uid, None, None)
	}

	pub fn series(
		study_instance_uid: &str,
		series_instance_uid: &str,
	) -> Result<Self, IdentifierError> {
		Self::new(study_instance_uid, Some(series_instance_uid), None)
	}

	pub fn instance(
		study_instance_uid: &str,
		series_instance_uid: &str,
		sop_instance_uid: &str,
	) -> Result<Self, IdentifierError> {
		Self::new(
			study_instance_uid,
			Some(series_instance_uid),
			Some(sop_instance_uid),
		)
	}

	pub fn study_instance_uid(&self) -> &str {
		&self.study_instance_uid
	}

	pub fn series_instance_uid(&self) -> Option<&str> {
		self.series_instance_uid.as_deref()
	}

	pub fn sop_instance_uid(&self) -> Option<&str> {
		self.sop_instance_uid.as_deref()
	}

	pub fn level(&self) -> ResourceLevel {
		match (&self.series_instance_uid, &self.sop_instance_uid) {
			(Some(_), Some(_)) => ResourceLevel::Instance,
			(Some(_), None) => ResourceLevel::Series,
			_ => ResourceLevel::Study,
		}
	}

	pub fn is_instance(&self) -> bool {
		matches!(self.level(), ResourceLevel::Instance)
	}

	/// The archive key of a fully specified instance (`study/series/sop.dcm`).
	pub fn object_key(&self) -> Option<String> {
		self.is_instance().then(|| format!("{self}.dcm"))
	}

	/// Parses an archive key of the form `study/series/sop.dcm`.
	pub fn from_object_key(key: &str) -> Option<Self> {
		let path = key.strip_suffix(".dcm")?;
		path.parse::<Self>().ok().filter(Self::is_instance)
	}
}

fn normalize_uid(uid: &str) -> Result<UI, IdentifierError> {
	// UI values are padded with a trailing NUL to an even length
	let uid = uid.trim().trim_end_matches('\0');
	let is_valid = !uid.is_empty()
		&& uid.len() <= MAX_UID_LENGTH
		&& uid.chars().all(|c| c.is_ascii_digit() || c == '.');

	if is_valid {
		Ok(UI::from(uid))
	} else {
		Err(IdentifierError::InvalidUid(uid.to_owned()))
	}
}

impl Display for InstanceIdentifier {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.study_instance_uid)?;
		if let Some(series) = &self.series_instance_uid {
			write!(f, "/{series}")?;
		}
		if let Some(instance) = &self.sop_instance_uid {
			write!(f, "/{instance}")?;
		}
		Ok(())
	}
}

impl FromStr for InstanceIdentifier {
	type Err = IdentifierError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let segments: Vec<&str> = s.trim().trim_matches('/').split('/').collect();
		match segments.as_slice() {
			[study] => Self::study(study),
			[study, series] => Self::series(study, series),
			[study, series, instance] => Self::instance(study, series, instance),
			_ => Err(IdentifierError::SegmentCount(segments.len())),
		}
	}
}

impl TryFrom<String> for InstanceIdentifier {
	type Error = IdentifierError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		value.parse()
	}
}

impl From<InstanceIdentifier> for String {
	fn from(identifier: InstanceIdentifier) -> Self {
		identifier.to_string()
	}
}
