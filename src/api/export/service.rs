use crate::export::destination::DestinationError;
use crate::export::{ExportDestination, ExportSource};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRequest {
	pub source: ExportSource,
	pub destination: ExportDestination,
}

#[derive(Debug, Error)]
pub enum ExportRequestError {
	#[error("The export source does not contain any identifier")]
	EmptySource,
	#[error(transparent)]
	Destination(#[from] DestinationError),
}

impl ExportRequest {
	/// Rejects requests that could never succeed before an operation is started for them.
	pub fn validate(&self) -> Result<(), ExportRequestError> {
		if self.source.identifiers().is_empty() {
			return Err(ExportRequestError::EmptySource);
		}
		let ExportDestination::Blob(blob) = &self.destination;
		blob.connection()?;
		Ok(())
	}
}

/// Reference to a started operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationReference {
	pub id: Uuid,
	pub href: String,
}

impl OperationReference {
	pub fn new(base_path: &str, id: Uuid) -> Self {
		Self {
			id,
			href: format!("{}/operations/{id}", base_path.trim_end_matches('/')),
		}
	}
}
