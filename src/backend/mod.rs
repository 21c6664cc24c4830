//! Storage collaborators of the archive.
//! - [`ObjectStore`] reads and writes archived DICOM files and export results.
//! - [`MetadataIndex`] expands studies and series into their instances.
//! - [`SinkProvider`] opens the destination of an export operation.

pub mod s3;

use crate::export::ExportDestination;
use crate::identifier::InstanceIdentifier;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

#[async_trait]
pub trait ObjectStore: Send + Sync {
	async fn get_object(&self, key: &str) -> Result<Bytes, StorageError>;

	/// Writes the object, replacing an existing object with the same key.
	async fn put_object(&self, key: &str, body: Bytes) -> Result<(), StorageError>;

	/// Lists the keys of all objects that start with `prefix`.
	async fn list_objects(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

	/// A URI that references the object with the given key.
	fn location(&self, key: &str) -> String;
}

#[derive(Debug, Error)]
pub enum StorageError {
	#[error("Object {key} does not exist")]
	NotFound { key: String },
	#[error(transparent)]
	Backend { source: anyhow::Error },
}

impl StorageError {
	pub const fn is_not_found(&self) -> bool {
		matches!(self, Self::NotFound { .. })
	}
}

/// Read-only lookup of the archived instances.
/// An unknown study or series yields an empty list rather than an error.
#[async_trait]
pub trait MetadataIndex: Send + Sync {
	async fn list_instances_in_study(
		&self,
		study_instance_uid: &str,
	) -> Result<Vec<InstanceIdentifier>, IndexError>;

	async fn list_instances_in_series(
		&self,
		study_instance_uid: &str,
		series_instance_uid: &str,
	) -> Result<Vec<InstanceIdentifier>, IndexError>;

	async fn contains_instance(&self, instance: &InstanceIdentifier) -> Result<bool, IndexError>;
}

#[derive(Debug, Error)]
pub enum IndexError {
	#[error("Failed to query the metadata index: {0}")]
	Storage(#[from] StorageError),
}

/// Opens the object store an export operation writes to.
#[async_trait]
pub trait SinkProvider: Send + Sync {
	async fn open(
		&self,
		destination: &ExportDestination,
	) -> Result<Arc<dyn ObjectStore>, StorageError>;
}

/// A [`MetadataIndex`] derived from the key layout of the archive (`study/series/sop.dcm`).
pub struct ObjectStoreIndex {
	store: Arc<dyn ObjectStore>,
}

impl ObjectStoreIndex {
	pub fn new(store: Arc<dyn ObjectStore>) -> Self {
		Self { store }
	}

	async fn list(&self, prefix: &str) -> Result<Vec<InstanceIdentifier>, IndexError> {
		let keys = self.store.list_objects(prefix).await?;
		trace!(prefix, count = keys.len(), "Listed archived objects");

		// skip non-dicom files
		Ok(keys
			.iter()
			.filter_map(|key| InstanceIdentifier::from_object_key(key))
			.collect())
	}
}

#[async_trait]
impl MetadataIndex for ObjectStoreIndex {
	async fn list_instances_in_study(
		&self,
		study_instance_uid: &str,
	) -> Result<Vec<InstanceIdentifier>, IndexError> {
		self.list(&format!("{study_instance_uid}/")).await
	}

	async fn list_instances_in_series(
		&self,
		study_instance_uid: &str,
		series_instance_uid: &str,
	) -> Result<Vec<InstanceIdentifier>, IndexError> {
		self.list(&format!("{study_instance_uid}/{series_instance_uid}/"))
			.await
	}

	async fn contains_instance(&self, instance: &InstanceIdentifier) -> Result<bool, IndexError> {
		let Some(key) = instance.object_key() else {
			return Ok(false);
		};
		let keys = self.store.list_objects(&key).await?;
		Ok(keys.iter().any(|candidate| candidate == &key))
	}
}
