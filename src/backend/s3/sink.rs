use super::{S3Connection, S3ObjectStore};
use crate::backend::{ObjectStore, SinkProvider, StorageError};
use crate::export::ExportDestination;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Opens a fresh S3 client for the container of an export destination.
#[derive(Debug, Default)]
pub struct S3SinkProvider;

#[async_trait]
impl SinkProvider for S3SinkProvider {
	async fn open(
		&self,
		destination: &ExportDestination,
	) -> Result<Arc<dyn ObjectStore>, StorageError> {
		let ExportDestination::Blob(blob) = destination;
		let connection = blob.connection().map_err(|err| StorageError::Backend {
			source: anyhow::Error::new(err),
		})?;

		debug!(
			endpoint = connection.endpoint,
			container = connection.container,
			explicit_credentials = connection.credentials.is_some(),
			"Opening export destination"
		);

		let store = S3ObjectStore::connect(S3Connection::from(connection)).await;
		Ok(Arc::new(store))
	}
}
