//! Bulk export of archived instances into an external blob container.
//!
//! An export resolves its source identifiers, copies every resolved instance to
//! `{operation}/Results/{study}/{series}/{sop}.dcm` and records everything that could not be
//! exported in `{operation}/Errors.log` (one JSON object per line). Instances are processed in
//! identifier order and in batches; a checkpoint is published after every batch so that an
//! interrupted run can be resumed without counting an instance twice.

mod aggregator;
pub mod destination;

pub use destination::ExportDestination;

use crate::backend::{MetadataIndex, ObjectStore, SinkProvider, StorageError};
use crate::identifier::InstanceIdentifier;
use crate::resolver::IdentifierResolver;
use aggregator::{create_result_aggregator, ResultHandle};
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Failure classification of identifiers that do not match any stored instance.
pub const NOT_FOUND: &str = "not found";

/// The instances to export, given with mixed granularity. Entries may overlap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ExportSource {
	Identifiers { identifiers: Vec<InstanceIdentifier> },
}

impl ExportSource {
	pub fn identifiers(&self) -> &[InstanceIdentifier] {
		match self {
			Self::Identifiers { identifiers } => identifiers,
		}
	}
}

#[derive(Debug, Clone)]
pub struct ExportJob {
	pub operation_id: Uuid,
	pub source: ExportSource,
	pub destination: ExportDestination,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportCounts {
	pub exported: u64,
	pub skipped: u64,
}

/// A line of the error log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
	pub timestamp: DateTime<Utc>,
	/// `study`, `study/series` or `study/series/sop`, as supplied or resolved.
	pub identifier: String,
	pub error: String,
}

impl ErrorRecord {
	pub fn new(identifier: &InstanceIdentifier, error: impl ToString) -> Self {
		Self {
			timestamp: Utc::now(),
			identifier: identifier.to_string(),
			error: error.to_string(),
		}
	}
}

/// Final state of an export run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportResult {
	pub exported: u64,
	pub skipped: u64,
	#[serde(skip)]
	pub errors: Vec<ErrorRecord>,
	pub error_log_href: String,
}

/// Progress of an export run, published after every completed batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportCheckpoint {
	/// Every resolved instance up to and including this one has been attempted.
	pub last_processed: Option<InstanceIdentifier>,
	#[serde(flatten)]
	pub counts: ExportCounts,
	/// Resolved instances plus unresolved identifiers.
	pub total: u64,
	pub error_log_href: String,
}

/// Failures that end an export run. Problems with single instances never do.
#[derive(Debug, Error)]
pub enum ExportError {
	#[error("Failed to open the export destination: {0}")]
	Destination(#[source] StorageError),
	#[error("None of the {count} identifier(s) could be looked up in the metadata index")]
	Resolve { count: usize },
	#[error("The export was cancelled")]
	Cancelled,
	#[error("Failed to write the error log: {0}")]
	ErrorLog(#[source] StorageError),
}

pub fn result_key(operation_id: Uuid, instance: &InstanceIdentifier) -> String {
	format!("{operation_id}/Results/{instance}.dcm")
}

pub fn error_log_key(operation_id: Uuid) -> String {
	format!("{operation_id}/Errors.log")
}

pub struct ExportOrchestrator {
	archive: Arc<dyn ObjectStore>,
	resolver: IdentifierResolver,
	sinks: Arc<dyn SinkProvider>,
	concurrency: usize,
	batch_size: usize,
}

impl ExportOrchestrator {
	pub fn new(
		archive: Arc<dyn ObjectStore>,
		index: Arc<dyn MetadataIndex>,
		sinks: Arc<dyn SinkProvider>,
		concurrency: usize,
		batch_size: usize,
	) -> Self {
		Self {
			archive,
			resolver: IdentifierResolver::new(index),
			sinks,
			concurrency: concurrency.max(1),
			batch_size: batch_size.max(1),
		}
	}

	/// Runs (or resumes) an export.
	///
	/// Without a checkpoint the run starts over: unresolved identifiers are recorded and all
	/// resolved instances are copied. With a checkpoint the counts and the error log of the
	/// earlier attempt are continued and only instances after `last_processed` are copied.
	#[instrument(skip_all, fields(operation_id = %job.operation_id))]
	pub async fn run(
		&self,
		job: &ExportJob,
		checkpoint: Option<ExportCheckpoint>,
		progress: &(dyn Fn(&ExportCheckpoint) + Send + Sync),
		cancel: &CancellationToken,
	) -> Result<ExportResult, ExportError> {
		let sink = self
			.sinks
			.open(&job.destination)
			.await
			.map_err(ExportError::Destination)?;

		let resolution = self.resolver.resolve(job.source.identifiers()).await;
		if resolution.resolved.is_empty()
			&& resolution.failures > 0
			&& resolution.failures == resolution.unresolved.len()
		{
			return Err(ExportError::Resolve {
				count: resolution.failures,
			});
		}
		let total = (resolution.resolved.len() + resolution.unresolved.len()) as u64;
		info!(
			resolved = resolution.resolved.len(),
			unresolved = resolution.unresolved.len(),
			resumed = checkpoint.is_some(),
			"Starting export"
		);

		// instances up to the checkpoint were settled by an earlier attempt
		let last_processed = checkpoint
			.as_ref()
			.and_then(|checkpoint| checkpoint.last_processed.as_ref());
		let pending: Vec<InstanceIdentifier> = resolution
			.resolved
			.iter()
			.filter(|instance| last_processed.is_none_or(|last| *instance > last))
			.cloned()
			.collect();

		let log_key = error_log_key(job.operation_id);
		let error_log_href = sink.location(&log_key);
		let (handle, aggregator) = create_result_aggregator(
			Arc::clone(&sink),
			log_key,
			checkpoint.as_ref(),
			&pending,
			self.batch_size,
		)
		.await?;
		// an error return drops `handle` unfinished, which discards the unflushed records
		let aggregator = tokio::spawn(aggregator.run());

		if checkpoint.is_none() {
			for identifier in &resolution.unresolved {
				debug!(%identifier, "Skipping unresolved identifier");
				handle.failed(ErrorRecord::new(identifier, NOT_FOUND)).await;
			}
			progress(&ExportCheckpoint {
				last_processed: None,
				counts: handle.flush().await?,
				total,
				error_log_href: error_log_href.clone(),
			});
		}

		for batch in pending.chunks(self.batch_size) {
			let copies: Vec<_> = batch
				.iter()
				.map(|instance| self.copy(&sink, job.operation_id, instance, &handle, cancel))
				.collect();
			stream::iter(copies)
				.buffer_unordered(self.concurrency)
				.collect::<()>()
				.await;

			// counts of a partially processed batch are never published
			if cancel.is_cancelled() {
				warn!("Export cancelled");
				drop(handle);
				let _ = aggregator.await;
				return Err(ExportError::Cancelled);
			}

			let counts = handle.flush().await?;
			progress(&ExportCheckpoint {
				last_processed: batch.last().cloned(),
				counts,
				total,
				error_log_href: error_log_href.clone(),
			});
		}

		let result = handle.finish().await?;
		if let Err(err) = aggregator.await {
			warn!("Result aggregator did not shut down cleanly: {err}");
		}
		info!(
			exported = result.exported,
			skipped = result.skipped,
			"Export completed"
		);
		Ok(result)
	}

	async fn copy(
		&self,
		sink: &Arc<dyn ObjectStore>,
		operation_id: Uuid,
		instance: &InstanceIdentifier,
		handle: &ResultHandle,
		cancel: &CancellationToken,
	) {
		if cancel.is_cancelled() {
			return;
		}

		match self.copy_instance(sink, operation_id, instance).await {
			Ok(()) => handle.exported().await,
			Err(err) => {
				warn!(identifier = %instance, "Failed to export instance: {err}");
				handle.failed(ErrorRecord::new(instance, err)).await;
			}
		}
	}

	async fn copy_instance(
		&self,
		sink: &Arc<dyn ObjectStore>,
		operation_id: Uuid,
		instance: &InstanceIdentifier,
	) -> Result<(), StorageError> {
		let key = instance
			.object_key()
			.ok_or_else(|| StorageError::NotFound {
				key: instance.to_string(),
			})?;
		let body = self.archive.get_object(&key).await?;
		sink.put_object(&result_key(operation_id, instance), body)
			.await
	}
}
