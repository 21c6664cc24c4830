//! Long-running operations. Export is the only kind there is.

use crate::export::{
	ExportCheckpoint, ExportDestination, ExportError, ExportJob, ExportOrchestrator,
	ExportResult, ExportSource,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationStatus {
	NotStarted,
	Running,
	Completed,
	Failed,
	Cancelled,
}

impl OperationStatus {
	pub const fn is_terminal(self) -> bool {
		matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
	}
}

/// The externally visible state of an operation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationState {
	pub operation_id: Uuid,
	#[serde(rename = "type")]
	pub kind: &'static str,
	pub status: OperationStatus,
	pub percent_complete: u8,
	pub exported: u64,
	pub skipped: u64,
	pub total: u64,
	pub attempts: u32,
	pub error_log_href: Option<String>,
	/// Operation-level failures, one per failed attempt.
	pub errors: Vec<String>,
	pub created_time: DateTime<Utc>,
	pub last_updated_time: DateTime<Utc>,
	#[serde(skip)]
	checkpoint: Option<ExportCheckpoint>,
}

impl OperationState {
	fn new(operation_id: Uuid) -> Self {
		let now = Utc::now();
		Self {
			operation_id,
			kind: "export",
			status: OperationStatus::NotStarted,
			percent_complete: 0,
			exported: 0,
			skipped: 0,
			total: 0,
			attempts: 0,
			error_log_href: None,
			errors: Vec::new(),
			created_time: now,
			last_updated_time: now,
			checkpoint: None,
		}
	}

	fn record_checkpoint(&mut self, checkpoint: &ExportCheckpoint) {
		self.exported = checkpoint.counts.exported;
		self.skipped = checkpoint.counts.skipped;
		self.total = checkpoint.total;
		self.error_log_href = Some(checkpoint.error_log_href.clone());
		self.percent_complete = percent(self.exported + self.skipped, self.total);
		self.checkpoint = Some(checkpoint.clone());
	}

	fn complete(&mut self, result: &ExportResult) {
		self.status = OperationStatus::Completed;
		self.exported = result.exported;
		self.skipped = result.skipped;
		self.total = self.total.max(result.exported + result.skipped);
		self.error_log_href = Some(result.error_log_href.clone());
		self.percent_complete = 100;
	}
}

fn percent(done: u64, total: u64) -> u8 {
	if total == 0 {
		return 0;
	}
	u8::try_from((done.min(total) * 100) / total).unwrap_or(100)
}

struct Entry {
	state: OperationState,
	cancel: CancellationToken,
}

/// Keeps track of all operations started since the server came up.
#[derive(Clone, Default)]
pub struct OperationRegistry {
	entries: Arc<RwLock<HashMap<Uuid, Entry>>>,
}

impl OperationRegistry {
	pub fn get(&self, operation_id: Uuid) -> Option<OperationState> {
		let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
		entries.get(&operation_id).map(|entry| entry.state.clone())
	}

	/// Requests cancellation. Returns the current state or `None` for unknown operations.
	pub fn cancel(&self, operation_id: Uuid) -> Option<OperationState> {
		let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
		let entry = entries.get(&operation_id)?;
		if !entry.state.status.is_terminal() {
			info!(operation_id = operation_id.to_string(), "Cancelling operation");
			entry.cancel.cancel();
		}
		Some(entry.state.clone())
	}

	fn insert(&self, operation_id: Uuid, cancel: CancellationToken) {
		let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
		entries.insert(
			operation_id,
			Entry {
				state: OperationState::new(operation_id),
				cancel,
			},
		);
	}

	fn update(&self, operation_id: Uuid, f: impl FnOnce(&mut OperationState)) {
		let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
		if let Some(entry) = entries.get_mut(&operation_id) {
			f(&mut entry.state);
			entry.state.last_updated_time = Utc::now();
		}
	}

	fn checkpoint(&self, operation_id: Uuid) -> Option<ExportCheckpoint> {
		let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
		entries
			.get(&operation_id)
			.and_then(|entry| entry.state.checkpoint.clone())
	}
}

/// Starts export operations in the background and retries them after operation-level
/// failures.
#[derive(Clone)]
pub struct OperationRunner {
	registry: OperationRegistry,
	orchestrator: Arc<ExportOrchestrator>,
	max_attempts: u32,
}

impl OperationRunner {
	pub fn new(orchestrator: Arc<ExportOrchestrator>, max_attempts: u32) -> Self {
		Self {
			registry: OperationRegistry::default(),
			orchestrator,
			max_attempts: max_attempts.max(1),
		}
	}

	pub const fn registry(&self) -> &OperationRegistry {
		&self.registry
	}

	pub fn start_export(&self, source: ExportSource, destination: ExportDestination) -> Uuid {
		let job = ExportJob {
			operation_id: Uuid::new_v4(),
			source,
			destination,
		};
		let operation_id = job.operation_id;
		let cancel = CancellationToken::new();
		self.registry.insert(operation_id, cancel.clone());

		tokio::spawn(Self::run_export(
			self.registry.clone(),
			Arc::clone(&self.orchestrator),
			job,
			cancel,
			self.max_attempts,
		));
		operation_id
	}

	async fn run_export(
		registry: OperationRegistry,
		orchestrator: Arc<ExportOrchestrator>,
		job: ExportJob,
		cancel: CancellationToken,
		max_attempts: u32,
	) {
		let operation_id = job.operation_id;
		let progress = |checkpoint: &ExportCheckpoint| {
			registry.update(operation_id, |state| state.record_checkpoint(checkpoint));
		};

		for attempt in 1..=max_attempts {
			registry.update(operation_id, |state| {
				state.status = OperationStatus::Running;
				state.attempts = attempt;
			});

			// resume from the last completed batch of an earlier attempt
			let checkpoint = registry.checkpoint(operation_id);
			match orchestrator.run(&job, checkpoint, &progress, &cancel).await {
				Ok(result) => {
					registry.update(operation_id, |state| state.complete(&result));
					return;
				}
				Err(ExportError::Cancelled) => {
					registry.update(operation_id, |state| {
						state.status = OperationStatus::Cancelled;
					});
					return;
				}
				Err(err) => {
					warn!(
						operation_id = operation_id.to_string(),
						attempt, "Export attempt failed: {err}"
					);
					registry.update(operation_id, |state| state.errors.push(err.to_string()));
				}
			}

			if cancel.is_cancelled() {
				registry.update(operation_id, |state| {
					state.status = OperationStatus::Cancelled;
				});
				return;
			}
		}

		error!(
			operation_id = operation_id.to_string(),
			max_attempts, "Export failed"
		);
		registry.update(operation_id, |state| {
			state.status = OperationStatus::Failed;
		});
	}
}
