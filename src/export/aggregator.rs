use super::{ErrorRecord, ExportCheckpoint, ExportCounts, ExportError, ExportResult};
use crate::backend::{ObjectStore, StorageError};
use crate::identifier::InstanceIdentifier;
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

pub(super) enum ResultEvent {
	Exported,
	Failed(ErrorRecord),
	Flush(oneshot::Sender<Result<ExportCounts, ExportError>>),
	Finish(oneshot::Sender<Result<ExportResult, ExportError>>),
}

/// Sending side of the [`ResultAggregator`]. Cheap to clone into every copy task.
#[derive(Clone)]
pub(super) struct ResultHandle {
	tx: mpsc::Sender<ResultEvent>,
}

impl ResultHandle {
	pub async fn exported(&self) {
		self.send(ResultEvent::Exported).await;
	}

	pub async fn failed(&self, record: ErrorRecord) {
		self.send(ResultEvent::Failed(record)).await;
	}

	/// Writes the error log to the destination and returns the counts recorded so far.
	pub async fn flush(&self) -> Result<ExportCounts, ExportError> {
		let (reply, response) = oneshot::channel();
		self.tx
			.send(ResultEvent::Flush(reply))
			.await
			.map_err(|_| aggregator_stopped())?;
		response.await.map_err(|_| aggregator_stopped())?
	}

	/// Writes the error log a last time and ends the run.
	pub async fn finish(self) -> Result<ExportResult, ExportError> {
		let (reply, response) = oneshot::channel();
		self.tx
			.send(ResultEvent::Finish(reply))
			.await
			.map_err(|_| aggregator_stopped())?;
		response.await.map_err(|_| aggregator_stopped())?
	}

	async fn send(&self, event: ResultEvent) {
		if let Err(err) = self.tx.send(event).await {
			error!("Failed to record export result: {err}");
		}
	}
}

fn aggregator_stopped() -> ExportError {
	ExportError::ErrorLog(StorageError::Backend {
		source: anyhow::anyhow!("the result aggregator has stopped"),
	})
}

/// Owns the counts and the error log of a single export run.
///
/// Copy tasks complete in any order and report through a [`ResultHandle`]. Every record is
/// applied as a whole by this task, so the log never contains interleaved partial lines.
/// Object stores cannot append, hence the complete log is rewritten on every flush.
pub(super) struct ResultAggregator {
	rx: mpsc::Receiver<ResultEvent>,
	sink: Arc<dyn ObjectStore>,
	log_key: String,
	log: String,
	errors: Vec<ErrorRecord>,
	counts: ExportCounts,
	dirty: bool,
}

impl ResultAggregator {
	/// Consumes events until the run is finished.
	///
	/// If every handle is dropped without finishing, the run has failed or was cancelled and
	/// the records since the last flush are discarded. They belong to a batch that a resumed
	/// run processes again.
	pub async fn run(mut self) {
		while let Some(event) = self.rx.recv().await {
			match event {
				ResultEvent::Exported => self.counts.exported += 1,
				ResultEvent::Failed(record) => self.append(record),
				ResultEvent::Flush(reply) => {
					let result = self.flush().await.map(|()| self.counts);
					// the requester may have been cancelled
					let _ = reply.send(result);
				}
				ResultEvent::Finish(reply) => {
					let result = match self.flush().await {
						Ok(()) => Ok(self.into_result()),
						Err(err) => Err(err),
					};
					let _ = reply.send(result);
					return;
				}
			}
		}

		if self.dirty {
			debug!(key = self.log_key, "Discarding error records of an unfinished export");
		}
	}

	fn into_result(self) -> ExportResult {
		ExportResult {
			exported: self.counts.exported,
			skipped: self.counts.skipped,
			error_log_href: self.sink.location(&self.log_key),
			errors: self.errors,
		}
	}

	fn append(&mut self, record: ErrorRecord) {
		match serde_json::to_string(&record) {
			Ok(line) => {
				self.log.push_str(&line);
				self.log.push('\n');
			}
			Err(err) => error!(identifier = record.identifier, "Failed to serialize error record: {err}"),
		}
		self.counts.skipped += 1;
		self.errors.push(record);
		self.dirty = true;
	}

	async fn flush(&mut self) -> Result<(), ExportError> {
		if !self.dirty {
			return Ok(());
		}

		self.sink
			.put_object(&self.log_key, Bytes::from(self.log.clone()))
			.await
			.map_err(ExportError::ErrorLog)?;
		self.dirty = false;
		debug!(key = self.log_key, records = self.errors.len(), "Flushed error log");
		Ok(())
	}
}

/// Creates the aggregator of an export run.
///
/// A resumed run starts from the counts of its checkpoint and keeps the error log written by
/// earlier attempts, minus the records of `pending` instances. Those are copied again and the
/// checkpoint counts do not include them. A fresh run starts empty and replaces any log left
/// at `log_key`.
pub(super) async fn create_result_aggregator(
	sink: Arc<dyn ObjectStore>,
	log_key: String,
	resume: Option<&ExportCheckpoint>,
	pending: &[InstanceIdentifier],
	buffer_size: usize,
) -> Result<(ResultHandle, ResultAggregator), ExportError> {
	let (counts, log) = match resume {
		None => (ExportCounts::default(), String::new()),
		Some(checkpoint) => {
			let log = match sink.get_object(&log_key).await {
				Ok(data) => String::from_utf8_lossy(&data).into_owned(),
				Err(err) if err.is_not_found() => String::new(),
				Err(err) => return Err(ExportError::ErrorLog(err)),
			};
			(checkpoint.counts, without_pending(&log, pending))
		}
	};

	let errors = log
		.lines()
		.filter_map(|line| serde_json::from_str::<ErrorRecord>(line).ok())
		.collect();

	let (tx, rx) = mpsc::channel(buffer_size.max(1));
	let aggregator = ResultAggregator {
		rx,
		sink,
		log_key,
		log,
		errors,
		counts,
		dirty: true,
	};
	Ok((ResultHandle { tx }, aggregator))
}

fn without_pending(log: &str, pending: &[InstanceIdentifier]) -> String {
	let pending: HashSet<String> = pending.iter().map(ToString::to_string).collect();
	log.lines()
		.filter(|line| {
			!serde_json::from_str::<ErrorRecord>(line)
				.is_ok_and(|record| pending.contains(&record.identifier))
		})
		.map(|line| format!("{line}\n"))
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::MemoryStore;

	fn record(identifier: &str) -> ErrorRecord {
		let identifier: InstanceIdentifier = identifier.parse().unwrap();
		ErrorRecord::new(&identifier, "not found")
	}

	fn logged(sink: &MemoryStore) -> Vec<String> {
		let log = sink.get("op/Errors.log").unwrap();
		std::str::from_utf8(&log)
			.unwrap()
			.lines()
			.map(|line| serde_json::from_str::<ErrorRecord>(line).unwrap().identifier)
			.collect()
	}

	fn checkpoint(last_processed: Option<&str>) -> ExportCheckpoint {
		ExportCheckpoint {
			last_processed: last_processed.map(|value| value.parse().unwrap()),
			counts: ExportCounts { exported: 3, skipped: 1 },
			total: 10,
			error_log_href: String::from("memory://op/Errors.log"),
		}
	}

	#[tokio::test]
	async fn concurrent_reports_are_counted() {
		let sink = Arc::new(MemoryStore::new());
		let (handle, aggregator) =
			create_result_aggregator(sink.clone(), String::from("op/Errors.log"), None, &[], 4)
				.await
				.unwrap();
		let writer = tokio::spawn(aggregator.run());

		let tasks: Vec<_> = (0..20)
			.map(|i| {
				let handle = handle.clone();
				tokio::spawn(async move {
					if i % 4 == 0 {
						handle.failed(record(&format!("1.{i}"))).await;
					} else {
						handle.exported().await;
					}
				})
			})
			.collect();
		for task in tasks {
			task.await.unwrap();
		}

		let counts = handle.flush().await.unwrap();
		assert_eq!(counts, ExportCounts { exported: 15, skipped: 5 });

		let result = handle.finish().await.unwrap();
		writer.await.unwrap();
		assert_eq!(result.errors.len(), 5);
		assert_eq!(result.error_log_href, "memory://op/Errors.log");

		let log = sink.get("op/Errors.log").unwrap();
		let lines: Vec<_> = std::str::from_utf8(&log).unwrap().lines().collect();
		assert_eq!(lines.len(), 5);
		for line in lines {
			let parsed: ErrorRecord = serde_json::from_str(line).unwrap();
			assert_eq!(parsed.error, "not found");
		}
	}

	#[tokio::test]
	async fn empty_log_is_written() {
		let sink = Arc::new(MemoryStore::new());
		let (handle, aggregator) =
			create_result_aggregator(sink.clone(), String::from("op/Errors.log"), None, &[], 1)
				.await
				.unwrap();
		tokio::spawn(aggregator.run());

		let result = handle.finish().await.unwrap();
		assert_eq!(result.exported, 0);
		assert_eq!(sink.get("op/Errors.log").unwrap().len(), 0);
	}

	#[tokio::test]
	async fn resume_keeps_earlier_records() {
		let sink = Arc::new(MemoryStore::new());
		let earlier = serde_json::to_string(&record("9.9/8.8")).unwrap();
		sink.insert("op/Errors.log", Bytes::from(format!("{earlier}\n")));

		let (handle, aggregator) = create_result_aggregator(
			sink.clone(),
			String::from("op/Errors.log"),
			Some(&checkpoint(None)),
			&[],
			1,
		)
		.await
		.unwrap();
		tokio::spawn(aggregator.run());

		handle.exported().await;
		handle.failed(record("1.2/3.4/5.6")).await;

		let result = handle.finish().await.unwrap();
		assert_eq!(result.exported, 4);
		assert_eq!(result.skipped, 2);
		assert_eq!(
			result.errors.iter().map(|r| r.identifier.as_str()).collect::<Vec<_>>(),
			vec!["9.9/8.8", "1.2/3.4/5.6"]
		);
	}

	#[tokio::test]
	async fn resume_forgets_records_of_instances_copied_again() {
		let sink = Arc::new(MemoryStore::new());
		let log: String = ["9.9", "1.1/2.1/3.2"]
			.into_iter()
			.map(|identifier| format!("{}\n", serde_json::to_string(&record(identifier)).unwrap()))
			.collect();
		sink.insert("op/Errors.log", Bytes::from(log));

		let pending: Vec<InstanceIdentifier> = vec!["1.1/2.1/3.2".parse().unwrap()];
		let (handle, aggregator) = create_result_aggregator(
			sink.clone(),
			String::from("op/Errors.log"),
			Some(&checkpoint(Some("1.1/2.1/3.1"))),
			&pending,
			1,
		)
		.await
		.unwrap();
		tokio::spawn(aggregator.run());

		handle.exported().await;
		let result = handle.finish().await.unwrap();

		assert_eq!(result.exported, 4);
		assert_eq!(result.skipped, 1);
		assert_eq!(logged(&sink), vec!["9.9"]);
		assert_eq!(result.errors.len(), 1);
	}

	#[tokio::test]
	async fn unfinished_run_discards_unflushed_records() {
		let sink = Arc::new(MemoryStore::new());
		let (handle, aggregator) =
			create_result_aggregator(sink.clone(), String::from("op/Errors.log"), None, &[], 1)
				.await
				.unwrap();
		let writer = tokio::spawn(aggregator.run());

		handle.failed(record("1.1")).await;
		handle.flush().await.unwrap();
		handle.failed(record("1.2")).await;
		drop(handle);
		writer.await.unwrap();

		assert_eq!(logged(&sink), vec!["1.1"]);
	}

	#[tokio::test]
	async fn failed_flush_is_reported() {
		let sink = Arc::new(MemoryStore::new());
		sink.fail_puts_containing("Errors.log");
		let (handle, aggregator) =
			create_result_aggregator(sink, String::from("op/Errors.log"), None, &[], 1)
				.await
				.unwrap();
		tokio::spawn(aggregator.run());

		assert!(matches!(handle.flush().await, Err(ExportError::ErrorLog(_))));
		assert!(matches!(handle.finish().await, Err(ExportError::ErrorLog(_))));
	}
}
