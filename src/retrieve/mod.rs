//! Retrieve of studies, series, instances and frames from the archive.
//!
//! A request moves through `fetch -> capability check -> lazy transform`. Objects that
//! cannot be delivered in the requested transfer syntax are dropped, which turns the
//! response into partial content, or into "not acceptable" if nothing remains.
//! Conversions are deferred into [`LazyTransformStream`]s and only run when the response
//! body is consumed. A conversion that fails at that point yields an empty part.

mod frames;

use crate::backend::{IndexError, MetadataIndex, ObjectStore, StorageError};
use crate::identifier::InstanceIdentifier;
use crate::lazy::{LazyTransformStream, TransformError};
use crate::transcoding::{can_transcode, capability, read_dicom, write_dicom, Codec, RequestedTransferSyntax};
use crate::types::{ResourceLevel, ResourceType};
use bytes::Bytes;
use dicom::dictionary_std::tags;
use futures::{StreamExt, TryStreamExt};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrieveRequest {
	pub resource: ResourceType,
	pub identifier: InstanceIdentifier,
	pub transfer_syntax: RequestedTransferSyntax,
	/// 1-based frame numbers, only used for [`ResourceType::Frames`].
	pub frames: Vec<u32>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RetrieveStatus {
	Ok,
	/// Some objects could not be delivered in the requested transfer syntax.
	PartialContent,
}

/// A single part of a retrieve response.
#[derive(Debug, Clone)]
pub struct RetrieveItem {
	pub identifier: InstanceIdentifier,
	/// 1-based frame number for frame retrieves.
	pub frame: Option<u32>,
	/// The transfer syntax of the content.
	pub transfer_syntax: String,
	pub content: LazyTransformStream,
}

#[derive(Debug)]
pub struct RetrieveResponse {
	pub status: RetrieveStatus,
	pub items: Vec<RetrieveItem>,
}

#[derive(Debug, Error)]
pub enum RetrieveError {
	#[error("{resource} not found")]
	NotFound { resource: String },
	#[error("None of the requested objects can be delivered as {transfer_syntax}")]
	NotAcceptable { transfer_syntax: String },
	#[error("Invalid retrieve request: {reason}")]
	InvalidRequest { reason: String },
	#[error("The retrieve request was cancelled")]
	Cancelled,
	#[error(transparent)]
	Storage(StorageError),
	#[error(transparent)]
	Index(#[from] IndexError),
}

impl From<StorageError> for RetrieveError {
	fn from(err: StorageError) -> Self {
		match err {
			StorageError::NotFound { key } => Self::NotFound { resource: key },
			err => Self::Storage(err),
		}
	}
}

/// The attributes the capability check looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ObjectSummary {
	transfer_syntax: String,
	bits_allocated: u16,
	photometric_interpretation: Option<String>,
}

impl ObjectSummary {
	fn read(data: &[u8]) -> Result<Self, TransformError> {
		let object = read_dicom(data).map_err(TransformError::new)?;
		let bits_allocated = object
			.get(tags::BITS_ALLOCATED)
			.and_then(|element| element.to_int::<u16>().ok())
			.unwrap_or(0);
		let photometric_interpretation = object
			.get(tags::PHOTOMETRIC_INTERPRETATION)
			.and_then(|element| element.to_str().ok())
			.map(|value| value.trim().to_owned());

		Ok(Self {
			transfer_syntax: object.meta().transfer_syntax().trim_end_matches('\0').to_owned(),
			bits_allocated,
			photometric_interpretation,
		})
	}

	fn accepts(&self, target: &RequestedTransferSyntax) -> bool {
		can_transcode(
			&self.transfer_syntax,
			self.bits_allocated,
			self.photometric_interpretation.as_deref(),
			target,
		)
	}
}

/// A fetched archive object.
struct Fetched {
	identifier: InstanceIdentifier,
	data: Bytes,
	/// Missing if the header is unreadable.
	summary: Option<ObjectSummary>,
}

pub struct RetrievePipeline {
	store: Arc<dyn ObjectStore>,
	index: Arc<dyn MetadataIndex>,
	codec: Arc<dyn Codec>,
	concurrency: usize,
}

impl RetrievePipeline {
	pub fn new(
		store: Arc<dyn ObjectStore>,
		index: Arc<dyn MetadataIndex>,
		codec: Arc<dyn Codec>,
		concurrency: usize,
	) -> Self {
		Self {
			store,
			index,
			codec,
			concurrency: concurrency.max(1),
		}
	}

	#[instrument(skip_all, fields(resource = %request.resource, identifier = %request.identifier))]
	pub async fn retrieve(
		&self,
		request: RetrieveRequest,
		cancel: &CancellationToken,
	) -> Result<RetrieveResponse, RetrieveError> {
		if request.identifier.level() != request.resource.required_level() {
			return Err(RetrieveError::InvalidRequest {
				reason: format!(
					"{} does not address a {}",
					request.identifier, request.resource
				),
			});
		}

		if request.resource == ResourceType::Frames {
			return self.retrieve_frames(request, cancel).await;
		}

		let instances = self.instances(&request.identifier).await?;
		let fetched = self.fetch(instances, cancel).await?;
		self.assemble(fetched, &request.transfer_syntax)
	}

	async fn instances(
		&self,
		identifier: &InstanceIdentifier,
	) -> Result<Vec<InstanceIdentifier>, RetrieveError> {
		let study = identifier.study_instance_uid();
		let mut instances = match (identifier.level(), identifier.series_instance_uid()) {
			(ResourceLevel::Instance, _) => vec![identifier.clone()],
			(ResourceLevel::Series, Some(series)) => {
				self.index.list_instances_in_series(study, series).await?
			}
			_ => self.index.list_instances_in_study(study).await?,
		};

		if instances.is_empty() {
			return Err(RetrieveError::NotFound {
				resource: identifier.to_string(),
			});
		}
		instances.sort();
		instances.dedup();
		Ok(instances)
	}

	/// Fetches all objects concurrently. A missing object fails the whole request.
	async fn fetch(
		&self,
		instances: Vec<InstanceIdentifier>,
		cancel: &CancellationToken,
	) -> Result<Vec<Fetched>, RetrieveError> {
		let fetches = futures::stream::iter(instances)
			.map(|identifier| async move {
				if cancel.is_cancelled() {
					return Err(RetrieveError::Cancelled);
				}
				let key = identifier
					.object_key()
					.ok_or_else(|| RetrieveError::InvalidRequest {
						reason: format!("{identifier} is not an instance"),
					})?;
				let data = self.store.get_object(&key).await?;

				let header = data.clone();
				let summary =
					match tokio::task::spawn_blocking(move || ObjectSummary::read(&header)).await {
						Ok(Ok(summary)) => Some(summary),
						Ok(Err(err)) => {
							warn!(key, "Failed to read DICOM header: {err}");
							None
						}
						Err(err) => {
							warn!(key, "Failed to read DICOM header: {err}");
							None
						}
					};

				debug!(key, size = data.len(), "Fetched object");
				Ok(Fetched {
					identifier,
					data,
					summary,
				})
			})
			.buffer_unordered(self.concurrency)
			.try_collect::<Vec<_>>();

		let mut fetched = tokio::select! {
			() = cancel.cancelled() => return Err(RetrieveError::Cancelled),
			fetched = fetches => fetched?,
		};
		fetched.sort_by(|a, b| a.identifier.cmp(&b.identifier));
		Ok(fetched)
	}

	/// Drops the objects that fail the capability check and wraps the others.
	fn assemble(
		&self,
		fetched: Vec<Fetched>,
		target: &RequestedTransferSyntax,
	) -> Result<RetrieveResponse, RetrieveError> {
		let total = fetched.len();
		let mut items = Vec::with_capacity(total);

		for object in fetched {
			let Some(target_uid) = target.uid() else {
				// the original representation is delivered even if the header is unreadable
				items.push(RetrieveItem {
					transfer_syntax: object
						.summary
						.map(|summary| summary.transfer_syntax)
						.unwrap_or_default(),
					identifier: object.identifier,
					frame: None,
					content: LazyTransformStream::ready(object.data),
				});
				continue;
			};

			let stored = object
				.summary
				.as_ref()
				.and_then(|summary| capability(&summary.transfer_syntax))
				.map_or("unknown", |capability| capability.name);
			let Some(summary) = object.summary.filter(|summary| summary.accepts(target)) else {
				info!(
					identifier = %object.identifier,
					stored,
					transfer_syntax = %target,
					"Dropping object that cannot be delivered in the requested transfer syntax"
				);
				continue;
			};

			let content = if target.requires_transcoding(&summary.transfer_syntax) {
				self.transcode_lazily(object.data, target_uid)
			} else {
				LazyTransformStream::ready(object.data)
			};

			items.push(RetrieveItem {
				identifier: object.identifier,
				frame: None,
				transfer_syntax: target_uid.to_owned(),
				content,
			});
		}

		if items.is_empty() {
			return Err(RetrieveError::NotAcceptable {
				transfer_syntax: target.to_string(),
			});
		}

		let status = if items.len() < total {
			RetrieveStatus::PartialContent
		} else {
			RetrieveStatus::Ok
		};

		Ok(RetrieveResponse { status, items })
	}

	fn transcode_lazily(&self, data: Bytes, target: &str) -> LazyTransformStream {
		if capability(target).is_some_and(|capability| capability.lossy) {
			debug!(transfer_syntax = target, "Converting into a lossy transfer syntax");
		}
		let codec = Arc::clone(&self.codec);
		let target = target.to_owned();
		LazyTransformStream::new(move || {
			let object = read_dicom(&data).map_err(TransformError::new)?;
			let transcoded = codec
				.transcode(object, &target)
				.map_err(TransformError::new)?;
			write_dicom(&transcoded).map_err(TransformError::new)
		})
	}
}
