use bytes::Bytes;
use std::fmt::{Debug, Formatter};
use std::io::Cursor;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::warn;

type Transform = Box<dyn FnOnce() -> Result<Bytes, TransformError> + Send>;

#[derive(Debug, Clone, Error)]
#[error("{reason}")]
pub struct TransformError {
	pub reason: String,
}

impl TransformError {
	pub fn new(reason: impl ToString) -> Self {
		Self {
			reason: reason.to_string(),
		}
	}
}

/// The result of evaluating a [`LazyTransformStream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformOutcome {
	Completed,
	/// The transform failed and the stream yields no content.
	Failed { reason: String },
}

impl TransformOutcome {
	pub const fn is_failed(&self) -> bool {
		matches!(self, Self::Failed { .. })
	}
}

#[derive(Debug)]
struct Evaluated {
	content: Bytes,
	outcome: TransformOutcome,
}

struct Inner {
	transform: Mutex<Option<Transform>>,
	evaluated: OnceCell<Evaluated>,
}

/// Bytes produced by a deferred transform (decode, transcode or frame extraction).
///
/// The transform runs on the blocking thread pool when the content is first requested
/// and never more than once. Clones share the result.
/// A failed transform yields empty content. [`Self::outcome`] tells a failure apart from
/// content that is legitimately empty.
#[derive(Clone)]
pub struct LazyTransformStream {
	inner: Arc<Inner>,
}

impl LazyTransformStream {
	pub fn new<F>(transform: F) -> Self
	where
		F: FnOnce() -> Result<Bytes, TransformError> + Send + 'static,
	{
		Self {
			inner: Arc::new(Inner {
				transform: Mutex::new(Some(Box::new(transform))),
				evaluated: OnceCell::new(),
			}),
		}
	}

	/// A stream that needs no transform.
	pub fn ready(content: Bytes) -> Self {
		Self {
			inner: Arc::new(Inner {
				transform: Mutex::new(None),
				evaluated: OnceCell::new_with(Some(Evaluated {
					content,
					outcome: TransformOutcome::Completed,
				})),
			}),
		}
	}

	pub fn is_evaluated(&self) -> bool {
		self.inner.evaluated.initialized()
	}

	/// The outcome of the transform, or `None` if it has not been evaluated yet.
	pub fn outcome(&self) -> Option<TransformOutcome> {
		self.inner
			.evaluated
			.get()
			.map(|evaluated| evaluated.outcome.clone())
	}

	/// Evaluates the transform if necessary and returns the content.
	pub async fn content(&self) -> Bytes {
		self.evaluate().await.content.clone()
	}

	/// A reader positioned at the start of the content. Every call starts over.
	pub async fn reader(&self) -> Cursor<Bytes> {
		Cursor::new(self.content().await)
	}

	async fn evaluate(&self) -> &Evaluated {
		self.inner
			.evaluated
			.get_or_init(|| async {
				let transform = self
					.inner
					.transform
					.lock()
					.unwrap_or_else(PoisonError::into_inner)
					.take();

				let result = match transform {
					Some(transform) => tokio::task::spawn_blocking(transform)
						.await
						.unwrap_or_else(|err| Err(TransformError::new(err))),
					None => Err(TransformError::new("transform already consumed")),
				};

				match result {
					Ok(content) => Evaluated {
						content,
						outcome: TransformOutcome::Completed,
					},
					Err(err) => {
						warn!(reason = %err, "Transform failed, yielding empty content");
						Evaluated {
							content: Bytes::new(),
							outcome: TransformOutcome::Failed { reason: err.reason },
						}
					}
				}
			})
			.await
	}
}

impl Debug for LazyTransformStream {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("LazyTransformStream")
			.field("evaluated", &self.inner.evaluated.get())
			.finish()
	}
}
