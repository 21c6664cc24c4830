mod sink;

pub use sink::S3SinkProvider;

use crate::backend::{ObjectStore, StorageError};
use crate::config::{S3Config, S3EndpointStyle};
use crate::export::destination::BlobConnection;
use async_trait::async_trait;
use aws_config::retry::RetryConfig;
use aws_config::stalled_stream_protection::StalledStreamProtectionConfig;
use aws_config::timeout::TimeoutConfig;
use aws_config::{AppName, BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3 as s3;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::list_objects_v2::{ListObjectsV2Error, ListObjectsV2Output};
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

/// Region used if neither the configuration nor the environment provide one.
const FALLBACK_REGION: &str = "us-east-1";

pub trait S3ClientExt {
	/// Recursively collects objects
	fn collect_objects(&self) -> CollectObjectsFluentBuilder<'_>;
}

impl S3ClientExt for s3::Client {
	fn collect_objects(&self) -> CollectObjectsFluentBuilder<'_> {
		CollectObjectsFluentBuilder {
			handle: self,
			bucket: String::from("dicom"),
			prefix: String::new(),
		}
	}
}

pub struct CollectObjectsFluentBuilder<'a> {
	handle: &'a s3::Client,
	bucket: String,
	prefix: String,
}

impl CollectObjectsFluentBuilder<'_> {
	pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
		self.bucket = bucket.into();
		self
	}

	pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
		self.prefix = prefix.into();
		self
	}

	async fn list_next(
		&self,
		continuation_token: Option<String>,
	) -> Result<ListObjectsV2Output, SdkError<ListObjectsV2Error>> {
		self.handle
			.list_objects_v2()
			.bucket(&self.bucket)
			.prefix(&self.prefix)
			.set_continuation_token(continuation_token)
			.send()
			.await
	}

	/// Collects the keys of all objects, following continuation tokens.
	pub async fn send(self) -> Result<Vec<String>, CollectObjectError> {
		let mut keys = Vec::new();
		let mut continuation_token: Option<String> = None;
		loop {
			match self.list_next(continuation_token).await {
				Ok(response) => {
					if let Some(response_objects) = response.contents {
						keys.extend(response_objects.into_iter().filter_map(|object| object.key));
					}
					if response.is_truncated.unwrap_or(false) {
						continuation_token = response.next_continuation_token;
					} else {
						break;
					}
				}
				Err(err) => {
					error!("{err:?}");
					return Err(CollectObjectError::SdkError(Box::new(err)));
				}
			}
		}

		Ok(keys)
	}
}

#[derive(Debug, Error)]
pub enum CollectObjectError {
	#[error(transparent)]
	SdkError(Box<SdkError<ListObjectsV2Error>>),
}

/// How the S3 client authenticates.
pub enum CredentialSource {
	/// The default credential chain of the SDK (environment, profile, instance metadata...).
	Ambient,
	Static(Credentials),
}

/// Everything needed to connect to a bucket.
pub struct S3Connection {
	pub endpoint: String,
	pub bucket: String,
	pub region: Option<String>,
	pub endpoint_style: S3EndpointStyle,
	pub credentials: CredentialSource,
}

impl From<&S3Config> for S3Connection {
	fn from(config: &S3Config) -> Self {
		let credentials = match &config.credentials {
			Some(credentials) => match credentials.resolve() {
				Ok(resolved_secrets) => CredentialSource::Static(resolved_secrets),
				Err(_) => {
					warn!("Failed to resolve credentials. Check your environment variables.");
					CredentialSource::Ambient
				}
			},
			None => CredentialSource::Ambient,
		};

		Self {
			endpoint: config.endpoint.clone(),
			bucket: config.bucket.clone(),
			region: config.region.clone(),
			endpoint_style: config.endpoint_style,
			credentials,
		}
	}
}

impl From<BlobConnection> for S3Connection {
	fn from(connection: BlobConnection) -> Self {
		let credentials = connection.credentials.map_or(CredentialSource::Ambient, |key| {
			CredentialSource::Static(Credentials::new(
				key.access_key_id,
				key.secret_access_key,
				None,
				None,
				"dicom-archive-export",
			))
		});

		Self {
			endpoint: connection.endpoint,
			bucket: connection.container,
			region: connection.region,
			endpoint_style: S3EndpointStyle::Path,
			credentials,
		}
	}
}

/// An [`ObjectStore`] backed by a single S3 bucket.
pub struct S3ObjectStore {
	client: s3::Client,
	bucket: String,
	endpoint: String,
}

impl S3ObjectStore {
	pub async fn connect(connection: S3Connection) -> Self {
		info!(endpoint = connection.endpoint, bucket = connection.bucket, "Connecting to S3");

		let (mut builder, ambient_region) = match &connection.credentials {
			CredentialSource::Ambient => {
				let shared_config = aws_config::defaults(BehaviorVersion::latest()).load().await;
				let region = shared_config.region().cloned();
				(s3::config::Builder::from(&shared_config), region)
			}
			CredentialSource::Static(credentials) => (
				s3::config::Builder::new()
					.behavior_version(BehaviorVersion::latest())
					.credentials_provider(credentials.clone()),
				None,
			),
		};

		let region = connection
			.region
			.clone()
			.map(Region::new)
			.or(ambient_region)
			.unwrap_or_else(|| Region::new(FALLBACK_REGION));
		builder = builder.region(region);

		builder = builder
			.endpoint_url(&connection.endpoint)
			.force_path_style(matches!(connection.endpoint_style, S3EndpointStyle::Path))
			.retry_config(RetryConfig::adaptive())
			// Causes issues with long-running requests and high concurrency.
			// It's okay to stall for some time.
			.stalled_stream_protection(StalledStreamProtectionConfig::disabled())
			.timeout_config(
				TimeoutConfig::builder()
					.connect_timeout(Duration::from_secs(5))
					.read_timeout(Duration::from_secs(20))
					.operation_timeout(Duration::from_secs(60))
					.build(),
			);

		if let Ok(app_name) = AppName::new("dicom-archive") {
			builder = builder.app_name(app_name);
		}

		Self {
			client: s3::Client::from_conf(builder.build()),
			bucket: connection.bucket,
			endpoint: connection.endpoint,
		}
	}
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
	async fn get_object(&self, key: &str) -> Result<Bytes, StorageError> {
		let object = self
			.client
			.get_object()
			.bucket(&self.bucket)
			.key(key)
			.send()
			.await
			.map_err(|err| match err.into_service_error() {
				GetObjectError::NoSuchKey(_) => StorageError::NotFound {
					key: key.to_owned(),
				},
				err => StorageError::Backend {
					source: anyhow::Error::new(err),
				},
			})?;

		let body = object
			.body
			.collect()
			.await
			.map_err(|err| StorageError::Backend {
				source: anyhow::Error::new(err),
			})?;

		Ok(body.into_bytes())
	}

	async fn put_object(&self, key: &str, body: Bytes) -> Result<(), StorageError> {
		self.client
			.put_object()
			.bucket(&self.bucket)
			.key(key)
			.body(ByteStream::from(body))
			.send()
			.await
			.map_err(|err| StorageError::Backend {
				source: anyhow::Error::new(err.into_service_error()),
			})?;

		Ok(())
	}

	async fn list_objects(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
		self.client
			.collect_objects()
			.bucket(&self.bucket)
			.prefix(prefix)
			.send()
			.await
			.map_err(|err| StorageError::Backend {
				source: anyhow::Error::new(err),
			})
	}

	fn location(&self, key: &str) -> String {
		format!(
			"{}/{}/{key}",
			self.endpoint.trim_end_matches('/'),
			self.bucket
		)
	}
}
