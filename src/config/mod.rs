use serde::{Deserialize, Deserializer};
use std::net::IpAddr;
use std::str::FromStr;
use tracing::Level;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
	pub telemetry: TelemetryConfig,
	pub server: ServerConfig,
	pub storage: S3Config,
	pub retrieve: RetrieveConfig,
	pub export: ExportConfig,
}

impl AppConfig {
	/// Loads the configuration from the embedded defaults, an optional `config.toml` in the
	/// working directory and `DICOM_ARCHIVE_*` environment variables (in that order).
	/// Nested keys are separated by a double underscore, e.g. `DICOM_ARCHIVE_SERVER__HTTP__PORT`.
	pub fn new() -> Result<Self, config::ConfigError> {
		use config::Config;
		let s = Config::builder()
			.add_source(config::File::from_str(
				include_str!("defaults.toml"),
				config::FileFormat::Toml,
			))
			.add_source(config::File::with_name("config.toml").required(false))
			.add_source(
				config::Environment::with_prefix("DICOM_ARCHIVE")
					.prefix_separator("_")
					.separator("__"),
			)
			.build()?;

		s.try_deserialize()
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
	/// Also configurable via the `RUST_LOG` env var.
	#[serde(deserialize_with = "deserialize_level")]
	pub level: Level,
	/// Sentry DSN. Sentry is disabled if missing.
	pub sentry: Option<String>,
}

fn deserialize_level<'de, D>(deserializer: D) -> Result<Level, D::Error>
where
	D: Deserializer<'de>,
{
	let s = String::deserialize(deserializer)?;
	Level::from_str(&s).map_err(serde::de::Error::custom)
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
	pub http: HttpServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpServerConfig {
	/// The interface the DICOMweb server will be listening on
	pub interface: IpAddr,
	/// The port for the DICOMweb server
	pub port: u16,
	/// Path under which all routes are nested
	pub base_path: String,
	/// Maximum size of a request body in bytes
	pub max_upload_size: usize,
	/// Request timeout in seconds
	pub request_timeout: u64,
	pub graceful_shutdown: bool,
	pub max_concurrent_requests: usize,
}

/// Connection settings for an S3 compatible bucket.
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
	pub endpoint: String,
	pub bucket: String,
	pub region: Option<String>,
	#[serde(default)]
	pub endpoint_style: S3EndpointStyle,
	/// Static credentials. The default credential chain of the SDK is used if missing.
	pub credentials: Option<S3Credentials>,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum S3EndpointStyle {
	#[default]
	Path,
	VHost,
}

/// Names of the environment variables that hold the access key pair.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct S3Credentials {
	pub access_key_env: String,
	pub secret_key_env: String,
}

impl S3Credentials {
	pub fn resolve(&self) -> Result<aws_credential_types::Credentials, std::env::VarError> {
		let access_key = std::env::var(&self.access_key_env)?;
		let secret_key = std::env::var(&self.secret_key_env)?;

		Ok(aws_credential_types::Credentials::new(
			access_key,
			secret_key,
			None,
			None,
			"dicom-archive-env",
		))
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrieveConfig {
	/// Number of archived objects fetched in parallel per request.
	pub concurrency: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExportConfig {
	/// Number of instances copied in parallel.
	pub concurrency: usize,
	/// Number of instances between two checkpoints.
	pub batch_size: usize,
	/// How often a failed export operation is started again before it is marked as failed.
	pub max_attempts: u32,
}
