use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use url::Url;

/// Where the results of an export operation are written to.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ExportDestination {
	/// A container (bucket) of an S3 compatible blob storage.
	Blob(BlobDestination),
}

// Connection strings may carry secrets.
impl std::fmt::Debug for ExportDestination {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Blob(blob) => f
				.debug_struct("Blob")
				.field("container_uri", &blob.container_uri)
				.field("container_name", &blob.container_name)
				.field("identity", &blob.identity)
				.finish_non_exhaustive(),
		}
	}
}

/// The container is addressed either by `containerUri` (`https://host/container`) or by a
/// `connectionString` (`Endpoint=...;Region=...;AccessKeyId=...;SecretAccessKey=...`)
/// together with a `containerName`.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobDestination {
	pub container_uri: Option<Url>,
	pub connection_string: Option<String>,
	pub container_name: Option<String>,
	#[serde(default)]
	pub identity: IdentityMode,
}

/// How the archive authenticates against the destination.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IdentityMode {
	/// Credentials of the environment the archive is running in (default credential chain).
	#[default]
	Ambient,
	/// Credentials supplied as part of the connection string.
	Explicit,
}

/// Resolved connection parameters of a [`BlobDestination`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobConnection {
	pub endpoint: String,
	pub container: String,
	pub region: Option<String>,
	pub credentials: Option<AccessKey>,
}

#[derive(Clone, PartialEq, Eq)]
pub struct AccessKey {
	pub access_key_id: String,
	pub secret_access_key: String,
}

impl std::fmt::Debug for AccessKey {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("AccessKey")
			.field("access_key_id", &self.access_key_id)
			.finish_non_exhaustive()
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DestinationError {
	#[error("Either a container URI or a connection string with a container name is required")]
	MissingConnection,
	#[error("A container URI and a connection string cannot be combined")]
	AmbiguousConnection,
	#[error("Invalid container URI: {0}")]
	InvalidUri(String),
	#[error("Invalid connection string: {0}")]
	InvalidConnectionString(String),
	#[error("Explicit identity requires AccessKeyId and SecretAccessKey in the connection string")]
	MissingCredentials,
}

impl BlobDestination {
	pub fn connection(&self) -> Result<BlobConnection, DestinationError> {
		let connection = match (&self.container_uri, &self.connection_string) {
			(Some(_), Some(_)) => return Err(DestinationError::AmbiguousConnection),
			(Some(uri), None) => Self::from_uri(uri)?,
			(None, Some(connection_string)) => {
				let container = self
					.container_name
					.as_deref()
					.filter(|name| !name.is_empty())
					.ok_or(DestinationError::MissingConnection)?;
				Self::from_connection_string(connection_string, container)?
			}
			(None, None) => return Err(DestinationError::MissingConnection),
		};

		match self.identity {
			IdentityMode::Explicit if connection.credentials.is_none() => {
				Err(DestinationError::MissingCredentials)
			}
			IdentityMode::Explicit => Ok(connection),
			IdentityMode::Ambient => Ok(BlobConnection {
				credentials: None,
				..connection
			}),
		}
	}

	fn from_uri(uri: &Url) -> Result<BlobConnection, DestinationError> {
		let host = uri
			.host_str()
			.ok_or_else(|| DestinationError::InvalidUri(uri.to_string()))?;
		let container = uri
			.path_segments()
			.and_then(|mut segments| segments.next())
			.filter(|segment| !segment.is_empty())
			.ok_or_else(|| DestinationError::InvalidUri(uri.to_string()))?;

		let endpoint = match uri.port() {
			Some(port) => format!("{}://{host}:{port}", uri.scheme()),
			None => format!("{}://{host}", uri.scheme()),
		};

		Ok(BlobConnection {
			endpoint,
			container: container.to_owned(),
			region: None,
			credentials: None,
		})
	}

	fn from_connection_string(
		connection_string: &str,
		container: &str,
	) -> Result<BlobConnection, DestinationError> {
		let mut entries = HashMap::new();
		for pair in connection_string.split(';').filter(|s| !s.trim().is_empty()) {
			let (key, value) = pair.split_once('=').ok_or_else(|| {
				DestinationError::InvalidConnectionString(format!("`{pair}` is not a key=value pair"))
			})?;
			entries.insert(key.trim().to_ascii_lowercase(), value.trim().to_owned());
		}

		let endpoint = entries
			.remove("endpoint")
			.ok_or_else(|| DestinationError::InvalidConnectionString(String::from("missing Endpoint")))?;
		Url::parse(&endpoint).map_err(|err| DestinationError::InvalidUri(err.to_string()))?;

		let credentials = match (entries.remove("accesskeyid"), entries.remove("secretaccesskey")) {
			(Some(access_key_id), Some(secret_access_key)) => Some(AccessKey {
				access_key_id,
				secret_access_key,
			}),
			_ => None,
		};

		Ok(BlobConnection {
			endpoint: endpoint.trim_end_matches('/').to_owned(),
			container: container.to_owned(),
			region: entries.remove("region"),
			credentials,
		})
	}
}
