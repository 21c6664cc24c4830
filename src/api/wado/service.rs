use crate::identifier::InstanceIdentifier;
use crate::retrieve::{RetrieveError, RetrieveRequest};
use crate::transcoding::RequestedTransferSyntax;
use crate::types::{ResourceType, UI};
use crate::AppState;
use axum::extract::rejection::PathRejection;
use axum::extract::{FromRef, FromRequestParts, Path};
use axum::http::header::ACCEPT;
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::error;

/// Path parameters of the retrieve routes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResourceQuery {
	#[serde(rename = "study")]
	pub study_instance_uid: UI,
	#[serde(rename = "series")]
	pub series_instance_uid: Option<UI>,
	#[serde(rename = "instance")]
	pub sop_instance_uid: Option<UI>,
	/// Comma-separated list of 1-based frame numbers.
	pub frames: Option<String>,
}

impl ResourceQuery {
	const fn resource_type(&self) -> ResourceType {
		match (
			&self.series_instance_uid,
			&self.sop_instance_uid,
			&self.frames,
		) {
			(_, _, Some(_)) => ResourceType::Frames,
			(_, Some(_), None) => ResourceType::Instance,
			(Some(_), None, None) => ResourceType::Series,
			(None, None, None) => ResourceType::Study,
		}
	}
}

/// Wraps a [`RetrieveRequest`] built from the path and the `Accept` header.
pub struct RetrieveInstanceRequest(pub RetrieveRequest);

impl<S> FromRequestParts<S> for RetrieveInstanceRequest
where
	AppState: FromRef<S>,
	S: Send + Sync,
{
	type Rejection = Response;

	async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
		let Path(query): Path<ResourceQuery> = Path::from_request_parts(parts, state)
			.await
			.map_err(PathRejection::into_response)?;

		let identifier = InstanceIdentifier::new(
			&query.study_instance_uid,
			query.series_instance_uid.as_deref(),
			query.sop_instance_uid.as_deref(),
		)
		.map_err(|err| (StatusCode::BAD_REQUEST, err.to_string()).into_response())?;

		let frames = query
			.frames
			.as_deref()
			.map(parse_frames)
			.transpose()
			.map_err(|err| (StatusCode::BAD_REQUEST, err).into_response())?
			.unwrap_or_default();

		Ok(Self(RetrieveRequest {
			resource: query.resource_type(),
			identifier,
			transfer_syntax: requested_transfer_syntax(&parts.headers),
			frames,
		}))
	}
}

fn parse_frames(frames: &str) -> Result<Vec<u32>, String> {
	frames
		.split(',')
		.map(|frame| {
			frame
				.trim()
				.parse::<u32>()
				.map_err(|_| format!("`{frame}` is not a valid frame number"))
		})
		.collect()
}

/// Reads the `transfer-syntax` parameter of the `Accept` header.
///
/// The first media range that carries the parameter wins. Without any, the DICOMweb default
/// (Explicit VR Little Endian) applies.
pub fn requested_transfer_syntax(headers: &HeaderMap) -> RequestedTransferSyntax {
	headers
		.get_all(ACCEPT)
		.iter()
		.filter_map(|value| value.to_str().ok())
		.flat_map(|value| value.split(','))
		.flat_map(|range| range.split(';').skip(1))
		.filter_map(|parameter| parameter.split_once('='))
		.find(|(name, _)| name.trim().eq_ignore_ascii_case("transfer-syntax"))
		.map(|(_, value)| RequestedTransferSyntax::parse(value.trim().trim_matches('"')))
		.unwrap_or_default()
}

impl IntoResponse for RetrieveError {
	fn into_response(self) -> Response {
		let status = match &self {
			Self::NotFound { .. } => StatusCode::NOT_FOUND,
			Self::NotAcceptable { .. } => StatusCode::NOT_ACCEPTABLE,
			Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
			Self::Cancelled | Self::Index(_) => StatusCode::SERVICE_UNAVAILABLE,
			Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
		};
		if status.is_server_error() {
			error!("{self:?}");
		}
		(status, self.to_string()).into_response()
	}
}
