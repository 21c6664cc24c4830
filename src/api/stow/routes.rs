use crate::api::stow::{InstanceReference, StoreError, StoreResponse, UploadedInstance};
use crate::types::{UI, US};
use crate::utils::multipart::DicomMultipart;
use crate::AppState;
use axum::body::Body;
use axum::extract::rejection::LengthLimitError;
use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{Response, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use dicom::object::InMemDicomObject;
use dicom_json::DicomJson;
use multer::Error;
use tracing::{error, info, instrument, warn};

/// HTTP Router for the Store Transaction
/// https://dicom.nema.org/medical/dicom/current/output/html/part18.html#sect_10.5
pub fn routes() -> Router<AppState> {
	Router::new()
		.route("/studies", post(studies))
		.route("/studies/{study}", post(study))
}

#[instrument(skip_all)]
async fn studies(State(state): State<AppState>, multipart: DicomMultipart<'static>) -> impl IntoResponse {
	store(&state, None, multipart).await
}

#[instrument(skip_all, fields(study))]
async fn study(
	State(state): State<AppState>,
	Path(study): Path<UI>,
	multipart: DicomMultipart<'static>,
) -> impl IntoResponse {
	tracing::Span::current().record("study", study.as_str());
	store(&state, Some(&study), multipart).await
}

async fn store(
	state: &AppState,
	study_instance_uid: Option<&str>,
	mut multipart: DicomMultipart<'static>,
) -> impl IntoResponse {
	let mut response = StoreResponse::default();

	loop {
		let data = match multipart.next_field().await {
			Ok(Some(field)) => field.bytes().await,
			Ok(None) => break,
			Err(err) => Err(err),
		};

		let data = match data {
			Ok(data) => data,
			Err(err) => {
				let err = stream_error(err);
				let status = match err {
					StoreError::UploadLimitExceeded => StatusCode::PAYLOAD_TOO_LARGE,
					StoreError::Stream(_) => StatusCode::BAD_REQUEST,
				};
				return (status, err.to_string()).into_response();
			}
		};

		let instance = match UploadedInstance::read(data) {
			Ok(instance) => instance,
			Err(err) => {
				warn!("Rejected uploaded part: {err}");
				response.unreadable += 1;
				continue;
			}
		};

		let identifier = instance.identifier.clone();
		match instance.store(state.archive.as_ref(), study_instance_uid).await {
			Ok(reference) => {
				info!(%identifier, "Stored instance");
				response.referenced_sequence.push(reference);
			}
			Err((reference, err)) => {
				warn!(%identifier, "Failed to store instance: {err}");
				response.failed_sequence.push(reference_with_reason(reference, err.failure_reason()));
			}
		}
	}

	if response.is_empty() {
		return (StatusCode::BAD_REQUEST, "The request does not contain any instance").into_response();
	}

	// https://dicom.nema.org/medical/dicom/current/output/chtml/part18/sect_10.5.3.html
	let status = if response.referenced_sequence.is_empty() {
		StatusCode::CONFLICT
	} else if response.has_failures() {
		StatusCode::ACCEPTED
	} else {
		StatusCode::OK
	};

	let json = DicomJson::from(InMemDicomObject::from(response));
	match serde_json::to_string(&json) {
		Ok(body) => Response::builder()
			.status(status)
			.header(CONTENT_TYPE, "application/dicom+json")
			.body(Body::from(body))
			.map_or_else(
				|err| {
					error!("Failed to build store response: {err}");
					StatusCode::INTERNAL_SERVER_ERROR.into_response()
				},
				IntoResponse::into_response,
			),
		Err(err) => {
			error!("Failed to serialize store response: {err}");
			StatusCode::INTERNAL_SERVER_ERROR.into_response()
		}
	}
}

fn reference_with_reason(reference: InstanceReference, failure_reason: US) -> InstanceReference {
	InstanceReference {
		failure_reason: Some(failure_reason),
		..reference
	}
}

fn stream_error(err: Error) -> StoreError {
	if let Error::StreamReadFailed(stream_error) = &err {
		let is_limit_exceeded = stream_error
			.downcast_ref::<axum::Error>()
			.and_then(std::error::Error::source)
			.and_then(|err| err.downcast_ref::<LengthLimitError>())
			.is_some();

		if is_limit_exceeded {
			warn!("Upload limit exceeded.");
			return StoreError::UploadLimitExceeded;
		}
	}

	error!("Failed to read multipart stream: {err:?}");
	StoreError::Stream(err)
}
