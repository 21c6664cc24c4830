use crate::api::wado::RetrieveInstanceRequest;
use crate::retrieve::{RetrieveRequest, RetrieveStatus};
use crate::utils::multipart::DicomMultipartStream;
use crate::AppState;
use axum::body::Body;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::{Response, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::{error, instrument};
use uuid::Uuid;

const DICOM: &str = "application/dicom";
const OCTET_STREAM: &str = "application/octet-stream";

/// HTTP Router for the Retrieve Transaction
/// https://dicom.nema.org/medical/dicom/current/output/html/part18.html#sect_10.4
#[rustfmt::skip]
pub fn routes() -> Router<AppState> {
	Router::new()
		// https://dicom.nema.org/medical/dicom/current/output/chtml/part18/sect_10.4.html#sect_10.4.1.1.1
		.route("/studies/{study}", get(study_instances))
		.route("/studies/{study}/series/{series}", get(series_instances))
		.route("/studies/{study}/series/{series}/instances/{instance}", get(instance))

		// https://dicom.nema.org/medical/dicom/current/output/chtml/part18/sect_10.4.html#sect_10.4.1.1.6
		.route("/studies/{study}/series/{series}/instances/{instance}/frames/{frames}", get(frames))
}

async fn retrieve_resource(
	state: &AppState,
	request: RetrieveRequest,
	media_type: &'static str,
) -> impl IntoResponse {
	// cancels the fetches if the client goes away before the response is ready
	let cancel = CancellationToken::new();
	let _guard = cancel.clone().drop_guard();

	let response = match state.retrieve.retrieve(request, &cancel).await {
		Ok(response) => response,
		Err(err) => return err.into_response(),
	};

	let status = match response.status {
		RetrieveStatus::Ok => StatusCode::OK,
		RetrieveStatus::PartialContent => StatusCode::PARTIAL_CONTENT,
	};
	let boundary = Uuid::new_v4().simple().to_string();

	Response::builder()
		.status(status)
		.header(
			CONTENT_TYPE,
			format!(r#"multipart/related; type="{media_type}"; boundary={boundary}"#),
		)
		.body(Body::from_stream(DicomMultipartStream::new(
			boundary,
			media_type,
			response.items,
		)))
		.map_or_else(
			|err| {
				error!("Failed to build retrieve response: {err}");
				StatusCode::INTERNAL_SERVER_ERROR.into_response()
			},
			IntoResponse::into_response,
		)
}

#[instrument(skip_all)]
async fn study_instances(
	State(state): State<AppState>,
	RetrieveInstanceRequest(request): RetrieveInstanceRequest,
) -> impl IntoResponse {
	retrieve_resource(&state, request, DICOM).await
}

#[instrument(skip_all)]
async fn series_instances(
	State(state): State<AppState>,
	RetrieveInstanceRequest(request): RetrieveInstanceRequest,
) -> impl IntoResponse {
	retrieve_resource(&state, request, DICOM).await
}

#[instrument(skip_all)]
async fn instance(
	State(state): State<AppState>,
	RetrieveInstanceRequest(request): RetrieveInstanceRequest,
) -> impl IntoResponse {
	retrieve_resource(&state, request, DICOM).await
}

#[instrument(skip_all)]
async fn frames(
	State(state): State<AppState>,
	RetrieveInstanceRequest(request): RetrieveInstanceRequest,
) -> impl IntoResponse {
	retrieve_resource(&state, request, OCTET_STREAM).await
}
