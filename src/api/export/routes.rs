use crate::api::export::{ExportRequest, OperationReference};
use crate::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// HTTP Router for bulk export and the operations it starts
pub fn routes() -> Router<AppState> {
	Router::new()
		.route("/export", post(start_export))
		.route("/operations/{id}", get(operation).delete(cancel_operation))
}

#[instrument(skip_all)]
async fn start_export(
	State(state): State<AppState>,
	Json(request): Json<ExportRequest>,
) -> impl IntoResponse {
	if let Err(err) = request.validate() {
		warn!("Rejected export request: {err}");
		return (StatusCode::BAD_REQUEST, err.to_string()).into_response();
	}

	let identifiers = request.source.identifiers().len();
	let id = state
		.operations
		.start_export(request.source, request.destination);
	info!(operation_id = id.to_string(), identifiers, "Started export");

	let reference = OperationReference::new(&state.config.server.http.base_path, id);
	(StatusCode::ACCEPTED, Json(reference)).into_response()
}

#[instrument(skip_all, fields(operation_id = %id))]
async fn operation(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
	match state.operations.registry().get(id) {
		Some(operation) => Json(operation).into_response(),
		None => StatusCode::NOT_FOUND.into_response(),
	}
}

#[instrument(skip_all, fields(operation_id = %id))]
async fn cancel_operation(
	State(state): State<AppState>,
	Path(id): Path<Uuid>,
) -> impl IntoResponse {
	match state.operations.registry().cancel(id) {
		// nothing left to cancel
		Some(operation) if operation.status.is_terminal() => {
			(StatusCode::OK, Json(operation)).into_response()
		}
		Some(operation) => (StatusCode::ACCEPTED, Json(operation)).into_response(),
		None => StatusCode::NOT_FOUND.into_response(),
	}
}

#[cfg(test)]
mod tests {
	use crate::testing::{app, archive, CountingCodec, ImageFixture, MemoryStore};
	use axum::body::Body;
	use axum::http::header::CONTENT_TYPE;
	use axum::http::{Method, Request, StatusCode};
	use axum::Router;
	use serde_json::{json, Value};
	use std::sync::Arc;
	use std::time::Duration;
	use tower::ServiceExt;

	fn router(sink: Arc<MemoryStore>) -> Router {
		app(
			archive(&[
				ImageFixture::new("1.1", "2.1", "3.1"),
				ImageFixture::new("1.1", "2.1", "3.2"),
				ImageFixture::new("1.1", "2.2", "3.3"),
			]),
			Arc::new(CountingCodec::default()),
			sink,
		)
	}

	async fn send(router: Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
		let request = Request::builder().method(method).uri(uri);
		let request = match body {
			Some(body) => request
				.header(CONTENT_TYPE, "application/json")
				.body(Body::from(body.to_string())),
			None => request.body(Body::empty()),
		}
		.unwrap();

		let response = router.oneshot(request).await.unwrap();
		let status = response.status();
		let body = axum::body::to_bytes(response.into_body(), usize::MAX)
			.await
			.unwrap();
		(status, serde_json::from_slice(&body).unwrap_or_default())
	}

	fn export_request(identifiers: &[&str]) -> Value {
		json!({
			"source": { "type": "identifiers", "identifiers": identifiers },
			"destination": {
				"type": "blob",
				"containerUri": "https://storage.example.com/exports"
			}
		})
	}

	async fn wait_for_completion(router: &Router, href: &str) -> Value {
		for _ in 0..100 {
			let (status, operation) = send(router.clone(), Method::GET, href, None).await;
			assert_eq!(status, StatusCode::OK);
			if operation["status"] != "running" && operation["status"] != "notStarted" {
				return operation;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		panic!("export did not finish");
	}

	#[tokio::test]
	async fn export_runs_as_operation() {
		let sink = Arc::new(MemoryStore::new());
		let router = router(sink.clone());

		let (status, reference) = send(
			router.clone(),
			Method::POST,
			"/export",
			Some(export_request(&["1.1/2.1", "1.1/2.2/3.3", "9.9"])),
		)
		.await;
		assert_eq!(status, StatusCode::ACCEPTED);
		let id = reference["id"].as_str().unwrap().to_owned();
		let href = reference["href"].as_str().unwrap().to_owned();
		assert_eq!(href, format!("/operations/{id}"));

		let operation = wait_for_completion(&router, &href).await;
		assert_eq!(operation["status"], "completed");
		assert_eq!(operation["exported"], 3);
		assert_eq!(operation["skipped"], 1);
		assert_eq!(operation["percentComplete"], 100);
		assert!(sink
			.get(&format!("{id}/Results/1.1/2.2/3.3.dcm"))
			.is_some());
		assert!(sink.get(&format!("{id}/Errors.log")).is_some());
	}

	#[tokio::test]
	async fn invalid_export_requests() {
		let router = router(Arc::new(MemoryStore::new()));

		let (status, _) = send(router.clone(), Method::POST, "/export", Some(export_request(&[]))).await;
		assert_eq!(status, StatusCode::BAD_REQUEST);

		let request = json!({
			"source": { "type": "identifiers", "identifiers": ["1.1"] },
			"destination": { "type": "blob", "connectionString": "Endpoint=https://s3.example.com" }
		});
		let (status, _) = send(router, Method::POST, "/export", Some(request)).await;
		assert_eq!(status, StatusCode::BAD_REQUEST);
	}

	#[tokio::test]
	async fn unknown_operations() {
		let router = router(Arc::new(MemoryStore::new()));
		let uri = "/operations/00000000-0000-0000-0000-000000000000";

		let (status, _) = send(router.clone(), Method::GET, uri, None).await;
		assert_eq!(status, StatusCode::NOT_FOUND);

		let (status, _) = send(router, Method::DELETE, uri, None).await;
		assert_eq!(status, StatusCode::NOT_FOUND);
	}

	#[tokio::test]
	async fn cancel_finished_operation() {
		let router = router(Arc::new(MemoryStore::new()));

		let (_, reference) = send(
			router.clone(),
			Method::POST,
			"/export",
			Some(export_request(&["1.1"])),
		)
		.await;
		let href = reference["href"].as_str().unwrap().to_owned();
		wait_for_completion(&router, &href).await;

		let (status, operation) = send(router, Method::DELETE, &href, None).await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(operation["status"], "completed");
	}
}
