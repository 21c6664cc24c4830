pub(crate) mod api;
pub(crate) mod backend;
pub(crate) mod config;
pub(crate) mod export;
pub(crate) mod identifier;
pub(crate) mod lazy;
pub(crate) mod operations;
pub(crate) mod resolver;
pub(crate) mod retrieve;
pub(crate) mod transcoding;
pub(crate) mod types;
pub(crate) mod utils;

#[cfg(test)]
mod testing;

use crate::backend::s3::{S3Connection, S3ObjectStore, S3SinkProvider};
use crate::backend::{MetadataIndex, ObjectStore, ObjectStoreIndex, SinkProvider};
use crate::config::{AppConfig, HttpServerConfig};
use crate::export::ExportOrchestrator;
use crate::operations::OperationRunner;
use crate::retrieve::RetrievePipeline;
use crate::transcoding::{Codec, DicomCodec};
use axum::extract::{DefaultBodyLimit, Request};
use axum::response::Response;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace;
use tracing::{error, info, level_filters::LevelFilter, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn init_logger(level: tracing::Level) {
	tracing_subscriber::registry()
		.with(
			tracing_subscriber::fmt::layer()
				.compact()
				.with_ansi(true)
				.with_file(false)
				.with_line_number(false)
				.with_target(false),
		)
		.with(
			EnvFilter::builder()
				.with_default_directive(LevelFilter::from_level(level).into())
				.from_env_lossy(),
		)
		.with(sentry::integrations::tracing::layer())
		.init();
}

#[derive(Clone)]
pub struct AppState {
	pub config: AppConfig,
	/// The bucket all uploaded instances are stored in.
	pub archive: Arc<dyn ObjectStore>,
	pub retrieve: Arc<RetrievePipeline>,
	pub operations: OperationRunner,
}

impl AppState {
	pub fn new(
		config: AppConfig,
		archive: Arc<dyn ObjectStore>,
		index: Arc<dyn MetadataIndex>,
		codec: Arc<dyn Codec>,
		sinks: Arc<dyn SinkProvider>,
	) -> Self {
		let retrieve = RetrievePipeline::new(
			Arc::clone(&archive),
			Arc::clone(&index),
			codec,
			config.retrieve.concurrency,
		);
		let orchestrator = ExportOrchestrator::new(
			Arc::clone(&archive),
			index,
			sinks,
			config.export.concurrency,
			config.export.batch_size,
		);
		let operations = OperationRunner::new(Arc::new(orchestrator), config.export.max_attempts);

		Self {
			config,
			archive,
			retrieve: Arc::new(retrieve),
			operations,
		}
	}
}

fn init_sentry(config: &AppConfig) -> sentry::ClientInitGuard {
	let guard = sentry::init((
		// An empty string will disable Sentry
		config.telemetry.sentry.as_deref().unwrap_or_default(),
		sentry::ClientOptions {
			release: sentry::release_name!(),
			traces_sample_rate: 1.0,
			..Default::default()
		},
	));

	if let Some(dsn) = &config.telemetry.sentry {
		info!(dsn, "Enabled Sentry for tracing and error tracking");
	}

	guard
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
	let config = AppConfig::new()?;
	init_logger(config.telemetry.level);

	// Manually create the Tokio runtime because the Sentry client needs to be created *before* the
	// Tokio runtime, which prevents us from using the #[tokio::main] macro.
	// See https://docs.sentry.io/platforms/rust/#async-main-function
	let _sentry = init_sentry(&config);

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?
		.block_on(async move {
			if let Err(error) = run(config).await {
				error!("Failed to start application due to error: {error}");
			}
		});
	Ok(())
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
	let archive: Arc<dyn ObjectStore> =
		Arc::new(S3ObjectStore::connect(S3Connection::from(&config.storage)).await);
	let index: Arc<dyn MetadataIndex> = Arc::new(ObjectStoreIndex::new(Arc::clone(&archive)));

	let app_state = AppState::new(
		config.clone(),
		archive,
		index,
		Arc::new(DicomCodec),
		Arc::new(S3SinkProvider),
	);

	let app = api::routes(&config.server.http.base_path)
		.layer(CorsLayer::permissive())
		.layer(axum::middleware::from_fn(add_common_headers))
		.layer(
			tower_http::trace::TraceLayer::new_for_http()
				.make_span_with(trace::DefaultMakeSpan::new().level(Level::INFO))
				.on_request(trace::DefaultOnRequest::new().level(Level::INFO))
				.on_response(trace::DefaultOnResponse::new().level(Level::INFO)),
		)
		.layer(DefaultBodyLimit::max(config.server.http.max_upload_size))
		.layer(TimeoutLayer::new(Duration::from_secs(
			config.server.http.request_timeout,
		)))
		.layer(ConcurrencyLimitLayer::new(
			config.server.http.max_concurrent_requests,
		))
		.with_state(app_state);

	let HttpServerConfig {
		interface: host,
		port,
		..
	} = config.server.http;
	let addr = SocketAddr::from((host, port));
	let listener = TcpListener::bind(addr).await?;

	info!("Started DICOMweb server on http://{addr}");
	if config.server.http.graceful_shutdown {
		axum::serve(listener, app)
			.with_graceful_shutdown(shutdown_signal())
			.await?;
	} else {
		axum::serve(listener, app).await?;
	}

	Ok(())
}

async fn shutdown_signal() {
	let ctrl_c = async {
		if let Err(err) = signal::ctrl_c().await {
			error!("Failed to listen for Ctrl+C: {err}");
			std::future::pending::<()>().await;
		}
	};

	#[cfg(unix)]
	let terminate = async {
		match signal::unix::signal(signal::unix::SignalKind::terminate()) {
			Ok(mut terminate) => {
				terminate.recv().await;
			}
			Err(err) => {
				error!("Failed to listen for SIGTERM: {err}");
				std::future::pending::<()>().await;
			}
		}
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		() = ctrl_c => {},
		() = terminate => {},
	}
	info!("Shutting down");
}

async fn add_common_headers(req: Request, next: axum::middleware::Next) -> Response {
	let mut response = next.run(req).await;
	let server_name = concat!("dicom-archive/", env!("CARGO_PKG_VERSION"));
	let headers = response.headers_mut();
	headers.insert("Server", axum::http::HeaderValue::from_static(server_name));
	response
}
