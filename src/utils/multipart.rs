use crate::lazy::TransformOutcome;
use crate::retrieve::RetrieveItem;
use axum::extract::{FromRequest, Request};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::RequestExt;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::warn;

/// This uses the `multer` crate (just like axum with the `multipart` feature enabled) to parse
/// request bodies to DICOM files.
/// `axum::extract::Multipart` cannot be used because the Content-Type is not multipart/form-data.
pub struct DicomMultipart<'a>(multer::Multipart<'a>);

impl<'a> DicomMultipart<'a> {
	/// This implementation is based on [`multer::parse_boundary`],
	/// but with multipart/related instead of multipart/form-data.
	fn parse_boundary(content_type: &str) -> Result<String, DicomMultipartRejection> {
		let mime = content_type
			.parse::<mime::Mime>()
			.map_err(|_| DicomMultipartRejection::NotMultipartRelated)?;

		if !(mime.type_() == mime::MULTIPART && mime.subtype().as_str() == "related") {
			return Err(DicomMultipartRejection::NotMultipartRelated);
		}

		// the root type is optional, but if present it must be application/dicom
		let root_type = mime
			.params()
			.find(|(name, _)| name.as_str() == "type")
			.map(|(_, value)| value.as_str().trim_matches('"').to_owned());
		if root_type.is_some_and(|root_type| root_type != "application/dicom") {
			return Err(DicomMultipartRejection::UnsupportedType);
		}

		mime.get_param(mime::BOUNDARY)
			.map(|name| name.as_str().to_owned())
			.ok_or(DicomMultipartRejection::InvalidBoundary)
	}

	/// See [`multer::Multipart::next_field`]
	pub async fn next_field(&mut self) -> multer::Result<Option<multer::Field<'a>>> {
		self.0.next_field().await
	}
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DicomMultipartRejection {
	NotMultipartRelated,
	UnsupportedType,
	InvalidBoundary,
}

impl IntoResponse for DicomMultipartRejection {
	fn into_response(self) -> Response {
		match self {
			Self::NotMultipartRelated => (
				StatusCode::UNSUPPORTED_MEDIA_TYPE,
				"Expected a `multipart/related` request",
			)
				.into_response(),
			Self::UnsupportedType => (
				StatusCode::UNSUPPORTED_MEDIA_TYPE,
				"Only `application/dicom` parts are accepted",
			)
				.into_response(),
			Self::InvalidBoundary => (
				StatusCode::BAD_REQUEST,
				"Invalid `boundary` for `multipart/related` request",
			)
				.into_response(),
		}
	}
}

impl<S> FromRequest<S> for DicomMultipart<'_>
where
	S: Send + Sync,
{
	type Rejection = DicomMultipartRejection;

	async fn from_request(request: Request, _state: &S) -> Result<Self, Self::Rejection> {
		let boundary = request
			.headers()
			.get(CONTENT_TYPE)
			.map(HeaderValue::to_str)
			.and_then(Result::ok)
			.ok_or(DicomMultipartRejection::NotMultipartRelated)
			.and_then(DicomMultipart::parse_boundary)?;

		let stream = request.with_limited_body().into_body();
		let multipart = multer::Multipart::new(stream.into_data_stream(), boundary);
		Ok(Self(multipart))
	}
}

/// Writes the parts of a retrieve response as a `multipart/related` body.
///
/// The content of a part is only produced when the body reaches it, so transcoding happens
/// while the response streams. Parts whose transform failed are written with an empty body.
pub struct DicomMultipartStream {
	inner: BoxStream<'static, Result<Bytes, Infallible>>,
}

impl DicomMultipartStream {
	pub fn new(boundary: String, media_type: &'static str, items: Vec<RetrieveItem>) -> Self {
		let stream = async_stream::stream! {
			for item in items {
				let content = item.content.content().await;
				if let Some(TransformOutcome::Failed { reason }) = item.content.outcome() {
					warn!(
						identifier = %item.identifier,
						frame = item.frame,
						reason,
						"Sending an empty part"
					);
				}

				let header = format!(
					"--{boundary}\r\nContent-Type: {media_type}; transfer-syntax={transfer_syntax}\r\nContent-Length: {length}\r\n\r\n",
					transfer_syntax = item.transfer_syntax,
					length = content.len(),
				);
				yield Ok::<_, Infallible>(Bytes::from(header));
				yield Ok(content);
				yield Ok(Bytes::from_static(b"\r\n"));
			}
			yield Ok(Bytes::from(format!("--{boundary}--\r\n")));
		};

		Self {
			inner: stream.boxed(),
		}
	}
}

impl Stream for DicomMultipartStream {
	type Item = Result<Bytes, Infallible>;

	fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
		self.inner.poll_next_unpin(cx)
	}
}
