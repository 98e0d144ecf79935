// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Response-related helpers

use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, StreamBody};
use hyper::body::Frame;
use hyper::header::{HeaderValue, CONTENT_DISPOSITION, CONTENT_TYPE};
use hyper::Response;
pub use hyper::StatusCode;

/// Holds a [`GenericResponse`], possibly wrapped in an [`ErrResponse`].
pub type ResponseResult = Result<GenericResponse, ErrResponse>;

/// Type-erased HTTP response
pub type GenericResponse = Response<BoxBody<Bytes, anyhow::Error>>;

/// An error that has already been rendered into a response.
///
/// [`ArchiveError`](crate::error::ArchiveError)s convert into this, so handlers can use `?`
/// for anything that fails before the response is committed.
pub struct ErrResponse(pub GenericResponse);

pub const ZIP_CONTENT_TYPE: &str = "application/zip";
pub const ZIP_DISPOSITION: &str = "attachment; filename=\"photos.zip\"";

/// Return an empty 200 response (used for CORS preflight requests).
pub fn empty() -> GenericResponse {
    let body = Empty::new().map_err(anyhow::Error::from).boxed();
    Response::new(body)
}

/// Return a [`GenericResponse`] with known content.
pub fn full(
    status: StatusCode,
    content_type: &'static str,
    content: impl ToString,
) -> GenericResponse {
    let body = content.to_string().map_err(anyhow::Error::from).boxed();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// Return a plain text response with known content.
pub fn text(status: StatusCode, content: impl ToString) -> GenericResponse {
    full(status, "text/plain; charset=utf-8", content)
}

/// Return an HTML page.
pub fn html(content: impl ToString) -> GenericResponse {
    full(StatusCode::OK, "text/html; charset=utf-8", content)
}

/// Return a plain text "404 not found" response with appropriate status code
pub fn not_found() -> GenericResponse {
    text(StatusCode::NOT_FOUND, "404 not found")
}

/// Return a streamed `photos.zip` download.
///
/// The status is 200 and can't change after this is handed to the transport; an error
/// produced by `chunks` aborts the transfer instead.
pub fn zip_stream<S>(chunks: S) -> GenericResponse
where
    S: Stream<Item = Result<Bytes, anyhow::Error>> + Send + Sync + 'static,
{
    let body = BodyExt::boxed(StreamBody::new(chunks.map_ok(Frame::data)));
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(ZIP_CONTENT_TYPE));
    headers.insert(CONTENT_DISPOSITION, HeaderValue::from_static(ZIP_DISPOSITION));
    response
}
