// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use hyper::{Method, Request, StatusCode};
use tracing::error;

use crate::response::{self, ErrResponse, GenericResponse};
use crate::state::ArchiveState;

/// Route a request to the index page or an archive download.
pub async fn respond<B>(state: Arc<ArchiveState>, request: Request<B>) -> GenericResponse {
    let method = request.method().clone();
    let path = request.uri().path();

    if path == "/" {
        return handle_get(&method, index_page(&state.config.index_page)).await;
    }
    match path.strip_prefix("/archive/").and_then(|rest| rest.strip_suffix('/')) {
        Some(archive_hash) => {
            let archive_hash = archive_hash.to_owned();
            handle_get(
                &method,
                handle_err(crate::relay::archive(&state, &archive_hash)),
            )
            .await
        }
        None => response::not_found(),
    }
}

async fn index_page(path: &Path) -> GenericResponse {
    match tokio::fs::read_to_string(path).await {
        Ok(page) => response::html(page),
        Err(err) => {
            error!("Unable to read index page {}: {err}", path.display());
            response::text(StatusCode::INTERNAL_SERVER_ERROR, "500 internal server error")
        }
    }
}

async fn handle_get(
    method: &Method,
    future: impl Future<Output = GenericResponse>,
) -> GenericResponse {
    match *method {
        Method::GET => future.await,
        Method::OPTIONS => response::empty(),
        _ => response::not_found(),
    }
}

async fn handle_err(
    future: impl Future<Output = Result<GenericResponse, ErrResponse>>,
) -> GenericResponse {
    match future.await {
        Ok(r) | Err(ErrResponse(r)) => r,
    }
}
