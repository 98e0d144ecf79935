// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Classified failures of archive requests

use std::path::PathBuf;
use std::process::ExitStatus;

use hyper::StatusCode;
use tracing::{error, info, warn};

use crate::response::{self, ErrResponse};

/// Everything that can go wrong while serving an archive.
///
/// Failures detected before the response is committed ([`BadRequest`](Self::BadRequest),
/// [`NotFound`](Self::NotFound), [`ShuttingDown`](Self::ShuttingDown),
/// [`Spawn`](Self::Spawn)) become ordinary error responses. Anything that happens after the
/// 200 has been sent can only truncate the download.
#[derive(thiserror::Error, Debug)]
pub enum ArchiveError {
    /// The archive identifier in the URL can't name a directory.
    #[error("malformed archive identifier {0:?}")]
    BadRequest(String),
    /// The resolved directory doesn't exist.
    #[error("directory not found: {}", .0.display())]
    NotFound(PathBuf),
    /// The server stopped accepting new archive sessions.
    #[error("server is shutting down")]
    ShuttingDown,
    /// The session was canceled before the archive was complete.
    #[error("archive request was aborted")]
    Aborted,
    /// The client went away before the archive was complete.
    #[error("client closed the connection")]
    ClientDisconnected,
    /// The archiver could not be started.
    #[error("could not start archiver {program:?}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    /// The archiver exited unsuccessfully.
    #[error("archiver exited with {status}: {stderr}")]
    ArchiverFailed { status: ExitStatus, stderr: String },
    /// Reading from or reaping the archiver failed.
    #[error("archiver I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ArchiveError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) | Self::ClientDisconnected => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Self::Aborted | Self::Spawn { .. } | Self::ArchiverFailed { .. } | Self::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Short message that is safe to show to clients.
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "Malformed archive address",
            Self::NotFound(_) => "The archive does not exist or has been deleted",
            Self::ShuttingDown => "The server is shutting down, please retry later",
            Self::Aborted => "The request was aborted",
            Self::ClientDisconnected => "The client closed the connection",
            Self::Spawn { .. } | Self::ArchiverFailed { .. } | Self::Io(_) => {
                "Internal server error"
            }
        }
    }

    /// Logs this error at a severity matching its class.
    pub fn log(&self) {
        match self {
            Self::BadRequest(_) => warn!("Request error: {self}"),
            Self::NotFound(_) => warn!("{self}"),
            Self::ShuttingDown => warn!("Refusing archive request: {self}"),
            Self::Aborted => warn!("The request was aborted"),
            Self::ClientDisconnected => info!("The client terminated the connection"),
            Self::Spawn { .. } | Self::ArchiverFailed { .. } | Self::Io(_) => {
                error!("Archive error: {self}")
            }
        }
    }
}

impl From<ArchiveError> for ErrResponse {
    fn from(err: ArchiveError) -> Self {
        ErrResponse(response::text(err.status(), err.public_message()))
    }
}
