// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shutdown signal detection
//!
//! **BEWARE:** these permanently register signal handlers through [`tokio`], so they belong
//! near a program's entry point. Signals may only be seen after the first call, and several
//! may be collapsed into one.

use tokio::signal::ctrl_c;

/// Resolves on the first `SIGINT` or `SIGTERM`.
pub async fn shutdown_requested() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            result = ctrl_c() => result,
            _ = sigterm.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    ctrl_c().await
}

/// Resolves once a graceful shutdown has been requested.
///
/// If signals can't be watched at all, this never resolves rather than shutting down a server
/// nobody asked to stop.
pub async fn graceful_shutdown_requested() {
    if let Err(err) = shutdown_requested().await {
        tracing::error!("Unable to watch for shutdown signals: {err}");
        std::future::pending::<()>().await;
    }
}

/// Resolves once a second shutdown signal arrives, meaning the user is done waiting for the
/// graceful one.
pub async fn fast_shutdown_requested() {
    graceful_shutdown_requested().await;
    graceful_shutdown_requested().await;
}

// Signal handlers are process-global and permanent, so these are exercised by hand against the
// binary rather than in unit tests.
