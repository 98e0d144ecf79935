// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Streams photo directories to browsers as ZIP archives, produced on the fly by an external
//! archiver and relayed in paced chunks.

pub mod error;
pub mod log;
pub mod nursery;
pub mod opts;
pub mod producer;
pub mod relay;
pub mod response;
pub mod router;
pub mod server;
pub mod signal;
pub mod state;

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub use opts::{Config, Opts};

use crate::nursery::Nursery;
use crate::server::Server;
use crate::signal::{fast_shutdown_requested, graceful_shutdown_requested};
use crate::state::ArchiveState;

/// Serve `config` until a shutdown signal arrives.
///
/// * The first `SIGINT` or `SIGTERM` ends every archive session (reaping its archiver), then
///   lets connections finish.
/// * A second signal stops immediately, though archivers are still reaped on the way out.
///
/// **BEWARE:** This permanently registers signal handlers, so it belongs near a program's
/// entry point. It also needs a multithreaded runtime.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let address = config.listen_address();
    let listener = TcpListener::bind(address)
        .await
        .with_context(|| format!("binding {address}"))?;
    info!("Listening on {address}");
    if !config.photos_dir.is_dir() {
        warn!(
            "Photos directory {} doesn't exist (yet); archives will 404",
            config.photos_dir.display()
        );
    }

    let connections = futures::stream::unfold(listener, |listener| async move {
        let accepted = listener.accept().await;
        Some((accepted, listener))
    });

    let sessions = Nursery::new();
    let server = Server::new(config.max_connections);
    let state = Arc::new(ArchiveState {
        config,
        sessions: sessions.handle(),
    });
    let serve = server.serve(connections, move |request, _| {
        router::respond(state.clone(), request)
    });

    let graceful_shutdown = async {
        graceful_shutdown_requested().await;
        info!("Graceful shutdown requested; ending archive sessions");
        // In-flight downloads would hold their connections open indefinitely otherwise.
        sessions.cancel().await;
        server.graceful_shutdown().await;
        futures::future::pending::<()>().await
    };

    tokio::select! {
        biased;
        _ = fast_shutdown_requested() => info!("Fast shutdown requested..."),
        () = graceful_shutdown => {}
        _ = serve => {}
    };

    Ok(())
}
