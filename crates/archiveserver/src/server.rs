// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! HTTP/1 connection handling with connection limits and graceful shutdown

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, Stream, StreamExt};
use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::service::{service_fn, HttpService};
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::select;
use tokio::sync::{watch, Semaphore};
use tokio::time::sleep;
use tracing::{error, info, info_span, warn, Instrument};

use crate::nursery::Nursery;
use crate::response::GenericResponse;

/// Errors that can end a connection
#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
    #[error("could not accept connection: {0}")]
    Accept(#[from] std::io::Error),
    #[error("too overloaded to serve {peer_addr}")]
    Overloaded { peer_addr: SocketAddr },
    #[error("error serving {peer_addr} connection: {source}")]
    Http {
        peer_addr: SocketAddr,
        source: hyper::Error,
    },
}

/// Serves HTTP connections while allowing for graceful shutdowns.
pub struct Server {
    open_connections: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
}

impl Server {
    /// `max_connections` is the number of simultaneous connections served before new ones
    /// get a minimal 503.
    pub fn new(max_connections: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            open_connections: Arc::new(Semaphore::new(max_connections)),
            shutdown,
        }
    }

    /// Serve incoming `connections` with `responder`, one task per connection.
    ///
    /// Resolves once [`graceful_shutdown`](Self::graceful_shutdown) has been called (or
    /// `connections` is exhausted) and every connection accepted here has ended. On shutdown,
    /// `connections` is dropped first so the listening socket is released early.
    ///
    /// # Cancel Safety
    ///
    /// Canceling abruptly closes every connection accepted by this call, and blocks until
    /// their tasks are gone.
    pub async fn serve<P, C, R, F>(&self, connections: P, responder: R)
    where
        P: Stream<Item = std::io::Result<(C, SocketAddr)>>,
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
        R: Fn(Request<Incoming>, SocketAddr) -> F + Clone + Send + Sync + 'static,
        F: Future<Output = GenericResponse> + Send,
    {
        let respond = move |request: Request<Incoming>, peer_addr| {
            let responder = responder.clone();
            async move {
                info!("Request: {} {}", request.method(), request.uri());
                let response = responder(request, peer_addr).await;
                info!("Response: {}", response.status());
                response
            }
        };

        // Held for the whole call, since graceful_shutdown waits for every receiver to go away.
        let mut shutdown_receiver = self.shutdown.subscribe();
        let mut was_shutdown = pin!(shutdown_receiver.wait_for(|&done| done).map(|_| None));

        let nursery = Nursery::new();
        let children = nursery.handle();
        info!("Started serving");

        {
            let mut connections = pin!(connections);
            loop {
                let accepted = select! {
                    // Never take another connection once shut down.
                    biased;
                    none = &mut was_shutdown => none,
                    accepted = connections.next() => accepted,
                };
                let Some(accepted) = accepted else {
                    break;
                };
                let (connection, peer_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        error!("{}", ConnectionError::from(err));
                        continue;
                    }
                };

                let Ok(child) = children.reserve() else {
                    break;
                };

                let connection_span = info_span!("connection", addr = %peer_addr);
                async {
                    info!("Connected.");
                    let Ok(permit) = self.open_connections.clone().try_acquire_owned() else {
                        warn!("Too overloaded; sending minimal 503.");
                        // Stalls accepting, but for at most a second.
                        let _ = respond_with_temporarily_unavailable(connection).await;
                        warn!("{}", ConnectionError::Overloaded { peer_addr });
                        return;
                    };

                    let respond = respond.clone();
                    let service =
                        service_fn(move |r| respond(r, peer_addr).map(Ok::<_, Infallible>));
                    let mut shutdown_receiver = self.shutdown.subscribe();
                    child.spawn(move |cancel| async move {
                        let _permit = permit;
                        let wants_shutdown = shutdown_receiver.wait_for(|&done| done);
                        let http_connection = http1::Builder::new()
                            .half_close(false)
                            .serve_connection(TokioIo::new(connection), service);
                        let http_connection =
                            with_graceful_shutdown(http_connection, wants_shutdown);

                        select! {
                            biased;
                            _ = cancel.cancelled() => info!("Connection canceled."),
                            result = http_connection => {
                                if let Err(source) = result {
                                    error!("{}", ConnectionError::Http { peer_addr, source });
                                }
                            }
                        }
                        info!("Disconnected.");
                    });
                }
                .instrument(connection_span)
                .await;
            }
        }

        nursery.finish().await;
        info!("Stopped serving");
    }

    /// Stop accepting connections and let existing ones finish their current request.
    ///
    /// Idle connections end immediately. Resolves once every [`serve`](Self::serve) call has
    /// returned; a response that never ends (such as a stalled download) keeps it pending, so
    /// whatever produces such responses should be shut down too.
    ///
    /// # Cancel Safety
    ///
    /// After this has been polled, canceling does not stop the shutdown.
    pub async fn graceful_shutdown(&self) {
        self.shutdown.send_replace(true);
        self.shutdown.closed().await;
    }
}

/// Cheaply responds to an HTTP/1 connection with a minimal 503.
///
/// The request isn't read at all, and a slow client gets at most a second.
async fn respond_with_temporarily_unavailable(
    mut connection: impl AsyncWriteExt + Unpin,
) -> std::io::Result<()> {
    let write_response = async {
        let msg = b"HTTP/1.1 503 Service Unavailable\r\n\
                    Content-Type: text/plain; charset=utf-8\r\n\
                    Content-Length: 22\r\n\
                    Connection: close\r\n\
                    \r\n\
                    Too many connections!\n";
        connection.write_all(msg).await?;
        connection.shutdown().await
    };
    select! {
        result = write_response => result,
        _ = sleep(Duration::from_secs(1)) => Err(std::io::ErrorKind::TimedOut.into()),
    }
}

/// Gracefully terminate `connection` once `want_shutdown` resolves.
async fn with_graceful_shutdown<I, S, B>(
    connection: http1::Connection<I, S>,
    want_shutdown: impl Future,
) -> Result<(), hyper::Error>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + 'static,
    S: HttpService<Incoming, ResBody = B>,
    S::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    B: Body + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    // Polling and graceful_shutdown both need the connection exclusively.
    let mut connection = pin!(connection);
    let mut want_shutdown = pin!(want_shutdown.fuse());
    std::future::poll_fn(|cx| {
        if want_shutdown.as_mut().poll(cx).is_ready() {
            connection.as_mut().graceful_shutdown();
        }
        connection.as_mut().poll(cx)
    })
    .await
}
