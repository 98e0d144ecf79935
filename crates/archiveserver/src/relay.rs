// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Relays archiver output to HTTP clients as streamed ZIP downloads

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

use crate::error::ArchiveError;
use crate::producer::ArchiveProducer;
use crate::response::{self, ResponseResult};
use crate::state::ArchiveState;

const MAX_ARCHIVE_HASH_LEN: usize = 128;

/// Serve the directory named by `archive_hash` as a streamed `photos.zip`.
///
/// Everything that can be checked before committing to a 200 is: the identifier, the
/// directory's existence, whether the server still takes new sessions, and whether the
/// archiver starts. The returned response streams whatever the session produces from then on.
pub async fn archive(state: &ArchiveState, archive_hash: &str) -> ResponseResult {
    start_archive(state, archive_hash).await.map_err(|err| {
        err.log();
        err.into()
    })
}

async fn start_archive(
    state: &ArchiveState,
    archive_hash: &str,
) -> Result<response::GenericResponse, ArchiveError> {
    let archive_hash = validate_archive_hash(archive_hash)?;
    let dir = resolve_archive_dir(&state.config.photos_dir, archive_hash).await?;

    let permit = state
        .sessions
        .reserve()
        .map_err(|_| ArchiveError::ShuttingDown)?;
    let producer = ArchiveProducer::spawn(
        &state.config.archiver_command(),
        &dir,
        state.config.chunk_size(),
    )?;
    let (session, body) = ArchiveSession::new(producer, state.config.pacing_delay());

    let span = info_span!("archive", hash = archive_hash);
    permit.spawn(|cancel| session.run(cancel).instrument(span));

    Ok(response::zip_stream(body))
}

/// Checks that `archive_hash` is a plain directory name.
///
/// Only ASCII letters, digits, `-` and `_` are allowed, which rules out anything that could
/// escape the photos directory.
pub fn validate_archive_hash(archive_hash: &str) -> Result<&str, ArchiveError> {
    let valid_char = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if archive_hash.is_empty()
        || archive_hash.len() > MAX_ARCHIVE_HASH_LEN
        || !archive_hash.chars().all(valid_char)
    {
        return Err(ArchiveError::BadRequest(archive_hash.to_owned()));
    }
    Ok(archive_hash)
}

/// Resolve an archive to its directory, which must currently exist.
pub async fn resolve_archive_dir(
    photos_dir: &Path,
    archive_hash: &str,
) -> Result<PathBuf, ArchiveError> {
    let dir = photos_dir.join(archive_hash);
    match tokio::fs::metadata(&dir).await {
        Ok(metadata) if metadata.is_dir() => Ok(dir),
        _ => Err(ArchiveError::NotFound(dir)),
    }
}

/// What a successful session delivered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub chunks: usize,
    pub bytes: u64,
}

/// One archiver paired with one response body.
pub struct ArchiveSession {
    producer: ArchiveProducer,
    chunks: mpsc::Sender<Bytes>,
    outcome: oneshot::Sender<anyhow::Result<()>>,
    delay: Duration,
}

impl ArchiveSession {
    /// Pair `producer` with a new response body.
    ///
    /// At most one chunk is buffered between the session and the body, so a slow client
    /// holds back the archiver instead of filling memory.
    pub fn new(producer: ArchiveProducer, delay: Duration) -> (Self, ArchiveBody) {
        let (chunks_tx, chunks_rx) = mpsc::channel(1);
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let session = Self {
            producer,
            chunks: chunks_tx,
            outcome: outcome_tx,
            delay,
        };
        let body = ArchiveBody {
            chunks: chunks_rx,
            outcome: Some(outcome_rx),
        };
        (session, body)
    }

    /// Relay every chunk to the body, pausing `delay` after each.
    ///
    /// Ends on exhaustion, on an archiver error, when the body is dropped (the client went
    /// away), or when `cancel` fires. In every case the archiver is killed if needed and reaped
    /// before this returns, and the body learns the outcome so a failure truncates the download
    /// instead of completing it.
    pub async fn run(self, cancel: CancellationToken) -> Result<SessionStats, ArchiveError> {
        let Self {
            mut producer,
            chunks,
            outcome,
            delay,
        } = self;
        info!("Streaming archive (archiver pid {:?})", producer.id());

        let mut stats = SessionStats::default();
        let relayed = relay_chunks(&mut producer, &chunks, delay, &cancel, &mut stats).await;

        let result = match (relayed, producer.close().await) {
            (Ok(()), Err(err)) => Err(err.into()),
            (relayed, Ok(status)) => {
                debug!("Archiver exited with {status}");
                relayed
            }
            (Err(err), Err(close_err)) => {
                error!("Unable to reap archiver: {close_err}");
                Err(err)
            }
        };

        drop(chunks);
        match result {
            Ok(()) => {
                info!(
                    "Archive sent: {} chunks, {} bytes",
                    stats.chunks, stats.bytes
                );
                let _ = outcome.send(Ok(()));
                Ok(stats)
            }
            Err(err) => {
                err.log();
                let _ = outcome.send(Err(anyhow::anyhow!("{err}")));
                Err(err)
            }
        }
    }
}

async fn relay_chunks(
    producer: &mut ArchiveProducer,
    chunks: &mpsc::Sender<Bytes>,
    delay: Duration,
    cancel: &CancellationToken,
    stats: &mut SessionStats,
) -> Result<(), ArchiveError> {
    loop {
        let chunk = select! {
            biased;
            _ = cancel.cancelled() => return Err(ArchiveError::Aborted),
            _ = chunks.closed() => return Err(ArchiveError::ClientDisconnected),
            chunk = producer.next_chunk() => chunk?,
        };
        let Some(chunk) = chunk else {
            return Ok(());
        };

        let len = chunk.len();
        select! {
            biased;
            _ = cancel.cancelled() => return Err(ArchiveError::Aborted),
            sent = chunks.send(chunk) => sent.map_err(|_| ArchiveError::ClientDisconnected)?,
        }
        stats.chunks += 1;
        stats.bytes += len as u64;
        debug!("Sent archive chunk {} ({len} bytes)", stats.chunks);

        if !delay.is_zero() {
            select! {
                biased;
                _ = cancel.cancelled() => return Err(ArchiveError::Aborted),
                _ = chunks.closed() => return Err(ArchiveError::ClientDisconnected),
                _ = sleep(delay) => {}
            }
        }
    }
}

/// Response body fed by an [`ArchiveSession`].
///
/// Yields chunks in order, then either ends cleanly or yields one error if the session failed
/// (or vanished) before the archive was complete. Dropping it tells the session the client
/// is gone.
pub struct ArchiveBody {
    chunks: mpsc::Receiver<Bytes>,
    outcome: Option<oneshot::Receiver<anyhow::Result<()>>>,
}

impl Stream for ArchiveBody {
    type Item = anyhow::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(chunk) = ready!(this.chunks.poll_recv(cx)) {
            return Poll::Ready(Some(Ok(chunk)));
        }
        let Some(outcome) = this.outcome.as_mut() else {
            return Poll::Ready(None);
        };
        let outcome = ready!(Pin::new(outcome).poll(cx));
        this.outcome = None;
        Poll::Ready(match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(Err(err)),
            Err(_) => Some(Err(anyhow::anyhow!("archive session ended unexpectedly"))),
        })
    }
}
