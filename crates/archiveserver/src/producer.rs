// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Runs the external archiver and reads its output in fixed-size chunks

use std::num::NonZeroUsize;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::ArchiveError;

/// How much of the archiver's stderr is kept for error reports.
const STDERR_TAIL: usize = 4096;

/// `zip` exits with this when it was given nothing to compress.
const ZIP_NOTHING_TO_DO: i32 = 12;

/// Which program produces the archive, and how it's invoked.
///
/// The program runs inside the directory being archived and must write the archive to stdout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiverCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Non-zero exit code meaning "empty input"; only accepted if nothing was written.
    pub empty_exit_code: Option<i32>,
}

impl ArchiverCommand {
    /// `<program> -r - .`, i.e. recursive zip of the working directory to stdout.
    pub fn zip(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: ["-r", "-", "."].map(String::from).to_vec(),
            empty_exit_code: Some(ZIP_NOTHING_TO_DO),
        }
    }
}

impl Default for ArchiverCommand {
    fn default() -> Self {
        Self::zip("zip")
    }
}

/// One running archiver, exposed as an ordered, single-pass sequence of chunks.
///
/// Every chunk except the last is exactly `chunk_size` bytes. Once [`next_chunk`](Self::next_chunk)
/// has returned `Ok(None)` or an error, the sequence is over.
///
/// The owner must call [`close`](Self::close) when done, whatever the reason, which kills the
/// archiver if it's still running and waits for it to exit. Dropping without closing still kills
/// the process, but nothing waits for it.
pub struct ArchiveProducer {
    child: Child,
    stdout: ChildStdout,
    stderr: Option<JoinHandle<Vec<u8>>>,
    chunk_size: usize,
    bytes_read: u64,
    done: bool,
    empty_exit_code: Option<i32>,
}

impl ArchiveProducer {
    /// Start archiving `dir`.
    pub fn spawn(
        archiver: &ArchiverCommand,
        dir: &Path,
        chunk_size: NonZeroUsize,
    ) -> Result<Self, ArchiveError> {
        let spawn_err = |source| ArchiveError::Spawn {
            program: archiver.program.clone(),
            source,
        };
        let mut child = Command::new(&archiver.program)
            .args(&archiver.args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_err)?;

        let missing =
            |stream: &str| spawn_err(std::io::Error::other(format!("no {stream} pipe")));
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        debug!(
            "Spawned {} (pid {:?}) in {}",
            archiver.program,
            child.id(),
            dir.display()
        );

        Ok(Self {
            child,
            stdout,
            // Drained concurrently so a chatty archiver can't stall on a full pipe.
            stderr: Some(tokio::task::spawn(drain_stderr(stderr))),
            chunk_size: chunk_size.get(),
            bytes_read: 0,
            done: false,
            empty_exit_code: archiver.empty_exit_code,
        })
    }

    /// OS process id, while the archiver hasn't been reaped.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Read the next chunk.
    ///
    /// End of stream is only concluded after a read returns no data, at which point the archiver
    /// is waited on and its exit status checked, so a failing archiver can't pass off a
    /// truncated archive as complete.
    ///
    /// # Cancel Safety
    ///
    /// Not cancel safe: partially read chunk data is lost. Cancel only when abandoning the
    /// sequence.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, ArchiveError> {
        if self.done {
            return Ok(None);
        }

        let mut chunk = vec![0; self.chunk_size];
        let mut filled = 0;
        while filled < chunk.len() {
            let read = match self.stdout.read(&mut chunk[filled..]).await {
                Ok(read) => read,
                Err(err) => {
                    self.done = true;
                    return Err(err.into());
                }
            };
            if read == 0 {
                self.done = true;
                self.check_exit().await?;
                break;
            }
            filled += read;
            self.bytes_read += read as u64;
        }

        if filled == 0 {
            return Ok(None);
        }
        chunk.truncate(filled);
        Ok(Some(Bytes::from(chunk)))
    }

    /// Waits for the archiver that just closed its stdout, and checks how it exited.
    async fn check_exit(&mut self) -> Result<(), ArchiveError> {
        let status = self.child.wait().await?;
        let nothing_to_do = self.bytes_read == 0 && status.code() == self.empty_exit_code;
        if status.success() || nothing_to_do {
            debug!("Archiver finished with {status} after {} bytes", self.bytes_read);
            return Ok(());
        }
        let stderr = match self.stderr.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => vec![],
        };
        Err(ArchiveError::ArchiverFailed {
            status,
            stderr: String::from_utf8_lossy(&stderr).trim().to_owned(),
        })
    }

    /// Ends the archiver's lifetime: kills it if it's still running, then waits for it to exit.
    pub async fn close(mut self) -> std::io::Result<ExitStatus> {
        if let Some(stderr) = self.stderr.take() {
            stderr.abort();
        }
        if let Some(status) = self.child.try_wait()? {
            return Ok(status);
        }
        debug!("Killing archiver (pid {:?})", self.child.id());
        // `kill` also waits, so the process is reaped once this returns.
        self.child.kill().await?;
        self.child.wait().await
    }
}

/// Reads stderr to the end, keeping only the last [`STDERR_TAIL`] bytes.
async fn drain_stderr(mut stderr: ChildStderr) -> Vec<u8> {
    let mut tail = Vec::new();
    let mut buf = [0; 1024];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => return tail,
            Ok(read) => {
                tail.extend_from_slice(&buf[..read]);
                if tail.len() > STDERR_TAIL {
                    tail.drain(..tail.len() - STDERR_TAIL);
                }
            }
        }
    }
}
