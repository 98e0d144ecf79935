// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tools for preventing child tasks from outliving parents

use std::future::Future;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

/// Limits lifetimes of spawned tasks such as archive sessions and connections.
///
/// This is a minimal take on the nursery idea from
/// [Nathaniel J. Smith's "Notes on structured concurrency"][1]: tasks are spawned through a
/// [`NurseryHandle`], and [`Nursery::finish`] / [`Nursery::cancel`] only resolve once every one
/// of them has ended.
///
/// Unlike plain task abortion, cancellation is *cooperative*: each child receives a
/// [`CancellationToken`] and decides how to tear itself down. Archive sessions rely on this to
/// kill and reap their archiver before they end, which an aborted future could never do.
///
/// [1]: https://vorpus.org/blog/notes-on-structured-concurrency-or-go-statement-considered-harmful/
///
/// # Caveats
///
/// **BEWARE:** dropping a [`Nursery`] without calling [`finish`](Self::finish) or
/// [`cancel`](Self::cancel) blocks the current thread until children are gone, which only
/// works on multithreaded [`tokio`] runtimes.
pub struct Nursery {
    /// Tells children to tear themselves down
    canceled: CancellationToken,
    /// Tells handles to stop admitting children
    closed: CancellationToken,
    /// Cloned into children to hold `children_receiver` open while they exist
    children_sender: Option<mpsc::Sender<()>>,
    children_receiver: mpsc::Receiver<()>,
    finished: bool,
}

/// Indicates a [`Nursery`] no longer admits new children.
#[derive(Copy, Clone, Debug, PartialEq, thiserror::Error)]
#[error("nursery is closed")]
pub struct Closed;

/// Cheaply cloneable handle for spawning children into a [`Nursery`].
///
/// Handles don't keep the [`Nursery`] from finishing; only live children do.
#[derive(Clone)]
pub struct NurseryHandle {
    canceled: CancellationToken,
    closed: CancellationToken,
    children_sender: mpsc::WeakSender<()>,
}

/// A reserved slot for one child; obtained before acquiring resources the child will own.
pub struct ChildPermit {
    cancel: CancellationToken,
    children_sender: mpsc::Sender<()>,
}

impl Nursery {
    pub fn new() -> Self {
        let (children_sender, children_receiver) = mpsc::channel(1);
        Self {
            canceled: CancellationToken::new(),
            closed: CancellationToken::new(),
            children_sender: Some(children_sender),
            children_receiver,
            finished: false,
        }
    }

    pub fn handle(&self) -> NurseryHandle {
        NurseryHandle {
            canceled: self.canceled.clone(),
            closed: self.closed.clone(),
            children_sender: match &self.children_sender {
                Some(sender) => sender.downgrade(),
                // Only reachable during shutdown, where a dead handle is what we want anyway.
                None => mpsc::channel(1).0.downgrade(),
            },
        }
    }

    /// Stops admitting children, then waits for existing children to end on their own.
    pub async fn finish(mut self) {
        self.closed.cancel();
        self.children_sender = None; // Prevent deadlocking recv
        assert!(self.children_receiver.recv().await.is_none());
        self.finished = true;
    }

    /// Stops admitting children, asks existing ones to tear down, and waits until they have.
    pub async fn cancel(self) {
        self.canceled.cancel();
        self.finish().await
    }
}

impl Default for Nursery {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Nursery {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.closed.cancel();
        self.canceled.cancel();
        self.children_sender = None;
        // block_in_place offloads our worker thread's backlog so it can't contain the children
        // we're waiting for.
        tokio::task::block_in_place(|| assert!(self.children_receiver.blocking_recv().is_none()));
    }
}

impl NurseryHandle {
    /// Reserve a child slot, failing if the [`Nursery`] is shutting down.
    pub fn reserve(&self) -> Result<ChildPermit, Closed> {
        if self.closed.is_cancelled() {
            return Err(Closed);
        }
        let children_sender = self.children_sender.upgrade().ok_or(Closed)?;
        Ok(ChildPermit {
            cancel: self.canceled.child_token(),
            children_sender,
        })
    }
}

impl ChildPermit {
    /// Spawn `task` on the current runtime, in the current tracing span.
    ///
    /// `task` is handed the token it must watch for cancellation.
    pub fn spawn<F, Fut>(self, task: F) -> JoinHandle<Fut::Output>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        let Self {
            cancel,
            children_sender,
        } = self;
        let task = task(cancel);
        tokio::task::spawn(
            async move {
                let _children_sender = children_sender; // blocks children_receiver while it exists
                task.await
            }
            .instrument(Span::current()),
        )
    }
}
