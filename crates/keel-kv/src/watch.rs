//! # Watch Streams
//!
//! A watch delivers [`WatchEvent`]s for one key prefix. The stream owns its
//! registration in the store: dropping or closing it unregisters exactly once.
//!
//! Events are buffered in a bounded channel. When a slow reader lets the
//! buffer fill, further events are dropped and the next read yields a single
//! [`ChangeKind::Lagged`] event so the reader can resynchronize.

use crate::store::{ChangeKind, WatchEvent};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use tracing::debug;

/// Producer side of a watch, held by the store.
pub struct WatchSender {
    sender: mpsc::Sender<WatchEvent>,
    lagged: Arc<AtomicBool>,
}

impl WatchSender {
    /// Offer an event without blocking.
    ///
    /// Once the buffer has overflowed, events are dropped until the reader
    /// has taken the [`ChangeKind::Lagged`] marker, so nothing newer than the
    /// gap is delivered ahead of it.
    ///
    /// Returns `false` once the stream has been closed by its reader.
    pub fn offer(&self, event: WatchEvent) -> bool {
        if self.lagged.load(Ordering::Acquire) {
            return !self.sender.is_closed();
        }
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                if !self.lagged.swap(true, Ordering::AcqRel) {
                    debug!(key = %event.key, "Watch reader lagging, dropping events");
                }
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Whether the reader side is gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Releases a watch registration when dropped.
struct WatchGuard {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl WatchGuard {
    fn release(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Consumer side of a watch.
pub struct WatchStream {
    prefix: String,
    receiver: mpsc::Receiver<WatchEvent>,
    lagged: Arc<AtomicBool>,
    guard: WatchGuard,
}

impl WatchStream {
    /// Create a connected sender/stream pair.
    ///
    /// `cancel` runs exactly once, when the stream is closed or dropped; store
    /// implementations use it to drop their registration.
    pub fn channel<F>(prefix: impl Into<String>, buffer: usize, cancel: F) -> (WatchSender, Self)
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let lagged = Arc::new(AtomicBool::new(false));
        let stream = Self {
            prefix: prefix.into(),
            receiver,
            lagged: lagged.clone(),
            guard: WatchGuard {
                cancel: Some(Box::new(cancel)),
            },
        };
        (WatchSender { sender, lagged }, stream)
    }

    /// The watched prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Receive the next event.
    ///
    /// Returns `None` once the stream is closed and drained.
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        // While lagged the sender drops everything, so buffered events all
        // predate the gap.
        match self.receiver.try_recv() {
            Ok(event) => return Some(event),
            Err(mpsc::error::TryRecvError::Disconnected) => return self.take_lagged(),
            Err(mpsc::error::TryRecvError::Empty) => {}
        }
        if let Some(event) = self.take_lagged() {
            return Some(event);
        }
        self.receiver.recv().await
    }

    /// Receive an event if one is ready.
    pub fn try_recv(&mut self) -> Option<WatchEvent> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(_) => self.take_lagged(),
        }
    }

    /// Stop the watch. Safe to call more than once.
    pub fn close(&mut self) {
        self.receiver.close();
        self.guard.release();
    }

    fn take_lagged(&self) -> Option<WatchEvent> {
        if self.lagged.swap(false, Ordering::AcqRel) {
            Some(WatchEvent {
                key: self.prefix.clone(),
                kind: ChangeKind::Lagged,
                value: None,
                version: 0,
            })
        } else {
            None
        }
    }
}

impl Stream for WatchStream {
    type Item = WatchEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.receiver.poll_recv(cx) {
            Poll::Ready(Some(event)) => Poll::Ready(Some(event)),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => match self.take_lagged() {
                Some(event) => Poll::Ready(Some(event)),
                None => Poll::Pending,
            },
        }
    }
}

/// Handle to the single reader task of a watch.
///
/// Dropping the handle aborts the task, which drops the stream and releases
/// the watch registration.
pub struct WatchTask {
    prefix: String,
    handle: JoinHandle<()>,
}

impl WatchTask {
    /// The watched prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Whether the reader has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop the reader.
    pub fn abort(&self) {
        self.handle.abort();
    }
}

impl Drop for WatchTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Spawn the reader task for `stream`, calling `handler` for every event.
///
/// Must be called from within a Tokio runtime.
pub fn spawn_watch<F>(mut stream: WatchStream, mut handler: F) -> WatchTask
where
    F: FnMut(WatchEvent) + Send + 'static,
{
    let prefix = stream.prefix().to_string();
    let task_prefix = prefix.clone();
    let handle = tokio::spawn(async move {
        while let Some(event) = stream.recv().await {
            handler(event);
        }
        debug!(prefix = %task_prefix, "Watch stream ended");
    });
    WatchTask { prefix, handle }
}
