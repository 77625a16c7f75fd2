//! Outbound side of a connection.
//!
//! Every connection owns a single writer task that drains an [`Outbox`]. Any
//! session that wants to write to that connection (its own session, or another
//! session relaying a message) goes through a cloned [`PeerHandle`], so frames
//! from concurrent writers are queued whole and never interleave on the socket.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio_util::sync::CancellationToken;

pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A frame waiting to be written to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("connection is closed")]
    Closed,
    #[error("recipient did not accept the frame within {0:?}")]
    Stalled(Duration),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct PeerHandle {
    id: ConnectionId,
    outbound: mpsc::Sender<Frame>,
    closed: CancellationToken,
}

impl PeerHandle {
    /// Creates a handle and the outbox its writer task drains.
    pub fn channel(capacity: usize) -> (PeerHandle, Outbox) {
        let (outbound, inbox) = mpsc::channel(capacity.max(1));
        let closed = CancellationToken::new();
        let handle = PeerHandle {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            outbound,
            closed: closed.clone(),
        };
        (handle, Outbox { inbox, closed })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection has been closed from either side.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub async fn send(&self, frame: Frame, deadline: Duration) -> Result<(), PeerError> {
        if self.is_closed() {
            return Err(PeerError::Closed);
        }

        match self.outbound.send_timeout(frame, deadline).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Closed(_)) => Err(PeerError::Closed),
            Err(SendTimeoutError::Timeout(_)) => Err(PeerError::Stalled(deadline)),
        }
    }

    pub async fn send_json<T>(&self, message: &T, deadline: Duration) -> Result<(), PeerError>
    where
        T: Serialize,
    {
        let encoded = serde_json::to_string(message)?;
        self.send(Frame::Text(encoded), deadline).await
    }

    /// Closes the connection after already-queued frames are written. If the
    /// queue is full the connection is torn down immediately instead.
    pub fn close(&self) {
        if self.is_closed() {
            return;
        }
        if self.outbound.try_send(Frame::Close).is_err() {
            self.closed.cancel();
        }
    }
}

/// Receiving end of a connection's outbound queue.
///
/// Dropping the outbox marks the connection closed, which stops the owning
/// session's read loop and makes further sends fail.
#[derive(Debug)]
pub struct Outbox {
    inbox: mpsc::Receiver<Frame>,
    closed: CancellationToken,
}

impl Outbox {
    /// Next frame to write, or `None` once the connection has been closed.
    pub async fn next(&mut self) -> Option<Frame> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            frame = self.inbox.recv() => frame,
        }
    }

    pub fn try_next(&mut self) -> Option<Frame> {
        self.inbox.try_recv().ok()
    }

    pub async fn cancelled(&self) {
        self.closed.cancelled().await
    }
}

impl Drop for Outbox {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEADLINE: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn frames_arrive_in_send_order() {
        let (handle, mut outbox) = PeerHandle::channel(8);
        handle
            .send(Frame::Text("first".into()), DEADLINE)
            .await
            .expect("queue text");
        handle
            .send(Frame::Binary(vec![1, 2, 3]), DEADLINE)
            .await
            .expect("queue binary");

        assert_eq!(outbox.next().await, Some(Frame::Text("first".into())));
        assert_eq!(outbox.next().await, Some(Frame::Binary(vec![1, 2, 3])));
    }

    #[tokio::test]
    async fn full_queue_reports_stall() {
        let (handle, _outbox) = PeerHandle::channel(1);
        handle
            .send(Frame::Binary(vec![0]), DEADLINE)
            .await
            .expect("first frame fits");

        let result = handle.send(Frame::Binary(vec![1]), DEADLINE).await;
        assert!(matches!(result, Err(PeerError::Stalled(_))));
    }

    #[tokio::test]
    async fn dropping_outbox_closes_handle() {
        let (handle, outbox) = PeerHandle::channel(4);
        drop(outbox);

        assert!(handle.is_closed());
        let result = handle.send(Frame::Text("late".into()), DEADLINE).await;
        assert!(matches!(result, Err(PeerError::Closed)));
    }

    #[tokio::test]
    async fn close_flushes_queued_frames_first() {
        let (handle, mut outbox) = PeerHandle::channel(4);
        handle
            .send(Frame::Text("bye".into()), DEADLINE)
            .await
            .expect("queue text");
        handle.close();

        assert_eq!(outbox.next().await, Some(Frame::Text("bye".into())));
        assert_eq!(outbox.next().await, Some(Frame::Close));
    }

    #[tokio::test]
    async fn close_on_full_queue_cancels_immediately() {
        let (handle, mut outbox) = PeerHandle::channel(1);
        handle
            .send(Frame::Binary(vec![0]), DEADLINE)
            .await
            .expect("fill queue");
        handle.close();

        assert!(handle.is_closed());
        assert_eq!(outbox.next().await, None);
    }

    #[test]
    fn handles_get_distinct_ids() {
        let (first, _a) = PeerHandle::channel(1);
        let (second, _b) = PeerHandle::channel(1);
        assert_ne!(first.id(), second.id());
    }
}
