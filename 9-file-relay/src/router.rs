//! Routing of frames read from one session.
//!
//! Text frames are control messages addressed to a peer by username. Binary
//! frames are file chunks and only make sense after a `file-start`; the
//! sending session's [`TransferState`] ties them to their recipient.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::{
    config::RelayConfig,
    message::{IncomingFile, MessageKind, ServerEvent, TransferMessage},
    peer::{ConnectionId, Frame, PeerError, PeerHandle},
    registry::Registry,
};

/// Per-session bookkeeping for an in-progress file relay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TransferState {
    #[default]
    Idle,
    ActiveTransfer {
        peer: String,
        peer_id: ConnectionId,
        chunks_seen: u64,
        bytes_seen: u64,
    },
}

impl TransferState {
    pub fn is_idle(&self) -> bool {
        matches!(self, TransferState::Idle)
    }

    fn record_chunk(&mut self, len: usize) -> Option<(u64, u64)> {
        match self {
            TransferState::Idle => None,
            TransferState::ActiveTransfer {
                chunks_seen,
                bytes_seen,
                ..
            } => {
                *chunks_seen += 1;
                *bytes_seen += len as u64;
                Some((*chunks_seen, *bytes_seen))
            }
        }
    }
}

/// A frame read from a client socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
}

/// The admitted session a frame came from.
#[derive(Debug, Clone)]
pub struct Origin {
    pub username: String,
    pub handle: PeerHandle,
}

pub struct Router {
    registry: Arc<Registry>,
    config: RelayConfig,
}

impl Router {
    pub fn new(registry: Arc<Registry>, config: RelayConfig) -> Self {
        Self { registry, config }
    }

    /// Routes one inbound frame.
    ///
    /// Problems with the recipient are reported to the sender and never fail
    /// the call; an error means the sender's own connection is gone.
    pub async fn route(
        &self,
        origin: &Origin,
        state: &mut TransferState,
        inbound: Inbound,
    ) -> Result<(), PeerError> {
        match inbound {
            Inbound::Text(text) => self.route_text(origin, state, &text).await,
            Inbound::Binary(chunk) => self.relay_chunk(origin, state, chunk).await,
        }
    }

    async fn route_text(
        &self,
        origin: &Origin,
        state: &mut TransferState,
        text: &str,
    ) -> Result<(), PeerError> {
        let message: TransferMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(error) => {
                warn!(username = %origin.username, %error, "skipping malformed message");
                return Ok(());
            }
        };

        match message.kind() {
            MessageKind::ConnectionRequest => {
                self.notify(origin, &ServerEvent::error("already connected"))
                    .await
            }
            MessageKind::FileStart => self.start_transfer(origin, state, message).await,
            MessageKind::FileEnd => self.finish_transfer(origin, state, message).await,
            MessageKind::Forward => self.forward(origin, message).await,
        }
    }

    async fn forward(&self, origin: &Origin, mut message: TransferMessage) -> Result<(), PeerError> {
        if message.to.is_empty() {
            warn!(username = %origin.username, "skipping message without a recipient");
            return Ok(());
        }

        let Some(recipient) = self.registry.lookup(&message.to) else {
            info!(username = %origin.username, to = %message.to, "recipient is not online");
            return self
                .notify(origin, &ServerEvent::recipient_offline(&message.to))
                .await;
        };

        message.from = origin.username.clone();
        if let Err(error) = self.deliver(&recipient, &message).await {
            warn!(username = %origin.username, to = %message.to, %error, "failed to forward message");
            self.evict(&message.to, &recipient);
            return self
                .notify(origin, &ServerEvent::recipient_offline(&message.to))
                .await;
        }
        Ok(())
    }

    async fn start_transfer(
        &self,
        origin: &Origin,
        state: &mut TransferState,
        mut message: TransferMessage,
    ) -> Result<(), PeerError> {
        if message.to.is_empty() {
            warn!(username = %origin.username, "skipping file-start without a recipient");
            return Ok(());
        }

        let Some(recipient) = self.registry.lookup(&message.to) else {
            info!(username = %origin.username, to = %message.to, "file-start for offline user");
            return self
                .notify(origin, &ServerEvent::recipient_offline(&message.to))
                .await;
        };

        let metadata = message.file_metadata().unwrap_or_default();
        info!(
            from = %origin.username,
            to = %message.to,
            file = %metadata.name,
            size = metadata.size,
            "file transfer starting"
        );

        message.from = origin.username.clone();
        *state = TransferState::ActiveTransfer {
            peer: message.to.clone(),
            peer_id: recipient.id(),
            chunks_seen: 0,
            bytes_seen: 0,
        };

        let notice = ServerEvent::IncomingFile {
            content: IncomingFile {
                file_name: metadata.name,
                sender: origin.username.clone(),
            },
        };
        let delivered = match self.deliver(&recipient, &notice).await {
            Ok(()) => self.deliver(&recipient, &message).await,
            Err(error) => Err(error),
        };

        if let Err(error) = delivered {
            warn!(from = %origin.username, to = %message.to, %error, "failed to announce file");
            self.evict(&message.to, &recipient);
            *state = TransferState::Idle;
            return self
                .notify(origin, &ServerEvent::recipient_offline(&message.to))
                .await;
        }
        Ok(())
    }

    async fn finish_transfer(
        &self,
        origin: &Origin,
        state: &mut TransferState,
        mut message: TransferMessage,
    ) -> Result<(), PeerError> {
        let finished = std::mem::take(state);
        let (target, peer_id) = match &finished {
            TransferState::ActiveTransfer {
                peer,
                peer_id,
                chunks_seen,
                bytes_seen,
            } => {
                if !message.to.is_empty() && message.to != *peer {
                    warn!(
                        username = %origin.username,
                        tracked = %peer,
                        addressed = %message.to,
                        "file-end recipient differs from active transfer"
                    );
                }
                info!(
                    from = %origin.username,
                    to = %peer,
                    chunks = chunks_seen,
                    bytes = bytes_seen,
                    "file transfer complete"
                );
                (peer.clone(), Some(*peer_id))
            }
            TransferState::Idle => (message.to.clone(), None),
        };

        if target.is_empty() {
            warn!(username = %origin.username, "skipping file-end without a recipient");
            return Ok(());
        }

        let recipient = self
            .registry
            .lookup(&target)
            .filter(|handle| peer_id.is_none() || peer_id == Some(handle.id()));
        let Some(recipient) = recipient else {
            let event = match peer_id {
                Some(_) => ServerEvent::peer_left_transfer(&target),
                None => ServerEvent::recipient_offline(&target),
            };
            return self.notify(origin, &event).await;
        };

        message.from = origin.username.clone();
        message.to = target;
        if let Err(error) = self.deliver(&recipient, &message).await {
            warn!(from = %origin.username, to = %message.to, %error, "failed to forward file-end");
            self.evict(&message.to, &recipient);
            return self
                .notify(origin, &ServerEvent::recipient_offline(&message.to))
                .await;
        }
        Ok(())
    }

    async fn relay_chunk(
        &self,
        origin: &Origin,
        state: &mut TransferState,
        chunk: Vec<u8>,
    ) -> Result<(), PeerError> {
        let (peer, peer_id) = match state {
            TransferState::Idle => {
                warn!(
                    username = %origin.username,
                    bytes = chunk.len(),
                    "discarding binary frame outside a transfer"
                );
                return Ok(());
            }
            TransferState::ActiveTransfer { peer, peer_id, .. } => (peer.clone(), *peer_id),
        };

        let recipient = self
            .registry
            .lookup(&peer)
            .filter(|handle| handle.id() == peer_id);
        let Some(recipient) = recipient else {
            info!(from = %origin.username, to = %peer, "transfer target disconnected");
            *state = TransferState::Idle;
            return self
                .notify(origin, &ServerEvent::peer_left_transfer(&peer))
                .await;
        };

        let len = chunk.len();
        if let Err(error) = recipient
            .send(Frame::Binary(chunk), self.config.write_timeout)
            .await
        {
            warn!(from = %origin.username, to = %peer, %error, "failed to relay chunk");
            self.evict(&peer, &recipient);
            *state = TransferState::Idle;
            return self
                .notify(origin, &ServerEvent::peer_left_transfer(&peer))
                .await;
        }

        if let Some((chunks, bytes)) = state.record_chunk(len) {
            if self.config.progress_interval > 0 && chunks % self.config.progress_interval == 0 {
                info!(from = %origin.username, to = %peer, chunks, bytes, "transfer progress");
            }
        }
        Ok(())
    }

    async fn deliver<T>(&self, recipient: &PeerHandle, message: &T) -> Result<(), PeerError>
    where
        T: serde::Serialize,
    {
        recipient
            .send_json(message, self.config.write_timeout)
            .await
    }

    async fn notify(&self, origin: &Origin, event: &ServerEvent) -> Result<(), PeerError> {
        origin
            .handle
            .send_json(event, self.config.write_timeout)
            .await
    }

    /// Drops a recipient that could not be written to. Its own session notices
    /// the closed handle, tears down and re-broadcasts the roster.
    fn evict(&self, username: &str, handle: &PeerHandle) {
        handle.close();
        if self.registry.unregister_connection(username, handle.id()) {
            debug!(%username, "evicted unresponsive connection");
        }
    }
}
