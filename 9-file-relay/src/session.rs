//! Per-connection lifecycle: admission, the serving read loop and teardown.

use std::{fmt::Display, sync::Arc, time::Duration};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::{
    broadcast::broadcast_roster,
    config::RelayConfig,
    message::{ClientRequest, ServerEvent},
    peer::{Frame, Outbox, PeerError, PeerHandle},
    registry::{RegisterError, Registry},
    router::{Inbound, Origin, Router, TransferState},
};

const USERNAME_TAKEN: &str = "username already taken";

/// Shared state handed to every connection.
pub struct Hub {
    registry: Arc<Registry>,
    router: Router,
    config: RelayConfig,
}

impl Hub {
    pub fn new(config: RelayConfig) -> Self {
        let registry = Arc::new(Registry::new());
        Self {
            router: Router::new(Arc::clone(&registry), config.clone()),
            registry,
            config,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub async fn broadcast_roster(&self) -> usize {
        broadcast_roster(&self.registry, self.config.write_timeout).await
    }

    /// Tells every connected client the server is going away and closes them.
    pub async fn shutdown(&self) {
        let notice = ServerEvent::error("server shutting down");
        for (username, handle) in self.registry.snapshot() {
            if let Err(error) = handle.send_json(&notice, self.config.write_timeout).await {
                debug!(%username, %error, "failed to deliver shutdown notice");
            }
            handle.close();
        }
    }
}

#[derive(Debug, Error)]
enum AdmissionError {
    #[error("connection closed before admission")]
    Disconnected,
    #[error("bad connection request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    UsernameTaken(#[from] RegisterError),
    #[error("failed to reply during admission: {0}")]
    Reply(#[from] PeerError),
}

/// Drives one upgraded WebSocket from admission to teardown.
pub async fn handle_socket(socket: WebSocket, hub: Arc<Hub>) {
    let (sink, stream) = socket.split();
    run_connection(sink, stream, hub).await;
}

pub async fn run_connection<Si, St, E>(sink: Si, mut stream: St, hub: Arc<Hub>)
where
    Si: Sink<Message> + Unpin + Send + 'static,
    Si::Error: Display,
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let (handle, outbox) = PeerHandle::channel(hub.config.outbound_capacity);
    let mut writer = tokio::spawn(write_frames(sink, outbox));

    match admit(&hub, &handle, &mut stream).await {
        Ok(username) => {
            let origin = Origin { username, handle };
            let transfer = serve(&hub, &origin, &mut stream).await;
            teardown(&hub, &origin, transfer).await;
        }
        Err(AdmissionError::Disconnected) => {
            debug!("connection closed before admission");
            handle.close();
        }
        Err(error) => {
            info!(%error, "connection rejected");
            handle.close();
        }
    }

    // Give queued replies a chance to flush; a peer that stopped reading is cut off.
    if timeout(hub.config.write_timeout, &mut writer).await.is_err() {
        writer.abort();
    }
}

async fn admit<St, E>(
    hub: &Hub,
    handle: &PeerHandle,
    stream: &mut St,
) -> Result<String, AdmissionError>
where
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let deadline = hub.config.write_timeout;
    let request = match next_data_frame(stream).await {
        Some(Message::Text(text)) => serde_json::from_str::<ClientRequest>(&text)
            .map_err(|error| error.to_string()),
        Some(_) => Err("expected a text connection request".to_string()),
        None => return Err(AdmissionError::Disconnected),
    };

    let username = match request {
        Ok(ClientRequest::ConnectionRequest { username }) if !username.trim().is_empty() => {
            username.trim().to_string()
        }
        Ok(_) => return Err(reject(handle, deadline, "username cannot be empty".into()).await),
        Err(reason) => return Err(reject(handle, deadline, reason).await),
    };

    if let Err(error) = hub.registry.register(&username, handle.clone()) {
        handle
            .send_json(
                &ServerEvent::ConnectionError {
                    error: USERNAME_TAKEN.to_string(),
                },
                deadline,
            )
            .await?;
        return Err(error.into());
    }

    if let Err(error) = handle
        .send_json(&ServerEvent::ConnectionSuccess, deadline)
        .await
    {
        hub.registry.unregister_connection(&username, handle.id());
        return Err(error.into());
    }

    info!(%username, "user connected");
    hub.broadcast_roster().await;
    Ok(username)
}

async fn reject(handle: &PeerHandle, deadline: Duration, reason: String) -> AdmissionError {
    if let Err(error) = handle.send_json(&ServerEvent::BadRequest, deadline).await {
        return error.into();
    }
    AdmissionError::BadRequest(reason)
}

/// Reads until a text or binary frame arrives; `None` on close or read error.
async fn next_data_frame<St, E>(stream: &mut St) -> Option<Message>
where
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    loop {
        match stream.next().await? {
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => return None,
            Ok(message) => return Some(message),
            Err(error) => {
                debug!(%error, "read failed");
                return None;
            }
        }
    }
}

async fn serve<St, E>(hub: &Hub, origin: &Origin, stream: &mut St) -> TransferState
where
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let mut transfer = TransferState::Idle;

    loop {
        let message = tokio::select! {
            _ = origin.handle.closed() => {
                debug!(username = %origin.username, "connection closed by relay");
                break;
            }
            message = next_data_frame(stream) => message,
        };

        let inbound = match message {
            Some(Message::Text(text)) => Inbound::Text(text),
            Some(Message::Binary(bytes)) => Inbound::Binary(bytes),
            Some(_) => continue,
            None => break,
        };

        if let Err(error) = hub.router.route(origin, &mut transfer, inbound).await {
            debug!(username = %origin.username, %error, "own connection failed");
            break;
        }
    }

    transfer
}

async fn teardown(hub: &Hub, origin: &Origin, transfer: TransferState) {
    if let TransferState::ActiveTransfer {
        peer,
        chunks_seen,
        bytes_seen,
        ..
    } = transfer
    {
        info!(
            from = %origin.username,
            to = %peer,
            chunks = chunks_seen,
            bytes = bytes_seen,
            "sender left mid-transfer"
        );
    }

    hub.registry
        .unregister_connection(&origin.username, origin.handle.id());
    origin.handle.close();
    info!(username = %origin.username, "user disconnected");
    hub.broadcast_roster().await;
}

async fn write_frames<Si>(mut sink: Si, mut outbox: Outbox)
where
    Si: Sink<Message> + Unpin,
    Si::Error: Display,
{
    while let Some(frame) = outbox.next().await {
        let (message, last) = match frame {
            Frame::Text(text) => (Message::Text(text), false),
            Frame::Binary(bytes) => (Message::Binary(bytes), false),
            Frame::Close => (Message::Close(None), true),
        };

        let sent = tokio::select! {
            result = sink.send(message) => result,
            _ = outbox.cancelled() => break,
        };
        if let Err(error) = sent {
            debug!(%error, "socket write failed");
            break;
        }
        if last {
            break;
        }
    }
    // Dropping the outbox marks the handle closed for every holder.
}
