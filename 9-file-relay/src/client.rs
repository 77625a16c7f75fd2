//! Command-line clients: one that sends a file and one that saves incoming files.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use futures_util::{SinkExt, StreamExt};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
    time::timeout,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::{
    cli::{ReceiveArgs, SendArgs},
    message::{ClientRequest, FileMetadata, MessageKind, ServerEvent, TransferMessage},
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const ADMISSION_TIMEOUT: Duration = Duration::from_secs(5);
const FALLBACK_FILE_NAME: &str = "received.bin";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    pub chunks: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub path: PathBuf,
    pub sender: String,
    pub chunks: u64,
    pub bytes: u64,
}

/// Text frames a client can receive: relay events or messages relayed from a peer.
#[derive(Debug)]
enum Incoming {
    Event(ServerEvent),
    Relayed(TransferMessage),
}

fn parse_incoming(text: &str) -> Result<Incoming> {
    if let Ok(event) = serde_json::from_str::<ServerEvent>(text) {
        return Ok(Incoming::Event(event));
    }
    let message = serde_json::from_str::<TransferMessage>(text)
        .with_context(|| format!("unrecognised message: {text}"))?;
    Ok(Incoming::Relayed(message))
}

/// Connects and claims `username`, returning the admitted socket.
pub async fn connect_and_join(server: &str, username: &str) -> Result<Socket> {
    let (mut socket, _) = connect_async(server)
        .await
        .with_context(|| format!("failed to connect to {server}"))?;
    info!("connected to {server}");

    let request = ClientRequest::ConnectionRequest {
        username: username.to_string(),
    };
    socket
        .send(Message::Text(serde_json::to_string(&request)?))
        .await?;

    timeout(ADMISSION_TIMEOUT, await_admission(&mut socket))
        .await
        .context("timed out waiting for admission")??;
    Ok(socket)
}

async fn await_admission(socket: &mut Socket) -> Result<()> {
    while let Some(frame) = socket.next().await {
        let Message::Text(text) = frame? else {
            continue;
        };
        match serde_json::from_str::<ServerEvent>(&text) {
            Ok(ServerEvent::ConnectionSuccess) => return Ok(()),
            Ok(ServerEvent::ConnectionError { error }) => bail!("connection refused: {error}"),
            Ok(ServerEvent::BadRequest) => bail!("connection refused: bad request"),
            Ok(other) => debug!(?other, "ignoring message before admission"),
            Err(error) => debug!(%error, "ignoring unparseable message before admission"),
        }
    }
    bail!("connection closed before admission")
}

pub async fn send_file(args: SendArgs) -> Result<SendReport> {
    let mut file = File::open(&args.file)
        .await
        .with_context(|| format!("failed to open {}", args.file.display()))?;
    let size = file.metadata().await?.len();
    let metadata = FileMetadata {
        name: display_name(&args.file),
        content_type: args.content_type.clone(),
        size,
    };

    let mut socket = connect_and_join(&args.server, &args.username).await?;
    timeout(
        Duration::from_secs(args.wait_secs),
        wait_for_user(&mut socket, &args.to),
    )
    .await
    .map_err(|_| anyhow!("{} did not come online", args.to))??;

    let (mut sink, mut stream) = socket.split();
    let (errors_tx, mut errors_rx) = mpsc::unbounded_channel::<String>();
    let listener = tokio::spawn(async move {
        while let Some(Ok(frame)) = stream.next().await {
            let Message::Text(text) = frame else {
                continue;
            };
            if let Ok(Incoming::Event(ServerEvent::Error { message })) = parse_incoming(&text) {
                if errors_tx.send(message).is_err() {
                    break;
                }
            }
        }
    });

    let start = TransferMessage::file_start(&args.to, &metadata)?;
    sink.send(Message::Text(serde_json::to_string(&start)?))
        .await?;
    info!(to = %args.to, file = %metadata.name, size, "sending file");

    let mut report = SendReport { chunks: 0, bytes: 0 };
    let mut buffer = vec![0u8; args.chunk_size.max(1)];
    loop {
        if let Ok(message) = errors_rx.try_recv() {
            listener.abort();
            bail!("transfer aborted: {message}");
        }
        let read = read_chunk(&mut file, &mut buffer).await?;
        if read == 0 {
            break;
        }
        sink.send(Message::Binary(buffer[..read].to_vec())).await?;
        report.chunks += 1;
        report.bytes += read as u64;
    }

    let end = TransferMessage::file_end(&args.to);
    sink.send(Message::Text(serde_json::to_string(&end)?))
        .await?;
    info!(to = %args.to, chunks = report.chunks, bytes = report.bytes, "file sent");

    if let Err(error) = sink.close().await {
        debug!(%error, "failed to close socket cleanly");
    }
    listener.abort();
    Ok(report)
}

/// Fills `buffer` unless the file ends first, so every chunk but the last is full size.
async fn read_chunk(file: &mut File, buffer: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let read = file.read(&mut buffer[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}

async fn wait_for_user(socket: &mut Socket, username: &str) -> Result<()> {
    while let Some(frame) = socket.next().await {
        let Message::Text(text) = frame? else {
            continue;
        };
        match parse_incoming(&text) {
            Ok(Incoming::Event(ServerEvent::AllOnlineUsers { content })) => {
                if content.iter().any(|online| online == username) {
                    return Ok(());
                }
                debug!(online = ?content, "waiting for {username}");
            }
            Ok(Incoming::Event(ServerEvent::Error { message })) => bail!(message),
            Ok(_) => {}
            Err(error) => debug!(%error, "ignoring message"),
        }
    }
    bail!("connection closed while waiting for {username}")
}

struct InProgress {
    file: File,
    path: PathBuf,
    sender: String,
    chunks: u64,
    bytes: u64,
}

pub async fn receive_files(args: ReceiveArgs) -> Result<Vec<ReceivedFile>> {
    tokio::fs::create_dir_all(&args.out_dir)
        .await
        .with_context(|| format!("failed to create {}", args.out_dir.display()))?;
    let mut socket = connect_and_join(&args.server, &args.username).await?;
    info!(username = %args.username, "waiting for files");

    let mut received = Vec::new();
    let mut current: Option<InProgress> = None;

    while let Some(frame) = socket.next().await {
        match frame? {
            Message::Text(text) => match parse_incoming(&text) {
                Ok(Incoming::Event(event)) => log_event(event),
                Ok(Incoming::Relayed(message)) => match message.kind() {
                    MessageKind::FileStart => {
                        if let Some(abandoned) = current.take() {
                            warn!(path = %abandoned.path.display(), "previous file never finished");
                        }
                        current = Some(begin_file(&args.out_dir, &message).await?);
                    }
                    MessageKind::FileEnd => {
                        let Some(done) = current.take() else {
                            warn!(from = %message.from, "file-end without a file in progress");
                            continue;
                        };
                        let file = finish_file(done).await?;
                        info!(
                            path = %file.path.display(),
                            from = %file.sender,
                            chunks = file.chunks,
                            bytes = file.bytes,
                            "file received"
                        );
                        received.push(file);
                        if args.once {
                            break;
                        }
                    }
                    _ => info!(from = %message.from, message = %message.message, "message"),
                },
                Err(error) => debug!(%error, "ignoring message"),
            },
            Message::Binary(chunk) => match current.as_mut() {
                Some(progress) => {
                    progress.file.write_all(&chunk).await?;
                    progress.chunks += 1;
                    progress.bytes += chunk.len() as u64;
                }
                None => warn!(bytes = chunk.len(), "chunk without a file in progress"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    if let Err(error) = socket.close(None).await {
        debug!(%error, "failed to close socket cleanly");
    }
    Ok(received)
}

fn log_event(event: ServerEvent) {
    match event {
        ServerEvent::AllOnlineUsers { content } => info!(online = ?content, "roster"),
        ServerEvent::IncomingFile { content } => {
            info!(file = %content.file_name, from = %content.sender, "incoming file")
        }
        ServerEvent::Error { message } => warn!(%message, "relay error"),
        other => debug!(?other, "relay event"),
    }
}

async fn begin_file(out_dir: &Path, message: &TransferMessage) -> Result<InProgress> {
    let name = message
        .file_metadata()
        .map(|metadata| metadata.name)
        .unwrap_or_default();
    let path = out_dir.join(sanitize_file_name(&name));
    let file = File::create(&path)
        .await
        .with_context(|| format!("failed to create {}", path.display()))?;
    info!(path = %path.display(), from = %message.from, "receiving file");
    Ok(InProgress {
        file,
        path,
        sender: message.from.clone(),
        chunks: 0,
        bytes: 0,
    })
}

async fn finish_file(mut progress: InProgress) -> Result<ReceivedFile> {
    progress.file.flush().await?;
    Ok(ReceivedFile {
        path: progress.path,
        sender: progress.sender,
        chunks: progress.chunks,
        bytes: progress.bytes,
    })
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string())
}

/// Keeps only the final path component so a sender cannot write outside `out_dir`.
fn sanitize_file_name(name: &str) -> String {
    Path::new(name)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_hostile_file_names() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("report.pdf"), "report.pdf");
        assert_eq!(sanitize_file_name(""), FALLBACK_FILE_NAME);
        assert_eq!(sanitize_file_name(".."), FALLBACK_FILE_NAME);
    }

    #[test]
    fn distinguishes_events_from_relayed_messages() {
        let event = parse_incoming(r#"{"type":"all-online-users","content":["bob"]}"#)
            .expect("event");
        assert!(matches!(
            event,
            Incoming::Event(ServerEvent::AllOnlineUsers { .. })
        ));

        let relayed = parse_incoming(r#"{"to":"bob","from":"alice","message":"file-end"}"#)
            .expect("relayed");
        assert!(matches!(relayed, Incoming::Relayed(message) if message.kind() == MessageKind::FileEnd));
    }
}
