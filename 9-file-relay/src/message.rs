use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const FILE_START: &str = "file-start";
pub const FILE_END: &str = "file-end";

/// First message a client must send after the socket opens.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientRequest {
    ConnectionRequest {
        #[serde(default)]
        username: String,
    },
}

/// Messages originated by the relay itself (as opposed to relayed peer messages).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    ConnectionSuccess,
    BadRequest,
    ConnectionError { error: String },
    AllOnlineUsers { content: Vec<String> },
    IncomingFile { content: IncomingFile },
    Error { message: String },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }

    pub fn recipient_offline(username: &str) -> Self {
        Self::error(format!("User {username} is not online."))
    }

    pub fn peer_left_transfer(username: &str) -> Self {
        Self::error(format!("User {username} disconnected during transfer."))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IncomingFile {
    pub file_name: String,
    pub sender: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileMetadata {
    pub name: String,
    #[serde(rename = "type", default)]
    pub content_type: String,
    #[serde(default)]
    pub size: u64,
}

/// Peer-to-peer control message. The relay only inspects `to`, `message` and,
/// for `file-start`, the payload; everything else is carried through verbatim.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TransferMessage {
    #[serde(default)]
    pub to: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub from: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    ConnectionRequest,
    FileStart,
    FileEnd,
    Forward,
}

impl TransferMessage {
    pub fn file_start(to: &str, metadata: &FileMetadata) -> serde_json::Result<Self> {
        Ok(Self {
            to: to.to_string(),
            message: FILE_START.to_string(),
            payload: Some(serde_json::to_value(metadata)?),
            ..Self::default()
        })
    }

    pub fn file_end(to: &str) -> Self {
        Self {
            to: to.to_string(),
            message: FILE_END.to_string(),
            ..Self::default()
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self.message.as_str() {
            FILE_START => MessageKind::FileStart,
            FILE_END => MessageKind::FileEnd,
            _ if self.extra.get("type").and_then(Value::as_str) == Some("connection-request") => {
                MessageKind::ConnectionRequest
            }
            _ => MessageKind::Forward,
        }
    }

    /// File metadata carried by a `file-start`, if the payload has that shape.
    pub fn file_metadata(&self) -> Option<FileMetadata> {
        self.payload
            .as_ref()
            .and_then(|payload| serde_json::from_value(payload.clone()).ok())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn server_events_use_kebab_case_tags() {
        let encoded = serde_json::to_value(ServerEvent::ConnectionSuccess).expect("encode");
        assert_eq!(encoded, json!({"type": "connection-success"}));

        let encoded = serde_json::to_value(ServerEvent::ConnectionError {
            error: "username already taken".into(),
        })
        .expect("encode");
        assert_eq!(
            encoded,
            json!({"type": "connection-error", "error": "username already taken"})
        );

        let encoded = serde_json::to_value(ServerEvent::IncomingFile {
            content: IncomingFile {
                file_name: "notes.txt".into(),
                sender: "alice".into(),
            },
        })
        .expect("encode");
        assert_eq!(
            encoded,
            json!({"type": "incoming-file", "content": {"fileName": "notes.txt", "sender": "alice"}})
        );
    }

    #[test]
    fn connection_request_requires_matching_tag() {
        let parsed: ClientRequest =
            serde_json::from_str(r#"{"type":"connection-request","username":"alice"}"#)
                .expect("valid request");
        assert_eq!(
            parsed,
            ClientRequest::ConnectionRequest {
                username: "alice".into()
            }
        );

        assert!(serde_json::from_str::<ClientRequest>(r#"{"type":"hello"}"#).is_err());
        assert!(serde_json::from_str::<ClientRequest>("not json").is_err());
    }

    #[test]
    fn classifies_transfer_messages() {
        let start: TransferMessage = serde_json::from_value(json!({
            "to": "bob",
            "message": "file-start",
            "payload": {"name": "a.bin", "type": "application/octet-stream", "size": 12}
        }))
        .expect("decode");
        assert_eq!(start.kind(), MessageKind::FileStart);
        assert_eq!(
            start.file_metadata(),
            Some(FileMetadata {
                name: "a.bin".into(),
                content_type: "application/octet-stream".into(),
                size: 12,
            })
        );

        let end: TransferMessage =
            serde_json::from_value(json!({"to": "bob", "message": "file-end"})).expect("decode");
        assert_eq!(end.kind(), MessageKind::FileEnd);

        let rejoin: TransferMessage =
            serde_json::from_value(json!({"type": "connection-request", "username": "x"}))
                .expect("decode");
        assert_eq!(rejoin.kind(), MessageKind::ConnectionRequest);

        let chat: TransferMessage =
            serde_json::from_value(json!({"to": "bob", "message": "hi"})).expect("decode");
        assert_eq!(chat.kind(), MessageKind::Forward);
    }

    #[test]
    fn unknown_fields_survive_reencoding() {
        let original = json!({"to": "bob", "message": "offer", "sdp": {"v": 0}});
        let decoded: TransferMessage = serde_json::from_value(original.clone()).expect("decode");
        let reencoded = serde_json::to_value(&decoded).expect("encode");
        assert_eq!(reencoded, original);
    }
}
