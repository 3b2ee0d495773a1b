//! Wire protocol between lock clients and the lock server.
//!
//! Every message is a JSON object `{"command": ..., "data": ...}`. Field names
//! are camelCase on the wire. `aquire` is spelled the way deployed peers spell it.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{Error, Result};

/// Seconds the server waits beyond the client's own deadline before reclaiming a slot.
///
/// The client's local timeout normally fires first; the server only reclaims on its own
/// when the client has vanished.
pub const SERVER_GRACE_SECS: u64 = 5;

/// Default `lock()` timeout in seconds.
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 30;

/// Named resource requiring exclusivity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockKey(String);

impl LockKey {
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for LockKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for LockKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Identifier of one lock attempt, generated by the client when `lock()` is called
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Generate a fresh random (v4 UUID) task id
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Payload of `aquire`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Aquire {
    pub lock_key: LockKey,
    pub task_id: TaskId,
    /// Server-side timeout in seconds, already including the grace buffer
    pub timeout: u64,
}

/// Payload of `done`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Done {
    pub task_id: TaskId,
    pub lock_key: LockKey,
}

/// One entry of `updateTaskSocket`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAnnouncement {
    pub task_id: TaskId,
    /// Whether the client is currently executing the user task
    pub is_doing: bool,
}

/// Payload of `toDo`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToDo {
    pub task_id: TaskId,
}

/// Messages sent by clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", content = "data")]
pub enum ClientMessage {
    #[serde(rename = "aquire")]
    Aquire(Aquire),
    #[serde(rename = "done")]
    Done(Done),
    #[serde(rename = "updateTaskSocket")]
    UpdateTaskSocket(Vec<TaskAnnouncement>),
}

impl ClientMessage {
    /// Wire name of the command
    #[must_use]
    pub const fn command(&self) -> &'static str {
        match self {
            Self::Aquire(_) => "aquire",
            Self::Done(_) => "done",
            Self::UpdateTaskSocket(_) => "updateTaskSocket",
        }
    }
}

/// Messages sent by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", content = "data")]
pub enum ServerMessage {
    #[serde(rename = "toDo")]
    ToDo(ToDo),
}

/// Encode a message as a frame payload
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(message).map_err(Error::from)
}

/// Longest payload prefix quoted in a decode error.
const QUOTED_PAYLOAD_BYTES: usize = 256;

/// Decode a frame payload. Unknown commands and malformed data are protocol errors.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(|e| {
        let quoted = &payload[..payload.len().min(QUOTED_PAYLOAD_BYTES)];
        let ellipsis = if payload.len() > QUOTED_PAYLOAD_BYTES { "..." } else { "" };
        Error::Protocol(format!(
            "unsupported message {}{ellipsis} ({} bytes): {e}",
            String::from_utf8_lossy(quoted),
            payload.len()
        ))
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_aquire_wire_shape() -> Result<()> {
        let msg = ClientMessage::Aquire(Aquire {
            lock_key: LockKey::new("orders"),
            task_id: TaskId::new("t-1"),
            timeout: 35,
        });
        let value: serde_json::Value = serde_json::from_slice(&encode(&msg)?)?;
        assert_eq!(
            value,
            json!({
                "command": "aquire",
                "data": { "lockKey": "orders", "taskId": "t-1", "timeout": 35 }
            })
        );
        Ok(())
    }

    #[test]
    fn test_update_task_socket_wire_shape() -> Result<()> {
        let msg = ClientMessage::UpdateTaskSocket(vec![TaskAnnouncement {
            task_id: TaskId::new("t-9"),
            is_doing: false,
        }]);
        let value: serde_json::Value = serde_json::from_slice(&encode(&msg)?)?;
        assert_eq!(
            value,
            json!({
                "command": "updateTaskSocket",
                "data": [{ "taskId": "t-9", "isDoing": false }]
            })
        );
        Ok(())
    }

    #[test]
    fn test_decode_to_do() -> Result<()> {
        let msg: ServerMessage = decode(br#"{"command":"toDo","data":{"taskId":"abc"}}"#)?;
        assert_eq!(
            msg,
            ServerMessage::ToDo(ToDo {
                task_id: TaskId::new("abc")
            })
        );
        Ok(())
    }

    #[test]
    fn test_decode_done_from_foreign_client() -> Result<()> {
        let msg: ClientMessage =
            decode(br#"{"command":"done","data":{"taskId":"abc","lockKey":"k"}}"#)?;
        assert_eq!(msg.command(), "done");
        Ok(())
    }

    #[test]
    fn test_unknown_command_is_protocol_error() {
        let result: Result<ServerMessage> = decode(br#"{"command":"explode","data":{}}"#);
        assert!(matches!(result, Err(Error::Protocol(_))));

        let result: Result<ClientMessage> = decode(br#"{"command":"toDo","data":{"taskId":"x"}}"#);
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[test]
    fn test_decode_error_quotes_only_a_prefix() {
        let mut payload = br#"{"command":"explode","data":""#.to_vec();
        payload.extend(std::iter::repeat(b'x').take(64 * 1024));
        payload.extend_from_slice(br#""}"#);

        let result: Result<ClientMessage> = decode(&payload);
        let Err(Error::Protocol(message)) = result else {
            panic!("expected protocol error");
        };
        assert!(message.len() < 1024, "error message is {} bytes", message.len());
        assert!(message.contains("explode"));
        assert!(message.contains(&format!("({} bytes)", payload.len())));
    }

    #[test]
    fn test_generated_task_ids_are_distinct() {
        let a = TaskId::generate();
        let b = TaskId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }
}
