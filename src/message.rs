/// Channel message and presence records.
///
/// Both record kinds travel inside a `ProtocolMessage` and are sparse
/// on the wire: `id`, `timestamp` and `connection_id` are synthesized
/// from the enclosing frame at read time when absent.

use serde::{Deserialize, Serialize};

use crate::error::ErrorInfo;

/// Wall-clock timestamp in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A single message published on a channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(rename = "clientId", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(rename = "connectionId", skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Message {
    pub fn new(name: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            name: Some(name.into()),
            data: Some(data),
            ..Default::default()
        }
    }

    /// Fill fields the wire frame elides: `id` becomes
    /// `{frame_id}:{index}`, timestamp and connection id come from the
    /// frame itself.
    pub fn populate_from_frame(
        &mut self,
        frame_id: &str,
        index: usize,
        frame_connection_id: Option<&str>,
        frame_timestamp: Option<i64>,
    ) {
        if self.id.is_none() {
            self.id = Some(format!("{}:{}", frame_id, index));
        }
        if self.connection_id.is_none() {
            self.connection_id = frame_connection_id.map(str::to_owned);
        }
        if self.timestamp.is_none() {
            self.timestamp = frame_timestamp;
        }
    }
}

/// Presence lifecycle action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
#[serde(into = "u8", try_from = "u8")]
pub enum PresenceAction {
    /// Member known absent (sync bookkeeping only, never emitted).
    Absent = 0,
    /// Member reported present by a SYNC page.
    Present = 1,
    Enter = 2,
    Leave = 3,
    Update = 4,
}

impl From<PresenceAction> for u8 {
    fn from(action: PresenceAction) -> Self {
        action as u8
    }
}

impl TryFrom<u8> for PresenceAction {
    type Error = ErrorInfo;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PresenceAction::Absent),
            1 => Ok(PresenceAction::Present),
            2 => Ok(PresenceAction::Enter),
            3 => Ok(PresenceAction::Leave),
            4 => Ok(PresenceAction::Update),
            other => Err(ErrorInfo::new(
                40000,
                400,
                format!("unknown presence action {}", other),
            )),
        }
    }
}

/// One member's presence event or sync record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub action: PresenceAction,
    #[serde(rename = "clientId", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(rename = "connectionId", skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl PresenceMessage {
    pub fn new(action: PresenceAction, client_id: impl Into<String>) -> Self {
        Self {
            id: None,
            action,
            client_id: Some(client_id.into()),
            connection_id: None,
            data: None,
            timestamp: None,
        }
    }

    /// Members are deduplicated by `clientId:connectionId`.
    pub fn member_key(&self) -> String {
        format!(
            "{}:{}",
            self.client_id.as_deref().unwrap_or(""),
            self.connection_id.as_deref().unwrap_or("")
        )
    }

    pub fn populate_from_frame(
        &mut self,
        frame_id: &str,
        index: usize,
        frame_connection_id: Option<&str>,
        frame_timestamp: Option<i64>,
    ) {
        if self.id.is_none() {
            self.id = Some(format!("{}:{}", frame_id, index));
        }
        if self.connection_id.is_none() {
            self.connection_id = frame_connection_id.map(str::to_owned);
        }
        if self.timestamp.is_none() {
            self.timestamp = frame_timestamp;
        }
    }
}
