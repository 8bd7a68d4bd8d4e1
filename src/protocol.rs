/// Wire frame definition and codec.
///
/// One `ProtocolMessage` is one frame on the transport. The binary
/// framing underneath is the transport's concern; this codec produces
/// and consumes the JSON body.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorInfo, RtError};
use crate::message::{Message, PresenceMessage};

/// Frame action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
#[serde(into = "u8", try_from = "u8")]
pub enum Action {
    Heartbeat = 0,
    Ack = 1,
    Nack = 2,
    Connect = 3,
    Connected = 4,
    Disconnect = 5,
    Disconnected = 6,
    Close = 7,
    Closed = 8,
    Error = 9,
    Attach = 10,
    Attached = 11,
    Detach = 12,
    Detached = 13,
    Presence = 14,
    Message = 15,
    Sync = 16,
}

impl Action {
    /// Actions that deliver payloads and therefore must be acknowledged.
    pub fn needs_msg_serial(&self) -> bool {
        matches!(self, Action::Message | Action::Presence)
    }

    /// Actions addressed to a specific channel rather than the connection.
    pub fn is_channel_scoped(&self) -> bool {
        matches!(
            self,
            Action::Attach
                | Action::Attached
                | Action::Detach
                | Action::Detached
                | Action::Presence
                | Action::Message
                | Action::Sync
        )
    }
}

impl From<Action> for u8 {
    fn from(action: Action) -> Self {
        action as u8
    }
}

impl TryFrom<u8> for Action {
    type Error = ErrorInfo;

    fn try_from(value: u8) -> Result<Self, ErrorInfo> {
        Ok(match value {
            0 => Action::Heartbeat,
            1 => Action::Ack,
            2 => Action::Nack,
            3 => Action::Connect,
            4 => Action::Connected,
            5 => Action::Disconnect,
            6 => Action::Disconnected,
            7 => Action::Close,
            8 => Action::Closed,
            9 => Action::Error,
            10 => Action::Attach,
            11 => Action::Attached,
            12 => Action::Detach,
            13 => Action::Detached,
            14 => Action::Presence,
            15 => Action::Message,
            16 => Action::Sync,
            other => {
                return Err(ErrorInfo::new(
                    40000,
                    400,
                    format!("unknown protocol action {}", other),
                ))
            }
        })
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Action::Heartbeat => "HEARTBEAT",
            Action::Ack => "ACK",
            Action::Nack => "NACK",
            Action::Connect => "CONNECT",
            Action::Connected => "CONNECTED",
            Action::Disconnect => "DISCONNECT",
            Action::Disconnected => "DISCONNECTED",
            Action::Close => "CLOSE",
            Action::Closed => "CLOSED",
            Action::Error => "ERROR",
            Action::Attach => "ATTACH",
            Action::Attached => "ATTACHED",
            Action::Detach => "DETACH",
            Action::Detached => "DETACHED",
            Action::Presence => "PRESENCE",
            Action::Message => "MESSAGE",
            Action::Sync => "SYNC",
        };
        f.write_str(name)
    }
}

/// Flag bits carried on ATTACHED frames.
pub mod flags {
    /// Service preserved channel continuity across this attach.
    pub const RESUMED: u32 = 1 << 2;
    /// A presence SYNC will follow this ATTACHED.
    pub const HAS_PRESENCE: u32 = 1 << 0;
}

/// Connection parameters reported by CONNECTED frames.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionDetails {
    #[serde(rename = "clientId", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(rename = "connectionKey", skip_serializing_if = "Option::is_none")]
    pub connection_key: Option<String>,
    /// How long the service retains connection state, in milliseconds.
    #[serde(rename = "connectionStateTtl", skip_serializing_if = "Option::is_none")]
    pub connection_state_ttl: Option<u64>,
    /// Longest gap between frames the service will leave before a heartbeat.
    #[serde(rename = "maxIdleInterval", skip_serializing_if = "Option::is_none")]
    pub max_idle_interval: Option<u64>,
}

/// One wire frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    pub action: Action,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(rename = "channelSerial", skip_serializing_if = "Option::is_none")]
    pub channel_serial: Option<String>,
    #[serde(rename = "connectionId", skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(rename = "connectionKey", skip_serializing_if = "Option::is_none")]
    pub connection_key: Option<String>,
    #[serde(rename = "connectionSerial", skip_serializing_if = "Option::is_none")]
    pub connection_serial: Option<i64>,
    #[serde(rename = "msgSerial", skip_serializing_if = "Option::is_none")]
    pub msg_serial: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flags: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub presence: Vec<PresenceMessage>,
    #[serde(rename = "connectionDetails", skip_serializing_if = "Option::is_none")]
    pub connection_details: Option<ConnectionDetails>,
}

impl Default for Action {
    fn default() -> Self {
        Action::Heartbeat
    }
}

impl ProtocolMessage {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            ..Default::default()
        }
    }

    pub fn with_channel(action: Action, channel: impl Into<String>) -> Self {
        Self {
            action,
            channel: Some(channel.into()),
            ..Default::default()
        }
    }

    pub fn heartbeat() -> Self {
        Self::new(Action::Heartbeat)
    }

    pub fn close() -> Self {
        Self::new(Action::Close)
    }

    pub fn attach(channel: impl Into<String>) -> Self {
        Self::with_channel(Action::Attach, channel)
    }

    pub fn detach(channel: impl Into<String>) -> Self {
        Self::with_channel(Action::Detach, channel)
    }

    pub fn message(channel: impl Into<String>, msg_serial: i64, messages: Vec<Message>) -> Self {
        Self {
            action: Action::Message,
            channel: Some(channel.into()),
            msg_serial: Some(msg_serial),
            messages,
            ..Default::default()
        }
    }

    pub fn presence(
        channel: impl Into<String>,
        msg_serial: i64,
        presence: Vec<PresenceMessage>,
    ) -> Self {
        Self {
            action: Action::Presence,
            channel: Some(channel.into()),
            msg_serial: Some(msg_serial),
            presence,
            ..Default::default()
        }
    }

    /// ACK/NACK `count` defaults to one covered unit when absent.
    pub fn ack_count(&self) -> u32 {
        self.count.unwrap_or(1)
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags.map(|f| f & flag != 0).unwrap_or(false)
    }

    /// Number of payload units this frame carries, for ACK accounting.
    pub fn unit_count(&self) -> u32 {
        match self.action {
            Action::Message => self.messages.len().max(1) as u32,
            Action::Presence => self.presence.len().max(1) as u32,
            _ => 0,
        }
    }

    /// Synthesize elided ids/timestamps/connection ids on every
    /// contained message and presence record.
    pub fn populate_contained(&mut self) {
        let frame_id = match self.id.clone() {
            Some(id) => id,
            None => return,
        };
        let connection_id = self.connection_id.clone();
        let timestamp = self.timestamp;

        for (index, message) in self.messages.iter_mut().enumerate() {
            message.populate_from_frame(&frame_id, index, connection_id.as_deref(), timestamp);
        }
        for (index, member) in self.presence.iter_mut().enumerate() {
            member.populate_from_frame(&frame_id, index, connection_id.as_deref(), timestamp);
        }
    }
}

/// JSON frame codec.
///
/// Stateless; exists as a type so the transport seam stays explicit and
/// the encode-side invariants live in one place.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    /// Encode a frame for the transport.
    ///
    /// Refuses MESSAGE/PRESENCE frames lacking `msg_serial`: those
    /// frames are acknowledged by serial, so emitting one without it is
    /// a programming error, not a wire condition.
    pub fn encode(&self, frame: &ProtocolMessage) -> Result<Bytes, RtError> {
        if frame.action.needs_msg_serial() && frame.msg_serial.is_none() {
            return Err(RtError::protocol_error(format!(
                "cannot encode {} frame without msgSerial",
                frame.action
            )));
        }
        let body = serde_json::to_vec(frame)?;
        Ok(Bytes::from(body))
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<ProtocolMessage, RtError> {
        let mut frame: ProtocolMessage = serde_json::from_slice(bytes)?;
        frame.populate_contained();
        Ok(frame)
    }
}
