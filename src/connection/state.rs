use std::time::Duration;

use crate::error::ErrorInfo;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Initialized,
    Connecting,
    Connected,
    /// Transport lost; short-cycle retries are running.
    Disconnected,
    /// Retries exhausted `max_connection_state_ttl`; slow-cycle retries.
    Suspended,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Initialized => "initialized",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Suspended => "suspended",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        }
    }

    /// `closed` and `failed` admit no further transitions; only a new
    /// client instance restarts from `initialized`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }

    /// States in which a transport is usable or being established.
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }

    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        if *self == next {
            return false;
        }
        match (*self, next) {
            // Terminal states admit nothing.
            (Closed | Failed, _) => false,
            // Any live state may fail or begin closing.
            (_, Failed) => true,
            (_, Closing) => true,
            (Initialized, Connecting) => true,
            (Connecting, Connected | Disconnected | Suspended) => true,
            (Connected, Disconnected) => true,
            (Disconnected, Connecting | Suspended) => true,
            (Suspended, Connecting) => true,
            (Closing, Closed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event identity for connection listeners; `Update` fires for
/// connection-details changes that are not a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEvent {
    Initialized,
    Connecting,
    Connected,
    Disconnected,
    Suspended,
    Closing,
    Closed,
    Failed,
    Update,
}

impl From<ConnectionState> for ConnectionEvent {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Initialized => ConnectionEvent::Initialized,
            ConnectionState::Connecting => ConnectionEvent::Connecting,
            ConnectionState::Connected => ConnectionEvent::Connected,
            ConnectionState::Disconnected => ConnectionEvent::Disconnected,
            ConnectionState::Suspended => ConnectionEvent::Suspended,
            ConnectionState::Closing => ConnectionEvent::Closing,
            ConnectionState::Closed => ConnectionEvent::Closed,
            ConnectionState::Failed => ConnectionEvent::Failed,
        }
    }
}

/// State-change record delivered to connection listeners.
#[derive(Debug, Clone)]
pub struct ConnectionStateChange {
    pub current: ConnectionState,
    pub previous: ConnectionState,
    pub event: ConnectionEvent,
    pub reason: Option<ErrorInfo>,
    /// Delay before the next automatic attempt, when one is scheduled.
    pub retry_in: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn happy_path_is_legal() {
        assert!(Initialized.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Disconnected));
        assert!(Disconnected.can_transition_to(Connecting));
    }

    #[test]
    fn suspension_path_is_legal() {
        assert!(Disconnected.can_transition_to(Suspended));
        assert!(Connecting.can_transition_to(Suspended));
        assert!(Suspended.can_transition_to(Connecting));
    }

    #[test]
    fn close_path_is_legal() {
        assert!(Connected.can_transition_to(Closing));
        assert!(Suspended.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Closed));
    }

    #[test]
    fn terminal_states_admit_nothing() {
        for next in [
            Initialized,
            Connecting,
            Connected,
            Disconnected,
            Suspended,
            Closing,
            Closed,
            Failed,
        ] {
            assert!(!Closed.can_transition_to(next));
            assert!(!Failed.can_transition_to(next));
        }
    }

    #[test]
    fn illegal_shortcuts_are_rejected() {
        assert!(!Initialized.can_transition_to(Connected));
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Suspended.can_transition_to(Disconnected));
    }
}
