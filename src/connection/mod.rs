/// Connection lifecycle state machine.
///
/// `ConnectionCore` is the synchronous half: transition table, resume
/// bookkeeping, retry/suspension clocks and the pending-message
/// tracker. The client actor drives it, owns the transport, and runs
/// the timers it asks for. Clocks use `tokio::time::Instant` so paused
/// test time flows through them.

pub mod state;

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::ClientOptions;
use crate::error::ErrorInfo;
use crate::events::{EventBus, ListenerId};
use crate::pending::PendingMessageTracker;
use crate::protocol::ConnectionDetails;
use crate::transport::ResumeParams;

pub use state::{ConnectionEvent, ConnectionState, ConnectionStateChange};

/// What the driver must do after an interruption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDirective {
    /// Schedule a reconnect attempt after `delay`.
    RetryIn(Duration),
    /// The machine entered `suspended`; retry after `delay`, forever.
    SuspendedRetryIn(Duration),
    /// No retry: the machine is closing or terminal.
    None,
}

/// What the driver must do after a `close()` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDirective {
    /// Send CLOSE and await CLOSED (or the request timeout).
    SendClose,
    /// No transport to speak through: complete the close locally.
    Immediate,
    /// Already closing or closed.
    Noop,
}

/// How a CONNECTED frame related to the prior session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectedOutcome {
    /// Service confirmed continuity: same id, no error.
    pub resumed: bool,
    /// A resume was attempted and the service could not honor it.
    pub recover_failed: bool,
}

pub struct ConnectionCore {
    state: ConnectionState,
    id: Option<String>,
    key: Option<String>,
    /// Last confirmed connection serial; -1 before anything confirmed.
    serial: i64,
    error_reason: Option<ErrorInfo>,

    connection_state_ttl: Duration,
    max_idle_interval: Duration,
    last_activity: Option<Instant>,
    /// Set when the disconnected/connecting retry cycle begins; cleared
    /// on success. Drives the suspension decision.
    cycle_started_at: Option<Instant>,
    retries_this_cycle: u32,
    /// One silent credential renewal is allowed per connection attempt.
    renewed_this_attempt: bool,

    disconnected_retry_timeout: Duration,
    suspended_retry_timeout: Duration,
    max_connection_state_ttl: Duration,
    realtime_request_timeout: Duration,

    pending: PendingMessageTracker,
    bus: EventBus<ConnectionEvent, ConnectionStateChange>,
    state_tx: broadcast::Sender<ConnectionStateChange>,
}

impl ConnectionCore {
    pub fn new(options: &ClientOptions) -> Self {
        Self {
            state: ConnectionState::Initialized,
            id: None,
            key: None,
            serial: -1,
            error_reason: None,
            connection_state_ttl: options.max_connection_state_ttl,
            max_idle_interval: Duration::ZERO,
            last_activity: None,
            cycle_started_at: None,
            retries_this_cycle: 0,
            renewed_this_attempt: false,
            disconnected_retry_timeout: options.disconnected_retry_timeout,
            suspended_retry_timeout: options.suspended_retry_timeout,
            max_connection_state_ttl: options.max_connection_state_ttl,
            realtime_request_timeout: options.realtime_request_timeout,
            pending: PendingMessageTracker::new(),
            bus: EventBus::new(),
            state_tx: broadcast::channel(64).0,
        }
    }

    // ---- accessors ------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn serial(&self) -> i64 {
        self.serial
    }

    pub fn error_reason(&self) -> Option<&ErrorInfo> {
        self.error_reason.as_ref()
    }

    /// `id:key:serial`, the only state an external caller may persist
    /// to recover a session after a full restart.
    pub fn recovery_key(&self) -> Option<String> {
        match (&self.id, &self.key) {
            (Some(id), Some(key)) => Some(format!("{}:{}:{}", id, key, self.serial)),
            _ => None,
        }
    }

    pub fn pending(&mut self) -> &mut PendingMessageTracker {
        &mut self.pending
    }

    pub fn subscribe_states(&self) -> broadcast::Receiver<ConnectionStateChange> {
        self.state_tx.subscribe()
    }

    pub fn on(
        &self,
        events: Option<Vec<ConnectionEvent>>,
        listener: impl Fn(&ConnectionStateChange) + Send + Sync + 'static,
    ) -> ListenerId {
        self.bus.on(events, listener)
    }

    pub fn off(&self, id: ListenerId) {
        self.bus.off(id);
    }

    // ---- recovery -------------------------------------------------------

    /// Adopt a persisted `recovery_key` before the first connect.
    pub fn set_recovery_key(&mut self, recovery_key: &str) -> Result<(), ErrorInfo> {
        if self.state != ConnectionState::Initialized {
            return Err(ErrorInfo::invalid_state_transition(
                self.state.as_str(),
                "recover",
            ));
        }
        let mut parts = recovery_key.splitn(3, ':');
        let (id, key, serial) = match (parts.next(), parts.next(), parts.next()) {
            (Some(id), Some(key), Some(serial)) if !id.is_empty() && !key.is_empty() => {
                match serial.parse::<i64>() {
                    Ok(serial) => (id, key, serial),
                    Err(_) => {
                        return Err(ErrorInfo::new(40000, 400, "malformed recovery key serial"))
                    }
                }
            }
            _ => return Err(ErrorInfo::new(40000, 400, "malformed recovery key")),
        };
        self.id = Some(id.to_string());
        self.key = Some(key.to_string());
        self.serial = serial;
        // Treat recovery as fresh activity so the resume window is open.
        self.last_activity = Some(Instant::now());
        Ok(())
    }

    /// Resume fields for the next connection attempt, or `None` for a
    /// clean connect. Clears stale identity when the resume window
    /// (`connectionStateTtl + maxIdleInterval`) has lapsed.
    pub fn resume_params(&mut self) -> Option<ResumeParams> {
        let key = self.key.clone()?;
        let window = self.connection_state_ttl + self.max_idle_interval;
        let stale = self
            .last_activity
            .map(|at| at.elapsed() > window)
            .unwrap_or(true);
        if stale {
            info!("resume window elapsed; discarding connection identity");
            self.id = None;
            self.key = None;
            self.serial = -1;
            return None;
        }
        Some(ResumeParams {
            connection_key: key,
            connection_serial: self.serial,
        })
    }

    // ---- operations -----------------------------------------------------

    /// Begin a connection attempt. Returns whether a brand-new retry
    /// cycle starts (the driver resets host selection on `true`).
    pub fn start_connect(&mut self) -> Result<bool, ErrorInfo> {
        match self.state {
            ConnectionState::Initialized
            | ConnectionState::Disconnected
            | ConnectionState::Suspended => {
                let fresh_cycle = self.cycle_started_at.is_none();
                self.transition(ConnectionState::Connecting, None, None);
                Ok(fresh_cycle)
            }
            ConnectionState::Connecting | ConnectionState::Connected => Err(
                ErrorInfo::invalid_state_transition(self.state.as_str(), "connect"),
            ),
            _ => Err(ErrorInfo::invalid_state_transition(
                self.state.as_str(),
                "connect",
            )),
        }
    }

    /// Request a close.
    pub fn start_close(&mut self) -> Result<CloseDirective, ErrorInfo> {
        match self.state {
            ConnectionState::Failed => Err(ErrorInfo::invalid_state_transition(
                "failed", "close",
            )),
            ConnectionState::Closing | ConnectionState::Closed => Ok(CloseDirective::Noop),
            ConnectionState::Connected => {
                self.transition(ConnectionState::Closing, None, None);
                Ok(CloseDirective::SendClose)
            }
            _ => {
                self.transition(ConnectionState::Closing, None, None);
                Ok(CloseDirective::Immediate)
            }
        }
    }

    /// CLOSED frame arrived, or the close timed out locally.
    pub fn finish_close(&mut self) {
        if self.state == ConnectionState::Closing {
            self.pending.fail_all(ErrorInfo::connection_closed());
            self.transition(ConnectionState::Closed, None, None);
        }
    }

    /// Unrecoverable error: terminal failure.
    pub fn fail(&mut self, error: ErrorInfo) {
        if self.state.is_terminal() {
            return;
        }
        self.pending.fail_all(error.clone());
        self.error_reason = Some(error.clone());
        self.transition(ConnectionState::Failed, Some(error), None);
    }

    // ---- inbound --------------------------------------------------------

    /// Every inbound frame confirms the transport is alive.
    pub fn record_activity(&mut self) {
        self.last_activity = Some(Instant::now());
    }

    /// Deadline after which silence means the transport is dead.
    pub fn idle_deadline(&self) -> Option<Instant> {
        if self.state != ConnectionState::Connected || self.max_idle_interval.is_zero() {
            return None;
        }
        self.last_activity
            .map(|at| at + self.max_idle_interval + self.realtime_request_timeout)
    }

    /// CONNECTED frame.
    pub fn on_connected(
        &mut self,
        connection_id: Option<String>,
        details: Option<ConnectionDetails>,
        error: Option<ErrorInfo>,
    ) -> ConnectedOutcome {
        let prior_id = self.id.clone();
        let had_session = prior_id.is_some();
        let resumed = had_session && connection_id == prior_id && error.is_none();
        let recover_failed = had_session && !resumed;

        if let Some(details) = &details {
            if let Some(ttl) = details.connection_state_ttl {
                self.connection_state_ttl = Duration::from_millis(ttl);
            }
            if let Some(idle) = details.max_idle_interval {
                self.max_idle_interval = Duration::from_millis(idle);
            }
            if details.connection_key.is_some() {
                self.key = details.connection_key.clone();
            }
        }
        self.id = connection_id;

        if !resumed {
            // Fresh session: serials restart; anything in flight from a
            // prior session can no longer be honored in order.
            let cause = if recover_failed {
                ErrorInfo::unable_to_recover()
            } else {
                ErrorInfo::connection_disconnected()
            };
            self.pending.reset(cause);
            self.serial = -1;
        }

        self.cycle_started_at = None;
        self.retries_this_cycle = 0;
        self.renewed_this_attempt = false;
        self.record_activity();

        if self.state == ConnectionState::Connected {
            // Re-issued CONNECTED while connected: details update only.
            self.emit_update(error.clone());
        } else {
            self.error_reason = None;
            self.transition(ConnectionState::Connected, error.clone(), None);
        }

        if let Some(warning) = error {
            warn!(code = warning.code, "service attached a non-fatal error to CONNECTED");
        }

        ConnectedOutcome {
            resumed,
            recover_failed,
        }
    }

    /// Inbound frame carried a `connectionSerial`: advance the cursor.
    pub fn confirm_serial(&mut self, connection_serial: i64) {
        if connection_serial < self.serial {
            warn!(
                confirmed = self.serial,
                received = connection_serial,
                "connectionSerial regressed; ignoring"
            );
            return;
        }
        self.serial = connection_serial;
    }

    /// Transport dropped, connect attempt failed, or DISCONNECTED frame.
    ///
    /// First retry of a cycle is immediate; later retries wait
    /// `disconnected_retry_timeout`. Once the cycle has run for
    /// `max_connection_state_ttl` the machine suspends and retries every
    /// `suspended_retry_timeout` indefinitely.
    pub fn connection_interrupted(&mut self, error: Option<ErrorInfo>) -> RetryDirective {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => {}
            ConnectionState::Closing => {
                // Transport went away mid-close: finish locally.
                self.finish_close();
                return RetryDirective::None;
            }
            _ => return RetryDirective::None,
        }

        let now = Instant::now();
        let cycle_start = *self.cycle_started_at.get_or_insert(now);
        let cycle_elapsed = now.duration_since(cycle_start);

        if cycle_elapsed >= self.max_connection_state_ttl
            && self.state != ConnectionState::Suspended
        {
            let reason = ErrorInfo::connection_suspended();
            self.error_reason = Some(reason.clone());
            self.transition(
                ConnectionState::Suspended,
                Some(reason),
                Some(self.suspended_retry_timeout),
            );
            return RetryDirective::SuspendedRetryIn(self.suspended_retry_timeout);
        }

        let delay = if self.retries_this_cycle == 0 {
            Duration::ZERO
        } else {
            self.disconnected_retry_timeout
        };
        self.retries_this_cycle += 1;

        let reason = error.unwrap_or_else(ErrorInfo::connection_disconnected);
        self.error_reason = Some(reason.clone());
        self.transition(ConnectionState::Disconnected, Some(reason), Some(delay));
        RetryDirective::RetryIn(delay)
    }

    /// ERROR frame with a token-family code. Returns `true` when the
    /// driver should renew the credential and reconnect silently;
    /// `false` means renewal was already spent and the error is fatal.
    pub fn on_token_error(&mut self) -> bool {
        if self.renewed_this_attempt {
            return false;
        }
        self.renewed_this_attempt = true;
        true
    }

    // ---- internals ------------------------------------------------------

    fn emit_update(&self, reason: Option<ErrorInfo>) {
        let change = ConnectionStateChange {
            current: self.state,
            previous: self.state,
            event: ConnectionEvent::Update,
            reason,
            retry_in: None,
        };
        let _ = self.state_tx.send(change.clone());
        self.bus.emit(ConnectionEvent::Update, &change);
    }

    fn transition(
        &mut self,
        next: ConnectionState,
        reason: Option<ErrorInfo>,
        retry_in: Option<Duration>,
    ) {
        if !self.state.can_transition_to(next) {
            warn!(from = %self.state, to = %next, "suppressing illegal connection transition");
            return;
        }
        let previous = self.state;
        self.state = next;
        info!(from = %previous, to = %next, "connection state change");

        let change = ConnectionStateChange {
            current: next,
            previous,
            event: ConnectionEvent::from(next),
            reason,
            retry_in,
        };
        let _ = self.state_tx.send(change.clone());
        self.bus.emit(ConnectionEvent::from(next), &change);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> ClientOptions {
        ClientOptions {
            disconnected_retry_timeout: Duration::from_secs(2),
            suspended_retry_timeout: Duration::from_secs(5),
            max_connection_state_ttl: Duration::from_secs(60),
            ..Default::default()
        }
    }

    fn connected_details(key: &str, ttl_ms: u64, idle_ms: u64) -> ConnectionDetails {
        ConnectionDetails {
            client_id: None,
            connection_key: Some(key.into()),
            connection_state_ttl: Some(ttl_ms),
            max_idle_interval: Some(idle_ms),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_connect_records_identity() {
        let mut core = ConnectionCore::new(&options());
        assert!(core.start_connect().unwrap());

        let outcome = core.on_connected(
            Some("conn-1".into()),
            Some(connected_details("key-1", 120_000, 15_000)),
            None,
        );

        assert!(!outcome.resumed);
        assert!(!outcome.recover_failed);
        assert_eq!(core.state(), ConnectionState::Connected);
        assert_eq!(core.id(), Some("conn-1"));
        assert_eq!(core.key(), Some("key-1"));
        assert_eq!(core.recovery_key().unwrap(), "conn-1:key-1:-1");
    }

    #[tokio::test(start_paused = true)]
    async fn resume_preserves_serial_and_pending() {
        let mut core = ConnectionCore::new(&options());
        core.start_connect().unwrap();
        core.on_connected(
            Some("conn-1".into()),
            Some(connected_details("key-1", 120_000, 15_000)),
            None,
        );
        core.confirm_serial(4);
        let (_, mut rx) = core.pending().track(1);

        core.connection_interrupted(None);
        core.start_connect().unwrap();
        assert!(core.resume_params().is_some());

        let outcome = core.on_connected(Some("conn-1".into()), None, None);
        assert!(outcome.resumed);
        assert_eq!(core.serial(), 4);
        assert!(rx.try_recv().is_err(), "pending must stay outstanding");
        assert_eq!(core.pending().outstanding(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_resume_rejects_pending_and_resets_serials() {
        let mut core = ConnectionCore::new(&options());
        core.start_connect().unwrap();
        core.on_connected(
            Some("conn-1".into()),
            Some(connected_details("key-1", 120_000, 15_000)),
            None,
        );
        core.confirm_serial(4);
        let (_, mut rx) = core.pending().track(1);

        core.connection_interrupted(None);
        core.start_connect().unwrap();
        let outcome = core.on_connected(
            Some("conn-2".into()),
            Some(connected_details("key-2", 120_000, 15_000)),
            None,
        );

        assert!(!outcome.resumed);
        assert!(outcome.recover_failed);
        assert_eq!(rx.try_recv().unwrap().unwrap_err().code, 80008);
        assert_eq!(core.serial(), -1);
        assert_eq!(core.pending().next_serial(), 0);
        assert_eq!(core.id(), Some("conn-2"));
        assert_eq!(core.key(), Some("key-2"));
    }

    #[tokio::test(start_paused = true)]
    async fn resume_window_expiry_clears_identity() {
        let mut core = ConnectionCore::new(&options());
        core.start_connect().unwrap();
        core.on_connected(
            Some("conn-1".into()),
            Some(connected_details("key-1", 1_000, 500)),
            None,
        );

        core.connection_interrupted(None);
        tokio::time::advance(Duration::from_millis(2_000)).await;

        core.start_connect().unwrap();
        assert!(core.resume_params().is_none());
        assert!(core.id().is_none());
        assert_eq!(core.serial(), -1);
    }

    #[tokio::test(start_paused = true)]
    async fn first_retry_is_immediate_then_spaced() {
        let mut core = ConnectionCore::new(&options());
        core.start_connect().unwrap();

        let first = core.connection_interrupted(None);
        assert_eq!(first, RetryDirective::RetryIn(Duration::ZERO));

        core.start_connect().unwrap();
        let second = core.connection_interrupted(None);
        assert_eq!(second, RetryDirective::RetryIn(Duration::from_secs(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn cycle_exhaustion_suspends() {
        let mut core = ConnectionCore::new(&options());
        core.start_connect().unwrap();
        core.connection_interrupted(None);

        tokio::time::advance(Duration::from_secs(61)).await;
        core.start_connect().unwrap();
        let directive = core.connection_interrupted(None);

        assert_eq!(
            directive,
            RetryDirective::SuspendedRetryIn(Duration::from_secs(5))
        );
        assert_eq!(core.state(), ConnectionState::Suspended);
    }

    #[tokio::test(start_paused = true)]
    async fn close_from_failed_is_an_error_and_terminal_close_is_idempotent() {
        let mut core = ConnectionCore::new(&options());
        core.fail(ErrorInfo::connection_failed("invalid key"));
        assert_eq!(core.state(), ConnectionState::Failed);
        assert!(core.start_close().is_err());

        let mut core = ConnectionCore::new(&options());
        core.start_connect().unwrap();
        core.on_connected(Some("conn-1".into()), None, None);
        assert_eq!(core.start_close().unwrap(), CloseDirective::SendClose);
        assert_eq!(core.start_close().unwrap(), CloseDirective::Noop);
        core.finish_close();
        assert_eq!(core.state(), ConnectionState::Closed);
        assert_eq!(core.start_close().unwrap(), CloseDirective::Noop);
    }

    #[tokio::test(start_paused = true)]
    async fn token_renewal_is_single_shot_per_attempt() {
        let mut core = ConnectionCore::new(&options());
        core.start_connect().unwrap();
        core.on_connected(Some("conn-1".into()), None, None);

        assert!(core.on_token_error());
        assert!(!core.on_token_error());

        // A successful reconnect re-arms renewal.
        core.connection_interrupted(None);
        core.start_connect().unwrap();
        core.on_connected(Some("conn-1".into()), None, None);
        assert!(core.on_token_error());
    }

    #[tokio::test(start_paused = true)]
    async fn serial_regression_is_ignored() {
        let mut core = ConnectionCore::new(&options());
        core.start_connect().unwrap();
        core.on_connected(Some("conn-1".into()), None, None);
        core.confirm_serial(10);
        core.confirm_serial(7);
        assert_eq!(core.serial(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_key_round_trip() {
        let mut core = ConnectionCore::new(&options());
        core.set_recovery_key("conn-9:key-9:42").unwrap();
        let resume = core.resume_params().unwrap();
        assert_eq!(resume.connection_key, "key-9");
        assert_eq!(resume.connection_serial, 42);

        assert!(ConnectionCore::new(&options())
            .set_recovery_key("garbage")
            .is_err());
    }
}
