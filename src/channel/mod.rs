/// Per-channel attach/detach lifecycle and outbound queueing.
///
/// `ChannelCore` is the synchronous state machine; the client actor
/// drives it and performs the I/O its directives ask for. Everything
/// observable (state changes, messages, presence) fans out on
/// broadcast channels plus the callback bus.

pub mod state;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::ErrorInfo;
use crate::events::{EventBus, ListenerId};
use crate::message::{Message, PresenceMessage};
use crate::pending::PublishSender;
use crate::presence::PresenceMap;

pub use state::{ChannelEvent, ChannelState, ChannelStateChange};

/// Publishes buffered while the channel is not yet attached.
pub struct QueuedBatch {
    pub messages: Vec<Message>,
    pub completion: PublishSender,
}

/// What the driver must do after an `attach()` call.
#[derive(Debug, PartialEq, Eq)]
pub enum AttachDirective {
    /// Already attached; nothing to send (attach is idempotent).
    Noop,
    /// An ATTACH is already in flight.
    InFlight,
    /// Send an ATTACH frame (connecting first if necessary).
    SendAttach,
}

/// What the driver must do after a `detach()` call.
#[derive(Debug, PartialEq, Eq)]
pub enum DetachDirective {
    Noop,
    /// A DETACH is already in flight.
    InFlight,
    SendDetach,
}

/// What the driver must do with a publish.
pub enum PublishDirective {
    /// Frame and send immediately through the pending tracker.
    Send {
        messages: Vec<Message>,
        completion: PublishSender,
    },
    /// Buffered; will flush on ATTACHED.
    Queued,
    /// Completion already rejected; nothing to do.
    Refused,
}

pub struct ChannelCore {
    name: String,
    state: ChannelState,
    error_reason: Option<ErrorInfo>,
    attach_serial: Option<String>,
    queued: Vec<QueuedBatch>,
    presence: PresenceMap,
    bus: EventBus<ChannelEvent, ChannelStateChange>,
    state_tx: broadcast::Sender<ChannelStateChange>,
    message_tx: broadcast::Sender<Message>,
    presence_tx: broadcast::Sender<PresenceMessage>,
}

impl ChannelCore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: ChannelState::Initialized,
            error_reason: None,
            attach_serial: None,
            queued: Vec::new(),
            presence: PresenceMap::new(),
            bus: EventBus::new(),
            state_tx: broadcast::channel(64).0,
            message_tx: broadcast::channel(256).0,
            presence_tx: broadcast::channel(256).0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn error_reason(&self) -> Option<&ErrorInfo> {
        self.error_reason.as_ref()
    }

    pub fn attach_serial(&self) -> Option<&str> {
        self.attach_serial.as_deref()
    }

    pub fn queued_count(&self) -> usize {
        self.queued.len()
    }

    pub fn presence_members(&self) -> Vec<PresenceMessage> {
        self.presence.members().cloned().collect()
    }

    pub fn subscribe_states(&self) -> broadcast::Receiver<ChannelStateChange> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<Message> {
        self.message_tx.subscribe()
    }

    pub fn subscribe_presence(&self) -> broadcast::Receiver<PresenceMessage> {
        self.presence_tx.subscribe()
    }

    pub fn on(
        &self,
        events: Option<Vec<ChannelEvent>>,
        listener: impl Fn(&ChannelStateChange) + Send + Sync + 'static,
    ) -> ListenerId {
        self.bus.on(events, listener)
    }

    pub fn off(&self, id: ListenerId) {
        self.bus.off(id);
    }

    // ---- operations -----------------------------------------------------

    /// Request an attach. Idempotent while attached or attaching.
    pub fn attach(&mut self) -> Result<AttachDirective, ErrorInfo> {
        match self.state {
            ChannelState::Attached => Ok(AttachDirective::Noop),
            ChannelState::Attaching => Ok(AttachDirective::InFlight),
            _ => {
                self.transition(ChannelState::Attaching, None, false, None);
                Ok(AttachDirective::SendAttach)
            }
        }
    }

    /// Request a detach. Queued publishes are rejected immediately.
    pub fn detach(&mut self) -> Result<DetachDirective, ErrorInfo> {
        match self.state {
            ChannelState::Initialized | ChannelState::Detached => Ok(DetachDirective::Noop),
            ChannelState::Detaching => Ok(DetachDirective::InFlight),
            ChannelState::Failed => Err(ErrorInfo::invalid_state_transition(
                self.state.as_str(),
                "detach",
            )),
            _ => {
                self.fail_queued(ErrorInfo::channel_detached(&self.name));
                self.transition(ChannelState::Detaching, None, false, None);
                Ok(DetachDirective::SendDetach)
            }
        }
    }

    /// Route a publish according to channel state and queue policy.
    ///
    /// Oversized batches fail fast before any frame is built.
    pub fn publish(
        &mut self,
        messages: Vec<Message>,
        completion: PublishSender,
        queue_messages: bool,
        max_batch_size: usize,
    ) -> PublishDirective {
        if messages.len() > max_batch_size {
            let _ = completion.send(Err(ErrorInfo::batch_too_large(
                messages.len(),
                max_batch_size,
            )));
            return PublishDirective::Refused;
        }

        match self.state {
            ChannelState::Attached => PublishDirective::Send {
                messages,
                completion,
            },
            state if state.can_queue_publish() => {
                if !queue_messages {
                    let _ = completion.send(Err(ErrorInfo::queueing_disabled(
                        &self.name,
                        state.as_str(),
                    )));
                    return PublishDirective::Refused;
                }
                self.queued.push(QueuedBatch {
                    messages,
                    completion,
                });
                PublishDirective::Queued
            }
            state => {
                let _ = completion.send(Err(ErrorInfo::queueing_disabled(
                    &self.name,
                    state.as_str(),
                )));
                PublishDirective::Refused
            }
        }
    }

    // ---- inbound frames -------------------------------------------------

    /// ATTACHED arrived. Returns queued batches the driver must now
    /// frame and send (empty on a server-initiated update).
    pub fn on_attached(
        &mut self,
        resumed: bool,
        attach_serial: Option<String>,
        error: Option<ErrorInfo>,
    ) -> Vec<QueuedBatch> {
        self.attach_serial = attach_serial;

        if self.state == ChannelState::Attached {
            // Server-initiated re-attach: no transition, emit `update`.
            let change = ChannelStateChange {
                current: ChannelState::Attached,
                previous: ChannelState::Attached,
                event: ChannelEvent::Update,
                reason: error,
                resumed,
                retry_in: None,
            };
            let _ = self.state_tx.send(change.clone());
            self.bus.emit(ChannelEvent::Update, &change);
            return Vec::new();
        }

        self.error_reason = error.clone();
        self.transition_with_resumed(ChannelState::Attached, error, resumed);
        std::mem::take(&mut self.queued)
    }

    pub fn on_detached(&mut self, error: Option<ErrorInfo>) {
        if matches!(
            self.state,
            ChannelState::Detached | ChannelState::Initialized | ChannelState::Failed
        ) {
            return;
        }
        self.fail_queued(ErrorInfo::channel_detached(&self.name));
        self.error_reason = error.clone();
        self.transition(ChannelState::Detached, error, false, None);
    }

    /// Channel-scoped ERROR or fatal ATTACH/DETACH rejection.
    pub fn on_failed(&mut self, error: ErrorInfo) {
        self.fail_queued(error.clone());
        for leave in self.presence.on_channel_detached_or_lost() {
            let _ = self.presence_tx.send(leave);
        }
        self.error_reason = Some(error.clone());
        self.transition(ChannelState::Failed, Some(error), false, None);
    }

    /// MESSAGE frame: deliver contained messages in order.
    pub fn on_message(&mut self, messages: Vec<Message>) {
        if self.state != ChannelState::Attached {
            warn!(channel = %self.name, state = %self.state, "dropping message for non-attached channel");
            return;
        }
        for message in messages {
            let _ = self.message_tx.send(message);
        }
    }

    /// PRESENCE frame: apply and re-emit in arrival order.
    pub fn on_presence(&mut self, members: Vec<PresenceMessage>) {
        for member in members {
            if let Some(event) = self.presence.apply_message(member) {
                let _ = self.presence_tx.send(event);
            }
        }
    }

    /// SYNC frame page.
    pub fn on_sync(&mut self, members: Vec<PresenceMessage>, is_last_page: bool) {
        for event in self.presence.apply_sync(members, is_last_page) {
            let _ = self.presence_tx.send(event);
        }
    }

    // ---- connection lifecycle fanout ------------------------------------

    /// Connection suspended: channel loses its attachment but keeps its
    /// queue for the eventual reattach.
    pub fn on_connection_suspended(&mut self, reason: ErrorInfo) {
        if matches!(self.state, ChannelState::Attached | ChannelState::Attaching) {
            for leave in self.presence.on_channel_detached_or_lost() {
                let _ = self.presence_tx.send(leave);
            }
            self.transition(ChannelState::Suspended, Some(reason), false, None);
        }
    }

    /// Connection closed or failed: attachment cannot survive.
    pub fn on_connection_closed(&mut self) {
        if matches!(self.state, ChannelState::Attached | ChannelState::Attaching) {
            self.fail_queued(ErrorInfo::connection_closed());
            for leave in self.presence.on_channel_detached_or_lost() {
                let _ = self.presence_tx.send(leave);
            }
            self.transition(ChannelState::Detached, None, false, None);
        } else {
            self.fail_queued(ErrorInfo::connection_closed());
        }
    }

    pub fn on_connection_failed(&mut self, reason: ErrorInfo) {
        if !matches!(self.state, ChannelState::Detached | ChannelState::Initialized) {
            self.on_failed(reason);
        } else {
            self.fail_queued(reason);
        }
    }

    /// Resume failed: reattach from scratch. Returns true when the
    /// driver must send a fresh ATTACH for this channel.
    pub fn on_resume_failed(&mut self, reason: ErrorInfo) -> bool {
        match self.state {
            ChannelState::Attached | ChannelState::Attaching | ChannelState::Suspended => {
                self.transition(ChannelState::Attaching, Some(reason), false, None);
                true
            }
            _ => false,
        }
    }

    /// Connection recovered after suspension: reattach suspended channels.
    pub fn on_connection_recovered(&mut self) -> bool {
        if self.state == ChannelState::Suspended {
            self.transition(ChannelState::Attaching, None, false, None);
            true
        } else {
            false
        }
    }

    // ---- internals ------------------------------------------------------

    fn fail_queued(&mut self, error: ErrorInfo) {
        if self.queued.is_empty() {
            return;
        }
        debug!(channel = %self.name, count = self.queued.len(), "rejecting queued publishes");
        for batch in self.queued.drain(..) {
            let _ = batch.completion.send(Err(error.clone()));
        }
    }

    fn transition(
        &mut self,
        next: ChannelState,
        reason: Option<ErrorInfo>,
        resumed: bool,
        retry_in: Option<std::time::Duration>,
    ) {
        if !self.state.can_transition_to(next) {
            warn!(
                channel = %self.name,
                from = %self.state,
                to = %next,
                "suppressing illegal channel transition"
            );
            return;
        }
        let previous = self.state;
        self.state = next;
        debug!(channel = %self.name, from = %previous, to = %next, "channel state change");

        let change = ChannelStateChange {
            current: next,
            previous,
            event: ChannelEvent::from(next),
            reason,
            resumed,
            retry_in,
        };
        let _ = self.state_tx.send(change.clone());
        self.bus.emit(ChannelEvent::from(next), &change);
    }

    fn transition_with_resumed(
        &mut self,
        next: ChannelState,
        reason: Option<ErrorInfo>,
        resumed: bool,
    ) {
        self.transition(next, reason, resumed, None);
    }
}
