/// Inbound frame routing.
///
/// Owns the channel registry, routes each decoded frame to the
/// connection core or the addressed channel, and fans connection
/// lifecycle changes back down to every channel. Pure state-machine
/// work happens inline; anything needing I/O or a timer is returned as
/// an `Effect` for the client actor to execute.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::channel::{ChannelCore, QueuedBatch};
use crate::config::ClientOptions;
use crate::connection::{ConnectionCore, RetryDirective};
use crate::error::ErrorInfo;
use crate::message::Message;
use crate::pending::PublishSender;
use crate::protocol::{flags, Action, ProtocolMessage};

/// Deferred work a dispatch produced.
#[derive(Debug)]
pub enum Effect {
    /// Hand a frame to the transport.
    SendFrame(ProtocolMessage),
    /// Schedule reconnection per the directive.
    ScheduleRetry(RetryDirective),
    /// Renew the credential, then reconnect without visiting `failed`.
    RenewCredential,
    /// Drop the current transport; the connection no longer owns it.
    DisposeTransport,
    /// A heartbeat arrived (resolves any ping waiters).
    HeartbeatReceived,
}

/// SYNC pagination cursor: `"<serial>:<cursor>"`; an empty cursor (or a
/// missing serial entirely) marks the final page.
pub fn sync_is_last_page(channel_serial: Option<&str>) -> bool {
    match channel_serial {
        None => true,
        Some(serial) => match serial.split_once(':') {
            Some((_, cursor)) => cursor.is_empty(),
            None => true,
        },
    }
}

pub struct Dispatcher {
    channels: HashMap<String, ChannelCore>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            channels: HashMap::new(),
        }
    }

    /// Channels are created lazily on first reference and live until
    /// explicitly released.
    pub fn channel(&mut self, name: &str) -> &mut ChannelCore {
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| ChannelCore::new(name))
    }

    pub fn get(&self, name: &str) -> Option<&ChannelCore> {
        self.channels.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ChannelCore> {
        self.channels.get_mut(name)
    }

    pub fn release(&mut self, name: &str) -> bool {
        self.channels.remove(name).is_some()
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }

    // ---- inbound --------------------------------------------------------

    /// Route one inbound frame. Mutates the connection and channel state
    /// machines directly; returns the effects the driver must run.
    pub fn dispatch(
        &mut self,
        mut frame: ProtocolMessage,
        conn: &mut ConnectionCore,
        options: &ClientOptions,
    ) -> Vec<Effect> {
        conn.record_activity();
        frame.populate_contained();
        if let Some(serial) = frame.connection_serial {
            conn.confirm_serial(serial);
        }
        debug!(action = %frame.action, channel = frame.channel.as_deref(), "dispatching frame");

        match frame.action {
            Action::Heartbeat => vec![Effect::HeartbeatReceived],

            Action::Connected => self.on_connected(frame, conn),

            Action::Disconnected => {
                let directive = conn.connection_interrupted(frame.error);
                self.apply_retry_fanout(&directive, conn);
                vec![Effect::DisposeTransport, Effect::ScheduleRetry(directive)]
            }

            Action::Closed => {
                conn.finish_close();
                for channel in self.channels.values_mut() {
                    channel.on_connection_closed();
                }
                vec![Effect::DisposeTransport]
            }

            Action::Error => self.on_error(frame, conn),

            Action::Ack => {
                let serial = match frame.msg_serial {
                    Some(serial) => serial,
                    None => {
                        warn!("ACK without msgSerial; dropping");
                        return Vec::new();
                    }
                };
                conn.pending().on_ack(serial, frame.ack_count());
                Vec::new()
            }

            Action::Nack => {
                let serial = match frame.msg_serial {
                    Some(serial) => serial,
                    None => {
                        warn!("NACK without msgSerial; dropping");
                        return Vec::new();
                    }
                };
                let ack_count = frame.ack_count();
                let error = frame
                    .error
                    .unwrap_or_else(|| ErrorInfo::new(50000, 500, "message not accepted"));
                conn.pending().on_nack(serial, ack_count, error);
                Vec::new()
            }

            Action::Attached => self.on_attached(frame, conn),

            Action::Detached => {
                if let Some(channel) = self.addressed_channel(&frame) {
                    channel.on_detached(frame.error);
                }
                Vec::new()
            }

            Action::Message => {
                let own_id = conn.id().map(str::to_owned);
                if let Some(channel) = self.addressed_channel(&frame) {
                    let messages: Vec<Message> = if options.echo_messages {
                        frame.messages
                    } else {
                        frame
                            .messages
                            .into_iter()
                            .filter(|m| m.connection_id != own_id || own_id.is_none())
                            .collect()
                    };
                    channel.on_message(messages);
                }
                Vec::new()
            }

            Action::Presence => {
                if let Some(channel) = self.addressed_channel(&frame) {
                    channel.on_presence(frame.presence);
                }
                Vec::new()
            }

            Action::Sync => {
                let is_last = sync_is_last_page(frame.channel_serial.as_deref());
                if let Some(channel) = self.addressed_channel(&frame) {
                    channel.on_sync(frame.presence, is_last);
                }
                Vec::new()
            }

            // Requests only ever travel client to service.
            Action::Connect | Action::Disconnect | Action::Close | Action::Attach
            | Action::Detach => {
                warn!(action = %frame.action, "ignoring request-direction frame from service");
                Vec::new()
            }
        }
    }

    // ---- connection lifecycle fanout ------------------------------------

    /// Applied by the driver when a locally detected interruption (not
    /// an inbound frame) changes connection state.
    pub fn apply_retry_fanout(&mut self, directive: &RetryDirective, conn: &mut ConnectionCore) {
        if matches!(directive, RetryDirective::SuspendedRetryIn(_)) {
            let reason = conn
                .error_reason()
                .cloned()
                .unwrap_or_else(ErrorInfo::connection_suspended);
            for channel in self.channels.values_mut() {
                channel.on_connection_suspended(reason.clone());
            }
        }
    }

    pub fn fan_out_closed(&mut self) {
        for channel in self.channels.values_mut() {
            channel.on_connection_closed();
        }
    }

    pub fn fan_out_failed(&mut self, reason: ErrorInfo) {
        for channel in self.channels.values_mut() {
            channel.on_connection_failed(reason.clone());
        }
    }

    // ---- handlers -------------------------------------------------------

    fn on_connected(&mut self, frame: ProtocolMessage, conn: &mut ConnectionCore) -> Vec<Effect> {
        let outcome = conn.on_connected(
            frame.connection_id.clone(),
            frame.connection_details.clone(),
            frame.error.clone(),
        );

        let mut effects = Vec::new();
        let names = self.channel_names();
        for name in names {
            let channel = self.channels.get_mut(&name).expect("registry member");
            let needs_attach = if outcome.recover_failed {
                channel.on_resume_failed(ErrorInfo::unable_to_recover())
            } else {
                // Suspended channels reattach on recovery; attaching
                // channels re-send their ATTACH on every new transport.
                channel.on_connection_recovered()
                    || channel.state() == crate::channel::ChannelState::Attaching
            };
            if needs_attach {
                effects.push(Effect::SendFrame(ProtocolMessage::attach(&name)));
            }
        }
        effects
    }

    fn on_attached(&mut self, frame: ProtocolMessage, conn: &mut ConnectionCore) -> Vec<Effect> {
        let name = match frame.channel.clone() {
            Some(name) => name,
            None => {
                warn!("ATTACHED without channel; dropping");
                return Vec::new();
            }
        };
        let channel = match self.channels.get_mut(&name) {
            Some(channel) => channel,
            None => {
                warn!(channel = %name, "ATTACHED for unknown channel; dropping");
                return Vec::new();
            }
        };

        let resumed = frame.has_flag(flags::RESUMED);
        let batches = channel.on_attached(resumed, frame.channel_serial, frame.error);
        match Self::coalesce(&name, batches, conn) {
            Some(flush) => vec![Effect::SendFrame(flush)],
            None => Vec::new(),
        }
    }

    /// Queued publishes flush as one frame under one serial; every
    /// publish call still resolves individually from that frame's ACK.
    fn coalesce(
        name: &str,
        batches: Vec<QueuedBatch>,
        conn: &mut ConnectionCore,
    ) -> Option<ProtocolMessage> {
        if batches.is_empty() {
            return None;
        }
        let mut messages: Vec<Message> = Vec::new();
        let mut completions: Vec<PublishSender> = Vec::new();
        for batch in batches {
            messages.extend(batch.messages);
            completions.push(batch.completion);
        }
        let serial = conn
            .pending()
            .track_batch(messages.len() as u32, completions);
        Some(ProtocolMessage::message(name, serial, messages))
    }

    fn on_error(&mut self, frame: ProtocolMessage, conn: &mut ConnectionCore) -> Vec<Effect> {
        let error = frame
            .error
            .clone()
            .unwrap_or_else(|| ErrorInfo::new(50000, 500, "unspecified service error"));

        // Channel-scoped errors stay local to that channel.
        if frame.channel.is_some() {
            if let Some(channel) = self.addressed_channel(&frame) {
                channel.on_failed(error);
            }
            return Vec::new();
        }

        if error.is_token_error() && conn.on_token_error() {
            debug!(code = error.code, "token expiry; renewing credential silently");
            return vec![Effect::DisposeTransport, Effect::RenewCredential];
        }

        conn.fail(error.clone());
        self.fan_out_failed(error);
        vec![Effect::DisposeTransport]
    }

    fn addressed_channel(&mut self, frame: &ProtocolMessage) -> Option<&mut ChannelCore> {
        let name = match frame.channel.as_deref() {
            Some(name) => name,
            None => {
                warn!(action = %frame.action, "channel-scoped frame without channel name");
                return None;
            }
        };
        let found = self.channels.get_mut(name);
        if found.is_none() {
            warn!(channel = %name, action = %frame.action, "frame for unknown channel; dropping");
        }
        found
    }
}
