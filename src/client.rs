/// Client facade and connection actor.
///
/// One actor task owns every piece of mutable protocol state: the
/// connection core, the channel registry (via the dispatcher), the
/// transport and all timers. Handles talk to it over an mpsc command
/// channel; observable state fans out on broadcast channels. This keeps
/// the single-writer ordering guarantees without any shared locks on
/// the protocol state itself.

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::auth::{Credential, CredentialProvider};
use crate::channel::{
    AttachDirective, ChannelState, ChannelStateChange, DetachDirective, PublishDirective,
};
use crate::config::ClientOptions;
use crate::connection::{
    CloseDirective, ConnectionCore, ConnectionState, ConnectionStateChange, RetryDirective,
};
use crate::dispatcher::{Dispatcher, Effect};
use crate::error::{ErrorInfo, RtError};
use crate::events::EventStream;
use crate::hosts::HostSelector;
use crate::message::{Message, PresenceAction, PresenceMessage};
use crate::pending::{PublishReceiver, PublishSender};
use crate::protocol::ProtocolMessage;
use crate::transport::{Transport, TransportEvent, TransportFactory, TransportParams};

/// Commands accepted by the connection actor.
enum Command {
    Connect,
    Close {
        response: oneshot::Sender<Result<(), ErrorInfo>>,
    },
    Attach {
        channel: String,
        /// `Ok(true)` means the channel is already in the target state.
        response: oneshot::Sender<Result<bool, ErrorInfo>>,
    },
    Detach {
        channel: String,
        response: oneshot::Sender<Result<bool, ErrorInfo>>,
    },
    Publish {
        channel: String,
        messages: Vec<Message>,
        completion: PublishSender,
    },
    EnterPresence {
        channel: String,
        data: Option<serde_json::Value>,
        completion: PublishSender,
    },
    LeavePresence {
        channel: String,
        completion: PublishSender,
    },
    Ping {
        response: oneshot::Sender<Result<Duration, ErrorInfo>>,
    },
    ReleaseChannel {
        channel: String,
    },
    ConnectionStates {
        response: oneshot::Sender<broadcast::Receiver<ConnectionStateChange>>,
    },
    ChannelStates {
        channel: String,
        response: oneshot::Sender<broadcast::Receiver<ChannelStateChange>>,
    },
    ChannelMessages {
        channel: String,
        response: oneshot::Sender<broadcast::Receiver<Message>>,
    },
    ChannelPresence {
        channel: String,
        response: oneshot::Sender<broadcast::Receiver<PresenceMessage>>,
    },
    PresenceMembers {
        channel: String,
        response: oneshot::Sender<Vec<PresenceMessage>>,
    },
    ChannelStateQuery {
        channel: String,
        response: oneshot::Sender<ChannelState>,
    },
}

/// Results of work the actor farmed out to tasks.
enum Internal {
    OpenResult {
        attempt: u64,
        host: String,
        result: Result<OpenSuccess, RtError>,
    },
    RenewResult {
        result: Result<Credential, ErrorInfo>,
    },
}

struct OpenSuccess {
    transport: Box<dyn Transport>,
    events: mpsc::Receiver<TransportEvent>,
    credential: Credential,
}

/// Externally visible connection snapshot, updated by the actor.
#[derive(Debug, Clone, Default)]
struct Snapshot {
    state: Option<ConnectionState>,
    connection_id: Option<String>,
    recovery_key: Option<String>,
    error_reason: Option<ErrorInfo>,
}

/// Realtime client handle. Cheap to clone; all clones drive the same
/// connection actor.
#[derive(Clone)]
pub struct RtClient {
    command_tx: mpsc::Sender<Command>,
    snapshot: Arc<RwLock<Snapshot>>,
    request_timeout: Duration,
}

impl RtClient {
    /// Validate options and start the connection actor. The connection
    /// stays `initialized` until `connect()` is called.
    pub fn new(
        options: ClientOptions,
        credentials: Arc<dyn CredentialProvider>,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self, RtError> {
        options.validate()?;
        let request_timeout = options.realtime_request_timeout;

        let (command_tx, command_rx) = mpsc::channel(256);
        let snapshot = Arc::new(RwLock::new(Snapshot {
            state: Some(ConnectionState::Initialized),
            ..Default::default()
        }));

        let mut actor = ConnectionActor::new(options, credentials, factory, command_rx, snapshot.clone())?;
        tokio::spawn(async move { actor.run().await });

        Ok(Self {
            command_tx,
            snapshot,
            request_timeout,
        })
    }

    /// Begin connecting (no-op when already connecting or connected).
    pub async fn connect(&self) {
        let _ = self.command_tx.send(Command::Connect).await;
    }

    /// Close the connection and await CLOSED (or the request timeout).
    pub async fn close(&self) -> Result<(), ErrorInfo> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Close { response: tx }).await?;
        rx.await
            .map_err(|_| ErrorInfo::new(50000, 500, "client actor stopped"))?
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshot
            .read()
            .state
            .unwrap_or(ConnectionState::Initialized)
    }

    pub fn connection_id(&self) -> Option<String> {
        self.snapshot.read().connection_id.clone()
    }

    /// `connectionId:connectionKey:serial`; persist it to recover the
    /// session from a fresh client via `ClientOptions::recover`.
    pub fn recovery_key(&self) -> Option<String> {
        self.snapshot.read().recovery_key.clone()
    }

    pub fn error_reason(&self) -> Option<ErrorInfo> {
        self.snapshot.read().error_reason.clone()
    }

    /// Stream of connection state changes.
    pub async fn connection_states(&self) -> Result<EventStream<ConnectionStateChange>, ErrorInfo> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::ConnectionStates { response: tx }).await?;
        Ok(EventStream::new(rx.await.map_err(Self::actor_gone)?))
    }

    /// Handle for a named channel, created lazily on the actor side.
    pub fn channel(&self, name: impl Into<String>) -> ChannelHandle {
        ChannelHandle {
            name: name.into(),
            command_tx: self.command_tx.clone(),
            request_timeout: self.request_timeout,
        }
    }

    /// Resolve once the connection reaches `target`.
    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<(), ErrorInfo> {
        // Subscribe before the snapshot check so a transition between
        // the two cannot be missed.
        let mut stream = self.connection_states().await?;
        if self.state() == target {
            return Ok(());
        }
        while let Some(change) = stream.next().await {
            if change.current == target {
                return Ok(());
            }
        }
        Err(Self::actor_gone(()))
    }

    /// Round-trip a heartbeat through the service.
    pub async fn ping(&self) -> Result<Duration, ErrorInfo> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Ping { response: tx }).await?;
        rx.await.map_err(Self::actor_gone)?
    }

    async fn send(&self, command: Command) -> Result<(), ErrorInfo> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| ErrorInfo::new(50000, 500, "client actor stopped"))
    }

    fn actor_gone<E>(_: E) -> ErrorInfo {
        ErrorInfo::new(50000, 500, "client actor stopped")
    }
}

/// Handle for one named channel.
#[derive(Clone)]
pub struct ChannelHandle {
    name: String,
    command_tx: mpsc::Sender<Command>,
    request_timeout: Duration,
}

impl ChannelHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attach and await ATTACHED (or failure / the request timeout).
    /// Triggers `connect()` implicitly when the connection is idle.
    pub async fn attach(&self) -> Result<(), ErrorInfo> {
        // Subscribe before commanding so the outcome cannot be missed.
        let mut states = self.states().await?;
        let (tx, rx) = oneshot::channel();
        self.send(Command::Attach {
            channel: self.name.clone(),
            response: tx,
        })
        .await?;
        match rx.await.map_err(actor_gone)? {
            Ok(true) => Ok(()),
            Ok(false) => self.await_attach_outcome(&mut states).await,
            Err(error) => Err(error),
        }
    }

    async fn await_attach_outcome(
        &self,
        states: &mut broadcast::Receiver<ChannelStateChange>,
    ) -> Result<(), ErrorInfo> {
        let wait = async {
            loop {
                match states.recv().await {
                    Ok(change) => match change.current {
                        ChannelState::Attached => return Ok(()),
                        ChannelState::Failed | ChannelState::Detached | ChannelState::Suspended => {
                            return Err(change
                                .reason
                                .unwrap_or_else(|| ErrorInfo::channel_detached(&self.name)))
                        }
                        _ => continue,
                    },
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(actor_gone(()));
                    }
                }
            }
        };
        tokio::time::timeout(self.request_timeout, wait)
            .await
            .map_err(|_| ErrorInfo::timeout("attach"))?
    }

    /// Detach and await DETACHED.
    pub async fn detach(&self) -> Result<(), ErrorInfo> {
        let mut states = self.states().await?;
        let (tx, rx) = oneshot::channel();
        self.send(Command::Detach {
            channel: self.name.clone(),
            response: tx,
        })
        .await?;
        match rx.await.map_err(actor_gone)? {
            Ok(true) => Ok(()),
            Ok(false) => {
                let wait = async {
                    loop {
                        match states.recv().await {
                            Ok(change) if change.current == ChannelState::Detached => {
                                return Ok(())
                            }
                            Ok(change) if change.current == ChannelState::Failed => {
                                return Err(change
                                    .reason
                                    .unwrap_or_else(|| ErrorInfo::channel_detached(&self.name)))
                            }
                            Ok(_) => continue,
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => return Err(actor_gone(())),
                        }
                    }
                };
                tokio::time::timeout(self.request_timeout, wait)
                    .await
                    .map_err(|_| ErrorInfo::timeout("detach"))?
            }
            Err(error) => Err(error),
        }
    }

    /// Publish one message and await its acknowledgement.
    pub async fn publish(
        &self,
        name: impl Into<String>,
        data: serde_json::Value,
    ) -> Result<(), ErrorInfo> {
        self.publish_batch(vec![Message::new(name, data)]).await
    }

    /// Publish a batch as a single frame and await its acknowledgement.
    pub async fn publish_batch(&self, messages: Vec<Message>) -> Result<(), ErrorInfo> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Publish {
            channel: self.name.clone(),
            messages,
            completion: tx,
        })
        .await?;
        await_completion(rx).await
    }

    /// Enter this client into the channel's presence set.
    pub async fn enter_presence(&self, data: Option<serde_json::Value>) -> Result<(), ErrorInfo> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::EnterPresence {
            channel: self.name.clone(),
            data,
            completion: tx,
        })
        .await?;
        await_completion(rx).await
    }

    /// Leave the channel's presence set.
    pub async fn leave_presence(&self) -> Result<(), ErrorInfo> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::LeavePresence {
            channel: self.name.clone(),
            completion: tx,
        })
        .await?;
        await_completion(rx).await
    }

    /// Stream of channel state changes.
    pub async fn states(&self) -> Result<broadcast::Receiver<ChannelStateChange>, ErrorInfo> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::ChannelStates {
            channel: self.name.clone(),
            response: tx,
        })
        .await?;
        rx.await.map_err(actor_gone)
    }

    pub async fn state_stream(&self) -> Result<EventStream<ChannelStateChange>, ErrorInfo> {
        Ok(EventStream::new(self.states().await?))
    }

    /// Stream of every message delivered on this channel.
    pub async fn subscribe(&self) -> Result<EventStream<Message>, ErrorInfo> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::ChannelMessages {
            channel: self.name.clone(),
            response: tx,
        })
        .await?;
        Ok(EventStream::new(rx.await.map_err(actor_gone)?))
    }

    /// Stream of messages whose `name` matches, mirroring name-scoped
    /// subscriptions.
    pub async fn subscribe_to(
        &self,
        name: impl Into<String>,
    ) -> Result<impl Stream<Item = Message>, ErrorInfo> {
        let name = name.into();
        let stream = self.subscribe().await?;
        Ok(stream.filter(move |message| {
            futures::future::ready(message.name.as_deref() == Some(name.as_str()))
        }))
    }

    /// Stream of presence events on this channel.
    pub async fn presence_events(&self) -> Result<EventStream<PresenceMessage>, ErrorInfo> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::ChannelPresence {
            channel: self.name.clone(),
            response: tx,
        })
        .await?;
        Ok(EventStream::new(rx.await.map_err(actor_gone)?))
    }

    /// Current channel state.
    pub async fn state(&self) -> Result<ChannelState, ErrorInfo> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::ChannelStateQuery {
            channel: self.name.clone(),
            response: tx,
        })
        .await?;
        rx.await.map_err(actor_gone)
    }

    /// Current presence membership snapshot.
    pub async fn presence_members(&self) -> Result<Vec<PresenceMessage>, ErrorInfo> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::PresenceMembers {
            channel: self.name.clone(),
            response: tx,
        })
        .await?;
        rx.await.map_err(actor_gone)
    }

    /// Drop the channel from the registry.
    pub async fn release(self) -> Result<(), ErrorInfo> {
        self.send(Command::ReleaseChannel {
            channel: self.name.clone(),
        })
        .await
    }

    async fn send(&self, command: Command) -> Result<(), ErrorInfo> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| actor_gone(()))
    }
}

fn actor_gone<E>(_: E) -> ErrorInfo {
    ErrorInfo::new(50000, 500, "client actor stopped")
}

async fn await_completion(rx: PublishReceiver) -> Result<(), ErrorInfo> {
    match rx.await {
        Ok(result) => result,
        Err(_) => Err(ErrorInfo::new(
            50000,
            500,
            "publish completion dropped without resolution",
        )),
    }
}

// ---- actor ---------------------------------------------------------------

struct ConnectionActor {
    options: ClientOptions,
    credentials: Arc<dyn CredentialProvider>,
    factory: Arc<dyn TransportFactory>,

    core: ConnectionCore,
    dispatcher: Dispatcher,
    hosts: HostSelector,

    command_rx: mpsc::Receiver<Command>,
    // Internal results ride a flume channel: senders are cheap to clone
    // into spawned open/renew tasks and sending never awaits.
    internal_tx: flume::Sender<Internal>,
    internal_rx: flume::Receiver<Internal>,

    transport: Option<Box<dyn Transport>>,
    transport_rx: Option<mpsc::Receiver<TransportEvent>>,
    current_host: Option<String>,
    cached_credential: Option<Credential>,

    /// Attempt counter; stale open results are discarded by tag.
    attempt: u64,
    retry_at: Option<Instant>,
    /// Deadline for CONNECTED after a transport opened.
    connected_deadline: Option<Instant>,
    /// Deadline for CLOSED after CLOSE was sent.
    close_deadline: Option<Instant>,
    renewal_in_flight: bool,

    ping_waiters: Vec<(Instant, oneshot::Sender<Result<Duration, ErrorInfo>>)>,
    close_waiters: Vec<oneshot::Sender<Result<(), ErrorInfo>>>,

    snapshot: Arc<RwLock<Snapshot>>,
}

impl ConnectionActor {
    fn new(
        options: ClientOptions,
        credentials: Arc<dyn CredentialProvider>,
        factory: Arc<dyn TransportFactory>,
        command_rx: mpsc::Receiver<Command>,
        snapshot: Arc<RwLock<Snapshot>>,
    ) -> Result<Self, RtError> {
        let mut core = ConnectionCore::new(&options);
        if let Some(recovery_key) = &options.recover {
            core.set_recovery_key(recovery_key).map_err(RtError::from)?;
        }
        let hosts = HostSelector::new(
            options.primary_host(),
            options.configured_fallback_hosts(),
            options.fallback_retry_timeout,
        );
        let (internal_tx, internal_rx) = flume::unbounded();

        Ok(Self {
            options,
            credentials,
            factory,
            core,
            dispatcher: Dispatcher::new(),
            hosts,
            command_rx,
            internal_tx,
            internal_rx,
            transport: None,
            transport_rx: None,
            current_host: None,
            cached_credential: None,
            attempt: 0,
            retry_at: None,
            connected_deadline: None,
            close_deadline: None,
            renewal_in_flight: false,
            ping_waiters: Vec::new(),
            close_waiters: Vec::new(),
            snapshot,
        })
    }

    async fn run(&mut self) {
        debug!("connection actor started");
        loop {
            self.publish_snapshot();

            let retry_at = self.retry_at;
            let timer = async move {
                match retry_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };
            let response_deadline = self.nearest_response_deadline();
            let response_timer = async move {
                match response_deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                command = self.command_rx.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        None => break,
                    }
                }
                Ok(internal) = self.internal_rx.recv_async() => {
                    self.handle_internal(internal).await;
                }
                event = Self::next_transport_event(&mut self.transport_rx) => {
                    self.handle_transport_event(event).await;
                }
                _ = timer => {
                    self.retry_at = None;
                    self.attempt_connect().await;
                }
                _ = response_timer => {
                    self.handle_response_deadline().await;
                }
            }

            if self.core.state().is_terminal() && self.transport.is_none() {
                // Keep serving queries, but there is nothing left to drive
                // once every handle is gone.
                if self.command_rx.is_closed() {
                    break;
                }
            }
        }
        self.publish_snapshot();
        debug!("connection actor stopped");
    }

    async fn next_transport_event(
        rx: &mut Option<mpsc::Receiver<TransportEvent>>,
    ) -> Option<TransportEvent> {
        match rx {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        }
    }

    fn nearest_response_deadline(&self) -> Option<Instant> {
        let mut nearest = None;
        for deadline in [
            self.connected_deadline,
            self.close_deadline,
            self.core.idle_deadline(),
        ]
        .into_iter()
        .flatten()
        {
            nearest = Some(match nearest {
                None => deadline,
                Some(current) if deadline < current => deadline,
                Some(current) => current,
            });
        }
        nearest
    }

    // ---- command handling ----------------------------------------------

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => {
                if matches!(
                    self.core.state(),
                    ConnectionState::Initialized
                        | ConnectionState::Disconnected
                        | ConnectionState::Suspended
                ) {
                    self.retry_at = None;
                    self.attempt_connect().await;
                }
            }
            Command::Close { response } => self.handle_close(response).await,
            Command::Attach { channel, response } => {
                self.handle_attach(channel, response).await;
            }
            Command::Detach { channel, response } => {
                self.handle_detach(channel, response).await;
            }
            Command::Publish {
                channel,
                messages,
                completion,
            } => {
                self.handle_publish(channel, messages, completion).await;
            }
            Command::EnterPresence {
                channel,
                data,
                completion,
            } => {
                let client_id = self.client_id();
                let mut member = PresenceMessage::new(PresenceAction::Enter, client_id);
                member.data = data;
                self.handle_presence_op(channel, member, completion).await;
            }
            Command::LeavePresence {
                channel,
                completion,
            } => {
                let client_id = self.client_id();
                let member = PresenceMessage::new(PresenceAction::Leave, client_id);
                self.handle_presence_op(channel, member, completion).await;
            }
            Command::Ping { response } => self.handle_ping(response).await,
            Command::ReleaseChannel { channel } => {
                self.dispatcher.release(&channel);
            }
            Command::ConnectionStates { response } => {
                let _ = response.send(self.core.subscribe_states());
            }
            Command::ChannelStates { channel, response } => {
                let _ = response.send(self.dispatcher.channel(&channel).subscribe_states());
            }
            Command::ChannelMessages { channel, response } => {
                let _ = response.send(self.dispatcher.channel(&channel).subscribe_messages());
            }
            Command::ChannelPresence { channel, response } => {
                let _ = response.send(self.dispatcher.channel(&channel).subscribe_presence());
            }
            Command::PresenceMembers { channel, response } => {
                let members = self
                    .dispatcher
                    .get(&channel)
                    .map(|c| c.presence_members())
                    .unwrap_or_default();
                let _ = response.send(members);
            }
            Command::ChannelStateQuery { channel, response } => {
                let state = self
                    .dispatcher
                    .get(&channel)
                    .map(|c| c.state())
                    .unwrap_or(ChannelState::Initialized);
                let _ = response.send(state);
            }
        }
    }

    fn client_id(&self) -> String {
        self.options
            .client_id
            .clone()
            .or_else(|| {
                self.cached_credential
                    .as_ref()
                    .and_then(|c| c.client_id.clone())
            })
            .unwrap_or_else(|| "anonymous".to_string())
    }

    async fn handle_close(&mut self, response: oneshot::Sender<Result<(), ErrorInfo>>) {
        match self.core.start_close() {
            Err(error) => {
                let _ = response.send(Err(error));
            }
            Ok(CloseDirective::Noop) => {
                if self.core.state() == ConnectionState::Closed {
                    let _ = response.send(Ok(()));
                } else {
                    self.close_waiters.push(response);
                }
            }
            Ok(CloseDirective::Immediate) => {
                // A user close cancels any pending reconnect.
                self.retry_at = None;
                self.attempt += 1;
                self.core.finish_close();
                self.dispatcher.fan_out_closed();
                self.dispose_transport().await;
                let _ = response.send(Ok(()));
            }
            Ok(CloseDirective::SendClose) => {
                self.retry_at = None;
                self.close_waiters.push(response);
                self.close_deadline =
                    Some(Instant::now() + self.options.realtime_request_timeout);
                self.send_frame(ProtocolMessage::close()).await;
            }
        }
    }

    async fn handle_attach(
        &mut self,
        channel: String,
        response: oneshot::Sender<Result<bool, ErrorInfo>>,
    ) {
        if self.core.state().is_terminal() {
            let _ = response.send(Err(ErrorInfo::invalid_state_transition(
                self.core.state().as_str(),
                "attach",
            )));
            return;
        }

        let directive = match self.dispatcher.channel(&channel).attach() {
            Ok(directive) => directive,
            Err(error) => {
                let _ = response.send(Err(error));
                return;
            }
        };
        let _ = response.send(Ok(directive == AttachDirective::Noop));

        match directive {
            AttachDirective::Noop | AttachDirective::InFlight => {}
            AttachDirective::SendAttach => match self.core.state() {
                ConnectionState::Connected => {
                    self.send_frame(ProtocolMessage::attach(&channel)).await;
                }
                ConnectionState::Connecting => {
                    // ATTACH goes out once CONNECTED arrives.
                }
                _ => {
                    // Implicit connect; the dispatcher sends the ATTACH
                    // for attaching channels on CONNECTED.
                    self.retry_at = None;
                    self.attempt_connect().await;
                }
            },
        }
    }

    async fn handle_detach(
        &mut self,
        channel: String,
        response: oneshot::Sender<Result<bool, ErrorInfo>>,
    ) {
        let directive = match self.dispatcher.channel(&channel).detach() {
            Ok(directive) => directive,
            Err(error) => {
                let _ = response.send(Err(error));
                return;
            }
        };
        let _ = response.send(Ok(directive == DetachDirective::Noop));

        if directive == DetachDirective::SendDetach
            && self.core.state() == ConnectionState::Connected
        {
            self.send_frame(ProtocolMessage::detach(&channel)).await;
        }
    }

    async fn handle_publish(
        &mut self,
        channel: String,
        messages: Vec<Message>,
        completion: PublishSender,
    ) {
        let queue_messages = self.options.queue_messages;
        let max_batch = self.options.max_protocol_message_batch_size;
        let directive =
            self.dispatcher
                .channel(&channel)
                .publish(messages, completion, queue_messages, max_batch);

        if let PublishDirective::Send {
            messages,
            completion,
        } = directive
        {
            if self.core.state() != ConnectionState::Connected || self.transport.is_none() {
                let _ = completion.send(Err(ErrorInfo::connection_disconnected()));
                return;
            }
            let serial = self
                .core
                .pending()
                .track_with(messages.len() as u32, completion);
            let frame = ProtocolMessage::message(&channel, serial, messages);
            self.send_frame(frame).await;
        }
    }

    async fn handle_presence_op(
        &mut self,
        channel: String,
        member: PresenceMessage,
        completion: PublishSender,
    ) {
        let attached = self
            .dispatcher
            .get(&channel)
            .map(|c| c.state() == ChannelState::Attached)
            .unwrap_or(false);
        if !attached || self.core.state() != ConnectionState::Connected {
            let state = self
                .dispatcher
                .get(&channel)
                .map(|c| c.state().as_str())
                .unwrap_or("initialized");
            let _ = completion.send(Err(ErrorInfo::invalid_state_transition(
                state,
                "update presence",
            )));
            return;
        }

        let serial = self.core.pending().track_with(1, completion);
        let frame = ProtocolMessage::presence(&channel, serial, vec![member]);
        self.send_frame(frame).await;
    }

    async fn handle_ping(&mut self, response: oneshot::Sender<Result<Duration, ErrorInfo>>) {
        if self.core.state() != ConnectionState::Connected {
            let _ = response.send(Err(ErrorInfo::invalid_state_transition(
                self.core.state().as_str(),
                "ping",
            )));
            return;
        }
        self.ping_waiters.push((Instant::now(), response));
        self.send_frame(ProtocolMessage::heartbeat()).await;
    }

    // ---- connecting -----------------------------------------------------

    async fn attempt_connect(&mut self) {
        let fresh_cycle = match self.core.start_connect() {
            Ok(fresh_cycle) => fresh_cycle,
            Err(_) => return,
        };
        if fresh_cycle {
            self.hosts.begin_cycle();
        }

        let host = self.hosts.next_host();
        let params_host = host.clone();
        let resume = self.core.resume_params();
        self.attempt += 1;
        let attempt = self.attempt;
        self.current_host = Some(host.clone());

        let cached = self.cached_credential.clone().or_else(|| {
            self.credentials.current_credential()
        });
        let provider = self.credentials.clone();
        let factory = self.factory.clone();
        let internal_tx = self.internal_tx.clone();
        let port = self.options.effective_port();
        let client_id = self.options.client_id.clone();
        let echo_messages = self.options.echo_messages;

        info!(host = %host, attempt, resuming = resume.is_some(), "opening transport");
        tokio::spawn(async move {
            let credential = match cached {
                Some(credential) => Ok(credential),
                None => provider.renew().await.map_err(RtError::from),
            };
            let result = match credential {
                Ok(credential) => {
                    let params = TransportParams {
                        host: params_host.clone(),
                        port,
                        credential: credential.clone(),
                        client_id,
                        echo_messages,
                        resume,
                    };
                    factory
                        .open(params)
                        .await
                        .map(|(transport, events)| OpenSuccess {
                            transport,
                            events,
                            credential,
                        })
                }
                Err(error) => Err(error),
            };
            let _ = internal_tx.send(Internal::OpenResult {
                attempt,
                host: params_host,
                result,
            });
        });
    }

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::OpenResult {
                attempt,
                host,
                result,
            } => {
                if attempt != self.attempt {
                    debug!(attempt, "discarding stale transport open result");
                    if let Ok(mut success) = result {
                        success.transport.close().await;
                    }
                    return;
                }
                match result {
                    Ok(success) => {
                        self.cached_credential = Some(success.credential);
                        self.transport = Some(success.transport);
                        self.transport_rx = Some(success.events);
                        self.connected_deadline =
                            Some(Instant::now() + self.options.realtime_request_timeout);
                        debug!(host = %host, "transport open; awaiting CONNECTED");
                    }
                    Err(error) => {
                        warn!(host = %host, error = %error, "transport open failed");
                        self.hosts.note_failure(&host);
                        let directive =
                            self.core.connection_interrupted(Some(error.to_error_info()));
                        self.dispatcher.apply_retry_fanout(&directive, &mut self.core);
                        self.schedule_retry(directive);
                    }
                }
            }
            Internal::RenewResult { result } => {
                self.renewal_in_flight = false;
                match result {
                    Ok(credential) => {
                        self.cached_credential = Some(credential);
                        self.retry_at = None;
                        self.attempt_connect().await;
                    }
                    Err(error) => {
                        error!(code = error.code, "credential renewal failed");
                        self.core.fail(error.clone());
                        self.dispatcher.fan_out_failed(error);
                        self.dispose_transport().await;
                    }
                }
            }
        }
    }

    // ---- transport events ----------------------------------------------

    async fn handle_transport_event(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Frame(frame)) => {
                let was_connecting = self.core.state() == ConnectionState::Connecting;
                let effects =
                    self.dispatcher
                        .dispatch(frame, &mut self.core, &self.options);

                if was_connecting && self.core.state() == ConnectionState::Connected {
                    self.connected_deadline = None;
                    if let Some(host) = self.current_host.clone() {
                        self.hosts.note_success(&host);
                    }
                }
                if self.core.state() == ConnectionState::Closed {
                    self.close_deadline = None;
                    self.resolve_close_waiters();
                }
                self.run_effects(effects).await;
            }
            Some(TransportEvent::Closed { error }) => {
                debug!(abnormal = error.is_some(), "transport closed");
                self.dispose_transport().await;
                if self.core.state() == ConnectionState::Closing {
                    self.core.finish_close();
                    self.dispatcher.fan_out_closed();
                    self.close_deadline = None;
                    self.resolve_close_waiters();
                    return;
                }
                let directive = self.core.connection_interrupted(error);
                self.dispatcher.apply_retry_fanout(&directive, &mut self.core);
                self.schedule_retry(directive);
            }
            None => {
                // Channel dropped without a Closed event: same treatment.
                self.dispose_transport().await;
                let directive = self.core.connection_interrupted(None);
                self.dispatcher.apply_retry_fanout(&directive, &mut self.core);
                self.schedule_retry(directive);
            }
        }
    }

    async fn run_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::SendFrame(frame) => self.send_frame(frame).await,
                Effect::ScheduleRetry(directive) => self.schedule_retry(directive),
                Effect::DisposeTransport => self.dispose_transport().await,
                Effect::RenewCredential => {
                    // Drop the dead credential, mark the interruption,
                    // and reconnect once renewal lands.
                    self.cached_credential = None;
                    let _ = self
                        .core
                        .connection_interrupted(Some(ErrorInfo::new(
                            40142, 401, "token expired; renewing",
                        )));
                    self.spawn_renewal();
                }
                Effect::HeartbeatReceived => {
                    for (sent_at, waiter) in self.ping_waiters.drain(..) {
                        let _ = waiter.send(Ok(sent_at.elapsed()));
                    }
                }
            }
        }
    }

    fn spawn_renewal(&mut self) {
        if self.renewal_in_flight {
            return;
        }
        self.renewal_in_flight = true;
        let provider = self.credentials.clone();
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = provider.renew().await;
            let _ = internal_tx.send(Internal::RenewResult { result });
        });
    }

    fn schedule_retry(&mut self, directive: RetryDirective) {
        match directive {
            RetryDirective::RetryIn(delay) => {
                self.retry_at = Some(Instant::now() + delay);
            }
            RetryDirective::SuspendedRetryIn(delay) => {
                // A suspension starts a fresh host cycle.
                self.hosts.begin_cycle();
                self.retry_at = Some(Instant::now() + delay);
            }
            RetryDirective::None => {}
        }
    }

    async fn handle_response_deadline(&mut self) {
        let now = Instant::now();

        if self.close_deadline.map(|at| now >= at).unwrap_or(false) {
            self.close_deadline = None;
            warn!("CLOSED did not arrive in time; closing locally");
            self.core.finish_close();
            self.dispatcher.fan_out_closed();
            self.dispose_transport().await;
            self.resolve_close_waiters();
            return;
        }

        if self.connected_deadline.map(|at| now >= at).unwrap_or(false) {
            self.connected_deadline = None;
            warn!("CONNECTED did not arrive in time");
            if let Some(host) = self.current_host.clone() {
                self.hosts.note_failure(&host);
            }
            self.dispose_transport().await;
            let directive = self
                .core
                .connection_interrupted(Some(ErrorInfo::timeout("connect")));
            self.dispatcher.apply_retry_fanout(&directive, &mut self.core);
            self.schedule_retry(directive);
            return;
        }

        if self
            .core
            .idle_deadline()
            .map(|at| now >= at)
            .unwrap_or(false)
        {
            warn!("transport idle past maxIdleInterval; treating as dead");
            self.dispose_transport().await;
            let directive = self
                .core
                .connection_interrupted(Some(ErrorInfo::timeout("idle transport")));
            self.dispatcher.apply_retry_fanout(&directive, &mut self.core);
            self.schedule_retry(directive);
        }
    }

    // ---- plumbing -------------------------------------------------------

    async fn send_frame(&mut self, frame: ProtocolMessage) {
        let transport = match self.transport.as_mut() {
            Some(transport) => transport,
            None => {
                warn!(action = %frame.action, "no transport; dropping outbound frame");
                return;
            }
        };
        if let Err(error) = transport.send(frame).await {
            warn!(error = %error, "transport send failed");
            self.dispose_transport().await;
            let directive = self
                .core
                .connection_interrupted(Some(error.to_error_info()));
            self.dispatcher.apply_retry_fanout(&directive, &mut self.core);
            self.schedule_retry(directive);
            // A failed CLOSE finishes the close locally.
            if self.core.state() == ConnectionState::Closed {
                self.close_deadline = None;
                self.dispatcher.fan_out_closed();
                self.resolve_close_waiters();
            }
        }
    }

    async fn dispose_transport(&mut self) {
        self.connected_deadline = None;
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
        self.transport_rx = None;
    }

    fn resolve_close_waiters(&mut self) {
        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        for (_, waiter) in self.ping_waiters.drain(..) {
            let _ = waiter.send(Err(ErrorInfo::connection_closed()));
        }
    }

    fn publish_snapshot(&self) {
        let mut snapshot = self.snapshot.write();
        snapshot.state = Some(self.core.state());
        snapshot.connection_id = self.core.id().map(str::to_owned);
        snapshot.recovery_key = self.core.recovery_key();
        snapshot.error_reason = self.core.error_reason().cloned();
    }
}
