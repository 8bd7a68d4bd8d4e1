//! Scripted in-memory transport and credential provider for driving the
//! engine end to end without sockets.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use rtlink::{
    Action, ConnectionDetails, Credential, CredentialProvider, ErrorInfo, ProtocolMessage,
    ResumeParams, RtError, Transport, TransportEvent, TransportFactory, TransportParams,
};

/// One attempt the factory served (or refused).
#[derive(Debug, Clone)]
pub struct OpenRecord {
    pub host: String,
    pub token: String,
    pub resume: Option<ResumeParams>,
    pub at: Instant,
}

struct LinkInner {
    sent: Mutex<Vec<ProtocolMessage>>,
    inbound: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    closed: AtomicBool,
}

/// Service-side handle to one opened transport.
#[derive(Clone)]
pub struct ServiceLink {
    inner: Arc<LinkInner>,
}

impl ServiceLink {
    /// Deliver a frame to the client.
    pub async fn send_frame(&self, frame: ProtocolMessage) {
        let tx = self.inner.inbound.lock().clone();
        if let Some(tx) = tx {
            let _ = tx.send(TransportEvent::Frame(frame)).await;
        }
    }

    /// Tear the transport down from the service side.
    pub async fn drop_transport(&self, error: Option<ErrorInfo>) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let tx = self.inner.inbound.lock().take();
        if let Some(tx) = tx {
            let _ = tx.send(TransportEvent::Closed { error }).await;
        }
    }

    /// Frames the client handed to this transport, oldest first.
    pub fn sent(&self) -> Vec<ProtocolMessage> {
        self.inner.sent.lock().clone()
    }

    pub fn sent_with_action(&self, action: Action) -> Vec<ProtocolMessage> {
        self.sent()
            .into_iter()
            .filter(|f| f.action == action)
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

struct MockTransport {
    host: String,
    link: Arc<LinkInner>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, frame: ProtocolMessage) -> Result<(), RtError> {
        if self.link.closed.load(Ordering::SeqCst) {
            return Err(RtError::connection_error("transport closed", true));
        }
        self.link.sent.lock().push(frame);
        Ok(())
    }

    async fn close(&mut self) {
        self.link.closed.store(true, Ordering::SeqCst);
        self.link.inbound.lock().take();
    }

    fn host(&self) -> &str {
        &self.host
    }
}

struct FactoryInner {
    fail_next: VecDeque<ErrorInfo>,
    opens: Vec<OpenRecord>,
    links: Vec<ServiceLink>,
}

/// Transport factory whose outcomes are scripted by the test.
#[derive(Clone)]
pub struct ScriptedFactory {
    inner: Arc<Mutex<FactoryInner>>,
}

impl ScriptedFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(Mutex::new(FactoryInner {
                fail_next: VecDeque::new(),
                opens: Vec::new(),
                links: Vec::new(),
            })),
        })
    }

    /// Refuse the next open attempt with `error`.
    pub fn fail_next_open(&self, error: ErrorInfo) {
        self.inner.lock().fail_next.push_back(error);
    }

    pub fn open_count(&self) -> usize {
        self.inner.lock().opens.len()
    }

    pub fn opens(&self) -> Vec<OpenRecord> {
        self.inner.lock().opens.clone()
    }

    pub fn link(&self, index: usize) -> ServiceLink {
        self.inner.lock().links[index].clone()
    }

    pub fn link_count(&self) -> usize {
        self.inner.lock().links.len()
    }

    pub fn last_link(&self) -> ServiceLink {
        let inner = self.inner.lock();
        inner.links.last().expect("no transport opened yet").clone()
    }
}

#[async_trait]
impl TransportFactory for ScriptedFactory {
    async fn open(
        &self,
        params: TransportParams,
    ) -> Result<(Box<dyn Transport>, mpsc::Receiver<TransportEvent>), RtError> {
        let mut inner = self.inner.lock();
        inner.opens.push(OpenRecord {
            host: params.host.clone(),
            token: params.credential.token.clone(),
            resume: params.resume.clone(),
            at: Instant::now(),
        });

        if let Some(error) = inner.fail_next.pop_front() {
            return Err(RtError::Service(error));
        }

        let (tx, rx) = mpsc::channel(64);
        let link = Arc::new(LinkInner {
            sent: Mutex::new(Vec::new()),
            inbound: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
        });
        inner.links.push(ServiceLink { inner: link.clone() });

        Ok((
            Box::new(MockTransport {
                host: params.host,
                link,
            }),
            rx,
        ))
    }
}

/// Credential provider that counts renewals.
pub struct CountingCredentials {
    tokens: Mutex<VecDeque<String>>,
    current: Mutex<Credential>,
    pub renewals: AtomicUsize,
    fail_renewal: Mutex<Option<ErrorInfo>>,
}

impl CountingCredentials {
    pub fn new(token: &str) -> Arc<Self> {
        Arc::new(Self {
            tokens: Mutex::new(VecDeque::new()),
            current: Mutex::new(Credential::new(token)),
            renewals: AtomicUsize::new(0),
            fail_renewal: Mutex::new(None),
        })
    }

    /// Queue tokens to hand out on subsequent renewals.
    pub fn push_token(&self, token: &str) {
        self.tokens.lock().push_back(token.to_string());
    }

    pub fn fail_next_renewal(&self, error: ErrorInfo) {
        *self.fail_renewal.lock() = Some(error);
    }

    pub fn renewal_count(&self) -> usize {
        self.renewals.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialProvider for CountingCredentials {
    fn current_credential(&self) -> Option<Credential> {
        Some(self.current.lock().clone())
    }

    async fn renew(&self) -> Result<Credential, ErrorInfo> {
        self.renewals.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.fail_renewal.lock().take() {
            return Err(error);
        }
        let mut current = self.current.lock();
        if let Some(next) = self.tokens.lock().pop_front() {
            *current = Credential::new(next);
        }
        Ok(current.clone())
    }
}

// ---- frame builders ------------------------------------------------------

pub fn connected_frame(connection_id: &str, key: &str) -> ProtocolMessage {
    ProtocolMessage {
        action: Action::Connected,
        connection_id: Some(connection_id.into()),
        connection_details: Some(ConnectionDetails {
            client_id: None,
            connection_key: Some(key.into()),
            connection_state_ttl: Some(120_000),
            max_idle_interval: Some(600_000),
        }),
        ..Default::default()
    }
}

pub fn attached_frame(channel: &str, resumed: bool) -> ProtocolMessage {
    ProtocolMessage {
        action: Action::Attached,
        channel: Some(channel.into()),
        flags: if resumed {
            Some(rtlink::protocol::flags::RESUMED)
        } else {
            None
        },
        ..Default::default()
    }
}

pub fn detached_frame(channel: &str) -> ProtocolMessage {
    ProtocolMessage::with_channel(Action::Detached, channel)
}

pub fn ack_frame(serial: i64, count: u32) -> ProtocolMessage {
    ProtocolMessage {
        action: Action::Ack,
        msg_serial: Some(serial),
        count: Some(count),
        ..Default::default()
    }
}

pub fn nack_frame(serial: i64, count: u32, error: ErrorInfo) -> ProtocolMessage {
    ProtocolMessage {
        action: Action::Nack,
        msg_serial: Some(serial),
        count: Some(count),
        error: Some(error),
        ..Default::default()
    }
}

pub fn error_frame(error: ErrorInfo) -> ProtocolMessage {
    ProtocolMessage {
        action: Action::Error,
        error: Some(error),
        ..Default::default()
    }
}

pub fn closed_frame() -> ProtocolMessage {
    ProtocolMessage::new(Action::Closed)
}

// ---- waiting -------------------------------------------------------------

/// Poll `cond` under paused tokio time until it holds (or 30 virtual
/// seconds pass).
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..30_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached within virtual deadline");
}
