use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::auth::Credential;
use crate::error::{ErrorInfo, RtError};
use crate::protocol::ProtocolMessage;

/// Resumption fields attached to a reconnect attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeParams {
    pub connection_key: String,
    /// Last serial this client confirmed before losing the transport.
    pub connection_serial: i64,
}

/// Everything a transport needs to open one connection attempt.
#[derive(Debug, Clone)]
pub struct TransportParams {
    pub host: String,
    pub port: u16,
    pub credential: Credential,
    pub client_id: Option<String>,
    pub echo_messages: bool,
    pub resume: Option<ResumeParams>,
}

impl TransportParams {
    /// Connection query string as a concrete transport would send it.
    pub fn query_string(&self) -> String {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        query.append_pair("access_token", &self.credential.token);
        query.append_pair("echo", if self.echo_messages { "true" } else { "false" });
        if let Some(client_id) = &self.client_id {
            query.append_pair("clientId", client_id);
        }
        if let Some(resume) = &self.resume {
            query.append_pair("resume", &resume.connection_key);
            query.append_pair("connectionSerial", &resume.connection_serial.to_string());
        }
        query.finish()
    }
}

/// Inbound notifications from an open transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Frame(ProtocolMessage),
    /// Transport ended. `error` present means it ended abnormally.
    Closed { error: Option<ErrorInfo> },
}

/// One open transport. Frame delivery happens on the receiver handed
/// back by `TransportFactory::open`; this trait is the outbound half.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, frame: ProtocolMessage) -> Result<(), RtError>;

    /// Close the underlying socket. Idempotent.
    async fn close(&mut self);

    /// Host this transport was opened against (fallback bookkeeping).
    fn host(&self) -> &str;
}

/// Opens transports. The concrete WebSocket/socket machinery lives
/// behind this seam and is out of scope for the engine.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Suspends until the transport is connected or failed.
    async fn open(
        &self,
        params: TransportParams,
    ) -> Result<(Box<dyn Transport>, mpsc::Receiver<TransportEvent>), RtError>;
}
