use std::time::Duration;

use crate::error::RtError;

/// Production endpoint used when no custom host or environment is set.
pub const DEFAULT_HOST: &str = "realtime.rtlink.net";

/// Default fallback endpoints, tried in randomized order once the
/// primary host has failed within a retry cycle.
pub const DEFAULT_FALLBACK_HOSTS: [&str; 5] = [
    "a.fallback.rtlink.net",
    "b.fallback.rtlink.net",
    "c.fallback.rtlink.net",
    "d.fallback.rtlink.net",
    "e.fallback.rtlink.net",
];

/// Default service port (TLS).
pub const DEFAULT_PORT: u16 = 443;

/// Client configuration surface recognized by the engine.
///
/// Every timing knob is injected from here; nothing reads package-level
/// globals, so tests can shrink timeouts freely.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Custom endpoint. Setting this disables host fallback.
    pub host: Option<String>,
    /// Custom port. Setting this disables host fallback.
    pub port: Option<u16>,
    /// Named environment, prefixed onto the default host when set.
    pub environment: Option<String>,
    /// Identity asserted by this client, if any.
    pub client_id: Option<String>,
    /// A persisted `recovery_key` from a previous client, to resume
    /// that session on first connect.
    pub recover: Option<String>,

    /// Delay between reconnect attempts while `disconnected`.
    pub disconnected_retry_timeout: Duration,
    /// Delay between reconnect attempts while `suspended`.
    pub suspended_retry_timeout: Duration,
    /// Total time in the disconnected/connecting cycle before suspension.
    pub max_connection_state_ttl: Duration,
    /// Window for a single protocol request (connect, attach, close).
    pub realtime_request_timeout: Duration,
    /// Delay before a failed channel attach is retried.
    pub channel_retry_timeout: Duration,
    /// How long a successful fallback host stays preferred.
    pub fallback_retry_timeout: Duration,

    /// Queue publishes while the channel is not yet attached.
    pub queue_messages: bool,
    /// Deliver this connection's own publishes back to it.
    pub echo_messages: bool,
    /// Fallback hosts; empty list disables fallback outright.
    pub fallback_hosts: Option<Vec<String>>,
    /// Use the built-in fallback list.
    pub fallback_hosts_use_default: bool,
    /// Upper bound on messages accepted by a single publish call.
    pub max_protocol_message_batch_size: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            environment: None,
            client_id: None,
            recover: None,
            disconnected_retry_timeout: Duration::from_secs(15),
            suspended_retry_timeout: Duration::from_secs(30),
            max_connection_state_ttl: Duration::from_secs(120),
            realtime_request_timeout: Duration::from_secs(10),
            channel_retry_timeout: Duration::from_secs(15),
            fallback_retry_timeout: Duration::from_secs(600),
            queue_messages: true,
            echo_messages: true,
            fallback_hosts: None,
            fallback_hosts_use_default: true,
            max_protocol_message_batch_size: 100,
        }
    }
}

impl ClientOptions {
    pub fn validate(&self) -> Result<(), RtError> {
        if self.max_protocol_message_batch_size == 0 {
            return Err(RtError::config_error(
                "max_protocol_message_batch_size",
                "must be at least 1",
            ));
        }
        if self.disconnected_retry_timeout.is_zero() {
            return Err(RtError::config_error(
                "disconnected_retry_timeout",
                "must be non-zero",
            ));
        }
        if self.suspended_retry_timeout.is_zero() {
            return Err(RtError::config_error(
                "suspended_retry_timeout",
                "must be non-zero",
            ));
        }
        if let Some(hosts) = &self.fallback_hosts {
            if !hosts.is_empty() && self.host.is_some() {
                return Err(RtError::config_error(
                    "fallback_hosts",
                    "custom host and explicit fallback hosts are mutually exclusive",
                ));
            }
        }
        if let Some(environment) = &self.environment {
            if environment.is_empty() {
                return Err(RtError::config_error("environment", "must not be empty"));
            }
        }
        Ok(())
    }

    /// The host used for the first attempt of every retry cycle.
    pub fn primary_host(&self) -> String {
        if let Some(host) = &self.host {
            return host.clone();
        }
        match &self.environment {
            Some(environment) => format!("{}-{}", environment, DEFAULT_HOST),
            None => DEFAULT_HOST.to_string(),
        }
    }

    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    /// Fallback is skipped entirely under a custom host or port.
    pub fn fallback_eligible(&self) -> bool {
        self.host.is_none() && self.port.is_none()
    }

    /// The fallback host list in configuration order, before shuffling.
    pub fn configured_fallback_hosts(&self) -> Vec<String> {
        if !self.fallback_eligible() {
            return Vec::new();
        }
        if let Some(hosts) = &self.fallback_hosts {
            return hosts.clone();
        }
        if self.fallback_hosts_use_default {
            DEFAULT_FALLBACK_HOSTS.iter().map(|h| h.to_string()).collect()
        } else {
            Vec::new()
        }
    }
}
