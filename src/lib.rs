/// rtlink - realtime publish/subscribe client engine
///
/// Maintains one long-lived logical connection to a hosted realtime
/// messaging service over a replaceable transport, multiplexes named
/// channels over it, and guarantees ordered, acknowledged delivery
/// across transport failures via session resume and host fallback.

// Core protocol types
pub mod error;
pub mod message;
pub mod protocol;

// Infrastructure
pub mod auth;
pub mod config;
pub mod events;
pub mod hosts;
pub mod transport;

// Protocol state machines
pub mod channel;
pub mod connection;
pub mod dispatcher;
pub mod pending;
pub mod presence;

// Client facade
pub mod client;

// Re-export the core types
pub use auth::{Credential, CredentialProvider, StaticCredentialProvider};
pub use channel::{ChannelEvent, ChannelState, ChannelStateChange};
pub use client::{ChannelHandle, RtClient};
pub use config::ClientOptions;
pub use connection::{ConnectionEvent, ConnectionState, ConnectionStateChange};
pub use error::{ErrorInfo, RtError};
pub use events::EventStream;
pub use message::{Message, PresenceAction, PresenceMessage};
pub use protocol::{Action, ConnectionDetails, FrameCodec, ProtocolMessage};
pub use transport::{ResumeParams, Transport, TransportEvent, TransportFactory, TransportParams};

/// Convenient result alias for fallible engine APIs.
pub type Result<T> = std::result::Result<T, RtError>;
