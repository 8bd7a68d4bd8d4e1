use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::ErrorInfo;

/// Opaque credential presented to the service when opening a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    /// Identity bound into the credential, if any.
    pub client_id: Option<String>,
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            client_id: None,
        }
    }

    pub fn with_client_id(token: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            client_id: Some(client_id.into()),
        }
    }
}

/// External credential source.
///
/// The engine calls `renew()` on token-expiry ERROR frames
/// (codes 40140-40149) and on first connect when nothing is cached.
/// Renewal failures surface as connection errors, never panics.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    fn current_credential(&self) -> Option<Credential>;

    async fn renew(&self) -> Result<Credential, ErrorInfo>;
}

/// Provider for keys that never expire.
///
/// `renew()` hands back the same credential; a token-expiry error with
/// this provider is unrecoverable and will surface as such.
pub struct StaticCredentialProvider {
    credential: Mutex<Credential>,
}

impl StaticCredentialProvider {
    pub fn new(credential: Credential) -> Arc<Self> {
        Arc::new(Self {
            credential: Mutex::new(credential),
        })
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    fn current_credential(&self) -> Option<Credential> {
        Some(self.credential.lock().clone())
    }

    async fn renew(&self) -> Result<Credential, ErrorInfo> {
        Ok(self.credential.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_provider_renews_in_place() {
        let provider = StaticCredentialProvider::new(Credential::new("key:secret"));
        let current = provider.current_credential().unwrap();
        let renewed = provider.renew().await.unwrap();
        assert_eq!(current, renewed);
    }
}
