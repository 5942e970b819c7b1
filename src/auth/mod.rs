//! Credential collaborator.
//!
//! Supplies OAuth bearer tokens to the mailbox and external services and
//! announces refreshes through a `watch` generation counter.

pub mod oauth;
pub mod token_file;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{RwLock, watch};

pub use oauth::{AuthConfig, OAuthTokenSource, spawn_token_refresher};

use crate::error::AuthError;

/// Source of bearer tokens.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Current access token. Callers re-read this before every use.
    async fn access_token(&self) -> Result<SecretString, AuthError>;

    /// Generation counter, bumped each time the token changes.
    fn subscribe(&self) -> watch::Receiver<u64>;
}

/// SASL XOAUTH2 initial response, base64 encoded.
pub fn xoauth2_payload(user: &str, token: &SecretString) -> String {
    let raw = format!(
        "user={}\x01auth=Bearer {}\x01\x01",
        user,
        token.expose_secret()
    );
    STANDARD.encode(raw)
}

/// Fixed token, replaced by hand with [`rotate`](Self::rotate). For
/// pre-issued tokens and tests.
pub struct StaticTokenSource {
    token: RwLock<String>,
    generation: watch::Sender<u64>,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        let (generation, _rx) = watch::channel(0);
        Self {
            token: RwLock::new(token.into()),
            generation,
        }
    }

    /// Swap the token and notify subscribers.
    pub async fn rotate(&self, token: impl Into<String>) {
        *self.token.write().await = token.into();
        self.generation.send_modify(|g| *g += 1);
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn access_token(&self) -> Result<SecretString, AuthError> {
        Ok(SecretString::from(self.token.read().await.clone()))
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xoauth2_payload_layout() {
        let token = SecretString::from("ya29.tok".to_string());
        let encoded = xoauth2_payload("me@example.com", &token);
        let decoded = STANDARD.decode(encoded).unwrap();
        assert_eq!(
            decoded,
            b"user=me@example.com\x01auth=Bearer ya29.tok\x01\x01".to_vec()
        );
    }

    #[tokio::test]
    async fn rotate_bumps_generation() {
        let source = StaticTokenSource::new("one");
        let mut rx = source.subscribe();
        assert_eq!(*rx.borrow_and_update(), 0);

        source.rotate("two").await;
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), 1);
        assert_eq!(source.access_token().await.unwrap().expose_secret(), "two");
    }
}
