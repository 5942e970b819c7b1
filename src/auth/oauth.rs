//! OAuth refresh-token credential source.
//!
//! Holds the shared, mutable credentials. `access_token()` refreshes lazily
//! when the token is close to expiry; a background refresher does the same on
//! an interval. Every refresh persists `token.json` and bumps a `watch`
//! generation that the connection manager subscribes to.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::TokenSource;
use super::token_file::{self, Credentials};
use crate::config::{env_or, env_required, env_secs};
use crate::error::{AuthError, ConfigError};

/// Google's OAuth token endpoint.
pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Tokens expiring within this window are refreshed.
const EXPIRY_MARGIN_MINUTES: i64 = 5;

/// Credential collaborator configuration.
#[derive(Debug)]
pub struct AuthConfig {
    pub client_id: String,
    pub client_secret: SecretString,
    /// Where the grant flow stored `token.json`.
    pub token_path: PathBuf,
    pub token_uri: String,
    /// How often the background refresher checks expiry.
    pub check_interval: Duration,
}

impl AuthConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            client_id: env_required("INTAKE_CLIENT_ID")?,
            client_secret: SecretString::from(env_required("INTAKE_CLIENT_SECRET")?),
            token_path: PathBuf::from(env_or("INTAKE_TOKEN_PATH", "token.json")),
            token_uri: env_or("INTAKE_TOKEN_URI", DEFAULT_TOKEN_URI),
            check_interval: env_secs("INTAKE_TOKEN_CHECK_SECS", 60)?,
        })
    }
}

/// Token endpoint response for the refresh grant.
#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
}

/// Refresh-token backed [`TokenSource`].
pub struct OAuthTokenSource {
    config: AuthConfig,
    http: reqwest::Client,
    credentials: RwLock<Credentials>,
    /// Serializes refreshes so concurrent callers don't race the endpoint.
    refresh_lock: Mutex<()>,
    generation: watch::Sender<u64>,
}

impl OAuthTokenSource {
    /// Load persisted credentials. A missing token file is an error: the
    /// interactive grant flow runs outside this service.
    pub async fn load(config: AuthConfig) -> Result<Arc<Self>, AuthError> {
        let credentials = token_file::load(&config.token_path).await?;
        info!(
            path = %config.token_path.display(),
            expires_at = %credentials.expires_at,
            "Loaded stored credentials"
        );
        let (generation, _rx) = watch::channel(0);
        Ok(Arc::new(Self {
            config,
            http: reqwest::Client::new(),
            credentials: RwLock::new(credentials),
            refresh_lock: Mutex::new(()),
            generation,
        }))
    }

    /// Whether the current access token is about to expire.
    pub async fn is_expiring(&self) -> bool {
        self.credentials
            .read()
            .await
            .is_expiring(chrono::Duration::minutes(EXPIRY_MARGIN_MINUTES))
    }

    /// Exchange the refresh token for a new access token, persist it, and
    /// notify subscribers. A caller that waited on a refresh already in flight
    /// gets that result instead of refreshing again.
    pub async fn refresh(&self) -> Result<SecretString, AuthError> {
        let _guard = self.refresh_lock.lock().await;

        if !self.is_expiring().await {
            debug!("Token already refreshed by another caller");
            let creds = self.credentials.read().await;
            return Ok(SecretString::from(creds.access_token.expose_secret().to_string()));
        }

        let refresh_token = {
            let creds = self.credentials.read().await;
            creds
                .refresh_token
                .as_ref()
                .map(|t| t.expose_secret().to_string())
                .ok_or(AuthError::NoRefreshToken)?
        };

        let form = [
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.expose_secret()),
            ("refresh_token", refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ];

        let response = self
            .http
            .post(&self.config.token_uri)
            .form(&form)
            .send()
            .await
            .map_err(|e| AuthError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::RefreshFailed {
                reason: format!("status {status}: {body}"),
            });
        }

        let refreshed: RefreshResponse = response
            .json()
            .await
            .map_err(|e| AuthError::RefreshFailed {
                reason: format!("malformed token response: {e}"),
            })?;

        let access = refreshed.access_token.clone();
        {
            let mut creds = self.credentials.write().await;
            creds.access_token = SecretString::from(refreshed.access_token);
            // Google only returns a refresh token on first grant; keep the old one.
            if let Some(rt) = refreshed.refresh_token {
                creds.refresh_token = Some(SecretString::from(rt));
            }
            if refreshed.scope.is_some() {
                creds.scope = refreshed.scope;
            }
            if refreshed.token_type.is_some() {
                creds.token_type = refreshed.token_type;
            }
            creds.expires_at =
                chrono::Utc::now() + chrono::Duration::seconds(refreshed.expires_in.unwrap_or(3599));
            token_file::save(&self.config.token_path, &creds).await?;
            info!(expires_at = %creds.expires_at, "Token refreshed and saved");
        }

        self.generation.send_modify(|g| *g += 1);
        Ok(SecretString::from(access))
    }
}

#[async_trait]
impl TokenSource for OAuthTokenSource {
    async fn access_token(&self) -> Result<SecretString, AuthError> {
        if self.is_expiring().await {
            debug!("Access token expiring, refreshing before use");
            return self.refresh().await;
        }
        let creds = self.credentials.read().await;
        Ok(SecretString::from(creds.access_token.expose_secret().to_string()))
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }
}

/// Spawn the background refresher. Runs until the source is dropped by every
/// other owner and the task is aborted.
pub fn spawn_token_refresher(source: Arc<OAuthTokenSource>) -> JoinHandle<()> {
    let interval = source.config.check_interval;
    tokio::spawn(async move {
        info!("Token refresher started, checking every {}s", interval.as_secs());
        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            if !source.is_expiring().await {
                continue;
            }
            if let Err(e) = source.refresh().await {
                error!(error = %e, "Background token refresh failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::{Json, Router, extract::State, routing::post};
    use serde_json::{Value, json};
    use tempfile::TempDir;

    use super::*;

    async fn token_endpoint(State(hits): State<Arc<AtomicUsize>>) -> Json<Value> {
        hits.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        Json(json!({"access_token": "fresh", "expires_in": 3600}))
    }

    async fn serve(hits: Arc<AtomicUsize>) -> String {
        let app = Router::new().route("/token", post(token_endpoint)).with_state(hits);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        format!("http://{addr}/token")
    }

    async fn expired_source(dir: &TempDir, token_uri: String) -> Arc<OAuthTokenSource> {
        let token_path = dir.path().join("token.json");
        tokio::fs::write(
            &token_path,
            json!({"access_token": "stale", "refresh_token": "r-1", "expiry_date": 0}).to_string(),
        )
        .await
        .unwrap();
        OAuthTokenSource::load(AuthConfig {
            client_id: "client".into(),
            client_secret: SecretString::from("secret"),
            token_path,
            token_uri,
            check_interval: Duration::from_secs(60),
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let dir = TempDir::new().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let source = expired_source(&dir, serve(hits.clone()).await).await;
        let mut generation = source.subscribe();

        let (a, b) = tokio::join!(source.access_token(), source.access_token());
        assert_eq!(a.unwrap().expose_secret(), "fresh");
        assert_eq!(b.unwrap().expose_secret(), "fresh");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(generation.has_changed().unwrap());
        assert_eq!(*generation.borrow_and_update(), 1);
    }

    #[tokio::test]
    async fn refresh_is_persisted() {
        let dir = TempDir::new().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let source = expired_source(&dir, serve(hits).await).await;

        source.refresh().await.unwrap();
        assert!(!source.is_expiring().await);
        let saved = token_file::load(&dir.path().join("token.json")).await.unwrap();
        assert_eq!(saved.access_token.expose_secret(), "fresh");
        // The endpoint did not return a refresh token; the old one stays.
        assert_eq!(saved.refresh_token.unwrap().expose_secret(), "r-1");
    }
}
