//! Persisted OAuth credentials (`token.json`).
//!
//! The file layout matches what the interactive grant flow writes:
//! `{access_token, refresh_token, scope, token_type, expiry_date}` with
//! `expiry_date` in epoch milliseconds.

use std::path::Path;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::AuthError;

/// On-disk token representation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenFile {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    /// Expiry in epoch milliseconds.
    pub expiry_date: i64,
}

/// In-memory credentials. Secrets never leave through `Debug`.
#[derive(Debug)]
pub struct Credentials {
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    pub scope: Option<String>,
    pub token_type: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl Credentials {
    /// Whether the access token expires within `margin`.
    pub fn is_expiring(&self, margin: chrono::Duration) -> bool {
        Utc::now() + margin >= self.expires_at
    }

    fn to_file(&self) -> TokenFile {
        TokenFile {
            access_token: self.access_token.expose_secret().to_string(),
            refresh_token: self
                .refresh_token
                .as_ref()
                .map(|t| t.expose_secret().to_string()),
            scope: self.scope.clone(),
            token_type: self.token_type.clone(),
            expiry_date: self.expires_at.timestamp_millis(),
        }
    }
}

impl From<TokenFile> for Credentials {
    fn from(file: TokenFile) -> Self {
        Self {
            access_token: SecretString::from(file.access_token),
            refresh_token: file.refresh_token.map(SecretString::from),
            scope: file.scope,
            token_type: file.token_type,
            expires_at: DateTime::from_timestamp_millis(file.expiry_date)
                .unwrap_or(DateTime::UNIX_EPOCH),
        }
    }
}

/// Load credentials from `path`.
pub async fn load(path: &Path) -> Result<Credentials, AuthError> {
    if !fs::try_exists(path).await? {
        return Err(AuthError::MissingCredentials {
            path: path.to_path_buf(),
        });
    }
    let raw = fs::read_to_string(path).await?;
    let file: TokenFile = serde_json::from_str(&raw)?;
    Ok(file.into())
}

/// Persist credentials to `path` (write to a sibling temp file, then rename).
pub async fn save(path: &Path, credentials: &Credentials) -> Result<(), AuthError> {
    let json = serde_json::to_string_pretty(&credentials.to_file())?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_then_load_preserves_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        let creds = Credentials {
            access_token: SecretString::from("ya29.access".to_string()),
            refresh_token: Some(SecretString::from("1//refresh".to_string())),
            scope: Some("https://mail.google.com/".into()),
            token_type: Some("Bearer".into()),
            expires_at: DateTime::from_timestamp_millis(1_900_000_000_000).unwrap(),
        };
        save(&path, &creds).await.unwrap();

        let loaded = load(&path).await.unwrap();
        assert_eq!(loaded.access_token.expose_secret(), "ya29.access");
        assert_eq!(
            loaded.refresh_token.as_ref().map(|t| t.expose_secret()),
            Some("1//refresh")
        );
        assert_eq!(loaded.expires_at, creds.expires_at);
    }

    #[tokio::test]
    async fn missing_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(&dir.path().join("nope.json")).await.unwrap_err();
        assert!(matches!(err, AuthError::MissingCredentials { .. }));
    }

    #[test]
    fn expiring_within_margin() {
        let creds = Credentials {
            access_token: SecretString::from("t".to_string()),
            refresh_token: None,
            scope: None,
            token_type: None,
            expires_at: Utc::now() + chrono::Duration::minutes(3),
        };
        assert!(creds.is_expiring(chrono::Duration::minutes(5)));
        assert!(!creds.is_expiring(chrono::Duration::minutes(1)));
    }

    #[test]
    fn parses_google_token_layout() {
        let raw = r#"{"access_token":"a","refresh_token":"r","scope":"s","token_type":"Bearer","expiry_date":1700000000000}"#;
        let file: TokenFile = serde_json::from_str(raw).unwrap();
        let creds = Credentials::from(file);
        assert_eq!(creds.expires_at.timestamp(), 1_700_000_000);
    }
}
