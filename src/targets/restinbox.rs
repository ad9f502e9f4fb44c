//! REST inbox service target.
//!
//! Delivers messages through a Gmail-style REST API: the raw message is
//! uploaded base64url-encoded in a single import call, with label ids
//! resolved from the account's label list. OAuth 2.0 client credentials and
//! the refresh token live in the OS keyring under the target id; the
//! short-lived access token is held in memory and refreshed automatically.

use async_trait::async_trait;
use base64::prelude::*;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::domain::{DeliveryTrace, Message, TargetId};

use super::{Label, Result, Target, TargetError, TargetKind};

const DEFAULT_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";
const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const DEFAULT_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/auth";

/// Labels applied when a delivery configures none.
const DEFAULT_LABELS: &[&str] = &["INBOX", "UNREAD"];

/// Keyring service name for stored credentials.
const KEYRING_SERVICE: &str = "loreferry";

/// Endpoint configuration for a REST inbox service.
#[derive(Debug, Clone)]
pub struct RestInboxConfig {
    /// API base, up to and including the account segment.
    pub api_base: String,
    /// OAuth2 token endpoint.
    pub token_url: String,
    /// OAuth2 authorization endpoint (interactive flow).
    pub auth_url: String,
    /// Scopes requested during authorization.
    pub scopes: Vec<String>,
}

impl Default for RestInboxConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            auth_url: DEFAULT_AUTH_URL.to_string(),
            scopes: vec![
                "https://www.googleapis.com/auth/gmail.labels".to_string(),
                "https://www.googleapis.com/auth/gmail.insert".to_string(),
            ],
        }
    }
}

/// OAuth credentials stored in the keyring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestInboxCredentials {
    /// OAuth client ID.
    pub client_id: String,
    /// OAuth client secret.
    pub client_secret: String,
    /// OAuth refresh token; empty until the first authorization.
    #[serde(default)]
    pub refresh_token: String,
}

/// Token endpoint response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[allow(dead_code)]
    expires_in: Option<u64>,
}

/// Import request body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImportRequest {
    raw: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    label_ids: Vec<String>,
}

/// Label list response.
#[derive(Debug, Deserialize)]
struct LabelsListResponse {
    labels: Option<Vec<ApiLabel>>,
}

#[derive(Debug, Deserialize)]
struct ApiLabel {
    id: String,
    name: String,
}

/// REST inbox target.
pub struct RestInboxTarget {
    id: TargetId,
    config: RestInboxConfig,
    client: reqwest::Client,
    credentials: Option<RestInboxCredentials>,
    access_token: Option<String>,
    label_map: Option<HashMap<String, String>>,
}

impl RestInboxTarget {
    /// Creates a target for the given id; credentials are looked up in the
    /// keyring on first [`authenticate`](Target::authenticate).
    pub fn new(id: TargetId, config: RestInboxConfig) -> Self {
        Self {
            id,
            config,
            client: reqwest::Client::new(),
            credentials: None,
            access_token: None,
            label_map: None,
        }
    }

    /// Creates a target with explicit credentials (tests, first-run setup).
    pub fn with_credentials(
        id: TargetId,
        config: RestInboxConfig,
        credentials: RestInboxCredentials,
    ) -> Self {
        Self {
            id,
            config,
            client: reqwest::Client::new(),
            credentials: Some(credentials),
            access_token: None,
            label_map: None,
        }
    }

    fn keyring_entry(&self) -> Result<keyring::Entry> {
        keyring::Entry::new(KEYRING_SERVICE, &format!("restinbox-{}", self.id.0))
            .map_err(|e| TargetError::AuthRequired(format!("keyring error: {}", e)))
    }

    /// Loads credentials from the system keyring.
    fn load_credentials_from_keyring(&self) -> Result<RestInboxCredentials> {
        let creds_json = self
            .keyring_entry()?
            .get_password()
            .map_err(|e| TargetError::AuthRequired(format!("no stored credentials: {}", e)))?;
        serde_json::from_str(&creds_json)
            .map_err(|e| TargetError::AuthRequired(format!("invalid stored credentials: {}", e)))
    }

    /// Saves credentials to the system keyring.
    pub fn save_credentials_to_keyring(&self, credentials: &RestInboxCredentials) -> Result<()> {
        let creds_json = serde_json::to_string(credentials)
            .map_err(|e| TargetError::Permanent(format!("serialize error: {}", e)))?;
        self.keyring_entry()?
            .set_password(&creds_json)
            .map_err(|e| TargetError::AuthRequired(format!("keyring error: {}", e)))?;
        Ok(())
    }

    /// Refreshes the access token using the stored refresh token.
    async fn refresh_access_token(&mut self) -> Result<()> {
        let credentials = self
            .credentials
            .as_ref()
            .ok_or_else(|| TargetError::AuthRequired("no credentials loaded".to_string()))?;

        if credentials.refresh_token.is_empty() {
            return Err(TargetError::AuthRequired(format!(
                "target '{}' has never been authorized",
                self.id
            )));
        }

        let params = [
            ("client_id", credentials.client_id.as_str()),
            ("client_secret", credentials.client_secret.as_str()),
            ("refresh_token", credentials.refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ];

        let response = self
            .client
            .post(&self.config.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| TargetError::Transient(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            // A rejected grant means the refresh token is dead; anything
            // else at the token endpoint is worth retrying.
            if status.as_u16() == 400 || status.as_u16() == 401 {
                return Err(TargetError::AuthRequired(format!(
                    "token refresh rejected ({}): {}",
                    status, body
                )));
            }
            return Err(TargetError::Transient(format!(
                "token refresh failed ({}): {}",
                status, body
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| TargetError::Transient(format!("parse token response: {}", e)))?;
        self.access_token = Some(token.access_token);
        debug!(target = %self.id, "access token refreshed");
        Ok(())
    }

    fn auth_headers(&self) -> Result<HeaderMap> {
        let token = self
            .access_token
            .as_ref()
            .ok_or_else(|| TargetError::AuthRequired("not authenticated".to_string()))?;
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| TargetError::Permanent(format!("invalid header: {}", e)))?,
        );
        Ok(headers)
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, endpoint: &str) -> Result<T> {
        let url = format!("{}{}", self.config.api_base, endpoint);
        let headers = self.auth_headers()?;
        let response = self
            .client
            .get(&url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| TargetError::Transient(e.to_string()))?;
        self.handle_response(response).await
    }

    async fn post_json<T: for<'de> Deserialize<'de>, B: Serialize>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<T> {
        let url = format!("{}{}", self.config.api_base, endpoint);
        let mut headers = self.auth_headers()?;
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let response = self
            .client
            .post(&url)
            .headers(headers)
            .json(body)
            .send()
            .await
            .map_err(|e| TargetError::Transient(e.to_string()))?;
        self.handle_response(response).await
    }

    async fn handle_response<T: for<'de> Deserialize<'de>>(
        &self,
        response: reqwest::Response,
    ) -> Result<T> {
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| TargetError::Transient(format!("parse response: {}", e)))
    }

    async fn handle_error(&self, response: reqwest::Response) -> TargetError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        match status.as_u16() {
            401 => TargetError::AuthRequired(format!("unauthorized: {}", body)),
            429 => TargetError::Transient("rate limit exceeded".to_string()),
            500..=599 => TargetError::Transient(format!("server error ({}): {}", status, body)),
            _ => TargetError::Permanent(format!("API error ({}): {}", status, body)),
        }
    }

    /// Translates label names to backend ids, caching the label list.
    async fn translate_labels(&mut self, labels: &[String]) -> Result<Vec<String>> {
        if self.label_map.is_none() {
            let list = self.fetch_labels().await?;
            self.label_map = Some(list.into_iter().map(|l| (l.name, l.id)).collect());
        }
        let map = self
            .label_map
            .as_ref()
            .ok_or_else(|| TargetError::Transient("label map unavailable".to_string()))?;

        let mut translated = Vec::with_capacity(labels.len());
        for label in labels {
            let id = map.get(label).ok_or_else(|| {
                TargetError::Permanent(format!(
                    "label '{}' not found in '{}'",
                    label, self.id
                ))
            })?;
            translated.push(id.clone());
        }
        Ok(translated)
    }

    async fn fetch_labels(&self) -> Result<Vec<Label>> {
        let response: LabelsListResponse = self.get_json("/labels").await?;
        Ok(response
            .labels
            .unwrap_or_default()
            .into_iter()
            .map(|l| Label {
                id: l.id,
                name: l.name,
            })
            .collect())
    }

    /// Runs the interactive browser authorization and stores the resulting
    /// refresh token in the keyring.
    async fn run_authorization(&mut self) -> Result<()> {
        if self.credentials.is_none() {
            self.credentials = Some(self.load_credentials_from_keyring()?);
        }
        let credentials = self
            .credentials
            .as_ref()
            .ok_or_else(|| TargetError::AuthRequired("no credentials loaded".to_string()))?;

        let tmp = tempdir_token_path(&self.id);
        let authenticator = crate::auth::Authenticator::new(
            crate::auth::OAuthConfig {
                auth_url: self.config.auth_url.clone(),
                token_url: self.config.token_url.clone(),
                client_id: credentials.client_id.clone(),
                client_secret: Some(credentials.client_secret.clone()),
                scopes: self.config.scopes.clone(),
                login_hint: None,
            },
            crate::auth::TokenCache::new(&tmp),
        );

        let token = authenticator.authorize().await?;
        let updated = RestInboxCredentials {
            client_id: credentials.client_id.clone(),
            client_secret: credentials.client_secret.clone(),
            refresh_token: token.refresh_token.clone(),
        };
        self.save_credentials_to_keyring(&updated)?;
        self.credentials = Some(updated);
        self.access_token = Some(token.access_token);
        let _ = std::fs::remove_file(&tmp);
        info!(target = %self.id, "authorization complete, refresh token stored");
        Ok(())
    }
}

/// Scratch token-cache path for the interactive flow; the durable home of
/// the refresh token is the keyring, not this file.
fn tempdir_token_path(id: &TargetId) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("loreferry-restinbox-{}.json", id.0))
}

#[async_trait]
impl Target for RestInboxTarget {
    fn id(&self) -> &TargetId {
        &self.id
    }

    fn kind(&self) -> TargetKind {
        TargetKind::RestInbox
    }

    async fn authenticate(&mut self) -> Result<()> {
        if self.credentials.is_none() {
            self.credentials = Some(self.load_credentials_from_keyring()?);
        }
        if self.access_token.is_none() {
            self.refresh_access_token().await?;
        }
        Ok(())
    }

    async fn deliver(
        &mut self,
        message: &Message,
        labels: &[String],
        trace: &DeliveryTrace,
    ) -> Result<()> {
        self.authenticate().await?;

        let effective: Vec<String> = if labels.is_empty() {
            DEFAULT_LABELS.iter().map(|s| s.to_string()).collect()
        } else {
            labels.to_vec()
        };
        let label_ids = self.translate_labels(&effective).await?;

        let wire = message.for_delivery(Some(trace));
        let request = ImportRequest {
            raw: BASE64_URL_SAFE.encode(wire),
            label_ids,
        };

        let _: serde_json::Value = self.post_json("/messages/import", &request).await?;
        debug!(target = %self.id, msgid = %message.message_id(), "imported message");
        Ok(())
    }

    async fn list_labels(&mut self) -> Result<Vec<Label>> {
        self.authenticate().await?;
        self.fetch_labels().await
    }

    async fn authorize(&mut self) -> Result<()> {
        self.run_authorization().await
    }
}
