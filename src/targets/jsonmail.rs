//! JSON mail protocol target.
//!
//! Speaks a JMAP-style protocol: a session document is fetched from the
//! well-known endpoint, the raw message is uploaded as a blob, and a single
//! import call files it into mailboxes. Labels are mapped to mailboxes by
//! name or role, case-insensitively. Authentication is a static bearer
//! token, inline or read from a file.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::debug;

use crate::domain::{DeliveryTrace, Message, TargetId};

use super::{Label, Result, Target, TargetError, TargetKind};

const JMAP_CORE_URN: &str = "urn:ietf:params:jmap:core";
const JMAP_MAIL_URN: &str = "urn:ietf:params:jmap:mail";

/// Configuration for a JSON mail target.
#[derive(Debug, Clone)]
pub struct JsonMailConfig {
    /// Server base URL (scheme + host).
    pub server: String,
    /// Account username, used to pick the account from the session.
    pub username: String,
    /// Bearer token, inline.
    pub token: Option<String>,
    /// Bearer token file; read and trimmed at construction.
    pub token_file: Option<PathBuf>,
}

/// Resolved session state.
#[derive(Debug, Clone)]
struct Session {
    api_url: String,
    upload_url: String,
    account_id: String,
}

/// Session document subset.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    api_url: String,
    upload_url: String,
    accounts: HashMap<String, AccountInfo>,
    #[serde(default)]
    primary_accounts: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct AccountInfo {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    blob_id: String,
}

/// One mailbox known to the server.
#[derive(Debug, Clone)]
struct Mailbox {
    id: String,
    name: String,
    role: String,
}

/// JSON mail target.
#[derive(Debug)]
pub struct JsonMailTarget {
    id: TargetId,
    server: String,
    username: String,
    token: String,
    client: reqwest::Client,
    session: Option<Session>,
    mailboxes: Option<Vec<Mailbox>>,
}

impl JsonMailTarget {
    /// Creates a target, resolving the bearer token eagerly.
    pub fn new(id: TargetId, config: JsonMailConfig) -> Result<Self> {
        let token = match (config.token, config.token_file) {
            (Some(token), _) => token,
            (None, Some(path)) => {
                let path = expand_tilde(&path);
                if !path.exists() {
                    return Err(TargetError::Permanent(format!(
                        "token file not found: {}",
                        path.display()
                    )));
                }
                std::fs::read_to_string(&path)
                    .map_err(|e| {
                        TargetError::Permanent(format!(
                            "token file {} unreadable: {}",
                            path.display(),
                            e
                        ))
                    })?
                    .trim()
                    .to_string()
            }
            (None, None) => {
                return Err(TargetError::Permanent(format!(
                    "no token or token_file specified for '{}'",
                    id
                )))
            }
        };

        Ok(Self {
            id,
            server: config.server.trim_end_matches('/').to_string(),
            username: config.username,
            token,
            client: reqwest::Client::new(),
            session: None,
            mailboxes: None,
        })
    }

    fn classify_status(&self, status: reqwest::StatusCode, body: String) -> TargetError {
        match status.as_u16() {
            // A static bearer token cannot be refreshed; rejection is a
            // hard authentication failure.
            401 | 403 => TargetError::Permanent(format!("bearer token rejected: {}", body)),
            429 => TargetError::Transient("rate limit exceeded".to_string()),
            500..=599 => TargetError::Transient(format!("server error ({}): {}", status, body)),
            _ => TargetError::Permanent(format!("API error ({}): {}", status, body)),
        }
    }

    /// Fetches the session document and resolves the mail account.
    async fn connect(&mut self) -> Result<Session> {
        if let Some(session) = &self.session {
            return Ok(session.clone());
        }

        let url = format!("{}/.well-known/jmap", self.server);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| TargetError::Transient(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(self.classify_status(status, body));
        }

        let doc: SessionResponse = response
            .json()
            .await
            .map_err(|e| TargetError::Transient(format!("parse session: {}", e)))?;

        let account_id = doc
            .primary_accounts
            .get(JMAP_MAIL_URN)
            .cloned()
            .or_else(|| {
                doc.accounts
                    .iter()
                    .find(|(_, info)| info.name == self.username)
                    .map(|(id, _)| id.clone())
            })
            .or_else(|| {
                let mut ids: Vec<&String> = doc.accounts.keys().collect();
                ids.sort();
                ids.first().map(|id| (*id).clone())
            })
            .ok_or_else(|| {
                TargetError::Permanent(format!("no account in session at {}", self.server))
            })?;

        let session = Session {
            api_url: doc.api_url,
            upload_url: doc.upload_url,
            account_id,
        };
        debug!(target = %self.id, account = %session.account_id, "session established");
        self.session = Some(session.clone());
        Ok(session)
    }

    /// Issues one method call and returns its response arguments.
    async fn call(&self, session: &Session, method: &str, args: Value) -> Result<Value> {
        let body = json!({
            "using": [JMAP_CORE_URN, JMAP_MAIL_URN],
            "methodCalls": [[method, args, "0"]],
        });

        let response = self
            .client
            .post(&session.api_url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| TargetError::Transient(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(self.classify_status(status, body));
        }

        let doc: Value = response
            .json()
            .await
            .map_err(|e| TargetError::Transient(format!("parse response: {}", e)))?;

        let first = doc
            .get("methodResponses")
            .and_then(|r| r.get(0))
            .ok_or_else(|| TargetError::Permanent("empty method response".to_string()))?;

        let name = first.get(0).and_then(Value::as_str).unwrap_or_default();
        let args = first.get(1).cloned().unwrap_or(Value::Null);
        if name == "error" {
            return Err(TargetError::Permanent(format!(
                "method {} failed: {}",
                method, args
            )));
        }
        Ok(args)
    }

    /// Fetches (and caches) the account's mailboxes.
    async fn mailboxes(&mut self) -> Result<Vec<Mailbox>> {
        if let Some(mailboxes) = &self.mailboxes {
            return Ok(mailboxes.clone());
        }

        let session = self.connect().await?;
        let args = self
            .call(
                &session,
                "Mailbox/get",
                json!({ "accountId": session.account_id.clone(), "ids": null }),
            )
            .await?;

        let list = args
            .get("list")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mailboxes: Vec<Mailbox> = list
            .iter()
            .filter_map(|mb| {
                Some(Mailbox {
                    id: mb.get("id")?.as_str()?.to_string(),
                    name: mb
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    role: mb
                        .get("role")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                })
            })
            .collect();

        self.mailboxes = Some(mailboxes.clone());
        Ok(mailboxes)
    }

    /// Maps label names to mailbox ids, matching names and roles
    /// case-insensitively. Empty labels fall back to the inbox role.
    async fn resolve_mailboxes(&mut self, labels: &[String]) -> Result<Vec<String>> {
        let mailboxes = self.mailboxes().await?;

        if labels.is_empty() {
            return mailboxes
                .iter()
                .find(|mb| mb.role.eq_ignore_ascii_case("inbox"))
                .map(|mb| vec![mb.id.clone()])
                .ok_or_else(|| {
                    TargetError::Permanent(format!("no inbox mailbox on '{}'", self.id))
                });
        }

        let mut ids = Vec::with_capacity(labels.len());
        for label in labels {
            let found = mailboxes.iter().find(|mb| {
                mb.name.eq_ignore_ascii_case(label) || mb.role.eq_ignore_ascii_case(label)
            });
            match found {
                Some(mb) => ids.push(mb.id.clone()),
                None => {
                    return Err(TargetError::Permanent(format!(
                        "no mailbox matching label '{}' on '{}'",
                        label, self.id
                    )))
                }
            }
        }
        Ok(ids)
    }

    /// Uploads the raw message, returning its blob id.
    async fn upload(&self, session: &Session, wire: Vec<u8>) -> Result<String> {
        let url = session
            .upload_url
            .replace("{accountId}", &session.account_id);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .header(reqwest::header::CONTENT_TYPE, "message/rfc822")
            .body(wire)
            .send()
            .await
            .map_err(|e| TargetError::Transient(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(self.classify_status(status, body));
        }

        let upload: UploadResponse = response
            .json()
            .await
            .map_err(|e| TargetError::Transient(format!("parse upload response: {}", e)))?;
        Ok(upload.blob_id)
    }
}

#[async_trait]
impl Target for JsonMailTarget {
    fn id(&self) -> &TargetId {
        &self.id
    }

    fn kind(&self) -> TargetKind {
        TargetKind::JsonMail
    }

    async fn authenticate(&mut self) -> Result<()> {
        self.connect().await?;
        Ok(())
    }

    async fn deliver(
        &mut self,
        message: &Message,
        labels: &[String],
        trace: &DeliveryTrace,
    ) -> Result<()> {
        let session = self.connect().await?;
        let mailbox_ids = self.resolve_mailboxes(labels).await?;

        let wire = message.for_delivery(Some(trace));
        let blob_id = self.upload(&session, wire).await?;

        let mailbox_map: serde_json::Map<String, Value> = mailbox_ids
            .into_iter()
            .map(|id| (id, Value::Bool(true)))
            .collect();
        let args = self
            .call(
                &session,
                "Email/import",
                json!({
                    "accountId": session.account_id.clone(),
                    "emails": {
                        "msg": {
                            "blobId": blob_id,
                            "mailboxIds": mailbox_map,
                            "keywords": {},
                        }
                    }
                }),
            )
            .await?;

        if args.get("created").and_then(|c| c.get("msg")).is_some() {
            debug!(target = %self.id, msgid = %message.message_id(), "imported message");
            return Ok(());
        }

        let not_created = args.get("notCreated").and_then(|c| c.get("msg"));
        if let Some(reason) = not_created {
            let kind = reason.get("type").and_then(Value::as_str).unwrap_or("");
            // The server already holds this message: success for our
            // bookkeeping, which only cares that the message is there.
            if kind == "alreadyExists" {
                debug!(
                    target = %self.id,
                    msgid = %message.message_id(),
                    "message already exists on server"
                );
                return Ok(());
            }
            return Err(TargetError::Permanent(format!(
                "import rejected ({}): {}",
                kind, reason
            )));
        }

        Err(TargetError::Permanent(
            "import response named neither created nor notCreated".to_string(),
        ))
    }

    async fn list_labels(&mut self) -> Result<Vec<Label>> {
        Ok(self
            .mailboxes()
            .await?
            .into_iter()
            .map(|mb| Label {
                id: mb.id,
                name: mb.name,
            })
            .collect())
    }
}

/// Minimal `~` expansion for token file paths.
fn expand_tilde(path: &std::path::Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    path.to_path_buf()
}
