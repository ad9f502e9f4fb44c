//! Delivery target trait definition.
//!
//! This module defines the [`Target`] trait which abstracts over the
//! delivery backends (REST inbox, IMAP, JSON mail, maildir, pipe). The
//! engine drives every backend through this one contract; the variant is
//! chosen from configuration at construction time.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::auth::AuthError;
use crate::domain::{DeliveryTrace, Message, TargetId};

/// Result type alias for target operations.
pub type Result<T> = std::result::Result<T, TargetError>;

/// Errors that can occur during target operations.
///
/// The split between transient and permanent drives the engine's retry
/// policy: transient failures leave the delivery record pending for the
/// next run, permanent failures are recorded and surfaced, and
/// authentication-required conditions pause the delivery until the operator
/// completes the interactive step.
#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    /// An interactive authentication step is needed.
    #[error("authentication required: {0}")]
    AuthRequired(String),

    /// Temporary failure (network, timeout, rate limit). Retried next run.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The target rejected the message or the credential is hard-revoked.
    /// Recorded as failed; never auto-retried.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// The caller asked for an operation this variant cannot perform.
    #[error("unsupported capability: {0}")]
    CapabilityUnsupported(&'static str),
}

impl From<AuthError> for TargetError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Required(msg) => TargetError::AuthRequired(msg),
            AuthError::Network(msg) => TargetError::Transient(msg),
            AuthError::Io(e) => TargetError::Transient(e.to_string()),
            other => TargetError::Permanent(other.to_string()),
        }
    }
}

/// Kind tag of a target backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    /// REST-based inbox service.
    RestInbox,
    /// IMAP server (password or OAuth2).
    Imap,
    /// JSON mail protocol server.
    JsonMail,
    /// Local maildir.
    Maildir,
    /// External command fed on stdin.
    Pipe,
}

/// A label (or folder) known to a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    /// Backend-assigned identifier.
    pub id: String,
    /// Human-facing name.
    pub name: String,
}

/// Trait for delivery backend implementations.
///
/// Each `deliver` call performs exactly one network call, one filesystem
/// write or one subprocess invocation; messages are never batched, which
/// keeps the per-message delivery record the unit of bookkeeping.
#[async_trait]
pub trait Target: Send + Sync {
    /// The target's configured identifier.
    fn id(&self) -> &TargetId;

    /// Returns the kind of this target.
    fn kind(&self) -> TargetKind;

    /// Acquires or refreshes the target's credential and connection.
    ///
    /// Idempotent; a no-op for credential-less variants (maildir, pipe).
    /// Never triggers an interactive step: flows needing a browser fail
    /// with [`TargetError::AuthRequired`].
    async fn authenticate(&mut self) -> Result<()>;

    /// Delivers one message.
    ///
    /// `labels` is the delivery's ordered label list; variants without
    /// label support ignore it (pipe passes it as extra arguments). `trace`
    /// identifies the feed/delivery for the injected trace header.
    async fn deliver(
        &mut self,
        message: &Message,
        labels: &[String],
        trace: &DeliveryTrace,
    ) -> Result<()>;

    /// Lists the labels the backend knows about.
    ///
    /// Variants without label support fail with
    /// [`TargetError::CapabilityUnsupported`].
    async fn list_labels(&mut self) -> Result<Vec<Label>>;

    /// Runs the interactive authorization flow for this target.
    ///
    /// This is the one place a browser step may happen; it is driven by an
    /// explicit operator command, never by the batch run path. Variants
    /// without an interactive credential fail with
    /// [`TargetError::CapabilityUnsupported`].
    async fn authorize(&mut self) -> Result<()> {
        Err(TargetError::CapabilityUnsupported("authorize"))
    }
}

impl std::fmt::Debug for dyn Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_error_display() {
        let auth = TargetError::AuthRequired("token revoked".to_string());
        assert_eq!(auth.to_string(), "authentication required: token revoked");

        let transient = TargetError::Transient("timeout".to_string());
        assert!(transient.to_string().contains("transient"));

        let unsupported = TargetError::CapabilityUnsupported("list_labels");
        assert!(unsupported.to_string().contains("list_labels"));
    }

    #[test]
    fn auth_error_mapping() {
        let e: TargetError = AuthError::Required("no token".to_string()).into();
        assert!(matches!(e, TargetError::AuthRequired(_)));

        let e: TargetError = AuthError::Network("refused".to_string()).into();
        assert!(matches!(e, TargetError::Transient(_)));

        let e: TargetError = AuthError::Endpoint("bad request".to_string()).into();
        assert!(matches!(e, TargetError::Permanent(_)));
    }

    #[test]
    fn target_kind_serialization() {
        assert_eq!(
            serde_json::to_string(&TargetKind::RestInbox).unwrap(),
            "\"restinbox\""
        );
        assert_eq!(
            serde_json::to_string(&TargetKind::JsonMail).unwrap(),
            "\"jsonmail\""
        );
    }
}
