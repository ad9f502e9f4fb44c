//! Engine configuration types.
//!
//! These are the types an external configuration loader fills in; the
//! engine itself never parses or merges configuration files beyond reading
//! a settings document. Every feed, target and delivery is declared here,
//! and the tagged target enum is what selects the backend implementation at
//! construction time.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level settings for one engine instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// State directory override; defaults to the XDG data dir.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Engine tuning knobs.
    #[serde(default)]
    pub engine: EngineSettings,
    /// Configured feeds by name.
    #[serde(default)]
    pub feeds: BTreeMap<String, FeedSettings>,
    /// Configured targets by name.
    #[serde(default)]
    pub targets: BTreeMap<String, TargetSettings>,
    /// Configured deliveries by name.
    #[serde(default)]
    pub deliveries: BTreeMap<String, DeliverySettings>,
}

/// Engine behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Per-deliver-call timeout in seconds.
    pub deliver_timeout_secs: u64,
    /// Pending records stop being attempted past this many failures.
    pub max_attempts: u32,
    /// Concurrent delivery batches across all feeds.
    pub max_concurrent: usize,
    /// Base URL used to fetch single messages for yank operations.
    pub message_url: String,
    /// External search upstream used when creating tracked-thread searches.
    pub search_upstream: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            deliver_timeout_secs: 60,
            max_attempts: 5,
            max_concurrent: 4,
            message_url: "https://lore.kernel.org/all".to_string(),
            search_upstream: "https://lore.kernel.org/all".to_string(),
        }
    }
}

impl EngineSettings {
    /// The per-call timeout as a [`Duration`].
    pub fn deliver_timeout(&self) -> Duration {
        Duration::from_secs(self.deliver_timeout_secs)
    }
}

/// One configured feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FeedSettings {
    /// Remote epoch-partitioned archive, mirrored locally.
    Archive {
        /// Archive base URL.
        url: String,
    },
    /// Existing lei search directory.
    Lei {
        /// Path to the search output (v2 layout).
        path: PathBuf,
    },
}

/// IMAP authentication mode tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImapAuthKind {
    /// LOGIN with a password.
    #[default]
    Password,
    /// XOAUTH2 with an authorization-code + PKCE grant.
    OAuth2,
}

fn default_imap_port() -> u16 {
    993
}

fn default_imap_folder() -> String {
    "INBOX".to_string()
}

fn default_tenant() -> String {
    "common".to_string()
}

/// One configured target backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TargetSettings {
    /// REST inbox service; credentials live in the OS keyring.
    RestInbox {
        /// API base override (defaults to the Gmail API).
        #[serde(default)]
        api_base: Option<String>,
    },
    /// IMAP server, SSL only.
    Imap {
        server: String,
        #[serde(default = "default_imap_port")]
        port: u16,
        username: String,
        #[serde(default = "default_imap_folder")]
        folder: String,
        #[serde(default)]
        auth: ImapAuthKind,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        password_file: Option<PathBuf>,
        /// OAuth2 application client id override.
        #[serde(default)]
        client_id: Option<String>,
        #[serde(default = "default_tenant")]
        tenant: String,
        /// OAuth2 token cache override; defaults into the data dir.
        #[serde(default)]
        token_file: Option<PathBuf>,
    },
    /// JSON mail protocol server with a bearer token.
    JsonMail {
        server: String,
        username: String,
        #[serde(default)]
        token: Option<String>,
        #[serde(default)]
        token_file: Option<PathBuf>,
    },
    /// Local maildir.
    Maildir { path: PathBuf },
    /// External command; labels are appended to the argument vector.
    Pipe { command: Vec<String> },
}

/// One configured delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliverySettings {
    /// Feed name (key into [`Settings::feeds`]).
    pub feed: String,
    /// Target name (key into [`Settings::targets`]).
    pub target: String,
    /// Ordered labels passed to the target.
    #[serde(default)]
    pub labels: Vec<String>,
}
