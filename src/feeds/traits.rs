//! Feed source trait definition.
//!
//! A feed source wraps one append-only archive (an epoch-partitioned git
//! archive or a lei search repository) and produces the ordered sequence of
//! commits that appeared since a saved checkpoint. Feed sources never mutate
//! checkpoints; that is the engine's job, and it only happens after extracted
//! messages have been durably queued.

use async_trait::async_trait;
use bytes::Bytes;

use crate::domain::{Checkpoint, CommitRef, FeedId};

/// Result type alias for feed operations.
pub type Result<T> = std::result::Result<T, FeedError>;

/// Errors that can occur while reading a feed.
///
/// All of these are scoped to one feed: a failing feed is skipped for the
/// current run and retried on the next one, and never aborts other feeds.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// Archive unreachable or not initialized upstream.
    #[error("archive unavailable: {0}")]
    Unavailable(String),

    /// A git subprocess failed.
    #[error("git: {0}")]
    Git(String),

    /// A lei subprocess failed.
    #[error("lei: {0}")]
    Lei(String),

    /// Local archive state is inconsistent.
    #[error("feed state: {0}")]
    State(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of bringing a local archive up to date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The archive was cloned/created for the first time.
    Initialized,
    /// The archive existed and was fetched.
    Refreshed,
}

/// One append-only archive producing commits in upstream order.
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// The feed's configured identifier.
    fn id(&self) -> &FeedId;

    /// Whether a freshly initialized feed should deliver its whole history.
    ///
    /// Mailing-list archives start at the current tip (subscribing should
    /// not replay years of traffic); tracked-thread searches deliver from
    /// the beginning (the point of tracking a thread is its backlog).
    fn backfill_on_init(&self) -> bool {
        false
    }

    /// Brings the local archive up to date: clone newly-published epochs,
    /// fetch the highest existing one, or run the external search update.
    async fn refresh(&self) -> Result<RefreshOutcome>;

    /// Commits newly reachable since `since`, oldest first, spanning epoch
    /// rollovers. `None` means the very beginning of the archive. Never
    /// mutates the checkpoint.
    async fn poll(&self, since: Option<&Checkpoint>) -> Result<Vec<CommitRef>>;

    /// Loads the message blob carried by a commit. `None` when the commit
    /// has no message file (e.g. an upstream deletion commit).
    async fn load_message(&self, commit: &CommitRef) -> Result<Option<Bytes>>;

    /// The archive's current highest position, if it has any commits.
    async fn tip(&self) -> Result<Option<Checkpoint>>;
}
