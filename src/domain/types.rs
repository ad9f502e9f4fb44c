//! Core identifier and archive-position types.
//!
//! These newtype wrappers provide type safety for entity identifiers,
//! preventing accidental mixing of different ID types across the engine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a configured feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeedId(pub String);

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for FeedId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for FeedId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Unique identifier for a configured target backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetId(pub String);

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TargetId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TargetId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Unique identifier for a delivery (one feed bound to one target).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeliveryId(pub String);

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for DeliveryId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for DeliveryId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// RFC 2822 Message-ID header value, including the angle brackets.
///
/// This is the unique identifier assigned by the originating mail system.
/// It is the sole identity key for deduplication: two archive commits
/// carrying the same Message-ID are the same message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    /// Returns the id without the surrounding angle brackets.
    pub fn bare(&self) -> &str {
        self.0.trim_start_matches('<').trim_end_matches('>')
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A commit inside one epoch of an archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRef {
    /// Epoch number the commit lives in.
    pub epoch: u32,
    /// Full commit hash.
    pub hash: String,
}

impl fmt::Display for CommitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.epoch, self.hash)
    }
}

/// Durable position of a feed: the last commit whose messages have been
/// queued for delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Epoch number of the checkpoint commit.
    pub epoch: u32,
    /// Full hash of the last processed commit.
    pub commit: String,
}

impl Checkpoint {
    /// Creates a checkpoint pointing at the given commit.
    pub fn at(commit: &CommitRef) -> Self {
        Self {
            epoch: commit.epoch,
            commit: commit.hash.clone(),
        }
    }
}

/// Binding of one feed to one target with delivery parameters.
///
/// Multiple deliveries may reference the same feed (fan-out) or the same
/// target (fan-in). Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    /// Unique identifier, used as the dedup-store key prefix.
    pub id: DeliveryId,
    /// Feed this delivery pulls from.
    pub feed: FeedId,
    /// Target this delivery pushes to.
    pub target: TargetId,
    /// Ordered labels (or extra arguments) passed to the target.
    pub labels: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_id_display() {
        let id = FeedId::from("lkml");
        assert_eq!(id.to_string(), "lkml");
    }

    #[test]
    fn message_id_bare_strips_brackets() {
        let id = MessageId::from("<m1@example.com>");
        assert_eq!(id.bare(), "m1@example.com");
    }

    #[test]
    fn message_id_bare_without_brackets() {
        let id = MessageId::from("m1@example.com");
        assert_eq!(id.bare(), "m1@example.com");
    }

    #[test]
    fn delivery_id_hash() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(DeliveryId::from("personal"));
        assert!(set.contains(&DeliveryId::from("personal")));
    }

    #[test]
    fn checkpoint_at_commit() {
        let commit = CommitRef {
            epoch: 3,
            hash: "abc123".to_string(),
        };
        let cp = Checkpoint::at(&commit);
        assert_eq!(cp.epoch, 3);
        assert_eq!(cp.commit, "abc123");
    }

    #[test]
    fn commit_ref_serialization() {
        let commit = CommitRef {
            epoch: 1,
            hash: "deadbeef".to_string(),
        };
        let json = serde_json::to_string(&commit).unwrap();
        let back: CommitRef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, commit);
    }
}
