//! Durable per-(delivery, message) bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::CommitRef;

/// Delivery state of one message for one delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RecordState {
    /// Queued for delivery; retried on subsequent runs.
    Pending {
        /// Number of failed delivery attempts so far.
        attempts: u32,
    },
    /// Durably delivered (or absorbed by the blocklist). Never re-delivered.
    Delivered,
    /// Permanently failed. Not auto-retried.
    Failed {
        /// Operator-facing reason.
        reason: String,
    },
}

/// Durable record for one (delivery, message-id) pair.
///
/// A record transitions pending→delivered or pending→failed at most once per
/// attempt sequence. The commit reference keeps a pending message re-loadable
/// from the archive after the feed checkpoint has moved past it, and the
/// sequence number preserves upstream commit order across retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    #[serde(flatten)]
    pub state: RecordState,
    /// Commit the message was extracted from.
    pub commit: CommitRef,
    /// Per-delivery monotonic sequence, assigned at first queuing.
    pub seq: u64,
    /// Time of the last state transition.
    pub updated_at: DateTime<Utc>,
}

impl DeliveryRecord {
    /// Creates a fresh pending record.
    pub fn pending(commit: CommitRef, seq: u64) -> Self {
        Self {
            state: RecordState::Pending { attempts: 0 },
            commit,
            seq,
            updated_at: Utc::now(),
        }
    }

    /// Whether the record has durably reached `delivered`.
    pub fn is_delivered(&self) -> bool {
        matches!(self.state, RecordState::Delivered)
    }

    /// Whether the record is awaiting delivery.
    pub fn is_pending(&self) -> bool {
        matches!(self.state, RecordState::Pending { .. })
    }

    /// Whether the record failed permanently.
    pub fn is_failed(&self) -> bool {
        matches!(self.state, RecordState::Failed { .. })
    }

    /// Failed attempt count for pending records, zero otherwise.
    pub fn attempts(&self) -> u32 {
        match self.state {
            RecordState::Pending { attempts } => attempts,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit() -> CommitRef {
        CommitRef {
            epoch: 0,
            hash: "abc".to_string(),
        }
    }

    #[test]
    fn fresh_record_is_pending() {
        let record = DeliveryRecord::pending(commit(), 7);
        assert!(record.is_pending());
        assert!(!record.is_delivered());
        assert_eq!(record.attempts(), 0);
        assert_eq!(record.seq, 7);
    }

    #[test]
    fn state_serialization_is_tagged() {
        let record = DeliveryRecord::pending(commit(), 0);
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"state\":\"pending\""));

        let failed = DeliveryRecord {
            state: RecordState::Failed {
                reason: "rejected".to_string(),
            },
            ..record
        };
        let json = serde_json::to_string(&failed).unwrap();
        assert!(json.contains("\"state\":\"failed\""));
        assert!(json.contains("\"reason\":\"rejected\""));
    }

    #[test]
    fn round_trip() {
        let record = DeliveryRecord {
            state: RecordState::Pending { attempts: 3 },
            commit: commit(),
            seq: 12,
            updated_at: Utc::now(),
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: DeliveryRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
