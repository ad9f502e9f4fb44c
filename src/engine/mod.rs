//! The delivery engine and its collaborators.
//!
//! [`DeliveryEngine`] orchestrates feed polling, message extraction, the
//! blocklist filter and delivery to targets, with per-(feed, delivery,
//! target) failure isolation. [`ThreadSupervisor`] manages tracked-thread
//! pseudo-feeds that run through the same engine.

mod blocklist;
mod runner;
mod supervisor;

pub use blocklist::{extract_address, Blocklist};
pub use runner::{DeliveryEngine, ExtraFeed};
pub use supervisor::ThreadSupervisor;

use std::collections::BTreeMap;

use crate::config::ConfigError;
use crate::domain::{DeliveryId, FeedId, TargetId};
use crate::feeds::FeedError;
use crate::storage::StorageError;
use crate::targets::TargetError;

/// Errors from engine-level operations (construction, yank).
///
/// Per-delivery failures inside a run never surface here; they land in the
/// [`RunReport`] so one failing target cannot abort the others.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("unknown target '{0}'")]
    UnknownTarget(TargetId),

    #[error("unknown feed '{0}'")]
    UnknownFeed(FeedId),

    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("message unparseable: {0}")]
    Parse(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Target(#[from] TargetError),

    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Progress event emitted to the status surface.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// No run in progress.
    Idle,
    /// A feed is being refreshed and polled.
    Syncing(FeedId),
    /// A delivery finished a batch with this many newly delivered messages.
    Delivered {
        delivery: DeliveryId,
        count: usize,
    },
    /// A target failed; the reason is operator-facing.
    TargetError { target: TargetId, reason: String },
    /// A target needs an interactive authentication step.
    AuthRequired { target: TargetId },
}

/// Per-delivery counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Messages durably delivered to the target this run.
    pub delivered: usize,
    /// Messages absorbed by the blocklist (marked delivered, no target call).
    pub absorbed: usize,
    /// Messages still pending (transient failures, cancellation, attempts
    /// exhausted).
    pub pending: usize,
    /// Messages permanently failed this run.
    pub failed: usize,
    /// Whether the delivery hit an authentication-required condition.
    pub auth_required: bool,
}

/// Outcome of one engine run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Per-delivery counters.
    pub deliveries: BTreeMap<DeliveryId, DeliveryStats>,
    /// Permanent failures recorded this run, with reasons.
    pub failures: Vec<(DeliveryId, String)>,
    /// Feeds that could not be processed this run, with reasons.
    pub feed_errors: Vec<(FeedId, String)>,
    /// Operator-facing warnings (attempt bounds exceeded, etc).
    pub warnings: Vec<String>,
}

impl RunReport {
    /// Total messages newly delivered (including blocklist absorption).
    pub fn delivered_total(&self) -> usize {
        self.deliveries
            .values()
            .map(|s| s.delivered + s.absorbed)
            .sum()
    }

    /// Total messages left pending.
    pub fn pending_total(&self) -> usize {
        self.deliveries.values().map(|s| s.pending).sum()
    }

    /// Whether any permanent failure or unrecovered auth condition occurred.
    pub fn has_failures(&self) -> bool {
        self.deliveries
            .values()
            .any(|s| s.failed > 0 || s.auth_required)
    }

    /// Process exit status for this run.
    pub fn exit_code(&self) -> i32 {
        if self.has_failures() {
            1
        } else {
            0
        }
    }

    pub(crate) fn stats_mut(&mut self, delivery: &DeliveryId) -> &mut DeliveryStats {
        self.deliveries.entry(delivery.clone()).or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_report_is_clean() {
        let report = RunReport::default();
        assert_eq!(report.delivered_total(), 0);
        assert!(!report.has_failures());
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn failed_delivery_sets_exit_code() {
        let mut report = RunReport::default();
        report.stats_mut(&DeliveryId::from("d")).failed = 1;
        assert!(report.has_failures());
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn auth_required_sets_exit_code() {
        let mut report = RunReport::default();
        report.stats_mut(&DeliveryId::from("d")).auth_required = true;
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn totals_include_absorbed() {
        let mut report = RunReport::default();
        let stats = report.stats_mut(&DeliveryId::from("d"));
        stats.delivered = 2;
        stats.absorbed = 1;
        stats.pending = 3;
        assert_eq!(report.delivered_total(), 3);
        assert_eq!(report.pending_total(), 3);
        assert_eq!(report.exit_code(), 0);
    }
}
