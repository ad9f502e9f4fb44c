//! Thread-tracking supervisor.
//!
//! One tracked thread = one externally-maintained lei search, delivered
//! through the engine exactly like a configured feed/delivery pair. The
//! supervisor owns the manifest lifecycle: creating searches, pausing,
//! resuming, forgetting, auto-expiring stale threads, and translating
//! active threads into the engine's poll set.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::domain::{Delivery, DeliveryId, FeedId, TargetId};
use crate::feeds::git::run_lei;
use crate::feeds::LeiFeed;
use crate::storage::{StorageError, ThreadManifest, TrackedThread};

use super::{EngineError, ExtraFeed, RunReport};

/// Prefix shared by tracked-thread feed and delivery ids, so their
/// delivery records are recognizable in the store.
const TRACK_PREFIX: &str = "track:";

/// Manages tracked-thread searches and their lifecycle.
pub struct ThreadSupervisor {
    manifest: Mutex<ThreadManifest>,
    lei_dir: PathBuf,
    upstream: String,
}

impl ThreadSupervisor {
    /// Opens the supervisor over the manifest in `data_dir`.
    ///
    /// `upstream` is the archive the external search queries (the `--only`
    /// source for new searches).
    pub fn open(data_dir: impl Into<PathBuf>, upstream: impl Into<String>) -> Result<Self, StorageError> {
        let data_dir = data_dir.into();
        let manifest = ThreadManifest::open(&data_dir)?;
        Ok(Self {
            manifest: Mutex::new(manifest),
            lei_dir: data_dir.join("lei"),
            upstream: upstream.into(),
        })
    }

    /// Starts tracking the thread rooted at `msgid`, delivering to `target`
    /// with `labels`. Returns the new tracking id.
    pub async fn track(
        &self,
        msgid: &str,
        subject: &str,
        target: &TargetId,
        labels: Vec<String>,
    ) -> Result<String, EngineError> {
        let track_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let search_path = self.lei_dir.join(&track_id);
        if let Some(parent) = search_path.parent() {
            std::fs::create_dir_all(parent).map_err(StorageError::Io)?;
        }

        let bare = msgid.trim_start_matches('<').trim_end_matches('>');
        let query = format!("mid:{}", bare);
        let output_spec = format!("v2:{}", search_path.display());
        let output = run_lei(&[
            "q",
            &query,
            "--threads",
            "--only",
            &self.upstream,
            "-o",
            &output_spec,
        ])
        .await?;
        if !output.success() {
            return Err(EngineError::Fetch(format!(
                "search creation for {} exited {}: {}",
                msgid,
                output.code,
                output.stderr_trimmed()
            )));
        }

        let mut manifest = self.manifest.lock().await;
        manifest.add_thread(
            &track_id,
            msgid,
            subject,
            &target.0,
            labels,
            search_path,
        )?;
        info!(track_id = %track_id, msgid, "tracking thread");
        Ok(track_id)
    }

    /// Pauses a tracked thread. Returns `false` if unknown.
    pub async fn pause(&self, track_id: &str) -> Result<bool, EngineError> {
        Ok(self.manifest.lock().await.pause_thread(track_id)?)
    }

    /// Resumes a paused or expired thread. Returns `false` if unknown.
    pub async fn resume(&self, track_id: &str) -> Result<bool, EngineError> {
        Ok(self.manifest.lock().await.resume_thread(track_id)?)
    }

    /// Stops tracking a thread, telling the external search index to forget
    /// the search. With `delete_data`, the search directory is removed too.
    pub async fn forget(&self, track_id: &str, delete_data: bool) -> Result<bool, EngineError> {
        let removed = {
            let mut manifest = self.manifest.lock().await;
            manifest.remove_thread(track_id)?
        };
        let Some(thread) = removed else {
            return Ok(false);
        };

        let path = thread.lei_path.display().to_string();
        match run_lei(&["forget-search", &path]).await {
            Ok(output) if !output.success() => {
                warn!(track_id, output = %output.stderr_trimmed(), "forget-search failed");
            }
            Err(e) => warn!(track_id, error = %e, "forget-search unavailable"),
            Ok(_) => {}
        }

        if delete_data && thread.lei_path.exists() {
            info!(track_id, path = %thread.lei_path.display(), "deleting search data");
            std::fs::remove_dir_all(&thread.lei_path).map_err(StorageError::Io)?;
        }
        Ok(true)
    }

    /// Looks up a tracked thread.
    pub async fn get(&self, track_id: &str) -> Option<TrackedThread> {
        self.manifest.lock().await.get_thread(track_id).cloned()
    }

    /// All tracked threads with their ids.
    pub async fn list(&self) -> Vec<(String, TrackedThread)> {
        self.manifest
            .lock()
            .await
            .all_threads()
            .map(|(id, t)| (id.to_string(), t.clone()))
            .collect()
    }

    /// Expires threads with no new messages past the threshold. Returns the
    /// expired ids.
    pub async fn check_and_expire(&self) -> Result<Vec<String>, EngineError> {
        Ok(self.manifest.lock().await.check_and_expire()?)
    }

    /// The engine poll set: one pseudo-feed per active thread.
    ///
    /// Expiry runs first, so a thread idle past the threshold is excluded
    /// from the very next run.
    pub async fn poll_set(&self) -> Result<Vec<ExtraFeed>, EngineError> {
        let mut manifest = self.manifest.lock().await;
        manifest.check_and_expire()?;

        Ok(manifest
            .active_threads()
            .map(|(track_id, thread)| {
                let key = format!("{}{}", TRACK_PREFIX, track_id);
                ExtraFeed {
                    feed: Arc::new(LeiFeed::new(FeedId(key.clone()), thread.lei_path.clone())),
                    delivery: Delivery {
                        id: DeliveryId(key),
                        feed: FeedId(format!("{}{}", TRACK_PREFIX, track_id)),
                        target: TargetId(thread.target.clone()),
                        labels: thread.labels.clone(),
                    },
                }
            })
            .collect())
    }

    /// Folds a run's results back into the manifest: bumps per-thread
    /// activity clocks and message counts.
    pub async fn record_results(&self, report: &RunReport) -> Result<(), EngineError> {
        let mut manifest = self.manifest.lock().await;
        for (delivery_id, stats) in &report.deliveries {
            let Some(track_id) = delivery_id.0.strip_prefix(TRACK_PREFIX) else {
                continue;
            };
            let delivered = (stats.delivered + stats.absorbed) as u64;
            manifest.update_activity(track_id, delivered)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::DeliveryStats;

    fn supervisor(dir: &std::path::Path) -> ThreadSupervisor {
        ThreadSupervisor::open(dir, "https://lore.kernel.org/all").unwrap()
    }

    /// Seeds a thread directly in the manifest, bypassing the external
    /// search creation.
    async fn seed_thread(sup: &ThreadSupervisor, track_id: &str, target: &str) {
        let path = sup.lei_dir.join(track_id);
        sup.manifest
            .lock()
            .await
            .add_thread(
                track_id,
                "<root@x>",
                "a series",
                target,
                vec!["tracked".to_string()],
                path,
            )
            .unwrap();
    }

    #[tokio::test]
    async fn poll_set_contains_active_threads_only() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        seed_thread(&sup, "aaaa1111", "personal").await;
        seed_thread(&sup, "bbbb2222", "personal").await;

        sup.pause("bbbb2222").await.unwrap();

        let set = sup.poll_set().await.unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set[0].delivery.id.0, "track:aaaa1111");
        assert_eq!(set[0].delivery.target.0, "personal");
        assert_eq!(set[0].delivery.labels, vec!["tracked".to_string()]);
    }

    #[tokio::test]
    async fn expired_threads_leave_the_poll_set() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        seed_thread(&sup, "aaaa1111", "personal").await;
        seed_thread(&sup, "bbbb2222", "personal").await;

        // One thread goes idle for 31 days.
        sup.manifest.lock().await.backdate_last_new_message(
            "aaaa1111",
            chrono::Utc::now() - chrono::Duration::days(31),
        );

        let set = sup.poll_set().await.unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set[0].delivery.id.0, "track:bbbb2222");

        // Resuming puts it back into the poll set.
        assert!(sup.resume("aaaa1111").await.unwrap());
        assert_eq!(sup.poll_set().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn record_results_updates_activity() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        seed_thread(&sup, "aaaa1111", "personal").await;

        let mut report = RunReport::default();
        *report.stats_mut(&DeliveryId::from("track:aaaa1111")) = DeliveryStats {
            delivered: 2,
            absorbed: 1,
            ..DeliveryStats::default()
        };
        // Unrelated deliveries are ignored.
        report.stats_mut(&DeliveryId::from("lkml-personal")).delivered = 5;

        sup.record_results(&report).await.unwrap();

        let thread = sup.get("aaaa1111").await.unwrap();
        assert_eq!(thread.message_count, 3);
    }

    #[tokio::test]
    async fn forget_unknown_thread_is_false() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        assert!(!sup.forget("missing", false).await.unwrap());
    }

    #[tokio::test]
    async fn list_returns_all() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        seed_thread(&sup, "aaaa1111", "personal").await;
        seed_thread(&sup, "bbbb2222", "work").await;

        let all = sup.list().await;
        assert_eq!(all.len(), 2);
    }
}
