//! Tracked-thread manifest.
//!
//! Tracked threads are ephemeral and user-driven, so they live in their own
//! JSON manifest next to the tracking store rather than in the main
//! configuration. The manifest is rewritten atomically on every change.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{write_atomic, Result, StorageError};

/// Threads with no new messages for this many days are auto-expired.
pub const EXPIRE_DAYS: i64 = 30;

const MANIFEST_VERSION: u32 = 1;

/// Lifecycle state of a tracked thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackStatus {
    /// Updated during pull.
    Active,
    /// Auto-expired, skipped during pull.
    Inactive,
    /// User-requested pause, skipped during pull.
    Paused,
}

/// One tracked email thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedThread {
    /// Message-ID of the thread root.
    pub msgid: String,
    /// Subject line of the thread.
    pub subject: String,
    /// Target name for deliveries.
    pub target: String,
    /// Labels applied to delivered messages.
    pub labels: Vec<String>,
    /// Path to the lei search directory.
    pub lei_path: PathBuf,
    /// When tracking started.
    pub created: DateTime<Utc>,
    /// Last time the thread was processed.
    pub last_update: DateTime<Utc>,
    /// Last time a new message was extracted.
    pub last_new_message: DateTime<Utc>,
    /// Lifecycle state.
    pub status: TrackStatus,
    /// Total messages delivered for this thread.
    pub message_count: u64,
}

/// Serialized manifest layout.
#[derive(Debug, Serialize, Deserialize)]
struct ManifestFile {
    version: u32,
    threads: BTreeMap<String, TrackedThread>,
}

/// Manages the manifest of monitored email threads.
#[derive(Debug)]
pub struct ThreadManifest {
    path: PathBuf,
    threads: BTreeMap<String, TrackedThread>,
}

impl ThreadManifest {
    /// Loads the manifest from `data_dir/tracking.json`, starting fresh when
    /// the file does not exist.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let path = data_dir.as_ref().join("tracking.json");
        if !path.exists() {
            debug!("no tracking manifest found, starting fresh");
            return Ok(Self {
                path,
                threads: BTreeMap::new(),
            });
        }

        let bytes = std::fs::read(&path)?;
        let file: ManifestFile =
            serde_json::from_slice(&bytes).map_err(|source| StorageError::Corrupt {
                path: path.display().to_string(),
                source,
            })?;
        if file.version != MANIFEST_VERSION {
            tracing::warn!(
                got = file.version,
                expected = MANIFEST_VERSION,
                "tracking manifest version mismatch"
            );
        }
        debug!(count = file.threads.len(), "loaded tracked threads");

        Ok(Self {
            path,
            threads: file.threads,
        })
    }

    fn save(&self) -> Result<()> {
        let file = ManifestFile {
            version: MANIFEST_VERSION,
            threads: self.threads.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&file)?;
        write_atomic(&self.path, &bytes)?;
        Ok(())
    }

    /// Adds a new thread to track.
    pub fn add_thread(
        &mut self,
        track_id: &str,
        msgid: &str,
        subject: &str,
        target: &str,
        labels: Vec<String>,
        lei_path: PathBuf,
    ) -> Result<TrackedThread> {
        let now = Utc::now();
        let thread = TrackedThread {
            msgid: msgid.to_string(),
            subject: subject.to_string(),
            target: target.to_string(),
            labels,
            lei_path,
            created: now,
            last_update: now,
            last_new_message: now,
            status: TrackStatus::Active,
            message_count: 0,
        };
        self.threads.insert(track_id.to_string(), thread.clone());
        self.save()?;
        info!(track_id, subject, "started tracking thread");
        Ok(thread)
    }

    /// Removes a thread from tracking. Returns the removed record.
    pub fn remove_thread(&mut self, track_id: &str) -> Result<Option<TrackedThread>> {
        let removed = self.threads.remove(track_id);
        if removed.is_some() {
            self.save()?;
            info!(track_id, "stopped tracking thread");
        }
        Ok(removed)
    }

    /// Pauses tracking for a thread. Returns `false` if unknown.
    pub fn pause_thread(&mut self, track_id: &str) -> Result<bool> {
        let Some(thread) = self.threads.get_mut(track_id) else {
            return Ok(false);
        };
        thread.status = TrackStatus::Paused;
        self.save()?;
        info!(track_id, "paused tracking");
        Ok(true)
    }

    /// Resumes a paused or inactive thread, resetting its activity clock so
    /// it does not immediately re-expire. Returns `false` if unknown.
    pub fn resume_thread(&mut self, track_id: &str) -> Result<bool> {
        let Some(thread) = self.threads.get_mut(track_id) else {
            return Ok(false);
        };
        thread.status = TrackStatus::Active;
        thread.last_new_message = Utc::now();
        self.save()?;
        info!(track_id, "resumed tracking");
        Ok(true)
    }

    /// Looks up one tracked thread.
    pub fn get_thread(&self, track_id: &str) -> Option<&TrackedThread> {
        self.threads.get(track_id)
    }

    /// Finds a tracked thread by its root message id.
    pub fn get_thread_by_msgid(&self, msgid: &str) -> Option<(&str, &TrackedThread)> {
        self.threads
            .iter()
            .find(|(_, t)| t.msgid == msgid)
            .map(|(id, t)| (id.as_str(), t))
    }

    /// All tracked threads.
    pub fn all_threads(&self) -> impl Iterator<Item = (&str, &TrackedThread)> {
        self.threads.iter().map(|(id, t)| (id.as_str(), t))
    }

    /// Only threads in the poll set.
    pub fn active_threads(&self) -> impl Iterator<Item = (&str, &TrackedThread)> {
        self.all_threads()
            .filter(|(_, t)| t.status == TrackStatus::Active)
    }

    /// Flips active threads with no new messages for [`EXPIRE_DAYS`] to
    /// inactive. Returns the ids that expired.
    pub fn check_and_expire(&mut self) -> Result<Vec<String>> {
        let cutoff = Utc::now() - Duration::days(EXPIRE_DAYS);
        let mut expired = Vec::new();

        for (track_id, thread) in self.threads.iter_mut() {
            if thread.status == TrackStatus::Active && thread.last_new_message < cutoff {
                thread.status = TrackStatus::Inactive;
                expired.push(track_id.clone());
                info!(
                    track_id = track_id.as_str(),
                    since = %thread.last_new_message.date_naive(),
                    "auto-expired tracked thread"
                );
            }
        }

        if !expired.is_empty() {
            self.save()?;
        }
        Ok(expired)
    }

    /// Rewinds a thread's activity clock; test hook for expiry paths.
    #[cfg(test)]
    pub(crate) fn backdate_last_new_message(&mut self, track_id: &str, when: DateTime<Utc>) {
        if let Some(thread) = self.threads.get_mut(track_id) {
            thread.last_new_message = when;
        }
    }

    /// Updates activity timestamps after processing a thread.
    pub fn update_activity(&mut self, track_id: &str, new_messages: u64) -> Result<()> {
        let Some(thread) = self.threads.get_mut(track_id) else {
            return Ok(());
        };
        let now = Utc::now();
        thread.last_update = now;
        if new_messages > 0 {
            thread.last_new_message = now;
            thread.message_count += new_messages;
        }
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(dir: &Path) -> ThreadManifest {
        ThreadManifest::open(dir).unwrap()
    }

    #[test]
    fn add_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut m = manifest(dir.path());
            m.add_thread(
                "t1",
                "<root@x>",
                "a patch series",
                "personal",
                vec!["tracked".to_string()],
                dir.path().join("lei/t1"),
            )
            .unwrap();
        }

        let m = manifest(dir.path());
        let thread = m.get_thread("t1").unwrap();
        assert_eq!(thread.msgid, "<root@x>");
        assert_eq!(thread.status, TrackStatus::Active);
        assert_eq!(thread.message_count, 0);
    }

    #[test]
    fn pause_and_resume() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manifest(dir.path());
        m.add_thread("t1", "<root@x>", "s", "tgt", vec![], dir.path().join("lei"))
            .unwrap();

        assert!(m.pause_thread("t1").unwrap());
        assert_eq!(m.active_threads().count(), 0);

        assert!(m.resume_thread("t1").unwrap());
        assert_eq!(m.active_threads().count(), 1);
    }

    #[test]
    fn unknown_ids_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manifest(dir.path());
        assert!(!m.pause_thread("missing").unwrap());
        assert!(!m.resume_thread("missing").unwrap());
        assert!(m.remove_thread("missing").unwrap().is_none());
    }

    #[test]
    fn stale_threads_expire_after_31_days() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manifest(dir.path());
        m.add_thread("t1", "<root@x>", "s", "tgt", vec![], dir.path().join("lei"))
            .unwrap();

        // Backdate the activity clock past the threshold.
        m.threads.get_mut("t1").unwrap().last_new_message = Utc::now() - Duration::days(31);

        let expired = m.check_and_expire().unwrap();
        assert_eq!(expired, vec!["t1".to_string()]);
        assert_eq!(m.get_thread("t1").unwrap().status, TrackStatus::Inactive);
        assert_eq!(m.active_threads().count(), 0);
    }

    #[test]
    fn fresh_threads_do_not_expire() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manifest(dir.path());
        m.add_thread("t1", "<root@x>", "s", "tgt", vec![], dir.path().join("lei"))
            .unwrap();

        assert!(m.check_and_expire().unwrap().is_empty());
        assert_eq!(m.get_thread("t1").unwrap().status, TrackStatus::Active);
    }

    #[test]
    fn activity_update_bumps_count_and_clock() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manifest(dir.path());
        m.add_thread("t1", "<root@x>", "s", "tgt", vec![], dir.path().join("lei"))
            .unwrap();
        let before = m.get_thread("t1").unwrap().last_new_message;

        m.update_activity("t1", 3).unwrap();
        let thread = m.get_thread("t1").unwrap();
        assert_eq!(thread.message_count, 3);
        assert!(thread.last_new_message >= before);

        // No new messages: the new-message clock must not move.
        let clock = thread.last_new_message;
        m.update_activity("t1", 0).unwrap();
        assert_eq!(m.get_thread("t1").unwrap().last_new_message, clock);
        assert_eq!(m.get_thread("t1").unwrap().message_count, 3);
    }

    #[test]
    fn resume_resets_activity_clock() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manifest(dir.path());
        m.add_thread("t1", "<root@x>", "s", "tgt", vec![], dir.path().join("lei"))
            .unwrap();
        m.threads.get_mut("t1").unwrap().last_new_message = Utc::now() - Duration::days(40);
        m.check_and_expire().unwrap();
        assert_eq!(m.get_thread("t1").unwrap().status, TrackStatus::Inactive);

        m.resume_thread("t1").unwrap();
        assert!(m.check_and_expire().unwrap().is_empty());
        assert_eq!(m.get_thread("t1").unwrap().status, TrackStatus::Active);
    }

    #[test]
    fn lookup_by_msgid() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manifest(dir.path());
        m.add_thread("t1", "<root@x>", "s", "tgt", vec![], dir.path().join("lei"))
            .unwrap();

        let (id, _) = m.get_thread_by_msgid("<root@x>").unwrap();
        assert_eq!(id, "t1");
        assert!(m.get_thread_by_msgid("<other@x>").is_none());
    }
}
