//! The dedup/tracking store.
//!
//! Single source of truth for feed checkpoints and per-(delivery, message)
//! delivery records. Layout under the data directory:
//!
//! - `feeds.json` — one checkpoint per feed
//! - `records/<delivery>.json` — one record log per delivery
//!
//! Every state transition that must survive a crash (checkpoint advance,
//! queuing, delivered/failed marking) is written durably before the call
//! returns. Writes go through an atomic temp-then-rename replace. Mutation
//! is locked per delivery, so concurrent feeds never contend on a global
//! write lock.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::warn;

use crate::domain::{Checkpoint, CommitRef, DeliveryId, DeliveryRecord, FeedId, MessageId, RecordState};

use super::{write_atomic, Result, StorageError};

/// Record log for one delivery.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct DeliveryLog {
    /// Owning delivery id, embedded so the file name stays cosmetic.
    delivery: String,
    /// Next sequence number to hand out.
    next_seq: u64,
    /// Records keyed by Message-ID.
    records: BTreeMap<String, DeliveryRecord>,
}

/// Durable tracking store.
pub struct TrackingStore {
    dir: PathBuf,
    feeds: RwLock<HashMap<FeedId, Checkpoint>>,
    logs: RwLock<HashMap<DeliveryId, Arc<Mutex<DeliveryLog>>>>,
}

impl TrackingStore {
    /// Opens (or creates) the store rooted at `dir`, loading existing state.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(dir.join("records"))?;

        let feeds_path = dir.join("feeds.json");
        let feeds: HashMap<FeedId, Checkpoint> = if feeds_path.exists() {
            let bytes = std::fs::read(&feeds_path)?;
            serde_json::from_slice(&bytes).map_err(|source| StorageError::Corrupt {
                path: feeds_path.display().to_string(),
                source,
            })?
        } else {
            HashMap::new()
        };

        let mut logs = HashMap::new();
        for entry in std::fs::read_dir(dir.join("records"))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = std::fs::read(&path)?;
            let log: DeliveryLog =
                serde_json::from_slice(&bytes).map_err(|source| StorageError::Corrupt {
                    path: path.display().to_string(),
                    source,
                })?;
            let id = DeliveryId(log.delivery.clone());
            if logs
                .insert(id.clone(), Arc::new(Mutex::new(log)))
                .is_some()
            {
                warn!(delivery = %id, "duplicate record log on disk, keeping the later file");
            }
        }

        Ok(Self {
            dir,
            feeds: RwLock::new(feeds),
            logs: RwLock::new(logs),
        })
    }

    /// Current checkpoint for a feed, if one has been recorded.
    pub async fn checkpoint(&self, feed: &FeedId) -> Option<Checkpoint> {
        self.feeds.read().await.get(feed).cloned()
    }

    /// Durably advances a feed's checkpoint.
    pub async fn advance_checkpoint(&self, feed: &FeedId, checkpoint: Checkpoint) -> Result<()> {
        let snapshot = {
            let mut feeds = self.feeds.write().await;
            feeds.insert(feed.clone(), checkpoint);
            feeds.clone()
        };
        let path = self.dir.join("feeds.json");
        persist(path, &snapshot).await
    }

    /// Queues a batch of extracted messages as pending for one delivery.
    ///
    /// Rules per message:
    /// - already `delivered` → untouched (idempotence);
    /// - already `failed` → untouched (not auto-retried);
    /// - already `pending` → the newer commit wins (upstream resend/amend);
    /// - otherwise → inserted pending with the next sequence number.
    ///
    /// Returns the number of messages now awaiting delivery from this batch.
    /// The log is written durably before returning.
    pub async fn queue_pending(
        &self,
        delivery: &DeliveryId,
        batch: &[(MessageId, CommitRef)],
    ) -> Result<usize> {
        let log = self.log_handle(delivery).await;
        let mut guard = log.lock().await;
        let state = &mut *guard;

        let mut queued = 0;
        for (msgid, commit) in batch {
            match state.records.entry(msgid.0.clone()) {
                Entry::Occupied(mut entry) => {
                    let record = entry.get_mut();
                    if record.is_delivered() || record.is_failed() {
                        continue;
                    }
                    record.commit = commit.clone();
                    record.updated_at = chrono::Utc::now();
                    queued += 1;
                }
                Entry::Vacant(entry) => {
                    let seq = state.next_seq;
                    state.next_seq += 1;
                    entry.insert(DeliveryRecord::pending(commit.clone(), seq));
                    queued += 1;
                }
            }
        }

        self.persist_log(delivery, state).await?;
        Ok(queued)
    }

    /// All pending records for a delivery, in sequence (upstream) order.
    pub async fn pending(&self, delivery: &DeliveryId) -> Vec<(MessageId, DeliveryRecord)> {
        let log = self.log_handle(delivery).await;
        let log = log.lock().await;
        let mut pending: Vec<(MessageId, DeliveryRecord)> = log
            .records
            .iter()
            .filter(|(_, r)| r.is_pending())
            .map(|(id, r)| (MessageId(id.clone()), r.clone()))
            .collect();
        pending.sort_by_key(|(_, r)| r.seq);
        pending
    }

    /// Looks up one record.
    pub async fn record(&self, delivery: &DeliveryId, msgid: &MessageId) -> Option<DeliveryRecord> {
        let log = self.log_handle(delivery).await;
        let log = log.lock().await;
        log.records.get(&msgid.0).cloned()
    }

    /// Durably marks a record delivered.
    ///
    /// Returns `false` without touching disk if the record was already
    /// delivered: the delivered transition happens at most once.
    pub async fn mark_delivered(&self, delivery: &DeliveryId, msgid: &MessageId) -> Result<bool> {
        let log = self.log_handle(delivery).await;
        let mut guard = log.lock().await;
        let state = &mut *guard;

        match state.records.entry(msgid.0.clone()) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                if record.is_delivered() {
                    return Ok(false);
                }
                record.state = RecordState::Delivered;
                record.updated_at = chrono::Utc::now();
            }
            Entry::Vacant(entry) => {
                // Direct marking without prior queuing (blocklist absorption
                // of a message that was never pending).
                let seq = state.next_seq;
                state.next_seq += 1;
                entry.insert(DeliveryRecord {
                    state: RecordState::Delivered,
                    commit: CommitRef {
                        epoch: 0,
                        hash: String::new(),
                    },
                    seq,
                    updated_at: chrono::Utc::now(),
                });
            }
        }

        self.persist_log(delivery, state).await?;
        Ok(true)
    }

    /// Durably marks a record permanently failed.
    pub async fn mark_failed(
        &self,
        delivery: &DeliveryId,
        msgid: &MessageId,
        reason: &str,
    ) -> Result<()> {
        let log = self.log_handle(delivery).await;
        let mut log = log.lock().await;

        if let Some(record) = log.records.get_mut(&msgid.0) {
            if record.is_delivered() {
                return Ok(());
            }
            record.state = RecordState::Failed {
                reason: reason.to_string(),
            };
            record.updated_at = chrono::Utc::now();
        }

        self.persist_log(delivery, &log).await
    }

    /// Durably increments a pending record's attempt counter.
    ///
    /// Returns the new attempt count (zero for non-pending records).
    pub async fn bump_attempts(&self, delivery: &DeliveryId, msgid: &MessageId) -> Result<u32> {
        let log = self.log_handle(delivery).await;
        let mut log = log.lock().await;

        let mut new_attempts = 0;
        if let Some(record) = log.records.get_mut(&msgid.0) {
            if let RecordState::Pending { attempts } = &mut record.state {
                *attempts += 1;
                new_attempts = *attempts;
                record.updated_at = chrono::Utc::now();
            }
        }

        self.persist_log(delivery, &log).await?;
        Ok(new_attempts)
    }

    /// Fetches (creating if absent) the lock handle for one delivery's log.
    async fn log_handle(&self, delivery: &DeliveryId) -> Arc<Mutex<DeliveryLog>> {
        {
            let logs = self.logs.read().await;
            if let Some(log) = logs.get(delivery) {
                return Arc::clone(log);
            }
        }
        let mut logs = self.logs.write().await;
        Arc::clone(logs.entry(delivery.clone()).or_insert_with(|| {
            Arc::new(Mutex::new(DeliveryLog {
                delivery: delivery.0.clone(),
                ..DeliveryLog::default()
            }))
        }))
    }

    /// Writes one delivery log durably.
    async fn persist_log(&self, delivery: &DeliveryId, log: &DeliveryLog) -> Result<()> {
        let path = self
            .dir
            .join("records")
            .join(format!("{}.json", sanitize(&delivery.0)));
        persist(path, log).await
    }
}

/// Serializes and atomically writes a JSON state file off the async runtime.
async fn persist<T: serde::Serialize>(path: PathBuf, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
        .await
        .map_err(|e| StorageError::Io(std::io::Error::other(e)))??;
    Ok(())
}

/// Maps a delivery id to a safe file name. The id itself is stored inside
/// the file, so this only has to be filesystem-safe, not reversible.
fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit(hash: &str) -> CommitRef {
        CommitRef {
            epoch: 0,
            hash: hash.to_string(),
        }
    }

    #[tokio::test]
    async fn checkpoint_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let feed = FeedId::from("lkml");

        {
            let store = TrackingStore::open(dir.path()).await.unwrap();
            store
                .advance_checkpoint(
                    &feed,
                    Checkpoint {
                        epoch: 2,
                        commit: "c3".to_string(),
                    },
                )
                .await
                .unwrap();
        }

        let store = TrackingStore::open(dir.path()).await.unwrap();
        let cp = store.checkpoint(&feed).await.unwrap();
        assert_eq!(cp.epoch, 2);
        assert_eq!(cp.commit, "c3");
    }

    #[tokio::test]
    async fn queue_then_deliver_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrackingStore::open(dir.path()).await.unwrap();
        let delivery = DeliveryId::from("personal");
        let m1 = MessageId::from("<m1@x>");
        let m2 = MessageId::from("<m2@x>");

        let queued = store
            .queue_pending(
                &delivery,
                &[(m1.clone(), commit("c1")), (m2.clone(), commit("c2"))],
            )
            .await
            .unwrap();
        assert_eq!(queued, 2);

        assert!(store.mark_delivered(&delivery, &m1).await.unwrap());

        let pending = store.pending(&delivery).await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].0, m2);
    }

    #[tokio::test]
    async fn delivered_transition_happens_at_most_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrackingStore::open(dir.path()).await.unwrap();
        let delivery = DeliveryId::from("personal");
        let m1 = MessageId::from("<m1@x>");

        store
            .queue_pending(&delivery, &[(m1.clone(), commit("c1"))])
            .await
            .unwrap();

        assert!(store.mark_delivered(&delivery, &m1).await.unwrap());
        assert!(!store.mark_delivered(&delivery, &m1).await.unwrap());
    }

    #[tokio::test]
    async fn requeue_never_resurrects_delivered_messages() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrackingStore::open(dir.path()).await.unwrap();
        let delivery = DeliveryId::from("personal");
        let m1 = MessageId::from("<m1@x>");

        store
            .queue_pending(&delivery, &[(m1.clone(), commit("c1"))])
            .await
            .unwrap();
        store.mark_delivered(&delivery, &m1).await.unwrap();

        // Upstream resend of the same Message-ID at a later commit.
        let queued = store
            .queue_pending(&delivery, &[(m1.clone(), commit("c9"))])
            .await
            .unwrap();
        assert_eq!(queued, 0);
        assert!(store.record(&delivery, &m1).await.unwrap().is_delivered());
    }

    #[tokio::test]
    async fn pending_requeue_updates_commit() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrackingStore::open(dir.path()).await.unwrap();
        let delivery = DeliveryId::from("personal");
        let m1 = MessageId::from("<m1@x>");

        store
            .queue_pending(&delivery, &[(m1.clone(), commit("c1"))])
            .await
            .unwrap();
        store
            .queue_pending(&delivery, &[(m1.clone(), commit("c9"))])
            .await
            .unwrap();

        let record = store.record(&delivery, &m1).await.unwrap();
        assert_eq!(record.commit.hash, "c9");
        assert!(record.is_pending());
    }

    #[tokio::test]
    async fn failed_records_are_not_requeued() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrackingStore::open(dir.path()).await.unwrap();
        let delivery = DeliveryId::from("personal");
        let m1 = MessageId::from("<m1@x>");

        store
            .queue_pending(&delivery, &[(m1.clone(), commit("c1"))])
            .await
            .unwrap();
        store
            .mark_failed(&delivery, &m1, "content rejected")
            .await
            .unwrap();

        let queued = store
            .queue_pending(&delivery, &[(m1.clone(), commit("c2"))])
            .await
            .unwrap();
        assert_eq!(queued, 0);
        assert!(store.record(&delivery, &m1).await.unwrap().is_failed());
    }

    #[tokio::test]
    async fn pending_is_ordered_by_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrackingStore::open(dir.path()).await.unwrap();
        let delivery = DeliveryId::from("personal");

        // Queue in two batches; zz sorts after aa lexically but was queued
        // first, so it must come back first.
        store
            .queue_pending(&delivery, &[(MessageId::from("<zz@x>"), commit("c1"))])
            .await
            .unwrap();
        store
            .queue_pending(&delivery, &[(MessageId::from("<aa@x>"), commit("c2"))])
            .await
            .unwrap();

        let pending = store.pending(&delivery).await;
        assert_eq!(pending[0].0 .0, "<zz@x>");
        assert_eq!(pending[1].0 .0, "<aa@x>");
    }

    #[tokio::test]
    async fn attempts_accumulate_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let delivery = DeliveryId::from("personal");
        let m1 = MessageId::from("<m1@x>");

        {
            let store = TrackingStore::open(dir.path()).await.unwrap();
            store
                .queue_pending(&delivery, &[(m1.clone(), commit("c1"))])
                .await
                .unwrap();
            assert_eq!(store.bump_attempts(&delivery, &m1).await.unwrap(), 1);
            assert_eq!(store.bump_attempts(&delivery, &m1).await.unwrap(), 2);
        }

        let store = TrackingStore::open(dir.path()).await.unwrap();
        let record = store.record(&delivery, &m1).await.unwrap();
        assert_eq!(record.attempts(), 2);
        assert_eq!(record.commit.hash, "c1");
    }

    #[tokio::test]
    async fn concurrent_upserts_on_distinct_deliveries() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(TrackingStore::open(dir.path()).await.unwrap());

        let mut handles = Vec::new();
        for i in 0..4 {
            let store = std::sync::Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let delivery = DeliveryId(format!("d{}", i));
                for j in 0..5 {
                    let msgid = MessageId(format!("<m{}@x>", j));
                    store
                        .queue_pending(&delivery, &[(msgid.clone(), commit("c"))])
                        .await
                        .unwrap();
                    store.mark_delivered(&delivery, &msgid).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        for i in 0..4 {
            let delivery = DeliveryId(format!("d{}", i));
            assert!(store.pending(&delivery).await.is_empty());
        }
    }

    #[test]
    fn sanitize_keeps_simple_names() {
        assert_eq!(sanitize("personal"), "personal");
        assert_eq!(sanitize("track:abc/def"), "track_abc_def");
    }
}
