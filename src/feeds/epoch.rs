//! Remote epoch-partitioned archive feed.
//!
//! Mirrors one public-inbox archive locally. Epoch repositories live at
//! `<url>/git/<N>.git` upstream; a new epoch is detected by probing the next
//! number with `git ls-remote` and cloned as a bare mirror. Only the highest
//! local epoch is ever fetched; sealed epochs never change.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::domain::{Checkpoint, CommitRef, FeedId};

use super::archive::PiArchive;
use super::git::{git_ok, run_git};
use super::{FeedError, FeedSource, RefreshOutcome, Result};

/// Upper bound on epoch discovery probes for a fresh clone. Real archives
/// are far below this; the bound only guards against a misconfigured URL
/// that answers every probe.
const MAX_EPOCH_PROBE: u32 = 10_000;

/// Feed backed by a remote epoch archive.
pub struct EpochFeed {
    id: FeedId,
    url: String,
    archive: PiArchive,
}

impl EpochFeed {
    /// Creates a feed for the archive at `url`, mirrored under `dir`.
    pub fn new(id: FeedId, url: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        let url = url.into().trim_end_matches('/').to_string();
        Self {
            id,
            url,
            archive: PiArchive::new(dir),
        }
    }

    /// Remote URL of one epoch repository.
    fn epoch_url(&self, epoch: u32) -> String {
        format!("{}/git/{}.git", self.url, epoch)
    }

    /// Whether the remote publishes the given epoch.
    async fn remote_epoch_exists(&self, epoch: u32) -> Result<bool> {
        let url = self.epoch_url(epoch);
        let output = run_git(None, &["ls-remote", &url, "HEAD"]).await?;
        Ok(output.success())
    }

    /// Finds the highest epoch the remote currently publishes.
    async fn discover_remote_highest(&self) -> Result<Option<u32>> {
        let mut highest = None;
        for epoch in 0..MAX_EPOCH_PROBE {
            if self.remote_epoch_exists(epoch).await? {
                highest = Some(epoch);
            } else {
                break;
            }
        }
        Ok(highest)
    }

    /// Mirrors one epoch repository locally.
    async fn clone_epoch(&self, epoch: u32) -> Result<()> {
        let tgt = self.archive.gitdir(epoch);
        if tgt.exists() {
            return Err(FeedError::State(format!(
                "epoch directory {} already exists",
                tgt.display()
            )));
        }
        if let Some(parent) = tgt.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let url = self.epoch_url(epoch);
        let tgt_str = tgt.display().to_string();
        info!(feed = %self.id, epoch, "cloning epoch");
        git_ok(None, &["clone", "--mirror", &url, &tgt_str])
            .await
            .map_err(|e| FeedError::Unavailable(format!("clone of {} failed: {}", url, e)))?;
        Ok(())
    }
}

#[async_trait]
impl FeedSource for EpochFeed {
    fn id(&self) -> &FeedId {
        &self.id
    }

    async fn refresh(&self) -> Result<RefreshOutcome> {
        let epochs = self.archive.scan_epochs()?;

        if epochs.is_empty() {
            let highest = self.discover_remote_highest().await?.ok_or_else(|| {
                FeedError::Unavailable(format!("no epochs published at {}", self.url))
            })?;
            self.clone_epoch(highest).await?;
            return Ok(RefreshOutcome::Initialized);
        }

        // Fetch updates on the highest existing epoch. Sealed epochs are
        // immutable upstream, so they are left alone.
        let highest = *epochs.last().unwrap_or(&0);
        let gitdir = self.archive.gitdir(highest);
        git_ok(Some(&gitdir), &["remote", "update", "origin", "--prune"])
            .await
            .map_err(|e| FeedError::Unavailable(format!("fetch of {} failed: {}", self.url, e)))?;

        // Detect and clone any newly published epoch.
        let mut next = highest + 1;
        while self.remote_epoch_exists(next).await? {
            self.clone_epoch(next).await?;
            debug!(feed = %self.id, epoch = next, "new epoch appeared");
            next += 1;
        }

        Ok(RefreshOutcome::Refreshed)
    }

    async fn poll(&self, since: Option<&Checkpoint>) -> Result<Vec<CommitRef>> {
        self.archive.poll_commits(since).await
    }

    async fn load_message(&self, commit: &CommitRef) -> Result<Option<Bytes>> {
        self.archive.blob_at(commit).await
    }

    async fn tip(&self) -> Result<Option<Checkpoint>> {
        self.archive.tip_checkpoint().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_url_strips_trailing_slash() {
        let feed = EpochFeed::new(
            FeedId::from("lkml"),
            "https://example.org/lkml/",
            "/tmp/lkml",
        );
        assert_eq!(feed.epoch_url(0), "https://example.org/lkml/git/0.git");
        assert_eq!(feed.epoch_url(12), "https://example.org/lkml/git/12.git");
    }

    #[tokio::test]
    async fn remote_probe_fails_cleanly_for_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let feed = EpochFeed::new(
            FeedId::from("test"),
            format!("file://{}/nonexistent", dir.path().display()),
            dir.path().join("mirror"),
        );
        assert!(!feed.remote_epoch_exists(0).await.unwrap());
    }
}
