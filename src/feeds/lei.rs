//! Lei search repository feed.
//!
//! A lei search written with `-o v2:<dir>` produces the same epoch layout as
//! a public-inbox archive, so commit enumeration and blob access are shared
//! with [`PiArchive`]. The difference is how the archive advances: `lei up`
//! rewrites the local search output, and new epochs appear locally without
//! any cloning on our side.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::domain::{Checkpoint, CommitRef, FeedId};

use super::archive::PiArchive;
use super::git::run_lei;
use super::{FeedError, FeedSource, RefreshOutcome, Result};

/// Feed backed by a lei-managed search directory.
pub struct LeiFeed {
    id: FeedId,
    search_path: PathBuf,
    archive: PiArchive,
}

impl LeiFeed {
    /// Wraps the lei search at `search_path`.
    pub fn new(id: FeedId, search_path: impl Into<PathBuf>) -> Self {
        let search_path = search_path.into();
        let archive = PiArchive::new(&search_path);
        Self {
            id,
            search_path,
            archive,
        }
    }

    /// The search directory this feed reads.
    pub fn search_path(&self) -> &Path {
        &self.search_path
    }
}

#[async_trait]
impl FeedSource for LeiFeed {
    fn id(&self) -> &FeedId {
        &self.id
    }

    // A tracked search exists to deliver its backlog: the thread (or query
    // results) that already matched when the search was created.
    fn backfill_on_init(&self) -> bool {
        true
    }

    async fn refresh(&self) -> Result<RefreshOutcome> {
        let had_epochs = !self.archive.scan_epochs()?.is_empty();

        let path = self.search_path.display().to_string();
        debug!(feed = %self.id, path = %path, "updating lei search");
        let output = run_lei(&["up", &path]).await?;
        if !output.success() {
            return Err(FeedError::Unavailable(format!(
                "lei up {} exited {}: {}",
                path,
                output.code,
                output.stderr_trimmed()
            )));
        }

        if had_epochs {
            Ok(RefreshOutcome::Refreshed)
        } else {
            Ok(RefreshOutcome::Initialized)
        }
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
