//! Local view of an epoch-partitioned public-inbox archive.
//!
//! On disk an archive is `<dir>/git/<N>.git`, one bare repository per epoch,
//! each with a single `master` branch whose commits carry one message blob
//! named `m`. Epochs are sequentially numbered; a new epoch appears when the
//! previous one is sealed upstream.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::debug;

use crate::domain::{Checkpoint, CommitRef};

use super::git::{git_ok, run_git};
use super::{FeedError, Result};

/// Read access to one local archive directory.
#[derive(Debug, Clone)]
pub struct PiArchive {
    dir: PathBuf,
}

impl PiArchive {
    /// Wraps an archive rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The archive root directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Directory holding the epoch repositories.
    pub fn epochs_dir(&self) -> PathBuf {
        self.dir.join("git")
    }

    /// Git directory for one epoch.
    pub fn gitdir(&self, epoch: u32) -> PathBuf {
        self.epochs_dir().join(format!("{}.git", epoch))
    }

    /// Existing epoch numbers, ascending. Empty when nothing is cloned yet.
    pub fn scan_epochs(&self) -> Result<Vec<u32>> {
        let epochs_dir = self.epochs_dir();
        if !epochs_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut epochs = Vec::new();
        for entry in std::fs::read_dir(&epochs_dir)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(stem) = name.strip_suffix(".git") else {
                continue;
            };
            match stem.parse::<u32>() {
                Ok(epoch) => epochs.push(epoch),
                Err(_) => debug!(name = %name, "ignoring non-epoch directory"),
            }
        }
        epochs.sort_unstable();
        Ok(epochs)
    }

    /// Highest existing epoch, if any.
    pub fn highest_epoch(&self) -> Result<Option<u32>> {
        Ok(self.scan_epochs()?.into_iter().next_back())
    }

    /// Commits on `master` of one epoch, oldest first, after `last` when
    /// given.
    pub async fn commits_since(&self, epoch: u32, last: Option<&str>) -> Result<Vec<String>> {
        let gitdir = self.gitdir(epoch);
        let range = last.map(|l| format!("{}..master", l));
        let output = match &range {
            Some(range) => {
                git_ok(
                    Some(&gitdir),
                    &["rev-list", "--reverse", "--ancestry-path", range],
                )
                .await?
            }
            None => git_ok(Some(&gitdir), &["rev-list", "--reverse", "master"]).await?,
        };

        let text = output.stdout_trimmed();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        Ok(text.lines().map(str::to_string).collect())
    }

    /// Tip commit of one epoch's `master`, if the branch has commits.
    pub async fn tip_commit(&self, epoch: u32) -> Result<Option<String>> {
        let gitdir = self.gitdir(epoch);
        let output = run_git(Some(&gitdir), &["rev-list", "-n", "1", "master"]).await?;
        if !output.success() {
            return Err(FeedError::Git(format!(
                "rev-list failed in {}: {}",
                gitdir.display(),
                output.stderr_trimmed()
            )));
        }
        let tip = output.stdout_trimmed();
        Ok(if tip.is_empty() { None } else { Some(tip) })
    }

    /// The message blob at a commit. `None` when the commit carries no `m`
    /// file (deletion commits).
    pub async fn blob_at(&self, commit: &CommitRef) -> Result<Option<Bytes>> {
        let gitdir = self.gitdir(commit.epoch);
        let spec = format!("{}:m", commit.hash);
        let output = run_git(Some(&gitdir), &["show", &spec]).await?;
        if output.code == 128 {
            return Ok(None);
        }
        if !output.success() {
            return Err(FeedError::Git(format!(
                "show {} failed: {}",
                spec,
                output.stderr_trimmed()
            )));
        }

        // Match upstream storage: messages are stripped of surrounding
        // whitespace when read back out of git.
        let bytes = output.stdout;
        let start = bytes
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .unwrap_or(bytes.len());
        let end = bytes
            .iter()
            .rposition(|b| !b.is_ascii_whitespace())
            .map_or(start, |p| p + 1);
        Ok(Some(Bytes::copy_from_slice(&bytes[start..end])))
    }

    /// Commits newly reachable since `since`, oldest first, walking across
    /// epoch rollovers: the remainder of the checkpoint epoch followed by
    /// every commit of each newer epoch.
    pub async fn poll_commits(&self, since: Option<&Checkpoint>) -> Result<Vec<CommitRef>> {
        let epochs = self.scan_epochs()?;
        let mut commits = Vec::new();

        for epoch in epochs {
            let hashes = match since {
                Some(cp) if epoch < cp.epoch => continue,
                Some(cp) if epoch == cp.epoch => {
                    self.commits_since(epoch, Some(&cp.commit)).await?
                }
                _ => self.commits_since(epoch, None).await?,
            };
            commits.extend(hashes.into_iter().map(|hash| CommitRef { epoch, hash }));
        }
        Ok(commits)
    }

    /// Current highest position of the archive.
    pub async fn tip_checkpoint(&self) -> Result<Option<Checkpoint>> {
        let Some(epoch) = self.highest_epoch()? else {
            return Ok(None);
        };
        Ok(self
            .tip_commit(epoch)
            .await?
            .map(|commit| Checkpoint { epoch, commit }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_epochs_empty_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let archive = PiArchive::new(dir.path());
        assert!(archive.scan_epochs().unwrap().is_empty());
        assert!(archive.highest_epoch().unwrap().is_none());
    }

    #[test]
    fn scan_epochs_sorts_numerically() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["10.git", "2.git", "0.git", "junk.git", "notes"] {
            std::fs::create_dir_all(dir.path().join("git").join(name)).unwrap();
        }
        let archive = PiArchive::new(dir.path());
        assert_eq!(archive.scan_epochs().unwrap(), vec![0, 2, 10]);
        assert_eq!(archive.highest_epoch().unwrap(), Some(10));
    }

    #[test]
    fn gitdir_layout() {
        let archive = PiArchive::new("/data/lkml");
        assert_eq!(
            archive.gitdir(3),
            PathBuf::from("/data/lkml/git/3.git")
        );
    }
}
