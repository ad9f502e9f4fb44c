//! Local maildir target.
//!
//! Stores messages into a maildir, creating the `tmp/new/cur` structure on
//! demand. Delivery itself is atomic: the message is written under `tmp/`
//! and renamed into `new/`. No credential, no labels.

use async_trait::async_trait;
use maildirpp::Maildir;
use std::path::PathBuf;
use tracing::debug;

use crate::domain::{DeliveryTrace, Message, TargetId};

use super::{Label, Result, Target, TargetError, TargetKind};

/// Maildir target.
pub struct MaildirTarget {
    id: TargetId,
    path: PathBuf,
}

impl MaildirTarget {
    /// Creates the target, initializing the maildir structure.
    pub fn new(id: TargetId, path: impl Into<PathBuf>) -> Result<Self> {
        let path: PathBuf = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TargetError::Permanent(format!(
                    "cannot create maildir parent {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let maildir = Maildir::from(path.clone());
        maildir.create_dirs().map_err(|e| {
            TargetError::Permanent(format!(
                "failed to initialize maildir at {}: {}",
                path.display(),
                e
            ))
        })?;

        Ok(Self { id, path })
    }

    /// The maildir root.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl Target for MaildirTarget {
    fn id(&self) -> &TargetId {
        &self.id
    }

    fn kind(&self) -> TargetKind {
        TargetKind::Maildir
    }

    async fn authenticate(&mut self) -> Result<()> {
        Ok(())
    }

    async fn deliver(
        &mut self,
        message: &Message,
        _labels: &[String],
        trace: &DeliveryTrace,
    ) -> Result<()> {
        let wire = message.for_delivery(Some(trace));
        let path = self.path.clone();

        let key = tokio::task::spawn_blocking(move || {
            let maildir = Maildir::from(path);
            maildir.store_new(&wire)
        })
        .await
        .map_err(|e| TargetError::Transient(format!("store task failed: {}", e)))?
        .map_err(|e| TargetError::Transient(format!("maildir store failed: {}", e)))?;

        debug!(target = %self.id, msgid = %message.message_id(), key = %key, "stored message");
        Ok(())
    }

    async fn list_labels(&mut self) -> Result<Vec<Label>> {
        Err(TargetError::CapabilityUnsupported("list_labels"))
    }
}
