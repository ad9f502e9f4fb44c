//! External command target.
//!
//! Feeds each message to a configured command on stdin, one subprocess
//! invocation per message. The delivery's labels are appended to the
//! command's argument vector, so a command like `["procmail", "-d"]` with
//! labels `["alice"]` runs `procmail -d alice`.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::domain::{DeliveryTrace, Message, TargetId};

use super::{Label, Result, Target, TargetError, TargetKind};

/// Pipe target.
#[derive(Debug)]
pub struct PipeTarget {
    id: TargetId,
    argv: Vec<String>,
}

impl PipeTarget {
    /// Creates a pipe target from a command vector.
    pub fn new(id: TargetId, argv: Vec<String>) -> Result<Self> {
        if argv.is_empty() || argv[0].is_empty() {
            return Err(TargetError::Permanent(format!(
                "pipe target '{}' requires a command",
                id
            )));
        }
        Ok(Self { id, argv })
    }

    /// The configured command and its fixed arguments.
    pub fn argv(&self) -> &[String] {
        &self.argv
    }
}

#[async_trait]
impl Target for PipeTarget {
    fn id(&self) -> &TargetId {
        &self.id
    }

    fn kind(&self) -> TargetKind {
        TargetKind::Pipe
    }

    async fn authenticate(&mut self) -> Result<()> {
        Ok(())
    }

    async fn deliver(
        &mut self,
        message: &Message,
        labels: &[String],
        trace: &DeliveryTrace,
    ) -> Result<()> {
        let wire = message.for_delivery(Some(trace));

        let mut child = Command::new(&self.argv[0])
            .args(&self.argv[1..])
            .args(labels)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    TargetError::Permanent(format!("pipe command not found: {}", self.argv[0]))
                } else {
                    TargetError::Transient(format!("failed to spawn {}: {}", self.argv[0], e))
                }
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            // A command may legitimately exit before reading all of its
            // input; let the exit status decide in that case.
            match stdin.write_all(&wire).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                Err(e) => {
                    return Err(TargetError::Transient(format!(
                        "write to pipe failed: {}",
                        e
                    )))
                }
            }
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| TargetError::Transient(format!("wait for pipe failed: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(TargetError::Permanent(format!(
                "pipe command exited {}: {}",
                output.status.code().unwrap_or(-1),
                stderr
            )));
        }

        debug!(target = %self.id, msgid = %message.message_id(), "piped message");
        Ok(())
    }

    async fn list_labels(&mut self) -> Result<Vec<Label>> {
        Err(TargetError::CapabilityUnsupported("list_labels"))
    }
}
