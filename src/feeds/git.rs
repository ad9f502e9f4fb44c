//! Subprocess plumbing for git and lei.
//!
//! All archive access shells out to the git client, using `--git-dir` so
//! bare mirror clones work with `safe.bareRepository=explicit`. The HTTP
//! user agent identifies this tool to upstream archive servers.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use super::{FeedError, Result};

const GIT_CMD: &str = "git";
const LEI_CMD: &str = "lei";

/// User-agent string sent with git HTTP and lei network operations.
pub fn user_agent() -> String {
    format!("loreferry/{}", env!("CARGO_PKG_VERSION"))
}

/// Captured output of a finished subprocess.
#[derive(Debug)]
pub struct CommandOutput {
    /// Exit code (`-1` when terminated by a signal).
    pub code: i32,
    /// Raw stdout.
    pub stdout: Vec<u8>,
    /// Raw stderr.
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    /// Whether the process exited zero.
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Stdout as trimmed UTF-8 (lossy).
    pub fn stdout_trimmed(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    /// Stderr as trimmed UTF-8 (lossy), for error messages.
    pub fn stderr_trimmed(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Runs a git command, optionally against a specific git directory.
pub async fn run_git(gitdir: Option<&Path>, args: &[&str]) -> Result<CommandOutput> {
    let mut cmd = Command::new(GIT_CMD);
    if let Some(dir) = gitdir {
        cmd.arg("--git-dir").arg(dir);
    }
    cmd.args(args);
    cmd.env(
        "GIT_HTTP_USER_AGENT",
        format!("git ({})", user_agent()),
    );
    cmd.stdin(Stdio::null());
    debug!(?gitdir, ?args, "running git");

    let output = cmd.output().await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            FeedError::Git(format!("'{}' not found, is it installed?", GIT_CMD))
        } else {
            FeedError::Io(e)
        }
    })?;

    Ok(CommandOutput {
        code: output.status.code().unwrap_or(-1),
        stdout: output.stdout,
        stderr: output.stderr,
    })
}

/// Runs a git command and requires it to succeed.
pub async fn git_ok(gitdir: Option<&Path>, args: &[&str]) -> Result<CommandOutput> {
    let output = run_git(gitdir, args).await?;
    if !output.success() {
        return Err(FeedError::Git(format!(
            "git {} exited {}: {}",
            args.join(" "),
            output.code,
            output.stderr_trimmed()
        )));
    }
    Ok(output)
}

/// Runs a lei command. Network-facing subcommands get the user agent.
pub async fn run_lei(args: &[&str]) -> Result<CommandOutput> {
    let mut cmd = Command::new(LEI_CMD);
    if let Some((sub, rest)) = args.split_first() {
        cmd.arg(sub);
        // --user-agent is only understood by 'q' and 'up'.
        if *sub == "q" || *sub == "up" {
            cmd.arg("--user-agent").arg(user_agent());
        }
        cmd.args(rest);
    }
    cmd.stdin(Stdio::null());
    debug!(?args, "running lei");

    let output = cmd.output().await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            FeedError::Lei(format!("'{}' not found, is it installed?", LEI_CMD))
        } else {
            FeedError::Io(e)
        }
    })?;

    Ok(CommandOutput {
        code: output.status.code().unwrap_or(-1),
        stdout: output.stdout,
        stderr: output.stderr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_agent_carries_version() {
        let ua = user_agent();
        assert!(ua.starts_with("loreferry/"));
        assert!(ua.len() > "loreferry/".len());
    }

    #[tokio::test]
    async fn git_version_runs() {
        let output = run_git(None, &["--version"]).await.unwrap();
        assert!(output.success());
        assert!(output.stdout_trimmed().starts_with("git version"));
    }

    #[tokio::test]
    async fn git_ok_surfaces_failures() {
        let err = git_ok(None, &["no-such-subcommand"]).await.unwrap_err();
        match err {
            FeedError::Git(msg) => assert!(msg.contains("no-such-subcommand")),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
