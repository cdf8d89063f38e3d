//! VCS invocation layer
//!
//! The lifecycle manager talks to the version-control tool only through the
//! [`Vcs`] trait. [`GitCli`] shells out to the `git` binary.

use crate::error::{MirrorError, MirrorResult};
use async_trait::async_trait;
use std::path::Path;
use std::process::{Output, Stdio};
use tokio::process::Command as AsyncCommand;
use tracing::debug;

/// Clone and fetch operations on bare mirrors.
///
/// Implementations must leave any subprocess killable by dropping the
/// returned future; callers enforce timeouts that way.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Vcs: Send + Sync {
    /// Create a bare mirror of `url` (all refs, no working tree) at `dest`
    async fn clone_mirror(&self, url: &str, dest: &Path) -> MirrorResult<()>;

    /// Point the mirror's origin at `url` and fetch new refs, pruning deleted ones
    async fn fetch_mirror(&self, url: &str, dest: &Path) -> MirrorResult<()>;
}

/// `git` command-line client
#[derive(Debug, Clone)]
pub struct GitCli {
    program: String,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new("git")
    }
}

impl GitCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self) -> AsyncCommand {
        let mut cmd = AsyncCommand::new(&self.program);
        cmd.env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(&self, mut cmd: AsyncCommand) -> std::io::Result<Output> {
        debug!("Running {:?}", cmd.as_std());
        cmd.output().await
    }
}

fn stderr_of(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        format!("git exited with {}", output.status)
    } else {
        stderr
    }
}

#[async_trait]
impl Vcs for GitCli {
    async fn clone_mirror(&self, url: &str, dest: &Path) -> MirrorResult<()> {
        let mut cmd = self.command();
        cmd.args(["clone", "--mirror", "--quiet", url]).arg(dest);

        let output = self.run(cmd).await.map_err(|e| MirrorError::CloneFailure {
            url: url.to_string(),
            message: format!("failed to execute {}: {}", self.program, e),
        })?;

        if !output.status.success() {
            return Err(MirrorError::CloneFailure {
                url: url.to_string(),
                message: stderr_of(&output),
            });
        }

        Ok(())
    }

    async fn fetch_mirror(&self, url: &str, dest: &Path) -> MirrorResult<()> {
        let fetch_error = |message: String| MirrorError::FetchFailure {
            path: dest.to_path_buf(),
            message,
        };

        let mut set_url = self.command();
        set_url
            .arg("-C")
            .arg(dest)
            .args(["remote", "set-url", "origin", url]);
        let output = self
            .run(set_url)
            .await
            .map_err(|e| fetch_error(format!("failed to execute {}: {}", self.program, e)))?;
        if !output.status.success() {
            return Err(fetch_error(stderr_of(&output)));
        }

        let mut fetch = self.command();
        fetch
            .arg("-C")
            .arg(dest)
            .args(["fetch", "--prune", "--quiet", "origin"]);
        let output = self
            .run(fetch)
            .await
            .map_err(|e| fetch_error(format!("failed to execute {}: {}", self.program, e)))?;
        if !output.status.success() {
            return Err(fetch_error(stderr_of(&output)));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_program_is_clone_failure() {
        let dir = TempDir::new().unwrap();
        let git = GitCli::new("definitely-not-a-git-binary");

        let result = git
            .clone_mirror("https://example.com/demo.git", &dir.path().join("demo"))
            .await;
        assert_matches!(result, Err(MirrorError::CloneFailure { ref message, .. }) if message.contains("failed to execute"));
    }

    #[tokio::test]
    async fn test_missing_program_is_fetch_failure() {
        let dir = TempDir::new().unwrap();
        let git = GitCli::new("definitely-not-a-git-binary");

        let result = git
            .fetch_mirror("https://example.com/demo.git", dir.path())
            .await;
        assert_matches!(result, Err(MirrorError::FetchFailure { .. }));
    }

    #[test]
    fn test_default_program() {
        assert_eq!(GitCli::default().program, "git");
    }
}
