//! Version-control collaborator used as a secondary rollback safety net.
//!
//! Only stash and tracked-file queries are needed, so the git adapter is a
//! small explicit wrapper around `git` subprocess calls.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tracing::{debug, instrument, warn};

use crate::errors::{EditGraphError, EditGraphResult};

pub trait VersionControl: Send + Sync {
    /// Whether the working directory is under version control.
    fn is_repository(&self) -> bool;

    fn is_tracked(&self, path: &str) -> bool;

    /// Stash local changes. `Ok(false)` when there was nothing to stash.
    fn stash_push(&self, message: &str) -> EditGraphResult<bool>;

    fn stash_pop(&self) -> EditGraphResult<()>;

    fn stash_drop(&self) -> EditGraphResult<()>;
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct GitCli {
    workdir: PathBuf,
}

impl GitCli {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn run_checked(&self, args: &[&str]) -> EditGraphResult<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EditGraphError::Validation(format!(
                "git {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> EditGraphResult<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .map_err(EditGraphError::from)
    }

    fn succeeds(&self, args: &[&str]) -> bool {
        self.run(args).map(|o| o.status.success()).unwrap_or(false)
    }
}

impl VersionControl for GitCli {
    fn is_repository(&self) -> bool {
        self.succeeds(&["rev-parse", "--git-dir"])
    }

    fn is_tracked(&self, path: &str) -> bool {
        self.succeeds(&["ls-files", "--error-unmatch", path])
    }

    #[instrument(skip_all)]
    fn stash_push(&self, message: &str) -> EditGraphResult<bool> {
        let output = self.run_checked(&["stash", "push", "-m", message])?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stdout.contains("No local changes") || stderr.contains("No local changes") {
            debug!("nothing to stash");
            return Ok(false);
        }
        debug!(message, "stash created");
        Ok(true)
    }

    #[instrument(skip_all)]
    fn stash_pop(&self) -> EditGraphResult<()> {
        self.run_checked(&["stash", "pop"]).map(|_| ()).inspect_err(|e| {
            warn!(err = %e, "stash pop failed");
        })
    }

    #[instrument(skip_all)]
    fn stash_drop(&self) -> EditGraphResult<()> {
        self.run_checked(&["stash", "drop"]).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn git_repo() -> Option<(tempfile::TempDir, GitCli)> {
        if which::which("git").is_err() {
            return None;
        }
        let dir = tempfile::tempdir().unwrap();
        let git = GitCli::new(dir.path());
        let setup: [&[&str]; 3] = [
            &["init", "-q"],
            &["config", "user.email", "dev@example.com"],
            &["config", "user.name", "Dev"],
        ];
        for args in setup {
            git.run_checked(args).unwrap();
        }
        fs::write(dir.path().join("app.py"), "x = 1\n").unwrap();
        git.run_checked(&["add", "app.py"]).unwrap();
        git.run_checked(&["commit", "-q", "-m", "init"]).unwrap();
        Some((dir, git))
    }

    #[test]
    fn test_plain_directory_is_not_repository() {
        let dir = tempfile::tempdir().unwrap();
        let git = GitCli::new(dir.path());
        if which::which("git").is_ok() {
            assert!(!git.is_repository());
        }
        assert!(!git.is_tracked("missing.py"));
    }

    #[test]
    fn test_tracked_files() {
        let Some((dir, git)) = git_repo() else { return };
        assert!(git.is_repository());
        assert!(git.is_tracked("app.py"));
        fs::write(dir.path().join("new.py"), "").unwrap();
        assert!(!git.is_tracked("new.py"));
    }

    #[test]
    fn test_stash_round_trip() {
        let Some((dir, git)) = git_repo() else { return };
        let file = dir.path().join("app.py");

        assert!(!git.stash_push("clean tree").unwrap());

        fs::write(&file, "x = 2\n").unwrap();
        assert!(git.stash_push("before edit").unwrap());
        assert_eq!(fs::read_to_string(&file).unwrap(), "x = 1\n");

        git.stash_pop().unwrap();
        assert_eq!(fs::read_to_string(&file).unwrap(), "x = 2\n");

        assert!(git.stash_push("again").unwrap());
        git.stash_drop().unwrap();
        assert_eq!(fs::read_to_string(&file).unwrap(), "x = 1\n");
        assert!(git.stash_pop().is_err());
    }
}
