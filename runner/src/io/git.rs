//! Git adapter for workspace preparation.
//!
//! The pipeline only needs identity setup, branch checkout and a remote branch
//! lookup, so we keep a small, explicit wrapper around `git` subprocess calls.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::types::BranchContext;

/// Remote name used for fork pull requests.
pub const FORK_REMOTE: &str = "pr-fork";

/// Git side effects the pipeline performs on the checked-out repository.
pub trait Workspace {
    fn configure_identity(&self, name: &str, email: &str) -> Result<()>;
    /// Put the working tree on the branch the agent will operate on.
    fn checkout(&self, branch: &BranchContext) -> Result<()>;
    fn remote_branch_exists(&self, branch: &str) -> Result<bool>;
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    host_url: String,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            host_url: "https://github.com".to_string(),
        }
    }

    /// Override the base URL fork remotes are cloned from.
    pub fn with_host_url(mut self, host_url: impl Into<String>) -> Self {
        self.host_url = host_url.into();
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    fn fork_url(&self, repo: &str) -> String {
        format!("{}/{repo}.git", self.host_url.trim_end_matches('/'))
    }

    fn checkout_fork(&self, fork: &str, head: &str) -> Result<()> {
        let url = self.fork_url(fork);
        if let Err(e) = self.run_checked(&["remote", "add", FORK_REMOTE, &url]) {
            debug!(err = %e, "fork remote already present");
        }
        self.run_checked(&["fetch", FORK_REMOTE, head])?;
        let start = format!("{FORK_REMOTE}/{head}");
        self.run_checked(&["checkout", "-B", head, &start])?;
        Ok(())
    }

    fn checkout_existing(&self, head: &str) -> Result<()> {
        self.run_checked(&["fetch", "origin", head])?;
        self.run_checked(&["checkout", head])?;
        Ok(())
    }

    fn checkout_new(&self, branch: &str, base: &str) -> Result<()> {
        let start = match self.run_checked(&["fetch", "origin", base]) {
            Ok(_) => format!("origin/{base}"),
            Err(e) => {
                warn!(err = %e, base, "could not fetch base branch, branching from HEAD");
                "HEAD".to_string()
            }
        };
        self.run_checked(&["checkout", "-b", branch, &start])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

impl Workspace for Git {
    #[instrument(skip_all, fields(name = %name))]
    fn configure_identity(&self, name: &str, email: &str) -> Result<()> {
        self.run_checked(&["config", "user.name", name])?;
        self.run_checked(&["config", "user.email", email])?;
        self.run_checked(&[
            "config",
            "url.https://github.com/.insteadOf",
            "git@github.com:",
        ])?;
        debug!(email, "configured git identity");
        Ok(())
    }

    #[instrument(skip_all, fields(branch = %branch.working_branch, new = branch.is_new_branch))]
    fn checkout(&self, branch: &BranchContext) -> Result<()> {
        let head = branch.working_branch.as_str();
        if branch.is_new_branch {
            self.checkout_new(head, &branch.base_branch)?;
        } else if let Some(fork) = &branch.head_repo {
            info!(fork = %fork, "fork pull request detected");
            self.checkout_fork(fork, head)?;
        } else {
            self.checkout_existing(head)?;
        }

        let current = self.current_branch()?;
        if current != head {
            return Err(anyhow!(
                "checked out '{current}' but expected '{head}'"
            ));
        }
        info!("branch ready");
        Ok(())
    }

    #[instrument(skip_all, fields(branch = %branch))]
    fn remote_branch_exists(&self, branch: &str) -> Result<bool> {
        let refname = format!("refs/heads/{branch}");
        let out = self.run_capture(&["ls-remote", "--heads", "origin", &refname])?;
        Ok(!out.trim().is_empty())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    fn context(branch: &str, new: bool, base: &str, fork: Option<&str>) -> BranchContext {
        BranchContext {
            working_branch: branch.to_string(),
            is_new_branch: new,
            base_branch: base.to_string(),
            head_repo: fork.map(str::to_string),
        }
    }

    #[test]
    fn new_branch_starts_from_remote_base() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        git.checkout(&context("devsy/add-cache-1", true, "main", None))
            .expect("checkout");
        assert_eq!(git.current_branch().expect("branch"), "devsy/add-cache-1");
        assert!(!git.remote_branch_exists("devsy/add-cache-1").expect("ls-remote"));
    }

    #[test]
    fn existing_branch_is_fetched_from_origin() {
        let repo = TestRepo::new().expect("repo");
        repo.push_remote_branch("feature/x").expect("remote branch");
        let git = Git::new(repo.path());
        assert!(git.remote_branch_exists("feature/x").expect("ls-remote"));
        git.checkout(&context("feature/x", false, "main", None))
            .expect("checkout");
        assert_eq!(git.current_branch().expect("branch"), "feature/x");
    }

    #[test]
    fn fork_branch_checks_out_through_fork_remote() {
        let repo = TestRepo::new().expect("repo");
        repo.push_remote_branch("patch-1").expect("remote branch");
        let host = repo.origin_parent().to_string_lossy().into_owned();
        let git = Git::new(repo.path()).with_host_url(host);
        git.checkout(&context("patch-1", false, "main", Some("origin")))
            .expect("checkout");
        assert_eq!(git.current_branch().expect("branch"), "patch-1");
    }

    #[test]
    fn missing_branch_fails() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        let err = git
            .checkout(&context("nope", false, "main", None))
            .unwrap_err();
        assert!(err.to_string().contains("git fetch origin nope failed"));
    }

    #[test]
    fn identity_is_written_to_local_config() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        git.configure_identity("devsy-bot", "no-reply@devsy.ai")
            .expect("identity");
        let name = git.run_capture(&["config", "user.name"]).expect("name");
        assert_eq!(name.trim(), "devsy-bot");
    }
}
