//! Test-only fakes for every pipeline boundary, plus stream-json builders and
//! a throwaway git repository with a local `origin`.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Result, anyhow, bail};
use chrono::{DateTime, Utc};
use serde_json::json;
use tempfile::TempDir;

use crate::core::artifact::ExecutionArtifact;
use crate::core::tools::ToolPolicy;
use crate::core::types::{BranchContext, CreatedPullRequest, PrComment, PullRequest, RenderedPrompt};
use crate::inputs::RunInputs;
use crate::io::callback::{CallbackPayload, CallbackSender};
use crate::io::executor::{ExecRequest, Executor};
use crate::io::git::Workspace;
use crate::io::hosting::{AccountIdentity, HostingApi, NewPullRequest};
use crate::io::token::{Credential, IssuedToken, TokenExchange};

// ---------------------------------------------------------------------------
// Stream-json builders

pub fn assistant_line(text: &str) -> String {
    json!({
        "type": "assistant",
        "message": { "content": [{ "type": "text", "text": text }] }
    })
    .to_string()
}

pub fn tool_result_line(text: &str) -> String {
    json!({
        "type": "user",
        "message": { "content": [{ "type": "tool_result", "content": text }] }
    })
    .to_string()
}

pub fn result_line(text: &str, is_error: bool) -> String {
    let subtype = if is_error { "error_during_execution" } else { "success" };
    json!({
        "type": "result",
        "subtype": subtype,
        "is_error": is_error,
        "result": text
    })
    .to_string()
}

/// Join lines into an NDJSON body with a trailing newline.
pub fn ndjson(lines: &[String]) -> String {
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

// ---------------------------------------------------------------------------
// Executor

/// What the scripted executor does for one call.
#[derive(Debug, Clone)]
pub enum ScriptedRun {
    Artifact(ExecutionArtifact),
    /// The agent could not be started.
    SpawnError(String),
    Panic(String),
}

/// Owned copy of an [`ExecRequest`].
#[derive(Debug, Clone)]
pub struct RecordedExec {
    pub prompt: RenderedPrompt,
    pub tools: ToolPolicy,
    pub token: String,
    pub env: Vec<(String, String)>,
    pub execution_file: Option<PathBuf>,
}

/// Executor returning queued results in order, recording each request.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    queue: RefCell<VecDeque<ScriptedRun>>,
    pub calls: RefCell<Vec<RecordedExec>>,
}

impl ScriptedExecutor {
    pub fn new(runs: Vec<ScriptedRun>) -> Self {
        Self {
            queue: RefCell::new(runs.into()),
            calls: RefCell::new(Vec::new()),
        }
    }

    /// Single clean exit with the given NDJSON body.
    pub fn completing(raw: impl Into<String>) -> Self {
        Self::new(vec![ScriptedRun::Artifact(ExecutionArtifact::completed(
            raw, 0,
        ))])
    }

    pub fn call_count(&self) -> usize {
        self.calls.borrow().len()
    }
}

impl Executor for ScriptedExecutor {
    fn exec(&self, request: &ExecRequest<'_>) -> Result<ExecutionArtifact> {
        self.calls.borrow_mut().push(RecordedExec {
            prompt: request.prompt.clone(),
            tools: request.tools.clone(),
            token: request.credential.token().to_string(),
            env: request.env.clone(),
            execution_file: request.execution_file.clone(),
        });
        let next = self
            .queue
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted executor exhausted"))?;
        match next {
            ScriptedRun::Artifact(mut artifact) => {
                if let Some(path) = &request.execution_file {
                    std::fs::write(path, &artifact.raw)?;
                    artifact.path = Some(path.clone());
                }
                Ok(artifact)
            }
            ScriptedRun::SpawnError(message) => Err(anyhow!(message)),
            ScriptedRun::Panic(message) => panic!("{message}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Token exchange

/// Exchange that issues a fixed token (or fails) and counts revocations.
#[derive(Debug, Default)]
pub struct FakeTokenExchange {
    issue: Option<IssuedToken>,
    pub exchange_calls: Cell<usize>,
    pub revoked: RefCell<Vec<String>>,
}

impl FakeTokenExchange {
    pub fn issuing(token: &str) -> Self {
        Self::issuing_until(token, None)
    }

    pub fn issuing_until(token: &str, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            issue: Some(IssuedToken {
                token: token.to_string(),
                expires_at,
            }),
            ..Self::default()
        }
    }

    /// Exchange always fails (no OIDC, backend down).
    pub fn failing() -> Self {
        Self::default()
    }

    pub fn revoke_count(&self) -> usize {
        self.revoked.borrow().len()
    }
}

impl TokenExchange for FakeTokenExchange {
    fn exchange(&self) -> Result<IssuedToken> {
        self.exchange_calls.set(self.exchange_calls.get() + 1);
        self.issue
            .clone()
            .ok_or_else(|| anyhow!("OIDC token request environment variables not found"))
    }

    fn revoke(&self, token: &str) -> Result<()> {
        self.revoked.borrow_mut().push(token.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Hosting

/// In-memory hosting API.
#[derive(Debug, Default)]
pub struct FakeHosting {
    pulls: BTreeMap<u64, PullRequest>,
    pub last_commit: Option<DateTime<Utc>>,
    pub issue_comments: Vec<PrComment>,
    pub review_comments: Vec<PrComment>,
    pub account: Option<AccountIdentity>,
    /// When set, every call fails with this message.
    pub fail_with: Option<String>,
    pub next_pr_number: u64,
    pub created: RefCell<Vec<NewPullRequest>>,
    pub comments_posted: RefCell<Vec<(u64, String)>>,
    pub seen_tokens: RefCell<Vec<String>>,
}

impl FakeHosting {
    pub fn pr(number: u64, head: &str, base: &str, head_repo: Option<&str>) -> PullRequest {
        PullRequest {
            number,
            title: format!("PR {number}"),
            body: None,
            head_ref: head.to_string(),
            head_repo: head_repo.map(str::to_string),
            base_ref: base.to_string(),
            html_url: format!("https://github.com/o/r/pull/{number}"),
        }
    }

    pub fn with_pull_request(mut self, pr: PullRequest) -> Self {
        self.pulls.insert(pr.number, pr);
        self
    }

    pub fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Self::default()
        }
    }

    fn check(&self, credential: &Credential) -> Result<()> {
        self.seen_tokens
            .borrow_mut()
            .push(credential.token().to_string());
        match &self.fail_with {
            Some(message) => bail!("{message}"),
            None => Ok(()),
        }
    }
}

impl HostingApi for FakeHosting {
    fn get_pull_request(
        &self,
        credential: &Credential,
        number: u64,
    ) -> Result<Option<PullRequest>> {
        self.check(credential)?;
        Ok(self.pulls.get(&number).cloned())
    }

    fn last_commit_date(
        &self,
        credential: &Credential,
        _number: u64,
    ) -> Result<Option<DateTime<Utc>>> {
        self.check(credential)?;
        Ok(self.last_commit)
    }

    fn list_issue_comments(&self, credential: &Credential, _number: u64) -> Result<Vec<PrComment>> {
        self.check(credential)?;
        Ok(self.issue_comments.clone())
    }

    fn list_review_comments(
        &self,
        credential: &Credential,
        _number: u64,
    ) -> Result<Vec<PrComment>> {
        self.check(credential)?;
        Ok(self.review_comments.clone())
    }

    fn create_pull_request(
        &self,
        credential: &Credential,
        request: &NewPullRequest,
    ) -> Result<CreatedPullRequest> {
        self.check(credential)?;
        self.created.borrow_mut().push(request.clone());
        let number = self.next_pr_number.max(1);
        Ok(CreatedPullRequest {
            number,
            html_url: format!("https://github.com/o/r/pull/{number}"),
        })
    }

    fn create_issue_comment(&self, credential: &Credential, number: u64, body: &str) -> Result<()> {
        self.check(credential)?;
        self.comments_posted
            .borrow_mut()
            .push((number, body.to_string()));
        Ok(())
    }

    fn authenticated_user(&self, credential: &Credential) -> Result<AccountIdentity> {
        self.check(credential)?;
        self.account
            .clone()
            .ok_or_else(|| anyhow!("GET /user returned 403"))
    }
}

// ---------------------------------------------------------------------------
// Workspace

/// Workspace that records calls instead of running git.
#[derive(Debug, Default)]
pub struct RecordingWorkspace {
    pub remote_branches: Vec<String>,
    pub fail_checkout: bool,
    pub identity: RefCell<Option<(String, String)>>,
    pub checkouts: RefCell<Vec<BranchContext>>,
}

impl Workspace for RecordingWorkspace {
    fn configure_identity(&self, name: &str, email: &str) -> Result<()> {
        *self.identity.borrow_mut() = Some((name.to_string(), email.to_string()));
        Ok(())
    }

    fn checkout(&self, branch: &BranchContext) -> Result<()> {
        self.checkouts.borrow_mut().push(branch.clone());
        if self.fail_checkout {
            bail!("git fetch origin {} failed", branch.working_branch);
        }
        Ok(())
    }

    fn remote_branch_exists(&self, branch: &str) -> Result<bool> {
        Ok(self.remote_branches.iter().any(|b| b == branch))
    }
}

// ---------------------------------------------------------------------------
// Callback

/// Callback transport that records deliveries.
#[derive(Debug, Default)]
pub struct RecordingCallback {
    pub fail: bool,
    pub deliveries: RefCell<Vec<(String, Vec<(String, String)>, CallbackPayload)>>,
}

impl CallbackSender for RecordingCallback {
    fn send(
        &self,
        url: &str,
        headers: &[(String, String)],
        payload: &CallbackPayload,
    ) -> Result<u16> {
        self.deliveries
            .borrow_mut()
            .push((url.to_string(), headers.to_vec(), payload.clone()));
        if self.fail {
            bail!("connection refused");
        }
        Ok(200)
    }
}

// ---------------------------------------------------------------------------
// Inputs

/// Valid inputs for `mode` with API-key auth and an ambient token.
pub fn run_inputs(mode: &str, workdir: &Path) -> RunInputs {
    RunInputs {
        mode: Some(mode.to_string()),
        anthropic_api_key: Some("sk-ant-test".to_string()),
        github_token: Some("ghs_ambient".to_string()),
        repository: Some("o/r".to_string()),
        run_id: Some("4242".to_string()),
        workdir: Some(workdir.to_path_buf()),
        execution_file: Some(workdir.join("execution.jsonl")),
        ..RunInputs::default()
    }
}

// ---------------------------------------------------------------------------
// Git

/// Temporary working clone with a bare `origin.git` next to it.
pub struct TestRepo {
    root: TempDir,
    work: PathBuf,
}

impl TestRepo {
    /// Create `origin.git` and a `work` checkout on `main` with one pushed commit.
    pub fn new() -> Result<Self> {
        let root = tempfile::tempdir()?;
        let origin = root.path().join("origin.git");
        let work = root.path().join("work");
        git(root.path(), &["init", "--bare", "-b", "main", path_str(&origin)?])?;
        git(root.path(), &["init", "-b", "main", path_str(&work)?])?;
        git(&work, &["config", "user.name", "test"])?;
        git(&work, &["config", "user.email", "test@example.com"])?;
        git(&work, &["config", "commit.gpgsign", "false"])?;
        std::fs::write(work.join("README.md"), "# test\n")?;
        git(&work, &["add", "-A"])?;
        git(&work, &["commit", "-m", "initial"])?;
        git(&work, &["remote", "add", "origin", path_str(&origin)?])?;
        git(&work, &["push", "origin", "main"])?;
        Ok(Self { root, work })
    }

    pub fn path(&self) -> &Path {
        &self.work
    }

    /// Directory holding `origin.git`, usable as a fork host URL.
    pub fn origin_parent(&self) -> &Path {
        self.root.path()
    }

    /// Push a commit on a new remote branch, leaving the checkout on `main`.
    pub fn push_remote_branch(&self, branch: &str) -> Result<()> {
        git(&self.work, &["checkout", "-b", branch])?;
        std::fs::write(self.work.join(format!("{}.txt", branch.replace('/', "-"))), "x\n")?;
        git(&self.work, &["add", "-A"])?;
        git(&self.work, &["commit", "-m", branch])?;
        git(&self.work, &["push", "origin", branch])?;
        git(&self.work, &["checkout", "main"])?;
        git(&self.work, &["branch", "-D", branch])?;
        Ok(())
    }
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow!("non-utf8 path {}", path.display()))
}

fn git(dir: &Path, args: &[&str]) -> Result<()> {
    let output = Command::new("git").args(args).current_dir(dir).output()?;
    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}
