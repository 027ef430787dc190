//! Pipeline driver: one pass from credential to callback.
//!
//! Stage order is fixed: acquire credential, resolve the branch, configure
//! git identity and check out the branch, render prompts, assemble the tool policy, run the
//! agent, extract the outcome, apply post-agent hosting actions, notify the
//! callback, release the credential.
//!
//! Any stage error becomes a `failure` outcome; the callback and credential
//! release still run. A panicking stage is caught and reported the same way
//! as an internal failure. A panic outside the stages (in notification, say)
//! unwinds through the [`CredentialLease`], whose `Drop` releases the credential.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;

use anyhow::Context;
use chrono::Utc;
use tracing::{error, info, instrument, warn};

use crate::branch::{Resolution, resolve_branch};
use crate::core::extract::extract;
use crate::core::prompt_vars::{generate_vars, plan_vars, summarize_feedback, update_vars};
use crate::core::template::TemplateVars;
use crate::core::tools::ToolPolicy;
use crate::core::types::{
    BranchContext, Conclusion, ExtractedOutcome, FailureKind, Mode, PullRequest, TokenSource,
};
use crate::error::PipelineError;
use crate::exit_codes;
use crate::io::callback::{CallbackSender, DeliveryResult, RunSummary, notify};
use crate::io::executor::{ExecRequest, Executor};
use crate::io::git::Workspace;
use crate::io::hosting::{HostingApi, NewPullRequest, merged_comments};
use crate::io::templates::load_templates;
use crate::io::token::{Credential, CredentialLease, Revocation, TokenBroker, TokenExchange};
use crate::validate::RunSettings;

const MAX_TITLE_CHARS: usize = 72;

/// External collaborators, injected so tests can script every boundary.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub exchange: &'a dyn TokenExchange,
    pub hosting: &'a dyn HostingApi,
    pub workspace: &'a dyn Workspace,
    pub executor: &'a dyn Executor,
    pub callback: &'a dyn CallbackSender,
}

/// Result of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    pub outcome: ExtractedOutcome,
    /// `None` when the run failed before branch resolution finished.
    pub branch: Option<BranchContext>,
    pub token_source: TokenSource,
    pub delivery: DeliveryResult,
    pub revocation: Revocation,
    pub execution_file: PathBuf,
}

impl PipelineReport {
    pub fn exit_code(&self) -> i32 {
        match self.outcome.conclusion {
            Conclusion::Success | Conclusion::NoChanges => exit_codes::OK,
            Conclusion::Failure => exit_codes::FAILURE,
        }
    }

    pub fn branch_name(&self) -> &str {
        self.branch
            .as_ref()
            .map(|b| b.working_branch.as_str())
            .unwrap_or("")
    }
}

/// Run the full pipeline. Never returns an error: failures are reported in the
/// outcome.
#[instrument(skip_all, fields(mode = %settings.request.mode, run_id = %settings.metadata.run_id))]
pub fn run_pipeline(settings: &RunSettings, deps: &Collaborators<'_>) -> PipelineReport {
    let lease: CredentialLease<'_> = TokenBroker::new(deps.exchange).acquire(&settings.ambient);
    let token_source = lease.credential().source();
    info!(token_source = %token_source, "credential acquired");

    let mut branch = None;
    let attempted = panic::catch_unwind(AssertUnwindSafe(|| {
        attempt(settings, deps, lease.credential(), &mut branch)
    }));
    let outcome = match attempted {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(err)) => {
            error!(kind = ?err.kind(), err = %err.report(), "pipeline stage failed");
            ExtractedOutcome::failed(err.kind(), err.report())
        }
        Err(payload) => {
            let message = format!("pipeline stage panicked: {}", panic_message(payload.as_ref()));
            error!(err = %message, "pipeline stage panicked");
            ExtractedOutcome::failed(FailureKind::Internal, message)
        }
    };
    info!(
        conclusion = %outcome.conclusion,
        pr_number = ?outcome.pr_number,
        "run concluded"
    );

    let execution_file = settings.execution_file.display().to_string();
    let delivery = notify(
        deps.callback,
        settings.request.callback.as_ref(),
        RunSummary {
            metadata: &settings.metadata,
            mode: settings.request.mode,
            outcome: &outcome,
            token_source,
            execution_file: &execution_file,
        },
        Utc::now(),
    );

    let revocation = lease.release();

    PipelineReport {
        outcome,
        branch,
        token_source,
        delivery,
        revocation,
        execution_file: settings.execution_file.clone(),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

fn attempt(
    settings: &RunSettings,
    deps: &Collaborators<'_>,
    credential: &Credential,
    branch_out: &mut Option<BranchContext>,
) -> Result<ExtractedOutcome, PipelineError> {
    let request = &settings.request;
    let mode = request.mode;

    let Resolution {
        branch,
        pull_request,
    } = resolve_branch(request, deps.hosting, credential, &settings.metadata)?;
    *branch_out = Some(branch.clone());

    if mode != Mode::Plan {
        configure_identity(settings, deps, credential)?;
        deps.workspace
            .checkout(&branch)
            .with_context(|| format!("checkout {}", branch.working_branch))?;
    }

    let vars = template_vars(settings, deps, credential, &branch, pull_request.as_ref())?;
    let prompt = load_templates(settings.templates_dir.as_deref(), mode)?.render(&vars);
    let tools = ToolPolicy::assemble(mode, &settings.tools.allowed, &settings.tools.disallowed);

    let agent = &settings.config.agent;
    let artifact = deps
        .executor
        .exec(&ExecRequest {
            workdir: settings.workdir.clone(),
            prompt,
            tools,
            credential,
            env: settings.provider_env.clone(),
            model: agent.model.clone(),
            max_turns: agent.max_turns,
            timeout: agent.timeout(),
            output_limit_bytes: agent.output_limit_bytes,
            execution_file: Some(settings.execution_file.clone()),
        })
        .map_err(|e| PipelineError::AgentCrash(format!("{e:#}")))?;

    let outcome = extract(&artifact, mode);
    Ok(post_actions(
        settings,
        deps,
        credential,
        &branch,
        pull_request.as_ref(),
        outcome,
    ))
}

/// Commit identity: the bot account for broker tokens, configured defaults otherwise.
fn configure_identity(
    settings: &RunSettings,
    deps: &Collaborators<'_>,
    credential: &Credential,
) -> Result<(), PipelineError> {
    let fallback = &settings.config.git;
    let (name, email) = match credential {
        Credential::Broker { .. } => match deps.hosting.authenticated_user(credential) {
            Ok(account) => (
                account.login.clone(),
                format!("{}+{}@users.noreply.github.com", account.id, account.login),
            ),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "could not look up bot identity, using fallback");
                (fallback.user_name.clone(), fallback.user_email.clone())
            }
        },
        Credential::Fallback { .. } => (fallback.user_name.clone(), fallback.user_email.clone()),
    };
    deps.workspace
        .configure_identity(&name, &email)
        .context("configure git identity")?;
    Ok(())
}

fn template_vars(
    settings: &RunSettings,
    deps: &Collaborators<'_>,
    credential: &Credential,
    branch: &BranchContext,
    pull_request: Option<&PullRequest>,
) -> Result<TemplateVars, PipelineError> {
    let request = &settings.request;
    let repo = settings.metadata.repository.as_str();
    let custom = request.custom_instructions_text();
    match (request.mode, pull_request) {
        (Mode::Update, Some(pr)) => {
            let last_commit = deps
                .hosting
                .last_commit_date(credential, pr.number)
                .map_err(PipelineError::Hosting)?;
            let issue = deps
                .hosting
                .list_issue_comments(credential, pr.number)
                .map_err(PipelineError::Hosting)?;
            let review = deps
                .hosting
                .list_review_comments(credential, pr.number)
                .map_err(PipelineError::Hosting)?;
            let feedback = summarize_feedback(&merged_comments(issue, review), last_commit);
            Ok(update_vars(repo, custom, pr, &feedback, request.prompt_text()))
        }
        (Mode::Update, None) => Err(PipelineError::Internal(anyhow::anyhow!(
            "update run resolved without a pull request"
        ))),
        (Mode::Generate, _) => Ok(generate_vars(
            repo,
            custom,
            request.prompt_text(),
            &branch.base_branch,
            &branch.working_branch,
        )),
        (Mode::Plan, _) => Ok(plan_vars(repo, custom, request.prompt_text())),
    }
}

fn post_actions(
    settings: &RunSettings,
    deps: &Collaborators<'_>,
    credential: &Credential,
    branch: &BranchContext,
    pull_request: Option<&PullRequest>,
    outcome: ExtractedOutcome,
) -> ExtractedOutcome {
    let actions = &settings.config.post_actions;
    match settings.request.mode {
        Mode::Generate
            if actions.open_pr_if_pushed && outcome.conclusion == Conclusion::NoChanges =>
        {
            open_pushed_branch(settings, deps, credential, branch, outcome)
        }
        Mode::Update if actions.comment_on_update => {
            if let Some(pr) = pull_request {
                let body = status_comment(&outcome, &settings.metadata.run_url);
                if let Err(err) = deps
                    .hosting
                    .create_issue_comment(credential, pr.number, &body)
                {
                    warn!(err = %format!("{err:#}"), number = pr.number, "could not post status comment");
                }
            }
            outcome
        }
        _ => outcome,
    }
}

/// The agent may push without opening a pull request; open it on its behalf.
fn open_pushed_branch(
    settings: &RunSettings,
    deps: &Collaborators<'_>,
    credential: &Credential,
    branch: &BranchContext,
    outcome: ExtractedOutcome,
) -> ExtractedOutcome {
    match deps.workspace.remote_branch_exists(&branch.working_branch) {
        Ok(true) => {}
        Ok(false) => return outcome,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "could not check remote branch");
            return outcome;
        }
    }

    info!(branch = %branch.working_branch, "branch was pushed without a pull request, opening one");
    let prompt = settings.request.prompt_text();
    let new_pr = NewPullRequest {
        title: pull_request_title(prompt),
        body: format!(
            "{}\n\n---\nGenerated by devsy in {}",
            prompt.trim(),
            settings.metadata.run_url
        ),
        head: branch.working_branch.clone(),
        base: branch.base_branch.clone(),
    };
    match deps.hosting.create_pull_request(credential, &new_pr) {
        Ok(created) => {
            info!(number = created.number, "opened pull request");
            ExtractedOutcome::pull_request(created.number, Some(created.html_url))
        }
        Err(err) => {
            let err = PipelineError::Hosting(err.context("open pull request"));
            ExtractedOutcome::failed(FailureKind::Hosting, err.report())
        }
    }
}

/// First non-empty prompt line, cut to a readable title length.
pub fn pull_request_title(prompt: &str) -> String {
    let line = prompt
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("devsy changes");
    if line.chars().count() <= MAX_TITLE_CHARS {
        return line.to_string();
    }
    let cut: String = line.chars().take(MAX_TITLE_CHARS - 3).collect();
    format!("{}...", cut.trim_end())
}

fn status_comment(outcome: &ExtractedOutcome, run_url: &str) -> String {
    let summary = match (&outcome.conclusion, &outcome.failure) {
        (Conclusion::Success, _) => "pushed updates to this pull request".to_string(),
        (Conclusion::NoChanges, _) => "found nothing to change".to_string(),
        (Conclusion::Failure, Some(reason)) => format!("failed: {}", reason.message),
        (Conclusion::Failure, None) => "failed".to_string(),
    };
    format!("devsy {summary}. [Run details]({run_url})")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::FailureReason;

    #[test]
    fn title_uses_first_line_and_truncates() {
        assert_eq!(pull_request_title("\n  Add caching \nbody"), "Add caching");
        assert_eq!(pull_request_title(""), "devsy changes");
        let long = "a".repeat(100);
        let title = pull_request_title(&long);
        assert_eq!(title.chars().count(), MAX_TITLE_CHARS);
        assert!(title.ends_with("..."));
    }

    #[test]
    fn status_comment_mentions_failure_reason() {
        let mut outcome = ExtractedOutcome::no_changes();
        assert_eq!(
            status_comment(&outcome, "https://run"),
            "devsy found nothing to change. [Run details](https://run)"
        );
        outcome.conclusion = Conclusion::Failure;
        outcome.failure = Some(FailureReason {
            kind: FailureKind::AgentTimeout,
            message: "agent timed out".to_string(),
        });
        assert!(status_comment(&outcome, "u").contains("failed: agent timed out"));
    }

    #[test]
    fn exit_code_follows_conclusion() {
        let report = |outcome| PipelineReport {
            outcome,
            branch: None,
            token_source: TokenSource::Fallback,
            delivery: DeliveryResult::Skipped,
            revocation: Revocation::NotRevocable,
            execution_file: PathBuf::new(),
        };
        assert_eq!(report(ExtractedOutcome::no_changes()).exit_code(), 0);
        assert_eq!(
            report(ExtractedOutcome::pull_request(1, None)).exit_code(),
            0
        );
        assert_eq!(
            report(ExtractedOutcome::failed(FailureKind::Parse, "x")).exit_code(),
            1
        );
    }
}
