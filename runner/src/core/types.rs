//! Shared deterministic types for the pipeline core.
//!
//! These types define stable contracts between pipeline stages. They carry no
//! I/O handles and serialize to the wire names used in action outputs and the
//! completion callback.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which path the pipeline takes for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    /// Create a new branch and open a pull request.
    #[serde(rename = "pr-gen")]
    Generate,
    /// Push follow-up commits to an existing pull request.
    #[serde(rename = "pr-update")]
    Update,
    /// Produce an implementation plan without touching the repository.
    #[serde(rename = "plan-gen")]
    Plan,
}

impl Mode {
    /// Wire name used by action inputs, template file names and the callback.
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Generate => "pr-gen",
            Mode::Update => "pr-update",
            Mode::Plan => "plan-gen",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pr-gen" | "generate" => Ok(Mode::Generate),
            "pr-update" | "update" => Ok(Mode::Update),
            "plan-gen" | "plan" => Ok(Mode::Plan),
            other => Err(format!(
                "invalid mode '{other}'. Must be one of: pr-gen, pr-update, plan-gen"
            )),
        }
    }
}

/// Terminal classification of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Conclusion {
    Success,
    Failure,
    /// The agent finished cleanly but left nothing to report.
    NoChanges,
}

impl Conclusion {
    pub fn as_str(self) -> &'static str {
        match self {
            Conclusion::Success => "success",
            Conclusion::Failure => "failure",
            Conclusion::NoChanges => "no_changes",
        }
    }
}

impl fmt::Display for Conclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the credential used for the run came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenSource {
    /// Scoped installation token issued by the exchange backend.
    #[serde(rename = "devsy-bot")]
    Broker,
    /// Ambient CI token (or an explicit override).
    #[serde(rename = "github-actions-bot")]
    Fallback,
}

impl TokenSource {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenSource::Broker => "devsy-bot",
            TokenSource::Fallback => "github-actions-bot",
        }
    }
}

impl fmt::Display for TokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Branch the agent operates on. Computed once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BranchContext {
    pub working_branch: String,
    pub is_new_branch: bool,
    pub base_branch: String,
    /// Fork repository (`owner/name`) when the PR head lives outside the run repository.
    pub head_repo: Option<String>,
}

/// System and user prompt handed to the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPrompt {
    pub system_prompt: String,
    pub user_prompt: String,
}

/// Why a run ended in `failure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    BranchNotFound,
    AgentTimeout,
    AgentCrash,
    /// The agent reported an error in its terminal result record.
    AgentError,
    Parse,
    Hosting,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub kind: FailureKind,
    pub message: String,
}

/// Structured result recovered from one agent run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedOutcome {
    pub conclusion: Conclusion,
    pub pr_number: Option<u64>,
    /// May be absent even when `pr_number` is present.
    pub pr_url: Option<String>,
    pub plan_text: Option<String>,
    pub failure: Option<FailureReason>,
}

impl ExtractedOutcome {
    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            conclusion: Conclusion::Failure,
            pr_number: None,
            pr_url: None,
            plan_text: None,
            failure: Some(FailureReason {
                kind,
                message: message.into(),
            }),
        }
    }

    pub fn no_changes() -> Self {
        Self {
            conclusion: Conclusion::NoChanges,
            pr_number: None,
            pr_url: None,
            plan_text: None,
            failure: None,
        }
    }

    pub fn pull_request(number: u64, url: Option<String>) -> Self {
        Self {
            conclusion: Conclusion::Success,
            pr_number: Some(number),
            pr_url: url,
            plan_text: None,
            failure: None,
        }
    }

    pub fn plan(text: String) -> Self {
        Self {
            conclusion: Conclusion::Success,
            pr_number: None,
            pr_url: None,
            plan_text: Some(text),
            failure: None,
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure.as_ref().map(|f| f.kind)
    }
}

/// Identity of the CI run, used for branch names and the callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunMetadata {
    pub run_id: String,
    pub run_url: String,
    /// `owner/name` of the repository the run belongs to.
    pub repository: String,
}

/// Pull request fields the pipeline needs from the hosting API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub number: u64,
    pub title: String,
    pub body: Option<String>,
    pub head_ref: String,
    /// `owner/name` of the head repository; `None` when the fork was deleted.
    pub head_repo: Option<String>,
    pub base_ref: String,
    pub html_url: String,
}

/// Conversation or review comment on a pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrComment {
    pub author: String,
    pub body: String,
    /// File path for review (file-level) comments.
    pub path: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Pull request returned by a creation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedPullRequest {
    pub number: u64,
    pub html_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parses_wire_names_and_aliases() {
        assert_eq!("pr-gen".parse::<Mode>(), Ok(Mode::Generate));
        assert_eq!("update".parse::<Mode>(), Ok(Mode::Update));
        assert_eq!(" Plan-Gen ".parse::<Mode>(), Ok(Mode::Plan));
        assert!("deploy".parse::<Mode>().is_err());
    }

    #[test]
    fn wire_names_serialize_as_action_strings() {
        assert_eq!(
            serde_json::to_string(&Mode::Update).expect("mode"),
            "\"pr-update\""
        );
        assert_eq!(
            serde_json::to_string(&Conclusion::NoChanges).expect("conclusion"),
            "\"no_changes\""
        );
        assert_eq!(
            serde_json::to_string(&TokenSource::Broker).expect("source"),
            "\"devsy-bot\""
        );
    }
}
