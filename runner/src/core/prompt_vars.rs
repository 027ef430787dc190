//! Mode-specific template variable assembly.
//!
//! The renderer is mode-agnostic; this module decides which names each mode
//! receives.

use chrono::{DateTime, Utc};

use crate::core::template::TemplateVars;
use crate::core::types::{PrComment, PullRequest};

const NO_DESCRIPTION: &str = "No description provided.";
const NO_RECENT_COMMENTS: &str = "No recent comments.";

/// Reviewer feedback gathered for an update run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feedback {
    /// One-line description of which comments were selected.
    pub context: String,
    pub comments_text: String,
}

/// Select comments newer than the last commit and format them for the prompt.
///
/// With no commits every comment counts as feedback.
pub fn summarize_feedback(
    comments: &[PrComment],
    last_commit_at: Option<DateTime<Utc>>,
) -> Feedback {
    let (context, selected): (String, Vec<&PrComment>) = match last_commit_at {
        Some(at) => (
            format!(
                "Comments since last commit ({}):",
                at.format("%Y-%m-%dT%H:%M:%SZ")
            ),
            comments.iter().filter(|c| c.created_at > at).collect(),
        ),
        None => (
            "All comments (no previous commits):".to_string(),
            comments.iter().collect(),
        ),
    };

    let parts: Vec<String> = selected.iter().map(|c| format_comment(c)).collect();
    let comments_text = if parts.is_empty() {
        NO_RECENT_COMMENTS.to_string()
    } else {
        parts.join("\n\n")
    };

    Feedback {
        context,
        comments_text,
    }
}

fn format_comment(comment: &PrComment) -> String {
    match &comment.path {
        Some(path) => format!(
            "@{} (file comment on {}):\n{}",
            comment.author, path, comment.body
        ),
        None => format!("@{} (conversation comment):\n{}", comment.author, comment.body),
    }
}

fn common(repo_name: &str, custom_instructions: &str) -> TemplateVars {
    let mut vars = TemplateVars::new();
    vars.insert("repo_name".to_string(), repo_name.to_string());
    vars.insert(
        "custom_instructions".to_string(),
        custom_instructions.to_string(),
    );
    vars
}

pub fn generate_vars(
    repo_name: &str,
    custom_instructions: &str,
    user_prompt: &str,
    base_branch: &str,
    branch_name: &str,
) -> TemplateVars {
    let mut vars = common(repo_name, custom_instructions);
    vars.insert("user_prompt".to_string(), user_prompt.to_string());
    vars.insert("base_branch".to_string(), base_branch.to_string());
    vars.insert("branch_name".to_string(), branch_name.to_string());
    vars
}

pub fn update_vars(
    repo_name: &str,
    custom_instructions: &str,
    pr: &PullRequest,
    feedback: &Feedback,
    user_prompt: &str,
) -> TemplateVars {
    let mut vars = common(repo_name, custom_instructions);
    let body = pr
        .body
        .as_deref()
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .unwrap_or(NO_DESCRIPTION);
    let additional = if user_prompt.trim().is_empty() {
        String::new()
    } else {
        format!("Additional instructions: {}", user_prompt.trim())
    };
    vars.insert("pr_number".to_string(), pr.number.to_string());
    vars.insert("pr_title".to_string(), pr.title.clone());
    vars.insert("pr_body".to_string(), body.to_string());
    vars.insert("base_branch".to_string(), pr.base_ref.clone());
    vars.insert("feedback_context".to_string(), feedback.context.clone());
    vars.insert("comments_text".to_string(), feedback.comments_text.clone());
    vars.insert("additional_instructions".to_string(), additional);
    vars
}

pub fn plan_vars(repo_name: &str, custom_instructions: &str, user_prompt: &str) -> TemplateVars {
    let mut vars = common(repo_name, custom_instructions);
    vars.insert("user_prompt".to_string(), user_prompt.to_string());
    vars
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).single().expect("valid time")
    }

    fn comment(author: &str, body: &str, path: Option<&str>, hour: u32) -> PrComment {
        PrComment {
            author: author.to_string(),
            body: body.to_string(),
            path: path.map(str::to_string),
            created_at: at(hour),
        }
    }

    fn pr(body: Option<&str>) -> PullRequest {
        PullRequest {
            number: 42,
            title: "Add cache".to_string(),
            body: body.map(str::to_string),
            head_ref: "feature/cache".to_string(),
            head_repo: Some("o/r".to_string()),
            base_ref: "develop".to_string(),
            html_url: "https://github.com/o/r/pull/42".to_string(),
        }
    }

    #[test]
    fn feedback_keeps_only_comments_after_last_commit() {
        let comments = vec![
            comment("old", "stale", None, 8),
            comment("alice", "rename this", Some("src/lib.rs"), 11),
            comment("bob", "looks good otherwise", None, 12),
        ];
        let feedback = summarize_feedback(&comments, Some(at(10)));
        assert_eq!(feedback.context, "Comments since last commit (2024-05-01T10:00:00Z):");
        assert_eq!(
            feedback.comments_text,
            "@alice (file comment on src/lib.rs):\nrename this\n\n@bob (conversation comment):\nlooks good otherwise"
        );
    }

    #[test]
    fn feedback_without_commits_uses_everything() {
        let comments = vec![comment("old", "first", None, 8)];
        let feedback = summarize_feedback(&comments, None);
        assert_eq!(feedback.context, "All comments (no previous commits):");
        assert!(feedback.comments_text.contains("@old"));
    }

    #[test]
    fn feedback_placeholder_when_nothing_new() {
        let feedback = summarize_feedback(&[comment("old", "x", None, 8)], Some(at(9)));
        assert_eq!(feedback.comments_text, "No recent comments.");
    }

    #[test]
    fn update_vars_fill_defaults() {
        let feedback = summarize_feedback(&[], None);
        let vars = update_vars("o/r", "", &pr(Some("  ")), &feedback, "");
        assert_eq!(vars["pr_body"], "No description provided.");
        assert_eq!(vars["pr_number"], "42");
        assert_eq!(vars["base_branch"], "develop");
        assert_eq!(vars["additional_instructions"], "");

        let vars = update_vars("o/r", "", &pr(None), &feedback, " also bump deps ");
        assert_eq!(
            vars["additional_instructions"],
            "Additional instructions: also bump deps"
        );
    }

    #[test]
    fn plan_vars_are_minimal() {
        let vars = plan_vars("o/r", "be brief", "plan X");
        let keys: Vec<&str> = vars.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["custom_instructions", "repo_name", "user_prompt"]);
    }
}
