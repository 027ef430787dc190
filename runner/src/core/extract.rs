//! Recover the run result from the agent's execution artifact.
//!
//! The artifact is a conversation log rather than a schema, so extraction is
//! deliberately lenient: it never fails, and anything it cannot make sense of
//! degrades to a `failure` or `no_changes` outcome.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::core::artifact::{ExecutionArtifact, ParsedArtifact, TextSource, parse_records};
use crate::core::types::{ExtractedOutcome, FailureKind, Mode};

pub const PLAN_START_MARKER: &str = "=== START OF PLAN MARKDOWN ===";
pub const PLAN_END_MARKER: &str = "=== END OF PLAN MARKDOWN ===";

static PR_REFERENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?P<url>https?://[^\s"'<>()\[\]`]+?/pull/(?P<url_number>\d{1,10}))|(?:(?i:pull\s+request|PR)\s*#|\B#)(?P<number>\d{1,10})\b"#,
    )
    .expect("pr reference regex is valid")
});

/// A pull request mention found in agent text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrReference {
    pub number: u64,
    pub url: Option<String>,
}

/// Classify one agent run.
pub fn extract(artifact: &ExecutionArtifact, mode: Mode) -> ExtractedOutcome {
    if artifact.timed_out {
        return ExtractedOutcome::failed(FailureKind::AgentTimeout, "agent timed out");
    }

    let parsed = parse_records(&artifact.raw);
    if parsed.malformed_lines > 0 {
        warn!(
            malformed_lines = parsed.malformed_lines,
            "skipped malformed execution records"
        );
    }

    match parsed.final_result() {
        Some(result) if result.signals_error() => {
            return ExtractedOutcome::failed(FailureKind::AgentError, result.describe_error());
        }
        Some(_) => {}
        None => {
            if let Some(outcome) = missing_result_failure(artifact, &parsed) {
                return outcome;
            }
        }
    }

    let outcome = match mode {
        Mode::Generate | Mode::Update => match find_pr_reference(&parsed) {
            Some(reference) => ExtractedOutcome::pull_request(reference.number, reference.url),
            None => ExtractedOutcome::no_changes(),
        },
        Mode::Plan => match find_plan_text(&parsed) {
            Some(text) => ExtractedOutcome::plan(text),
            None => ExtractedOutcome::no_changes(),
        },
    };
    debug!(conclusion = %outcome.conclusion, pr_number = ?outcome.pr_number, "extracted outcome");
    outcome
}

/// Decide whether a stream without a terminal result record is usable.
fn missing_result_failure(
    artifact: &ExecutionArtifact,
    parsed: &ParsedArtifact,
) -> Option<ExtractedOutcome> {
    if parsed.malformed_lines > 0 {
        return Some(ExtractedOutcome::failed(
            FailureKind::Parse,
            format!(
                "execution log has {} malformed record(s) and no result record",
                parsed.malformed_lines
            ),
        ));
    }
    if parsed.records.is_empty() {
        return Some(ExtractedOutcome::failed(
            FailureKind::AgentCrash,
            format!(
                "agent produced no output (exit code {})",
                describe_exit(artifact.exit_code)
            ),
        ));
    }
    if artifact.exit_code != Some(0) {
        return Some(ExtractedOutcome::failed(
            FailureKind::AgentCrash,
            format!(
                "agent exited with {} before reporting a result",
                describe_exit(artifact.exit_code)
            ),
        ));
    }
    None
}

fn describe_exit(code: Option<i32>) -> String {
    code.map_or_else(|| "signal".to_string(), |c| c.to_string())
}

/// Last PR mention across all text content.
pub fn find_pr_reference(parsed: &ParsedArtifact) -> Option<PrReference> {
    let mut last: Option<PrReference> = None;
    let mut urls_by_number: HashMap<u64, String> = HashMap::new();

    for segment in parsed.text_segments() {
        for reference in scan_pr_references(segment.text) {
            if let Some(url) = &reference.url {
                urls_by_number.insert(reference.number, url.clone());
            }
            last = Some(reference);
        }
    }

    last.map(|reference| match reference.url {
        Some(_) => reference,
        None => PrReference {
            url: urls_by_number.get(&reference.number).cloned(),
            number: reference.number,
        },
    })
}

/// All PR mentions in `text`, in order of occurrence.
pub fn scan_pr_references(text: &str) -> Vec<PrReference> {
    PR_REFERENCE_RE
        .captures_iter(text)
        .filter_map(|caps| {
            if let Some(url) = caps.name("url") {
                let number = caps.name("url_number")?.as_str().parse().ok()?;
                Some(PrReference {
                    number,
                    url: Some(url.as_str().to_string()),
                })
            } else {
                let number = caps.name("number")?.as_str().parse().ok()?;
                Some(PrReference { number, url: None })
            }
        })
        .collect()
}

/// Plan body between the markers, else the final assistant message.
pub fn find_plan_text(parsed: &ParsedArtifact) -> Option<String> {
    let assistant_text: Vec<&str> = parsed
        .text_segments()
        .into_iter()
        .filter(|s| s.source != TextSource::ToolResult)
        .map(|s| s.text)
        .collect();
    let joined = assistant_text.join("\n");

    if let Some(plan) = between_markers(&joined) {
        return Some(plan.to_string());
    }

    parsed
        .final_message()
        .filter(|message| !message.trim().is_empty())
        .map(str::to_string)
}

/// Trimmed text of the last start marker that is closed by an end marker.
///
/// A trailing start marker with no end after it (a plan cut short) falls back
/// to the previous complete pair.
fn between_markers(text: &str) -> Option<&str> {
    text.rmatch_indices(PLAN_START_MARKER)
        .find_map(|(pos, marker)| {
            let start = pos + marker.len();
            let len = text[start..].find(PLAN_END_MARKER)?;
            let inner = text[start..start + len].trim();
            (!inner.is_empty()).then_some(inner)
        })
}
