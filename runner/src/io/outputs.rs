//! GitHub Actions step outputs.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, instrument};

use crate::core::types::{ExtractedOutcome, TokenSource};

const DELIMITER_BASE: &str = "DEVSY_EOF";

/// Values published as step outputs at the end of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutputs {
    pub conclusion: String,
    pub pr_number: String,
    pub pr_url: String,
    pub branch_name: String,
    pub token_source: String,
    pub execution_file: String,
    pub plan_output: String,
}

impl ActionOutputs {
    pub fn new(
        outcome: &ExtractedOutcome,
        branch_name: &str,
        token_source: TokenSource,
        execution_file: &str,
    ) -> Self {
        Self {
            conclusion: outcome.conclusion.as_str().to_string(),
            pr_number: outcome.pr_number.map(|n| n.to_string()).unwrap_or_default(),
            pr_url: outcome.pr_url.clone().unwrap_or_default(),
            branch_name: branch_name.to_string(),
            token_source: token_source.as_str().to_string(),
            execution_file: execution_file.to_string(),
            plan_output: outcome.plan_text.clone().unwrap_or_default(),
        }
    }

    /// Render in `$GITHUB_OUTPUT` syntax. Multi-line values use a heredoc.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in [
            ("conclusion", &self.conclusion),
            ("pr_number", &self.pr_number),
            ("pr_url", &self.pr_url),
            ("branch_name", &self.branch_name),
            ("token_source", &self.token_source),
            ("execution_file", &self.execution_file),
        ] {
            out.push_str(&format!("{key}={}\n", single_line(value)));
        }
        let delimiter = heredoc_delimiter(&self.plan_output);
        out.push_str(&format!(
            "plan_output<<{delimiter}\n{}\n{delimiter}\n",
            self.plan_output
        ));
        out
    }
}

fn single_line(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

fn heredoc_delimiter(value: &str) -> String {
    let mut delimiter = DELIMITER_BASE.to_string();
    let mut n = 0u32;
    while value.lines().any(|l| l == delimiter) {
        n += 1;
        delimiter = format!("{DELIMITER_BASE}_{n}");
    }
    delimiter
}

/// Append outputs to `path`, or print them to stdout when running outside Actions.
#[instrument(skip_all, fields(to_file = path.is_some()))]
pub fn write_outputs(path: Option<&Path>, outputs: &ActionOutputs) -> Result<()> {
    let rendered = outputs.render();
    match path {
        Some(path) => {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open {}", path.display()))?;
            file.write_all(rendered.as_bytes())
                .with_context(|| format!("write {}", path.display()))?;
            debug!(path = %path.display(), "wrote step outputs");
        }
        None => print!("{rendered}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_all_keys_and_plan_heredoc() {
        let outcome = ExtractedOutcome::plan("# Plan\n\n1. do it".to_string());
        let outputs = ActionOutputs::new(&outcome, "main", TokenSource::Fallback, "/tmp/e.jsonl");
        let rendered = outputs.render();
        assert!(rendered.starts_with("conclusion=success\npr_number=\npr_url=\n"));
        assert!(rendered.contains("token_source=github-actions-bot\n"));
        assert!(rendered.ends_with("plan_output<<DEVSY_EOF\n# Plan\n\n1. do it\nDEVSY_EOF\n"));
    }

    #[test]
    fn delimiter_avoids_collision() {
        assert_eq!(heredoc_delimiter("text\nDEVSY_EOF\nmore"), "DEVSY_EOF_1");
        assert_eq!(heredoc_delimiter("DEVSY_EOF is mentioned inline"), "DEVSY_EOF");
    }

    #[test]
    fn appends_to_output_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("out");
        std::fs::write(&path, "existing=1\n").expect("seed");
        let outputs = ActionOutputs::new(
            &ExtractedOutcome::pull_request(5, Some("https://github.com/o/r/pull/5".to_string())),
            "devsy/x-1",
            TokenSource::Broker,
            "",
        );
        write_outputs(Some(&path), &outputs).expect("write");
        let written = std::fs::read_to_string(&path).expect("read");
        assert!(written.starts_with("existing=1\nconclusion=success\npr_number=5\n"));
        assert!(written.contains("pr_url=https://github.com/o/r/pull/5\n"));
    }
}
