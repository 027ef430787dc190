//! Execution artifact captured from the agent, and lenient record parsing.
//!
//! The agent emits newline-delimited JSON turn records (`--output-format
//! stream-json`). Saved execution files may instead hold a single JSON array of
//! the same records. Parsing never fails: malformed lines are counted and
//! skipped, and unknown record types are kept as [`TurnRecord::Other`].

use std::path::PathBuf;

use serde_json::Value;

/// Raw output of one agent invocation. Read once by the extractor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecutionArtifact {
    /// Captured stdout, verbatim (lossy UTF-8).
    pub raw: String,
    /// `None` when the process was killed by a signal or never reported a code.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// Leading bytes of the stream missing from `raw`.
    pub truncated_bytes: usize,
    /// Where the stream was persisted, if anywhere.
    pub path: Option<PathBuf>,
}

impl ExecutionArtifact {
    /// Artifact for a completed process with the given stdout and exit code.
    pub fn completed(raw: impl Into<String>, exit_code: i32) -> Self {
        Self {
            raw: raw.into(),
            exit_code: Some(exit_code),
            ..Self::default()
        }
    }
}

/// Terminal record of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultRecord {
    pub is_error: bool,
    pub subtype: Option<String>,
    pub text: Option<String>,
}

impl ResultRecord {
    /// True when the agent signalled failure (`is_error` or an `error*` subtype).
    pub fn signals_error(&self) -> bool {
        self.is_error
            || self
                .subtype
                .as_deref()
                .is_some_and(|s| s.starts_with("error"))
    }

    pub fn describe_error(&self) -> String {
        let subtype = self.subtype.as_deref().unwrap_or("error");
        match self.text.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            Some(text) => format!("agent reported {subtype}: {text}"),
            None => format!("agent reported {subtype}"),
        }
    }
}

/// One parsed turn record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnRecord {
    /// Assistant message text blocks.
    Assistant { texts: Vec<String> },
    /// Tool results returned to the agent.
    ToolResults { texts: Vec<String> },
    Result(ResultRecord),
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextSource {
    Assistant,
    ToolResult,
    Result,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSegment<'a> {
    pub source: TextSource,
    pub text: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedArtifact {
    pub records: Vec<TurnRecord>,
    pub malformed_lines: usize,
}

impl ParsedArtifact {
    /// Most recent terminal result record.
    pub fn final_result(&self) -> Option<&ResultRecord> {
        self.records.iter().rev().find_map(|record| match record {
            TurnRecord::Result(result) => Some(result),
            _ => None,
        })
    }

    /// All text content in stream order.
    pub fn text_segments(&self) -> Vec<TextSegment<'_>> {
        let mut segments = Vec::new();
        for record in &self.records {
            match record {
                TurnRecord::Assistant { texts } => {
                    segments.extend(texts.iter().map(|text| TextSegment {
                        source: TextSource::Assistant,
                        text,
                    }));
                }
                TurnRecord::ToolResults { texts } => {
                    segments.extend(texts.iter().map(|text| TextSegment {
                        source: TextSource::ToolResult,
                        text,
                    }));
                }
                TurnRecord::Result(result) => {
                    if let Some(text) = &result.text {
                        segments.push(TextSegment {
                            source: TextSource::Result,
                            text,
                        });
                    }
                }
                TurnRecord::Other => {}
            }
        }
        segments
    }

    /// Final assistant message: the result text, else the last assistant text.
    pub fn final_message(&self) -> Option<&str> {
        if let Some(text) = self
            .final_result()
            .and_then(|r| r.text.as_deref())
            .filter(|t| !t.trim().is_empty())
        {
            return Some(text);
        }
        self.records.iter().rev().find_map(|record| match record {
            TurnRecord::Assistant { texts } => texts
                .iter()
                .rev()
                .map(String::as_str)
                .find(|t| !t.trim().is_empty()),
            _ => None,
        })
    }
}

/// Parse an artifact body into turn records.
pub fn parse_records(raw: &str) -> ParsedArtifact {
    let trimmed = raw.trim_start();
    if trimmed.starts_with('[')
        && let Ok(Value::Array(items)) = serde_json::from_str::<Value>(trimmed)
    {
        return ParsedArtifact {
            records: items.iter().map(record_from_value).collect(),
            malformed_lines: 0,
        };
    }

    let mut parsed = ParsedArtifact::default();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(value) if value.is_object() => parsed.records.push(record_from_value(&value)),
            _ => parsed.malformed_lines += 1,
        }
    }
    parsed
}

fn record_from_value(value: &Value) -> TurnRecord {
    match value.get("type").and_then(Value::as_str) {
        Some("assistant") => {
            let mut texts = Vec::new();
            if let Some(content) = message_content(value) {
                collect_blocks(content, "text", &mut texts);
            }
            TurnRecord::Assistant { texts }
        }
        Some("user") => {
            let mut texts = Vec::new();
            if let Some(Value::Array(blocks)) = message_content(value) {
                for block in blocks {
                    if block.get("type").and_then(Value::as_str) == Some("tool_result")
                        && let Some(content) = block.get("content")
                    {
                        collect_blocks(content, "text", &mut texts);
                    }
                }
            }
            TurnRecord::ToolResults { texts }
        }
        Some("result") => TurnRecord::Result(ResultRecord {
            is_error: value
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            subtype: value
                .get("subtype")
                .and_then(Value::as_str)
                .map(str::to_string),
            text: value
                .get("result")
                .and_then(Value::as_str)
                .map(str::to_string),
        }),
        _ => TurnRecord::Other,
    }
}

fn message_content(value: &Value) -> Option<&Value> {
    value
        .get("message")
        .and_then(|m| m.get("content"))
        .or_else(|| value.get("content"))
}

/// Collect text from a content value: a plain string or an array of blocks.
fn collect_blocks(content: &Value, block_type: &str, out: &mut Vec<String>) {
    match content {
        Value::String(text) => out.push(text.clone()),
        Value::Array(blocks) => {
            for block in blocks {
                match block {
                    Value::String(text) => out.push(text.clone()),
                    Value::Object(_) => {
                        if block.get("type").and_then(Value::as_str) == Some(block_type)
                            && let Some(text) = block.get("text").and_then(Value::as_str)
                        {
                            out.push(text.to_string());
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
}
