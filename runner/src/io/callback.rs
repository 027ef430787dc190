//! Completion webhook.
//!
//! Delivery is best effort: one attempt, no retry, and a failure is reported
//! back to the caller as a value so it can never alter the run's exit status.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::core::request::CallbackTarget;
use crate::core::types::{ExtractedOutcome, Mode, RunMetadata, TokenSource};

pub const DEFAULT_AUTH_HEADER: &str = "Authorization";

/// JSON body posted to the callback URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallbackPayload {
    pub run_id: String,
    pub run_url: String,
    pub mode: Mode,
    pub conclusion: String,
    pub pr_number: Option<u64>,
    pub pr_url: Option<String>,
    pub plan_output: Option<String>,
    pub execution_file: String,
    pub token_source: TokenSource,
    pub timestamp: String,
}

impl CallbackPayload {
    pub fn new(
        metadata: &RunMetadata,
        mode: Mode,
        outcome: &ExtractedOutcome,
        execution_file: &str,
        token_source: TokenSource,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id: metadata.run_id.clone(),
            run_url: metadata.run_url.clone(),
            mode,
            conclusion: outcome.conclusion.as_str().to_string(),
            pr_number: outcome.pr_number,
            pr_url: outcome.pr_url.clone().filter(|u| !u.is_empty()),
            plan_output: outcome.plan_text.clone().filter(|p| !p.is_empty()),
            execution_file: execution_file.to_string(),
            token_source,
            timestamp: now.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        }
    }
}

/// Header name/value pairs for one delivery.
pub fn callback_headers(target: &CallbackTarget, metadata: &RunMetadata) -> Vec<(String, String)> {
    let mut headers = vec![
        ("Content-Type".to_string(), "application/json".to_string()),
        ("X-GitHub-Run-ID".to_string(), metadata.run_id.clone()),
        (
            "X-GitHub-Repository".to_string(),
            metadata.repository.clone(),
        ),
    ];
    if let Some(token) = target.auth_token.as_deref().filter(|t| !t.is_empty()) {
        let name = if target.auth_header.trim().is_empty() {
            DEFAULT_AUTH_HEADER
        } else {
            target.auth_header.trim()
        };
        headers.push((name.to_string(), format!("Bearer {token}")));
    }
    headers
}

/// Transport for callback requests. Returns the HTTP status on 2xx.
pub trait CallbackSender {
    fn send(
        &self,
        url: &str,
        headers: &[(String, String)],
        payload: &CallbackPayload,
    ) -> Result<u16>;
}

#[derive(Debug, Clone)]
pub struct HttpCallbackSender {
    http: Client,
}

impl HttpCallbackSender {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("build callback http client")?;
        Ok(Self { http })
    }
}

impl CallbackSender for HttpCallbackSender {
    fn send(
        &self,
        url: &str,
        headers: &[(String, String)],
        payload: &CallbackPayload,
    ) -> Result<u16> {
        let mut request = self.http.post(url).json(payload);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request.send().with_context(|| format!("POST {url}"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("callback returned {status}");
        }
        Ok(status.as_u16())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryResult {
    /// No callback URL configured.
    Skipped,
    Delivered { status: u16 },
    Failed { reason: String },
}

/// Everything the notification reports about the run.
#[derive(Debug, Clone, Copy)]
pub struct RunSummary<'a> {
    pub metadata: &'a RunMetadata,
    pub mode: Mode,
    pub outcome: &'a ExtractedOutcome,
    pub token_source: TokenSource,
    pub execution_file: &'a str,
}

/// Post the completion notification if a target is configured.
#[instrument(skip_all, fields(conclusion = %summary.outcome.conclusion))]
pub fn notify(
    sender: &dyn CallbackSender,
    target: Option<&CallbackTarget>,
    summary: RunSummary<'_>,
    now: DateTime<Utc>,
) -> DeliveryResult {
    let Some(target) = target.filter(|t| !t.url.trim().is_empty()) else {
        return DeliveryResult::Skipped;
    };

    let payload = CallbackPayload::new(
        summary.metadata,
        summary.mode,
        summary.outcome,
        summary.execution_file,
        summary.token_source,
        now,
    );
    let headers = callback_headers(target, summary.metadata);
    info!(
        url = %target.url,
        authenticated = target.auth_token.is_some(),
        "sending callback"
    );

    match sender.send(&target.url, &headers, &payload) {
        Ok(status) => {
            info!(status, "callback delivered");
            DeliveryResult::Delivered { status }
        }
        Err(err) => {
            let reason = format!("{err:#}");
            warn!(url = %target.url, reason = %reason, "callback delivery failed, continuing");
            DeliveryResult::Failed { reason }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use chrono::TimeZone;
    use std::cell::RefCell;

    struct Recorder {
        fail: bool,
        seen: RefCell<Vec<(Vec<(String, String)>, CallbackPayload)>>,
    }

    impl CallbackSender for Recorder {
        fn send(
            &self,
            _url: &str,
            headers: &[(String, String)],
            payload: &CallbackPayload,
        ) -> Result<u16> {
            self.seen
                .borrow_mut()
                .push((headers.to_vec(), payload.clone()));
            if self.fail {
                Err(anyhow!("connection refused"))
            } else {
                Ok(204)
            }
        }
    }

    fn metadata() -> RunMetadata {
        RunMetadata {
            run_id: "99".to_string(),
            run_url: "https://github.com/o/r/actions/runs/99".to_string(),
            repository: "o/r".to_string(),
        }
    }

    fn target(token: Option<&str>, header: &str) -> CallbackTarget {
        CallbackTarget {
            url: "https://hooks.example/devsy".to_string(),
            auth_token: token.map(str::to_string),
            auth_header: header.to_string(),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0)
            .single()
            .expect("time")
    }

    #[test]
    fn payload_has_fixed_shape() {
        let outcome = ExtractedOutcome::pull_request(42, Some(String::new()));
        let payload = CallbackPayload::new(
            &metadata(),
            Mode::Generate,
            &outcome,
            "/tmp/exec.jsonl",
            TokenSource::Broker,
            now(),
        );
        let value = serde_json::to_value(&payload).expect("json");
        assert_eq!(
            value,
            serde_json::json!({
                "run_id": "99",
                "run_url": "https://github.com/o/r/actions/runs/99",
                "mode": "pr-gen",
                "conclusion": "success",
                "pr_number": 42,
                "pr_url": null,
                "plan_output": null,
                "execution_file": "/tmp/exec.jsonl",
                "token_source": "devsy-bot",
                "timestamp": "2024-05-01T10:00:00Z"
            })
        );
    }

    #[test]
    fn custom_auth_header_carries_bearer() {
        let headers = callback_headers(&target(Some("s3cret"), "X-Devsy-Token"), &metadata());
        assert!(headers.contains(&("X-Devsy-Token".to_string(), "Bearer s3cret".to_string())));
        assert!(headers.contains(&("X-GitHub-Run-ID".to_string(), "99".to_string())));

        let headers = callback_headers(&target(Some("s3cret"), ""), &metadata());
        assert!(headers.contains(&("Authorization".to_string(), "Bearer s3cret".to_string())));

        let headers = callback_headers(&target(None, "Authorization"), &metadata());
        assert_eq!(headers.len(), 3);
    }

    #[test]
    fn no_target_is_skipped() {
        let recorder = Recorder {
            fail: false,
            seen: RefCell::new(Vec::new()),
        };
        let outcome = ExtractedOutcome::no_changes();
        let summary = RunSummary {
            metadata: &metadata(),
            mode: Mode::Plan,
            outcome: &outcome,
            token_source: TokenSource::Fallback,
            execution_file: "",
        };
        assert_eq!(notify(&recorder, None, summary, now()), DeliveryResult::Skipped);
        assert!(recorder.seen.borrow().is_empty());
    }

    #[test]
    fn transport_failure_is_reported_not_raised() {
        let recorder = Recorder {
            fail: true,
            seen: RefCell::new(Vec::new()),
        };
        let outcome = ExtractedOutcome::no_changes();
        let meta = metadata();
        let summary = RunSummary {
            metadata: &meta,
            mode: Mode::Plan,
            outcome: &outcome,
            token_source: TokenSource::Fallback,
            execution_file: "",
        };
        let result = notify(&recorder, Some(&target(None, "")), summary, now());
        assert_eq!(
            result,
            DeliveryResult::Failed {
                reason: "connection refused".to_string()
            }
        );
        assert_eq!(recorder.seen.borrow().len(), 1);
    }
}
