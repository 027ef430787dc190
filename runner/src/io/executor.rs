//! Executor abstraction for agent invocation.
//!
//! The [`Executor`] trait decouples pipeline orchestration from the actual
//! agent backend (the `claude` CLI). Tests use scripted executors that return
//! predetermined artifacts without spawning processes.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::artifact::ExecutionArtifact;
use crate::core::tools::ToolPolicy;
use crate::core::types::RenderedPrompt;
use crate::io::process::{ProcessOptions, run_with_timeout};
use crate::io::token::Credential;

const STDERR_TAIL_BYTES: usize = 2_000;

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct ExecRequest<'a> {
    /// Working directory for the agent process (the checked-out repository).
    pub workdir: PathBuf,
    pub prompt: RenderedPrompt,
    pub tools: ToolPolicy,
    /// Exported to the agent as `GITHUB_TOKEN` / `GH_TOKEN`.
    pub credential: &'a Credential,
    /// Extra environment (model provider switches).
    pub env: Vec<(String, String)>,
    pub model: Option<String>,
    pub max_turns: Option<u32>,
    pub timeout: Duration,
    /// Bytes of agent stdout kept in memory; beyond it the execution file is read back.
    pub output_limit_bytes: usize,
    /// Where the raw stream is persisted as it arrives.
    pub execution_file: Option<PathBuf>,
}

/// Abstraction over agent execution backends.
pub trait Executor {
    /// Run the agent to completion or timeout.
    ///
    /// Returns whatever output was captured regardless of exit status; only a
    /// failure to start the agent is an error.
    fn exec(&self, request: &ExecRequest<'_>) -> Result<ExecutionArtifact>;
}

/// Executor that spawns the `claude` CLI in non-interactive stream-json mode.
#[derive(Debug, Clone)]
pub struct ClaudeExecutor {
    program: String,
}

impl ClaudeExecutor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self, request: &ExecRequest<'_>) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-p")
            .arg("--verbose")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--append-system-prompt")
            .arg(&request.prompt.system_prompt)
            .arg("--allowedTools")
            .arg(request.tools.allowed_csv())
            .arg("--disallowedTools")
            .arg(request.tools.disallowed_csv());
        if let Some(model) = &request.model {
            cmd.arg("--model").arg(model);
        }
        if let Some(max_turns) = request.max_turns {
            cmd.arg("--max-turns").arg(max_turns.to_string());
        }
        cmd.current_dir(&request.workdir)
            .env("GITHUB_TOKEN", request.credential.token())
            .env("GH_TOKEN", request.credential.token())
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        cmd
    }
}

impl Default for ClaudeExecutor {
    fn default() -> Self {
        Self::new("claude")
    }
}

impl Executor for ClaudeExecutor {
    #[instrument(skip_all, fields(program = %self.program, timeout_secs = request.timeout.as_secs()))]
    fn exec(&self, request: &ExecRequest<'_>) -> Result<ExecutionArtifact> {
        info!(workdir = %request.workdir.display(), allowed_tools = request.tools.allowed.len(), "starting agent");

        let output = run_with_timeout(
            self.command(request),
            ProcessOptions {
                stdin: Some(request.prompt.user_prompt.as_bytes()),
                timeout: request.timeout,
                output_limit_bytes: request.output_limit_bytes,
                tee_path: request.execution_file.as_deref(),
            },
        )
        .with_context(|| format!("run {}", self.program))?;

        if output.timed_out {
            warn!(
                timeout_secs = request.timeout.as_secs(),
                "agent timed out"
            );
        } else if !output.status.success() {
            warn!(
                exit_code = ?output.status.code(),
                stderr = %stderr_tail(&output.stderr),
                "agent exited with failure"
            );
        } else {
            debug!("agent completed successfully");
        }

        let (raw, truncated_bytes) = full_stream(
            &output.stdout,
            output.stdout_truncated,
            request.execution_file.as_deref(),
        );
        Ok(ExecutionArtifact {
            raw,
            exit_code: output.status.code(),
            timed_out: output.timed_out,
            truncated_bytes,
            path: request.execution_file.clone(),
        })
    }
}

/// The whole stream when the in-memory tail lost its head.
///
/// The execution file holds every line, so it is preferred over the tail once
/// capture overflowed. The tail still ends with the result record, so it is
/// the fallback when the file cannot be read.
fn full_stream(tail: &[u8], truncated: usize, execution_file: Option<&Path>) -> (String, usize) {
    let tail_text = || String::from_utf8_lossy(tail).into_owned();
    if truncated == 0 {
        return (tail_text(), 0);
    }
    let Some(path) = execution_file else {
        return (tail_text(), truncated);
    };
    match std::fs::read(path) {
        Ok(bytes) => {
            debug!(path = %path.display(), bytes = bytes.len(), "read full stream from execution file");
            (String::from_utf8_lossy(&bytes).into_owned(), 0)
        }
        Err(e) => {
            warn!(path = %path.display(), err = %e, "execution file unreadable, using captured tail");
            (tail_text(), truncated)
        }
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let trimmed = text.trim();
    let mut start = trimmed.len().saturating_sub(STDERR_TAIL_BYTES);
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Mode;

    fn request(credential: &Credential) -> ExecRequest<'_> {
        ExecRequest {
            workdir: PathBuf::from("/work"),
            prompt: RenderedPrompt {
                system_prompt: "system".to_string(),
                user_prompt: "user".to_string(),
            },
            tools: ToolPolicy::assemble(Mode::Plan, &[], &[]),
            credential,
            env: vec![("CLAUDE_CODE_USE_BEDROCK".to_string(), "1".to_string())],
            model: Some("sonnet".to_string()),
            max_turns: Some(12),
            timeout: Duration::from_secs(5),
            output_limit_bytes: 1_000,
            execution_file: None,
        }
    }

    #[test]
    fn command_carries_prompt_tools_and_credential() {
        let credential = Credential::Fallback {
            token: "ghs_ambient".to_string(),
        };
        let req = request(&credential);
        let cmd = ClaudeExecutor::default().command(&req);

        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args[0], "-p");
        let pos = |flag: &str| args.iter().position(|a| a == flag).expect(flag);
        assert_eq!(args[pos("--output-format") + 1], "stream-json");
        assert_eq!(args[pos("--append-system-prompt") + 1], "system");
        assert!(args[pos("--disallowedTools") + 1].contains("Bash(git push:*)"));
        assert_eq!(args[pos("--max-turns") + 1], "12");
        assert_eq!(args[pos("--model") + 1], "sonnet");

        let envs: Vec<(String, String)> = cmd
            .get_envs()
            .filter_map(|(k, v)| {
                Some((
                    k.to_string_lossy().into_owned(),
                    v?.to_string_lossy().into_owned(),
                ))
            })
            .collect();
        assert!(envs.contains(&("GH_TOKEN".to_string(), "ghs_ambient".to_string())));
        assert!(envs.contains(&("CLAUDE_CODE_USE_BEDROCK".to_string(), "1".to_string())));
    }

    #[test]
    fn stderr_tail_keeps_the_end() {
        let long = format!("{}END", "x".repeat(5_000));
        let tail = stderr_tail(long.as_bytes());
        assert_eq!(tail.len(), STDERR_TAIL_BYTES);
        assert!(tail.ends_with("END"));
    }

    #[cfg(unix)]
    #[test]
    fn exec_captures_stream_from_fake_agent() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().expect("tempdir");
        let script = temp.path().join("fake-agent");
        std::fs::write(
            &script,
            "#!/bin/sh\ncat >/dev/null\necho '{\"type\":\"result\",\"subtype\":\"success\",\"is_error\":false,\"result\":\"PR #2\"}'\nexit 1\n",
        )
        .expect("write script");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .expect("chmod");

        let credential = Credential::Fallback {
            token: "t".to_string(),
        };
        let mut req = request(&credential);
        req.workdir = temp.path().to_path_buf();
        req.execution_file = Some(temp.path().join("exec.jsonl"));

        let artifact = ClaudeExecutor::new(script.to_string_lossy())
            .exec(&req)
            .expect("exec");
        assert_eq!(artifact.exit_code, Some(1));
        assert!(artifact.raw.contains("\"result\":\"PR #2\""));
        let persisted = std::fs::read_to_string(temp.path().join("exec.jsonl")).expect("file");
        assert_eq!(persisted, artifact.raw);
    }

    #[cfg(unix)]
    #[test]
    fn overflowing_stream_is_read_back_from_execution_file() {
        use std::os::unix::fs::PermissionsExt;

        use crate::core::extract::extract;
        use crate::core::types::Conclusion;
        use crate::test_support::{assistant_line, ndjson, result_line, tool_result_line};

        let temp = tempfile::tempdir().expect("tempdir");
        let stream = temp.path().join("stream.jsonl");
        std::fs::write(
            &stream,
            ndjson(&[
                assistant_line("Created PR #7 with the fix"),
                tool_result_line(&"x".repeat(4_096)),
                result_line("Done.", false),
            ]),
        )
        .expect("write stream");
        let script = temp.path().join("fake-agent");
        std::fs::write(
            &script,
            format!("#!/bin/sh\ncat >/dev/null\ncat '{}'\n", stream.display()),
        )
        .expect("write script");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .expect("chmod");

        let credential = Credential::Fallback {
            token: "t".to_string(),
        };
        let mut req = request(&credential);
        req.workdir = temp.path().to_path_buf();
        req.output_limit_bytes = 2_048;
        req.execution_file = Some(temp.path().join("exec.jsonl"));

        let artifact = ClaudeExecutor::new(script.to_string_lossy())
            .exec(&req)
            .expect("exec");
        assert_eq!(artifact.truncated_bytes, 0);
        assert!(artifact.raw.contains("Created PR #7"));

        let outcome = extract(&artifact, Mode::Generate);
        assert_eq!(outcome.conclusion, Conclusion::Success);
        assert_eq!(outcome.pr_number, Some(7));
    }

    #[test]
    fn overflow_without_execution_file_keeps_the_tail() {
        let tail = b"{\"type\":\"result\"}\n";
        let (raw, truncated) = full_stream(tail, 100, None);
        assert_eq!(raw, "{\"type\":\"result\"}\n");
        assert_eq!(truncated, 100);

        let missing = Path::new("/definitely/not/an/execution/file");
        let (_, truncated) = full_stream(tail, 100, Some(missing));
        assert_eq!(truncated, 100);
    }
}
