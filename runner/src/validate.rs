//! Input validation: turn raw [`RunInputs`] into immutable [`RunSettings`].
//!
//! Runs before any network or git call. Every rejection is a
//! [`PipelineError::Validation`].

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::core::request::{CallbackTarget, RunRequest};
use crate::core::tools::parse_tool_list;
use crate::core::types::{Mode, RunMetadata};
use crate::error::PipelineError;
use crate::inputs::RunInputs;
use crate::io::callback::DEFAULT_AUTH_HEADER;
use crate::io::config::PipelineConfig;
use crate::io::token::{AmbientCredential, DEFAULT_API_URL, DEFAULT_BACKEND_URL};

const DEFAULT_BASE_BRANCH: &str = "main";
const DEFAULT_SERVER_URL: &str = "https://github.com";

/// External endpoints the run talks to.
#[derive(Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub api_url: String,
    pub server_url: String,
    pub backend_url: String,
    pub oidc_request_url: Option<String>,
    pub oidc_request_token: Option<String>,
}

/// Caller additions to the tool policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOverrides {
    pub allowed: Vec<String>,
    pub disallowed: Vec<String>,
}

/// Everything one pipeline run needs, validated.
#[derive(Clone)]
pub struct RunSettings {
    pub request: RunRequest,
    pub metadata: RunMetadata,
    pub ambient: AmbientCredential,
    pub endpoints: Endpoints,
    pub tools: ToolOverrides,
    /// Model provider environment for the agent.
    pub provider_env: Vec<(String, String)>,
    pub workdir: PathBuf,
    pub templates_dir: Option<PathBuf>,
    pub execution_file: PathBuf,
    pub github_output: Option<PathBuf>,
    pub config: PipelineConfig,
}

fn invalid(message: impl Into<String>) -> PipelineError {
    PipelineError::Validation(message.into())
}

/// Trimmed, non-empty value.
fn present(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn flag(value: &Option<String>) -> bool {
    value
        .as_deref()
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
}

pub fn parse_mode(raw: Option<&str>) -> Result<Mode, PipelineError> {
    let raw = raw
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| invalid("mode is required (pr-gen, pr-update or plan-gen)"))?;
    raw.parse::<Mode>().map_err(invalid)
}

fn read_prompt(inputs: &RunInputs) -> Result<Option<String>, PipelineError> {
    if let Some(path) = &inputs.prompt_file {
        let text = fs::read_to_string(path)
            .map_err(|e| invalid(format!("cannot read prompt_file {}: {e}", path.display())))?;
        let text = text.trim();
        if !text.is_empty() {
            return Ok(Some(text.to_string()));
        }
    }
    Ok(present(&inputs.prompt))
}

fn parse_pr_number(raw: &str) -> Result<u64, PipelineError> {
    match raw.trim().trim_start_matches('#').parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(invalid(format!("invalid PR number: {raw}"))),
    }
}

fn validate_authentication(inputs: &RunInputs) -> Result<Vec<(String, String)>, PipelineError> {
    let mut env = Vec::new();
    let api_key = present(&inputs.anthropic_api_key);
    let bedrock = flag(&inputs.use_bedrock);
    let vertex = flag(&inputs.use_vertex);
    if api_key.is_none() && !bedrock && !vertex {
        return Err(invalid(
            "authentication required: provide anthropic_api_key, or set use_bedrock or use_vertex to true",
        ));
    }
    if let Some(key) = api_key {
        env.push(("ANTHROPIC_API_KEY".to_string(), key));
    }
    if bedrock {
        env.push(("CLAUDE_CODE_USE_BEDROCK".to_string(), "1".to_string()));
    }
    if vertex {
        env.push(("CLAUDE_CODE_USE_VERTEX".to_string(), "1".to_string()));
    }
    Ok(env)
}

fn callback_target(inputs: &RunInputs) -> Option<CallbackTarget> {
    let url = present(&inputs.callback_url)?;
    Some(CallbackTarget {
        url,
        auth_token: present(&inputs.callback_auth_token),
        auth_header: present(&inputs.callback_auth_header)
            .unwrap_or_else(|| DEFAULT_AUTH_HEADER.to_string()),
    })
}

fn default_execution_file(runner_temp: Option<&Path>, run_id: &str) -> PathBuf {
    let dir = runner_temp
        .map(Path::to_path_buf)
        .unwrap_or_else(std::env::temp_dir);
    let name = if run_id.is_empty() {
        "devsy-execution.jsonl".to_string()
    } else {
        format!("devsy-execution-{run_id}.jsonl")
    };
    dir.join(name)
}

/// Validate inputs in the order the action checks them: mode, authentication,
/// mode requirements, then repository context.
pub fn build_settings(
    inputs: &RunInputs,
    config: PipelineConfig,
) -> Result<RunSettings, PipelineError> {
    let mode = parse_mode(inputs.mode.as_deref())?;
    let provider_env = validate_authentication(inputs)?;

    let prompt = read_prompt(inputs)?;
    if mode == Mode::Generate && prompt.is_none() {
        return Err(invalid("prompt or prompt_file is required for pr-gen mode"));
    }
    let target_pr = match (mode, present(&inputs.pr_number)) {
        (Mode::Update, None) => {
            return Err(invalid("pr_number is required for pr-update mode"));
        }
        (Mode::Update, Some(raw)) => Some(parse_pr_number(&raw)?),
        _ => None,
    };

    let repository = present(&inputs.repository)
        .ok_or_else(|| invalid("repository is required (GITHUB_REPOSITORY)"))?;
    if !repository.contains('/') {
        return Err(invalid(format!(
            "repository must be owner/name, got '{repository}'"
        )));
    }
    let override_token = present(&inputs.override_github_token);
    let github_token = present(&inputs.github_token);
    if github_token.is_none() && override_token.is_none() {
        return Err(invalid("GITHUB_TOKEN is required for fallback"));
    }

    let run_id = present(&inputs.run_id).unwrap_or_default();
    let server_url =
        present(&inputs.server_url).unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());
    let run_url = format!(
        "{}/{repository}/actions/runs/{run_id}",
        server_url.trim_end_matches('/')
    );

    let request = RunRequest {
        mode,
        prompt,
        target_pr,
        base_branch: present(&inputs.base_branch)
            .unwrap_or_else(|| DEFAULT_BASE_BRANCH.to_string()),
        custom_instructions: present(&inputs.custom_instructions),
        callback: callback_target(inputs),
    };

    let execution_file = inputs
        .execution_file
        .clone()
        .unwrap_or_else(|| default_execution_file(inputs.runner_temp.as_deref(), &run_id));

    debug!(mode = %mode, repository = %repository, "inputs validated");
    Ok(RunSettings {
        request,
        metadata: RunMetadata {
            run_id,
            run_url,
            repository,
        },
        ambient: AmbientCredential {
            github_token: github_token.unwrap_or_default(),
            override_token,
        },
        endpoints: Endpoints {
            api_url: present(&inputs.api_url).unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            server_url,
            backend_url: present(&inputs.backend_url)
                .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string()),
            oidc_request_url: present(&inputs.oidc_request_url),
            oidc_request_token: present(&inputs.oidc_request_token),
        },
        tools: ToolOverrides {
            allowed: inputs
                .allowed_tools
                .as_deref()
                .map(parse_tool_list)
                .unwrap_or_default(),
            disallowed: inputs
                .disallowed_tools
                .as_deref()
                .map(parse_tool_list)
                .unwrap_or_default(),
        },
        provider_env,
        workdir: inputs.workdir.clone().unwrap_or_else(|| PathBuf::from(".")),
        templates_dir: inputs.templates_dir.clone(),
        execution_file,
        github_output: inputs.github_output.clone(),
        config,
    })
}
