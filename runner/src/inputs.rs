//! Raw process inputs.
//!
//! Action inputs arrive as environment variables; every field can also be
//! passed as a flag. Values are captured exactly once here and never read from
//! the environment again.

use std::path::PathBuf;

use clap::Args;

#[derive(Args, Clone, Default)]
pub struct RunInputs {
    /// pr-gen, pr-update or plan-gen.
    #[arg(long, env = "DEVSY_MODE")]
    pub mode: Option<String>,

    #[arg(long, env = "DEVSY_PROMPT")]
    pub prompt: Option<String>,

    /// File whose contents replace `--prompt`.
    #[arg(long, env = "DEVSY_PROMPT_FILE")]
    pub prompt_file: Option<PathBuf>,

    /// Pull request to update (pr-update only).
    #[arg(long, env = "DEVSY_PR_NUMBER")]
    pub pr_number: Option<String>,

    #[arg(long, env = "DEVSY_BASE_BRANCH")]
    pub base_branch: Option<String>,

    #[arg(long, env = "DEVSY_CUSTOM_INSTRUCTIONS")]
    pub custom_instructions: Option<String>,

    /// Extra allowed tools, comma or newline separated.
    #[arg(long, env = "DEVSY_ALLOWED_TOOLS")]
    pub allowed_tools: Option<String>,

    /// Extra denied tools, comma or newline separated.
    #[arg(long, env = "DEVSY_DISALLOWED_TOOLS")]
    pub disallowed_tools: Option<String>,

    #[arg(long, env = "DEVSY_CALLBACK_URL")]
    pub callback_url: Option<String>,

    #[arg(long, env = "DEVSY_CALLBACK_AUTH_TOKEN", hide_env_values = true)]
    pub callback_auth_token: Option<String>,

    /// Header carrying the callback token (default `Authorization`).
    #[arg(long, env = "DEVSY_CALLBACK_AUTH_HEADER")]
    pub callback_auth_header: Option<String>,

    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    pub anthropic_api_key: Option<String>,

    #[arg(long, env = "DEVSY_USE_BEDROCK")]
    pub use_bedrock: Option<String>,

    #[arg(long, env = "DEVSY_USE_VERTEX")]
    pub use_vertex: Option<String>,

    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    pub github_token: Option<String>,

    /// Bypass the token exchange with this token.
    #[arg(long, env = "OVERRIDE_GITHUB_TOKEN", hide_env_values = true)]
    pub override_github_token: Option<String>,

    /// `owner/name` of the repository.
    #[arg(long, env = "GITHUB_REPOSITORY")]
    pub repository: Option<String>,

    #[arg(long, env = "GITHUB_RUN_ID")]
    pub run_id: Option<String>,

    #[arg(long, env = "GITHUB_SERVER_URL")]
    pub server_url: Option<String>,

    #[arg(long, env = "GITHUB_API_URL")]
    pub api_url: Option<String>,

    #[arg(long, env = "ACTIONS_ID_TOKEN_REQUEST_URL")]
    pub oidc_request_url: Option<String>,

    #[arg(long, env = "ACTIONS_ID_TOKEN_REQUEST_TOKEN", hide_env_values = true)]
    pub oidc_request_token: Option<String>,

    #[arg(long, env = "DEVSY_BACKEND_URL")]
    pub backend_url: Option<String>,

    /// Repository checkout the agent works in.
    #[arg(long, env = "GITHUB_WORKSPACE")]
    pub workdir: Option<PathBuf>,

    /// Directory with `system-prompt-<mode>.md` / `<mode>.md` overrides.
    #[arg(long, env = "DEVSY_TEMPLATES_DIR")]
    pub templates_dir: Option<PathBuf>,

    /// Where the agent's raw stream-json log is written.
    #[arg(long, env = "DEVSY_EXECUTION_FILE")]
    pub execution_file: Option<PathBuf>,

    #[arg(long, env = "RUNNER_TEMP")]
    pub runner_temp: Option<PathBuf>,

    /// Step outputs file; outputs go to stdout when unset.
    #[arg(long, env = "GITHUB_OUTPUT")]
    pub github_output: Option<PathBuf>,

    /// Pipeline TOML config.
    #[arg(long, env = "DEVSY_CONFIG")]
    pub config: Option<PathBuf>,
}
