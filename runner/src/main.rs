//! `devsy`: run a coding agent from a CI job to open PRs, update PRs or write plans.
//!
//! Inputs come from flags or the environment variables GitHub Actions sets.
//! Exit codes are listed in [`devsy_runner::exit_codes`].

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use devsy_runner::core::artifact::ExecutionArtifact;
use devsy_runner::core::extract::extract;
use devsy_runner::core::tools::{ToolPolicy, parse_tool_list};
use devsy_runner::core::types::{Conclusion, Mode};
use devsy_runner::exit_codes;
use devsy_runner::inputs::RunInputs;
use devsy_runner::io::callback::HttpCallbackSender;
use devsy_runner::io::config::load_config;
use devsy_runner::io::executor::ClaudeExecutor;
use devsy_runner::io::git::Git;
use devsy_runner::io::hosting::GithubClient;
use devsy_runner::io::outputs::{ActionOutputs, write_outputs};
use devsy_runner::io::token::OidcTokenExchange;
use devsy_runner::logging;
use devsy_runner::pipeline::{Collaborators, run_pipeline};
use devsy_runner::validate::{RunSettings, build_settings};

#[derive(Parser)]
#[command(
    name = "devsy",
    version,
    about = "Drive a coding agent to generate PRs, update PRs or write plans"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full pipeline.
    Run(RunInputs),
    /// Validate inputs and config without calling anything external.
    Validate(RunInputs),
    /// Re-run output extraction on a saved execution file and print the outcome as JSON.
    Extract {
        #[arg(long)]
        execution_file: PathBuf,
        #[arg(long)]
        mode: Mode,
        /// Exit code the agent finished with.
        #[arg(long, default_value_t = 0)]
        exit_code: i32,
    },
    /// Print the merged tool policy for a mode as JSON.
    Tools {
        #[arg(long)]
        mode: Mode,
        #[arg(long, default_value = "")]
        allowed_tools: String,
        #[arg(long, default_value = "")]
        disallowed_tools: String,
    },
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::FAILURE
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(inputs) => cmd_run(&inputs),
        Command::Validate(inputs) => cmd_validate(&inputs),
        Command::Extract {
            execution_file,
            mode,
            exit_code,
        } => cmd_extract(&execution_file, mode, exit_code),
        Command::Tools {
            mode,
            allowed_tools,
            disallowed_tools,
        } => cmd_tools(mode, &allowed_tools, &disallowed_tools),
    }
}

/// Load config and validate inputs; `Err(code)` when the run must stop.
fn settings_or_exit(inputs: &RunInputs) -> Result<RunSettings, i32> {
    let config = match load_config(inputs.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: invalid config: {err:#}");
            return Err(exit_codes::INVALID);
        }
    };
    build_settings(inputs, config).map_err(|err| {
        eprintln!("Error: {err}");
        exit_codes::INVALID
    })
}

fn cmd_run(inputs: &RunInputs) -> Result<i32> {
    let settings = match settings_or_exit(inputs) {
        Ok(settings) => settings,
        Err(code) => return Ok(code),
    };
    let config = &settings.config;
    let endpoints = &settings.endpoints;
    let http_timeout = Duration::from_secs(config.hosting.timeout_secs);

    let exchange = OidcTokenExchange::new(
        endpoints.oidc_request_url.clone(),
        endpoints.oidc_request_token.clone(),
        endpoints.backend_url.clone(),
        endpoints.api_url.clone(),
        http_timeout,
    )?;
    let hosting = GithubClient::new(
        endpoints.api_url.clone(),
        settings.metadata.repository.clone(),
        http_timeout,
    )?;
    let workspace = Git::new(settings.workdir.clone()).with_host_url(endpoints.server_url.clone());
    let executor = ClaudeExecutor::new(config.agent.command.clone());
    let callback = HttpCallbackSender::new(Duration::from_secs(config.callback.timeout_secs))?;

    let report = run_pipeline(
        &settings,
        &Collaborators {
            exchange: &exchange,
            hosting: &hosting,
            workspace: &workspace,
            executor: &executor,
            callback: &callback,
        },
    );

    let outputs = ActionOutputs::new(
        &report.outcome,
        report.branch_name(),
        report.token_source,
        &report.execution_file.display().to_string(),
    );
    if let Err(err) = write_outputs(settings.github_output.as_deref(), &outputs) {
        warn!(err = %format!("{err:#}"), "failed to write step outputs");
    }
    if let Some(failure) = &report.outcome.failure {
        eprintln!("Error: {}", failure.message);
    }
    Ok(report.exit_code())
}

fn cmd_validate(inputs: &RunInputs) -> Result<i32> {
    let settings = match settings_or_exit(inputs) {
        Ok(settings) => settings,
        Err(code) => return Ok(code),
    };
    info!(
        mode = %settings.request.mode,
        repository = %settings.metadata.repository,
        callback = settings.request.callback.is_some(),
        "all input validations passed"
    );
    println!("inputs valid for {}", settings.request.mode);
    Ok(exit_codes::OK)
}

fn cmd_extract(path: &std::path::Path, mode: Mode, exit_code: i32) -> Result<i32> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let artifact = ExecutionArtifact {
        path: Some(path.to_path_buf()),
        ..ExecutionArtifact::completed(raw, exit_code)
    };
    let outcome = extract(&artifact, mode);
    println!(
        "{}",
        serde_json::to_string_pretty(&outcome).context("serialize outcome")?
    );
    Ok(match outcome.conclusion {
        Conclusion::Failure => exit_codes::FAILURE,
        Conclusion::Success | Conclusion::NoChanges => exit_codes::OK,
    })
}

fn cmd_tools(mode: Mode, allowed: &str, disallowed: &str) -> Result<i32> {
    let policy = ToolPolicy::assemble(
        mode,
        &parse_tool_list(allowed),
        &parse_tool_list(disallowed),
    );
    println!(
        "{}",
        serde_json::to_string_pretty(&policy).context("serialize tool policy")?
    );
    Ok(exit_codes::OK)
}
