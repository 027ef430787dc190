//! Orchestration pipeline that drives a coding agent from a CI runner.
//!
//! One run takes a mode (generate a PR, update a PR, or write a plan), obtains
//! a repository credential, prepares the branch, renders prompts, runs the
//! agent, extracts what it produced, notifies a webhook and revokes the
//! credential. The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (templating, tool policy, output
//!   extraction). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting adapters (processes, git, HTTP, files), each
//!   behind a trait so tests can script them.
//!
//! [`validate`], [`branch`] and [`pipeline`] coordinate the two.

pub mod branch;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod inputs;
pub mod io;
pub mod logging;
pub mod pipeline;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod validate;
