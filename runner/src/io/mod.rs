//! Side-effecting adapters: processes, git, HTTP and files.

pub mod callback;
pub mod config;
pub mod executor;
pub mod git;
pub mod hosting;
pub mod outputs;
pub mod process;
pub mod templates;
pub mod token;
