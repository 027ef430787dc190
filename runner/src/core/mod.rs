//! Deterministic, pure logic shared by the pipeline.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod artifact;
pub mod extract;
pub mod prompt_vars;
pub mod request;
pub mod slug;
pub mod template;
pub mod tools;
pub mod types;
