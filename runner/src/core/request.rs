//! Immutable per-run input.

use std::fmt;

use crate::core::types::Mode;

/// Validated input for one pipeline execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub mode: Mode,
    pub prompt: Option<String>,
    /// PR number; only set for [`Mode::Update`].
    pub target_pr: Option<u64>,
    pub base_branch: String,
    pub custom_instructions: Option<String>,
    pub callback: Option<CallbackTarget>,
}

impl RunRequest {
    pub fn prompt_text(&self) -> &str {
        self.prompt.as_deref().unwrap_or("")
    }

    pub fn custom_instructions_text(&self) -> &str {
        self.custom_instructions.as_deref().unwrap_or("")
    }
}

/// Webhook that receives the completion notification.
#[derive(Clone, PartialEq, Eq)]
pub struct CallbackTarget {
    pub url: String,
    pub auth_token: Option<String>,
    /// Header carrying `Bearer <auth_token>`.
    pub auth_header: String,
}

impl fmt::Debug for CallbackTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackTarget")
            .field("url", &self.url)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("auth_header", &self.auth_header)
            .finish()
    }
}
