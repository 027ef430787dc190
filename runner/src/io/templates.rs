//! Prompt template loading and rendering.
//!
//! Templates live in a directory as `system-prompt-<mode>.md` and `<mode>.md`.
//! Files missing from the directory (or no directory at all) fall back to the
//! defaults compiled into the binary.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::core::template::{TemplateVars, render, unresolved};
use crate::core::types::{Mode, RenderedPrompt};

const SYSTEM_PR_GEN: &str = include_str!("prompts/system-prompt-pr-gen.md");
const SYSTEM_PR_UPDATE: &str = include_str!("prompts/system-prompt-pr-update.md");
const SYSTEM_PLAN_GEN: &str = include_str!("prompts/system-prompt-plan-gen.md");
const USER_PR_GEN: &str = include_str!("prompts/pr-gen.md");
const USER_PR_UPDATE: &str = include_str!("prompts/pr-update.md");
const USER_PLAN_GEN: &str = include_str!("prompts/plan-gen.md");

/// Unrendered system and user templates for one mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplates {
    pub system: String,
    pub user: String,
}

impl PromptTemplates {
    pub fn builtin(mode: Mode) -> Self {
        let (system, user) = match mode {
            Mode::Generate => (SYSTEM_PR_GEN, USER_PR_GEN),
            Mode::Update => (SYSTEM_PR_UPDATE, USER_PR_UPDATE),
            Mode::Plan => (SYSTEM_PLAN_GEN, USER_PLAN_GEN),
        };
        Self {
            system: system.to_string(),
            user: user.to_string(),
        }
    }

    pub fn render(&self, vars: &TemplateVars) -> RenderedPrompt {
        for name in unresolved(&self.system, vars)
            .into_iter()
            .chain(unresolved(&self.user, vars))
        {
            warn!(placeholder = %name, "template placeholder has no value, left as is");
        }
        RenderedPrompt {
            system_prompt: render(&self.system, vars),
            user_prompt: render(&self.user, vars),
        }
    }
}

pub fn system_file_name(mode: Mode) -> String {
    format!("system-prompt-{}.md", mode.as_str())
}

pub fn user_file_name(mode: Mode) -> String {
    format!("{}.md", mode.as_str())
}

/// Load templates for `mode`, preferring files in `dir`.
#[instrument(skip_all, fields(mode = %mode))]
pub fn load_templates(dir: Option<&Path>, mode: Mode) -> Result<PromptTemplates> {
    let builtin = PromptTemplates::builtin(mode);
    let Some(dir) = dir else {
        debug!("using built-in templates");
        return Ok(builtin);
    };
    Ok(PromptTemplates {
        system: read_or(dir, &system_file_name(mode), builtin.system)?,
        user: read_or(dir, &user_file_name(mode), builtin.user)?,
    })
}

fn read_or(dir: &Path, name: &str, fallback: String) -> Result<String> {
    let path = dir.join(name);
    match fs::read_to_string(&path) {
        Ok(text) => {
            debug!(path = %path.display(), "loaded template");
            Ok(text)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "template not found, using built-in");
            Ok(fallback)
        }
        Err(e) => Err(e).with_context(|| format!("read template {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::extract::{PLAN_END_MARKER, PLAN_START_MARKER};
    use crate::core::prompt_vars::plan_vars;

    #[test]
    fn builtin_plan_template_names_markers() {
        let templates = PromptTemplates::builtin(Mode::Plan);
        assert!(templates.system.contains(PLAN_START_MARKER));
        assert!(templates.system.contains(PLAN_END_MARKER));
    }

    #[test]
    fn builtin_templates_resolve_with_mode_vars() {
        let vars = plan_vars("o/r", "", "plan X");
        let templates = PromptTemplates::builtin(Mode::Plan);
        assert!(unresolved(&templates.system, &vars).is_empty());
        assert!(unresolved(&templates.user, &vars).is_empty());
        let rendered = templates.render(&vars);
        assert!(rendered.user_prompt.contains("plan X"));
    }

    #[test]
    fn directory_overrides_per_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("pr-update.md"), "PR {{ pr_number }}").expect("write");
        let templates = load_templates(Some(temp.path()), Mode::Update).expect("load");
        assert_eq!(templates.user, "PR {{ pr_number }}");
        assert_eq!(templates.system, PromptTemplates::builtin(Mode::Update).system);
    }

    #[test]
    fn file_names_use_wire_mode() {
        assert_eq!(system_file_name(Mode::Generate), "system-prompt-pr-gen.md");
        assert_eq!(user_file_name(Mode::Plan), "plan-gen.md");
    }
}
