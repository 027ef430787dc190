//! Placeholder substitution for prompt templates.
//!
//! Templates use `{{ name }}` placeholders. Known names are replaced with their
//! value; unknown names are left exactly as written so a template/variable
//! mismatch never fails a run.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};

/// Variable name → value mapping for one render.
pub type TemplateVars = BTreeMap<String, String>;

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("placeholder regex is valid")
});

/// Substitute every placeholder found in `vars`, in a single pass.
///
/// Substituted values are not scanned again, so a value containing `{{ x }}`
/// is emitted literally.
pub fn render(template: &str, vars: &TemplateVars) -> String {
    PLACEHOLDER_RE
        .replace_all(template, |caps: &Captures<'_>| match vars.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Names of the placeholders in `template` that `vars` does not cover.
pub fn unresolved(template: &str, vars: &TemplateVars) -> Vec<String> {
    let mut names: Vec<String> = PLACEHOLDER_RE
        .captures_iter(template)
        .map(|caps| caps[1].to_string())
        .filter(|name| !vars.contains_key(name))
        .collect();
    names.sort();
    names.dedup();
    names
}
