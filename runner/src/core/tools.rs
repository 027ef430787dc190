//! Tool allow/deny policy handed to the agent.

use serde::Serialize;

use crate::core::types::Mode;

/// Tools every run may use.
pub const BASE_TOOLS: &[&str] = &[
    "Edit",
    "MultiEdit",
    "Read",
    "Write",
    "Glob",
    "Grep",
    "LS",
    "Bash(git:*)",
    "Bash(rg:*)",
    "Bash(gh pr:*)",
    "Bash(cat:*)",
    "Bash(rm:*)",
    "Task",
    "TodoWrite",
    "TodoRead",
];

/// Tools denied unless the caller removes the denial upstream.
pub const DEFAULT_DISALLOWED_TOOLS: &[&str] = &["WebFetch", "WebSearch"];

/// Plan runs never push or touch pull requests.
const PLAN_DISALLOWED_TOOLS: &[&str] = &["Bash(gh pr:*)", "Bash(git push:*)"];

/// Merged policy for one run. Disjoint by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolPolicy {
    pub allowed: Vec<String>,
    pub disallowed: Vec<String>,
}

impl ToolPolicy {
    /// Layer caller additions/removals over the base policy.
    ///
    /// Lists are de-duplicated keeping first-seen order. A tool present in both
    /// lists is denied.
    pub fn assemble(mode: Mode, extra_allowed: &[String], extra_disallowed: &[String]) -> Self {
        let mut disallowed = Vec::new();
        let mode_denied: &[&str] = if mode == Mode::Plan {
            PLAN_DISALLOWED_TOOLS
        } else {
            &[]
        };
        let denied_sources = DEFAULT_DISALLOWED_TOOLS
            .iter()
            .chain(mode_denied)
            .map(|s| s.to_string())
            .chain(extra_disallowed.iter().cloned());
        for tool in denied_sources {
            push_unique(&mut disallowed, tool);
        }

        let mut allowed = Vec::new();
        let allowed_sources = BASE_TOOLS
            .iter()
            .map(|s| s.to_string())
            .chain(extra_allowed.iter().cloned());
        for tool in allowed_sources {
            if !disallowed.contains(&tool) {
                push_unique(&mut allowed, tool);
            }
        }

        Self {
            allowed,
            disallowed,
        }
    }

    pub fn allowed_csv(&self) -> String {
        self.allowed.join(",")
    }

    pub fn disallowed_csv(&self) -> String {
        self.disallowed.join(",")
    }
}

/// Split a comma-separated tool list, dropping blanks.
///
/// Commas inside parentheses belong to the tool pattern (`Bash(a,b)`).
pub fn parse_tool_list(raw: &str) -> Vec<String> {
    let mut tools = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for ch in raw.chars() {
        match ch {
            '(' => {
                depth += 1;
                current.push(ch);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            }
            ',' | '\n' if depth == 0 => {
                push_trimmed(&mut tools, &current);
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    push_trimmed(&mut tools, &current);
    tools
}

fn push_trimmed(tools: &mut Vec<String>, raw: &str) {
    let tool = raw.trim();
    if !tool.is_empty() {
        tools.push(tool.to_string());
    }
}

fn push_unique(list: &mut Vec<String>, tool: String) {
    if !list.contains(&tool) {
        list.push(tool);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn base_policy_without_overrides() {
        let policy = ToolPolicy::assemble(Mode::Generate, &[], &[]);
        assert_eq!(policy.allowed.len(), BASE_TOOLS.len());
        assert_eq!(policy.disallowed, strings(&["WebFetch", "WebSearch"]));
    }

    #[test]
    fn additions_are_appended_once() {
        let policy = ToolPolicy::assemble(
            Mode::Update,
            &strings(&["Bash(npm test:*)", "Read", "Bash(npm test:*)"]),
            &[],
        );
        assert_eq!(policy.allowed.last().map(String::as_str), Some("Bash(npm test:*)"));
        assert_eq!(
            policy.allowed.iter().filter(|t| t.as_str() == "Read").count(),
            1
        );
    }

    #[test]
    fn deny_wins_over_allow() {
        let policy = ToolPolicy::assemble(
            Mode::Generate,
            &strings(&["WebFetch"]),
            &strings(&["Bash(rm:*)"]),
        );
        assert!(!policy.allowed.contains(&"WebFetch".to_string()));
        assert!(!policy.allowed.contains(&"Bash(rm:*)".to_string()));
        assert!(policy.disallowed.contains(&"Bash(rm:*)".to_string()));
    }

    #[test]
    fn plan_mode_denies_push_and_pr_tools() {
        let policy = ToolPolicy::assemble(Mode::Plan, &[], &[]);
        assert!(!policy.allowed.contains(&"Bash(gh pr:*)".to_string()));
        assert!(policy.disallowed.contains(&"Bash(git push:*)".to_string()));
    }

    #[test]
    fn parse_tool_list_respects_parentheses() {
        assert_eq!(
            parse_tool_list(" Bash(npm run a,b), Read ,, \nWrite"),
            strings(&["Bash(npm run a,b)", "Read", "Write"])
        );
        assert!(parse_tool_list("  ").is_empty());
    }
}
