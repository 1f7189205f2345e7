// SPDX-License-Identifier: MIT
use regex::Regex;

/// Per-tool approval decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalPolicy {
    /// Always run without asking.
    Auto,
    /// Ask the operator before each invocation.
    Ask,
    /// Never run; return an error.
    Deny,
}

/// Policy engine mapping a tool call's command-like string to an approval
/// decision, driven by config-supplied glob patterns.
#[derive(Debug, Default)]
pub struct ToolPolicy {
    auto_patterns: Vec<Regex>,
    deny_patterns: Vec<Regex>,
}

impl ToolPolicy {
    pub fn new(auto_patterns: &[String], deny_patterns: &[String]) -> Self {
        let compile = |patterns: &[String]| -> Vec<Regex> {
            patterns.iter().filter_map(|p| glob_to_regex(p)).collect()
        };
        Self {
            auto_patterns: compile(auto_patterns),
            deny_patterns: compile(deny_patterns),
        }
    }

    /// Deny patterns take precedence over auto patterns; anything matching
    /// neither falls back to `Ask`.
    pub fn decide(&self, command: &str) -> ApprovalPolicy {
        if self.deny_patterns.iter().any(|re| re.is_match(command)) {
            return ApprovalPolicy::Deny;
        }
        if self.auto_patterns.iter().any(|re| re.is_match(command)) {
            return ApprovalPolicy::Auto;
        }
        ApprovalPolicy::Ask
    }
}

/// Converts a simple shell glob (`*` / `?`) into an anchored [`Regex`].
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c if "\\.+()|[]{}^$".contains(c) => {
                re.push('\\');
                re.push(c);
            }
            c => re.push(c),
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}
