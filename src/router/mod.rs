//! Prompt-prefix routing.
//!
//! A configured list of regex rules maps inbound content to a role (and
//! optionally a working-directory override). First match wins; patterns
//! are case-insensitive. No match falls back to the configured default.

pub mod debounce;

use regex::{Regex, RegexBuilder};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::config::RouteRule;

struct CompiledRule {
    pattern: Regex,
    role: String,
    cwd: Option<PathBuf>,
}

pub struct Router {
    rules: Vec<CompiledRule>,
    default_role: String,
}

impl Router {
    /// Compile the configured rules. Invalid patterns are skipped with a
    /// warning rather than failing startup.
    pub fn new(rules: &[RouteRule], default_role: &str) -> Self {
        let compiled = rules
            .iter()
            .filter_map(|rule| {
                match RegexBuilder::new(&rule.pattern).case_insensitive(true).build() {
                    Ok(pattern) => Some(CompiledRule {
                        pattern,
                        role: rule.role.clone(),
                        cwd: rule.cwd.clone(),
                    }),
                    Err(e) => {
                        warn!(pattern = %rule.pattern, err = %e, "skipping invalid routing rule");
                        None
                    }
                }
            })
            .collect();
        Self {
            rules: compiled,
            default_role: default_role.to_string(),
        }
    }

    /// The role for a piece of content: first matching rule, else default.
    pub fn resolve_role(&self, content: &str) -> &str {
        self.rules
            .iter()
            .find(|rule| rule.pattern.is_match(content))
            .map(|rule| rule.role.as_str())
            .unwrap_or(&self.default_role)
    }

    /// The matching rule's working-directory override, if any.
    pub fn resolve_routing_cwd(&self, content: &str) -> Option<&Path> {
        self.rules
            .iter()
            .find(|rule| rule.pattern.is_match(content))
            .and_then(|rule| rule.cwd.as_deref())
    }
}
