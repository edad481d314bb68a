//! Per-job keyword scanning applied to each emitted output line.

use crate::catalog::{KeywordKind, KeywordRule};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordHit {
    pub kind: KeywordKind,
    pub message: String,
    pub line: String,
    /// Only set for `kind = failure` rules configured with `abort_on_hit`.
    pub abort_on_hit: bool,
}

/// Tests each rule against one line, in declaration order, first-match-wins.
pub fn scan_line(rules: &[KeywordRule], line: &str) -> Option<KeywordHit> {
    for rule in rules {
        let matched = rule.patterns.iter().any(|pattern| {
            if rule.case_sensitive {
                line.contains(pattern.as_str())
            } else {
                line.to_lowercase().contains(&pattern.to_lowercase())
            }
        });
        if matched {
            return Some(KeywordHit {
                kind: rule.kind,
                message: rule.message.clone(),
                line: line.to_string(),
                abort_on_hit: rule.kind == KeywordKind::Failure && rule.abort_on_hit,
            });
        }
    }
    None
}
