//! Glob-lite matching for policy origin/path allow-lists.

use serde::{Deserialize, Serialize};

/// An ordered set of patterns; a candidate matches if any pattern matches.
///
/// Matching is case-sensitive and does not canonicalize trailing slashes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatternSet(pub Vec<String>);

impl PatternSet {
    pub fn new(patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        PatternSet(patterns.into_iter().map(Into::into).collect())
    }

    /// The set containing only `*`.
    pub fn match_all() -> Self {
        PatternSet(vec!["*".to_string()])
    }

    pub fn matches(&self, candidate: &str) -> bool {
        self.0.iter().any(|p| pattern_matches(p, candidate))
    }
}

impl<S: Into<String>> FromIterator<S> for PatternSet {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        PatternSet::new(iter)
    }
}

impl From<Vec<String>> for PatternSet {
    fn from(patterns: Vec<String>) -> Self {
        PatternSet(patterns)
    }
}

impl From<Vec<&str>> for PatternSet {
    fn from(patterns: Vec<&str>) -> Self {
        PatternSet::new(patterns)
    }
}

/// `*` matches everything; a trailing `*` matches by prefix; anything else
/// requires an exact match.
pub fn pattern_matches(pattern: &str, candidate: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return candidate.starts_with(prefix);
    }
    pattern == candidate
}
