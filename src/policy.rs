use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{CoreError, Result};
use crate::session::ToolKind;

/// Decides whether a tool's latest output means it is waiting on the user.
///
/// The core only asks the question; what a prompt looks like is up to the
/// policy registered for each tool kind.
pub trait InputMarkerPolicy: Send + Sync {
    fn matches(&self, output: &str) -> bool;
}

impl<F> InputMarkerPolicy for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn matches(&self, output: &str) -> bool {
        self(output)
    }
}

/// Policy that never reports a prompt.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverMatches;

impl InputMarkerPolicy for NeverMatches {
    fn matches(&self, _output: &str) -> bool {
        false
    }
}

/// Generic interactive prompts: confirmations, bare `>` prompts, "Press Enter".
static RE_PROMPT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?mi)(^\s*>\s*$|Type a message|Press Enter|waiting for input|\? $|\[y/n\]|\(y/N\)|\(Y/n\))")
        .unwrap()
});

/// Regex-backed marker policy.
#[derive(Debug, Clone)]
pub struct RegexMarker {
    pattern: Regex,
}

impl RegexMarker {
    pub fn new(pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| CoreError::InvalidConfig(format!("bad marker pattern `{pattern}`: {e}")))?;
        Ok(Self { pattern })
    }

    /// Marker for the prompt shapes most interactive CLIs share.
    pub fn prompt() -> Self {
        Self {
            pattern: RE_PROMPT.clone(),
        }
    }
}

impl InputMarkerPolicy for RegexMarker {
    fn matches(&self, output: &str) -> bool {
        self.pattern.is_match(output)
    }
}

/// Marker policy per tool kind, with a fallback for kinds not listed.
#[derive(Clone)]
pub struct MarkerPolicies {
    fallback: Arc<dyn InputMarkerPolicy>,
    by_kind: HashMap<ToolKind, Arc<dyn InputMarkerPolicy>>,
}

impl MarkerPolicies {
    pub fn new(fallback: impl InputMarkerPolicy + 'static) -> Self {
        Self {
            fallback: Arc::new(fallback),
            by_kind: HashMap::new(),
        }
    }

    /// Compile `kind -> regex` pairs on top of the generic prompt marker.
    pub fn from_patterns<'a>(patterns: impl IntoIterator<Item = (&'a str, &'a str)>) -> Result<Self> {
        let mut policies = Self::default();
        for (kind, pattern) in patterns {
            policies.set(ToolKind::from_name(kind), RegexMarker::new(pattern)?);
        }
        Ok(policies)
    }

    pub fn set(&mut self, kind: ToolKind, policy: impl InputMarkerPolicy + 'static) {
        self.by_kind.insert(kind, Arc::new(policy));
    }

    pub fn with(mut self, kind: ToolKind, policy: impl InputMarkerPolicy + 'static) -> Self {
        self.set(kind, policy);
        self
    }

    pub fn for_kind(&self, kind: &ToolKind) -> Arc<dyn InputMarkerPolicy> {
        self.by_kind
            .get(kind)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }
}

impl Default for MarkerPolicies {
    fn default() -> Self {
        Self::new(RegexMarker::prompt())
    }
}

impl std::fmt::Debug for MarkerPolicies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkerPolicies")
            .field("kinds", &self.by_kind.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_detects_confirmations() {
        let marker = RegexMarker::prompt();
        assert!(marker.matches("Some output\n\n> "));
        assert!(marker.matches("Do you want to continue? [y/n]"));
        assert!(marker.matches("Apply changes (Y/n)"));
        assert!(marker.matches("Overwrite file? "));
    }

    #[test]
    fn test_prompt_ignores_plain_output() {
        let marker = RegexMarker::prompt();
        assert!(!marker.matches("Compiling agent-mux v0.1.0"));
        assert!(!marker.matches("Working on the task...\nThinking..."));
    }

    #[test]
    fn test_per_kind_policy_overrides_fallback() {
        let policies = MarkerPolicies::new(NeverMatches)
            .with(ToolKind::Codex, |out: &str| out.ends_with("codex> "));

        assert!(policies.for_kind(&ToolKind::Codex).matches("codex> "));
        assert!(!policies.for_kind(&ToolKind::Claude).matches("codex> "));
    }

    #[test]
    fn test_from_patterns() {
        let policies = MarkerPolicies::from_patterns([("gemini", r"^gemini>\s*$")]).unwrap();
        assert!(policies.for_kind(&ToolKind::Gemini).matches("gemini> "));
        // unlisted kinds fall back to the generic prompt marker
        assert!(policies.for_kind(&ToolKind::Claude).matches("Proceed? [y/n]"));
    }

    #[test]
    fn test_bad_pattern_is_invalid_config() {
        let err = RegexMarker::new("(unclosed").unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig(_)));
    }
}
