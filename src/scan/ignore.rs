//! Glob-style ignore pattern matching against scan-relative paths.

/// A compiled set of glob patterns matched against forward-slash relative
/// paths. Patterns that fail to compile are dropped with a logged warning
/// rather than failing the whole scan — a typo in one pattern should not
/// take distribution down.
pub struct IgnoreSet {
    patterns: Vec<glob::Pattern>,
}

impl IgnoreSet {
    pub fn new(patterns: &[String]) -> Self {
        let compiled = patterns
            .iter()
            .filter_map(|p| match glob::Pattern::new(p) {
                Ok(pat) => Some(pat),
                Err(e) => {
                    tracing::warn!(pattern = %p, error = %e, "ignoring malformed ignore pattern");
                    None
                }
            })
            .collect();
        Self { patterns: compiled }
    }

    pub fn is_ignored(&self, rel_path: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(rel_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_simple_glob() {
        let set = IgnoreSet::new(&["*.tmp".to_string()]);
        assert!(set.is_ignored("scratch.tmp"));
        assert!(!set.is_ignored("scratch.txt"));
    }

    #[test]
    fn matches_nested_glob() {
        let set = IgnoreSet::new(&["cache/**".to_string()]);
        assert!(set.is_ignored("cache/a/b.bin"));
        assert!(!set.is_ignored("mods/a/b.bin"));
    }

    #[test]
    fn malformed_pattern_is_skipped_not_fatal() {
        let set = IgnoreSet::new(&["[".to_string(), "*.log".to_string()]);
        assert!(set.is_ignored("x.log"));
    }

    #[test]
    fn empty_set_ignores_nothing() {
        let set = IgnoreSet::new(&[]);
        assert!(!set.is_ignored("anything"));
    }
}
