use wildmatch::WildMatch;

#[derive(Debug, Clone)]
enum PathPattern {
    Prefix(String),
    Glob(WildMatch),
}

/// Paths the interceptor must leave alone (e.g. the admin API)
#[derive(Debug, Clone, Default)]
pub struct BypassMatcher {
    patterns: Vec<PathPattern>,
}

impl BypassMatcher {
    /// Create a new BypassMatcher
    ///
    /// Patterns containing `*` or `?` match the whole path as a glob, any
    /// other pattern is a literal prefix. A prefix ending in `/` also covers
    /// the bare path, so `/admin/` bypasses `/admin` but not `/administrator`.
    pub fn new(patterns: &[String]) -> Self {
        let patterns = patterns
            .iter()
            .filter(|p| !p.is_empty())
            .map(|p| {
                if p.contains('*') || p.contains('?') {
                    PathPattern::Glob(WildMatch::new(p))
                } else {
                    PathPattern::Prefix(p.clone())
                }
            })
            .collect();

        Self { patterns }
    }

    pub fn is_bypassed(&self, path: &str) -> bool {
        self.patterns.iter().any(|pattern| match pattern {
            PathPattern::Prefix(prefix) => {
                path.starts_with(prefix.as_str()) || prefix.strip_suffix('/') == Some(path)
            }
            PathPattern::Glob(glob) => glob.matches(path),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bypass_matching() {
        // Test 1: No patterns = intercept everything
        let matcher = BypassMatcher::new(&[]);
        assert!(!matcher.is_bypassed("/admin/"));

        // Test 2: Prefix
        let matcher = BypassMatcher::new(&["/admin/".to_string()]);
        assert!(matcher.is_bypassed("/admin/"));
        assert!(matcher.is_bypassed("/admin/rules/3"));
        assert!(matcher.is_bypassed("/admin"));
        assert!(!matcher.is_bypassed("/administrator"));
        assert!(!matcher.is_bypassed("/v1/admin/"));

        // Test 3: Glob over the whole path
        let matcher = BypassMatcher::new(&["/static/*.css".to_string()]);
        assert!(matcher.is_bypassed("/static/site.css"));
        assert!(!matcher.is_bypassed("/static/site.js"));

        // Test 4: Empty patterns are ignored rather than matching everything
        let matcher = BypassMatcher::new(&["".to_string()]);
        assert!(!matcher.is_bypassed("/anything"));
    }
}
