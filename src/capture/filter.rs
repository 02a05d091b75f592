//! URL pattern + predicate filter

use regex::Regex;

use crate::predicate::Predicate;

use super::InterceptionConfig;

/// Per-request acceptance test, cheapest check first
#[derive(Debug, Clone)]
pub struct RequestFilter {
    pattern: Option<Regex>,
    predicate: Predicate,
}

impl RequestFilter {
    /// Build a filter from a pattern and a compiled predicate
    #[must_use]
    pub fn new(pattern: Option<Regex>, predicate: Predicate) -> Self {
        Self { pattern, predicate }
    }

    /// Build the filter described by an interception config
    ///
    /// A blank filter script accepts everything.
    #[must_use]
    pub fn from_config(config: &InterceptionConfig) -> Self {
        let predicate = config
            .filter_script
            .as_deref()
            .filter(|script| !script.trim().is_empty())
            .map_or(Predicate::Always, Predicate::compile);

        Self::new(config.url_pattern.clone(), predicate)
    }

    /// Whether `url` passes the pattern and then the predicate
    pub fn accepts(&self, url: &str) -> bool {
        if let Some(pattern) = &self.pattern {
            if !pattern.is_match(url) {
                return false;
            }
        }

        self.predicate.matches(url)
    }

    /// The compiled predicate
    pub fn predicate(&self) -> &Predicate {
        &self.predicate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_only() {
        let config = InterceptionConfig::default()
            .with_pattern_str(r"/ajax/read/.*[?&]vrf=([^&]+)")
            .unwrap();
        let filter = RequestFilter::from_config(&config);

        assert!(filter.accepts("https://x/ajax/read/12?vrf=AbC123&x=1"));
        assert!(!filter.accepts("https://x/ajax/read/12?page=2"));
        assert!(filter.predicate().is_permissive());
    }

    #[test]
    fn test_pattern_then_predicate() {
        let config = InterceptionConfig::default()
            .with_pattern_str("ajax")
            .unwrap()
            .with_filter_script("return url.includes('vrf=');");
        let filter = RequestFilter::from_config(&config);

        assert!(filter.accepts("https://x/ajax?vrf=1"));
        assert!(!filter.accepts("https://x/ajax?page=1"));
        assert!(!filter.accepts("https://x/other?vrf=1"));
    }

    #[test]
    fn test_blank_script_accepts_all() {
        let config = InterceptionConfig::default().with_filter_script("  ");
        assert!(RequestFilter::from_config(&config).accepts("https://anything"));
    }
}
