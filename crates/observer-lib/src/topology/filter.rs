//! Application include/exclude filtering

use serde::{Deserialize, Serialize};

fn is_wildcard(name: &str) -> bool {
    name == "*" || name.eq_ignore_ascii_case("all")
}

/// Which applications are monitored.
///
/// An empty include list, `*` or `all` selects every application. An explicit
/// exclusion always wins; an exclude wildcard drops everything not explicitly
/// included.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppFilter {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl AppFilter {
    pub fn new(include: Vec<String>, exclude: Vec<String>) -> Self {
        let clean = |v: Vec<String>| {
            v.into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        };
        Self {
            include: clean(include),
            exclude: clean(exclude),
        }
    }

    /// Every application
    pub fn all() -> Self {
        Self::default()
    }

    pub fn includes_all(&self) -> bool {
        self.include.is_empty() || self.include.iter().any(|n| is_wildcard(n))
    }

    pub fn matches(&self, application_name: &str) -> bool {
        if self.exclude.iter().any(|n| n == application_name) {
            return false;
        }
        if self.include.iter().any(|n| n == application_name) {
            return true;
        }
        if self.exclude.iter().any(|n| is_wildcard(n)) {
            return false;
        }
        self.includes_all()
    }

    /// Name to push down to the directory query when exactly one
    /// application is wanted
    pub fn directory_filter(&self) -> Option<&str> {
        match self.include.as_slice() {
            [only] if !is_wildcard(only) => Some(only.as_str()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_wildcards_select_everything() {
        assert!(AppFilter::all().matches("fabric:/A"));
        assert!(AppFilter::new(names(&["*"]), vec![]).matches("fabric:/A"));
        assert!(AppFilter::new(names(&["All"]), vec![]).matches("fabric:/A"));
    }

    #[test]
    fn test_exclusions() {
        let filter = AppFilter::new(names(&["all"]), names(&["fabric:/Noisy"]));
        assert!(filter.matches("fabric:/A"));
        assert!(!filter.matches("fabric:/Noisy"));

        let only = AppFilter::new(names(&["fabric:/A"]), names(&["*"]));
        assert!(only.matches("fabric:/A"));
        assert!(!only.matches("fabric:/B"));
    }

    #[test]
    fn test_explicit_include_list() {
        let filter = AppFilter::new(names(&["fabric:/A", "fabric:/B"]), vec![]);
        assert!(filter.matches("fabric:/B"));
        assert!(!filter.matches("fabric:/C"));
        assert_eq!(filter.directory_filter(), None);
    }

    #[test]
    fn test_single_include_is_pushed_down() {
        let filter = AppFilter::new(names(&[" fabric:/A "]), vec![]);
        assert_eq!(filter.directory_filter(), Some("fabric:/A"));
        assert_eq!(AppFilter::new(names(&["*"]), vec![]).directory_filter(), None);
    }
}
