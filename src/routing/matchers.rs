use regex::Regex;

use super::{Matcher, RoutedPath};

// prefix without its trailing slashes, with a leading one. "/" becomes "".
fn clean_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{}", trimmed)
    }
}

// does `path` start with `prefix` on a segment boundary?
fn has_prefix(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Matches when the remaining path starts with a fixed prefix, on a segment
/// boundary, and moves the prefix to the consumed path.
///
/// `PrefixMatcher::new("/")` matches everything and consumes nothing.
#[derive(Debug, Clone)]
pub struct PrefixMatcher {
    prefix: String,
}

impl PrefixMatcher {
    pub fn new(prefix: &str) -> PrefixMatcher {
        PrefixMatcher {
            prefix: clean_prefix(prefix),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl Matcher for PrefixMatcher {
    fn matches(&self, path: &mut RoutedPath) -> bool {
        if !has_prefix(path.component_resource_path(), &self.prefix) {
            return false;
        }
        path.consume(self.prefix.len());
        true
    }
}

/// Matches the remaining path against a regular expression.
///
/// On a match the whole remaining path is consumed when
/// `match_as_component_path` is set. Otherwise a configured prefix is
/// stripped the way [`PrefixMatcher`] does, if the path has it.
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    regex: Regex,
    prefix: Option<String>,
    match_as_component_path: bool,
}

impl PatternMatcher {
    pub fn new(pattern: &str) -> Result<PatternMatcher, regex::Error> {
        Ok(PatternMatcher {
            regex: Regex::new(pattern)?,
            prefix: None,
            match_as_component_path: false,
        })
    }

    pub fn prefix(mut self, prefix: &str) -> Self {
        self.prefix = Some(clean_prefix(prefix));
        self
    }

    pub fn match_as_component_path(mut self, yes: bool) -> Self {
        self.match_as_component_path = yes;
        self
    }
}

impl Matcher for PatternMatcher {
    fn matches(&self, path: &mut RoutedPath) -> bool {
        if !self.regex.is_match(path.component_resource_path()) {
            return false;
        }
        if self.match_as_component_path {
            path.consume(path.component_resource_path().len());
        } else if let Some(ref prefix) = self.prefix {
            if has_prefix(path.component_resource_path(), prefix) {
                path.consume(prefix.len());
            }
        }
        true
    }
}

/// Serves a welcome file for directory requests: matches when nothing, or
/// only `/`, is left of the path, and rewrites the remaining path to the
/// welcome file.
#[derive(Debug, Clone)]
pub struct WelcomeFileMatcher {
    file: String,
}

impl WelcomeFileMatcher {
    pub fn new(file: &str) -> WelcomeFileMatcher {
        WelcomeFileMatcher {
            file: file.trim_start_matches('/').to_string(),
        }
    }
}

impl Matcher for WelcomeFileMatcher {
    fn matches(&self, path: &mut RoutedPath) -> bool {
        let rest = path.component_resource_path();
        if !(rest.is_empty() || rest == "/") {
            return false;
        }
        let rewritten = if path.component_path().ends_with('/') {
            self.file.clone()
        } else {
            format!("/{}", self.file)
        };
        debug!("welcome file: {}{}", path.component_path(), rewritten);
        path.set_component_resource_path(rewritten);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rp(path: &str) -> RoutedPath {
        RoutedPath::new(path).unwrap()
    }

    #[test]
    fn prefix_respects_segments() {
        let m = PrefixMatcher::new("/docs/");
        assert_eq!(m.prefix(), "/docs");

        let mut p = rp("/docs/a");
        assert!(m.matches(&mut p));
        assert_eq!((p.component_path(), p.component_resource_path()), ("/docs", "/a"));

        let mut p = rp("/docs");
        assert!(m.matches(&mut p));
        assert_eq!((p.component_path(), p.component_resource_path()), ("/docs", ""));

        let mut p = rp("/docsx/a");
        let before = p.clone();
        assert!(!m.matches(&mut p));
        assert_eq!(p, before);
    }

    #[test]
    fn root_prefix_matches_everything() {
        let m = PrefixMatcher::new("/");
        let mut p = rp("/x/y");
        assert!(m.matches(&mut p));
        assert_eq!((p.component_path(), p.component_resource_path()), ("", "/x/y"));
    }

    #[test]
    fn pattern_strips_prefix() {
        let m = PatternMatcher::new(r"^/api/v\d+/").unwrap().prefix("/api");
        let mut p = rp("/api/v2/users");
        assert!(m.matches(&mut p));
        assert_eq!((p.component_path(), p.component_resource_path()), ("/api", "/v2/users"));

        let mut p = rp("/api/latest/users");
        assert!(!m.matches(&mut p));
        assert_eq!(p.component_path(), "");
    }

    #[test]
    fn pattern_as_component_path() {
        let m = PatternMatcher::new(r"\.jsp$").unwrap().match_as_component_path(true);
        let mut p = rp("/shop/cart.jsp");
        assert!(m.matches(&mut p));
        assert_eq!(p.component_path(), "/shop/cart.jsp");
        assert_eq!(p.component_resource_path(), "");
        assert_eq!(p.request_path(), "/shop/cart.jsp");
    }

    #[test]
    fn pattern_without_prefix_leaves_cursor() {
        let m = PatternMatcher::new("^/static/").unwrap();
        let mut p = rp("/static/app.js");
        assert!(m.matches(&mut p));
        assert_eq!((p.component_path(), p.component_resource_path()), ("", "/static/app.js"));
    }

    #[test]
    fn invalid_pattern() {
        assert!(PatternMatcher::new("(").is_err());
    }

    #[test]
    fn welcome_file() {
        let m = WelcomeFileMatcher::new("/index.html");

        let mut p = rp("/");
        assert!(m.matches(&mut p));
        assert_eq!(p.request_path(), "/index.html");
        assert_eq!(p.original_path(), "/");

        let mut p = rp("/site/");
        PrefixMatcher::new("/site").matches(&mut p);
        assert!(m.matches(&mut p));
        assert_eq!((p.component_path(), p.component_resource_path()), ("/site", "/index.html"));

        let mut p = rp("/site/page.html");
        assert!(!m.matches(&mut p));
        assert_eq!(p.component_resource_path(), "/site/page.html");
    }
}
