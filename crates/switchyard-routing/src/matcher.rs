//! Request path matchers
//!
//! `prefix` accepts a request whose path starts with the route path.
//! `glob` matches the whole request path against the route path, where `*`
//! matches within one segment, `**` matches across segments and `?` matches
//! one character.

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Matcher selected for all routes of a table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatcherKind {
    #[default]
    Prefix,
    Glob,
}

#[derive(Debug, Clone)]
pub enum PathMatcher {
    Prefix(String),
    Glob(Regex),
}

impl PathMatcher {
    pub fn new(kind: MatcherKind, path: &str) -> Result<Self, regex::Error> {
        match kind {
            MatcherKind::Prefix => Ok(PathMatcher::Prefix(path.to_string())),
            MatcherKind::Glob => Ok(PathMatcher::Glob(Regex::new(&glob_to_regex(path))?)),
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathMatcher::Prefix(prefix) => path.starts_with(prefix.as_str()),
            PathMatcher::Glob(re) => re.is_match(path),
        }
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() * 2 + 2);
    out.push('^');
    let mut chars = glob.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                out.push_str(".*");
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            other => {
                let mut buf = [0u8; 4];
                out.push_str(&regex::escape(other.encode_utf8(&mut buf)));
            }
        }
    }
    out.push('$');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_matcher() {
        let m = PathMatcher::new(MatcherKind::Prefix, "/api/").unwrap();
        assert!(m.matches("/api/"));
        assert!(m.matches("/api/v1/users"));
        assert!(!m.matches("/api"));
        assert!(!m.matches("/other"));
    }

    #[test]
    fn test_glob_single_segment() {
        let m = PathMatcher::new(MatcherKind::Glob, "/users/*/profile").unwrap();
        assert!(m.matches("/users/42/profile"));
        assert!(!m.matches("/users/42/x/profile"));
        assert!(!m.matches("/users/42/profile/extra"));
    }

    #[test]
    fn test_glob_double_star_and_question_mark() {
        let m = PathMatcher::new(MatcherKind::Glob, "/static/**").unwrap();
        assert!(m.matches("/static/css/site.css"));
        assert!(m.matches("/static/"));
        assert!(!m.matches("/stat"));

        let m = PathMatcher::new(MatcherKind::Glob, "/v?/items").unwrap();
        assert!(m.matches("/v1/items"));
        assert!(!m.matches("/v12/items"));
    }

    #[test]
    fn test_glob_escapes_regex_characters() {
        let m = PathMatcher::new(MatcherKind::Glob, "/a.b/(c)").unwrap();
        assert!(m.matches("/a.b/(c)"));
        assert!(!m.matches("/aXb/(c)"));
    }

    #[test]
    fn test_matcher_kind_serde() {
        let kind: MatcherKind = serde_json::from_str("\"glob\"").unwrap();
        assert_eq!(kind, MatcherKind::Glob);
        assert_eq!(serde_json::to_string(&MatcherKind::Prefix).unwrap(), "\"prefix\"");
    }
}
