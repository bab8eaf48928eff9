//! Path rewrite rules.
//!
//! A rule pairs a pattern such as `/users/*/orders/*` with a replacement such
//! as `/user/$1/order/$2`. Each `*` captures the text between its neighbouring
//! literals and `$N` pastes the N-th capture back in. Rules are kept in the
//! order they were configured and the first rule that matches the whole path
//! wins.
//!
//! When a pattern can split a path several ways, every wildcard except the
//! last takes the shortest text that still lets the remaining literals line
//! up; the last wildcard takes the rest.

use std::{
    borrow::Cow,
    collections::HashSet,
};

use crate::error::{GatewayError, GatewayResult};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    /// Zero-based capture index.
    Capture(usize),
}

#[derive(Debug, Clone)]
pub struct Rule {
    pattern: String,
    segments: Vec<String>,
    replacement: Vec<Part>,
}

impl Rule {
    pub fn new(pattern: &str, replacement: &str) -> Self {
        let segments: Vec<String> = pattern.split('*').map(ToString::to_string).collect();
        let wildcards = segments.len() - 1;

        Self {
            pattern: pattern.to_string(),
            replacement: parse_replacement(replacement, wildcards),
            segments,
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn wildcards(&self) -> usize {
        self.segments.len() - 1
    }

    /// Returns the wildcard captures when the rule matches the whole path.
    pub fn captures<'a>(&self, path: &'a str) -> Option<Vec<&'a str>> {
        let (first, rest) = self.segments.split_first()?;
        let Some((last, middle)) = rest.split_last() else {
            return (path == first).then(Vec::new);
        };

        let body = path.strip_prefix(first.as_str())?;
        let mut remaining = body.strip_suffix(last.as_str())?;

        let mut captures = Vec::with_capacity(rest.len());
        for literal in middle {
            let at = remaining.find(literal.as_str())?;
            captures.push(&remaining[..at]);
            remaining = &remaining[at + literal.len()..];
        }
        captures.push(remaining);

        Some(captures)
    }

    pub fn apply(&self, path: &str) -> Option<String> {
        let captures = self.captures(path)?;

        let mut out = String::with_capacity(path.len());
        for part in &self.replacement {
            match part {
                Part::Literal(text) => out.push_str(text),
                Part::Capture(idx) => out.push_str(captures[*idx]),
            }
        }
        Some(out)
    }
}

/// `$` followed by digits names a capture (1-based). Anything that does not
/// resolve to an existing capture is kept as literal text.
fn parse_replacement(template: &str, wildcards: usize) -> Vec<Part> {
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut rest = template;

    while let Some(dollar) = rest.find('$') {
        literal.push_str(&rest[..dollar]);
        let after = &rest[dollar + 1..];
        let digits = after
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(after.len());

        let index = after[..digits]
            .parse::<usize>()
            .ok()
            .filter(|n| (1..=wildcards).contains(n));

        match index {
            Some(n) => {
                if !literal.is_empty() {
                    parts.push(Part::Literal(std::mem::take(&mut literal)));
                }
                parts.push(Part::Capture(n - 1));
            }
            None => {
                literal.push('$');
                literal.push_str(&after[..digits]);
            }
        }
        rest = &after[digits..];
    }

    literal.push_str(rest);
    if !literal.is_empty() {
        parts.push(Part::Literal(literal));
    }
    parts
}

#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    /// Compiles rules in iteration order. The input is a mapping, so a pattern
    /// listed twice is rejected.
    pub fn compile<I, P, R>(rules: I) -> GatewayResult<Self>
    where
        I: IntoIterator<Item = (P, R)>,
        P: AsRef<str>,
        R: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let mut compiled = Vec::new();

        for (pattern, replacement) in rules {
            let pattern = pattern.as_ref();
            if !seen.insert(pattern.to_string()) {
                return Err(GatewayError::Configuration(format!(
                    "duplicate rewrite pattern: {pattern}"
                )));
            }
            compiled.push(Rule::new(pattern, replacement.as_ref()));
        }

        Ok(Self { rules: compiled })
    }

    /// Rewrites `path` with the first matching rule. The flag is `false` and
    /// the path is returned untouched when nothing matches.
    pub fn rewrite<'a>(&self, path: &'a str) -> (Cow<'a, str>, bool) {
        self.rules
            .iter()
            .find_map(|rule| rule.apply(path))
            .map_or((Cow::Borrowed(path), false), |p| (Cow::Owned(p), true))
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(rules: &[(&str, &str)]) -> RuleSet {
        RuleSet::compile(rules.iter().copied()).unwrap()
    }

    #[test]
    fn rewrites_two_wildcards_into_placeholders() {
        let rules = set(&[("/users/*/orders/*", "/user/$1/order/$2")]);
        let (path, matched) = rules.rewrite("/users/123/orders/456");
        assert!(matched);
        assert_eq!(path, "/user/123/order/456");
    }

    #[test]
    fn unmatched_path_is_returned_unchanged() {
        let rules = set(&[("/users/*/orders/*", "/user/$1/order/$2")]);
        let (path, matched) = rules.rewrite("/not-matching-any-rule");
        assert!(!matched);
        assert_eq!(path, "/not-matching-any-rule");
        assert!(matches!(path, Cow::Borrowed(_)));
    }

    #[test]
    fn literal_pattern_matches_exact_path_only() {
        let rules = set(&[("/old", "/new")]);
        assert_eq!(rules.rewrite("/old"), (Cow::Borrowed("/new"), true));
        assert!(!rules.rewrite("/old/extra").1);
        assert!(!rules.rewrite("/ol").1);
        assert!(!rules.rewrite("/prefix/old").1);
    }

    #[test]
    fn earlier_rule_wins_over_later_overlapping_rule() {
        let rules = set(&[("/api/*", "/first/$1"), ("/api/v1/*", "/second/$1")]);
        assert_eq!(rules.rewrite("/api/v1/items").0, "/first/v1/items");

        let rules = set(&[("/api/v1/*", "/second/$1"), ("/api/*", "/first/$1")]);
        assert_eq!(rules.rewrite("/api/v1/items").0, "/second/items");
    }

    #[test]
    fn ambiguous_wildcards_take_leftmost_shortest_capture() {
        let rule = Rule::new("/*/*", "$1|$2");
        assert_eq!(rule.captures("/a/b/c"), Some(vec!["a", "b/c"]));
        assert_eq!(rule.apply("/a/b/c").as_deref(), Some("a|b/c"));

        let rule = Rule::new("/*-*-*", "$1,$2,$3");
        assert_eq!(rule.apply("/x-y-z-w").as_deref(), Some("x,y,z-w"));
    }

    #[test]
    fn trailing_literal_anchors_the_last_capture() {
        let rule = Rule::new("/files/*.json", "/json/$1");
        assert_eq!(rule.apply("/files/a.b.json").as_deref(), Some("/json/a.b"));
        assert_eq!(rule.apply("/files/a.json.bak"), None);
    }

    #[test]
    fn prefix_and_suffix_do_not_overlap() {
        let rule = Rule::new("/ab*ba", "$1");
        assert_eq!(rule.apply("/aba"), None);
        assert_eq!(rule.apply("/abba").as_deref(), Some(""));
    }

    #[test]
    fn trailing_wildcard_captures_to_end_including_empty() {
        let rule = Rule::new("/old/*", "/new/$1");
        assert_eq!(rule.apply("/old/").as_deref(), Some("/new/"));
        assert_eq!(rule.apply("/old/a/b?").as_deref(), Some("/new/a/b?"));
        assert_eq!(rule.apply("/old"), None);
    }

    #[test]
    fn empty_pattern_matches_only_empty_path() {
        let rule = Rule::new("", "/root");
        assert_eq!(rule.apply("").as_deref(), Some("/root"));
        assert_eq!(rule.apply("/"), None);

        let rule = Rule::new("*", "[$1]");
        assert_eq!(rule.apply("").as_deref(), Some("[]"));
        assert_eq!(rule.apply("/any").as_deref(), Some("[/any]"));
    }

    #[test]
    fn unknown_placeholders_stay_literal() {
        let rule = Rule::new("/a/*", "/b/$1/$2/$0/$/$x");
        assert_eq!(rule.wildcards(), 1);
        assert_eq!(rule.apply("/a/v").as_deref(), Some("/b/v/$2/$0/$/$x"));

        let rule = Rule::new("/a", "/b/$99999999999999999999999");
        assert_eq!(
            rule.apply("/a").as_deref(),
            Some("/b/$99999999999999999999999")
        );
    }

    #[test]
    fn placeholders_can_repeat_and_reorder() {
        let rule = Rule::new("/*/*", "/$2/$1/$2");
        assert_eq!(rule.apply("/x/y").as_deref(), Some("/y/x/y"));
    }

    #[test]
    fn duplicate_patterns_are_rejected() {
        let err = RuleSet::compile([("/a", "/b"), ("/a", "/c")]).unwrap_err();
        assert!(matches!(err, GatewayError::Configuration(msg) if msg.contains("/a")));
    }

    #[test]
    fn repeated_rewrites_are_identical() {
        let rules = set(&[("/users/*/orders/*", "/user/$1/order/$2")]);
        let first = rules.rewrite("/users/1/orders/2").0.into_owned();
        for _ in 0..5 {
            assert_eq!(rules.rewrite("/users/1/orders/2").0, first);
        }
    }
}
