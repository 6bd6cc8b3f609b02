//! Keyword rule compilation and body matching
//!
//! Rules are compiled once per phase run and applied in declared order.
//! String rules are escaped into regexes so both kinds share one matcher and
//! one case-insensitivity path. Matching per rule stops at a cap to bound the
//! memory a hostile body can consume.

use regex::{Regex, RegexBuilder};

use crate::error::{Error, Result};
use crate::model::{KeywordMatch, KeywordRule, RuleKind};

/// A keyword rule with its compiled matcher
pub struct CompiledRule {
    pub rule: KeywordRule,
    regex: Regex,
}

/// Compile a rule set, preserving declared order
///
/// Fails with `Validation` on empty patterns or malformed regexes so a bad
/// rule set is rejected at configure time rather than mid-probe.
pub fn compile_rules(rules: &[KeywordRule]) -> Result<Vec<CompiledRule>> {
    rules
        .iter()
        .map(|rule| {
            if rule.pattern.is_empty() {
                return Err(Error::validation("keyword rule pattern must not be empty"));
            }
            let source = match rule.kind {
                RuleKind::String => regex::escape(&rule.pattern),
                RuleKind::Regex => rule.pattern.clone(),
            };
            let regex = RegexBuilder::new(&source)
                .case_insensitive(!rule.case_sensitive)
                .build()
                .map_err(|e| {
                    Error::Validation(format!("invalid keyword rule '{}': {e}", rule.pattern))
                })?;
            Ok(CompiledRule {
                rule: rule.clone(),
                regex,
            })
        })
        .collect()
}

/// Run compiled rules over a decoded body
///
/// Returns one [`KeywordMatch`] per rule that hit, carrying up to `match_cap`
/// context windows (one per occurrence, in body order).
pub fn extract_matches(
    rules: &[CompiledRule],
    body: &str,
    match_cap: usize,
) -> Vec<KeywordMatch> {
    let mut matches = Vec::new();
    for compiled in rules {
        let mut matched_text = None;
        let mut contexts = Vec::new();
        for m in compiled.regex.find_iter(body).take(match_cap) {
            if matched_text.is_none() {
                matched_text = Some(m.as_str().to_string());
            }
            contexts.push(context_window(
                body,
                m.start(),
                m.end(),
                compiled.rule.context_chars as usize,
            ));
        }
        if let Some(matched_text) = matched_text {
            matches.push(KeywordMatch {
                pattern: compiled.rule.pattern.clone(),
                matched_text,
                category: compiled.rule.category.clone(),
                contexts,
            });
        }
    }
    matches
}

/// Slice a window of `context` bytes either side of `[start, end)`,
/// widened outward to the nearest UTF-8 boundaries
fn context_window(body: &str, start: usize, end: usize, context: usize) -> String {
    let mut lo = start.saturating_sub(context);
    let mut hi = (end + context).min(body.len());
    while lo > 0 && !body.is_char_boundary(lo) {
        lo -= 1;
    }
    while hi < body.len() && !body.is_char_boundary(hi) {
        hi += 1;
    }
    body[lo..hi].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn string_rule(pattern: &str, case_sensitive: bool, context_chars: u32) -> KeywordRule {
        KeywordRule {
            pattern: pattern.to_string(),
            kind: RuleKind::String,
            case_sensitive,
            category: None,
            context_chars,
        }
    }

    #[test]
    fn test_string_rule_case_insensitive_by_default() {
        let rules = compile_rules(&[string_rule("Widget", false, 0)]).unwrap();
        let matches = extract_matches(&rules, "WIDGET widget WiDgEt", 100);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].contexts.len(), 3);
        assert_eq!(matches[0].matched_text, "WIDGET");
    }

    #[test]
    fn test_string_rule_case_sensitive() {
        let rules = compile_rules(&[string_rule("Widget", true, 0)]).unwrap();
        let matches = extract_matches(&rules, "WIDGET widget Widget", 100);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].contexts.len(), 1);
    }

    #[test]
    fn test_string_rule_escapes_metacharacters() {
        let rules = compile_rules(&[string_rule("a.b", true, 0)]).unwrap();
        let matches = extract_matches(&rules, "a.b axb", 100);
        assert_eq!(matches[0].contexts.len(), 1);
    }

    #[test]
    fn test_regex_rule() {
        let rule = KeywordRule {
            pattern: r"contact@\w+\.com".to_string(),
            kind: RuleKind::Regex,
            case_sensitive: false,
            category: Some("email".to_string()),
            context_chars: 4,
        };
        let rules = compile_rules(&[rule]).unwrap();
        let matches = extract_matches(&rules, "mail contact@acme.com today", 100);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].matched_text, "contact@acme.com");
        assert_eq!(matches[0].category.as_deref(), Some("email"));
        assert_eq!(matches[0].contexts[0], "ail contact@acme.com tod");
    }

    #[test]
    fn test_invalid_regex_rejected_at_compile() {
        let rule = KeywordRule {
            pattern: "(unclosed".to_string(),
            kind: RuleKind::Regex,
            case_sensitive: false,
            category: None,
            context_chars: 0,
        };
        assert!(matches!(compile_rules(&[rule]), Err(Error::Validation(_))));
    }

    #[test]
    fn test_empty_pattern_rejected() {
        assert!(compile_rules(&[string_rule("", false, 0)]).is_err());
    }

    #[test]
    fn test_match_cap_bounds_contexts() {
        let rules = compile_rules(&[string_rule("x", true, 0)]).unwrap();
        let body = "x".repeat(500);
        let matches = extract_matches(&rules, &body, 100);
        assert_eq!(matches[0].contexts.len(), 100);
    }

    #[test]
    fn test_rules_applied_in_declared_order() {
        let rules = compile_rules(&[
            string_rule("beta", false, 0),
            string_rule("alpha", false, 0),
        ])
        .unwrap();
        let matches = extract_matches(&rules, "alpha beta", 100);
        assert_eq!(matches[0].pattern, "beta");
        assert_eq!(matches[1].pattern, "alpha");
    }

    #[test]
    fn test_context_window_respects_utf8_boundaries() {
        let rules = compile_rules(&[string_rule("mid", true, 2)]).unwrap();
        // Multibyte characters on both sides of the match.
        let body = "éémidéé";
        let matches = extract_matches(&rules, body, 100);
        // Window widens outward to whole characters instead of slicing
        // through a codepoint.
        assert_eq!(matches[0].contexts[0], "émidé");
    }

    #[test]
    fn test_no_hit_produces_no_entry() {
        let rules = compile_rules(&[string_rule("absent", false, 0)]).unwrap();
        assert!(extract_matches(&rules, "nothing here", 100).is_empty());
    }
}
