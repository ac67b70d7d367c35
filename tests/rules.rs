use chacha::config::RuleConfig;
use chacha::rule::{Rule, Rules};

#[test]
fn test_first_match_wins() {
    let rules = Rules::new(vec![
        Rule::new("^http://example\\.com/narrow$", true, vec![], false).expect("narrow rule"),
        Rule::new("^http://example\\.com/.*$", false, vec!["token".to_string()], false).expect("broad rule"),
    ]);

    let narrow = rules.get("http://example.com/narrow").expect("narrow match");
    assert!(narrow.ignore_authorization_header());
    assert!(narrow.ignored_parameters().is_empty());

    let broad = rules.get("http://example.com/other").expect("broad match");
    assert!(!broad.ignore_authorization_header());
    assert_eq!(broad.ignored_parameters(), ["token".to_string()]);

    assert!(rules.get("http://elsewhere.com/").is_none());
}

#[test]
fn test_accessors() {
    let rule = Rule::new("^.*$", true, vec!["a".to_string(), "b".to_string()], true).expect("rule");

    assert!(rule.ignore_authorization_header());
    assert_eq!(rule.ignored_parameters(), ["a".to_string(), "b".to_string()]);
    assert!(rule.direct_connect());
}

#[test]
fn test_newline_does_not_satisfy_anchor() {
    let rules = Rules::new(vec![
        Rule::new("^http://example\\.com/a$", false, vec![], false).expect("rule"),
    ]);

    assert!(rules.get("http://example.com/a").is_some());
    assert!(rules.get("http://example.com/a\n").is_none());
    assert!(rules.get("http://example.com/a\nhttp://evil.com/").is_none());
}

#[test]
fn test_patterns_are_not_implicitly_anchored() {
    let rules = Rules::new(vec![Rule::new("example\\.com", false, vec![], false).expect("rule")]);

    assert!(rules.get("http://example.com/anything").is_some());
    assert!(rules.get("http://sub.example.com/else").is_some());
}

#[test]
fn test_invalid_pattern_is_reported() {
    assert!(Rule::new("([unclosed", false, vec![], false).is_err());

    let configs = vec![RuleConfig {
        pattern: "([unclosed".to_string(),
        ..Default::default()
    }];
    assert!(Rules::from_config(&configs).is_err());
}
