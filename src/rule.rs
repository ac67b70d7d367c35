use anyhow::{Context, Result};
use regex::Regex;

use crate::config::RuleConfig;

/// A single caching rule. Patterns are matched against the full request URL
/// and are not implicitly anchored; operators anchor with `^...$` themselves.
#[derive(Debug, Clone)]
pub struct Rule {
    re: Regex,
    ignore_authorization_header: bool,
    ignored_parameters: Vec<String>,
    direct_connect: bool,
}

impl Rule {
    pub fn new(
        pattern: &str,
        ignore_authorization_header: bool,
        ignored_parameters: Vec<String>,
        direct_connect: bool,
    ) -> Result<Self> {
        // The default regex flags already treat `$` and `.` relative to the
        // whole haystack, so a URL smuggling a newline cannot satisfy an
        // operator's `$` anchor.
        let re = Regex::new(pattern)
            .with_context(|| format!("failed to parse regular expression for path pattern {pattern}"))?;

        Ok(Self {
            re,
            ignore_authorization_header,
            ignored_parameters,
            direct_connect,
        })
    }

    pub fn ignore_authorization_header(&self) -> bool {
        self.ignore_authorization_header
    }

    pub fn ignored_parameters(&self) -> &[String] {
        &self.ignored_parameters
    }

    pub fn direct_connect(&self) -> bool {
        self.direct_connect
    }

    pub fn matches(&self, url: &str) -> bool {
        self.re.is_match(url)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Rules(Vec<Rule>);

impl Rules {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self(rules)
    }

    pub fn from_config(configs: &[RuleConfig]) -> Result<Self> {
        let mut rules = Vec::with_capacity(configs.len());
        for cfg in configs {
            rules.push(Rule::new(
                &cfg.pattern,
                cfg.ignore_authorization_header,
                cfg.ignored_parameters.clone(),
                cfg.direct_connect,
            )?);
        }
        Ok(Self(rules))
    }

    /// Returns the first rule matching the URL, or none.
    pub fn get(&self, url: &str) -> Option<&Rule> {
        self.0.iter().find(|rule| rule.matches(url))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
