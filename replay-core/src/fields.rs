// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use regex::Regex;
use tracing::{debug, error};

/// How a recorded field is checked against the live request.
#[derive(Debug, Clone)]
pub enum MatchMode {
    Equal,
    Contains,
    Prefix,
    Suffix,
    Regex(Regex),
    Absent,
    Present,
}

impl MatchMode {
    /// Parse a rule name as it appears in the third element of a corpus
    /// field entry. Returns `None` for unknown rule names.
    pub fn parse(name: &str, value: &str) -> Option<Result<MatchMode, regex::Error>> {
        let mode = match name {
            "equal" => MatchMode::Equal,
            "contains" => MatchMode::Contains,
            "prefix" => MatchMode::Prefix,
            "suffix" => MatchMode::Suffix,
            "regex" => return Some(Regex::new(value).map(MatchMode::Regex)),
            "absent" => MatchMode::Absent,
            "present" => MatchMode::Present,
            _ => return None,
        };
        Some(Ok(mode))
    }
}

/// A single verification rule: field name (matched case-insensitively),
/// the recorded value, and the match mode.
#[derive(Debug, Clone)]
pub struct FieldRule {
    pub name: String,
    pub value: String,
    pub mode: MatchMode,
}

impl FieldRule {
    fn holds(&self, actual: Option<&str>) -> bool {
        match (&self.mode, actual) {
            (MatchMode::Absent, None) => true,
            (MatchMode::Absent, Some(_)) => false,
            (_, None) => false,
            (MatchMode::Present, Some(_)) => true,
            (MatchMode::Equal, Some(v)) => v == self.value,
            (MatchMode::Contains, Some(v)) => v.contains(&self.value),
            (MatchMode::Prefix, Some(v)) => v.starts_with(&self.value),
            (MatchMode::Suffix, Some(v)) => v.ends_with(&self.value),
            (MatchMode::Regex(re), Some(v)) => re.is_match(v),
        }
    }
}

/// An ordered list of header fields plus the verification rules recorded
/// alongside them. Field names keep their recorded casing for the wire;
/// lookups are case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct FieldSet {
    fields: Vec<(String, String)>,
    rules: Vec<FieldRule>,
}

impl FieldSet {
    pub fn add_field(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push((name.into(), value.into()));
    }

    pub fn add_rule(&mut self, rule: FieldRule) {
        self.rules.push(rule);
    }

    /// First value recorded under `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn rules(&self) -> &[FieldRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.rules.is_empty()
    }

    /// Remove every field recorded under `name`.
    pub fn remove(&mut self, name: &str) {
        self.fields.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// Append another set's fields and rules, preserving order. Used to
    /// fold a transaction's `all` block into both message templates.
    pub fn merge(&mut self, other: &FieldSet) {
        for (n, v) in &other.fields {
            self.fields.push((n.clone(), v.clone()));
        }
        for rule in &other.rules {
            self.rules.push(rule.clone());
        }
    }

    /// Check the live request's fields against this recorded rule set.
    /// In strict mode every recorded field without an explicit rule for
    /// its name is checked for equality as well. Each failing field is
    /// reported on the error stream; the failure count is returned and
    /// the connection is left alone.
    pub fn verify(&self, actual: &FieldSet, key: &str, strict: bool) -> usize {
        let mut failures = 0;
        for rule in &self.rules {
            let live = actual.get(&rule.name);
            if rule.holds(live) {
                debug!(key, field = %rule.name, "field verification passed");
            } else {
                failures += 1;
                error!(
                    key,
                    field = %rule.name,
                    expected = %rule.value,
                    mode = ?rule.mode,
                    actual = live.unwrap_or("<missing>"),
                    "field verification failed"
                );
            }
        }
        if strict {
            for (name, value) in &self.fields {
                if self.rules.iter().any(|r| r.name.eq_ignore_ascii_case(name)) {
                    continue;
                }
                match actual.get(name) {
                    Some(live) if live == value => {
                        debug!(key, field = %name, "strict field check passed");
                    }
                    live => {
                        failures += 1;
                        error!(
                            key,
                            field = %name,
                            expected = %value,
                            actual = live.unwrap_or("<missing>"),
                            "strict field check failed"
                        );
                    }
                }
            }
        }
        failures
    }
}
