//! Alert matching.
//!
//! A rule matches an alert when every label pattern of the rule finds a match in the
//! alert label with the same name, and likewise for annotations. Patterns are
//! unanchored (`my.*` matches `myvalue` and `not-myvalue`), keys the rule doesn't
//! mention are ignored, and a rule without patterns matches every alert.

use regex::Regex;
use std::collections::{BTreeMap, HashMap};

use super::HealingRule;
use crate::alert::Alert;
use crate::error::MatchError;

/// Check whether `rule` is activated by `alert`.
pub fn matches(rule: &HealingRule, alert: &Alert) -> Result<bool, MatchError> {
    if !check_map("label", &rule.labels, &alert.labels)? {
        return Ok(false);
    }
    check_map("annotation", &rule.annotations, &alert.annotations)
}

fn check_map(
    field: &'static str,
    patterns: &BTreeMap<String, String>,
    values: &HashMap<String, String>,
) -> Result<bool, MatchError> {
    for (key, pattern) in patterns {
        let Some(value) = values.get(key) else {
            return Ok(false);
        };
        let regex = Regex::new(pattern).map_err(|source| MatchError::InvalidPattern {
            field,
            key: key.clone(),
            source,
        })?;
        if !regex.is_match(value) {
            return Ok(false);
        }
    }
    Ok(true)
}
