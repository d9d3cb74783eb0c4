//! Hierarchy-to-field resolution
//!
//! Cube row axes identify dimensions by hierarchy unique names such as
//! `[Franchise].[Franchise Store Hierarchy]`. Pipelines map those onto
//! column names with an ordered list of regex rules.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{IngestError, Result};

/// One configured `(pattern, field)` rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchyRule {
    pub pattern: String,
    pub field: String,
}

impl HierarchyRule {
    pub fn new(pattern: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            field: field.into(),
        }
    }
}

/// Resolve a hierarchy name against rules in declared order.
///
/// Patterns are searched for anywhere in the name, not anchored. The first
/// rule that matches wins even if a later one is more specific. Rules with
/// invalid patterns never match.
///
/// Compiles `rules` on every call; build a [`HierarchyMapper`] once when
/// resolving many names.
pub fn resolve(hierarchy: &str, rules: &[HierarchyRule]) -> Option<String> {
    HierarchyMapper::lenient(rules)
        .resolve(hierarchy)
        .map(str::to_string)
}

/// Precompiled rule set used during parsing
#[derive(Debug, Clone)]
pub struct HierarchyMapper {
    rules: Vec<(Regex, String)>,
}

impl HierarchyMapper {
    /// Compile the rules. An invalid pattern is a configuration error.
    pub fn new(rules: &[HierarchyRule]) -> Result<Self> {
        let compiled = rules
            .iter()
            .map(|rule| {
                Regex::new(&rule.pattern)
                    .map(|re| (re, rule.field.clone()))
                    .map_err(|e| {
                        IngestError::config(format!(
                            "Invalid hierarchy pattern '{}' for field '{}': {}",
                            rule.pattern, rule.field, e
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { rules: compiled })
    }

    /// Compile the rules, skipping any whose pattern is invalid.
    pub fn lenient(rules: &[HierarchyRule]) -> Self {
        let compiled = rules
            .iter()
            .filter_map(|rule| {
                Regex::new(&rule.pattern)
                    .ok()
                    .map(|re| (re, rule.field.clone()))
            })
            .collect();
        Self { rules: compiled }
    }

    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn resolve(&self, hierarchy: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|(re, _)| re.is_match(hierarchy))
            .map(|(_, field)| field.as_str())
    }

    /// Field name for a hierarchy, falling back to the raw hierarchy name.
    pub fn field_for<'a>(&'a self, hierarchy: &'a str) -> &'a str {
        self.resolve(hierarchy).unwrap_or(hierarchy)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn store_rules() -> Vec<HierarchyRule> {
        vec![
            HierarchyRule::new("Franchise.*Store", "StoreNumber"),
            HierarchyRule::new("Calendar.*Date", "CalendarDate"),
            HierarchyRule::new(".*Item_Number", "ItemNumber"),
        ]
    }

    #[test]
    fn test_resolve_searches_unanchored() {
        let rules = store_rules();
        assert_eq!(
            resolve("[Franchise].[Franchise Store Hierarchy]", &rules).as_deref(),
            Some("StoreNumber")
        );
        assert_eq!(
            resolve("[Calendar].[Calendar Date]", &rules).as_deref(),
            Some("CalendarDate")
        );
    }

    #[test]
    fn test_first_match_wins_over_more_specific_rule() {
        let rules = vec![
            HierarchyRule::new("Store", "Generic"),
            HierarchyRule::new("Franchise.*Store.*Number", "StoreNumber"),
        ];
        assert_eq!(
            resolve("[Franchise].[Store Number]", &rules).as_deref(),
            Some("Generic")
        );

        let mapper = HierarchyMapper::new(&rules).unwrap();
        assert_eq!(mapper.resolve("[Franchise].[Store Number]"), Some("Generic"));
    }

    #[test]
    fn test_unmatched_falls_back_to_raw_name() {
        let mapper = HierarchyMapper::new(&store_rules()).unwrap();
        assert_eq!(mapper.resolve("[Promo].[Promo Code]"), None);
        assert_eq!(mapper.field_for("[Promo].[Promo Code]"), "[Promo].[Promo Code]");
        assert!(resolve("[Promo].[Promo Code]", &store_rules()).is_none());
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let rules = vec![HierarchyRule::new("Store(", "StoreNumber")];
        let err = HierarchyMapper::new(&rules).unwrap_err();
        assert!(matches!(err, IngestError::Config(_)));
        assert!(resolve("Store(", &rules).is_none());
    }

    #[test]
    fn test_invalid_rule_is_skipped_not_fatal_for_resolve() {
        let rules = vec![
            HierarchyRule::new("Store(", "Broken"),
            HierarchyRule::new("Franchise.*Store", "StoreNumber"),
        ];
        assert_eq!(
            resolve("[Franchise].[Franchise Store]", &rules).as_deref(),
            Some("StoreNumber")
        );
        assert_eq!(HierarchyMapper::lenient(&rules).len(), 1);
    }

    #[test]
    fn test_resolve_agrees_with_mapper() {
        let rules = store_rules();
        let mapper = HierarchyMapper::new(&rules).unwrap();
        for name in [
            "[Franchise].[Franchise Store Hierarchy]",
            "[Calendar].[Calendar Date]",
            "[Product].[Item_Number]",
            "[Promo].[Promo Code]",
        ] {
            assert_eq!(resolve(name, &rules).as_deref(), mapper.resolve(name));
        }
    }

    #[test]
    fn test_empty_mapper() {
        let mapper = HierarchyMapper::empty();
        assert!(mapper.is_empty());
        assert_eq!(mapper.field_for("[X].[Y]"), "[X].[Y]");
    }
}
