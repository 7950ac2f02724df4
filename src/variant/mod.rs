//! Variant priority calculation.
//!
//! A package can be built in several variants (with or without a graphics
//! toolkit, full or minimal feature set). Package resolvers prefer the build
//! with the highest build number when several builds of one version are
//! installable, so each variant adds an offset to the recipe's base build
//! number and the table of offsets decides which variant installs by default.
//!
//! Offsets come from a [`PriorityTable`] rather than from sequential
//! conditionals. The table is validated when it is built:
//!
//! - every rule adds a strictly positive offset, so a flag set that refines
//!   another always ranks higher;
//! - a rule outranks any combination of lower-ranked rules on other axes;
//! - no two reachable flag combinations share an offset.
//!
//! Within one axis only a single value can be selected, so two values of the
//! same axis never sum.
//!
//! ```rust
//! use bonsai_release::variant::{PriorityTable, VariantSet};
//!
//! let table = PriorityTable::ifcopenshell_default();
//! let novtk = VariantSet::new().with("variant", "novtk");
//! let all = VariantSet::new().with("variant", "all");
//! assert!(table.priority(&novtk) > table.priority(&all));
//! assert!(table.priority(&all) > table.priority(&VariantSet::new()));
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::identity::validate_segment;

/// Tag rendered for a flag set with no recognized flags.
pub const BASE_TAG: &str = "base";

/// Upper bound on the number of flag combinations a table may describe.
const MAX_COMBINATIONS: usize = 4096;

/// A set of variant flags: one selected value per axis.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VariantSet(BTreeMap<String, String>);

impl VariantSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return this set with `axis` set to `value`, replacing any previous value.
    pub fn with(mut self, axis: &str, value: &str) -> Self {
        self.0.insert(axis.to_string(), value.to_string());
        self
    }

    /// Parse a single `axis=value` flag.
    pub fn parse_flag(raw: &str) -> Result<(String, String), ConfigError> {
        let (axis, value) = raw.split_once('=').ok_or_else(|| ConfigError::InvalidComponent {
            field: "variant flag",
            value: raw.to_string(),
            reason: "expected axis=value",
        })?;
        let (axis, value) = (axis.trim(), value.trim());
        if axis.is_empty() || value.is_empty() {
            return Err(ConfigError::InvalidComponent {
                field: "variant flag",
                value: raw.to_string(),
                reason: "axis and value must not be empty",
            });
        }
        Ok((axis.to_string(), value.to_string()))
    }

    /// Build a set from `axis=value` flags. A repeated axis keeps the last value.
    pub fn from_flags<I, S>(flags: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::new();
        for flag in flags {
            let (axis, value) = Self::parse_flag(flag.as_ref())?;
            set.0.insert(axis, value);
        }
        Ok(set)
    }

    pub fn get(&self, axis: &str) -> Option<&str> {
        self.0.get(axis).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(a, v)| (a.as_str(), v.as_str()))
    }

    /// True when `self` selects every flag `other` selects.
    pub fn contains(&self, other: &VariantSet) -> bool {
        other.iter().all(|(axis, value)| self.get(axis) == Some(value))
    }
}

impl fmt::Display for VariantSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (axis, value)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{axis}={value}")?;
        }
        write!(f, "}}")
    }
}

/// One recognized flag and the offset band it contributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PriorityRule {
    pub axis: String,
    pub value: String,
    pub offset: u32,
    /// Short label rendered into build strings, e.g. `novtk`.
    pub tag: String,
}

impl PriorityRule {
    pub fn new(axis: &str, value: &str, offset: u32, tag: &str) -> Self {
        Self {
            axis: axis.to_string(),
            value: value.to_string(),
            offset,
            tag: tag.to_string(),
        }
    }
}

/// Validated lookup table from flag set to priority offset.
#[derive(Debug, Clone)]
pub struct PriorityTable {
    rules: Vec<PriorityRule>,
}

impl PriorityTable {
    /// Validate `rules` and build the table.
    pub fn new(rules: Vec<PriorityRule>) -> Result<Self, ConfigError> {
        let mut seen_pairs = BTreeSet::new();
        let mut seen_tags = BTreeSet::new();
        for rule in &rules {
            let invalid = |reason: String| ConfigError::InvalidVariantRule {
                axis: rule.axis.clone(),
                value: rule.value.clone(),
                reason,
            };
            if rule.axis.trim().is_empty() || rule.value.trim().is_empty() {
                return Err(invalid("axis and value must not be empty".into()));
            }
            if rule.offset == 0 {
                return Err(invalid("offset must be greater than zero".into()));
            }
            if rule.tag == BASE_TAG {
                return Err(invalid(format!("tag '{BASE_TAG}' is reserved")));
            }
            if rule.tag.contains('.') {
                return Err(invalid(format!("tag '{}' must not contain '.'", rule.tag)));
            }
            validate_segment("variant tag", &rule.tag)?;
            if !seen_pairs.insert((rule.axis.as_str(), rule.value.as_str())) {
                return Err(invalid("rule declared twice".into()));
            }
            if !seen_tags.insert(rule.tag.as_str()) {
                return Err(invalid(format!("tag '{}' already used", rule.tag)));
            }
        }

        let table = Self { rules };
        table.check_dominance()?;
        table.check_collisions()?;
        Ok(table)
    }

    /// Offsets used by IfcOpenShell packaging: the VTK-free build ranks above
    /// the all-features build, which ranks above the plain build.
    pub fn ifcopenshell_default() -> Self {
        Self {
            rules: vec![
                PriorityRule::new("variant", "all", 100, "all"),
                PriorityRule::new("variant", "novtk", 200, "novtk"),
            ],
        }
    }

    pub fn rules(&self) -> &[PriorityRule] {
        &self.rules
    }

    /// Offset for `flags`. Unrecognized flags contribute zero.
    pub fn priority(&self, flags: &VariantSet) -> u32 {
        self.matching(flags).map(|rule| rule.offset).sum()
    }

    /// Flags in `flags` that no rule recognizes.
    pub fn unrecognized(&self, flags: &VariantSet) -> Vec<(String, String)> {
        flags
            .iter()
            .filter(|(axis, value)| self.rule_for(axis, value).is_none())
            .map(|(axis, value)| (axis.to_string(), value.to_string()))
            .collect()
    }

    /// Reject flag sets carrying flags the table does not know.
    pub fn require_recognized(&self, flags: &VariantSet) -> Result<(), ConfigError> {
        let unknown = self.unrecognized(flags);
        if unknown.is_empty() {
            return Ok(());
        }
        let listed = unknown
            .iter()
            .map(|(a, v)| format!("{a}={v}"))
            .collect::<Vec<_>>()
            .join(", ");
        Err(ConfigError::UnrecognizedVariant(listed))
    }

    /// Label for `flags`: recognized tags from highest to lowest offset,
    /// joined with `.`, or [`BASE_TAG`] when nothing is recognized.
    pub fn tag(&self, flags: &VariantSet) -> String {
        let mut matched: Vec<&PriorityRule> = self.matching(flags).collect();
        if matched.is_empty() {
            return BASE_TAG.to_string();
        }
        matched.sort_by(|a, b| b.offset.cmp(&a.offset));
        matched
            .iter()
            .map(|rule| rule.tag.as_str())
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Every reachable flag combination with its offset, lowest offset first.
    pub fn mapping(&self) -> Vec<(VariantSet, u32)> {
        let mut combos = vec![VariantSet::new()];
        for (axis, rules) in self.axes() {
            let mut next = Vec::with_capacity(combos.len() * (rules.len() + 1));
            for combo in &combos {
                next.push(combo.clone());
                for rule in &rules {
                    next.push(combo.clone().with(axis, &rule.value));
                }
            }
            combos = next;
        }

        let mut out: Vec<(VariantSet, u32)> = combos
            .into_iter()
            .map(|combo| {
                let offset = self.priority(&combo);
                (combo, offset)
            })
            .collect();
        out.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        out
    }

    fn rule_for(&self, axis: &str, value: &str) -> Option<&PriorityRule> {
        self.rules
            .iter()
            .find(|rule| rule.axis == axis && rule.value == value)
    }

    fn matching<'a>(&'a self, flags: &'a VariantSet) -> impl Iterator<Item = &'a PriorityRule> {
        flags
            .iter()
            .filter_map(move |(axis, value)| self.rule_for(axis, value))
    }

    fn axes(&self) -> BTreeMap<&str, Vec<&PriorityRule>> {
        let mut axes: BTreeMap<&str, Vec<&PriorityRule>> = BTreeMap::new();
        for rule in &self.rules {
            axes.entry(rule.axis.as_str()).or_default().push(rule);
        }
        axes
    }

    /// A rule must outrank the largest sum of lower-ranked rules it can be
    /// combined with (one per other axis).
    fn check_dominance(&self) -> Result<(), ConfigError> {
        let axes = self.axes();
        for rule in &self.rules {
            let lower_sum: u64 = axes
                .iter()
                .filter(|(axis, _)| **axis != rule.axis)
                .filter_map(|(_, rules)| {
                    rules
                        .iter()
                        .map(|r| r.offset)
                        .filter(|offset| *offset < rule.offset)
                        .max()
                })
                .map(u64::from)
                .sum();
            if lower_sum >= u64::from(rule.offset) {
                return Err(ConfigError::InvalidVariantRule {
                    axis: rule.axis.clone(),
                    value: rule.value.clone(),
                    reason: format!(
                        "offset {} is reachable by lower-ranked flags on other axes (sum {})",
                        rule.offset, lower_sum
                    ),
                });
            }
        }
        Ok(())
    }

    fn check_collisions(&self) -> Result<(), ConfigError> {
        let axes = self.axes();
        let mut combinations = 1usize;
        let mut max_total = 0u64;
        for rules in axes.values() {
            combinations = combinations.saturating_mul(rules.len() + 1);
            max_total += rules.iter().map(|r| u64::from(r.offset)).max().unwrap_or(0);
        }
        if combinations > MAX_COMBINATIONS {
            return Err(ConfigError::Invalid {
                path: "variants".into(),
                reason: format!(
                    "{combinations} variant combinations exceed the limit of {MAX_COMBINATIONS}"
                ),
            });
        }
        if max_total > u64::from(u32::MAX) {
            return Err(ConfigError::Invalid {
                path: "variants".into(),
                reason: format!("combined variant offsets overflow ({max_total})"),
            });
        }

        let mut by_offset: BTreeMap<u32, VariantSet> = BTreeMap::new();
        for (combo, offset) in self.mapping() {
            if let Some(first) = by_offset.get(&offset) {
                return Err(ConfigError::VariantCollision {
                    first: first.to_string(),
                    second: combo.to_string(),
                    offset,
                });
            }
            by_offset.insert(offset, combo);
        }
        Ok(())
    }
}

impl Default for PriorityTable {
    fn default() -> Self {
        Self::ifcopenshell_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(flags: &[(&str, &str)]) -> VariantSet {
        flags
            .iter()
            .fold(VariantSet::new(), |acc, (a, v)| acc.with(a, v))
    }

    #[test]
    fn default_table_orders_novtk_over_all_over_base() {
        let table = PriorityTable::ifcopenshell_default();
        assert_eq!(table.priority(&set(&[("variant", "novtk")])), 200);
        assert_eq!(table.priority(&set(&[("variant", "all")])), 100);
        assert_eq!(table.priority(&VariantSet::new()), 0);
    }

    #[test]
    fn default_table_passes_validation() {
        let rules = PriorityTable::ifcopenshell_default().rules().to_vec();
        assert!(PriorityTable::new(rules).is_ok());
    }

    #[test]
    fn unrecognized_flags_contribute_nothing() {
        let table = PriorityTable::ifcopenshell_default();
        let flags = set(&[("variant", "all"), ("blas", "openblas")]);
        assert_eq!(table.priority(&flags), 100);
        assert_eq!(
            table.unrecognized(&flags),
            vec![("blas".to_string(), "openblas".to_string())]
        );
        assert!(table.require_recognized(&flags).is_err());
        assert!(table.require_recognized(&set(&[("variant", "all")])).is_ok());
    }

    #[test]
    fn equal_offsets_on_one_axis_collide() {
        let err = PriorityTable::new(vec![
            PriorityRule::new("variant", "all", 100, "all"),
            PriorityRule::new("variant", "novtk", 100, "novtk"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::VariantCollision { offset: 100, .. }));
    }

    #[test]
    fn lower_tiers_must_not_reach_a_higher_tier() {
        // gui=qt (60) + docs=full (50) would outrank variant=novtk (100).
        let err = PriorityTable::new(vec![
            PriorityRule::new("variant", "novtk", 100, "novtk"),
            PriorityRule::new("gui", "qt", 60, "qt"),
            PriorityRule::new("docs", "full", 50, "docs"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidVariantRule { .. }));
    }

    #[test]
    fn banded_axes_sum_without_collision() {
        let table = PriorityTable::new(vec![
            PriorityRule::new("variant", "all", 100, "all"),
            PriorityRule::new("variant", "novtk", 200, "novtk"),
            PriorityRule::new("gui", "qt", 10, "qt"),
        ])
        .unwrap();
        let mapping = table.mapping();
        assert_eq!(mapping.len(), 6);
        let offsets: Vec<u32> = mapping.iter().map(|(_, o)| *o).collect();
        assert_eq!(offsets, vec![0, 10, 100, 110, 200, 210]);
        assert_eq!(table.tag(&set(&[("variant", "novtk"), ("gui", "qt")])), "novtk.qt");
    }

    #[test]
    fn rejects_zero_offsets_and_reserved_tags() {
        assert!(PriorityTable::new(vec![PriorityRule::new("variant", "all", 0, "all")]).is_err());
        assert!(PriorityTable::new(vec![PriorityRule::new("variant", "all", 5, "base")]).is_err());
        assert!(PriorityTable::new(vec![PriorityRule::new("variant", "all", 5, "a_b")]).is_err());
        assert!(PriorityTable::new(vec![
            PriorityRule::new("variant", "all", 5, "x"),
            PriorityRule::new("variant", "novtk", 6, "x"),
        ])
        .is_err());
    }

    #[test]
    fn tag_defaults_to_base() {
        let table = PriorityTable::ifcopenshell_default();
        assert_eq!(table.tag(&VariantSet::new()), BASE_TAG);
        assert_eq!(table.tag(&set(&[("variant", "novtk")])), "novtk");
    }

    #[test]
    fn parses_flags() {
        let flags = VariantSet::from_flags(["variant=novtk", " gui = qt "]).unwrap();
        assert_eq!(flags.get("variant"), Some("novtk"));
        assert_eq!(flags.get("gui"), Some("qt"));
        assert_eq!(flags.to_string(), "{gui=qt, variant=novtk}");
        assert!(VariantSet::from_flags(["novtk"]).is_err());
        assert!(VariantSet::from_flags(["variant="]).is_err());
    }
}
