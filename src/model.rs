use crate::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Maximum number of positional values a rule may carry.
pub const MAX_RULE_ARITY: usize = 6;

/// One policy entry: a rule-type tag plus an ordered tuple of string fields.
///
/// The first character of `ptype` names the section the rule belongs to
/// (`p` for permission rules, `g` for role-inheritance rules); the full tag
/// distinguishes sub-types such as `p2` or `g2`. Trailing positions are
/// logically absent, but interior positions may hold the empty string as a
/// meaningful value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub ptype: String,
    pub values: Vec<String>,
}

impl PolicyRule {
    pub fn new(ptype: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            ptype: ptype.into(),
            values,
        }
    }

    /// Content identifier of this rule.
    pub fn id(&self) -> String {
        rule_id(&self.ptype, &self.values)
    }
}

/// Deterministic content identifier for a rule.
///
/// The identifier is the lowercase hex BLAKE3 digest of the rule type and
/// the value tuple exactly as supplied by the caller, joined by commas
/// (`ptype,v0,v1,...` with no padding to six slots). Both the algorithm and
/// this byte sequence are a wire contract: rows written by one process must
/// be addressable by another, so neither may change without a data
/// migration. Two rules with equal content collapse to the same identifier;
/// a hash collision between distinct contents is treated as content
/// equality and is not corrected at this layer.
pub fn rule_id(ptype: &str, values: &[String]) -> String {
    let mut data = String::with_capacity(
        ptype.len() + values.iter().map(|v| v.len() + 1).sum::<usize>(),
    );
    data.push_str(ptype);
    for value in values {
        data.push(',');
        data.push_str(value);
    }
    blake3::hash(data.as_bytes()).to_hex().to_string()
}

/// Index of the last non-empty slot, or `None` if every slot is empty.
pub(crate) fn last_non_empty_index(values: &[String]) -> Option<usize> {
    values.iter().rposition(|v| !v.is_empty())
}

/// Reject positional windows that fall outside the `v0..v5` column range.
pub(crate) fn validate_window(field_index: usize, count: usize) -> StoreResult<()> {
    if field_index + count > MAX_RULE_ARITY {
        return Err(StoreError::InvalidInput(format!(
            "filter window {field_index}..{} exceeds the {MAX_RULE_ARITY} value columns",
            field_index + count
        )));
    }
    Ok(())
}

/// Fixed-column form of exactly one rule, as persisted.
///
/// Unused positions are stored as empty strings. Whether an empty slot was
/// an intentionally empty interior value or an unused trailing position is
/// not representable here; the distinction is reconstructed at the line
/// boundary by trimming only trailing emptiness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleRow {
    pub id: String,
    pub ptype: String,
    pub values: [String; MAX_RULE_ARITY],
}

impl RuleRow {
    /// Encode a rule into its row form, computing the content identifier.
    pub fn from_parts(ptype: &str, values: &[String]) -> StoreResult<Self> {
        if values.len() > MAX_RULE_ARITY {
            return Err(StoreError::InvalidInput(format!(
                "rule for `{ptype}` has {} values, at most {MAX_RULE_ARITY} are supported",
                values.len()
            )));
        }
        let mut slots: [String; MAX_RULE_ARITY] = Default::default();
        for (slot, value) in slots.iter_mut().zip(values) {
            *slot = value.clone();
        }
        Ok(Self {
            id: rule_id(ptype, values),
            ptype: ptype.to_string(),
            values: slots,
        })
    }

    /// Render the delimited text line consumed by [`PolicyModel::load_line`].
    ///
    /// Emits the rule type, then every value up to and including the last
    /// non-empty one. Interior empty values inside that range are kept;
    /// trailing empty slots are trimmed.
    pub fn to_line(&self) -> StoreResult<String> {
        if self.ptype.is_empty() {
            return Err(StoreError::Serialization(format!(
                "rule row {} has an empty rule type",
                self.id
            )));
        }
        let mut line = String::with_capacity(
            self.ptype.len() + self.values.iter().map(|v| v.len() + 2).sum::<usize>(),
        );
        line.push_str(&self.ptype);
        if let Some(last) = last_non_empty_index(&self.values) {
            for value in &self.values[..=last] {
                line.push_str(", ");
                line.push_str(value);
            }
        }
        Ok(line)
    }

    /// Reconstruct the variable-arity rule, applying the trailing-trim rule.
    pub fn to_rule(&self) -> PolicyRule {
        let len = last_non_empty_index(&self.values).map_or(0, |i| i + 1);
        PolicyRule::new(self.ptype.clone(), self.values[..len].to_vec())
    }

    /// Conjunctive positional match starting at column `v{field_index}`.
    ///
    /// Empty filter values impose no constraint. The caller is responsible
    /// for validating the window against [`MAX_RULE_ARITY`].
    pub fn matches(&self, field_index: usize, field_values: &[String]) -> bool {
        field_values
            .iter()
            .enumerate()
            .all(|(i, v)| v.is_empty() || self.values[field_index + i] == *v)
    }
}

/// Partially-specified rule pattern restricting which rows a filtered load
/// considers. An empty string at a position means "no constraint at this
/// position"; positions past the end of a sequence are unconstrained; a
/// `None` section contributes no rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub p: Option<Vec<String>>,
    pub g: Option<Vec<String>>,
}

/// In-memory policy model: per section, an ordered mapping from sub-type
/// tag to the accumulated set of rule tuples.
///
/// Rules are held in ordered sets, so two loads of the same row set in
/// different orders produce equal models and content-duplicate rules
/// collapse to one entry, mirroring how the store deduplicates rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyModel {
    sections: BTreeMap<String, BTreeMap<String, BTreeSet<Vec<String>>>>,
}

impl PolicyModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one rule under its sub-type tag. Returns `false` if the rule
    /// was already present.
    pub fn add_rule(&mut self, ptype: &str, values: Vec<String>) -> bool {
        let section = ptype.chars().take(1).collect::<String>();
        self.sections
            .entry(section)
            .or_default()
            .entry(ptype.to_string())
            .or_default()
            .insert(values)
    }

    /// Parse one policy line (`ptype, v0, v1, ...`) into the model.
    ///
    /// Blank lines and `#` comment lines are skipped. Tokens are trimmed,
    /// so an interior empty value survives as the empty string.
    pub fn load_line(&mut self, line: &str) -> StoreResult<()> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(());
        }
        let mut tokens = line.split(',').map(str::trim);
        let ptype = tokens.next().unwrap_or_default();
        if ptype.is_empty() {
            return Err(StoreError::Serialization(format!(
                "policy line `{line}` is missing a rule type"
            )));
        }
        let values = tokens.map(str::to_string).collect();
        self.add_rule(ptype, values);
        Ok(())
    }

    /// Every rule in the given section (`"p"` or `"g"`), flattened across
    /// sub-type tags in deterministic order.
    pub fn rules(&self, section: &str) -> Vec<(&str, &[String])> {
        self.sections
            .get(section)
            .into_iter()
            .flat_map(|tags| tags.iter())
            .flat_map(|(ptype, rules)| {
                rules.iter().map(move |values| (ptype.as_str(), values.as_slice()))
            })
            .collect()
    }

    /// The rule tuples accumulated under one sub-type tag.
    pub fn policy(&self, ptype: &str) -> Vec<Vec<String>> {
        let section = ptype.chars().take(1).collect::<String>();
        self.sections
            .get(&section)
            .and_then(|tags| tags.get(ptype))
            .map(|rules| rules.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Total number of rules across all sections.
    pub fn rule_count(&self) -> usize {
        self.sections
            .values()
            .flat_map(|tags| tags.values())
            .map(|rules| rules.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn line_keeps_interior_empty_values() {
        let row = RuleRow::from_parts("p", &strings(&["alice", "", "read"])).unwrap();
        assert_eq!(row.to_line().unwrap(), "p, alice, , read");
    }

    #[test]
    fn line_trims_trailing_empty_values() {
        let row = RuleRow::from_parts("p", &strings(&["alice", "data1", "read", "", ""])).unwrap();
        assert_eq!(row.to_line().unwrap(), "p, alice, data1, read");
        assert_eq!(row.to_rule().values, strings(&["alice", "data1", "read"]));
    }

    #[test]
    fn line_for_zero_arity_rule_is_just_the_type() {
        let row = RuleRow::from_parts("g", &[]).unwrap();
        assert_eq!(row.to_line().unwrap(), "g");
        assert!(row.to_rule().values.is_empty());
    }

    #[test]
    fn line_round_trips_through_the_model() {
        let row = RuleRow::from_parts("p2", &strings(&["alice", "", "read"])).unwrap();
        let mut model = PolicyModel::new();
        model.load_line(&row.to_line().unwrap()).unwrap();
        assert_eq!(model.policy("p2"), vec![strings(&["alice", "", "read"])]);
    }

    #[test]
    fn empty_rule_type_is_a_decode_error() {
        let row = RuleRow {
            id: "deadbeef".to_string(),
            ptype: String::new(),
            values: Default::default(),
        };
        assert!(matches!(row.to_line(), Err(StoreError::Serialization(_))));
    }

    #[test]
    fn arity_above_six_is_rejected() {
        let values = strings(&["a", "b", "c", "d", "e", "f", "g"]);
        assert!(matches!(
            RuleRow::from_parts("p", &values),
            Err(StoreError::InvalidInput(_))
        ));
    }

    #[test]
    fn rule_id_is_deterministic_and_content_sensitive() {
        let a = rule_id("p", &strings(&["alice", "data1", "read"]));
        let b = rule_id("p", &strings(&["alice", "data1", "read"]));
        let c = rule_id("p", &strings(&["alice", "data1", "write"]));
        let d = rule_id("g", &strings(&["alice", "data1", "read"]));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit() && !ch.is_ascii_uppercase()));
    }

    #[test]
    fn rule_id_hashes_the_tuple_as_supplied() {
        // A trailing empty value is part of the hashed content, not padding.
        let short = rule_id("p", &strings(&["alice"]));
        let padded = rule_id("p", &strings(&["alice", ""]));
        assert_ne!(short, padded);
    }

    #[test]
    fn matches_applies_offset_and_skips_empty_constraints() {
        let row = RuleRow::from_parts("p", &strings(&["alice", "data1", "read"])).unwrap();
        assert!(row.matches(0, &strings(&["", "data1"])));
        assert!(row.matches(1, &strings(&["data1", "read"])));
        assert!(!row.matches(1, &strings(&["data2"])));
        assert!(row.matches(0, &[]));
    }

    #[test]
    fn window_validation_rejects_overflow() {
        assert!(validate_window(0, 6).is_ok());
        assert!(validate_window(5, 1).is_ok());
        assert!(matches!(
            validate_window(4, 3),
            Err(StoreError::InvalidInput(_))
        ));
    }

    #[test]
    fn model_skips_blank_and_comment_lines() {
        let mut model = PolicyModel::new();
        model.load_line("").unwrap();
        model.load_line("   ").unwrap();
        model.load_line("# p, alice, data1, read").unwrap();
        assert_eq!(model.rule_count(), 0);
    }

    #[test]
    fn model_is_row_order_independent() {
        let lines = [
            "p, alice, data1, read",
            "p, bob, data2, write",
            "p2, carol, data3, read, allow",
            "g, alice, admin",
        ];
        let mut forward = PolicyModel::new();
        for line in lines {
            forward.load_line(line).unwrap();
        }
        let mut backward = PolicyModel::new();
        for line in lines.iter().rev() {
            backward.load_line(line).unwrap();
        }
        assert_eq!(forward, backward);
        assert_eq!(forward.rule_count(), 4);
    }

    #[test]
    fn model_sections_are_keyed_by_leading_character() {
        let mut model = PolicyModel::new();
        model.add_rule("p", strings(&["alice", "data1", "read"]));
        model.add_rule("p2", strings(&["bob", "data2", "write"]));
        model.add_rule("g", strings(&["alice", "admin"]));
        assert_eq!(model.rules("p").len(), 2);
        assert_eq!(model.rules("g").len(), 1);
        assert!(model.rules("x").is_empty());
    }

    #[test]
    fn model_deduplicates_rules_by_content() {
        let mut model = PolicyModel::new();
        assert!(model.add_rule("p", strings(&["alice", "data1", "read"])));
        assert!(!model.add_rule("p", strings(&["alice", "data1", "read"])));
        assert_eq!(model.rule_count(), 1);
    }
}
