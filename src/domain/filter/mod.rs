//! Boolean filter expressions evaluated against JSON records.
//!
//! The wire shape is either an atom `{"field", "operator", "value"}` or a
//! combination `{"condition": "AND" | "OR", "rules": [...]}`. Dotted field
//! names address nested objects.

mod operator;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use operator::Operator;

const DEFAULT_MAX_RULES: usize = 20;
const DEFAULT_MAX_DEPTH: usize = 3;
const DEFAULT_MAX_IN_ELEMENTS: usize = 500;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("invalid filter expression: {reason}")]
    Invalid { reason: String },
    #[error("field `{field}` cannot be evaluated with operator `{operator}`")]
    TypeMismatch { field: String, operator: Operator },
    #[error("malformed filter expression: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl FilterError {
    fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid {
            reason: reason.into(),
        }
    }
}

/// Bounds enforced by [`Expression::validate`].
#[derive(Debug, Clone, Copy)]
pub struct ExprLimits {
    pub max_rules: usize,
    pub max_depth: usize,
    pub max_in_elements: usize,
}

impl Default for ExprLimits {
    fn default() -> Self {
        Self {
            max_rules: DEFAULT_MAX_RULES,
            max_depth: DEFAULT_MAX_DEPTH,
            max_in_elements: DEFAULT_MAX_IN_ELEMENTS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Logic {
    #[serde(alias = "and")]
    And,
    #[serde(alias = "or")]
    Or,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedRule {
    pub condition: Logic,
    pub rules: Vec<Expression>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomRule {
    pub field: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Expression {
    Combined(CombinedRule),
    Atom(AtomRule),
}

impl Expression {
    pub fn atom(field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self::Atom(AtomRule {
            field: field.into(),
            operator,
            value: value.into(),
        })
    }

    pub fn and(rules: Vec<Expression>) -> Self {
        Self::Combined(CombinedRule {
            condition: Logic::And,
            rules,
        })
    }

    pub fn or(rules: Vec<Expression>) -> Self {
        Self::Combined(CombinedRule {
            condition: Logic::Or,
            rules,
        })
    }

    pub fn from_json(value: &Value) -> Result<Self, FilterError> {
        Ok(Self::deserialize(value)?)
    }

    pub fn validate(&self, limits: &ExprLimits) -> Result<(), FilterError> {
        let mut rules = 0;
        self.validate_at(1, limits, &mut rules)
    }

    fn validate_at(
        &self,
        depth: usize,
        limits: &ExprLimits,
        rules: &mut usize,
    ) -> Result<(), FilterError> {
        if depth > limits.max_depth {
            return Err(FilterError::invalid(format!(
                "expression nesting exceeds {} levels",
                limits.max_depth
            )));
        }

        match self {
            Self::Combined(combined) => {
                if combined.rules.is_empty() {
                    return Err(FilterError::invalid("combined rule has no rules"));
                }
                for rule in &combined.rules {
                    rule.validate_at(depth + 1, limits, rules)?;
                }
                Ok(())
            }
            Self::Atom(atom) => {
                *rules += 1;
                if *rules > limits.max_rules {
                    return Err(FilterError::invalid(format!(
                        "expression exceeds {} rules",
                        limits.max_rules
                    )));
                }
                if atom.field.trim().is_empty() {
                    return Err(FilterError::invalid("rule field is empty"));
                }
                atom.operator
                    .validate_value(&atom.value, limits)
                    .map_err(|reason| FilterError::invalid(format!("{}: {reason}", atom.field)))
            }
        }
    }

    /// Evaluate against a JSON record.
    pub fn matches(&self, record: &Value) -> Result<bool, FilterError> {
        match self {
            Self::Combined(combined) => match combined.condition {
                Logic::And => {
                    for rule in &combined.rules {
                        if !rule.matches(record)? {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
                Logic::Or => {
                    for rule in &combined.rules {
                        if rule.matches(record)? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
            },
            Self::Atom(atom) => {
                let actual = lookup(record, &atom.field);
                atom.operator.evaluate(&atom.field, actual, &atom.value)
            }
        }
    }

    /// Every field referenced by the expression, in rule order.
    pub fn fields(&self) -> Vec<&str> {
        match self {
            Self::Combined(combined) => combined.rules.iter().flat_map(Self::fields).collect(),
            Self::Atom(atom) => vec![atom.field.as_str()],
        }
    }
}

fn lookup<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(record, |current, segment| current.as_object()?.get(segment))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_wire_shape() {
        let expr = Expression::from_json(&json!({
            "condition": "AND",
            "rules": [
                {"field": "cloud_id", "operator": "equal", "value": 0},
                {"field": "name", "operator": "begins_with_i", "value": "web"}
            ]
        }))
        .expect("valid expression");

        assert_eq!(expr.fields(), vec!["cloud_id", "name"]);
        assert!(expr.validate(&ExprLimits::default()).is_ok());
        assert!(
            expr.matches(&json!({"cloud_id": 0, "name": "WEB-01"}))
                .expect("evaluates")
        );
        assert!(
            !expr
                .matches(&json!({"cloud_id": 1, "name": "web-01"}))
                .expect("evaluates")
        );
    }

    #[test]
    fn or_short_circuits_and_nested_fields_resolve() {
        let expr = Expression::or(vec![
            Expression::atom("meta.zone", Operator::In, json!(["a", "b"])),
            Expression::atom("cpu", Operator::Greater, 8),
        ]);
        assert!(expr.matches(&json!({"meta": {"zone": "b"}})).expect("ok"));
        assert!(expr.matches(&json!({"cpu": 16})).expect("ok"));
        assert!(!expr.matches(&json!({"meta": {"zone": "c"}, "cpu": 2})).expect("ok"));
    }

    #[test]
    fn missing_fields_only_satisfy_negated_operators() {
        let record = json!({"name": "x"});
        assert!(
            !Expression::atom("ip", Operator::Equal, "1.1.1.1")
                .matches(&record)
                .expect("ok")
        );
        assert!(
            Expression::atom("ip", Operator::NotEqual, "1.1.1.1")
                .matches(&record)
                .expect("ok")
        );
        assert!(
            Expression::atom("ip", Operator::NotExist, Value::Null)
                .matches(&record)
                .expect("ok")
        );
    }

    #[test]
    fn array_fields_match_any_element() {
        let record = json!({"ips": ["10.0.0.1", "10.0.0.2"]});
        assert!(
            Expression::atom("ips", Operator::Equal, "10.0.0.2")
                .matches(&record)
                .expect("ok")
        );
        assert!(
            Expression::atom("ips", Operator::NotIn, json!(["10.0.0.9"]))
                .matches(&record)
                .expect("ok")
        );
    }

    #[test]
    fn numeric_comparison_on_strings_is_a_type_mismatch() {
        let err = Expression::atom("name", Operator::Less, 3)
            .matches(&json!({"name": "x"}))
            .expect_err("mismatch");
        assert!(matches!(err, FilterError::TypeMismatch { .. }));
    }

    #[test]
    fn validation_enforces_limits() {
        let limits = ExprLimits {
            max_rules: 2,
            max_depth: 2,
            max_in_elements: 2,
        };

        let too_many = Expression::and(vec![
            Expression::atom("a", Operator::Equal, 1),
            Expression::atom("b", Operator::Equal, 1),
            Expression::atom("c", Operator::Equal, 1),
        ]);
        assert!(too_many.validate(&limits).is_err());

        let too_deep = Expression::and(vec![Expression::or(vec![Expression::atom(
            "a",
            Operator::Equal,
            1,
        )])]);
        assert!(too_deep.validate(&limits).is_err());

        let big_in = Expression::atom("a", Operator::In, json!([1, 2, 3]));
        assert!(big_in.validate(&limits).is_err());

        assert!(Expression::and(vec![]).validate(&limits).is_err());
        assert!(
            Expression::atom("a", Operator::Contains, "")
                .validate(&limits)
                .is_err()
        );
    }

    #[test]
    fn case_sensitivity_follows_operator() {
        let record = json!({"name": "Alpha"});
        assert!(
            Expression::atom("name", Operator::Contains, "alp")
                .matches(&record)
                .expect("ok")
        );
        assert!(
            !Expression::atom("name", Operator::ContainsS, "alp")
                .matches(&record)
                .expect("ok")
        );
        assert!(
            Expression::atom("name", Operator::EndsWithI, "HA")
                .matches(&record)
                .expect("ok")
        );
    }
}
