use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ExprLimits, FilterError};

/// Comparison applied by an atomic rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equal,
    NotEqual,
    In,
    NotIn,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
    BeginsWith,
    BeginsWithI,
    NotBeginsWith,
    NotBeginsWithI,
    /// Case-insensitive.
    Contains,
    /// Case-sensitive.
    ContainsS,
    NotContains,
    NotContainsI,
    EndsWith,
    EndsWithI,
    NotEndsWith,
    NotEndsWithI,
    IsEmpty,
    IsNotEmpty,
    Exist,
    NotExist,
    IsNull,
    IsNotNull,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Equal => "equal",
            Self::NotEqual => "not_equal",
            Self::In => "in",
            Self::NotIn => "not_in",
            Self::Less => "less",
            Self::LessOrEqual => "less_or_equal",
            Self::Greater => "greater",
            Self::GreaterOrEqual => "greater_or_equal",
            Self::BeginsWith => "begins_with",
            Self::BeginsWithI => "begins_with_i",
            Self::NotBeginsWith => "not_begins_with",
            Self::NotBeginsWithI => "not_begins_with_i",
            Self::Contains => "contains",
            Self::ContainsS => "contains_s",
            Self::NotContains => "not_contains",
            Self::NotContainsI => "not_contains_i",
            Self::EndsWith => "ends_with",
            Self::EndsWithI => "ends_with_i",
            Self::NotEndsWith => "not_ends_with",
            Self::NotEndsWithI => "not_ends_with_i",
            Self::IsEmpty => "is_empty",
            Self::IsNotEmpty => "is_not_empty",
            Self::Exist => "exist",
            Self::NotExist => "not_exist",
            Self::IsNull => "is_null",
            Self::IsNotNull => "is_not_null",
        }
    }

    fn is_negated(&self) -> bool {
        matches!(
            self,
            Self::NotEqual
                | Self::NotIn
                | Self::NotBeginsWith
                | Self::NotBeginsWithI
                | Self::NotContains
                | Self::NotContainsI
                | Self::NotEndsWith
                | Self::NotEndsWithI
        )
    }

    pub(super) fn validate_value(&self, value: &Value, limits: &ExprLimits) -> Result<(), String> {
        match self {
            Self::Equal | Self::NotEqual => {
                if is_scalar(value) {
                    Ok(())
                } else {
                    Err(format!("`{self}` requires a scalar value"))
                }
            }
            Self::In | Self::NotIn => {
                let Value::Array(items) = value else {
                    return Err(format!("`{self}` requires an array value"));
                };
                if items.is_empty() {
                    return Err(format!("`{self}` requires a non-empty array"));
                }
                if items.len() > limits.max_in_elements {
                    return Err(format!(
                        "`{self}` array exceeds {} elements",
                        limits.max_in_elements
                    ));
                }
                if !items.iter().all(is_scalar) {
                    return Err(format!("`{self}` array elements must be scalars"));
                }
                Ok(())
            }
            Self::Less | Self::LessOrEqual | Self::Greater | Self::GreaterOrEqual => {
                if value.is_number() {
                    Ok(())
                } else {
                    Err(format!("`{self}` requires a numeric value"))
                }
            }
            Self::BeginsWith
            | Self::BeginsWithI
            | Self::NotBeginsWith
            | Self::NotBeginsWithI
            | Self::Contains
            | Self::ContainsS
            | Self::NotContains
            | Self::NotContainsI
            | Self::EndsWith
            | Self::EndsWithI
            | Self::NotEndsWith
            | Self::NotEndsWithI => match value {
                Value::String(text) if !text.is_empty() => Ok(()),
                _ => Err(format!("`{self}` requires a non-empty string value")),
            },
            Self::IsEmpty
            | Self::IsNotEmpty
            | Self::Exist
            | Self::NotExist
            | Self::IsNull
            | Self::IsNotNull => Ok(()),
        }
    }

    /// Evaluate against the record's value for `field` (`None` when absent).
    pub(super) fn evaluate(
        &self,
        field: &str,
        actual: Option<&Value>,
        expected: &Value,
    ) -> Result<bool, FilterError> {
        match self {
            Self::Exist => return Ok(actual.is_some()),
            Self::NotExist => return Ok(actual.is_none()),
            Self::IsNull => return Ok(matches!(actual, None | Some(Value::Null))),
            Self::IsNotNull => return Ok(!matches!(actual, None | Some(Value::Null))),
            _ => {}
        }

        let actual = match actual {
            None | Some(Value::Null) => return Ok(self.is_negated()),
            Some(value) => value,
        };

        let mismatch = || FilterError::TypeMismatch {
            field: field.to_string(),
            operator: *self,
        };

        match self {
            Self::Equal => Ok(any_element(actual, |value| scalar_eq(value, expected))),
            Self::NotEqual => Ok(!any_element(actual, |value| scalar_eq(value, expected))),
            Self::In => Ok(in_array(actual, expected)),
            Self::NotIn => Ok(!in_array(actual, expected)),
            Self::Less | Self::LessOrEqual | Self::Greater | Self::GreaterOrEqual => {
                let (Some(left), Some(right)) = (actual.as_f64(), expected.as_f64()) else {
                    return Err(mismatch());
                };
                Ok(match self {
                    Self::Less => left < right,
                    Self::LessOrEqual => left <= right,
                    Self::Greater => left > right,
                    _ => left >= right,
                })
            }
            Self::IsEmpty | Self::IsNotEmpty => {
                let empty = match actual {
                    Value::String(text) => text.is_empty(),
                    Value::Array(items) => items.is_empty(),
                    Value::Object(map) => map.is_empty(),
                    _ => return Err(mismatch()),
                };
                Ok(empty == matches!(self, Self::IsEmpty))
            }
            _ => {
                let (Some(text), Some(pattern)) = (actual.as_str(), expected.as_str()) else {
                    return Err(mismatch());
                };
                Ok(self.match_text(text, pattern))
            }
        }
    }

    fn match_text(&self, text: &str, pattern: &str) -> bool {
        let lower = || (text.to_lowercase(), pattern.to_lowercase());
        match self {
            Self::BeginsWith => text.starts_with(pattern),
            Self::NotBeginsWith => !text.starts_with(pattern),
            Self::BeginsWithI => {
                let (text, pattern) = lower();
                text.starts_with(&pattern)
            }
            Self::NotBeginsWithI => {
                let (text, pattern) = lower();
                !text.starts_with(&pattern)
            }
            Self::Contains => {
                let (text, pattern) = lower();
                text.contains(&pattern)
            }
            Self::ContainsS => text.contains(pattern),
            Self::NotContains => !text.contains(pattern),
            Self::NotContainsI => {
                let (text, pattern) = lower();
                !text.contains(&pattern)
            }
            Self::EndsWith => text.ends_with(pattern),
            Self::NotEndsWith => !text.ends_with(pattern),
            Self::EndsWithI => {
                let (text, pattern) = lower();
                text.ends_with(&pattern)
            }
            Self::NotEndsWithI => {
                let (text, pattern) = lower();
                !text.ends_with(&pattern)
            }
            _ => false,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_scalar(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

fn scalar_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => a == b,
        },
        _ => left == right,
    }
}

// Array-valued fields match when any element does.
fn any_element(actual: &Value, predicate: impl Fn(&Value) -> bool) -> bool {
    match actual {
        Value::Array(items) => items.iter().any(predicate),
        value => predicate(value),
    }
}

fn in_array(actual: &Value, expected: &Value) -> bool {
    let Value::Array(candidates) = expected else {
        return false;
    };
    any_element(actual, |value| {
        candidates
            .iter()
            .any(|candidate| scalar_eq(value, candidate))
    })
}
