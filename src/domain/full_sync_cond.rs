//! Persisted full-sync conditions: the subsets of a resource type that must be
//! kept materialized as id-lists.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::DomainError;
use super::filter::{ExprLimits, Expression};

pub const MIN_INTERVAL_HOURS: u32 = 6;
pub const MAX_INTERVAL_HOURS: u32 = 168;

const SECONDS_PER_HOUR: u64 = 60 * 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullSyncCond {
    pub id: i64,
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_resource: Option<String>,
    pub is_all: bool,
    /// Refresh interval in hours.
    pub interval: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Expression>,
    #[serde(rename = "tenant_id")]
    pub tenant: String,
}

impl FullSyncCond {
    pub fn ttl(&self) -> Duration {
        interval_ttl(self.interval)
    }

    /// Shape invariants a condition must hold before it is materialized.
    pub fn check_shape(&self, limits: &ExprLimits) -> Result<(), DomainError> {
        let rejected = |reason: String| DomainError::InvalidCond {
            id: self.id,
            reason,
        };
        if self.id <= 0 {
            return Err(rejected("id must be positive".to_string()));
        }
        check_interval(self.interval)
            .and_then(|()| check_condition(self.is_all, self.condition.as_ref(), limits))
            .map_err(|err| rejected(err.to_string()))
    }
}

/// A condition as submitted for creation; the store assigns its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewFullSyncCond {
    pub resource: String,
    #[serde(default)]
    pub sub_resource: Option<String>,
    #[serde(default)]
    pub is_all: bool,
    pub interval: u32,
    #[serde(default)]
    pub condition: Option<Expression>,
    #[serde(rename = "tenant_id")]
    pub tenant: String,
}

impl NewFullSyncCond {
    pub fn validate(&self, limits: &ExprLimits) -> Result<(), DomainError> {
        if self.resource.trim().is_empty() {
            return Err(DomainError::validation("resource is required"));
        }
        if self.tenant.trim().is_empty() {
            return Err(DomainError::validation("tenant_id is required"));
        }
        check_interval(self.interval)?;
        check_condition(self.is_all, self.condition.as_ref(), limits)
    }

    pub fn with_id(self, id: i64) -> FullSyncCond {
        FullSyncCond {
            id,
            resource: self.resource,
            sub_resource: self.sub_resource,
            is_all: self.is_all,
            interval: self.interval,
            condition: self.condition,
            tenant: self.tenant,
        }
    }
}

pub fn interval_ttl(interval_hours: u32) -> Duration {
    Duration::from_secs(u64::from(interval_hours) * SECONDS_PER_HOUR)
}

pub fn check_interval(interval: u32) -> Result<(), DomainError> {
    if !(MIN_INTERVAL_HOURS..=MAX_INTERVAL_HOURS).contains(&interval) {
        return Err(DomainError::validation(format!(
            "interval {interval} is out of range [{MIN_INTERVAL_HOURS}, {MAX_INTERVAL_HOURS}]"
        )));
    }
    Ok(())
}

fn check_condition(
    is_all: bool,
    condition: Option<&Expression>,
    limits: &ExprLimits,
) -> Result<(), DomainError> {
    match (is_all, condition) {
        (true, Some(_)) => Err(DomainError::validation(
            "is_all condition must not carry a filter",
        )),
        (false, None) => Err(DomainError::validation(
            "condition is required when is_all is false",
        )),
        (false, Some(expr)) => expr
            .validate(limits)
            .map_err(|err| DomainError::validation(err.to_string())),
        (true, None) => Ok(()),
    }
}
