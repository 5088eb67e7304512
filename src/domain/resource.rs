//! Static description of a cached resource type and the identity extracted
//! from its records.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::DomainError;

const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);
const DEFAULT_JITTER_MIN: Duration = Duration::from_secs(0);
const DEFAULT_JITTER_MAX: Duration = Duration::from_secs(5 * 60);

/// How a record's identity is expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdKind {
    /// Positive 64-bit id; id-lists are ordered by it.
    Numeric,
    /// Store-assigned opaque id; id-lists are ordered lexicographically.
    Opaque,
}

/// Uniform random offset added on top of every TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitterRange {
    min: Duration,
    max: Duration,
}

impl JitterRange {
    pub fn new(min: Duration, max: Duration) -> Result<Self, DomainError> {
        if min > max {
            return Err(DomainError::validation(format!(
                "jitter range minimum {min:?} exceeds maximum {max:?}"
            )));
        }
        Ok(Self { min, max })
    }

    pub const fn none() -> Self {
        Self {
            min: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// `base` plus a uniformly drawn offset in `[min, max]`.
    pub fn apply(&self, base: Duration) -> Duration {
        let low = self.min.as_millis() as u64;
        let high = self.max.as_millis() as u64;
        let offset = if high > low {
            fastrand::u64(low..=high)
        } else {
            low
        };
        base + Duration::from_millis(offset)
    }
}

impl Default for JitterRange {
    fn default() -> Self {
        Self {
            min: DEFAULT_JITTER_MIN,
            max: DEFAULT_JITTER_MAX,
        }
    }
}

/// Static configuration of one cached resource type.
#[derive(Debug, Clone)]
pub struct ResourceType {
    name: String,
    ttl: Duration,
    jitter: JitterRange,
    has_sub_resource: bool,
    id_kind: IdKind,
    cache_all: bool,
}

impl ResourceType {
    pub fn new(name: impl Into<String>, id_kind: IdKind) -> Self {
        Self {
            name: name.into(),
            ttl: DEFAULT_TTL,
            jitter: JitterRange::default(),
            has_sub_resource: false,
            id_kind,
            cache_all: false,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_jitter(mut self, jitter: JitterRange) -> Self {
        self.jitter = jitter;
        self
    }

    /// Records are additionally partitioned by a sub-resource (e.g. an object
    /// model id) and every lookup must name one.
    pub fn with_sub_resource(mut self) -> Self {
        self.has_sub_resource = true;
        self
    }

    /// Keep system-wide id-lists of every record, not only those selected by
    /// full-sync conditions.
    pub fn caching_all(mut self) -> Self {
        self.cache_all = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn jitter(&self) -> JitterRange {
        self.jitter
    }

    pub fn has_sub_resource(&self) -> bool {
        self.has_sub_resource
    }

    pub fn id_kind(&self) -> IdKind {
        self.id_kind
    }

    pub fn cache_all(&self) -> bool {
        self.cache_all
    }

    /// TTL for an entry of this resource, jitter included.
    pub fn jittered(&self, base: Duration) -> Duration {
        self.jitter.apply(base)
    }

    /// Check that a caller-supplied sub-resource agrees with the resource shape.
    pub fn check_sub_resource(&self, sub_res: Option<&str>) -> Result<(), DomainError> {
        match (self.has_sub_resource, sub_res) {
            (true, None) | (true, Some("")) => Err(DomainError::validation(format!(
                "resource `{}` requires a sub-resource",
                self.name
            ))),
            (false, Some(sub)) if !sub.is_empty() => Err(DomainError::validation(format!(
                "resource `{}` has no sub-resource, got `{sub}`",
                self.name
            ))),
            _ => Ok(()),
        }
    }
}

/// Identity extracted from a raw record or a change event.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BasicInfo {
    pub id: i64,
    pub oid: String,
    pub sub_res: Vec<String>,
    pub tenant: String,
}

impl BasicInfo {
    pub fn validate(&self, resource: &ResourceType) -> Result<(), DomainError> {
        match resource.id_kind() {
            IdKind::Numeric if self.id <= 0 => {
                return Err(DomainError::invalid_record(
                    resource.name(),
                    format!("invalid id {}", self.id),
                ));
            }
            IdKind::Opaque if self.oid.is_empty() => {
                return Err(DomainError::invalid_record(resource.name(), "no oid"));
            }
            _ => {}
        }

        if resource.has_sub_resource() && self.sub_res.iter().all(|sub| sub.is_empty()) {
            return Err(DomainError::invalid_record(
                resource.name(),
                "no sub-resource",
            ));
        }

        Ok(())
    }
}
