//! Cache key definitions.
//!
//! Every key a resource cache writes is derived here, so the lookup path and
//! the change-ingestion path always agree on names.

use crate::domain::resource::{BasicInfo, IdKind, ResourceType};

use super::error::CacheError;

const NAMESPACE: &str = "rescache";

/// Member of an id-list together with its ordering score.
#[derive(Debug, Clone, PartialEq)]
pub struct IdKey {
    pub key: String,
    pub score: f64,
}

/// Which materialized id-list a key belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IdListKind {
    /// Every record of one owner tenant, optionally within a sub-resource.
    System {
        sub_res: Option<String>,
        tenant: String,
    },
    /// Records selected by one full-sync condition.
    Condition { cond_id: i64 },
}

/// Key derivation for one resource type.
#[derive(Debug, Clone)]
pub struct KeyScheme {
    prefix: String,
    id_kind: IdKind,
}

impl KeyScheme {
    pub fn new(resource: &ResourceType) -> Self {
        Self {
            prefix: format!("{NAMESPACE}:{}", resource.name()),
            id_kind: resource.id_kind(),
        }
    }

    /// Id key and score of a parsed record.
    pub fn id_key(&self, info: &BasicInfo) -> Result<IdKey, CacheError> {
        match self.id_kind {
            IdKind::Numeric if info.id > 0 => Ok(IdKey {
                key: info.id.to_string(),
                score: info.id as f64,
            }),
            IdKind::Opaque if !info.oid.is_empty() => Ok(IdKey {
                key: info.oid.clone(),
                score: 0.0,
            }),
            _ => Err(CacheError::validation(format!(
                "record of {} has no usable identity (id {}, oid `{}`)",
                self.prefix, info.id, info.oid
            ))),
        }
    }

    /// Validate a caller-supplied id key and return its score.
    pub fn parse_id_key(&self, key: &str) -> Result<IdKey, CacheError> {
        match self.id_kind {
            IdKind::Numeric => match key.parse::<i64>() {
                Ok(id) if id > 0 => Ok(IdKey {
                    key: id.to_string(),
                    score: id as f64,
                }),
                _ => Err(CacheError::validation(format!("invalid id `{key}`"))),
            },
            IdKind::Opaque if !key.is_empty() => Ok(IdKey {
                key: key.to_string(),
                score: 0.0,
            }),
            IdKind::Opaque => Err(CacheError::validation("empty oid")),
        }
    }

    fn scoped(&self, sub_res: Option<&str>) -> String {
        match sub_res {
            Some(sub) if !sub.is_empty() => format!("{}:{sub}", self.prefix),
            _ => self.prefix.clone(),
        }
    }

    pub fn detail_key(&self, sub_res: Option<&str>, id_key: &str) -> String {
        format!("{}:detail:{id_key}", self.scoped(sub_res))
    }

    pub fn unique_key(&self, key_type: &str, key: &str) -> String {
        format!("{}:unique:{key_type}:{key}", self.prefix)
    }

    pub fn id_list_key(&self, kind: &IdListKind) -> String {
        match kind {
            IdListKind::System { sub_res, tenant } => {
                format!("{}:id_list:{tenant}", self.scoped(sub_res.as_deref()))
            }
            IdListKind::Condition { cond_id } => format!("{}:cond:{cond_id}:id_list", self.prefix),
        }
    }
}

/// Last full refresh time (unix seconds) of an id-list.
pub fn expire_key(list_key: &str) -> String {
    format!("{list_key}:expire")
}

/// Distributed refresh lock of an id-list.
pub fn lock_key(list_key: &str) -> String {
    format!("{list_key}:lock")
}

/// Pointer naming the temp list of the refresh in flight.
pub fn temp_pointer_key(list_key: &str) -> String {
    format!("{list_key}:temp")
}

pub fn temp_list_key(list_key: &str, rid: &str) -> String {
    format!("{list_key}:temp:{rid}")
}

/// Name a list is moved to before it is drained in the background.
pub fn retired_key(list_key: &str, rid: &str) -> String {
    format!("{}-old", temp_list_key(list_key, rid))
}
