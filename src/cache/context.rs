//! Collaborators shared by the parts of one resource cache.

use std::sync::Arc;
use std::time::Duration;

use crate::application::source::{ResourceSource, TenantFilter, UniqueKeyResolver};
use crate::domain::resource::{BasicInfo, ResourceType};
use crate::infra::kv::KvStore;

use super::config::CacheConfig;
use super::id_list::IdListSpec;
use super::keys::{IdListKind, KeyScheme};
use super::lock::RefreshingLock;

#[derive(Clone)]
pub(crate) struct CacheContext {
    pub resource: Arc<ResourceType>,
    pub keys: Arc<KeyScheme>,
    pub kv: Arc<dyn KvStore>,
    pub source: Arc<dyn ResourceSource>,
    pub unique_keys: Arc<Vec<Arc<dyn UniqueKeyResolver>>>,
    pub lock: Arc<RefreshingLock>,
    pub config: Arc<CacheConfig>,
}

impl CacheContext {
    pub fn name(&self) -> &str {
        self.resource.name()
    }

    /// TTL of a detail, unique-key or negative entry.
    pub fn entry_ttl(&self) -> Duration {
        self.resource.jittered(self.resource.ttl())
    }

    pub fn resolver(&self, key_type: &str) -> Option<&Arc<dyn UniqueKeyResolver>> {
        self.unique_keys
            .iter()
            .find(|resolver| resolver.key_type() == key_type)
    }

    /// The system id-list of every record `tenant` owns.
    pub fn system_list(&self, sub_res: Option<&str>, tenant: &str) -> IdListSpec {
        let sub_res = sub_res.filter(|sub| !sub.is_empty()).map(str::to_string);
        IdListSpec {
            key: self.keys.id_list_key(&IdListKind::System {
                sub_res: sub_res.clone(),
                tenant: tenant.to_string(),
            }),
            ttl: self.resource.ttl(),
            sub_res,
            tenant: TenantFilter::Owner(tenant.to_string()),
            condition: None,
        }
    }

    /// Sub-resources a record is stored under: each one it belongs to, or
    /// none for resource types without sub-resources.
    pub fn storage_subs(&self, info: &BasicInfo) -> Vec<Option<String>> {
        if self.resource.has_sub_resource() {
            info.sub_res.iter().cloned().map(Some).collect()
        } else {
            vec![None]
        }
    }
}
