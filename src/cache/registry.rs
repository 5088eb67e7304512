//! In-memory registry of full-sync conditions.
//!
//! Fed by the condition event stream. Readers get immutable snapshots; the
//! single consumer task is the only writer. Every applied batch bumps a
//! generation on a watch channel so the change feed can re-derive its scope.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::application::source::TenantFilter;
use crate::domain::filter::{ExprLimits, Expression};
use crate::domain::full_sync_cond::FullSyncCond;
use crate::domain::resource::{BasicInfo, JitterRange};
use crate::domain::tenant::{DEFAULT_TENANT, is_default_tenant, is_super_tenant};
use crate::infra::kv::{KvStore, Pipeline};

use super::config::CacheConfig;
use super::error::CacheError;
use super::events::{CondEvent, Envelope, EventReceiver};
use super::id_list::{IdListSpec, retire_list};
use super::keys::{IdListKind, KeyScheme, expire_key};
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::registry";

/// A materialized condition as the cache sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct FullSyncCondInfo {
    pub id: i64,
    pub resource: String,
    pub sub_resource: Option<String>,
    pub is_all: bool,
    pub ttl: Duration,
    pub condition: Option<Expression>,
    pub tenant: String,
    /// Id-list holding the matching records.
    pub list_key: String,
}

impl FullSyncCondInfo {
    fn new(cond: &FullSyncCond, keys: &KeyScheme) -> Self {
        Self {
            id: cond.id,
            resource: cond.resource.clone(),
            sub_resource: cond.sub_resource.clone(),
            is_all: cond.is_all,
            ttl: cond.ttl(),
            condition: if cond.is_all { None } else { cond.condition.clone() },
            tenant: cond.tenant.clone(),
            list_key: keys.id_list_key(&IdListKind::Condition { cond_id: cond.id }),
        }
    }

    /// Whether `record` belongs in this condition's id-list.
    pub fn matches(&self, info: &BasicInfo, record: &Value) -> bool {
        if !is_super_tenant(&self.tenant)
            && !is_default_tenant(&info.tenant)
            && info.tenant != self.tenant
        {
            return false;
        }
        if let Some(sub) = &self.sub_resource {
            if !info.sub_res.iter().any(|owned| owned == sub) {
                return false;
            }
        }
        if self.is_all {
            return true;
        }

        let Some(condition) = &self.condition else {
            return false;
        };
        condition.matches(record).unwrap_or_else(|err| {
            warn!(cond_id = self.id, error = %err, "Condition cannot be evaluated on record");
            false
        })
    }

    pub(crate) fn list_spec(&self) -> IdListSpec {
        IdListSpec {
            key: self.list_key.clone(),
            ttl: self.ttl,
            sub_res: self.sub_resource.clone(),
            tenant: TenantFilter::for_condition(&self.tenant),
            condition: self.condition.clone(),
        }
    }
}

/// Tenants and sub-resources whose changes affect any materialized list of a
/// resource type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchScope {
    pub all_tenants: bool,
    pub tenants: BTreeSet<String>,
    pub all_sub_resources: bool,
    pub sub_resources: BTreeSet<String>,
}

impl WatchScope {
    pub fn everything() -> Self {
        Self {
            all_tenants: true,
            all_sub_resources: true,
            ..Self::default()
        }
    }

    /// Nothing needs to be watched.
    pub fn is_empty(&self) -> bool {
        !self.all_tenants && self.tenants.is_empty()
    }

    pub fn covers(&self, tenant: &str, sub_res: &[String]) -> bool {
        let tenant_ok = self.all_tenants || self.tenants.contains(tenant);
        let sub_ok = self.all_sub_resources
            || sub_res.is_empty()
            || sub_res.iter().any(|sub| self.sub_resources.contains(sub));
        tenant_ok && sub_ok
    }
}

type CondMap = HashMap<String, HashMap<String, Arc<FullSyncCondInfo>>>;

/// Key layout and TTL jitter of one registered resource type.
#[derive(Debug, Clone)]
pub(crate) struct ListLayout {
    pub keys: Arc<KeyScheme>,
    pub jitter: JitterRange,
}

pub struct FullSyncCondRegistry {
    schemes: HashMap<String, ListLayout>,
    conds: RwLock<CondMap>,
    kv: Arc<dyn KvStore>,
    config: Arc<CacheConfig>,
    limits: ExprLimits,
    generation: watch::Sender<u64>,
}

impl FullSyncCondRegistry {
    pub(crate) fn new(
        schemes: HashMap<String, ListLayout>,
        kv: Arc<dyn KvStore>,
        config: Arc<CacheConfig>,
    ) -> Self {
        Self {
            schemes,
            conds: RwLock::new(HashMap::new()),
            kv,
            config,
            limits: ExprLimits::default(),
            generation: watch::channel(0).0,
        }
    }

    /// Conditions of one resource type.
    pub fn snapshot(&self, resource: &str) -> Vec<Arc<FullSyncCondInfo>> {
        let conds = rw_read(&self.conds, SOURCE, "snapshot");
        conds
            .get(resource)
            .map(|by_key| by_key.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, cond_id: i64) -> Option<Arc<FullSyncCondInfo>> {
        let conds = rw_read(&self.conds, SOURCE, "get");
        conds
            .values()
            .flat_map(HashMap::values)
            .find(|cond| cond.id == cond_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        let conds = rw_read(&self.conds, SOURCE, "len");
        conds.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Receiver that changes whenever a batch of condition events is applied.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// What the change feed of `resource` must deliver.
    pub fn watch_scope(&self, resource: &str, cache_all: bool) -> WatchScope {
        if cache_all {
            return WatchScope::everything();
        }

        let mut scope = WatchScope::default();
        for cond in self.snapshot(resource) {
            if is_super_tenant(&cond.tenant) {
                scope.all_tenants = true;
            } else {
                scope.tenants.insert(cond.tenant.clone());
                scope.tenants.insert(DEFAULT_TENANT.to_string());
            }
            match &cond.sub_resource {
                Some(sub) => {
                    scope.sub_resources.insert(sub.clone());
                }
                None => scope.all_sub_resources = true,
            }
        }
        scope
    }

    /// Apply a batch of condition events in order.
    pub async fn apply(&self, events: Vec<CondEvent>) {
        for event in events {
            match event {
                CondEvent::Init(conds) => self.init(conds),
                CondEvent::Upsert(conds) => {
                    for cond in conds {
                        self.upsert(cond).await;
                    }
                }
                CondEvent::Delete(conds) => {
                    for cond in conds {
                        self.delete(&cond);
                    }
                }
            }
        }
        self.generation.send_modify(|generation| *generation += 1);
    }

    /// Consume the condition queue until every producer is gone.
    pub async fn run(self: Arc<Self>, mut receiver: EventReceiver<CondEvent>, batch_limit: usize) {
        loop {
            let batch = receiver.next_batch(batch_limit).await;
            if batch.is_empty() {
                info!("Condition event queue closed, registry consumer stopping");
                return;
            }
            debug!(event_count = batch.len(), "Applying condition events");
            self.apply(batch.into_iter().map(|Envelope { payload, .. }| payload).collect())
                .await;
        }
    }

    fn init(&self, conds: Vec<FullSyncCond>) {
        let mut fresh: CondMap = HashMap::new();
        for cond in &conds {
            if let Some(info) = self.admit(cond) {
                fresh
                    .entry(info.resource.clone())
                    .or_default()
                    .insert(info.list_key.clone(), Arc::new(info));
            }
        }

        let dropped: Vec<Arc<FullSyncCondInfo>> = {
            let mut current = rw_write(&self.conds, SOURCE, "init");
            let previous = std::mem::replace(&mut *current, fresh);
            previous
                .into_iter()
                .flat_map(|(resource, by_key)| {
                    let kept = current.get(&resource).cloned().unwrap_or_default();
                    by_key
                        .into_iter()
                        .filter(move |(key, _)| !kept.contains_key(key))
                        .map(|(_, cond)| cond)
                })
                .collect()
        };

        info!(count = self.len(), dropped = dropped.len(), "Full sync conditions initialized");
        for cond in dropped {
            self.spawn_teardown(cond);
        }
    }

    async fn upsert(&self, cond: FullSyncCond) {
        let Some(info) = self.admit(&cond) else {
            return;
        };

        let existing = {
            let mut conds = rw_write(&self.conds, SOURCE, "upsert");
            let by_key = conds.entry(info.resource.clone()).or_default();
            match by_key.get(&info.list_key) {
                Some(existing) if existing.ttl == info.ttl => return,
                Some(existing) => {
                    let updated = Arc::new(FullSyncCondInfo {
                        ttl: info.ttl,
                        ..(**existing).clone()
                    });
                    by_key.insert(info.list_key.clone(), Arc::clone(&updated));
                    Some(updated)
                }
                None => {
                    by_key.insert(info.list_key.clone(), Arc::new(info.clone()));
                    None
                }
            }
        };

        let Some(updated) = existing else {
            debug!(cond_id = info.id, resource = %info.resource, "Full sync cond added");
            return;
        };

        let kv = Arc::clone(&self.kv);
        let list_key = updated.list_key.clone();
        let ttl = updated.ttl;
        let jitter = self
            .schemes
            .get(&updated.resource)
            .map(|layout| layout.jitter)
            .unwrap_or_else(JitterRange::none);
        let result = with_retry(&self.config, "update_ttl", updated.id, || {
            let kv = Arc::clone(&kv);
            let list_key = list_key.clone();
            async move {
                let mut pipeline = Pipeline::new();
                pipeline
                    .expire(&list_key, jitter.apply(ttl * 2))
                    .expire(expire_key(&list_key), jitter.apply(ttl));
                kv.exec(pipeline).await?;
                Ok(())
            }
        })
        .await;
        match result {
            Ok(()) => info!(cond_id = updated.id, ttl_secs = ttl.as_secs(), "Full sync cond TTL updated"),
            Err(err) => warn!(cond_id = updated.id, error = %err, "Giving up on full sync cond TTL update"),
        }
    }

    fn delete(&self, cond: &FullSyncCond) {
        let Some(layout) = self.schemes.get(&cond.resource) else {
            return;
        };
        let list_key = layout.keys.id_list_key(&IdListKind::Condition { cond_id: cond.id });
        let removed = {
            let mut conds = rw_write(&self.conds, SOURCE, "delete");
            conds
                .get_mut(&cond.resource)
                .and_then(|by_key| by_key.remove(&list_key))
        };
        match removed {
            Some(removed) => {
                debug!(cond_id = cond.id, resource = %cond.resource, "Full sync cond removed");
                self.spawn_teardown(removed);
            }
            None => debug!(cond_id = cond.id, "Deleted full sync cond was not registered"),
        }
    }

    fn admit(&self, cond: &FullSyncCond) -> Option<FullSyncCondInfo> {
        let Some(layout) = self.schemes.get(&cond.resource) else {
            warn!(cond_id = cond.id, resource = %cond.resource, "Full sync cond for unknown resource, ignoring");
            return None;
        };
        if let Err(err) = cond.check_shape(&self.limits) {
            warn!(cond_id = cond.id, error = %err, "Invalid full sync cond, ignoring");
            return None;
        }
        Some(FullSyncCondInfo::new(cond, &layout.keys))
    }

    /// Drop a removed condition's id-list in the background.
    fn spawn_teardown(&self, cond: Arc<FullSyncCondInfo>) {
        let kv = Arc::clone(&self.kv);
        let config = Arc::clone(&self.config);
        tokio::spawn(async move {
            let result = with_retry(&config, "teardown", cond.id, || {
                let kv = Arc::clone(&kv);
                let config = Arc::clone(&config);
                let list_key = cond.list_key.clone();
                async move { retire_list(&kv, &config, &list_key).await }
            })
            .await;
            match result {
                Ok(()) => debug!(cond_id = cond.id, "Full sync cond id-list retired"),
                Err(err) => warn!(cond_id = cond.id, error = %err, "Giving up on full sync cond teardown"),
            }
        });
    }
}

async fn with_retry<F, Fut>(
    config: &CacheConfig,
    op: &'static str,
    cond_id: i64,
    mut attempt_fn: F,
) -> Result<(), CacheError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), CacheError>>,
{
    let attempts = config.cond_retry_attempts.max(1);
    let mut attempt = 1;
    loop {
        match attempt_fn().await {
            Ok(()) => return Ok(()),
            Err(err) if attempt < attempts => {
                warn!(op, cond_id, attempt, error = %err, "Full sync cond store operation failed, retrying");
                tokio::time::sleep(config.cond_retry_backoff(attempt)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::domain::filter::Operator;
    use crate::domain::resource::{IdKind, ResourceType};
    use crate::domain::tenant::SUPER_TENANT;
    use crate::infra::kv::MemoryKvStore;

    fn registry() -> (FullSyncCondRegistry, Arc<MemoryKvStore>) {
        let kv = Arc::new(MemoryKvStore::new());
        let jitter = JitterRange::new(Duration::from_secs(60), Duration::from_secs(90))
            .expect("valid jitter");
        let host = ResourceType::new("host", IdKind::Numeric).with_jitter(jitter);
        let layout = ListLayout {
            keys: Arc::new(KeyScheme::new(&host)),
            jitter: host.jitter(),
        };
        let schemes = HashMap::from([("host".to_string(), layout)]);
        let registry = FullSyncCondRegistry::new(
            schemes,
            kv.clone() as Arc<dyn KvStore>,
            Arc::new(CacheConfig::without_pauses()),
        );
        (registry, kv)
    }

    fn cond(id: i64, tenant: &str, interval: u32) -> FullSyncCond {
        FullSyncCond {
            id,
            resource: "host".into(),
            sub_resource: None,
            is_all: false,
            interval,
            condition: Some(Expression::atom("cloud_id", Operator::Equal, 0)),
            tenant: tenant.into(),
        }
    }

    fn info(tenant: &str) -> BasicInfo {
        BasicInfo {
            id: 1,
            tenant: tenant.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn upsert_then_delete_tracks_conditions() {
        let (registry, _) = registry();
        let mut changes = registry.subscribe();

        registry.apply(vec![CondEvent::Upsert(vec![cond(1, "t1", 6)])]).await;
        assert!(changes.has_changed().expect("sender alive"));
        changes.mark_unchanged();

        let stored = registry.get(1).expect("registered");
        assert_eq!(stored.list_key, "rescache:host:cond:1:id_list");
        assert_eq!(stored.ttl, Duration::from_secs(6 * 3600));

        registry.apply(vec![CondEvent::Delete(vec![cond(1, "t1", 6)])]).await;
        assert!(registry.get(1).is_none());
        assert!(changes.has_changed().expect("sender alive"));
    }

    #[tokio::test]
    async fn upsert_of_existing_only_changes_ttl() {
        let (registry, kv) = registry();
        registry.apply(vec![CondEvent::Upsert(vec![cond(1, "t1", 6)])]).await;
        kv.set("rescache:host:cond:1:id_list:expire", "1", None)
            .await
            .expect("set");

        let mut changed = cond(1, "other", 12);
        changed.condition = None;
        changed.is_all = true;
        registry.apply(vec![CondEvent::Upsert(vec![changed])]).await;

        let stored = registry.get(1).expect("registered");
        assert_eq!(stored.ttl, Duration::from_secs(12 * 3600));
        assert_eq!(stored.tenant, "t1");
        assert!(!stored.is_all);
        let marker_ttl = kv.ttl("rescache:host:cond:1:id_list:expire").expect("ttl set");
        assert!(marker_ttl > Duration::from_secs(12 * 3600 + 30));
        assert!(marker_ttl <= Duration::from_secs(12 * 3600 + 90));
    }

    #[tokio::test]
    async fn invalid_and_unknown_conditions_are_ignored() {
        let (registry, _) = registry();
        let mut unknown = cond(1, "t1", 6);
        unknown.resource = "biz".into();
        let bad_interval = cond(2, "t1", 1);
        let mut no_condition = cond(3, "t1", 6);
        no_condition.condition = None;

        registry
            .apply(vec![CondEvent::Upsert(vec![unknown, bad_interval, no_condition])])
            .await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn init_replaces_registered_conditions() {
        let (registry, _) = registry();
        registry
            .apply(vec![CondEvent::Upsert(vec![cond(1, "t1", 6), cond(2, "t2", 6)])])
            .await;
        registry.apply(vec![CondEvent::Init(vec![cond(3, "t3", 6)])]).await;

        assert!(registry.get(1).is_none());
        assert!(registry.get(2).is_none());
        assert!(registry.get(3).is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn matching_checks_tenant_then_expression() {
        let (registry, _) = registry();
        let keys = registry.schemes["host"].keys.clone();
        let cond = FullSyncCondInfo::new(&cond(1, "t1", 6), &keys);

        assert!(cond.matches(&info("t1"), &json!({"cloud_id": 0})));
        assert!(cond.matches(&info(DEFAULT_TENANT), &json!({"cloud_id": 0})));
        assert!(!cond.matches(&info("t2"), &json!({"cloud_id": 0})));
        assert!(!cond.matches(&info("t1"), &json!({"cloud_id": 2})));
    }

    #[test]
    fn sub_resource_conditions_need_membership() {
        let (registry, _) = registry();
        let keys = registry.schemes["host"].keys.clone();
        let mut scoped = cond(1, SUPER_TENANT, 6);
        scoped.sub_resource = Some("bk_switch".into());
        scoped.is_all = true;
        let scoped = FullSyncCondInfo::new(&scoped, &keys);

        let mut member = info("t9");
        member.sub_res = vec!["bk_switch".into()];
        assert!(scoped.matches(&member, &json!({})));
        assert!(!scoped.matches(&info("t9"), &json!({})));
    }

    #[tokio::test]
    async fn watch_scope_follows_conditions() {
        let (registry, _) = registry();
        assert!(registry.watch_scope("host", false).is_empty());
        assert_eq!(registry.watch_scope("host", true), WatchScope::everything());

        registry.apply(vec![CondEvent::Upsert(vec![cond(1, "t1", 6)])]).await;
        let scope = registry.watch_scope("host", false);
        assert!(!scope.all_tenants);
        assert!(scope.tenants.contains("t1"));
        assert!(scope.tenants.contains(DEFAULT_TENANT));
        assert!(scope.covers("t1", &[]));
        assert!(!scope.covers("t2", &[]));

        registry
            .apply(vec![CondEvent::Upsert(vec![cond(2, SUPER_TENANT, 6)])])
            .await;
        assert!(registry.watch_scope("host", false).all_tenants);
    }
}
