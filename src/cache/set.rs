//! The set of resource caches a process serves.
//!
//! Built once at startup and passed to every call site; there is no global
//! registry of caches.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::application::cond_store::{CondQuery, FullSyncCondStore};
use crate::application::pagination::PageRequest;
use crate::application::source::{ResourceSource, UniqueKeyResolver};
use crate::domain::resource::{JitterRange, ResourceType};
use crate::domain::tenant::Scope;
use crate::infra::kv::KvStore;

use super::config::CacheConfig;
use super::context::CacheContext;
use super::error::CacheError;
use super::events::{self, ChangeEvent, CondEvent, EventQueue};
use super::full_sync_cond::FullSyncCondService;
use super::id_list::RefreshOutcome;
use super::keys::KeyScheme;
use super::lock::RefreshingLock;
use super::registry::{FullSyncCondRegistry, ListLayout, WatchScope};
use super::resource::{ListDetailPage, ResourceCache};

const CHANGE_QUEUE: &str = "change";
const COND_QUEUE: &str = "cond";

/// One resource type with the capabilities that back it.
pub struct ResourceRegistration {
    resource: ResourceType,
    source: Arc<dyn ResourceSource>,
    unique_keys: Vec<Arc<dyn UniqueKeyResolver>>,
}

impl ResourceRegistration {
    pub fn new(resource: ResourceType, source: Arc<dyn ResourceSource>) -> Self {
        Self {
            resource,
            source,
            unique_keys: Vec::new(),
        }
    }

    pub fn with_unique_key(mut self, resolver: Arc<dyn UniqueKeyResolver>) -> Self {
        self.unique_keys.push(resolver);
        self
    }
}

pub struct CacheSetBuilder {
    kv: Arc<dyn KvStore>,
    config: CacheConfig,
    registrations: Vec<ResourceRegistration>,
}

impl CacheSetBuilder {
    pub fn new(kv: Arc<dyn KvStore>, config: CacheConfig) -> Self {
        Self {
            kv,
            config,
            registrations: Vec::new(),
        }
    }

    pub fn register(mut self, registration: ResourceRegistration) -> Self {
        self.registrations.push(registration);
        self
    }

    pub fn build(self) -> Result<CacheSet, CacheError> {
        let config = Arc::new(self.config);
        let lock = Arc::new(RefreshingLock::new());

        let mut resources = Vec::with_capacity(self.registrations.len());
        let mut schemes = HashMap::new();
        for registration in self.registrations {
            let resource = apply_override(registration.resource, &config)?;
            let keys = Arc::new(KeyScheme::new(&resource));
            let layout = ListLayout {
                keys: Arc::clone(&keys),
                jitter: resource.jitter(),
            };
            if schemes.insert(resource.name().to_string(), layout).is_some()
            {
                return Err(CacheError::validation(format!(
                    "resource `{}` is registered twice",
                    resource.name()
                )));
            }
            resources.push((resource, keys, registration.source, registration.unique_keys));
        }

        let registry = Arc::new(FullSyncCondRegistry::new(
            schemes,
            Arc::clone(&self.kv),
            Arc::clone(&config),
        ));

        let mut caches = HashMap::with_capacity(resources.len());
        for (resource, keys, source, unique_keys) in resources {
            let ctx = CacheContext {
                resource: Arc::new(resource),
                keys,
                kv: Arc::clone(&self.kv),
                source,
                unique_keys: Arc::new(unique_keys),
                lock: Arc::clone(&lock),
                config: Arc::clone(&config),
            };
            let cache = ResourceCache::new(ctx, Arc::clone(&registry));
            info!(
                resource = cache.name(),
                ttl_secs = cache.resource().ttl().as_secs(),
                cache_all = cache.resource().cache_all(),
                "Resource cache registered"
            );
            caches.insert(cache.name().to_string(), Arc::new(cache));
        }

        Ok(CacheSet {
            caches,
            registry,
            config,
        })
    }
}

fn apply_override(resource: ResourceType, config: &CacheConfig) -> Result<ResourceType, CacheError> {
    let Some(over) = config.resources.get(resource.name()) else {
        return Ok(resource);
    };

    let mut resource = resource;
    if let Some(ttl) = over.ttl_secs {
        resource = resource.with_ttl(Duration::from_secs(ttl));
    }
    if over.jitter_min_secs.is_some() || over.jitter_max_secs.is_some() {
        let current = resource.jitter();
        let min = over
            .jitter_min_secs
            .map_or(current.min(), Duration::from_secs);
        let max = over
            .jitter_max_secs
            .map_or(current.max(), Duration::from_secs);
        resource = resource.with_jitter(JitterRange::new(min, max)?);
    }
    Ok(resource)
}

/// Page a full-sync condition's id-list.
#[derive(Debug, Clone)]
pub struct ListCacheByFullSyncCond {
    pub cond_id: i64,
    pub page: PageRequest,
    pub fields: Vec<String>,
    pub scope: Scope,
    pub with_count: bool,
}

impl ListCacheByFullSyncCond {
    pub fn new(cond_id: i64, page: PageRequest, scope: Scope) -> Self {
        Self {
            cond_id,
            page,
            fields: Vec::new(),
            scope,
            with_count: false,
        }
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_count(mut self) -> Self {
        self.with_count = true;
        self
    }
}

pub struct CacheSet {
    caches: HashMap<String, Arc<ResourceCache>>,
    registry: Arc<FullSyncCondRegistry>,
    config: Arc<CacheConfig>,
}

impl CacheSet {
    pub fn builder(kv: Arc<dyn KvStore>, config: CacheConfig) -> CacheSetBuilder {
        CacheSetBuilder::new(kv, config)
    }

    pub fn cache(&self, resource: &str) -> Result<&Arc<ResourceCache>, CacheError> {
        self.caches
            .get(resource)
            .ok_or_else(|| CacheError::not_found("resource", resource))
    }

    /// Registered resource names, sorted.
    pub fn resources(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.caches.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn registry(&self) -> &Arc<FullSyncCondRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Management of persisted full-sync conditions against `store`.
    pub fn cond_service(&self, store: Arc<dyn FullSyncCondStore>) -> FullSyncCondService {
        let resources = self
            .caches
            .iter()
            .map(|(name, cache)| (name.clone(), Arc::new(cache.resource().clone())))
            .collect();
        FullSyncCondService::new(store, resources, Arc::clone(&self.config))
    }

    pub async fn list_detail_by_full_sync_cond(
        &self,
        opts: &ListCacheByFullSyncCond,
    ) -> Result<ListDetailPage, CacheError> {
        let cond = self
            .registry
            .get(opts.cond_id)
            .filter(|cond| opts.scope.can_see(&cond.tenant))
            .ok_or_else(|| CacheError::not_found("full sync cond", opts.cond_id.to_string()))?;
        let cache = self.cache(&cond.resource)?;
        cache
            .serve(
                &cond.list_spec(),
                &opts.page,
                &opts.fields,
                &opts.scope,
                opts.with_count,
            )
            .await
    }

    /// Rebuild a full-sync condition's id-list in the background.
    pub async fn refresh_full_sync_cond_list(&self, cond_id: i64) -> Result<RefreshOutcome, CacheError> {
        let cond = self
            .registry
            .get(cond_id)
            .ok_or_else(|| CacheError::not_found("full sync cond", cond_id.to_string()))?;
        let cache = self.cache(&cond.resource)?;
        cache.id_lists().try_refresh(cond.list_spec()).await
    }

    /// Tenants and sub-resources the change feed of `resource` must deliver.
    pub fn watch_scope(&self, resource: &str) -> Result<WatchScope, CacheError> {
        let cache = self.cache(resource)?;
        Ok(self
            .registry
            .watch_scope(resource, cache.resource().cache_all()))
    }

    /// Changes whenever the set of full-sync conditions changes, meaning
    /// watch scopes should be recomputed.
    pub fn subscribe_scope_changes(&self) -> watch::Receiver<u64> {
        self.registry.subscribe()
    }

    pub async fn apply_cond_events(&self, events: Vec<CondEvent>) {
        self.registry.apply(events).await;
    }

    /// Load every persisted condition as the registry's startup snapshot.
    pub async fn init_conditions(&self, store: &dyn FullSyncCondStore) -> Result<usize, CacheError> {
        let conds = store.find(&CondQuery::default()).await?;
        let count = conds.len();
        self.registry.apply(vec![CondEvent::Init(conds)]).await;
        Ok(count)
    }

    /// Start ingesting `resource`'s change feed. The returned queue is the
    /// producer side for the external watcher.
    pub fn spawn_change_consumer(
        &self,
        resource: &str,
    ) -> Result<(EventQueue<ChangeEvent>, JoinHandle<()>), CacheError> {
        let ingestor = self.cache(resource)?.ingestor();
        let (queue, receiver) = events::channel(CHANGE_QUEUE, self.config.change_queue_capacity);
        let batch_limit = self.config.change_batch_limit;
        let handle = tokio::spawn(ingestor.run(receiver, batch_limit));
        Ok((queue, handle))
    }

    /// Start applying the condition feed.
    pub fn spawn_cond_consumer(&self) -> (EventQueue<CondEvent>, JoinHandle<()>) {
        let (queue, receiver) = events::channel(COND_QUEUE, self.config.cond_queue_capacity);
        let registry = Arc::clone(&self.registry);
        let batch_limit = self.config.change_batch_limit;
        let handle = tokio::spawn(registry.run(receiver, batch_limit));
        (queue, handle)
    }
}
