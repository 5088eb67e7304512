#![allow(dead_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rescache::application::source::{
    ListPage, ListRequest, ResourceSource, SourceError, UniqueKeyResolver,
};
use rescache::cache::{CacheConfig, CacheSet, ResourceCache, ResourceRegistration};
use rescache::domain::resource::{BasicInfo, IdKind, JitterRange, ResourceType};
use rescache::infra::kv::{KvError, KvStore, MemoryKvStore, Pipeline, Reply, ScoredMember};
use serde_json::{Value, json};
use tokio::sync::{Notify, Semaphore};

pub const IP_CLOUD: &str = "ip_cloud";
pub const INSTANCE_NAME: &str = "name";

pub fn host(id: i64, ip: &str, cloud_id: i64, tenant: &str) -> Value {
    json!({
        "id": id,
        "name": format!("host-{id}"),
        "ip": ip,
        "cloud_id": cloud_id,
        "tenant_id": tenant,
    })
}

/// Hosts cached with every owner's system id-list.
pub fn host_resource() -> ResourceType {
    ResourceType::new("host", IdKind::Numeric)
        .with_jitter(JitterRange::none())
        .caching_all()
}

/// Hosts materialized only through full-sync conditions.
pub fn partial_host_resource() -> ResourceType {
    ResourceType::new("host", IdKind::Numeric).with_jitter(JitterRange::none())
}

/// Holds every `list` call of a source until released.
pub struct ListGate {
    pub entered: Notify,
    pub release: Semaphore,
}

impl ListGate {
    pub fn closed() -> Arc<Self> {
        Arc::new(Self {
            entered: Notify::new(),
            release: Semaphore::new(0),
        })
    }

    pub fn open(&self) {
        self.release.add_permits(1);
    }
}

/// Primary store stand-in holding hosts by id.
#[derive(Default)]
pub struct HostSource {
    records: Mutex<BTreeMap<i64, Value>>,
    get_calls: AtomicUsize,
    list_calls: AtomicUsize,
    fetched: Mutex<Vec<Vec<String>>>,
    fetch_delay: Duration,
    gate: Option<Arc<ListGate>>,
}

impl HostSource {
    pub fn new<I: IntoIterator<Item = Value>>(records: I) -> Self {
        let source = Self::default();
        for record in records {
            source.put(record);
        }
        source
    }

    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = delay;
        self
    }

    pub fn with_gate(mut self, gate: Arc<ListGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn put(&self, record: Value) {
        let id = record["id"].as_i64().expect("host id");
        self.records.lock().expect("records").insert(id, record);
    }

    pub fn remove(&self, id: i64) {
        self.records.lock().expect("records").remove(&id);
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn last_fetch(&self) -> Vec<String> {
        self.fetched
            .lock()
            .expect("fetched")
            .last()
            .cloned()
            .unwrap_or_default()
    }

    fn snapshot(&self) -> Vec<Value> {
        self.records.lock().expect("records").values().cloned().collect()
    }
}

fn tenant_of(record: &Value) -> String {
    record["tenant_id"].as_str().unwrap_or("0").to_string()
}

#[async_trait]
impl ResourceSource for HostSource {
    fn parse(&self, record: &Value) -> Result<BasicInfo, SourceError> {
        let id = record["id"]
            .as_i64()
            .ok_or_else(|| SourceError::parse("host without id"))?;
        Ok(BasicInfo {
            id,
            oid: String::new(),
            sub_res: Vec::new(),
            tenant: tenant_of(record),
        })
    }

    async fn get_by_keys(
        &self,
        _sub_res: Option<&str>,
        id_keys: &[String],
    ) -> Result<Vec<Value>, SourceError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.fetched.lock().expect("fetched").push(id_keys.to_vec());
        if !self.fetch_delay.is_zero() {
            tokio::time::sleep(self.fetch_delay).await;
        }

        let records = self.records.lock().expect("records");
        Ok(id_keys
            .iter()
            .filter_map(|key| key.parse::<i64>().ok())
            .filter_map(|id| records.get(&id).cloned())
            .collect())
    }

    async fn list(&self, request: &ListRequest) -> Result<ListPage, SourceError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let after = request
            .page
            .cursor
            .as_deref()
            .map(|cursor| cursor.parse::<i64>().map_err(|err| SourceError::query(err.to_string())))
            .transpose()?;

        let matching: Vec<Value> = self
            .snapshot()
            .into_iter()
            .filter(|record| request.tenant.admits(&tenant_of(record)))
            .filter(|record| {
                request
                    .condition
                    .as_ref()
                    .is_none_or(|condition| condition.matches(record).unwrap_or(false))
            })
            .collect();

        if let Some(gate) = &self.gate {
            gate.entered.notify_one();
            gate.release
                .acquire()
                .await
                .map_err(|err| SourceError::query(err.to_string()))?
                .forget();
        }

        let count = request.with_count.then_some(matching.len() as u64);
        let records = matching
            .into_iter()
            .filter(|record| after.is_none_or(|after| record["id"].as_i64().unwrap_or(0) > after))
            .skip(request.page.offset)
            .take(request.page.limit)
            .map(|record| {
                if request.only_ids {
                    json!({"id": record["id"], "tenant_id": record["tenant_id"]})
                } else {
                    record
                }
            })
            .collect();
        Ok(ListPage { count, records })
    }
}

/// Resolves hosts by `"{ip}:{cloud_id}"`.
pub struct IpCloudKey {
    source: Arc<HostSource>,
    pub calls: AtomicUsize,
}

impl IpCloudKey {
    pub fn new(source: Arc<HostSource>) -> Self {
        Self {
            source,
            calls: AtomicUsize::new(0),
        }
    }
}

fn ip_cloud(record: &Value) -> Option<String> {
    let ip = record["ip"].as_str()?;
    let cloud_id = record["cloud_id"].as_i64()?;
    Some(format!("{ip}:{cloud_id}"))
}

#[async_trait]
impl UniqueKeyResolver for IpCloudKey {
    fn key_type(&self) -> &str {
        IP_CLOUD
    }

    fn derive_keys(&self, record: &Value, _info: &BasicInfo) -> Result<Vec<String>, SourceError> {
        Ok(ip_cloud(record).into_iter().collect())
    }

    async fn get_by_unique_keys(&self, keys: &[String]) -> Result<Vec<Value>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .source
            .snapshot()
            .into_iter()
            .filter(|record| ip_cloud(record).is_some_and(|key| keys.contains(&key)))
            .collect())
    }
}

pub struct Harness {
    pub set: CacheSet,
    pub kv: Arc<MemoryKvStore>,
    pub source: Arc<HostSource>,
    pub unique: Arc<IpCloudKey>,
}

impl Harness {
    pub fn new(source: HostSource, resource: ResourceType) -> Self {
        Self::with_config(source, resource, CacheConfig::without_pauses())
    }

    pub fn with_config(source: HostSource, resource: ResourceType, config: CacheConfig) -> Self {
        let kv = Arc::new(MemoryKvStore::new());
        Self::assemble(source, resource, config, kv.clone(), kv)
    }

    /// Cache set talking to `store`, which is backed by `kv`.
    pub fn with_store(
        source: HostSource,
        resource: ResourceType,
        kv: Arc<MemoryKvStore>,
        store: Arc<dyn KvStore>,
    ) -> Self {
        Self::assemble(source, resource, CacheConfig::without_pauses(), kv, store)
    }

    fn assemble(
        source: HostSource,
        resource: ResourceType,
        config: CacheConfig,
        kv: Arc<MemoryKvStore>,
        store: Arc<dyn KvStore>,
    ) -> Self {
        let source = Arc::new(source);
        let unique = Arc::new(IpCloudKey::new(Arc::clone(&source)));
        let set = CacheSet::builder(store, config)
            .register(
                ResourceRegistration::new(resource, source.clone())
                    .with_unique_key(unique.clone()),
            )
            .build()
            .expect("cache set should build");
        Self {
            set,
            kv,
            source,
            unique,
        }
    }
}

/// Instance of object models, keyed by an opaque oid.
pub fn instance(oid: &str, models: &[&str], tenant: &str) -> Value {
    json!({
        "oid": oid,
        "name": format!("inst-{oid}"),
        "models": models,
        "tenant_id": tenant,
    })
}

/// Instances partitioned by model, with every owner's id-list per model.
pub fn instance_resource() -> ResourceType {
    ResourceType::new("instance", IdKind::Opaque)
        .with_sub_resource()
        .with_jitter(JitterRange::none())
        .caching_all()
}

fn models_of(record: &Value) -> Vec<String> {
    record["models"]
        .as_array()
        .map(|models| {
            models
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn in_model(record: &Value, sub_res: Option<&str>) -> bool {
    sub_res.is_none_or(|model| models_of(record).iter().any(|owned| owned == model))
}

/// Primary store stand-in holding instances by oid, in oid order.
#[derive(Default)]
pub struct InstanceSource {
    records: Mutex<BTreeMap<String, Value>>,
    list_calls: AtomicUsize,
    resolver_calls: AtomicUsize,
}

impl InstanceSource {
    pub fn new<I: IntoIterator<Item = Value>>(records: I) -> Self {
        let source = Self::default();
        for record in records {
            source.put(record);
        }
        source
    }

    pub fn put(&self, record: Value) {
        let oid = record["oid"].as_str().expect("instance oid").to_string();
        self.records.lock().expect("records").insert(oid, record);
    }

    pub fn remove(&self, oid: &str) {
        self.records.lock().expect("records").remove(oid);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn resolver_calls(&self) -> usize {
        self.resolver_calls.load(Ordering::SeqCst)
    }

    fn snapshot(&self) -> Vec<Value> {
        self.records.lock().expect("records").values().cloned().collect()
    }
}

#[async_trait]
impl ResourceSource for InstanceSource {
    fn parse(&self, record: &Value) -> Result<BasicInfo, SourceError> {
        let oid = record["oid"]
            .as_str()
            .ok_or_else(|| SourceError::parse("instance without oid"))?;
        Ok(BasicInfo {
            id: 0,
            oid: oid.to_string(),
            sub_res: models_of(record),
            tenant: tenant_of(record),
        })
    }

    async fn get_by_keys(
        &self,
        sub_res: Option<&str>,
        id_keys: &[String],
    ) -> Result<Vec<Value>, SourceError> {
        let records = self.records.lock().expect("records");
        Ok(id_keys
            .iter()
            .filter_map(|oid| records.get(oid))
            .filter(|record| in_model(record, sub_res))
            .cloned()
            .collect())
    }

    async fn list(&self, request: &ListRequest) -> Result<ListPage, SourceError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let matching: Vec<Value> = self
            .snapshot()
            .into_iter()
            .filter(|record| in_model(record, request.sub_res.as_deref()))
            .filter(|record| request.tenant.admits(&tenant_of(record)))
            .collect();

        let count = request.with_count.then_some(matching.len() as u64);
        let after = request.page.cursor.as_deref();
        let records = matching
            .into_iter()
            .filter(|record| after.is_none_or(|after| record["oid"].as_str().unwrap_or("") > after))
            .skip(request.page.offset)
            .take(request.page.limit)
            .map(|record| {
                if request.only_ids {
                    json!({
                        "oid": record["oid"],
                        "models": record["models"],
                        "tenant_id": record["tenant_id"],
                    })
                } else {
                    record
                }
            })
            .collect();
        Ok(ListPage { count, records })
    }
}

/// Resolves instances by display name.
pub struct InstanceName {
    source: Arc<InstanceSource>,
}

#[async_trait]
impl UniqueKeyResolver for InstanceName {
    fn key_type(&self) -> &str {
        INSTANCE_NAME
    }

    fn derive_keys(&self, record: &Value, _info: &BasicInfo) -> Result<Vec<String>, SourceError> {
        Ok(record["name"].as_str().map(str::to_string).into_iter().collect())
    }

    async fn get_by_unique_keys(&self, keys: &[String]) -> Result<Vec<Value>, SourceError> {
        self.source.resolver_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .source
            .snapshot()
            .into_iter()
            .filter(|record| record["name"].as_str().is_some_and(|name| keys.iter().any(|key| key == name)))
            .collect())
    }
}

pub struct InstanceHarness {
    pub set: CacheSet,
    pub kv: Arc<MemoryKvStore>,
    pub source: Arc<InstanceSource>,
}

impl InstanceHarness {
    pub fn new(source: InstanceSource) -> Self {
        let config = CacheConfig {
            refresh_page_size: 2,
            ..CacheConfig::without_pauses()
        };
        let kv = Arc::new(MemoryKvStore::new());
        let source = Arc::new(source);
        let resolver = Arc::new(InstanceName {
            source: Arc::clone(&source),
        });
        let set = CacheSet::builder(kv.clone(), config)
            .register(
                ResourceRegistration::new(instance_resource(), source.clone())
                    .with_unique_key(resolver),
            )
            .build()
            .expect("cache set should build");
        Self { set, kv, source }
    }

    pub fn cache(&self) -> &Arc<ResourceCache> {
        self.set.cache("instance").expect("registered")
    }
}

/// Oids of rendered instance details, in order.
pub fn oids(details: &[String]) -> Vec<String> {
    details
        .iter()
        .map(|detail| {
            let value: Value = serde_json::from_str(detail).expect("detail json");
            value["oid"].as_str().expect("detail oid").to_string()
        })
        .collect()
}

/// Store that, once armed, adds `member` to `key` right after the next
/// existence check of `key` answers, the way a concurrent writer could land
/// between that check and a pipeline built from it.
pub struct RacingStore {
    inner: Arc<MemoryKvStore>,
    key: String,
    member: ScoredMember,
    armed: AtomicBool,
    fired: AtomicBool,
}

impl RacingStore {
    pub fn new(inner: Arc<MemoryKvStore>, key: impl Into<String>, member: ScoredMember) -> Self {
        Self {
            inner,
            key: key.into(),
            member,
            armed: AtomicBool::new(false),
            fired: AtomicBool::new(false),
        }
    }

    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KvStore for RacingStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        self.inner.get(key).await
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, KvError> {
        self.inner.mget(keys).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        self.inner.set(key, value, ttl).await
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool, KvError> {
        self.inner.set_nx(key, value, ttl).await
    }

    async fn del(&self, keys: &[String]) -> Result<u64, KvError> {
        self.inner.del(keys).await
    }

    async fn compare_and_del(&self, key: &str, expected: &str) -> Result<bool, KvError> {
        self.inner.compare_and_del(key, expected).await
    }

    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        let found = self.inner.exists(key).await?;
        if key == self.key && self.armed.swap(false, Ordering::SeqCst) {
            let mut pipeline = Pipeline::new();
            pipeline.zadd(key, vec![self.member.clone()]);
            self.inner.exec(pipeline).await?;
            self.fired.store(true, Ordering::SeqCst);
        }
        Ok(found)
    }

    async fn zcard(&self, key: &str) -> Result<u64, KvError> {
        self.inner.zcard(key).await
    }

    async fn zrange(&self, key: &str, offset: usize, limit: usize) -> Result<Vec<String>, KvError> {
        self.inner.zrange(key, offset, limit).await
    }

    async fn zrange_by_score(&self, key: &str, min: f64, limit: usize) -> Result<Vec<String>, KvError> {
        self.inner.zrange_by_score(key, min, limit).await
    }

    async fn zrange_by_lex(&self, key: &str, min: &str, limit: usize) -> Result<Vec<String>, KvError> {
        self.inner.zrange_by_lex(key, min, limit).await
    }

    async fn zrem_range_by_rank(&self, key: &str, start: usize, stop: usize) -> Result<u64, KvError> {
        self.inner.zrem_range_by_rank(key, start, stop).await
    }

    async fn exec(&self, pipeline: Pipeline) -> Result<Vec<Reply>, KvError> {
        self.inner.exec(pipeline).await
    }
}

/// Ids of rendered host details, in order.
pub fn ids(details: &[String]) -> Vec<i64> {
    details
        .iter()
        .map(|detail| {
            let value: Value = serde_json::from_str(detail).expect("detail json");
            value["id"].as_i64().expect("detail id")
        })
        .collect()
}

/// Poll `check` until it holds, failing the test after a few seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..300 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
