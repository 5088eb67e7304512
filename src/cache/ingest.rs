//! Change-feed ingestion.
//!
//! A batch of change events is reduced to one write plan per record, then
//! applied as a single pipeline: details and negative entries are dropped,
//! unique keys follow the record, and the record's id moves in or out of
//! every id-list it does or no longer belongs to.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use metrics::histogram;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::resource::BasicInfo;
use crate::infra::kv::{Pipeline, ScoredMember};

use super::context::CacheContext;
use super::error::CacheError;
use super::events::{ChangeEvent, Envelope, EventReceiver};
use super::id_list::{IdListCache, IdListSpec};
use super::keys::IdKey;
use super::registry::FullSyncCondRegistry;

const METRIC_INGEST_MS: &str = "rescache_ingest_batch_ms";

/// A change event resolved to its record identity.
#[derive(Debug, Clone)]
struct ParsedChange {
    epoch: u64,
    info: BasicInfo,
    id_key: IdKey,
    record: Value,
}

/// Latest state of each record touched by a batch.
#[derive(Debug, Default)]
pub(crate) struct IngestPlan {
    upserts: Vec<ParsedChange>,
    removals: Vec<ParsedChange>,
    skipped: usize,
}

impl fmt::Display for IngestPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IngestPlan {{ upserts: {}, removals: {}, skipped: {} }}",
            self.upserts.len(),
            self.removals.len(),
            self.skipped
        )
    }
}

impl IngestPlan {
    /// Reduce a batch to one entry per record.
    ///
    /// Events are deduped by id. Among upserts of one record the highest
    /// epoch wins; a removal anywhere in the batch wins over every upsert.
    pub fn from_events(ctx: &CacheContext, events: Vec<Envelope<ChangeEvent>>) -> Self {
        let mut plan = Self::default();
        let mut seen_ids: HashSet<Uuid> = HashSet::new();
        let mut upserts: HashMap<String, ParsedChange> = HashMap::new();
        let mut removals: HashMap<String, ParsedChange> = HashMap::new();
        let mut order: Vec<String> = Vec::new();

        for event in events.into_iter().filter(|event| seen_ids.insert(event.id)) {
            let change = event.payload;
            let parsed = ctx
                .source
                .parse(&change.data)
                .map_err(CacheError::from)
                .and_then(|info| ctx.keys.id_key(&info).map(|id_key| (info, id_key)));
            let (info, id_key) = match parsed {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!(
                        resource = ctx.name(),
                        oid = %change.oid,
                        error = %err,
                        "Skipping change event without usable identity"
                    );
                    plan.skipped += 1;
                    continue;
                }
            };

            let key = id_key.key.clone();
            if !upserts.contains_key(&key) && !removals.contains_key(&key) {
                order.push(key.clone());
            }
            let parsed = ParsedChange {
                epoch: event.epoch,
                info,
                id_key,
                record: change.data,
            };

            let target = if change.operation.is_removal() {
                &mut removals
            } else {
                &mut upserts
            };
            match target.get(&key) {
                Some(existing) if existing.epoch > parsed.epoch => {}
                _ => {
                    target.insert(key, parsed);
                }
            }
        }

        for key in order {
            if let Some(removal) = removals.remove(&key) {
                plan.removals.push(removal);
            } else if let Some(upsert) = upserts.remove(&key) {
                plan.upserts.push(upsert);
            }
        }
        plan
    }

    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removals.is_empty()
    }
}

/// Id-list membership changes collected while planning.
#[derive(Default)]
struct ListWrites {
    specs: HashMap<String, IdListSpec>,
    adds: HashMap<String, Vec<ScoredMember>>,
    removes: HashMap<String, Vec<String>>,
}

impl ListWrites {
    fn add(&mut self, spec: IdListSpec, id_key: &IdKey) {
        self.adds
            .entry(spec.key.clone())
            .or_default()
            .push(ScoredMember::new(id_key.key.clone(), id_key.score));
        self.specs.entry(spec.key.clone()).or_insert(spec);
    }

    fn remove(&mut self, spec: IdListSpec, id_key: &IdKey) {
        self.removes
            .entry(spec.key.clone())
            .or_default()
            .push(id_key.key.clone());
        self.specs.entry(spec.key.clone()).or_insert(spec);
    }
}

/// Applies change batches of one resource type.
pub(crate) struct ChangeIngestor {
    ctx: CacheContext,
    id_lists: Arc<IdListCache>,
    registry: Arc<FullSyncCondRegistry>,
}

impl ChangeIngestor {
    pub fn new(
        ctx: CacheContext,
        id_lists: Arc<IdListCache>,
        registry: Arc<FullSyncCondRegistry>,
    ) -> Self {
        Self {
            ctx,
            id_lists,
            registry,
        }
    }

    /// Apply one batch. Returns the number of records written.
    pub async fn apply(&self, events: Vec<Envelope<ChangeEvent>>) -> Result<usize, CacheError> {
        let started_at = Instant::now();
        let event_count = events.len();
        let plan = IngestPlan::from_events(&self.ctx, events);
        if plan.is_empty() {
            return Ok(0);
        }

        info!(resource = self.ctx.name(), event_count, plan = %plan, "Change ingestion starting");

        let conds = self.registry.snapshot(self.ctx.name());
        let mut pipeline = Pipeline::new();
        let mut lists = ListWrites::default();

        for change in &plan.upserts {
            self.invalidate_detail(&mut pipeline, change);
            for (key_type, key) in self.unique_keys(change) {
                pipeline.set(
                    self.ctx.keys.unique_key(&key_type, &key),
                    change.id_key.key.clone(),
                    self.ctx.entry_ttl(),
                );
            }
            if self.ctx.resource.cache_all() {
                for sub in self.ctx.storage_subs(&change.info) {
                    lists.add(self.ctx.system_list(sub.as_deref(), &change.info.tenant), &change.id_key);
                }
            }
            for cond in &conds {
                if cond.matches(&change.info, &change.record) {
                    lists.add(cond.list_spec(), &change.id_key);
                } else {
                    lists.remove(cond.list_spec(), &change.id_key);
                }
            }
        }

        for change in &plan.removals {
            self.invalidate_detail(&mut pipeline, change);
            let unique: Vec<String> = self
                .unique_keys(change)
                .into_iter()
                .map(|(key_type, key)| self.ctx.keys.unique_key(&key_type, &key))
                .collect();
            pipeline.del(unique);
            if self.ctx.resource.cache_all() {
                for sub in self.ctx.storage_subs(&change.info) {
                    lists.remove(self.ctx.system_list(sub.as_deref(), &change.info.tenant), &change.id_key);
                }
            }
            for cond in &conds {
                lists.remove(cond.list_spec(), &change.id_key);
            }
        }

        let list_count = lists.specs.len();
        self.stage_list_writes(&mut pipeline, lists).await?;
        self.ctx.kv.exec(pipeline).await?;

        let written = plan.upserts.len() + plan.removals.len();
        histogram!(METRIC_INGEST_MS, "resource" => self.ctx.name().to_string())
            .record(started_at.elapsed().as_secs_f64() * 1000.0);
        debug!(
            resource = self.ctx.name(),
            written,
            lists = list_count,
            "Change ingestion finished"
        );
        Ok(written)
    }

    /// Consume the change queue until every producer is gone.
    pub async fn run(self: Arc<Self>, mut receiver: EventReceiver<ChangeEvent>, batch_limit: usize) {
        loop {
            let batch = receiver.next_batch(batch_limit).await;
            if batch.is_empty() {
                info!(resource = self.ctx.name(), "Change event queue closed, ingestion stopping");
                return;
            }
            if let Err(err) = self.apply(batch).await {
                warn!(resource = self.ctx.name(), error = %err, "Failed to apply change batch");
            }
        }
    }

    fn invalidate_detail(&self, pipeline: &mut Pipeline, change: &ParsedChange) {
        let keys = self
            .ctx
            .storage_subs(&change.info)
            .into_iter()
            .map(|sub| self.ctx.keys.detail_key(sub.as_deref(), &change.id_key.key))
            .collect();
        pipeline.del(keys);
    }

    fn unique_keys(&self, change: &ParsedChange) -> Vec<(String, String)> {
        let mut keys = Vec::new();
        for resolver in self.ctx.unique_keys.iter() {
            match resolver.derive_keys(&change.record, &change.info) {
                Ok(derived) => keys.extend(
                    derived
                        .into_iter()
                        .map(|key| (resolver.key_type().to_string(), key)),
                ),
                Err(err) => warn!(
                    resource = self.ctx.name(),
                    key_type = resolver.key_type(),
                    id = %change.id_key.key,
                    error = %err,
                    "Failed to derive unique keys from change"
                ),
            }
        }
        keys
    }

    async fn stage_list_writes(&self, pipeline: &mut Pipeline, mut lists: ListWrites) -> Result<(), CacheError> {
        let temp_ttl = self.ctx.config.distributed_lock_ttl();
        for (key, spec) in &lists.specs {
            let targets = self.id_lists.write_targets(spec).await?;
            let adds = lists.adds.remove(key).unwrap_or_default();
            let removes = lists.removes.remove(key).unwrap_or_default();

            if let Some(live) = &targets.live {
                pipeline
                    .zadd(live, adds.clone())
                    .zrem(live, removes.clone());
                if !adds.is_empty() {
                    pipeline.expire(live, self.ctx.resource.jittered(spec.ttl * 2));
                }
            }
            if let Some(temp) = &targets.temp {
                pipeline.zadd(temp, adds.clone()).zrem(temp, removes);
                if !adds.is_empty() {
                    pipeline.expire(temp, temp_ttl);
                }
            }
        }
        Ok(())
    }
}
