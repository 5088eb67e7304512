//! Materialized, ordered id-lists.
//!
//! A list's freshness lives in a separate expire marker holding the unix time
//! of its last full rebuild, suffixed with `:empty` when that rebuild found no
//! members. Rebuilds page the primary store into a temporary
//! sorted set, then swap it in with one atomic rename batch. While a rebuild
//! is in flight a pointer key names its temporary set so change ingestion can
//! write into both generations.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::application::pagination::PageRequest;
use crate::application::source::{ListRequest, TenantFilter};
use crate::domain::filter::Expression;
use crate::domain::resource::IdKind;
use crate::infra::kv::{KvError, KvStore, Pipeline, ScoredMember};

use super::config::CacheConfig;
use super::context::CacheContext;
use super::error::CacheError;
use super::keys::{expire_key, lock_key, retired_key, temp_list_key, temp_pointer_key};

const METRIC_REFRESH_TOTAL: &str = "rescache_id_list_refresh_total";
const METRIC_REFRESH_MS: &str = "rescache_id_list_refresh_ms";

const EMPTY_MARKER_SUFFIX: &str = ":empty";

/// Freshness of an id-list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListState {
    /// Neither the list nor a fresh marker exists; callers go to the primary store.
    Absent,
    /// The list exists but is older than its interval; it is served as is.
    Expired,
    /// Rebuilt within its interval. The list is missing only when that
    /// rebuild found no members.
    Fresh,
}

impl ListState {
    pub fn is_servable(&self) -> bool {
        !matches!(self, Self::Absent)
    }
}

/// Everything needed to rebuild one id-list from the primary store.
#[derive(Debug, Clone)]
pub(crate) struct IdListSpec {
    pub key: String,
    pub ttl: Duration,
    pub sub_res: Option<String>,
    pub tenant: TenantFilter,
    pub condition: Option<Expression>,
}

/// Whether a refresh request started a rebuild.
#[derive(Debug)]
pub enum RefreshOutcome {
    Started(JoinHandle<()>),
    /// Another task or process is already rebuilding the list.
    Skipped,
}

impl RefreshOutcome {
    pub fn is_started(&self) -> bool {
        matches!(self, Self::Started(_))
    }

    /// Wait for a started rebuild to finish.
    pub async fn finished(self) {
        if let Self::Started(handle) = self {
            if let Err(err) = handle.await {
                error!(error = %err, "Id-list refresh task failed to complete");
            }
        }
    }
}

/// Keys an incremental change should be written to.
#[derive(Debug, Default)]
pub(crate) struct WriteTargets {
    pub live: Option<String>,
    pub temp: Option<String>,
}

pub(crate) struct IdListCache {
    ctx: CacheContext,
}

impl IdListCache {
    pub fn new(ctx: CacheContext) -> Self {
        Self { ctx }
    }

    pub async fn state(&self, list_key: &str, ttl: Duration) -> Result<ListState, CacheError> {
        let exists = self.ctx.kv.exists(list_key).await?;
        let marker = self.ctx.kv.get(&expire_key(list_key)).await?;

        let (fresh, empty) = match marker.as_deref().map(ExpireMarker::parse) {
            Some(Ok(marker)) => (
                now_unix().saturating_sub(marker.refreshed_at) <= ttl.as_secs() as i64,
                marker.empty,
            ),
            Some(Err(err)) => {
                warn!(id_list_key = list_key, error = %err, "Unreadable id-list expire marker");
                (false, false)
            }
            None => (false, false),
        };

        Ok(match (fresh, exists) {
            (true, true) => ListState::Fresh,
            (true, false) if empty => ListState::Fresh,
            (false, true) => ListState::Expired,
            // A fresh marker without its list means the list was evicted.
            (_, false) => ListState::Absent,
        })
    }

    /// Report the list's state, kicking off a rebuild when it is absent or
    /// expired. An expired list is marked fresh for a short throttle window
    /// so concurrent callers do not all try to rebuild it.
    pub async fn ensure(self: &Arc<Self>, spec: &IdListSpec) -> Result<ListState, CacheError> {
        let state = self.state(&spec.key, spec.ttl).await?;
        match state {
            ListState::Fresh => return Ok(state),
            ListState::Expired => {
                let throttle = self.ctx.config.expired_throttle();
                let marker = ExpireMarker {
                    refreshed_at: now_unix() - spec.ttl.as_secs() as i64 + throttle.as_secs() as i64,
                    empty: false,
                };
                self.ctx
                    .kv
                    .set(&expire_key(&spec.key), &marker.to_string(), Some(throttle))
                    .await?;
                debug!(id_list_key = %spec.key, "Id-list expired, refreshing");
            }
            ListState::Absent => debug!(id_list_key = %spec.key, "Id-list absent, refreshing"),
        }

        if let Err(err) = self.try_refresh(spec.clone()).await {
            error!(id_list_key = %spec.key, error = %err, "Failed to start id-list refresh");
        }
        Ok(state)
    }

    /// Start a background rebuild unless one is already running here or in
    /// another process.
    pub async fn try_refresh(self: &Arc<Self>, spec: IdListSpec) -> Result<RefreshOutcome, CacheError> {
        let resource = self.ctx.name().to_string();
        let Some(guard) = self.ctx.lock.try_lock(&spec.key) else {
            debug!(id_list_key = %spec.key, "Id-list refresh already running locally");
            counter!(METRIC_REFRESH_TOTAL, "resource" => resource, "result" => "skipped").increment(1);
            return Ok(RefreshOutcome::Skipped);
        };

        let rid = Uuid::new_v4().simple().to_string();
        let lock = lock_key(&spec.key);
        let locked = self
            .ctx
            .kv
            .set_nx(&lock, &rid, Some(self.ctx.config.distributed_lock_ttl()))
            .await?;
        if !locked {
            debug!(id_list_key = %spec.key, "Id-list refresh already running elsewhere");
            counter!(METRIC_REFRESH_TOTAL, "resource" => resource, "result" => "skipped").increment(1);
            return Ok(RefreshOutcome::Skipped);
        }

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let _guard = guard;
            let started_at = Instant::now();

            match this.refresh(&spec, &rid).await {
                Ok(count) => {
                    info!(id_list_key = %spec.key, rid = %rid, count, "Id-list refreshed");
                    counter!(METRIC_REFRESH_TOTAL, "resource" => resource.clone(), "result" => "ok")
                        .increment(1);
                }
                Err(err) => {
                    error!(id_list_key = %spec.key, rid = %rid, error = %err, "Id-list refresh failed");
                    counter!(METRIC_REFRESH_TOTAL, "resource" => resource.clone(), "result" => "error")
                        .increment(1);
                }
            }
            histogram!(METRIC_REFRESH_MS, "resource" => resource)
                .record(started_at.elapsed().as_secs_f64() * 1000.0);

            if let Err(err) = this.ctx.kv.compare_and_del(&lock, &rid).await {
                warn!(id_list_key = %spec.key, rid = %rid, error = %err, "Failed to release id-list lock");
            }
        });
        Ok(RefreshOutcome::Started(handle))
    }

    async fn refresh(&self, spec: &IdListSpec, rid: &str) -> Result<u64, CacheError> {
        let temp_key = temp_list_key(&spec.key, rid);
        let pointer = temp_pointer_key(&spec.key);
        self.ctx
            .kv
            .set(&pointer, &temp_key, Some(self.ctx.config.distributed_lock_ttl()))
            .await?;

        let result = self.rebuild(spec, rid, &temp_key).await;
        if result.is_err() {
            if let Err(err) = self.ctx.kv.compare_and_del(&pointer, &temp_key).await {
                warn!(id_list_key = %spec.key, error = %err, "Failed to clear id-list temp pointer");
            }
        }
        result
    }

    async fn rebuild(&self, spec: &IdListSpec, rid: &str, temp_key: &str) -> Result<u64, CacheError> {
        let page_size = self.ctx.config.refresh_page_size_non_zero();
        let temp_ttl = self.ctx.config.distributed_lock_ttl();
        let pause = self.ctx.config.refresh_page_pause();

        let mut cursor: Option<String> = None;
        let mut total = 0u64;
        loop {
            let request = ListRequest {
                sub_res: spec.sub_res.clone(),
                tenant: spec.tenant.clone(),
                condition: spec.condition.clone(),
                page: PageRequest {
                    cursor: cursor.clone(),
                    offset: 0,
                    limit: page_size,
                },
                only_ids: true,
                with_count: false,
            };
            let page = self.ctx.source.list(&request).await?;
            let fetched = page.records.len();

            let mut members = Vec::with_capacity(fetched);
            for record in &page.records {
                let id_key = self
                    .ctx
                    .source
                    .parse(record)
                    .map_err(CacheError::from)
                    .and_then(|info| self.ctx.keys.id_key(&info));
                match id_key {
                    Ok(id_key) => members.push(ScoredMember::new(id_key.key, id_key.score)),
                    Err(err) => warn!(
                        id_list_key = %spec.key,
                        rid,
                        error = %err,
                        "Skipping record during id-list refresh"
                    ),
                }
            }

            let last = members.last().map(|member| member.member.clone());
            if !members.is_empty() {
                total += members.len() as u64;
                let mut pipeline = Pipeline::new();
                pipeline.zadd(temp_key, members).expire(temp_key, temp_ttl);
                self.ctx.kv.exec(pipeline).await?;
            }

            if fetched < page_size {
                break;
            }
            let Some(last) = last else {
                warn!(id_list_key = %spec.key, rid, "Refresh page had no usable ids, stopping");
                break;
            };
            cursor = Some(last);
            if !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
        }

        self.swap(spec, rid, temp_key).await?;
        Ok(total)
    }

    async fn swap(&self, spec: &IdListSpec, rid: &str, temp_key: &str) -> Result<(), CacheError> {
        let live_exists = self.ctx.kv.exists(&spec.key).await?;
        let temp_exists = self.ctx.kv.exists(temp_key).await?;
        let retired = retired_key(&spec.key, rid);
        let resource = &self.ctx.resource;

        // The temp set received every change written to the live list since
        // the pointer was set, so it replaces whatever the live key holds by
        // now, including a live list recreated after the existence check.
        let mut pipeline = Pipeline::new();
        if live_exists {
            pipeline.rename(&spec.key, &retired);
        }
        if temp_exists {
            pipeline
                .rename(temp_key, &spec.key)
                .expire(&spec.key, resource.jittered(spec.ttl * 2));
        } else {
            pipeline.del(vec![spec.key.clone()]);
        }
        let marker = ExpireMarker {
            refreshed_at: now_unix(),
            empty: !temp_exists,
        };
        pipeline
            .set(expire_key(&spec.key), marker.to_string(), resource.jittered(spec.ttl))
            .del(vec![temp_pointer_key(&spec.key)]);
        self.ctx.kv.exec(pipeline).await?;

        if live_exists {
            spawn_drain(Arc::clone(&self.ctx.kv), retired, &self.ctx.config);
        }
        Ok(())
    }

    /// Page through a list in score order (numeric ids) or lexicographic
    /// order (opaque ids).
    pub async fn list_ids(&self, list_key: &str, page: &PageRequest) -> Result<Vec<String>, CacheError> {
        let ids = match (&page.cursor, self.ctx.resource.id_kind()) {
            (Some(cursor), IdKind::Numeric) => {
                let after = self.ctx.keys.parse_id_key(cursor)?;
                self.ctx
                    .kv
                    .zrange_by_score(list_key, after.score, page.limit)
                    .await?
            }
            (Some(cursor), IdKind::Opaque) => {
                self.ctx.kv.zrange_by_lex(list_key, cursor, page.limit).await?
            }
            (None, _) => self.ctx.kv.zrange(list_key, page.offset, page.limit).await?,
        };
        Ok(ids)
    }

    pub async fn count(&self, list_key: &str) -> Result<u64, CacheError> {
        Ok(self.ctx.kv.zcard(list_key).await?)
    }

    /// Where an incremental change to `spec`'s list must be written.
    ///
    /// A servable list takes the change directly; an in-flight rebuild's temp
    /// set takes it too so the swap cannot drop it.
    pub async fn write_targets(self: &Arc<Self>, spec: &IdListSpec) -> Result<WriteTargets, CacheError> {
        let state = self.ensure(spec).await?;
        let temp = self.ctx.kv.get(&temp_pointer_key(&spec.key)).await?;
        Ok(WriteTargets {
            live: state.is_servable().then(|| spec.key.clone()),
            temp,
        })
    }
}

/// Move a list out of the way and drain it in the background, leaving it
/// absent for readers.
pub(crate) async fn retire_list(
    kv: &Arc<dyn KvStore>,
    config: &CacheConfig,
    list_key: &str,
) -> Result<(), CacheError> {
    kv.del(&[expire_key(list_key)]).await?;
    if !kv.exists(list_key).await? {
        return Ok(());
    }

    let retired = retired_key(list_key, &Uuid::new_v4().simple().to_string());
    let mut pipeline = Pipeline::new();
    pipeline.rename(list_key, &retired);
    match kv.exec(pipeline).await {
        Ok(_) => {
            spawn_drain(Arc::clone(kv), retired, config);
            Ok(())
        }
        // Expired between the check and the rename.
        Err(KvError::NoSuchKey { .. }) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Delete a retired list in small steps so no single command blocks the store.
pub(crate) fn spawn_drain(kv: Arc<dyn KvStore>, key: String, config: &CacheConfig) -> JoinHandle<()> {
    let batch = config.drain_batch_size_non_zero();
    let pause = config.drain_pause();
    tokio::spawn(async move {
        let mut drained = 0u64;
        loop {
            match kv.zrem_range_by_rank(&key, 0, batch - 1).await {
                Ok(0) => break,
                Ok(removed) => {
                    drained += removed;
                    if !pause.is_zero() {
                        tokio::time::sleep(pause).await;
                    }
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "Failed to drain retired id-list");
                    break;
                }
            }
        }
        debug!(key = %key, drained, "Retired id-list drained");
    })
}

/// Value of a list's expire marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExpireMarker {
    refreshed_at: i64,
    /// The rebuild that wrote the marker found no members.
    empty: bool,
}

impl ExpireMarker {
    fn parse(raw: &str) -> Result<Self, std::num::ParseIntError> {
        let (refreshed_at, empty) = match raw.strip_suffix(EMPTY_MARKER_SUFFIX) {
            Some(refreshed_at) => (refreshed_at, true),
            None => (raw, false),
        };
        Ok(Self {
            refreshed_at: refreshed_at.parse()?,
            empty,
        })
    }
}

impl std::fmt::Display for ExpireMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.refreshed_at)?;
        if self.empty {
            f.write_str(EMPTY_MARKER_SUFFIX)?;
        }
        Ok(())
    }
}

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}
