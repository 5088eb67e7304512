//! Read-through cache of serialized records.
//!
//! A detail entry is either the record's JSON or an empty string recording
//! that the primary store has no such record. Misses are fetched once per key
//! across concurrent callers and written back with create-if-absent so a
//! slower refresher never replaces a newer value.

use std::collections::{HashMap, HashSet};

use futures::future::join_all;
use metrics::counter;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::application::source::SourceError;
use crate::domain::tenant::Scope;
use crate::infra::kv::Pipeline;

use super::context::CacheContext;
use super::error::CacheError;
use super::keys::IdKey;
use super::lock::Acquire;

const METRIC_DETAIL_HIT: &str = "rescache_detail_hit_total";
const METRIC_DETAIL_MISS: &str = "rescache_detail_miss_total";
const METRIC_DETAIL_NEGATIVE: &str = "rescache_detail_negative_total";

/// Marker stored for ids the primary store does not have.
pub(crate) const NEGATIVE_ENTRY: &str = "";

#[derive(Debug, Clone)]
pub struct ListDetailByIds {
    pub sub_res: Option<String>,
    /// Numeric ids or oids, depending on the resource.
    pub ids: Vec<String>,
    /// Keep only these top-level fields; empty keeps the full record.
    pub fields: Vec<String>,
    pub scope: Scope,
}

impl ListDetailByIds {
    pub fn new<I, S>(ids: I, scope: Scope) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        Self {
            sub_res: None,
            ids: ids.into_iter().map(|id| id.to_string()).collect(),
            fields: Vec::new(),
            scope,
        }
    }

    pub fn with_sub_res(mut self, sub_res: impl Into<String>) -> Self {
        self.sub_res = Some(sub_res.into());
        self
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone)]
pub struct RefreshDetailByIds {
    pub sub_res: Option<String>,
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteMode {
    IfAbsent,
    Overwrite,
}

/// A fetched record prepared for write-back.
#[derive(Debug, Clone)]
pub(crate) struct StagedRecord {
    pub id_key: String,
    pub detail: String,
    /// `(key_type, unique_key)` pairs derived from the record.
    pub unique: Vec<(String, String)>,
}

pub(crate) struct DetailCache {
    ctx: CacheContext,
}

impl DetailCache {
    pub fn new(ctx: CacheContext) -> Self {
        Self { ctx }
    }

    pub async fn list_by_ids(&self, opts: &ListDetailByIds) -> Result<Vec<String>, CacheError> {
        let sub_res = opts.sub_res.as_deref();
        let ids = self.check_ids(sub_res, &opts.ids)?;

        let detail_keys: Vec<String> = ids
            .iter()
            .map(|id| self.ctx.keys.detail_key(sub_res, &id.key))
            .collect();
        let cached = self.ctx.kv.mget(&detail_keys).await?;

        let mut found = HashMap::with_capacity(ids.len());
        let mut missing = Vec::new();
        let mut negative = 0u64;
        for (id, value) in ids.iter().zip(cached) {
            match value {
                Some(value) if value == NEGATIVE_ENTRY => negative += 1,
                Some(value) => {
                    found.insert(id.key.clone(), value);
                }
                None => missing.push(id.key.clone()),
            }
        }

        let resource = self.ctx.name().to_string();
        counter!(METRIC_DETAIL_HIT, "resource" => resource.clone()).increment(found.len() as u64);
        counter!(METRIC_DETAIL_MISS, "resource" => resource.clone()).increment(missing.len() as u64);
        counter!(METRIC_DETAIL_NEGATIVE, "resource" => resource).increment(negative);

        if !missing.is_empty() {
            found.extend(self.fetch_missing(sub_res, &missing).await?);
        }

        let mut details = Vec::with_capacity(found.len());
        for id in &ids {
            let Some(detail) = found.remove(&id.key) else {
                continue;
            };
            match self.render(&detail, &opts.scope, &opts.fields) {
                Ok(Some(rendered)) => details.push(rendered),
                Ok(None) => {}
                Err(err) => warn!(
                    resource = self.ctx.name(),
                    id = %id.key,
                    error = %err,
                    "Skipping malformed cached detail"
                ),
            }
        }
        Ok(details)
    }

    /// Overwrite the cached details of `ids` with the primary store's current
    /// state, negative-caching ids it no longer has.
    pub async fn refresh_by_ids(&self, opts: &RefreshDetailByIds) -> Result<usize, CacheError> {
        let sub_res = opts.sub_res.as_deref();
        let ids = self.check_ids(sub_res, &opts.ids)?;
        let keys: Vec<String> = ids.iter().map(|id| id.key.clone()).collect();

        let records = self.ctx.source.get_by_keys(sub_res, &keys).await?;
        let mut pipeline = Pipeline::new();
        let staged = self.stage_records(&mut pipeline, sub_res, &records, WriteMode::Overwrite);
        let refreshed: HashSet<&str> = staged.iter().map(|record| record.id_key.as_str()).collect();

        for key in keys.iter().filter(|key| !refreshed.contains(key.as_str())) {
            pipeline.set(
                self.ctx.keys.detail_key(sub_res, key),
                NEGATIVE_ENTRY,
                self.ctx.entry_ttl(),
            );
        }
        self.ctx.kv.exec(pipeline).await?;

        debug!(
            resource = self.ctx.name(),
            requested = keys.len(),
            refreshed = staged.len(),
            "Refreshed details"
        );
        Ok(staged.len())
    }

    /// Queue write-back of fetched records: detail plus every unique key.
    /// Records that cannot be parsed are logged and left out.
    pub fn stage_records(
        &self,
        pipeline: &mut Pipeline,
        sub_res: Option<&str>,
        records: &[Value],
        mode: WriteMode,
    ) -> Vec<StagedRecord> {
        let mut staged = Vec::with_capacity(records.len());
        for record in records {
            let info = match self.ctx.source.parse(record) {
                Ok(info) => info,
                Err(err) => {
                    warn!(resource = self.ctx.name(), error = %err, "Skipping unparsable record");
                    continue;
                }
            };
            if let Err(err) = info.validate(&self.ctx.resource) {
                warn!(resource = self.ctx.name(), error = %err, "Skipping invalid record");
                continue;
            }
            let id_key = match self.ctx.keys.id_key(&info) {
                Ok(id_key) => id_key,
                Err(err) => {
                    warn!(resource = self.ctx.name(), error = %err, "Skipping record without id");
                    continue;
                }
            };
            let detail = match serde_json::to_string(record) {
                Ok(detail) => detail,
                Err(err) => {
                    warn!(resource = self.ctx.name(), id = %id_key.key, error = %err, "Skipping unserializable record");
                    continue;
                }
            };

            let detail_key = self.ctx.keys.detail_key(sub_res, &id_key.key);
            write(pipeline, mode, detail_key, detail.clone(), &self.ctx);

            let mut unique = Vec::new();
            for resolver in self.ctx.unique_keys.iter() {
                match resolver.derive_keys(record, &info) {
                    Ok(keys) => {
                        for key in keys {
                            let store_key = self.ctx.keys.unique_key(resolver.key_type(), &key);
                            write(pipeline, mode, store_key, id_key.key.clone(), &self.ctx);
                            unique.push((resolver.key_type().to_string(), key));
                        }
                    }
                    Err(err) => warn!(
                        resource = self.ctx.name(),
                        key_type = resolver.key_type(),
                        id = %id_key.key,
                        error = %err,
                        "Failed to derive unique keys"
                    ),
                }
            }

            staged.push(StagedRecord {
                id_key: id_key.key,
                detail,
                unique,
            });
        }
        staged
    }

    async fn fetch_missing(
        &self,
        sub_res: Option<&str>,
        missing: &[String],
    ) -> Result<HashMap<String, String>, CacheError> {
        let mut guards = Vec::new();
        let mut leading = Vec::new();
        let mut waiters = Vec::new();
        let mut following = Vec::new();
        for key in missing {
            match self.ctx.lock.acquire(&self.ctx.keys.detail_key(sub_res, key)) {
                Acquire::Leader(guard) => {
                    guards.push(guard);
                    leading.push(key.clone());
                }
                Acquire::Follower(waiter) => {
                    waiters.push(waiter);
                    following.push(key.clone());
                }
            }
        }

        let mut found = HashMap::new();
        if !leading.is_empty() {
            // A leader that finished between our read and the claim already wrote these.
            let keys: Vec<String> = leading
                .iter()
                .map(|key| self.ctx.keys.detail_key(sub_res, key))
                .collect();
            let rechecked = self.ctx.kv.mget(&keys).await?;
            let mut still_missing = Vec::with_capacity(leading.len());
            for (key, value) in leading.into_iter().zip(rechecked) {
                match value {
                    Some(detail) if detail != NEGATIVE_ENTRY => {
                        found.insert(key, detail);
                    }
                    Some(_) => {}
                    None => still_missing.push(key),
                }
            }
            leading = still_missing;
        }
        if !leading.is_empty() {
            let records = self.ctx.source.get_by_keys(sub_res, &leading).await?;
            let mut pipeline = Pipeline::new();
            let staged = self.stage_records(&mut pipeline, sub_res, &records, WriteMode::IfAbsent);
            for record in staged {
                found.insert(record.id_key, record.detail);
            }

            let absent: Vec<&String> = leading
                .iter()
                .filter(|key| !found.contains_key(key.as_str()))
                .collect();
            for key in &absent {
                pipeline.set_nx(
                    self.ctx.keys.detail_key(sub_res, key),
                    NEGATIVE_ENTRY,
                    self.ctx.entry_ttl(),
                );
            }
            self.ctx.kv.exec(pipeline).await?;

            if !absent.is_empty() {
                debug!(
                    resource = self.ctx.name(),
                    absent = absent.len(),
                    "Negative-cached ids missing from primary store"
                );
            }
        }
        drop(guards);

        if !waiters.is_empty() {
            let wait = self.ctx.config.follower_wait();
            join_all(waiters.into_iter().map(|waiter| waiter.wait(wait))).await;

            let keys: Vec<String> = following
                .iter()
                .map(|key| self.ctx.keys.detail_key(sub_res, key))
                .collect();
            let values = self.ctx.kv.mget(&keys).await?;
            for (key, value) in following.into_iter().zip(values) {
                if let Some(detail) = value.filter(|detail| detail != NEGATIVE_ENTRY) {
                    found.insert(key, detail);
                }
            }
        }

        Ok(found)
    }

    fn render(
        &self,
        detail: &str,
        scope: &Scope,
        fields: &[String],
    ) -> Result<Option<String>, CacheError> {
        if scope.is_system() && fields.is_empty() {
            return Ok(Some(detail.to_string()));
        }

        let record: Value =
            serde_json::from_str(detail).map_err(|err| SourceError::parse(err.to_string()))?;
        if !self.visible(&record, scope)? {
            return Ok(None);
        }
        if fields.is_empty() {
            return Ok(Some(detail.to_string()));
        }
        Ok(Some(project(&record, fields)))
    }

    /// Render a record read straight from the primary store.
    pub fn render_record(
        &self,
        record: &Value,
        scope: &Scope,
        fields: &[String],
    ) -> Result<Option<String>, CacheError> {
        if !self.visible(record, scope)? {
            return Ok(None);
        }
        if fields.is_empty() {
            return Ok(Some(record.to_string()));
        }
        Ok(Some(project(record, fields)))
    }

    fn visible(&self, record: &Value, scope: &Scope) -> Result<bool, CacheError> {
        if scope.is_system() {
            return Ok(true);
        }
        let info = self.ctx.source.parse(record)?;
        Ok(scope.can_see(&info.tenant))
    }

    /// Validate and dedupe requested ids, preserving first occurrence order.
    pub fn check_ids(&self, sub_res: Option<&str>, ids: &[String]) -> Result<Vec<IdKey>, CacheError> {
        self.ctx.resource.check_sub_resource(sub_res)?;
        if ids.is_empty() {
            return Err(CacheError::validation("ids are required"));
        }
        if ids.len() > self.ctx.config.max_request_ids {
            return Err(CacheError::validation(format!(
                "at most {} ids may be requested, got {}",
                self.ctx.config.max_request_ids,
                ids.len()
            )));
        }

        let mut seen = HashSet::with_capacity(ids.len());
        let mut keys = Vec::with_capacity(ids.len());
        for id in ids {
            let id_key = self.ctx.keys.parse_id_key(id)?;
            if seen.insert(id_key.key.clone()) {
                keys.push(id_key);
            }
        }
        Ok(keys)
    }
}

fn write(pipeline: &mut Pipeline, mode: WriteMode, key: String, value: String, ctx: &CacheContext) {
    match mode {
        WriteMode::IfAbsent => pipeline.set_nx(key, value, ctx.entry_ttl()),
        WriteMode::Overwrite => pipeline.set(key, value, ctx.entry_ttl()),
    };
}

/// Keep only `fields` of a JSON object; other values pass through.
pub(crate) fn project(record: &Value, fields: &[String]) -> String {
    match record {
        Value::Object(map) => {
            let picked: Map<String, Value> = fields
                .iter()
                .filter_map(|field| map.get(field).map(|value| (field.clone(), value.clone())))
                .collect();
            Value::Object(picked).to_string()
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn projection_keeps_requested_fields_only() {
        let record = json!({"id": 1, "name": "web", "cloud_id": 0});
        let projected: Value =
            serde_json::from_str(&project(&record, &["name".to_string(), "absent".to_string()]))
                .expect("json");
        assert_eq!(projected, json!({"name": "web"}));
    }

    #[test]
    fn projection_passes_non_objects_through() {
        assert_eq!(project(&json!([1, 2]), &["a".to_string()]), "[1,2]");
    }

    #[test]
    fn list_options_normalize_ids() {
        let opts = ListDetailByIds::new([3, 1], Scope::system())
            .with_sub_res("bk_switch")
            .with_fields(["name"]);
        assert_eq!(opts.ids, vec!["3".to_string(), "1".to_string()]);
        assert_eq!(opts.sub_res.as_deref(), Some("bk_switch"));
        assert_eq!(opts.fields, vec!["name".to_string()]);
    }
}
