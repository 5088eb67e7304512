//! In-process full-sync condition store.
//!
//! Holds conditions in memory and, when given a condition queue, publishes
//! every committed change to it the way a database change stream would.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::warn;

use crate::application::cond_store::{CondQuery, CondStoreError, FullSyncCondStore};
use crate::cache::lock::{rw_read, rw_write};
use crate::cache::{CondEvent, EventQueue};
use crate::domain::full_sync_cond::{FullSyncCond, NewFullSyncCond};

const SOURCE: &str = "infra::cond_store";

#[derive(Debug, Default)]
struct Table {
    next_id: i64,
    rows: BTreeMap<i64, FullSyncCond>,
}

#[derive(Default)]
pub struct MemoryCondStore {
    table: RwLock<Table>,
    feed: Option<EventQueue<CondEvent>>,
}

impl MemoryCondStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish committed changes to `feed`, waiting for capacity when full.
    pub fn with_feed(feed: EventQueue<CondEvent>) -> Self {
        Self {
            table: RwLock::default(),
            feed: Some(feed),
        }
    }

    async fn publish(&self, event: CondEvent) {
        let Some(feed) = &self.feed else {
            return;
        };
        if let Err(err) = feed.publish_wait(event).await {
            warn!(error = %err, "Failed to publish full sync cond change");
        }
    }
}

#[async_trait]
impl FullSyncCondStore for MemoryCondStore {
    async fn insert(&self, cond: NewFullSyncCond) -> Result<FullSyncCond, CondStoreError> {
        let created = {
            let mut table = rw_write(&self.table, SOURCE, "insert");
            table.next_id += 1;
            let created = cond.with_id(table.next_id);
            table.rows.insert(created.id, created.clone());
            created
        };
        self.publish(CondEvent::Upsert(vec![created.clone()])).await;
        Ok(created)
    }

    async fn update_interval(
        &self,
        id: i64,
        interval: u32,
    ) -> Result<FullSyncCond, CondStoreError> {
        let updated = {
            let mut table = rw_write(&self.table, SOURCE, "update_interval");
            let row = table
                .rows
                .get_mut(&id)
                .ok_or(CondStoreError::NotFound { id })?;
            row.interval = interval;
            row.clone()
        };
        self.publish(CondEvent::Upsert(vec![updated.clone()])).await;
        Ok(updated)
    }

    async fn delete(&self, id: i64) -> Result<FullSyncCond, CondStoreError> {
        let deleted = {
            let mut table = rw_write(&self.table, SOURCE, "delete");
            table.rows.remove(&id).ok_or(CondStoreError::NotFound { id })?
        };
        self.publish(CondEvent::Delete(vec![deleted.clone()])).await;
        Ok(deleted)
    }

    async fn find(&self, query: &CondQuery) -> Result<Vec<FullSyncCond>, CondStoreError> {
        let table = rw_read(&self.table, SOURCE, "find");
        Ok(table
            .rows
            .values()
            .filter(|cond| query.admits(cond))
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn count(&self, query: &CondQuery) -> Result<u64, CondStoreError> {
        let table = rw_read(&self.table, SOURCE, "count");
        Ok(table.rows.values().filter(|cond| query.admits(cond)).count() as u64)
    }
}
