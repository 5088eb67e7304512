//! Cache configuration.
//!
//! Engine tuning for refresh paging, background draining, event queues and
//! per-resource TTL overrides, loaded from the `[cache]` table.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

// Default values for cache configuration
const DEFAULT_REFRESH_PAGE_SIZE: usize = 500;
const DEFAULT_REFRESH_PAGE_PAUSE_MS: u64 = 50;
const DEFAULT_DRAIN_BATCH_SIZE: usize = 500;
const DEFAULT_DRAIN_PAUSE_MS: u64 = 200;
const DEFAULT_DISTRIBUTED_LOCK_TTL_SECS: u64 = 5 * 60;
const DEFAULT_EXPIRED_THROTTLE_SECS: u64 = 60;
const DEFAULT_FOLLOWER_WAIT_MS: u64 = 3_000;
const DEFAULT_MAX_REQUEST_IDS: usize = 500;
const DEFAULT_MAX_PAGE_LIMIT: usize = 500;
const DEFAULT_CHANGE_QUEUE_CAPACITY: usize = 10_000;
const DEFAULT_CHANGE_BATCH_LIMIT: usize = 200;
const DEFAULT_COND_QUEUE_CAPACITY: usize = 1_000;
const DEFAULT_MAX_NON_ALL_CONDITIONS: usize = 100;
const DEFAULT_COND_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_COND_RETRY_BACKOFF_MS: u64 = 200;

/// TTL override for one resource type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ResourceOverride {
    pub ttl_secs: Option<u64>,
    pub jitter_min_secs: Option<u64>,
    pub jitter_max_secs: Option<u64>,
}

/// Cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Records read from the primary store per id-list refresh page.
    pub refresh_page_size: usize,
    /// Pause between refresh pages (ms).
    pub refresh_page_pause_ms: u64,
    /// Members removed per step when draining a retired id-list.
    pub drain_batch_size: usize,
    /// Pause between drain steps (ms).
    pub drain_pause_ms: u64,
    /// Expiry of the distributed refresh lock and of the in-flight temp list.
    pub distributed_lock_ttl_secs: u64,
    /// How long an expired id-list is treated as fresh once a refresh starts.
    pub expired_throttle_secs: u64,
    /// How long a lookup waits for another task's refresh of the same key (ms).
    pub follower_wait_ms: u64,
    /// Maximum ids or unique keys per detail lookup.
    pub max_request_ids: usize,
    /// Maximum page size for listings.
    pub max_page_limit: usize,
    pub change_queue_capacity: usize,
    /// Maximum change events applied per ingestion batch.
    pub change_batch_limit: usize,
    pub cond_queue_capacity: usize,
    /// Global cap on conditions with `is_all = false`.
    pub max_non_all_conditions: usize,
    /// Attempts for id-list TTL updates and teardown.
    pub cond_retry_attempts: u32,
    /// Linear backoff step between attempts (ms).
    pub cond_retry_backoff_ms: u64,
    pub resources: HashMap<String, ResourceOverride>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            refresh_page_size: DEFAULT_REFRESH_PAGE_SIZE,
            refresh_page_pause_ms: DEFAULT_REFRESH_PAGE_PAUSE_MS,
            drain_batch_size: DEFAULT_DRAIN_BATCH_SIZE,
            drain_pause_ms: DEFAULT_DRAIN_PAUSE_MS,
            distributed_lock_ttl_secs: DEFAULT_DISTRIBUTED_LOCK_TTL_SECS,
            expired_throttle_secs: DEFAULT_EXPIRED_THROTTLE_SECS,
            follower_wait_ms: DEFAULT_FOLLOWER_WAIT_MS,
            max_request_ids: DEFAULT_MAX_REQUEST_IDS,
            max_page_limit: DEFAULT_MAX_PAGE_LIMIT,
            change_queue_capacity: DEFAULT_CHANGE_QUEUE_CAPACITY,
            change_batch_limit: DEFAULT_CHANGE_BATCH_LIMIT,
            cond_queue_capacity: DEFAULT_COND_QUEUE_CAPACITY,
            max_non_all_conditions: DEFAULT_MAX_NON_ALL_CONDITIONS,
            cond_retry_attempts: DEFAULT_COND_RETRY_ATTEMPTS,
            cond_retry_backoff_ms: DEFAULT_COND_RETRY_BACKOFF_MS,
            resources: HashMap::new(),
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            refresh_page_size: settings.refresh_page_size.get(),
            refresh_page_pause_ms: settings.refresh_page_pause_ms,
            drain_batch_size: settings.drain_batch_size.get(),
            drain_pause_ms: settings.drain_pause_ms,
            distributed_lock_ttl_secs: settings.distributed_lock_ttl_secs.get(),
            expired_throttle_secs: settings.expired_throttle_secs,
            follower_wait_ms: settings.follower_wait_ms,
            max_request_ids: settings.max_request_ids.get(),
            max_page_limit: settings.max_page_limit.get(),
            change_queue_capacity: settings.change_queue_capacity.get(),
            change_batch_limit: settings.change_batch_limit.get(),
            cond_queue_capacity: settings.cond_queue_capacity.get(),
            max_non_all_conditions: settings.max_non_all_conditions,
            cond_retry_attempts: settings.cond_retry_attempts.get(),
            cond_retry_backoff_ms: settings.cond_retry_backoff_ms,
            resources: settings.resources.clone(),
        }
    }
}

impl CacheConfig {
    /// A configuration without pauses, for tests and embedded use.
    pub fn without_pauses() -> Self {
        Self {
            refresh_page_pause_ms: 0,
            drain_pause_ms: 0,
            cond_retry_backoff_ms: 0,
            ..Self::default()
        }
    }

    pub fn refresh_page_pause(&self) -> Duration {
        Duration::from_millis(self.refresh_page_pause_ms)
    }

    pub fn drain_pause(&self) -> Duration {
        Duration::from_millis(self.drain_pause_ms)
    }

    pub fn distributed_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.distributed_lock_ttl_secs)
    }

    pub fn expired_throttle(&self) -> Duration {
        Duration::from_secs(self.expired_throttle_secs)
    }

    pub fn follower_wait(&self) -> Duration {
        Duration::from_millis(self.follower_wait_ms)
    }

    /// Delay before retry `attempt` (1-based): grows linearly.
    pub fn cond_retry_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.cond_retry_backoff_ms.saturating_mul(u64::from(attempt)))
    }

    /// Refresh page size, never zero.
    pub fn refresh_page_size_non_zero(&self) -> usize {
        self.refresh_page_size.max(1)
    }

    /// Drain batch size, never zero.
    pub fn drain_batch_size_non_zero(&self) -> usize {
        self.drain_batch_size.max(1)
    }
}
