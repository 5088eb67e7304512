//! Resource cache engine.
//!
//! Caches serialized records, business-unique-key lookups and materialized
//! id-lists in a shared key-value store, keeps them consistent with the
//! primary store's change feed, and materializes only the subsets selected
//! by full-sync conditions unless a resource type caches everything.
//!
//! ## Configuration
//!
//! Engine tuning is read from the `[cache]` table:
//!
//! ```toml
//! [cache]
//! refresh_page_size = 500
//! expired_throttle_secs = 60
//!
//! [cache.resources.host]
//! ttl_secs = 1800
//! # ... see config.rs for all options
//! ```

mod config;
mod context;
mod detail;
mod error;
mod events;
mod full_sync_cond;
mod id_list;
mod ingest;
mod keys;
pub(crate) mod lock;
mod registry;
mod resource;
mod set;
mod unique_key;

pub use config::{CacheConfig, ResourceOverride};
pub use detail::{ListDetailByIds, RefreshDetailByIds};
pub use error::CacheError;
pub use events::{
    ChangeEvent, CondEvent, Envelope, Epoch, EventQueue, EventReceiver, Operation, QueueError,
    channel,
};
pub use full_sync_cond::{FullSyncCondPage, FullSyncCondService, ListFullSyncCond};
pub use id_list::{ListState, RefreshOutcome};
pub use keys::{IdKey, IdListKind, KeyScheme, expire_key, lock_key, temp_pointer_key};
pub use lock::{Acquire, RefreshGuard, RefreshWaiter, RefreshingLock};
pub use registry::{FullSyncCondInfo, FullSyncCondRegistry, WatchScope};
pub use resource::{ListDetail, ListDetailPage, ResourceCache};
pub use set::{CacheSet, CacheSetBuilder, ListCacheByFullSyncCond, ResourceRegistration};
pub use unique_key::ListDetailByUniqueKey;
