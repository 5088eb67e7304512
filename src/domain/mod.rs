//! Domain layer types and invariants.

pub mod error;
pub mod filter;
pub mod full_sync_cond;
pub mod resource;
pub mod tenant;
