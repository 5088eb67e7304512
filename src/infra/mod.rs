//! Infrastructure adapters and runtime bootstrap.

pub mod cond_store;
pub mod error;
pub mod kv;
pub mod telemetry;
