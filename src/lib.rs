//! Read-through cache and partial-materialization engine for document-store
//! resources.
//!
//! A [`cache::CacheSet`] owns one [`cache::ResourceCache`] per registered
//! resource type. Each resource cache keeps detail records, a unique-key index
//! and materialized id-lists in a shared key-value store, and is kept
//! consistent by replaying the primary store's change feed.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
