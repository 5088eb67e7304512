//! Collaborator contracts and request types shared by the cache services.

pub mod cond_store;
pub mod pagination;
pub mod source;
