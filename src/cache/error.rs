use thiserror::Error;

use crate::application::cond_store::CondStoreError;
use crate::application::pagination::PaginationError;
use crate::application::source::SourceError;
use crate::domain::error::DomainError;
use crate::domain::filter::FilterError;
use crate::infra::kv::KvError;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid request: {message}")]
    Validation { message: String },
    #[error("{entity} `{key}` not found")]
    NotFound { entity: &'static str, key: String },
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    CondStore(#[from] CondStoreError),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error(transparent)]
    Pagination(#[from] PaginationError),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl CacheError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn not_found(entity: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            key: key.into(),
        }
    }

    /// Caller mistakes: reported before any I/O and never worth retrying.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. }
                | Self::Pagination(_)
                | Self::Filter(FilterError::Invalid { .. } | FilterError::Malformed(_))
                | Self::Domain(DomainError::Validation { .. })
        )
    }
}
