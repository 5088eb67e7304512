use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("validation failed: {message}")]
    Validation { message: String },
    /// A record read from the primary store lacks the identity its resource needs.
    #[error("{resource} record rejected: {reason}")]
    InvalidRecord { resource: String, reason: String },
    #[error("full sync cond {id} rejected: {reason}")]
    InvalidCond { id: i64, reason: String },
}

impl DomainError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn invalid_record(resource: &str, reason: impl Into<String>) -> Self {
        Self::InvalidRecord {
            resource: resource.to_string(),
            reason: reason.into(),
        }
    }
}
