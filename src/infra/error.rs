use thiserror::Error;

use crate::config::LoadError;

/// Failures while bootstrapping the process around the cache engine.
#[derive(Debug, Error)]
pub enum InfraError {
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
    #[error(transparent)]
    Config(#[from] LoadError),
}

impl InfraError {
    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }
}
