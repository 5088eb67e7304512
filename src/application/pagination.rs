//! Paging over id-lists and primary-store listings.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PaginationError {
    #[error("page limit must be within 1..={max}, got {limit}")]
    Limit { limit: usize, max: usize },
    #[error("a page may start from a cursor or an offset, not both")]
    CursorWithOffset,
}

/// One page of an ordered id sequence.
///
/// `cursor` is the id key of the last item of the previous page (exclusive);
/// when absent, `offset` counts items from the start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub offset: usize,
    pub limit: usize,
}

impl PageRequest {
    pub fn first(limit: usize) -> Self {
        Self {
            cursor: None,
            offset: 0,
            limit,
        }
    }

    pub fn after(cursor: impl Into<String>, limit: usize) -> Self {
        Self {
            cursor: Some(cursor.into()),
            offset: 0,
            limit,
        }
    }

    pub fn validate(&self, max: usize) -> Result<(), PaginationError> {
        if self.limit == 0 || self.limit > max {
            return Err(PaginationError::Limit {
                limit: self.limit,
                max,
            });
        }
        if self.cursor.is_some() && self.offset > 0 {
            return Err(PaginationError::CursorWithOffset);
        }
        Ok(())
    }
}
