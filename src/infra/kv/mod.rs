//! Key-value store abstraction the cache is written against.
//!
//! The command set mirrors what the cache needs from a Redis-like server:
//! plain strings with TTL, create-if-absent, ordered sets with score and
//! lexicographic range reads, and an atomic batch that may rename keys.

mod memory;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryKvStore;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KvError {
    #[error("key-value backend error: {message}")]
    Backend { message: String },
    #[error("key `{key}` holds a value of the wrong kind")]
    WrongType { key: String },
    #[error("no such key `{key}`")]
    NoSuchKey { key: String },
}

impl KvError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMember {
    pub member: String,
    pub score: f64,
}

impl ScoredMember {
    pub fn new(member: impl Into<String>, score: f64) -> Self {
        Self {
            member: member.into(),
            score,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Set {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    SetNx {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    Del {
        keys: Vec<String>,
    },
    ZAdd {
        key: String,
        members: Vec<ScoredMember>,
    },
    ZRem {
        key: String,
        members: Vec<String>,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
    /// Replaces any existing destination. Fails with
    /// [`KvError::NoSuchKey`] when the source is missing.
    Rename {
        from: String,
        to: String,
    },
}

/// Outcome of one command in a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Done,
    Flag(bool),
    Count(u64),
}

/// Ordered batch of commands executed as one atomic unit.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    commands: Vec<Command>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>, ttl: Duration) -> &mut Self {
        self.push(Command::Set {
            key: key.into(),
            value: value.into(),
            ttl: Some(ttl),
        })
    }

    pub fn set_nx(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
        ttl: Duration,
    ) -> &mut Self {
        self.push(Command::SetNx {
            key: key.into(),
            value: value.into(),
            ttl: Some(ttl),
        })
    }

    pub fn del(&mut self, keys: Vec<String>) -> &mut Self {
        if keys.is_empty() {
            return self;
        }
        self.push(Command::Del { keys })
    }

    pub fn zadd(&mut self, key: impl Into<String>, members: Vec<ScoredMember>) -> &mut Self {
        if members.is_empty() {
            return self;
        }
        self.push(Command::ZAdd {
            key: key.into(),
            members,
        })
    }

    pub fn zrem(&mut self, key: impl Into<String>, members: Vec<String>) -> &mut Self {
        if members.is_empty() {
            return self;
        }
        self.push(Command::ZRem {
            key: key.into(),
            members,
        })
    }

    pub fn expire(&mut self, key: impl Into<String>, ttl: Duration) -> &mut Self {
        self.push(Command::Expire {
            key: key.into(),
            ttl,
        })
    }

    pub fn rename(&mut self, from: impl Into<String>, to: impl Into<String>) -> &mut Self {
        self.push(Command::Rename {
            from: from.into(),
            to: to.into(),
        })
    }

    pub fn into_commands(self) -> Vec<Command> {
        self.commands
    }
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, KvError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError>;

    /// Returns `true` when the key was created.
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>)
    -> Result<bool, KvError>;

    async fn del(&self, keys: &[String]) -> Result<u64, KvError>;

    /// Delete `key` only while it still holds `expected`.
    async fn compare_and_del(&self, key: &str, expected: &str) -> Result<bool, KvError>;

    async fn exists(&self, key: &str) -> Result<bool, KvError>;

    async fn zcard(&self, key: &str) -> Result<u64, KvError>;

    /// Members by rank, starting at `offset`.
    async fn zrange(&self, key: &str, offset: usize, limit: usize) -> Result<Vec<String>, KvError>;

    /// Members with a score strictly greater than `min`, ascending.
    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        limit: usize,
    ) -> Result<Vec<String>, KvError>;

    /// Members lexicographically greater than `min`, ascending.
    async fn zrange_by_lex(
        &self,
        key: &str,
        min: &str,
        limit: usize,
    ) -> Result<Vec<String>, KvError>;

    /// Remove the members ranked `start..=stop`.
    async fn zrem_range_by_rank(&self, key: &str, start: usize, stop: usize)
    -> Result<u64, KvError>;

    /// Execute every command in order, atomically with respect to other
    /// callers. Execution stops at the first failing command.
    async fn exec(&self, pipeline: Pipeline) -> Result<Vec<Reply>, KvError>;
}
