//! In-process [`KvStore`] with Redis-compatible semantics for the commands
//! the cache uses. Expired keys are evicted lazily on access.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::cache::lock::mutex_lock;

use super::{Command, KvError, KvStore, Pipeline, Reply};

const SOURCE: &str = "infra::kv::memory";

#[derive(Debug, Clone)]
struct Ranked {
    score: f64,
    member: String,
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked {}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| self.member.cmp(&other.member))
    }
}

#[derive(Debug, Clone, Default)]
struct SortedSet {
    scores: HashMap<String, f64>,
    order: BTreeSet<Ranked>,
}

impl SortedSet {
    fn insert(&mut self, member: &str, score: f64) -> bool {
        let created = match self.scores.insert(member.to_string(), score) {
            Some(previous) => {
                self.order.remove(&Ranked {
                    score: previous,
                    member: member.to_string(),
                });
                false
            }
            None => true,
        };
        self.order.insert(Ranked {
            score,
            member: member.to_string(),
        });
        created
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.order.remove(&Ranked {
                    score,
                    member: member.to_string(),
                });
                true
            }
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.scores.len()
    }

    fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Sorted(SortedSet),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

type Keyspace = HashMap<String, Entry>;

/// In-memory key-value store.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    keyspace: Mutex<Keyspace>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remaining time to live of `key`, `None` when missing or persistent.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let mut keyspace = mutex_lock(&self.keyspace, SOURCE, "ttl");
        let now = Instant::now();
        live(&mut keyspace, key, now)
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Live keys starting with `prefix`, sorted.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let keyspace = mutex_lock(&self.keyspace, SOURCE, "keys_with_prefix");
        let now = Instant::now();
        let mut keys: Vec<String> = keyspace
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    fn with_sorted<T>(
        &self,
        key: &str,
        op: &'static str,
        read: impl FnOnce(&SortedSet) -> T,
        empty: T,
    ) -> Result<T, KvError> {
        let mut keyspace = mutex_lock(&self.keyspace, SOURCE, op);
        match live(&mut keyspace, key, Instant::now()) {
            None => Ok(empty),
            Some(Entry {
                value: Value::Sorted(set),
                ..
            }) => Ok(read(&*set)),
            Some(_) => Err(wrong_type(key)),
        }
    }
}

fn live<'a>(keyspace: &'a mut Keyspace, key: &str, now: Instant) -> Option<&'a mut Entry> {
    let expired = keyspace.get(key).is_some_and(|entry| !entry.is_live(now));
    if expired {
        keyspace.remove(key);
        return None;
    }
    keyspace.get_mut(key)
}

fn wrong_type(key: &str) -> KvError {
    KvError::WrongType {
        key: key.to_string(),
    }
}

fn expiry(ttl: Option<Duration>, now: Instant) -> Option<Instant> {
    ttl.map(|ttl| now + ttl)
}

fn get_string(keyspace: &mut Keyspace, key: &str, now: Instant) -> Result<Option<String>, KvError> {
    match live(keyspace, key, now) {
        None => Ok(None),
        Some(Entry {
            value: Value::Str(value),
            ..
        }) => Ok(Some(value.clone())),
        Some(_) => Err(wrong_type(key)),
    }
}

fn apply(keyspace: &mut Keyspace, command: Command, now: Instant) -> Result<Reply, KvError> {
    match command {
        Command::Set { key, value, ttl } => {
            keyspace.insert(
                key,
                Entry {
                    value: Value::Str(value),
                    expires_at: expiry(ttl, now),
                },
            );
            Ok(Reply::Done)
        }
        Command::SetNx { key, value, ttl } => {
            if live(keyspace, &key, now).is_some() {
                return Ok(Reply::Flag(false));
            }
            keyspace.insert(
                key,
                Entry {
                    value: Value::Str(value),
                    expires_at: expiry(ttl, now),
                },
            );
            Ok(Reply::Flag(true))
        }
        Command::Del { keys } => {
            let mut removed = 0;
            for key in keys {
                if live(keyspace, &key, now).is_some() {
                    keyspace.remove(&key);
                    removed += 1;
                }
            }
            Ok(Reply::Count(removed))
        }
        Command::ZAdd { key, members } => {
            if live(keyspace, &key, now).is_none() {
                keyspace.insert(
                    key.clone(),
                    Entry {
                        value: Value::Sorted(SortedSet::default()),
                        expires_at: None,
                    },
                );
            }
            let Some(Entry {
                value: Value::Sorted(set),
                ..
            }) = keyspace.get_mut(&key)
            else {
                return Err(wrong_type(&key));
            };
            let added = members
                .iter()
                .filter(|scored| set.insert(&scored.member, scored.score))
                .count();
            Ok(Reply::Count(added as u64))
        }
        Command::ZRem { key, members } => {
            let removed = match live(keyspace, &key, now) {
                None => 0,
                Some(Entry {
                    value: Value::Sorted(set),
                    ..
                }) => members.iter().filter(|member| set.remove(member)).count(),
                Some(_) => return Err(wrong_type(&key)),
            };
            drop_if_empty(keyspace, &key);
            Ok(Reply::Count(removed as u64))
        }
        Command::Expire { key, ttl } => match live(keyspace, &key, now) {
            Some(entry) => {
                entry.expires_at = Some(now + ttl);
                Ok(Reply::Flag(true))
            }
            None => Ok(Reply::Flag(false)),
        },
        Command::Rename { from, to } => {
            if live(keyspace, &from, now).is_none() {
                return Err(KvError::NoSuchKey { key: from });
            }
            if let Some(entry) = keyspace.remove(&from) {
                keyspace.insert(to, entry);
            }
            Ok(Reply::Done)
        }
    }
}

// Sorted sets never linger empty.
fn drop_if_empty(keyspace: &mut Keyspace, key: &str) {
    let empty = matches!(
        keyspace.get(key),
        Some(Entry {
            value: Value::Sorted(set),
            ..
        }) if set.is_empty()
    );
    if empty {
        keyspace.remove(key);
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut keyspace = mutex_lock(&self.keyspace, SOURCE, "get");
        get_string(&mut keyspace, key, Instant::now())
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, KvError> {
        let mut keyspace = mutex_lock(&self.keyspace, SOURCE, "mget");
        let now = Instant::now();
        // Non-string values read as missing, as MGET does.
        Ok(keys
            .iter()
            .map(|key| get_string(&mut keyspace, key, now).unwrap_or(None))
            .collect())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut keyspace = mutex_lock(&self.keyspace, SOURCE, "set");
        let command = Command::Set {
            key: key.to_string(),
            value: value.to_string(),
            ttl,
        };
        apply(&mut keyspace, command, Instant::now()).map(|_| ())
    }

    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError> {
        let mut keyspace = mutex_lock(&self.keyspace, SOURCE, "set_nx");
        let command = Command::SetNx {
            key: key.to_string(),
            value: value.to_string(),
            ttl,
        };
        let reply = apply(&mut keyspace, command, Instant::now())?;
        Ok(reply == Reply::Flag(true))
    }

    async fn del(&self, keys: &[String]) -> Result<u64, KvError> {
        let mut keyspace = mutex_lock(&self.keyspace, SOURCE, "del");
        let command = Command::Del {
            keys: keys.to_vec(),
        };
        match apply(&mut keyspace, command, Instant::now())? {
            Reply::Count(count) => Ok(count),
            _ => Ok(0),
        }
    }

    async fn compare_and_del(&self, key: &str, expected: &str) -> Result<bool, KvError> {
        let mut keyspace = mutex_lock(&self.keyspace, SOURCE, "compare_and_del");
        let current = get_string(&mut keyspace, key, Instant::now())?;
        if current.as_deref() == Some(expected) {
            keyspace.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        let mut keyspace = mutex_lock(&self.keyspace, SOURCE, "exists");
        Ok(live(&mut keyspace, key, Instant::now()).is_some())
    }

    async fn zcard(&self, key: &str) -> Result<u64, KvError> {
        self.with_sorted(key, "zcard", |set| set.len() as u64, 0)
    }

    async fn zrange(&self, key: &str, offset: usize, limit: usize) -> Result<Vec<String>, KvError> {
        self.with_sorted(
            key,
            "zrange",
            |set| {
                set.order
                    .iter()
                    .skip(offset)
                    .take(limit)
                    .map(|ranked| ranked.member.clone())
                    .collect()
            },
            Vec::new(),
        )
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        limit: usize,
    ) -> Result<Vec<String>, KvError> {
        self.with_sorted(
            key,
            "zrange_by_score",
            |set| {
                set.order
                    .iter()
                    .skip_while(|ranked| ranked.score <= min)
                    .take(limit)
                    .map(|ranked| ranked.member.clone())
                    .collect()
            },
            Vec::new(),
        )
    }

    async fn zrange_by_lex(
        &self,
        key: &str,
        min: &str,
        limit: usize,
    ) -> Result<Vec<String>, KvError> {
        self.with_sorted(
            key,
            "zrange_by_lex",
            |set| {
                set.order
                    .iter()
                    .filter(|ranked| ranked.member.as_str() > min)
                    .take(limit)
                    .map(|ranked| ranked.member.clone())
                    .collect()
            },
            Vec::new(),
        )
    }

    async fn zrem_range_by_rank(
        &self,
        key: &str,
        start: usize,
        stop: usize,
    ) -> Result<u64, KvError> {
        let mut keyspace = mutex_lock(&self.keyspace, SOURCE, "zrem_range_by_rank");
        let removed = match live(&mut keyspace, key, Instant::now()) {
            None => 0,
            Some(Entry {
                value: Value::Sorted(set),
                ..
            }) => {
                let doomed: Vec<String> = set
                    .order
                    .iter()
                    .skip(start)
                    .take(stop.saturating_sub(start) + 1)
                    .map(|ranked| ranked.member.clone())
                    .collect();
                doomed.iter().filter(|member| set.remove(member)).count()
            }
            Some(_) => return Err(wrong_type(key)),
        };
        drop_if_empty(&mut keyspace, key);
        Ok(removed as u64)
    }

    async fn exec(&self, pipeline: Pipeline) -> Result<Vec<Reply>, KvError> {
        let mut keyspace = mutex_lock(&self.keyspace, SOURCE, "exec");
        let now = Instant::now();
        pipeline
            .into_commands()
            .into_iter()
            .map(|command| apply(&mut keyspace, command, now))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::kv::ScoredMember;

    #[tokio::test]
    async fn set_nx_only_creates_missing_keys() {
        let store = MemoryKvStore::new();
        assert!(store.set_nx("k", "a", None).await.expect("set_nx"));
        assert!(!store.set_nx("k", "b", None).await.expect("set_nx"));
        assert_eq!(store.get("k").await.expect("get"), Some("a".to_string()));
    }

    #[tokio::test]
    async fn expired_keys_read_as_missing() {
        let store = MemoryKvStore::new();
        store
            .set("k", "v", Some(Duration::from_millis(5)))
            .await
            .expect("set");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.get("k").await.expect("get"), None);
        assert!(store.set_nx("k", "w", None).await.expect("set_nx"));
    }

    #[tokio::test]
    async fn sorted_set_ranges_follow_score_then_member() {
        let store = MemoryKvStore::new();
        let mut pipeline = Pipeline::new();
        pipeline.zadd(
            "z",
            vec![
                ScoredMember::new("3", 3.0),
                ScoredMember::new("1", 1.0),
                ScoredMember::new("2", 2.0),
            ],
        );
        store.exec(pipeline).await.expect("exec");

        assert_eq!(store.zcard("z").await.expect("zcard"), 3);
        assert_eq!(
            store.zrange("z", 1, 10).await.expect("zrange"),
            vec!["2".to_string(), "3".to_string()]
        );
        assert_eq!(
            store.zrange_by_score("z", 1.0, 1).await.expect("by score"),
            vec!["2".to_string()]
        );

        let mut pipeline = Pipeline::new();
        pipeline.zadd(
            "lex",
            vec![ScoredMember::new("b", 0.0), ScoredMember::new("a", 0.0)],
        );
        store.exec(pipeline).await.expect("exec");
        assert_eq!(
            store.zrange_by_lex("lex", "a", 5).await.expect("by lex"),
            vec!["b".to_string()]
        );
    }

    #[tokio::test]
    async fn rename_moves_value_and_ttl() {
        let store = MemoryKvStore::new();
        let mut pipeline = Pipeline::new();
        pipeline
            .zadd("src", vec![ScoredMember::new("1", 1.0)])
            .expire("src", Duration::from_secs(60))
            .rename("src", "dst");
        store.exec(pipeline).await.expect("exec");

        assert!(!store.exists("src").await.expect("exists"));
        assert_eq!(store.zcard("dst").await.expect("zcard"), 1);
        assert!(store.ttl("dst").is_some());
    }

    #[tokio::test]
    async fn pipeline_stops_at_first_failure() {
        let store = MemoryKvStore::new();
        let mut pipeline = Pipeline::new();
        pipeline
            .set("a", "1", Duration::from_secs(60))
            .rename("missing", "b")
            .set("c", "1", Duration::from_secs(60));
        let err = store.exec(pipeline).await.expect_err("rename fails");

        assert!(matches!(err, KvError::NoSuchKey { .. }));
        assert!(store.exists("a").await.expect("exists"));
        assert!(!store.exists("c").await.expect("exists"));
    }

    #[tokio::test]
    async fn rename_replaces_existing_destination() {
        let store = MemoryKvStore::new();
        store.set("from", "x", None).await.expect("set");
        store.set("to", "y", None).await.expect("set");
        let mut pipeline = Pipeline::new();
        pipeline.rename("from", "to");
        let replies = store.exec(pipeline).await.expect("exec");

        assert_eq!(replies, vec![Reply::Done]);
        assert_eq!(store.get("to").await.expect("get"), Some("x".to_string()));
        assert!(!store.exists("from").await.expect("exists"));
    }

    #[tokio::test]
    async fn removing_by_rank_drains_and_drops_the_key() {
        let store = MemoryKvStore::new();
        let members = (1..=5)
            .map(|id| ScoredMember::new(id.to_string(), f64::from(id)))
            .collect();
        let mut pipeline = Pipeline::new();
        pipeline.zadd("z", members);
        store.exec(pipeline).await.expect("exec");

        assert_eq!(store.zrem_range_by_rank("z", 0, 2).await.expect("zrem"), 3);
        assert_eq!(
            store.zrange("z", 0, 10).await.expect("zrange"),
            vec!["4".to_string(), "5".to_string()]
        );
        assert_eq!(store.zrem_range_by_rank("z", 0, 2).await.expect("zrem"), 2);
        assert!(!store.exists("z").await.expect("exists"));
    }

    #[tokio::test]
    async fn compare_and_del_requires_matching_owner() {
        let store = MemoryKvStore::new();
        store.set("lock", "rid-1", None).await.expect("set");
        assert!(!store.compare_and_del("lock", "rid-2").await.expect("cad"));
        assert!(store.compare_and_del("lock", "rid-1").await.expect("cad"));
        assert!(!store.exists("lock").await.expect("exists"));
    }
}
