use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{BoundedAdd, Store, StoreOp};
use crate::error::{Error, ErrorDetails};

#[derive(Debug)]
enum Value {
    SortedSet(HashMap<String, i64>),
    Counter(i64),
    Set(HashSet<String>),
    Hash(HashMap<String, String>),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::SortedSet(_) => "zset",
            Value::Counter(_) => "string",
            Value::Set(_) => "set",
            Value::Hash(_) => "hash",
        }
    }
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: HashMap<String, Entry>,
}

impl MemoryState {
    /// Drops `key` if its expiry has passed, then returns the live entry
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let expired = self
            .entries
            .get(key)
            .and_then(|entry| entry.expires_at)
            .is_some_and(|at| at <= Instant::now());
        if expired {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn live_ref(&mut self, key: &str) -> Option<&Entry> {
        self.live(key).map(|entry| &*entry)
    }

    /// Returns the live value at `key`, creating it with `init` if absent
    fn value_or_insert(&mut self, key: &str, init: fn() -> Value) -> &mut Value {
        self.live(key);
        &mut self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry {
                value: init(),
                expires_at: None,
            })
            .value
    }

    /// Drops collections that became empty, the way Redis does
    fn drop_if_empty(&mut self, key: &str) {
        let empty = match self.entries.get(key).map(|entry| &entry.value) {
            Some(Value::SortedSet(members)) => members.is_empty(),
            Some(Value::Set(members)) => members.is_empty(),
            Some(Value::Hash(fields)) => fields.is_empty(),
            _ => false,
        };
        if empty {
            self.entries.remove(key);
        }
    }

    fn apply(&mut self, op: &StoreOp) -> Result<(), Error> {
        match op {
            StoreOp::ZAdd { key, score, member } => {
                match self.value_or_insert(key, || Value::SortedSet(HashMap::new())) {
                    Value::SortedSet(members) => {
                        members.insert(member.clone(), *score);
                    }
                    other => return Err(wrong_type("zadd", key, other)),
                }
            }
            StoreOp::ZRemBelow { key, min_score } => {
                if let Some(entry) = self.live(key) {
                    match &mut entry.value {
                        Value::SortedSet(members) => {
                            members.retain(|_, score| *score >= *min_score);
                        }
                        other => return Err(wrong_type("zremrangebyscore", key, other)),
                    }
                }
                self.drop_if_empty(key);
            }
            StoreOp::Incr { key } => {
                match self.value_or_insert(key, || Value::Counter(0)) {
                    Value::Counter(count) => *count += 1,
                    other => return Err(wrong_type("incr", key, other)),
                }
            }
            StoreOp::Expire { key, ttl } => {
                if let Some(entry) = self.live(key) {
                    entry.expires_at = Some(Instant::now() + *ttl);
                }
            }
            StoreOp::SAdd { key, member } => {
                match self.value_or_insert(key, || Value::Set(HashSet::new())) {
                    Value::Set(members) => {
                        members.insert(member.clone());
                    }
                    other => return Err(wrong_type("sadd", key, other)),
                }
            }
            StoreOp::SRem { key, member } => {
                if let Some(entry) = self.live(key) {
                    match &mut entry.value {
                        Value::Set(members) => {
                            members.remove(member);
                        }
                        other => return Err(wrong_type("srem", key, other)),
                    }
                }
                self.drop_if_empty(key);
            }
            StoreOp::HSet { key, fields } => {
                match self.value_or_insert(key, || Value::Hash(HashMap::new())) {
                    Value::Hash(existing) => {
                        existing.extend(fields.iter().cloned());
                    }
                    other => return Err(wrong_type("hset", key, other)),
                }
            }
            StoreOp::Del { key } => {
                self.entries.remove(key);
            }
        }
        Ok(())
    }
}

fn expected_kind(op: &StoreOp) -> Option<(&str, &'static str)> {
    match op {
        StoreOp::ZAdd { key, .. } | StoreOp::ZRemBelow { key, .. } => Some((key.as_str(), "zset")),
        StoreOp::Incr { key } => Some((key.as_str(), "string")),
        StoreOp::SAdd { key, .. } | StoreOp::SRem { key, .. } => Some((key.as_str(), "set")),
        StoreOp::HSet { key, .. } => Some((key.as_str(), "hash")),
        StoreOp::Expire { .. } | StoreOp::Del { .. } => None,
    }
}

fn wrong_type(operation: &str, key: &str, value: &Value) -> Error {
    Error::new(ErrorDetails::StoreResponse {
        operation: operation.to_string(),
        message: format!("key `{key}` holds a {}", value.kind()),
    })
}

/// In-process [`Store`] with the same semantics as [`RedisStore`](super::RedisStore).
///
/// State is not shared between processes, so this is only suitable for tests and
/// single-instance deployments. Expiry follows `tokio::time`, so paused-clock tests can
/// advance past a TTL.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail as if the store were unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn state(&self, operation: &str) -> Result<MutexGuard<'_, MemoryState>, Error> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorDetails::StoreUnavailable {
                operation: operation.to_string(),
                message: "store is unavailable".to_string(),
            }));
        }
        self.state.lock().map_err(|e| {
            Error::new(ErrorDetails::InternalError {
                message: format!("In-memory store lock poisoned: {e}"),
            })
        })
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn atomic_batch(&self, ops: &[StoreOp]) -> Result<(), Error> {
        let mut state = self.state("atomic_batch")?;
        // Type-check every op up front so a failing batch leaves nothing applied
        for op in ops {
            let Some((key, expected)) = expected_kind(op) else {
                continue;
            };
            if let Some(entry) = state.live_ref(key) {
                if entry.value.kind() != expected {
                    return Err(wrong_type("atomic_batch", key, &entry.value));
                }
            }
        }
        for op in ops {
            state.apply(op)?;
        }
        Ok(())
    }

    async fn zcount_since(&self, key: &str, min_score: i64) -> Result<u64, Error> {
        let mut state = self.state("zcount")?;
        match state.live_ref(key).map(|entry| &entry.value) {
            None => Ok(0),
            Some(Value::SortedSet(members)) => {
                Ok(members.values().filter(|score| **score >= min_score).count() as u64)
            }
            Some(other) => Err(wrong_type("zcount", key, other)),
        }
    }

    async fn znth_since(
        &self,
        key: &str,
        min_score: i64,
        offset: u64,
    ) -> Result<Option<i64>, Error> {
        let mut state = self.state("zrangebyscore")?;
        match state.live_ref(key).map(|entry| &entry.value) {
            None => Ok(None),
            Some(Value::SortedSet(members)) => {
                let mut scores: Vec<i64> = members
                    .values()
                    .copied()
                    .filter(|score| *score >= min_score)
                    .collect();
                scores.sort_unstable();
                Ok(usize::try_from(offset)
                    .ok()
                    .and_then(|offset| scores.get(offset).copied()))
            }
            Some(other) => Err(wrong_type("zrangebyscore", key, other)),
        }
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, Error> {
        let mut state = self.state("ttl")?;
        Ok(state
            .live_ref(key)
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now())))
    }

    async fn get_i64(&self, key: &str) -> Result<Option<i64>, Error> {
        let mut state = self.state("get")?;
        match state.live_ref(key).map(|entry| &entry.value) {
            None => Ok(None),
            Some(Value::Counter(count)) => Ok(Some(*count)),
            Some(other) => Err(wrong_type("get", key, other)),
        }
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, Error> {
        let mut state = self.state("sismember")?;
        match state.live_ref(key).map(|entry| &entry.value) {
            None => Ok(false),
            Some(Value::Set(members)) => Ok(members.contains(member)),
            Some(other) => Err(wrong_type("sismember", key, other)),
        }
    }

    async fn scard(&self, key: &str) -> Result<u64, Error> {
        let mut state = self.state("scard")?;
        match state.live_ref(key).map(|entry| &entry.value) {
            None => Ok(0),
            Some(Value::Set(members)) => Ok(members.len() as u64),
            Some(other) => Err(wrong_type("scard", key, other)),
        }
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, Error> {
        let mut state = self.state("smembers")?;
        match state.live_ref(key).map(|entry| &entry.value) {
            None => Ok(Vec::new()),
            Some(Value::Set(members)) => {
                let mut members: Vec<String> = members.iter().cloned().collect();
                members.sort_unstable();
                Ok(members)
            }
            Some(other) => Err(wrong_type("smembers", key, other)),
        }
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, Error> {
        let mut state = self.state("hgetall")?;
        match state.live_ref(key).map(|entry| &entry.value) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(fields)) => Ok(fields.clone()),
            Some(other) => Err(wrong_type("hgetall", key, other)),
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, Error> {
        let mut state = self.state("scan")?;
        let candidates: Vec<String> = state
            .entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        let mut keys: Vec<String> = candidates
            .into_iter()
            .filter(|key| state.live(key).is_some())
            .collect();
        keys.sort_unstable();
        Ok(keys)
    }

    async fn sadd_bounded(
        &self,
        key: &str,
        member: &str,
        cap: u64,
        ttl: Duration,
    ) -> Result<BoundedAdd, Error> {
        let mut state = self.state("sadd_bounded")?;
        let members = match state.value_or_insert(key, || Value::Set(HashSet::new())) {
            Value::Set(members) => members,
            other => return Err(wrong_type("sadd_bounded", key, other)),
        };
        if members.contains(member) {
            return Ok(BoundedAdd::AlreadyMember);
        }
        if members.len() as u64 >= cap {
            state.drop_if_empty(key);
            return Ok(BoundedAdd::Rejected);
        }
        members.insert(member.to_string());
        if let Some(entry) = state.live(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(BoundedAdd::Added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zadd(key: &str, score: i64, member: &str) -> StoreOp {
        StoreOp::ZAdd {
            key: key.to_string(),
            score,
            member: member.to_string(),
        }
    }

    #[tokio::test]
    async fn test_sorted_set_counts_filter_by_score() {
        let store = InMemoryStore::new();
        store
            .atomic_batch(&[zadd("z", 10, "a"), zadd("z", 20, "b"), zadd("z", 30, "c")])
            .await
            .unwrap();

        assert_eq!(store.zcount_since("z", 20).await.unwrap(), 2);
        assert_eq!(store.zcount_since("z", 31).await.unwrap(), 0);
        assert_eq!(store.znth_since("z", 15, 0).await.unwrap(), Some(20));
        assert_eq!(store.znth_since("z", 15, 1).await.unwrap(), Some(30));
        assert_eq!(store.znth_since("z", 15, 2).await.unwrap(), None);
        assert_eq!(store.zcount_since("missing", 0).await.unwrap(), 0);

        store
            .atomic_batch(&[StoreOp::ZRemBelow {
                key: "z".to_string(),
                min_score: 30,
            }])
            .await
            .unwrap();
        assert_eq!(store.zcount_since("z", 0).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry() {
        let store = InMemoryStore::new();
        store
            .atomic_batch(&[
                StoreOp::Incr {
                    key: "counter".to_string(),
                },
                StoreOp::Expire {
                    key: "counter".to_string(),
                    ttl: Duration::from_secs(10),
                },
            ])
            .await
            .unwrap();
        assert_eq!(
            store.ttl("counter").await.unwrap(),
            Some(Duration::from_secs(10))
        );

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(
            store.ttl("counter").await.unwrap(),
            Some(Duration::from_secs(6))
        );

        tokio::time::advance(Duration::from_secs(7)).await;
        assert_eq!(store.get_i64("counter").await.unwrap(), None);
        assert_eq!(store.ttl("counter").await.unwrap(), None);
        assert!(store.scan_prefix("count").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_batch_applies_nothing() {
        let store = InMemoryStore::new();
        store
            .atomic_batch(&[StoreOp::Incr {
                key: "k".to_string(),
            }])
            .await
            .unwrap();

        let result = store
            .atomic_batch(&[zadd("other", 1, "a"), zadd("k", 1, "a")])
            .await;
        assert!(result.is_err());
        assert_eq!(store.zcount_since("other", 0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sadd_bounded() {
        let store = InMemoryStore::new();
        let ttl = Duration::from_secs(60);
        for (member, expected) in [
            ("a", BoundedAdd::Added),
            ("b", BoundedAdd::Added),
            ("c", BoundedAdd::Rejected),
            ("a", BoundedAdd::AlreadyMember),
        ] {
            assert_eq!(
                store.sadd_bounded("s", member, 2, ttl).await.unwrap(),
                expected,
                "member {member}"
            );
        }
        assert_eq!(store.smembers("s").await.unwrap(), vec!["a", "b"]);
        assert!(store.ttl("s").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unavailable() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);
        let err = store.scard("s").await.unwrap_err();
        assert!(err.is_store_failure());

        store.set_unavailable(false);
        assert_eq!(store.scard("s").await.unwrap(), 0);
    }
}
