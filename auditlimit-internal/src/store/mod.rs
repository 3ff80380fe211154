//! The shared key-value store behind usage accounting and the device registry.
//!
//! All state that must be consistent across instances goes through [`Store`]. Mutations are
//! only expressed as an [`atomic_batch`](Store::atomic_batch) of [`StoreOp`]s so that a crash
//! mid-update cannot leave half of a logical change applied.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use crate::error::{Error, ErrorDetails};

pub mod memory;
pub mod redis_store;

pub use memory::InMemoryStore;
pub use redis_store::RedisStore;

#[cfg(test)]
pub(crate) mod test_util;

/// A single mutation inside an atomic batch
#[derive(Clone, Debug, PartialEq)]
pub enum StoreOp {
    /// Add `member` to the sorted set at `key` with the given score
    ZAdd {
        key: String,
        score: i64,
        member: String,
    },
    /// Remove every member of the sorted set at `key` scored strictly below `min_score`
    ZRemBelow { key: String, min_score: i64 },
    Incr { key: String },
    Expire { key: String, ttl: Duration },
    SAdd { key: String, member: String },
    SRem { key: String, member: String },
    HSet {
        key: String,
        fields: Vec<(String, String)>,
    },
    Del { key: String },
}

/// Outcome of [`Store::sadd_bounded`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoundedAdd {
    AlreadyMember,
    Added,
    /// The set was at its cap; nothing was written
    Rejected,
}

/// Runs one store interaction, failing with `StoreTimeout` if it does not finish within `limit`
pub async fn with_timeout<T, E, F>(operation: &str, limit: Duration, fut: F) -> Result<T, Error>
where
    E: Display,
    F: Future<Output = Result<T, E>>,
{
    match timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(Error::new(ErrorDetails::StoreUnavailable {
            operation: operation.to_string(),
            message: e.to_string(),
        })),
        Err(_) => Err(Error::new(ErrorDetails::StoreTimeout {
            operation: operation.to_string(),
            timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        })),
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Applies all operations atomically, in order, in a single round trip
    async fn atomic_batch(&self, ops: &[StoreOp]) -> Result<(), Error>;

    /// Number of sorted-set members scored at or above `min_score`
    async fn zcount_since(&self, key: &str, min_score: i64) -> Result<u64, Error>;

    /// Score of the member at position `offset` (0 is the lowest) among those scored at or above
    /// `min_score`, if there are that many
    async fn znth_since(
        &self,
        key: &str,
        min_score: i64,
        offset: u64,
    ) -> Result<Option<i64>, Error>;

    /// Remaining time to live. `None` when the key is absent or has no expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, Error>;

    async fn get_i64(&self, key: &str) -> Result<Option<i64>, Error>;

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, Error>;

    async fn scard(&self, key: &str) -> Result<u64, Error>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>, Error>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, Error>;

    /// All keys starting with `prefix`
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, Error>;

    /// Adds `member` to the set at `key` only if the resulting cardinality stays within `cap`,
    /// re-applying `ttl` to the set when it adds
    async fn sadd_bounded(
        &self,
        key: &str,
        member: &str,
        cap: u64,
        ttl: Duration,
    ) -> Result<BoundedAdd, Error>;
}
