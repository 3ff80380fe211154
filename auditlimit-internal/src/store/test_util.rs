use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{with_timeout, BoundedAdd, InMemoryStore, Store, StoreOp};
use crate::error::{Error, ErrorDetails};

/// How long a hung read waits before it times out
pub(crate) const HUNG_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// An [`InMemoryStore`] that misbehaves on demand
#[derive(Default)]
pub(crate) struct FaultyStore {
    pub inner: InMemoryStore,
    /// Fail any batch that increments a counter, i.e. a usage charge
    pub fail_charges: AtomicBool,
    /// Sorted-set reads never answer and run into [`HUNG_READ_TIMEOUT`]
    pub hang_window_reads: AtomicBool,
    /// Membership checks report `false`, as if another replica added the member in between
    pub stale_membership: AtomicBool,
}

impl FaultyStore {
    async fn hang_if_set<T>(&self, operation: &str) -> Result<(), Error> {
        if self.hang_window_reads.load(Ordering::SeqCst) {
            let hung = std::future::pending::<Result<T, String>>();
            with_timeout(operation, HUNG_READ_TIMEOUT, hung).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Store for FaultyStore {
    async fn atomic_batch(&self, ops: &[StoreOp]) -> Result<(), Error> {
        let is_charge = ops.iter().any(|op| matches!(op, StoreOp::Incr { .. }));
        if is_charge && self.fail_charges.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorDetails::StoreTimeout {
                operation: "atomic_batch".to_string(),
                timeout_ms: 500,
            }));
        }
        self.inner.atomic_batch(ops).await
    }

    async fn zcount_since(&self, key: &str, min_score: i64) -> Result<u64, Error> {
        self.hang_if_set::<u64>("zcount").await?;
        self.inner.zcount_since(key, min_score).await
    }

    async fn znth_since(
        &self,
        key: &str,
        min_score: i64,
        offset: u64,
    ) -> Result<Option<i64>, Error> {
        self.hang_if_set::<Option<i64>>("zrangebyscore").await?;
        self.inner.znth_since(key, min_score, offset).await
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, Error> {
        self.inner.ttl(key).await
    }

    async fn get_i64(&self, key: &str) -> Result<Option<i64>, Error> {
        self.inner.get_i64(key).await
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, Error> {
        if self.stale_membership.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.inner.sismember(key, member).await
    }

    async fn scard(&self, key: &str) -> Result<u64, Error> {
        self.inner.scard(key).await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, Error> {
        self.inner.smembers(key).await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, Error> {
        self.inner.hgetall(key).await
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, Error> {
        self.inner.scan_prefix(prefix).await
    }

    async fn sadd_bounded(
        &self,
        key: &str,
        member: &str,
        cap: u64,
        ttl: Duration,
    ) -> Result<BoundedAdd, Error> {
        self.inner.sadd_bounded(key, member, cap, ttl).await
    }
}
