use std::sync::Arc;
use std::time::Duration;

use strum::IntoEnumIterator;
use uuid::Uuid;

use super::{total_key, total_key_prefix, UsageWindow};
use crate::error::Error;
use crate::store::{Store, StoreOp};

/// Keys compacted per atomic batch
const COMPACTION_BATCH_SIZE: usize = 100;

/// Window-aware accounting on top of a [`Store`].
///
/// Every windowed collection is a sorted set of charge timestamps. Reads always filter by score,
/// so entries that compaction has not removed yet are never counted.
#[derive(Clone)]
pub struct SharedCounterStore {
    store: Arc<dyn Store>,
}

impl SharedCounterStore {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Charges one request at `now` to every window and the total counter in a single atomic batch,
    /// re-applying each window's expiry
    pub async fn increment(&self, credential: &str, now: i64) -> Result<(), Error> {
        let member = format!("{now}:{}", Uuid::now_v7());
        let mut ops = Vec::with_capacity(2 * 4 + 1);
        for window in UsageWindow::iter() {
            let key = window.key(credential);
            ops.push(StoreOp::ZAdd {
                key: key.clone(),
                score: now,
                member: member.clone(),
            });
            ops.push(StoreOp::Expire {
                key,
                ttl: window.length(),
            });
        }
        ops.push(StoreOp::Incr {
            key: total_key(credential),
        });
        self.store.atomic_batch(&ops).await
    }

    /// Number of charges in `window` at or after `threshold`
    pub async fn count_since(
        &self,
        credential: &str,
        window: UsageWindow,
        threshold: i64,
    ) -> Result<u64, Error> {
        self.store
            .zcount_since(&window.key(credential), threshold)
            .await
    }

    /// Time until the oldest in-window charge leaves `window`, skipping the `skip` oldest ones:
    /// with `skip = n`, this is how long until `n + 1` charges have left. Falls back to the key's
    /// own TTL when there is no such charge, and is zero when the key does not exist.
    pub async fn expiry_remaining(
        &self,
        credential: &str,
        window: UsageWindow,
        now: i64,
        skip: u64,
    ) -> Result<Duration, Error> {
        let key = window.key(credential);
        let length = window.length_secs();
        if let Some(charged_at) = self.store.znth_since(&key, window.start(now), skip).await? {
            let remaining = (charged_at + length - now).clamp(0, length);
            return Ok(Duration::from_secs(u64::try_from(remaining).unwrap_or(0)));
        }
        Ok(self.store.ttl(&key).await?.unwrap_or(Duration::ZERO))
    }

    pub async fn total(&self, credential: &str) -> Result<i64, Error> {
        Ok(self
            .store
            .get_i64(&total_key(credential))
            .await?
            .unwrap_or(0))
    }

    /// Every credential that has ever been charged
    pub async fn credentials(&self) -> Result<Vec<String>, Error> {
        let prefix = total_key_prefix();
        Ok(self
            .store
            .scan_prefix(&prefix)
            .await?
            .into_iter()
            .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    /// Removes expired charges from every window of every credential. Returns the number of keys visited.
    pub async fn compact(&self, now: i64) -> Result<usize, Error> {
        let mut visited = 0;
        for window in UsageWindow::iter() {
            let min_score = window.start(now);
            let keys = self.store.scan_prefix(&window.key_prefix()).await?;
            for chunk in keys.chunks(COMPACTION_BATCH_SIZE) {
                let ops: Vec<StoreOp> = chunk
                    .iter()
                    .map(|key| StoreOp::ZRemBelow {
                        key: key.clone(),
                        min_score,
                    })
                    .collect();
                self.store.atomic_batch(&ops).await?;
                visited += chunk.len();
            }
        }
        Ok(visited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    const NOW: i64 = 1_700_000_000;

    fn counter() -> SharedCounterStore {
        SharedCounterStore::new(Arc::new(InMemoryStore::new()))
    }

    #[tokio::test]
    async fn test_increment_charges_every_window() {
        let counter = counter();
        counter.increment("tok", NOW).await.unwrap();
        counter.increment("tok", NOW).await.unwrap();

        for window in UsageWindow::iter() {
            assert_eq!(
                counter
                    .count_since("tok", window, window.start(NOW))
                    .await
                    .unwrap(),
                2,
                "window {window:?}"
            );
        }
        assert_eq!(counter.total("tok").await.unwrap(), 2);
        assert_eq!(counter.total("other").await.unwrap(), 0);
        assert_eq!(counter.credentials().await.unwrap(), vec!["tok"]);
    }

    #[tokio::test]
    async fn test_count_since_excludes_stale_entries() {
        let counter = counter();
        let window = UsageWindow::ThreeHours;
        // Charged exactly 3h ago, never compacted
        counter
            .increment("tok", NOW - window.length_secs())
            .await
            .unwrap();
        counter.increment("tok", NOW - 60).await.unwrap();

        let count = counter
            .count_since("tok", window, window.start(NOW))
            .await
            .unwrap();
        assert_eq!(count, 1);
        // Still inside the 12h window
        let count = counter
            .count_since(
                "tok",
                UsageWindow::TwelveHours,
                UsageWindow::TwelveHours.start(NOW),
            )
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_expiry_remaining_tracks_oldest_charge() {
        let counter = counter();
        let window = UsageWindow::ThreeHours;
        counter.increment("tok", NOW - 100).await.unwrap();
        counter.increment("tok", NOW - 10).await.unwrap();

        let remaining = counter
            .expiry_remaining("tok", window, NOW, 0)
            .await
            .unwrap();
        assert_eq!(remaining, Duration::from_secs(10800 - 100));

        // Both charges have to leave
        let remaining = counter
            .expiry_remaining("tok", window, NOW, 1)
            .await
            .unwrap();
        assert_eq!(remaining, Duration::from_secs(10800 - 10));

        let remaining = counter
            .expiry_remaining("missing", window, NOW, 0)
            .await
            .unwrap();
        assert_eq!(remaining, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_compact_removes_only_expired_entries() {
        let counter = counter();
        let old = NOW - UsageWindow::ThreeHours.length_secs() - 5;
        counter.increment("tok", old).await.unwrap();
        counter.increment("tok", NOW).await.unwrap();

        let visited = counter.compact(NOW).await.unwrap();
        assert_eq!(visited, 4);

        // Only the 3h window dropped the old charge
        let store = counter.store();
        assert_eq!(
            store
                .zcount_since(&UsageWindow::ThreeHours.key("tok"), 0)
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            store
                .zcount_since(&UsageWindow::TwelveHours.key("tok"), 0)
                .await
                .unwrap(),
            2
        );
        assert_eq!(counter.total("tok").await.unwrap(), 2);
    }
}
