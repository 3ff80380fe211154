use std::sync::Arc;
use std::time::Duration;

use strum::IntoEnumIterator;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use super::{get_unix_timestamp, SharedCounterStore, UsageStats, UsageWindow};
use crate::error::Error;

#[derive(Clone, Debug)]
pub struct UsageTrackerConfig {
    /// Requests allowed per primary window
    pub limit: u32,
    pub window: UsageWindow,
    pub compaction_interval: Duration,
}

impl Default for UsageTrackerConfig {
    fn default() -> Self {
        Self {
            limit: 40,
            window: UsageWindow::PRIMARY,
            compaction_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Outcome of a quota check that reached the store
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuotaCheck {
    Within { remaining: i64 },
    Exceeded { wait: Duration },
}

/// Sliding-window quota accounting for every credential
pub struct UsageTracker {
    counter: Arc<SharedCounterStore>,
    config: UsageTrackerConfig,
    compaction_handle: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl UsageTracker {
    pub fn new(counter: SharedCounterStore, config: UsageTrackerConfig) -> Self {
        Self {
            counter: Arc::new(counter),
            config,
            compaction_handle: Arc::new(RwLock::new(None)),
        }
    }

    pub fn limit(&self) -> u32 {
        self.config.limit
    }

    pub fn window(&self) -> UsageWindow {
        self.config.window
    }

    /// `limit` minus the charges in the primary window ending at `now`; negative when over quota
    pub async fn remaining(&self, credential: &str, now: i64) -> Result<i64, Error> {
        let window = self.config.window;
        let used = self
            .counter
            .count_since(credential, window, window.start(now))
            .await?;
        Ok(i64::from(self.config.limit) - i64::try_from(used).unwrap_or(i64::MAX))
    }

    /// Time until one more request fits in `window` given `remaining` from [`Self::remaining`],
    /// in `[0, window length]`. Falls back to the whole window when the store cannot tell.
    pub async fn wait_time(
        &self,
        credential: &str,
        window: UsageWindow,
        now: i64,
        remaining: i64,
    ) -> Duration {
        // At -n, n + 1 charges have to leave before the next one fits
        let skip = u64::try_from(remaining.saturating_neg()).unwrap_or(0);
        match self
            .counter
            .expiry_remaining(credential, window, now, skip)
            .await
        {
            Ok(wait) => wait.min(window.length()),
            Err(e) => {
                warn!("Could not read window expiry, reporting the full window: {e}");
                window.length()
            }
        }
    }

    pub async fn check(&self, credential: &str, now: i64) -> Result<QuotaCheck, Error> {
        let remaining = self.remaining(credential, now).await?;
        if remaining > 0 {
            return Ok(QuotaCheck::Within { remaining });
        }
        let wait = self
            .wait_time(credential, self.config.window, now, remaining)
            .await;
        Ok(QuotaCheck::Exceeded { wait })
    }

    /// Records one request at `now` against every window
    pub async fn charge(&self, credential: &str, now: i64) -> Result<(), Error> {
        self.counter.increment(credential, now).await
    }

    pub async fn stats(&self, credential: &str, now: i64) -> Result<UsageStats, Error> {
        let mut stats = UsageStats {
            total: self.counter.total(credential).await?,
            ..Default::default()
        };
        for window in UsageWindow::iter() {
            let count = self
                .counter
                .count_since(credential, window, window.start(now))
                .await?;
            stats.set(window, count);
        }
        Ok(stats)
    }

    /// Usage of every credential ever charged, highest total first
    pub async fn all_stats(&self, now: i64) -> Result<Vec<(String, UsageStats)>, Error> {
        let mut all = Vec::new();
        for credential in self.counter.credentials().await? {
            let stats = self.stats(&credential, now).await?;
            all.push((credential, stats));
        }
        all.sort_by(|a, b| b.1.total.cmp(&a.1.total).then_with(|| a.0.cmp(&b.0)));
        Ok(all)
    }

    pub async fn compact_once(&self, now: i64) -> Result<usize, Error> {
        self.counter.compact(now).await
    }

    /// Start periodic removal of expired window entries
    pub async fn start_compaction(&self) {
        let counter = Arc::clone(&self.counter);
        let every = self.config.compaction_interval;

        let handle = tokio::spawn(async move {
            let mut timer = interval(every);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                timer.tick().await;
                match counter.compact(get_unix_timestamp()).await {
                    Ok(visited) => debug!("Compacted {visited} usage windows"),
                    Err(e) => warn!("Usage window compaction failed: {e}"),
                }
            }
        });

        if let Some(previous) = self.compaction_handle.write().await.replace(handle) {
            previous.abort();
        }
    }

    pub async fn stop_compaction(&self) {
        if let Some(handle) = self.compaction_handle.write().await.take() {
            handle.abort();
        }
    }

    pub async fn is_compacting(&self) -> bool {
        self.compaction_handle.read().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, Store};

    const NOW: i64 = 1_700_000_000;

    fn tracker_with_limit(limit: u32) -> (UsageTracker, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let counter = SharedCounterStore::new(store.clone());
        let tracker = UsageTracker::new(
            counter,
            UsageTrackerConfig {
                limit,
                ..Default::default()
            },
        );
        (tracker, store)
    }

    #[tokio::test]
    async fn test_remaining_counts_down() {
        let (tracker, _) = tracker_with_limit(3);
        assert_eq!(tracker.remaining("tok", NOW).await.unwrap(), 3);
        tracker.charge("tok", NOW).await.unwrap();
        tracker.charge("tok", NOW + 1).await.unwrap();
        assert_eq!(tracker.remaining("tok", NOW + 2).await.unwrap(), 1);
        // Other credentials are unaffected
        assert_eq!(tracker.remaining("other", NOW + 2).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_exceeded_wait_is_time_until_oldest_charge_expires() {
        let (tracker, _) = tracker_with_limit(2);
        tracker.charge("tok", NOW).await.unwrap();
        tracker.charge("tok", NOW + 30).await.unwrap();

        let check = tracker.check("tok", NOW + 60).await.unwrap();
        assert_eq!(
            check,
            QuotaCheck::Exceeded {
                wait: Duration::from_secs(10800 - 60)
            }
        );
    }

    #[tokio::test]
    async fn test_quota_recovers_after_window_slides() {
        let (tracker, _) = tracker_with_limit(1);
        tracker.charge("tok", NOW).await.unwrap();
        assert!(matches!(
            tracker.check("tok", NOW + 10).await.unwrap(),
            QuotaCheck::Exceeded { .. }
        ));
        let later = NOW + UsageWindow::ThreeHours.length_secs();
        assert_eq!(
            tracker.check("tok", later).await.unwrap(),
            QuotaCheck::Within { remaining: 1 }
        );
    }

    #[tokio::test]
    async fn test_wait_when_over_limit_covers_every_excess_charge() {
        let (tracker, _) = tracker_with_limit(2);
        for offset in [0, 100, 200] {
            tracker.charge("tok", NOW + offset).await.unwrap();
        }

        let check = tracker.check("tok", NOW + 300).await.unwrap();
        assert_eq!(
            check,
            QuotaCheck::Exceeded {
                wait: Duration::from_secs(10600)
            }
        );
        assert!(matches!(
            tracker.check("tok", NOW + 300 + 10599).await.unwrap(),
            QuotaCheck::Exceeded { .. }
        ));
        assert_eq!(
            tracker.check("tok", NOW + 300 + 10600).await.unwrap(),
            QuotaCheck::Within { remaining: 1 }
        );
    }

    #[tokio::test]
    async fn test_wait_is_never_zero_while_exceeded() {
        let (tracker, _) = tracker_with_limit(1);
        tracker.charge("tok", NOW).await.unwrap();
        let last_second = NOW + UsageWindow::ThreeHours.length_secs() - 1;
        assert_eq!(
            tracker.check("tok", last_second).await.unwrap(),
            QuotaCheck::Exceeded {
                wait: Duration::from_secs(1)
            }
        );
    }

    #[tokio::test]
    async fn test_wait_defaults_to_full_window_when_store_fails() {
        let (tracker, store) = tracker_with_limit(1);
        store.set_unavailable(true);
        let wait = tracker
            .wait_time("tok", UsageWindow::ThreeHours, NOW, 0)
            .await;
        assert_eq!(wait, UsageWindow::ThreeHours.length());
        assert!(tracker.check("tok", NOW).await.is_err());
    }

    #[tokio::test]
    async fn test_stats_and_ordering() {
        let (tracker, _) = tracker_with_limit(100);
        // Charged 13h ago: only in the 24h and week windows
        tracker.charge("light", NOW - 13 * 3600).await.unwrap();
        for offset in 0..3 {
            tracker.charge("heavy", NOW - offset).await.unwrap();
        }

        let light = tracker.stats("light", NOW).await.unwrap();
        assert_eq!(
            light,
            UsageStats {
                total: 1,
                last_3h: 0,
                last_12h: 0,
                last_24h: 1,
                last_week: 1,
            }
        );

        let all = tracker.all_stats(NOW).await.unwrap();
        let order: Vec<&str> = all.iter().map(|(credential, _)| credential.as_str()).collect();
        assert_eq!(order, vec!["heavy", "light"]);
        assert_eq!(all[0].1.last_3h, 3);
    }

    #[tokio::test]
    async fn test_compact_once() {
        let (tracker, store) = tracker_with_limit(10);
        tracker.charge("tok", NOW - 4 * 3600).await.unwrap();
        tracker.compact_once(NOW).await.unwrap();
        assert_eq!(
            store
                .zcount_since(&UsageWindow::ThreeHours.key("tok"), 0)
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            store
                .zcount_since(&UsageWindow::TwelveHours.key("tok"), 0)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_compaction_task_lifecycle() {
        let (tracker, _) = tracker_with_limit(10);
        tracker.start_compaction().await;
        assert!(tracker.is_compacting().await);
        tracker.stop_compaction().await;
        assert!(!tracker.is_compacting().await);
    }
}
