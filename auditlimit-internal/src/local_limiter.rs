use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Shared handle to one credential's token bucket
#[derive(Clone)]
pub struct LimiterHandle {
    limiter: Arc<DefaultDirectRateLimiter>,
}

impl LimiterHandle {
    /// Takes one token. On failure, returns how long until a token is available.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        self.limiter
            .check()
            .map_err(|not_until| not_until.wait_time_from(DefaultClock::default().now()))
    }
}

struct LocalLimiterEntry {
    limiter: Arc<DefaultDirectRateLimiter>,
    last_seen: Instant,
}

/// What this instance has seen of a credential recently
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocalActivity {
    pub idle_for: Duration,
}

/// Per-instance token buckets keyed by credential.
///
/// This is a best-effort pacing aid, never the source of truth for quota: the shared
/// [`UsageTracker`](crate::usage::UsageTracker) is. One lock guards the whole map and is only
/// held for a lookup or insert.
pub struct LocalLimiterCache {
    entries: Arc<Mutex<HashMap<String, LocalLimiterEntry>>>,
    /// Entries untouched for longer than this are dropped by the sweep
    idle_after: Duration,
    sweep_interval: Duration,
    sweep_handle: Arc<RwLock<Option<JoinHandle<()>>>>,
}

fn lock_entries(
    entries: &Mutex<HashMap<String, LocalLimiterEntry>>,
) -> MutexGuard<'_, HashMap<String, LocalLimiterEntry>> {
    // The map is always left consistent, so a panic elsewhere does not invalidate it
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}

fn sweep_entries(
    entries: &Mutex<HashMap<String, LocalLimiterEntry>>,
    idle_after: Duration,
    now: Instant,
) -> usize {
    let mut entries = lock_entries(entries);
    let before = entries.len();
    entries.retain(|_, entry| now.saturating_duration_since(entry.last_seen) <= idle_after);
    before - entries.len()
}

impl LocalLimiterCache {
    pub fn new(idle_after: Duration, sweep_interval: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            idle_after,
            sweep_interval,
            sweep_handle: Arc::new(RwLock::new(None)),
        }
    }

    /// Returns the credential's limiter, creating one that admits `rate_limit` events spread evenly
    /// over `period` (with a burst of `rate_limit`). Always refreshes last-seen.
    ///
    /// Returns `None` when `rate_limit` and `period` do not describe a usable rate.
    pub fn get_or_create(
        &self,
        credential: &str,
        rate_limit: u32,
        period: Duration,
    ) -> Option<LimiterHandle> {
        let now = Instant::now();
        let mut entries = lock_entries(&self.entries);
        if let Some(entry) = entries.get_mut(credential) {
            entry.last_seen = now;
            return Some(LimiterHandle {
                limiter: Arc::clone(&entry.limiter),
            });
        }

        let Some(quota) = build_quota(rate_limit, period) else {
            warn!("Cannot build a local limiter for {rate_limit} requests per {period:?}");
            return None;
        };
        let limiter = Arc::new(RateLimiter::direct(quota));
        entries.insert(
            credential.to_string(),
            LocalLimiterEntry {
                limiter: Arc::clone(&limiter),
                last_seen: now,
            },
        );
        Some(LimiterHandle { limiter })
    }

    pub fn activity(&self, credential: &str) -> Option<LocalActivity> {
        let now = Instant::now();
        lock_entries(&self.entries)
            .get(credential)
            .map(|entry| LocalActivity {
                idle_for: now.saturating_duration_since(entry.last_seen),
            })
    }

    /// Activity of every credential currently cached
    pub fn snapshot(&self) -> HashMap<String, LocalActivity> {
        let now = Instant::now();
        lock_entries(&self.entries)
            .iter()
            .map(|(credential, entry)| {
                (
                    credential.clone(),
                    LocalActivity {
                        idle_for: now.saturating_duration_since(entry.last_seen),
                    },
                )
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        lock_entries(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops idle entries now. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        sweep_entries(&self.entries, self.idle_after, Instant::now())
    }

    /// Start the periodic idle sweep
    pub async fn start_sweep(&self) {
        let entries = Arc::clone(&self.entries);
        let idle_after = self.idle_after;
        let every = self.sweep_interval;

        let handle = tokio::spawn(async move {
            let mut timer = interval(every);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately
            timer.tick().await;
            loop {
                timer.tick().await;
                let removed = sweep_entries(&entries, idle_after, Instant::now());
                if removed > 0 {
                    debug!("Evicted {removed} idle local limiters");
                }
            }
        });

        if let Some(previous) = self.sweep_handle.write().await.replace(handle) {
            previous.abort();
        }
    }

    pub async fn stop_sweep(&self) {
        if let Some(handle) = self.sweep_handle.write().await.take() {
            handle.abort();
        }
    }
}

fn build_quota(rate_limit: u32, period: Duration) -> Option<Quota> {
    let burst = NonZeroU32::new(rate_limit)?;
    let replenish_every = period.checked_div(rate_limit)?;
    Quota::with_period(replenish_every).map(|quota| quota.allow_burst(burst))
}
