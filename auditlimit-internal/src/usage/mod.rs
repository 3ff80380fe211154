use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use strum::{EnumIter, IntoStaticStr};

pub mod counter;
pub mod tracker;

pub use counter::SharedCounterStore;
pub use tracker::{UsageTracker, UsageTrackerConfig};

pub(crate) const USAGE_KEY_PREFIX: &str = "usage:";

/// Helper function to get current Unix timestamp.
/// Returns 0 if system time is before UNIX_EPOCH (extremely rare).
pub fn get_unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// A trailing interval over which requests are counted
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter, IntoStaticStr)]
pub enum UsageWindow {
    #[strum(serialize = "3h")]
    ThreeHours,
    #[strum(serialize = "12h")]
    TwelveHours,
    #[strum(serialize = "24h")]
    OneDay,
    #[strum(serialize = "1week")]
    OneWeek,
}

impl UsageWindow {
    /// The window enforced on every request
    pub const PRIMARY: UsageWindow = UsageWindow::ThreeHours;

    pub fn length(self) -> Duration {
        const HOUR: u64 = 60 * 60;
        match self {
            UsageWindow::ThreeHours => Duration::from_secs(3 * HOUR),
            UsageWindow::TwelveHours => Duration::from_secs(12 * HOUR),
            UsageWindow::OneDay => Duration::from_secs(24 * HOUR),
            UsageWindow::OneWeek => Duration::from_secs(7 * 24 * HOUR),
        }
    }

    pub fn length_secs(self) -> i64 {
        i64::try_from(self.length().as_secs()).unwrap_or(i64::MAX)
    }

    /// Earliest charge timestamp still inside the window ending at `now`.
    /// A charge made at `t` counts until `t + length` and not at `t + length` itself.
    pub fn start(self, now: i64) -> i64 {
        now - self.length_secs() + 1
    }

    pub fn as_str(self) -> &'static str {
        self.into()
    }

    /// Prefix shared by this window's keys for every credential
    pub fn key_prefix(self) -> String {
        format!("{USAGE_KEY_PREFIX}{}:", self.as_str())
    }

    pub fn key(self, credential: &str) -> String {
        format!("{}{credential}", self.key_prefix())
    }
}

pub(crate) fn total_key_prefix() -> String {
    format!("{USAGE_KEY_PREFIX}total:")
}

pub(crate) fn total_key(credential: &str) -> String {
    format!("{}{credential}", total_key_prefix())
}

/// Request counts for one credential
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct UsageStats {
    pub total: i64,
    pub last_3h: u64,
    pub last_12h: u64,
    pub last_24h: u64,
    pub last_week: u64,
}

impl UsageStats {
    fn set(&mut self, window: UsageWindow, count: u64) {
        match window {
            UsageWindow::ThreeHours => self.last_3h = count,
            UsageWindow::TwelveHours => self.last_12h = count,
            UsageWindow::OneDay => self.last_24h = count,
            UsageWindow::OneWeek => self.last_week = count,
        }
    }
}
