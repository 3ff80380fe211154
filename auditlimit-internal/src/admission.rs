use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{is_metered_model, Config};
use crate::device::{DeviceInfo, DeviceRegistry, DeviceRegistryConfig, Registration, TokenDeviceStats};
use crate::error::Error;
use crate::local_limiter::LocalLimiterCache;
use crate::moderation::{ContentModerator, ForbiddenWords};
use crate::store::Store;
use crate::usage::tracker::QuotaCheck;
use crate::usage::{
    get_unix_timestamp, SharedCounterStore, UsageStats, UsageTracker, UsageTrackerConfig,
    UsageWindow,
};

/// Everything the engine needs to know about one inbound request
#[derive(Clone, Copy, Debug)]
pub struct AdmissionRequest<'a> {
    pub credential: &'a str,
    pub device_identity: &'a str,
    pub host: &'a str,
    pub content: Option<&'a str>,
    pub model: Option<&'a str>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdmissionDecision {
    Admitted,
    DeviceCapacityExceeded { max: u32 },
    QuotaExceeded { limit: u32, wait_seconds: u64 },
    ModerationBlocked,
    ForbiddenContent { word: String },
    /// The shared store could not be reached, so the request is refused without being charged
    UsageUnverified,
}

impl AdmissionDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmissionDecision::Admitted)
    }
}

#[derive(Clone, Debug)]
pub struct AdmissionConfig {
    pub limit: u32,
    /// Accounting period of the local token bucket, also its idle timeout
    pub period: Duration,
    pub devices: DeviceRegistryConfig,
    pub metered_model_prefixes: Vec<String>,
    pub local_pacing: bool,
    pub compaction_interval: Duration,
    pub sweep_interval: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            limit: 40,
            period: UsageWindow::PRIMARY.length(),
            devices: DeviceRegistryConfig::default(),
            metered_model_prefixes: vec!["claude".to_string()],
            local_pacing: false,
            compaction_interval: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(60 * 60),
        }
    }
}

impl From<&Config> for AdmissionConfig {
    fn from(config: &Config) -> Self {
        Self {
            limit: config.limits.limit,
            period: config.limits.period(),
            devices: DeviceRegistryConfig {
                max_devices: config.devices.max_devices,
                retention: config.devices.retention(),
                strict_cap: config.devices.strict_cap,
            },
            metered_model_prefixes: config.limits.metered_model_prefixes.clone(),
            local_pacing: config.limits.local_pacing,
            compaction_interval: Duration::from_secs(config.background.compaction_interval_secs),
            sweep_interval: Duration::from_secs(config.background.sweep_interval_secs),
        }
    }
}

impl AdmissionConfig {
    fn is_metered(&self, model: Option<&str>) -> bool {
        is_metered_model(&self.metered_model_prefixes, model)
    }
}

/// Metrics for admission decisions
#[derive(Debug, Default)]
pub struct AdmissionMetrics {
    pub admitted: AtomicU64,
    pub device_rejected: AtomicU64,
    pub forbidden: AtomicU64,
    pub moderation_blocked: AtomicU64,
    pub quota_exceeded: AtomicU64,
    pub paced: AtomicU64,
    pub unverified: AtomicU64,
    pub charge_failures: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AdmissionMetricsSnapshot {
    pub admitted: u64,
    pub device_rejected: u64,
    pub forbidden: u64,
    pub moderation_blocked: u64,
    pub quota_exceeded: u64,
    pub paced: u64,
    pub unverified: u64,
    pub charge_failures: u64,
}

impl AdmissionMetrics {
    fn record(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_admitted(&self) {
        Self::record(&self.admitted);
    }

    pub fn record_device_rejected(&self) {
        Self::record(&self.device_rejected);
    }

    pub fn record_forbidden(&self) {
        Self::record(&self.forbidden);
    }

    pub fn record_moderation_blocked(&self) {
        Self::record(&self.moderation_blocked);
    }

    pub fn record_quota_exceeded(&self) {
        Self::record(&self.quota_exceeded);
    }

    pub fn record_paced(&self) {
        Self::record(&self.paced);
    }

    pub fn record_unverified(&self) {
        Self::record(&self.unverified);
    }

    pub fn record_charge_failure(&self) {
        Self::record(&self.charge_failures);
    }

    pub fn snapshot(&self) -> AdmissionMetricsSnapshot {
        AdmissionMetricsSnapshot {
            admitted: self.admitted.load(Ordering::Relaxed),
            device_rejected: self.device_rejected.load(Ordering::Relaxed),
            forbidden: self.forbidden.load(Ordering::Relaxed),
            moderation_blocked: self.moderation_blocked.load(Ordering::Relaxed),
            quota_exceeded: self.quota_exceeded.load(Ordering::Relaxed),
            paced: self.paced.load(Ordering::Relaxed),
            unverified: self.unverified.load(Ordering::Relaxed),
            charge_failures: self.charge_failures.load(Ordering::Relaxed),
        }
    }
}

/// Usage of one credential as seen by the store and by this instance
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TokenStats {
    pub token: String,
    pub total_usage: i64,
    /// Whether this instance has a live local limiter for the credential
    pub current_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen_seconds: Option<u64>,
}

/// Keeps enough of a credential to correlate log lines without logging the secret
fn mask(credential: &str) -> String {
    let visible: String = credential.chars().take(4).collect();
    format!("{visible}****")
}

/// Decides whether a (credential, device) pair may proceed, and charges it when it does
pub struct AdmissionEngine {
    devices: DeviceRegistry,
    usage: UsageTracker,
    local: LocalLimiterCache,
    forbidden_words: ForbiddenWords,
    moderator: Option<Arc<dyn ContentModerator>>,
    config: AdmissionConfig,
    metrics: AdmissionMetrics,
}

impl AdmissionEngine {
    pub fn new(store: Arc<dyn Store>, config: AdmissionConfig) -> Self {
        let devices = DeviceRegistry::new(Arc::clone(&store), config.devices.clone());
        let usage = UsageTracker::new(
            SharedCounterStore::new(store),
            UsageTrackerConfig {
                limit: config.limit,
                window: UsageWindow::PRIMARY,
                compaction_interval: config.compaction_interval,
            },
        );
        let local = LocalLimiterCache::new(config.period, config.sweep_interval);
        Self {
            devices,
            usage,
            local,
            forbidden_words: ForbiddenWords::default(),
            moderator: None,
            config,
            metrics: AdmissionMetrics::default(),
        }
    }

    pub fn with_forbidden_words(mut self, forbidden_words: ForbiddenWords) -> Self {
        self.forbidden_words = forbidden_words;
        self
    }

    pub fn with_moderator(mut self, moderator: Arc<dyn ContentModerator>) -> Self {
        self.moderator = Some(moderator);
        self
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    pub fn local_cache(&self) -> &LocalLimiterCache {
        &self.local
    }

    pub fn metrics(&self) -> AdmissionMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub async fn admit(&self, request: AdmissionRequest<'_>) -> AdmissionDecision {
        self.admit_at(request, get_unix_timestamp()).await
    }

    /// Runs the gates in order: device cap, content screening, quota, local pacing. Only a request
    /// that passes all of them is charged.
    pub async fn admit_at(&self, request: AdmissionRequest<'_>, now: i64) -> AdmissionDecision {
        let credential = request.credential;

        match self
            .devices
            .register_device(credential, request.device_identity, request.host)
            .await
        {
            Ok(Registration::Rejected) => {
                info!(
                    "Device limit reached for {}: {} devices",
                    mask(credential),
                    self.devices.max_devices()
                );
                self.metrics.record_device_rejected();
                return AdmissionDecision::DeviceCapacityExceeded {
                    max: self.devices.max_devices(),
                };
            }
            Ok(registration) => {
                debug!("Device check for {}: {registration:?}", mask(credential));
            }
            Err(e) => {
                warn!("Failed to verify device for {}: {e}", mask(credential));
                self.metrics.record_unverified();
                return AdmissionDecision::UsageUnverified;
            }
        }

        if let Some(content) = request.content {
            if let Some(decision) = self.screen_content(credential, content).await {
                return decision;
            }
        }

        if !self.config.is_metered(request.model) {
            debug!(
                "Model {:?} is not metered, admitting {}",
                request.model,
                mask(credential)
            );
            self.metrics.record_admitted();
            return AdmissionDecision::Admitted;
        }

        match self.usage.check(credential, now).await {
            Ok(QuotaCheck::Within { remaining }) => {
                debug!("{} has {remaining} requests left", mask(credential));
            }
            Ok(QuotaCheck::Exceeded { wait }) => {
                info!(
                    "Usage limit reached for {}, retry in {}s",
                    mask(credential),
                    wait.as_secs()
                );
                self.metrics.record_quota_exceeded();
                return AdmissionDecision::QuotaExceeded {
                    limit: self.usage.limit(),
                    wait_seconds: wait.as_secs(),
                };
            }
            Err(e) => {
                warn!("Failed to check usage for {}: {e}", mask(credential));
                self.metrics.record_unverified();
                return AdmissionDecision::UsageUnverified;
            }
        }

        // Non-authoritative: a missing limiter admits
        let limiter = self
            .local
            .get_or_create(credential, self.config.limit, self.config.period);
        if self.config.local_pacing {
            if let Some(Err(wait)) = limiter.map(|limiter| limiter.try_acquire()) {
                let wait_seconds = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
                info!(
                    "Pacing {} locally, retry in {wait_seconds}s",
                    mask(credential)
                );
                self.metrics.record_paced();
                return AdmissionDecision::QuotaExceeded {
                    limit: self.usage.limit(),
                    wait_seconds: wait_seconds.min(self.usage.window().length().as_secs()),
                };
            }
        }

        if let Err(e) = self.usage.charge(credential, now).await {
            // The device is already registered; both sides re-converge on the next request
            error!(
                "Admitted {} without charging usage, usage accounting is behind: {e}",
                mask(credential)
            );
            self.metrics.record_charge_failure();
        }
        self.metrics.record_admitted();
        AdmissionDecision::Admitted
    }

    async fn screen_content(&self, credential: &str, content: &str) -> Option<AdmissionDecision> {
        if let Some(word) = self.forbidden_words.find(content) {
            info!("Forbidden content from {}", mask(credential));
            self.metrics.record_forbidden();
            return Some(AdmissionDecision::ForbiddenContent {
                word: word.to_string(),
            });
        }

        let moderator = self.moderator.as_ref()?;
        match moderator.is_flagged(content).await {
            Ok(true) => {
                info!("Content from {} flagged by moderation", mask(credential));
                self.metrics.record_moderation_blocked();
                Some(AdmissionDecision::ModerationBlocked)
            }
            Ok(false) => None,
            Err(e) => {
                warn!("Moderation unavailable, admitting content unscreened: {e}");
                None
            }
        }
    }

    pub async fn list_devices(&self, credential: &str) -> Result<Vec<DeviceInfo>, Error> {
        self.devices.list_devices(credential).await
    }

    pub async fn logout_device(&self, credential: &str, device_identity: &str) -> Result<(), Error> {
        self.devices
            .deregister_device(credential, device_identity)
            .await
    }

    pub async fn usage_stats(&self, credential: &str) -> Result<UsageStats, Error> {
        self.usage.stats(credential, get_unix_timestamp()).await
    }

    pub async fn all_usage_stats(&self) -> Result<Vec<(String, UsageStats)>, Error> {
        self.usage.all_stats(get_unix_timestamp()).await
    }

    pub async fn all_device_stats(&self) -> Result<Vec<TokenDeviceStats>, Error> {
        self.devices.all_device_stats().await
    }

    /// Stored totals merged with this instance's local activity, highest total first
    pub async fn token_stats(&self) -> Result<Vec<TokenStats>, Error> {
        let mut local = self.local.snapshot();
        let mut stats: Vec<TokenStats> = self
            .all_usage_stats()
            .await?
            .into_iter()
            .map(|(token, usage)| {
                let activity = local.remove(&token);
                TokenStats {
                    token,
                    total_usage: usage.total,
                    current_active: activity.is_some(),
                    last_seen_seconds: activity.map(|a| a.idle_for.as_secs()),
                }
            })
            .collect();
        stats.extend(local.into_iter().map(|(token, activity)| TokenStats {
            token,
            total_usage: 0,
            current_active: true,
            last_seen_seconds: Some(activity.idle_for.as_secs()),
        }));
        stats.sort_by(|a, b| {
            b.total_usage
                .cmp(&a.total_usage)
                .then_with(|| a.token.cmp(&b.token))
        });
        Ok(stats)
    }

    /// Start usage compaction and the local idle sweep
    pub async fn start_background_tasks(&self) {
        self.usage.start_compaction().await;
        self.local.start_sweep().await;
    }

    pub async fn stop_background_tasks(&self) {
        self.usage.stop_compaction().await;
        self.local.stop_sweep().await;
    }
}
