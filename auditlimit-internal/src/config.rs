use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;
use url::Url;

use crate::error::{Error, ErrorDetails};

pub const ENV_PORT: &str = "AUDITLIMIT_PORT";
pub const ENV_LIMIT: &str = "AUDITLIMIT_LIMIT";
pub const ENV_PER: &str = "AUDITLIMIT_PER";
pub const ENV_MAX_DEVICES: &str = "AUDITLIMIT_MAX_DEVICES";
pub const ENV_REDIS_URL: &str = "AUDITLIMIT_REDIS_URL";
pub const ENV_MODERATION_URL: &str = "AUDITLIMIT_MODERATION_URL";
pub const ENV_OAI_KEY: &str = "AUDITLIMIT_OAI_KEY";
pub const ENV_FORBIDDEN_WORDS: &str = "AUDITLIMIT_FORBIDDEN_WORDS";

/// Top-level configuration, loaded from an optional TOML file and then overridden from the environment
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub devices: DevicesConfig,
    #[serde(default)]
    pub moderation: ModerationConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub background: BackgroundConfig,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,
    #[serde(default)]
    pub debug: bool,
}

fn default_bind_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            debug: false,
        }
    }
}

/// Request quota per credential
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitsConfig {
    /// Requests allowed per accounting period
    #[serde(default = "default_limit")]
    pub limit: u32,

    /// Accounting period in seconds (the primary enforcement window)
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,

    /// Only requests for models starting with one of these prefixes are charged.
    /// Requests that do not name a model are always charged.
    #[serde(default = "default_metered_model_prefixes")]
    pub metered_model_prefixes: Vec<String>,

    /// Additionally pace bursts through the per-instance token bucket
    #[serde(default)]
    pub local_pacing: bool,
}

fn default_limit() -> u32 {
    40
}

fn default_period_secs() -> u64 {
    3 * 60 * 60
}

fn default_metered_model_prefixes() -> Vec<String> {
    vec!["claude".to_string()]
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            period_secs: default_period_secs(),
            metered_model_prefixes: default_metered_model_prefixes(),
            local_pacing: false,
        }
    }
}

impl LimitsConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }
}

/// Requests that do not name a model are always metered
pub fn is_metered_model(prefixes: &[String], model: Option<&str>) -> bool {
    match model {
        None => true,
        Some(model) => prefixes
            .iter()
            .any(|prefix| model.starts_with(prefix.as_str())),
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DevicesConfig {
    #[serde(default = "default_max_devices")]
    pub max_devices: u32,

    /// Seconds of inactivity after which a credential's device records expire
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    /// Enforce the device cap atomically in the store instead of check-then-add
    #[serde(default)]
    pub strict_cap: bool,
}

fn default_max_devices() -> u32 {
    3
}

fn default_retention_secs() -> u64 {
    7 * 24 * 60 * 60
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            max_devices: default_max_devices(),
            retention_secs: default_retention_secs(),
            strict_cap: false,
        }
    }
}

impl DevicesConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModerationConfig {
    /// OpenAI-compatible moderation endpoint. Moderation is disabled when unset.
    #[serde(default)]
    pub endpoint: Option<Url>,

    #[serde(default)]
    pub forbidden_words: Vec<String>,

    /// Only ever read from `AUDITLIMIT_OAI_KEY`
    #[serde(skip)]
    pub api_key: Option<SecretString>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Redis URL shared by all instances. When unset, an in-process store is used.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Upper bound on every store round trip, in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_store_timeout_ms() -> u64 {
    500
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            timeout_ms: default_store_timeout_ms(),
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackgroundConfig {
    #[serde(default = "default_hourly")]
    pub compaction_interval_secs: u64,
    #[serde(default = "default_hourly")]
    pub sweep_interval_secs: u64,
}

fn default_hourly() -> u64 {
    60 * 60
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            compaction_interval_secs: default_hourly(),
            sweep_interval_secs: default_hourly(),
        }
    }
}

impl Config {
    /// Load the config file (if any), apply environment overrides, and validate the result
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        let mut config = match path {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        config.log_summary();
        Ok(config)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to read config file `{}`: {e}", path.display()),
            })
        })?;
        toml::from_str(&contents).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to parse config file `{}`: {e}", path.display()),
            })
        })
    }

    /// Apply overrides from the environment. `lookup` returns the value of a variable, if set.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup(ENV_PORT) {
            let port = parse_env::<u16>(ENV_PORT, &port)?;
            self.gateway.bind_address.set_port(port);
        }
        if let Some(limit) = lookup(ENV_LIMIT) {
            self.limits.limit = parse_env(ENV_LIMIT, &limit)?;
        }
        if let Some(per) = lookup(ENV_PER) {
            self.limits.period_secs = parse_duration(&per)
                .ok_or_else(|| {
                    Error::new(ErrorDetails::Config {
                        message: format!("Invalid duration in `{ENV_PER}`: `{per}`"),
                    })
                })?
                .as_secs();
        }
        if let Some(max_devices) = lookup(ENV_MAX_DEVICES) {
            self.devices.max_devices = parse_env(ENV_MAX_DEVICES, &max_devices)?;
        }
        if let Some(redis_url) = lookup(ENV_REDIS_URL) {
            self.store.redis_url = Some(redis_url);
        }
        if let Some(endpoint) = lookup(ENV_MODERATION_URL) {
            self.moderation.endpoint = Some(parse_env(ENV_MODERATION_URL, &endpoint)?);
        }
        if let Some(words) = lookup(ENV_FORBIDDEN_WORDS) {
            self.moderation.forbidden_words = words
                .split(',')
                .map(str::trim)
                .filter(|word| !word.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(key) = lookup(ENV_OAI_KEY) {
            self.moderation.api_key = Some(SecretString::from(key));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), Error> {
        let invalid = |message: &str| {
            Err(Error::new(ErrorDetails::Config {
                message: message.to_string(),
            }))
        };
        if self.limits.limit == 0 {
            return invalid("`limits.limit` must be greater than zero");
        }
        if self.limits.period_secs == 0 {
            return invalid("`limits.period_secs` must be greater than zero");
        }
        if self.limits.period().checked_div(self.limits.limit) == Some(Duration::ZERO) {
            return invalid("`limits.limit` is too large for `limits.period_secs`");
        }
        if self.devices.max_devices == 0 {
            return invalid("`devices.max_devices` must be greater than zero");
        }
        if self.devices.retention_secs == 0 {
            return invalid("`devices.retention_secs` must be greater than zero");
        }
        if self.store.timeout_ms == 0 {
            return invalid("`store.timeout_ms` must be greater than zero");
        }
        if self.background.compaction_interval_secs == 0 || self.background.sweep_interval_secs == 0
        {
            return invalid("background task intervals must be greater than zero");
        }
        Ok(())
    }

    fn log_summary(&self) {
        tracing::info!("Bind address: {}", self.gateway.bind_address);
        tracing::info!(
            "Limit: {} requests per {}s",
            self.limits.limit,
            self.limits.period_secs
        );
        tracing::info!("Max devices per token: {}", self.devices.max_devices);
        tracing::info!(
            "Redis: {}",
            self.store.redis_url.as_deref().unwrap_or("(in-process store)")
        );
        tracing::info!(
            "Moderation endpoint: {}",
            self.moderation
                .endpoint
                .as_ref()
                .map(Url::as_str)
                .unwrap_or("(disabled)")
        );
        tracing::info!(
            "Moderation key: {}",
            if self.moderation.api_key.is_some() {
                "******"
            } else {
                "(unset)"
            }
        );
        tracing::info!(
            "Forbidden words: {} configured",
            self.moderation.forbidden_words.len()
        );
    }
}

fn parse_env<T>(key: &str, value: &str) -> Result<T, Error>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e| {
        Error::new(ErrorDetails::Config {
            message: format!("Invalid value `{value}` for `{key}`: {e}"),
        })
    })
}

/// Parses durations such as `90`, `45s`, `30m`, `3h`, `7d` or `1h30m`. Bare numbers are seconds.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let mut total: u64 = 0;
    let mut digits = String::new();
    for c in value.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let amount: u64 = digits.parse().ok()?;
        digits.clear();
        let unit = match c {
            's' => 1,
            'm' => 60,
            'h' => 60 * 60,
            'd' => 24 * 60 * 60,
            _ => return None,
        };
        total = total.checked_add(amount.checked_mul(unit)?)?;
    }
    if !digits.is_empty() {
        return None;
    }
    Some(Duration::from_secs(total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.gateway.bind_address.port(), 8080);
        assert_eq!(config.limits.limit, 40);
        assert_eq!(config.limits.period(), Duration::from_secs(10800));
        assert_eq!(config.devices.max_devices, 3);
        assert_eq!(config.devices.retention(), Duration::from_secs(604_800));
        assert!(!config.devices.strict_cap);
        assert!(config.store.redis_url.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[limits]
limit = 10
period_secs = 3600

[devices]
max_devices = 5
strict_cap = true

[moderation]
endpoint = "https://api.openai.com/v1/moderations"
forbidden_words = ["badword"]
"#
        )
        .unwrap();

        let config = Config::load_from_path(file.path()).unwrap();
        assert_eq!(config.limits.limit, 10);
        assert_eq!(config.limits.period_secs, 3600);
        assert_eq!(config.devices.max_devices, 5);
        assert!(config.devices.strict_cap);
        assert_eq!(config.moderation.forbidden_words, vec!["badword"]);
        assert_eq!(
            config.moderation.endpoint.as_ref().map(Url::as_str),
            Some("https://api.openai.com/v1/moderations")
        );
        // Sections that were not mentioned keep their defaults
        assert_eq!(config.store.timeout_ms, 500);
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[limits]\nlimt = 10\n").unwrap();
        assert!(Config::load_from_path(file.path()).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_PORT, "9090"),
            (ENV_LIMIT, "2"),
            (ENV_PER, "30m"),
            (ENV_MAX_DEVICES, "1"),
            (ENV_REDIS_URL, "redis://cache:6379"),
            (ENV_OAI_KEY, "sk-test"),
            (ENV_FORBIDDEN_WORDS, "foo, bar,,baz"),
        ]);
        let mut config = Config::default();
        config
            .apply_env_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.gateway.bind_address.port(), 9090);
        assert_eq!(config.limits.limit, 2);
        assert_eq!(config.limits.period_secs, 1800);
        assert_eq!(config.devices.max_devices, 1);
        assert_eq!(config.store.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(
            config.moderation.api_key.as_ref().unwrap().expose_secret(),
            "sk-test"
        );
        assert_eq!(config.moderation.forbidden_words, vec!["foo", "bar", "baz"]);
    }

    #[test]
    fn test_invalid_env_override() {
        let mut config = Config::default();
        let result = config.apply_env_overrides(|key| (key == ENV_LIMIT).then(|| "many".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_zero_limit() {
        let mut config = Config::default();
        config.limits.limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("90"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("45s"), Some(Duration::from_secs(45)));
        assert_eq!(parse_duration("3h"), Some(Duration::from_secs(10800)));
        assert_eq!(parse_duration("1h30m"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_duration("7d"), Some(Duration::from_secs(604_800)));
        assert_eq!(parse_duration("3x"), None);
        assert_eq!(parse_duration("h"), None);
        assert_eq!(parse_duration("10m5"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn test_metered_models() {
        let prefixes = LimitsConfig::default().metered_model_prefixes;
        assert!(is_metered_model(&prefixes, None));
        assert!(is_metered_model(&prefixes, Some("claude-3-opus")));
        assert!(!is_metered_model(&prefixes, Some("gpt-4o")));
        assert!(!is_metered_model(&[], Some("claude-3-opus")));
    }
}
