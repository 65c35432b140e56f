//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{ScopePolicies, ScopePolicy, Tier, TierPolicy};

/// Prefix for environment overrides, e.g. `TURNSTILE__LIMITS__BLOCK_DURATION_SECS`.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Upper bound for every configured duration (one leap year).
///
/// Keeps `now + duration` representable for every deadline the limiter
/// computes.
pub const MAX_DURATION_SECS: u64 = 366 * 24 * 3600;

fn validate_secs(field: &str, secs: u64) -> Result<()> {
    if secs == 0 {
        return Err(TurnstileError::Config(format!("{} must be positive", field)));
    }
    if secs > MAX_DURATION_SECS {
        return Err(TurnstileError::Config(format!(
            "{} ({}s) exceeds the maximum of {}s",
            field, secs, MAX_DURATION_SECS
        )));
    }
    Ok(())
}

/// Main configuration for Turnstile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Sliding window limits and blocking
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Edge token bucket
    #[serde(default)]
    pub edge: EdgeConfig,

    /// Background cleanup
    #[serde(default)]
    pub janitor: JanitorConfig,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// A threshold over a trailing window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimitConfig {
    /// Maximum admitted requests inside the window
    pub threshold: u32,
    /// Window length in seconds
    pub window_secs: u64,
}

impl TierLimitConfig {
    fn new(threshold: u32, window_secs: u64) -> Self {
        Self {
            threshold,
            window_secs,
        }
    }
}

/// Tiers for one scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeLimitsConfig {
    /// Short window, evaluated first
    #[serde(default)]
    pub burst: Option<TierLimitConfig>,

    /// Long window
    #[serde(default)]
    pub sustained: Option<TierLimitConfig>,

    /// Block the identifier after a violation
    #[serde(default = "default_penalize")]
    pub penalize: bool,
}

fn default_penalize() -> bool {
    true
}

impl ScopeLimitsConfig {
    /// Runtime policy with tiers in evaluation order.
    pub fn to_policy(&self) -> ScopePolicy {
        let tiers = [(Tier::Burst, self.burst), (Tier::Sustained, self.sustained)]
            .into_iter()
            .filter_map(|(tier, limit)| {
                limit.map(|l| TierPolicy::new(tier, l.threshold, Duration::from_secs(l.window_secs)))
            })
            .collect();
        ScopePolicy {
            tiers,
            penalize: self.penalize,
        }
    }

    /// Average admitted rate allowed by the longest tier, in requests per second.
    fn long_run_rate(&self) -> Option<f64> {
        self.sustained
            .or(self.burst)
            .map(|l| f64::from(l.threshold) / l.window_secs as f64)
    }

    /// Largest threshold across the configured tiers.
    fn max_threshold(&self) -> Option<u32> {
        [self.burst, self.sustained]
            .into_iter()
            .flatten()
            .map(|l| l.threshold)
            .max()
    }

    fn validate(&self, scope: &str) -> Result<()> {
        if self.burst.is_none() && self.sustained.is_none() {
            return Err(TurnstileError::Config(format!(
                "limits.{}: at least one of burst or sustained is required",
                scope
            )));
        }

        for (name, limit) in [("burst", self.burst), ("sustained", self.sustained)] {
            if let Some(limit) = limit {
                if limit.threshold == 0 {
                    return Err(TurnstileError::Config(format!(
                        "limits.{}.{}.threshold must be positive",
                        scope, name
                    )));
                }
                validate_secs(
                    &format!("limits.{}.{}.window_secs", scope, name),
                    limit.window_secs,
                )?;
            }
        }

        if let (Some(burst), Some(sustained)) = (self.burst, self.sustained) {
            if burst.window_secs >= sustained.window_secs {
                return Err(TurnstileError::Config(format!(
                    "limits.{}: burst window ({}s) must be shorter than sustained window ({}s)",
                    scope, burst.window_secs, sustained.window_secs
                )));
            }
        }

        Ok(())
    }
}

/// Sliding window limits for every scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_global_limits")]
    pub global: ScopeLimitsConfig,

    #[serde(default = "default_client_limits")]
    pub client: ScopeLimitsConfig,

    #[serde(default = "default_session_limits")]
    pub session: ScopeLimitsConfig,

    /// How long a violating identifier stays blocked
    #[serde(default = "default_block_duration")]
    pub block_duration_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            global: default_global_limits(),
            client: default_client_limits(),
            session: default_session_limits(),
            block_duration_secs: default_block_duration(),
        }
    }
}

fn default_global_limits() -> ScopeLimitsConfig {
    ScopeLimitsConfig {
        burst: None,
        sustained: Some(TierLimitConfig::new(10_000, 3600)),
        penalize: true,
    }
}

fn default_client_limits() -> ScopeLimitsConfig {
    ScopeLimitsConfig {
        burst: Some(TierLimitConfig::new(10, 60)),
        sustained: Some(TierLimitConfig::new(60, 3600)),
        penalize: true,
    }
}

fn default_session_limits() -> ScopeLimitsConfig {
    ScopeLimitsConfig {
        burst: Some(TierLimitConfig::new(15, 60)),
        sustained: Some(TierLimitConfig::new(100, 3600)),
        penalize: true,
    }
}

fn default_block_duration() -> u64 {
    3600
}

impl LimitsConfig {
    /// Runtime policies for every scope.
    pub fn policies(&self) -> ScopePolicies {
        ScopePolicies {
            global: self.global.to_policy(),
            client: self.client.to_policy(),
            session: self.session.to_policy(),
        }
    }

    /// Block duration as a `Duration`.
    pub fn block_duration(&self) -> Duration {
        Duration::from_secs(self.block_duration_secs)
    }
}

/// Edge token bucket configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeConfig {
    /// Tokens granted per period, and the bucket size
    #[serde(default = "default_edge_capacity")]
    pub capacity: u32,

    /// Refill period in seconds
    #[serde(default = "default_edge_period")]
    pub period_secs: u64,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            capacity: default_edge_capacity(),
            period_secs: default_edge_period(),
        }
    }
}

fn default_edge_capacity() -> u32 {
    100
}

fn default_edge_period() -> u64 {
    3600
}

impl EdgeConfig {
    /// Refill period as a `Duration`.
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }
}

/// Background cleanup configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JanitorConfig {
    /// Seconds between sweeps
    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_cleanup_interval(),
        }
    }
}

fn default_cleanup_interval() -> u64 {
    300
}

impl JanitorConfig {
    /// Sweep interval as a `Duration`.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl TurnstileConfig {
    /// Load configuration from an optional YAML file plus `TURNSTILE__*`
    /// environment overrides, then validate it.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Yaml));
        }
        let config: TurnstileConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string and validate it.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Render the effective configuration as YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| TurnstileError::Config(e.to_string()))
    }

    /// Reject configurations the limiter must not start with.
    pub fn validate(&self) -> Result<()> {
        self.limits.global.validate("global")?;
        self.limits.client.validate("client")?;
        self.limits.session.validate("session")?;

        validate_secs("limits.block_duration_secs", self.limits.block_duration_secs)?;
        validate_secs("janitor.interval_secs", self.janitor.interval_secs)?;
        validate_secs("edge.period_secs", self.edge.period_secs)?;
        if self.edge.capacity == 0 {
            return Err(TurnstileError::Config("edge.capacity must be positive".to_string()));
        }

        self.validate_edge_is_looser()
    }

    /// The edge bucket must never bind before the per-client windows do.
    ///
    /// The client windows admit at most `threshold` requests in any span of
    /// the longest window. A bucket holding at least that many tokens and
    /// refilling at least as fast always has a token for such a request.
    fn validate_edge_is_looser(&self) -> Result<()> {
        let client = &self.limits.client;

        if let Some(threshold) = client.max_threshold() {
            if self.edge.capacity < threshold {
                return Err(TurnstileError::Config(format!(
                    "edge.capacity ({}) must be at least the largest limits.client threshold ({})",
                    self.edge.capacity, threshold
                )));
            }
        }

        if let Some(client_rate) = client.long_run_rate() {
            let edge_rate = f64::from(self.edge.capacity) / self.edge.period_secs as f64;
            if edge_rate < client_rate {
                return Err(TurnstileError::Config(format!(
                    "edge refill rate ({:.4}/s) must be at least the client sustained rate ({:.4}/s)",
                    edge_rate, client_rate
                )));
            }
        }

        Ok(())
    }
}
