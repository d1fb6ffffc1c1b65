use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for chainmeter.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Aggregation engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// HTTP server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Event replay configuration.
    #[serde(default)]
    pub replay: ReplayConfig,
}

/// Aggregation engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Points retained per block-keyed chart and accumulator. Default: 1000.
    #[serde(default = "default_history_size")]
    pub chart_history_size: usize,

    /// Points retained per network speed chart and accumulator. Default: 1000.
    #[serde(default = "default_history_size")]
    pub speed_history_size: usize,

    /// Initial moving average window. Default: 100.
    #[serde(default = "default_moving_average_window")]
    pub moving_average_window: usize,

    /// Network rate sampling period. Default: 100ms.
    #[serde(default = "default_rate_interval", with = "humantime_serde")]
    pub rate_interval: Duration,

    /// Maximum group computations running at once. Default: 3.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address; ":port" binds all interfaces. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

/// Event replay configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReplayConfig {
    /// NDJSON event file replayed at startup.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Delay between replayed events. Default: 0s (as fast as possible).
    #[serde(default, with = "humantime_serde")]
    pub pace: Duration,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_history_size() -> usize {
    1000
}

fn default_moving_average_window() -> usize {
    100
}

fn default_rate_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_workers() -> usize {
    3
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            engine: EngineConfig::default(),
            health: HealthConfig::default(),
            replay: ReplayConfig::default(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chart_history_size: default_history_size(),
            speed_history_size: default_history_size(),
            moving_average_window: default_moving_average_window(),
            rate_interval: default_rate_interval(),
            workers: default_workers(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;

        if self.health.addr.is_empty() {
            bail!("health.addr is required");
        }

        Ok(())
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chart_history_size == 0 {
            bail!("engine.chart_history_size must be positive");
        }

        if self.speed_history_size == 0 {
            bail!("engine.speed_history_size must be positive");
        }

        let max_window = self.chart_history_size.min(self.speed_history_size);
        if self.moving_average_window == 0 || self.moving_average_window > max_window {
            bail!(
                "engine.moving_average_window must be between 1 and {max_window}, got {}",
                self.moving_average_window
            );
        }

        if self.rate_interval.is_zero() {
            bail!("engine.rate_interval must be positive");
        }

        if self.workers == 0 {
            bail!("engine.workers must be positive");
        }

        Ok(())
    }
}

/// Expands the ":port" shorthand to a bindable address.
pub fn bind_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}
