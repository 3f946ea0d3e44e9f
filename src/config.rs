//! Configuration management for Gatekeeper.
//!
//! Values come from (lowest to highest precedence) built-in defaults, an
//! optional YAML file, `GATEKEEPER_` environment variables, and finally the
//! command line flags applied by the binary.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{GatekeeperError, Result};

/// Prefix for environment overrides, e.g.
/// `GATEKEEPER_RATE_LIMITING__REQUESTS_PER_MINUTE=120`.
const ENV_PREFIX: &str = "GATEKEEPER";

/// Main configuration for the Gatekeeper service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Honour `X-Forwarded-For` / `X-Real-IP` when resolving the client.
    /// Only enable this behind a proxy that overwrites those headers.
    #[serde(default)]
    pub trust_proxy_headers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            trust_proxy_headers: false,
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Bucket capacity, refilled over one minute
    #[serde(default = "default_requests_per_minute", alias = "requestsPerMinute")]
    pub requests_per_minute: u64,

    /// Visitors unseen for this long are dropped by the sweeper
    #[serde(default = "default_idle_eviction", alias = "idleEvictionSeconds")]
    pub idle_eviction_secs: u64,

    /// Cooldown applied once a visitor runs out of tokens
    #[serde(default = "default_block_window", alias = "blockWindowSeconds")]
    pub block_window_secs: u64,

    /// Period of the background sweep
    #[serde(default = "default_sweep_interval", alias = "sweepIntervalSeconds")]
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            idle_eviction_secs: default_idle_eviction(),
            block_window_secs: default_block_window(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_requests_per_minute() -> u64 {
    100
}

fn default_idle_eviction() -> u64 {
    300
}

fn default_block_window() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    60
}

impl RateLimitingConfig {
    pub fn idle_eviction(&self) -> Duration {
        Duration::from_secs(self.idle_eviction_secs)
    }

    pub fn block_window(&self) -> Duration {
        Duration::from_secs(self.block_window_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `gatekeeper=debug,tower_http=info`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl GatekeeperConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration file");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GatekeeperConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GatekeeperError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Build the layered configuration: defaults, then the optional file,
    /// then `GATEKEEPER_*` environment variables.
    ///
    /// The result is not validated, so later overrides can still correct it.
    /// Call [`GatekeeperConfig::validate`] once they are applied.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: GatekeeperConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject settings the limiter cannot run with.
    pub fn validate(&self) -> Result<()> {
        let rl = &self.rate_limiting;

        if rl.requests_per_minute == 0 {
            return Err(GatekeeperError::Config(
                "rate_limiting.requests_per_minute must be greater than zero".to_string(),
            ));
        }
        if rl.block_window_secs == 0 {
            return Err(GatekeeperError::Config(
                "rate_limiting.block_window_secs must be greater than zero".to_string(),
            ));
        }
        if rl.idle_eviction_secs == 0 {
            return Err(GatekeeperError::Config(
                "rate_limiting.idle_eviction_secs must be greater than zero".to_string(),
            ));
        }
        if rl.sweep_interval_secs == 0 {
            return Err(GatekeeperError::Config(
                "rate_limiting.sweep_interval_secs must be greater than zero".to_string(),
            ));
        }

        if rl.idle_eviction_secs < rl.block_window_secs {
            warn!(
                idle_eviction_secs = rl.idle_eviction_secs,
                block_window_secs = rl.block_window_secs,
                "Idle eviction is shorter than the block window; evicted visitors start with a fresh bucket"
            );
        }

        Ok(())
    }
}
