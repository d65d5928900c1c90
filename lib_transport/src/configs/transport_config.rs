//! # Transport Configuration
//!
//! Every field has a default, so an empty JSON object (or no file at all) is a
//! valid configuration. Durations are stored as milliseconds and exposed as
//! [`Duration`] through accessor methods.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::configs::ConfigError;

const DEFAULT_API_BASE_URL: &str = "https://worldmates.club/api/v2/";
const DEFAULT_HEALTH_URL: &str = "https://worldmates.club/api/v2/ping.php";
const DEFAULT_SOCKET_URL: &str = "wss://worldmates.club:449/socket.io/?EIO=4&transport=websocket";
const DEFAULT_USER_AGENT: &str = "WorldMates-Transport/1.0";

/// # Transport Config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportConfig {
    /// Base URL of the REST business API (trailing slash significant).
    pub api_base_url: String,
    /// Endpoint probed with `HEAD` by the quality sampler.
    pub health_url: String,
    /// Socket.IO WebSocket endpoint (`EIO=4&transport=websocket`).
    pub socket_url: String,
    /// Quality sampler settings.
    pub sampler: SamplerConfig,
    /// Persistent channel settings.
    pub channel: ChannelConfig,
    /// Polling fallback settings.
    pub polling: PollingConfig,
    /// Media scheduler settings.
    pub media: MediaConfig,
    /// REST client settings.
    pub rest: RestConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            health_url: DEFAULT_HEALTH_URL.to_string(),
            socket_url: DEFAULT_SOCKET_URL.to_string(),
            sampler: SamplerConfig::default(),
            channel: ChannelConfig::default(),
            polling: PollingConfig::default(),
            media: MediaConfig::default(),
            rest: RestConfig::default(),
        }
    }
}

impl TransportConfig {
    /// Loads a JSON file; absent fields keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let config: TransportConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values that would stall a loop or a worker pool.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("sampler.intervalMs", self.sampler.interval_ms),
            ("sampler.probeTimeoutMs", self.sampler.probe_timeout_ms),
            ("polling.intervalMs", self.polling.interval_ms),
            ("polling.fetchTimeoutMs", self.polling.fetch_timeout_ms),
            ("channel.reconnectInitialMs", self.channel.reconnect_initial_ms),
            ("media.fetchTimeoutMs", self.media.fetch_timeout_ms),
        ];
        for (field, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.sampler.history_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "sampler.historyCapacity",
                reason: "must hold at least one sample".to_string(),
            });
        }
        if self.media.workers == 0 {
            return Err(ConfigError::Invalid {
                field: "media.workers",
                reason: "at least one worker is required".to_string(),
            });
        }
        if self.channel.reconnect_max_ms < self.channel.reconnect_initial_ms {
            return Err(ConfigError::Invalid {
                field: "channel.reconnectMaxMs",
                reason: "must not be below reconnectInitialMs".to_string(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TransportConfig
    API: {},
    Health: {} (every {}ms, timeout {}ms),
    Socket: {},
    Polling: every {}ms,
    Media: {} workers, cache {}",
            self.api_base_url,
            self.health_url,
            self.sampler.interval_ms,
            self.sampler.probe_timeout_ms,
            self.socket_url,
            self.polling.interval_ms,
            self.media.workers,
            self.media.cache_dir.display()
        )
    }
}

/// Quality sampler timings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SamplerConfig {
    /// Fixed sampling interval.
    pub interval_ms: u64,
    /// Bound on a single health probe.
    pub probe_timeout_ms: u64,
    /// Size of the smoothing ring buffer.
    pub history_capacity: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            probe_timeout_ms: 5_000,
            history_capacity: 5,
        }
    }
}

impl SamplerConfig {
    /// Sampling interval.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Probe timeout.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Persistent channel timings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelConfig {
    /// Bound on TCP/TLS/WebSocket/Socket.IO handshake.
    pub connect_timeout_ms: u64,
    /// First reconnect delay.
    pub reconnect_initial_ms: u64,
    /// Reconnect delay cap.
    pub reconnect_max_ms: u64,
    /// Consecutive failed connects (before any success) reported as unavailable.
    pub setup_failure_threshold: u32,
    /// Silence after which a session is considered dead.
    pub ping_timeout_ms: u64,
    /// Replace the three timings above with the per-quality table when a
    /// channel is opened.
    pub adaptive_timing: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            reconnect_initial_ms: 1_000,
            reconnect_max_ms: 5_000,
            setup_failure_threshold: 3,
            ping_timeout_ms: 45_000,
            adaptive_timing: true,
        }
    }
}

impl ChannelConfig {
    /// Connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// First reconnect delay.
    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    /// Reconnect delay cap.
    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    /// Session silence bound.
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}

/// Polling fallback timings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PollingConfig {
    /// Fixed poll cadence.
    pub interval_ms: u64,
    /// Bound on a single fetch.
    pub fetch_timeout_ms: u64,
    /// Maximum messages requested per poll.
    pub page_limit: u32,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 3_000,
            fetch_timeout_ms: 10_000,
            page_limit: 30,
        }
    }
}

impl PollingConfig {
    /// Poll cadence.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Fetch timeout.
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

/// Media scheduler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MediaConfig {
    /// Fixed worker pool size.
    pub workers: usize,
    /// Cache root; thumbnails live in `thumbnails/` below it.
    pub cache_dir: PathBuf,
    /// Bound on a single media download.
    pub fetch_timeout_ms: u64,
    /// Every n-th dequeue takes the oldest task regardless of priority (0 disables).
    pub fifo_every: u32,
    /// Hold back tasks the current media load mode does not allow.
    pub gate_on_load_mode: bool,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            cache_dir: default_cache_dir(),
            fetch_timeout_ms: 30_000,
            fifo_every: 4,
            gate_on_load_mode: true,
        }
    }
}

impl MediaConfig {
    /// Download timeout.
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

/// REST client settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RestConfig {
    /// Whole-request timeout for API calls.
    pub timeout_ms: u64,
    /// User agent sent with every request.
    pub user_agent: String,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 15_000,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl RestConfig {
    /// Request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|dir| dir.join("worldmates").join("media_cache"))
        .unwrap_or_else(|| PathBuf::from("media_cache"))
}
