//! # Node Configuration
//!
//! Layered the same way for every setting: built-in defaults, then the JSON
//! file (`transport_node.conf` or `--config-path`), then environment
//! variables and CLI flags. Later layers win for every value they set.

use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use lib_transport::configs::ConfigError;
use lib_transport::TransportConfig;

const DEFAULT_CONFIG_FILE: &str = "transport_node.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "WorldMates adaptive transport node", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "WM_CONFIG_PATH", help = "Path to the JSON node configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "WM_TRANSPORT_CONFIG", help = "Path to a JSON transport configuration (timings, endpoints).")]
    pub transport_config: Option<PathBuf>,

    #[clap(long, env = "WM_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "WM_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "WM_ACCESS_TOKEN", help = "Session access token.")]
    pub access_token: Option<String>,

    #[clap(long, env = "WM_USER_ID", help = "Id of the logged-in user.")]
    pub user_id: Option<u64>,

    #[clap(long, env = "WM_API_BASE_URL", help = "Base URL of the REST business API.")]
    pub api_base_url: Option<String>,

    #[clap(long, env = "WM_HEALTH_URL", help = "Endpoint probed for connection quality.")]
    pub health_url: Option<String>,

    #[clap(long, env = "WM_SOCKET_URL", help = "Socket.IO WebSocket endpoint.")]
    pub socket_url: Option<String>,

    #[clap(long, env = "WM_CACHE_DIR", help = "Media cache directory.")]
    pub cache_dir: Option<PathBuf>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            transport_config: other.transport_config.or(self.transport_config),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            access_token: other.access_token.or(self.access_token),
            user_id: other.user_id.or(self.user_id),
            api_base_url: other.api_base_url.or(self.api_base_url),
            health_url: other.health_url.or(self.health_url),
            socket_url: other.socket_url.or(self.socket_url),
            cache_dir: other.cache_dir.or(self.cache_dir),
        }
    }

    /// Log directory, defaulting to `./logs`.
    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    /// Log level, defaulting to `info`.
    pub fn log_level(&self) -> String {
        self.log_level.clone().unwrap_or_else(|| "info".to_string())
    }

    /// Credentials, when both halves are configured.
    pub fn credentials(&self) -> Option<(String, u64)> {
        match (&self.access_token, self.user_id) {
            (Some(token), Some(user_id)) if !token.is_empty() => Some((token.clone(), user_id)),
            _ => None,
        }
    }

    /// Transport settings: the optional JSON file, then the endpoint and
    /// cache overrides of this config.
    pub fn transport(&self) -> Result<TransportConfig, ConfigError> {
        let mut transport = match &self.transport_config {
            Some(path) => TransportConfig::from_json_file(path)?,
            None => TransportConfig::default(),
        };
        if let Some(url) = &self.api_base_url {
            transport.api_base_url = url.clone();
        }
        if let Some(url) = &self.health_url {
            transport.health_url = url.clone();
        }
        if let Some(url) = &self.socket_url {
            transport.socket_url = url.clone();
        }
        if let Some(dir) = &self.cache_dir {
            transport.media.cache_dir = dir.clone();
        }
        transport.validate()?;
        Ok(transport)
    }
}

fn defaults() -> Config {
    Config {
        log_dir: Some(PathBuf::from("./logs")),
        log_level: Some("info".to_string()),
        ..Default::default()
    }
}

fn read_file(path: &Path) -> Option<Config> {
    if !path.exists() {
        info!("Config file not found at {}. Using defaults and environment/CLI variables.", path.display());
        return None;
    }
    match fs::read_to_string(path) {
        Ok(text) => match serde_json::from_str::<Config>(&text) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!("Failed to parse config file {}: {e}. Falling back to other sources.", path.display());
                None
            }
        },
        Err(e) => {
            warn!("Failed to read config file {}: {e}. Falling back to other sources.", path.display());
            None
        }
    }
}

/// Resolves the layered configuration from already parsed CLI/env values.
pub fn resolve(cli: Config) -> Config {
    let path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current = defaults();
    if let Some(file_config) = read_file(&path) {
        current = current.merge(file_config);
    }
    current.merge(cli)
}

/// Parses CLI arguments and environment, then layers file and defaults below.
pub fn load_config() -> Config {
    resolve(Config::parse())
}
