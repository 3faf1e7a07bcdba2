//! Configuration module
//!
//! Handles loading and saving NodeLink configuration.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::network::{NetworkConfig, ReconnectPolicy};
use crate::protocol::{DEFAULT_PORT, FIXED_HEADER_SIZE, MAX_FRAME_LENGTH};
use crate::session::AllowList;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Listening side
    #[serde(default)]
    pub server: ServerConfig,

    /// Connecting side
    #[serde(default)]
    pub client: ClientConfig,

    /// Settings both ends must agree on
    #[serde(default)]
    pub protocol: ProtocolConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Human-readable name for this node
    pub name: String,
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            verbose: false,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Interface to bind to
    #[serde(default = "default_host")]
    pub bind_address: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Peer IPs allowed to log in
    #[serde(default = "default_allow_list")]
    pub allow_list: Vec<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_allow_list() -> Vec<String> {
    vec!["127.0.0.1".to_string(), "192.168.1.104".to_string()]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_host(),
            port: default_port(),
            allow_list: default_allow_list(),
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server host name or IP
    #[serde(default = "default_host")]
    pub server_host: String,
    /// Server port
    #[serde(default = "default_port")]
    pub server_port: u16,
    /// Fixed local address to bind before connecting, e.g. "127.0.0.1:12088"
    pub local_address: Option<String>,
    /// Connection timeout in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Pause before reconnecting in ms
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,
    /// Give up after this many attempts (unset = retry forever)
    pub max_reconnect_attempts: Option<u32>,
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_reconnect_delay() -> u64 {
    1000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_host: default_host(),
            server_port: default_port(),
            local_address: None,
            connect_timeout_ms: default_connect_timeout(),
            reconnect_delay_ms: default_reconnect_delay(),
            max_reconnect_attempts: None,
        }
    }
}

/// Protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Heartbeat interval in ms
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    /// Drop a connection after this many seconds without inbound bytes
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    /// Largest accepted frame, header included
    #[serde(default = "default_max_frame_length")]
    pub max_frame_length: usize,
}

fn default_heartbeat_interval() -> u64 {
    5000
}

fn default_read_timeout() -> u64 {
    50
}

fn default_max_frame_length() -> usize {
    MAX_FRAME_LENGTH
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval(),
            read_timeout_secs: default_read_timeout(),
            max_frame_length: default_max_frame_length(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("nodelink/config.toml")),
            Some(PathBuf::from("./nodelink.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                tracing::debug!("Loading configuration from {}", path.display());
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Check values that would otherwise fail at runtime
    pub fn validate(&self) -> ConfigResult<()> {
        self.server
            .bind_address
            .parse::<IpAddr>()
            .map_err(|e| invalid(format!("server.bind_address {:?}: {}", self.server.bind_address, e)))?;

        self.local_addr()?;

        if self.protocol.heartbeat_interval_ms == 0 {
            return Err(invalid("protocol.heartbeat_interval_ms must be positive"));
        }
        if self.protocol.read_timeout_secs == 0 {
            return Err(invalid("protocol.read_timeout_secs must be positive"));
        }

        let max = self.protocol.max_frame_length;
        if max < FIXED_HEADER_SIZE || max > i32::MAX as usize {
            return Err(invalid(format!(
                "protocol.max_frame_length must be between {} and {}, got {}",
                FIXED_HEADER_SIZE,
                i32::MAX,
                max
            )));
        }

        if self.client.max_reconnect_attempts == Some(0) {
            return Err(invalid("client.max_reconnect_attempts must be at least 1"));
        }

        Ok(())
    }

    /// Address the server listens on
    pub fn server_bind_addr(&self) -> ConfigResult<SocketAddr> {
        let ip: IpAddr = self
            .server
            .bind_address
            .parse()
            .map_err(|e| invalid(format!("server.bind_address {:?}: {}", self.server.bind_address, e)))?;
        Ok(SocketAddr::new(ip, self.server.port))
    }

    /// The client's fixed local address, if configured
    pub fn local_addr(&self) -> ConfigResult<Option<SocketAddr>> {
        self.client
            .local_address
            .as_deref()
            .map(|addr| {
                addr.parse()
                    .map_err(|e| invalid(format!("client.local_address {:?}: {}", addr, e)))
            })
            .transpose()
    }

    pub fn allow_list(&self) -> AllowList {
        AllowList::new(self.server.allow_list.iter().cloned())
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let policy = ReconnectPolicy::fixed(Duration::from_millis(self.client.reconnect_delay_ms));
        match self.client.max_reconnect_attempts {
            Some(max) => policy.with_max_attempts(max),
            None => policy,
        }
    }

    /// Runtime settings for the network layer
    pub fn network_config(&self) -> ConfigResult<NetworkConfig> {
        Ok(NetworkConfig {
            connect_timeout_ms: self.client.connect_timeout_ms,
            heartbeat_interval_ms: self.protocol.heartbeat_interval_ms,
            read_timeout_secs: self.protocol.read_timeout_secs,
            max_frame_length: self.protocol.max_frame_length,
            local_addr: self.local_addr()?,
            reconnect: self.reconnect_policy(),
        })
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            name: "edge-node-1".to_string(),
            verbose: false,
        },
        client: ClientConfig {
            local_address: Some("127.0.0.1:12088".to_string()),
            ..Default::default()
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}
