//! Configuration system for Conduit.
//!
//! Uses `figment` for layered configuration: defaults -> user config file -> explicit file ->
//! environment -> overrides. The user config lives at `~/.config/conduit/config.toml`.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::transport::{Backoff, DEFAULT_MAX_FRAME_LENGTH, DEFAULT_RECONNECT_DELAYS_SECS};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConduitConfig {
    pub server: ServerConfig,
    pub transport: TransportConfig,
    pub reconnect: ReconnectConfig,
    pub rpc: RpcConfig,
    pub pool: PoolConfig,
}

/// Listening socket options for the connection host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub backlog: u32,
    pub reuse_address: bool,
    pub reuse_port: bool,
    /// Maximum number of live connections; unlimited when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 7400,
            backlog: 1024,
            reuse_address: true,
            reuse_port: false,
            max_connections: None,
        }
    }
}

impl ServerConfig {
    /// `host:port` form of the listen address.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Framing options for socket transports.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    pub delimiter: String,
    /// Deliver raw read chunks instead of delimiter-terminated frames.
    pub raw: bool,
    pub read_buffer_size: usize,
    pub max_frame_length: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            delimiter: "\n".into(),
            raw: false,
            read_buffer_size: 64 * 1024,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

/// Reconnect backoff sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectConfig {
    pub delays_secs: Vec<f64>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            delays_secs: DEFAULT_RECONNECT_DELAYS_SECS.to_vec(),
        }
    }
}

impl ReconnectConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::from_secs(&self.delays_secs)
    }
}

/// RPC engine behavior.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RpcConfig {
    /// Answer unknown methods with `WrongConsumer` instead of dropping them.
    pub raise_on_unregistered: bool,
    /// Ignore inbound requests entirely.
    pub dont_receive: bool,
    /// How long `stop()` waits for in-flight work after a connection loss.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_timeout_secs: Option<f64>,
    /// Default bound for outbound calls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_timeout_secs: Option<f64>,
    /// Fail still-pending outbound calls with `RPCSenderStopped` when the engine stops.
    pub fail_pending_on_stop: bool,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            raise_on_unregistered: true,
            dont_receive: false,
            stop_timeout_secs: Some(5.0),
            call_timeout_secs: None,
            fail_pending_on_stop: false,
        }
    }
}

impl RpcConfig {
    pub fn stop_timeout(&self) -> Option<Duration> {
        self.stop_timeout_secs.and_then(secs_to_duration)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_secs.and_then(secs_to_duration)
    }
}

/// Static pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    pub size: usize,
    /// Creation attempts per element before giving up; unbounded when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 4,
            max_attempts: None,
        }
    }
}

fn secs_to_duration(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs).ok()
}

impl ConduitConfig {
    /// Reject settings the runtime cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: &str| {
            Err(ConfigError::Invalid {
                message: message.to_string(),
            })
        };

        if self.reconnect.delays_secs.is_empty() {
            return invalid("reconnect.delays_secs must not be empty");
        }
        if self
            .reconnect
            .delays_secs
            .iter()
            .any(|secs| !secs.is_finite() || *secs < 0.0)
        {
            return invalid("reconnect.delays_secs must be finite and non-negative");
        }
        if !self.transport.raw && self.transport.delimiter.is_empty() {
            return invalid("transport.delimiter must not be empty unless transport.raw is set");
        }
        if self.transport.read_buffer_size == 0 {
            return invalid("transport.read_buffer_size must be positive");
        }
        if self.pool.size == 0 {
            return invalid("pool.size must be positive");
        }
        if self.pool.max_attempts == Some(0) {
            return invalid("pool.max_attempts must be positive");
        }
        if self.server.max_connections == Some(0) {
            return invalid("server.max_connections must be positive");
        }
        for (name, value) in [
            ("rpc.stop_timeout_secs", self.rpc.stop_timeout_secs),
            ("rpc.call_timeout_secs", self.rpc.call_timeout_secs),
        ] {
            if let Some(secs) = value {
                if secs_to_duration(secs).is_none() {
                    return Err(ConfigError::Invalid {
                        message: format!("{name} must be finite and non-negative"),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Path of the user-level config file, if a home directory is known.
pub fn user_config_path() -> Option<std::path::PathBuf> {
    directories::ProjectDirs::from("dev", "conduit", "conduit")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Load configuration by merging all sources (later entries win):
/// 1. Built-in defaults
/// 2. User config (`~/.config/conduit/config.toml`)
/// 3. Explicit config file
/// 4. Environment variables (prefixed with `CONDUIT_`)
/// 5. Explicit overrides (passed as argument)
pub fn load_config(
    path: Option<&Path>,
    overrides: Option<&ConduitConfig>,
) -> Result<ConduitConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(ConduitConfig::default()));

    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(path) = path {
        if !path.exists() {
            return Err(ConfigError::Invalid {
                message: format!("config file not found: {}", path.display()),
            });
        }
        figment = figment.merge(Toml::file(path));
    }

    // Environment variables (CONDUIT_SERVER__PORT, CONDUIT_RPC__DONT_RECEIVE, etc.)
    figment = figment.merge(Env::prefixed("CONDUIT_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    let config: ConduitConfig = figment.extract().map_err(Box::new)?;
    config.validate()?;
    Ok(config)
}
