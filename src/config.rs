//! Configuration management for the dissftp server and client
//!
//! Separates startup configuration (requires restart) from runtime configuration
//! (shared with every session and updatable while the server runs).

use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Complete server configuration with startup/runtime separation
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ServerConfig {
    #[serde(flatten)]
    pub startup: StartupConfig,

    #[serde(flatten)]
    pub runtime: RuntimeConfig,
}

/// Configuration that requires server restart to take effect
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StartupConfig {
    // ═══ NETWORK ═══
    /// IP address to bind the FTP control connection
    pub bind_address: String,

    /// Port for FTP control connection (0 picks an ephemeral port)
    pub control_port: u16,

    /// Port range for PASV data connections, 0/0 for ephemeral ports
    pub data_port_min: u16,
    pub data_port_max: u16,

    /// Address advertised in 227 replies when the server sits behind NAT
    pub public_bound_address: Option<String>,

    /// Root directory for FTP operations
    pub server_root: String,

    /// Greeting text sent with 220
    pub banner: String,

    // ═══ TRANSFER BEHAVIOUR ═══
    /// Buffer size for file transfers
    pub buffer_size: usize,

    /// Idle timeout on the control connection
    pub control_timeout_ms: u64,

    /// Timeout for every read/write on a data socket
    pub data_timeout_ms: u64,

    /// Timeout waiting for the peer to connect a data socket
    pub port_timeout_ms: u64,

    /// PASV/EPSV accepted
    pub passive: bool,

    /// EPSV/EPRT accepted
    pub extended: bool,

    /// REST accepted
    pub rest: bool,

    /// Active connections bind their local end to control port - 1
    pub active_port_binding: bool,
    pub active_bind_retries: u32,

    // ═══ SECURITY LIMITS ═══
    pub max_command_length: usize,
    pub max_login_attempts: u32,
    pub min_client_port: u16,

    // ═══ USERS AND DOMAINS ═══
    pub users: Vec<UserEntry>,

    /// Domain name -> directory below `server_root`
    pub domains: HashMap<String, String>,

    pub socket: SocketOptions,
}

/// Configuration that can be updated at runtime
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Maximum concurrent clients
    /// Environment: DISSFTP_MAX_CLIENTS
    pub max_clients: usize,

    /// Maximum file upload size in MB
    /// Environment: DISSFTP_MAX_FILE_SIZE_MB
    pub max_file_size_mb: u64,
}

/// Thread-safe runtime configuration wrapper
pub type SharedRuntimeConfig = Arc<RwLock<RuntimeConfig>>;

/// One entry of the credential table.
#[derive(Debug, Deserialize, Clone)]
pub struct UserEntry {
    pub name: String,
    pub password: String,
    #[serde(default)]
    pub domain: Option<String>,
}

/// TCP tuning shared by control and data sockets on both sides.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct SocketOptions {
    pub send_buffer_size: Option<u32>,
    pub recv_buffer_size: Option<u32>,
    pub tcp_no_delay: Option<bool>,
    pub keep_alive: Option<bool>,
    pub keep_alive_time_secs: Option<u64>,
    pub keep_alive_interval_secs: Option<u64>,
    pub keep_alive_probes: Option<u32>,
    pub linger_secs: Option<u64>,
    pub congestion: Option<String>,
    pub max_pacing_rate: Option<u32>,
    pub window_clamp: Option<u32>,
    pub max_segment: Option<u32>,
    pub quick_ack: Option<bool>,
    pub user_timeout_ms: Option<u32>,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".into(),
            control_port: 2121,
            data_port_min: 0,
            data_port_max: 0,
            public_bound_address: None,
            server_root: "./ftp_root".into(),
            banner: "dissftp server ready".into(),
            buffer_size: 64 * 1024,
            control_timeout_ms: 2 * 60 * 60 * 1000,
            data_timeout_ms: 60_000,
            port_timeout_ms: 30_000,
            passive: true,
            extended: true,
            rest: true,
            active_port_binding: true,
            active_bind_retries: 4,
            max_command_length: 512,
            max_login_attempts: 3,
            min_client_port: 1024,
            users: Vec::new(),
            domains: HashMap::new(),
            socket: SocketOptions::default(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_clients: 64,
            max_file_size_mb: 1024,
        }
    }
}

impl ServerConfig {
    /// Load configuration from config.toml with environment overrides
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from `path` (extension optional) with
    /// `DISSFTP_*` environment overrides
    pub fn load_from(path: &str) -> Result<Self, config::ConfigError> {
        let settings = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("DISSFTP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let config: ServerConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Split into startup (immutable) and runtime (mutable) parts
    pub fn split(self) -> (StartupConfig, SharedRuntimeConfig) {
        let runtime = Arc::new(RwLock::new(self.runtime));
        (self.startup, runtime)
    }

    /// Validation for all configuration values
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        let startup = &self.startup;

        if startup.data_port_min > startup.data_port_max {
            return Err(config::ConfigError::Message(
                "data_port_min must not exceed data_port_max".into(),
            ));
        }

        if startup.server_root.is_empty() {
            return Err(config::ConfigError::Message(
                "server_root cannot be empty".into(),
            ));
        }

        if let Some(address) = &startup.public_bound_address {
            if address.parse::<std::net::Ipv4Addr>().is_err() {
                return Err(config::ConfigError::Message(format!(
                    "public_bound_address must be an IPv4 address, got {address}"
                )));
            }
        }

        if startup.buffer_size == 0 {
            return Err(config::ConfigError::Message(
                "buffer_size must be greater than 0".into(),
            ));
        }

        if self.runtime.max_clients == 0 {
            return Err(config::ConfigError::Message(
                "max_clients must be greater than 0".into(),
            ));
        }

        if self.runtime.max_file_size_mb == 0 {
            return Err(config::ConfigError::Message(
                "max_file_size_mb must be greater than 0".into(),
            ));
        }

        Ok(())
    }
}

impl StartupConfig {
    /// Get bind address and control port as socket address
    pub fn control_socket(&self) -> String {
        format!("{}:{}", self.bind_address, self.control_port)
    }

    /// Port range for PASV mode, `None` for ephemeral ports
    pub fn data_port_range(&self) -> Option<std::ops::RangeInclusive<u16>> {
        if self.data_port_min == 0 && self.data_port_max == 0 {
            None
        } else {
            Some(self.data_port_min..=self.data_port_max)
        }
    }

    /// Get server root as PathBuf
    pub fn server_root_path(&self) -> PathBuf {
        PathBuf::from(&self.server_root)
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }

    pub fn data_timeout(&self) -> Duration {
        Duration::from_millis(self.data_timeout_ms)
    }

    pub fn port_timeout(&self) -> Duration {
        Duration::from_millis(self.port_timeout_ms)
    }
}

impl RuntimeConfig {
    /// Get maximum file size in bytes
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }
}

/// Client-side knobs for [`crate::client::FtpClient`].
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ClientConfig {
    /// Try PASV/EPSV before falling back to PORT/EPRT
    pub passive: bool,
    /// Use EPSV/EPRT instead of PASV/PORT
    pub extended: bool,
    /// Request a shared passive socket (`OPTS PSHARED`)
    pub shared_passive: bool,
    /// Parallel streams requested with `OPTS PTCP`, 0 or 1 for a single stream
    pub streams: u32,
    /// Keep the data socket open and framed across transfers
    pub data_alive: bool,
    /// Listen on a privileged port for PORT/EPRT
    pub low_port: bool,
    /// Ask the server to create missing parent directories on upload
    pub mkdirs: bool,
    /// Always announce packet framing on upload
    pub packet: bool,
    pub comm_timeout_ms: u64,
    pub data_timeout_ms: u64,
    pub port_timeout_ms: u64,
    /// Local address for data sockets, the control socket's address if unset
    pub listen_address: Option<String>,
    /// Verb sent by `noop()`
    pub noop_command: String,
    /// Reply codes that make the engine resend the same command
    pub retry_codes: Vec<u16>,
    pub max_retries: u32,
    pub socket: SocketOptions,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            passive: true,
            extended: false,
            shared_passive: false,
            streams: 0,
            data_alive: false,
            low_port: false,
            mkdirs: false,
            packet: false,
            comm_timeout_ms: 60_000,
            data_timeout_ms: 60_000,
            port_timeout_ms: 30_000,
            listen_address: None,
            noop_command: "NOOP".into(),
            retry_codes: Vec::new(),
            max_retries: 3,
            socket: SocketOptions::default(),
        }
    }
}

impl ClientConfig {
    pub fn comm_timeout(&self) -> Duration {
        Duration::from_millis(self.comm_timeout_ms)
    }

    pub fn data_timeout(&self) -> Duration {
        Duration::from_millis(self.data_timeout_ms)
    }

    pub fn port_timeout(&self) -> Duration {
        Duration::from_millis(self.port_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(ServerConfig::default().validate().is_ok());
    }

    #[test]
    fn inverted_port_range_is_rejected() {
        let mut config = ServerConfig::default();
        config.startup.data_port_min = 5000;
        config.startup.data_port_max = 4000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn public_address_must_be_ipv4() {
        let mut config = ServerConfig::default();
        config.startup.public_bound_address = Some("example.org".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn environment_overrides_use_single_underscore_prefix() {
        // SAFETY: no other test touches this variable
        unsafe { std::env::set_var("DISSFTP_MAX_CLIENTS", "7") };
        let loaded = ServerConfig::load_from("no-such-config-file");
        unsafe { std::env::remove_var("DISSFTP_MAX_CLIENTS") };

        let config = loaded.unwrap();
        assert_eq!(config.runtime.max_clients, 7);
        assert_eq!(config.runtime.max_file_size_mb, RuntimeConfig::default().max_file_size_mb);
    }

    #[test]
    fn ephemeral_range_when_unset() {
        assert!(StartupConfig::default().data_port_range().is_none());
    }
}
