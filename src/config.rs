//! # Configuration Management
//!
//! Centralized configuration shared by the server and client.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment overrides via `from_env()` (`SESSION_NET_*`)
//!
//! ## Sections
//! - `network`: listen/connect address, UDP, tunnelling port
//! - `security`: TLS material, HMAC and auth token switches
//! - `server`: slot capacity, welcome text, tick rate
//! - `client`: username, connect timeout, tick rate
//! - `monitor`: latency, bandwidth and throughput probe parameters
//! - `logging`: subscriber output
//!
//! Both peers must agree on `security.use_hmac` and
//! `security.use_auth_tokens`; they change the wire layout.

use crate::error::{constants, ProtocolError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Max allowed frame payload size (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Default TCP/UDP port
pub const DEFAULT_PORT: u16 = 7777;

/// Default number of connection slots
pub const DEFAULT_MAX_CCU: usize = 10;

/// Bandwidth probe payload (512 KiB)
pub const BANDWIDTH_PAYLOAD_SIZE: usize = 512 * 1024;

/// Number of packets in a throughput test
pub const THROUGHPUT_PACKET_COUNT: usize = 100;

/// Size of each throughput test packet
pub const THROUGHPUT_PACKET_SIZE: usize = 1024;

/// Number of RTT samples kept for the latency average and jitter
pub const LATENCY_SAMPLE_WINDOW: usize = 10;

/// Main network configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    #[serde(default)]
    pub network: NetworkSection,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("SESSION_NET_IP_ADDRESS") {
            config.network.ip_address = addr;
        }

        if let Ok(port) = std::env::var("SESSION_NET_PORT") {
            config.network.port = port
                .parse()
                .map_err(|_| ProtocolError::ConfigError(format!("Invalid port: {port}")))?;
        }

        if let Ok(ccu) = std::env::var("SESSION_NET_MAX_CCU") {
            if let Ok(val) = ccu.parse::<usize>() {
                config.server.max_ccu = val;
            }
        }

        if let Ok(flag) = std::env::var("SESSION_NET_ALLOW_UDP") {
            if let Ok(val) = flag.parse::<bool>() {
                config.network.allow_udp = val;
            }
        }

        if let Ok(flag) = std::env::var("SESSION_NET_USE_TLS") {
            if let Ok(val) = flag.parse::<bool>() {
                config.security.use_tls = val;
            }
        }

        if let Ok(path) = std::env::var("SESSION_NET_CERTIFICATE_PATH") {
            config.security.certificate_path = Some(path);
        }

        if let Ok(path) = std::env::var("SESSION_NET_PRIVATE_KEY_PATH") {
            config.security.private_key_path = Some(path);
        }

        if let Ok(password) = std::env::var("SESSION_NET_CERTIFICATE_PASSWORD") {
            config.security.certificate_password = Some(password);
        }

        if let Ok(name) = std::env::var("SESSION_NET_USERNAME") {
            config.client.username = Some(name);
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.network.validate());
        errors.extend(self.security.validate());
        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
        errors.extend(self.monitor.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }

    /// Which optional fields appear on the wire.
    pub fn wire_options(&self) -> crate::protocol::message::WireOptions {
        crate::protocol::message::WireOptions {
            auth_tokens: self.security.use_auth_tokens,
            hmac: self.security.use_hmac,
        }
    }
}

/// Address and transport switches
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkSection {
    /// Server IP to listen on (server) or connect to (client)
    pub ip_address: String,

    /// TCP port; UDP uses the same port
    pub port: u16,

    /// Whether unreliable traffic may use UDP
    pub allow_udp: bool,

    /// Listen on `tunnel_port` instead of `port` (port-forwarded deployments)
    pub use_tunneling: bool,

    pub tunnel_port: u16,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            ip_address: String::from("127.0.0.1"),
            port: DEFAULT_PORT,
            allow_udp: true,
            use_tunneling: false,
            tunnel_port: DEFAULT_PORT,
        }
    }
}

impl NetworkSection {
    /// Port the server listens on.
    pub fn listen_port(&self) -> u16 {
        if self.use_tunneling {
            self.tunnel_port
        } else {
            self.port
        }
    }

    /// Address the server binds.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self.ip_address.parse().map_err(|_| {
            ProtocolError::ConfigError(format!("Invalid IP address: '{}'", self.ip_address))
        })?;
        Ok(SocketAddr::new(ip, self.listen_port()))
    }

    /// Address the client connects to.
    pub fn server_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self.ip_address.parse().map_err(|_| {
            ProtocolError::ConfigError(format!("Invalid IP address: '{}'", self.ip_address))
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.ip_address.is_empty() {
            errors.push("IP address cannot be empty".to_string());
        } else if self.ip_address.parse::<IpAddr>().is_err() {
            errors.push(format!(
                "Invalid IP address: '{}' (expected format: '127.0.0.1')",
                self.ip_address
            ));
        }

        if self.use_tunneling && self.tunnel_port == 0 {
            errors.push("Tunnel port must be set when tunnelling is enabled".to_string());
        }

        errors
    }
}

/// TLS, HMAC and auth token settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Wrap TCP in TLS (TLS 1.2 minimum)
    pub use_tls: bool,

    /// PEM certificate chain (server)
    pub certificate_path: Option<String>,

    /// PEM PKCS#8 private key (server)
    pub private_key_path: Option<String>,

    /// Password for an encrypted PKCS#8 key (`ENCRYPTED PRIVATE KEY` PEM)
    pub certificate_password: Option<String>,

    /// PEM CA bundle the client trusts; native roots when unset
    pub ca_certificate_path: Option<String>,

    /// Name the client expects in the server certificate
    pub server_name: String,

    /// Append HMAC-SHA256 tags to integrity-protected messages
    pub use_hmac: bool,

    /// Require the auth token in client requests
    pub use_auth_tokens: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            use_tls: false,
            certificate_path: None,
            private_key_path: None,
            certificate_password: None,
            ca_certificate_path: None,
            server_name: String::from("localhost"),
            use_hmac: true,
            use_auth_tokens: true,
        }
    }
}

impl SecurityConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.certificate_password.as_deref() == Some("") {
            errors.push(constants::ERR_EMPTY_PASSWORD.to_string());
        }

        if self.use_tls {
            for (label, path) in [
                ("certificate_path", &self.certificate_path),
                ("private_key_path", &self.private_key_path),
            ] {
                match path {
                    None => errors.push(format!("{label} must be specified when use_tls is true")),
                    Some(p) if !Path::new(p).exists() => {
                        errors.push(format!("{label} does not exist: {p}"))
                    }
                    Some(_) => {}
                }
            }

            if self.server_name.is_empty() {
                errors.push("server_name cannot be empty when use_tls is true".to_string());
            }
        }

        if let Some(ref ca) = self.ca_certificate_path {
            if !Path::new(ca).exists() {
                errors.push(format!("ca_certificate_path does not exist: {ca}"));
            }
        }

        errors
    }
}

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Number of connection slots
    pub max_ccu: usize,

    /// Greeting sent in the Welcome message
    pub welcome_message: String,

    /// Whether clients surface the greeting as a chat message
    pub send_welcome_message: bool,

    /// Interval between dispatch queue drains
    #[serde(with = "duration_serde")]
    pub tick_interval: Duration,

    /// Largest accepted TCP frame payload
    pub max_frame_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_ccu: DEFAULT_MAX_CCU,
            welcome_message: String::from("Welcome to server!"),
            send_welcome_message: true,
            tick_interval: timeout::TICK_INTERVAL,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_ccu == 0 {
            errors.push("max_ccu must be greater than 0".to_string());
        } else if self.max_ccu > i32::MAX as usize {
            errors.push(format!("max_ccu too large: {}", self.max_ccu));
        }

        if self.tick_interval.is_zero() {
            errors.push("Server tick interval must be greater than 0".to_string());
        } else if self.tick_interval.as_secs() > 1 {
            errors.push("Server tick interval too long (maximum: 1s)".to_string());
        }

        if self.max_frame_size < 1024 {
            errors.push("Max frame size too small (minimum: 1 KB)".to_string());
        } else if self.max_frame_size > 100 * 1024 * 1024 {
            errors.push(format!(
                "Max frame size too large: {} bytes (maximum recommended: 100 MB)",
                self.max_frame_size
            ));
        }

        errors
    }
}

/// Client-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Display name; a random `Guest<n>` when unset
    pub username: Option<String>,

    /// Timeout for connection attempts (including the TLS handshake)
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,

    /// Interval at which the owner should call `Client::tick`
    #[serde(with = "duration_serde")]
    pub tick_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            username: None,
            connection_timeout: timeout::DEFAULT_TIMEOUT,
            tick_interval: timeout::TICK_INTERVAL,
        }
    }
}

impl ClientConfig {
    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if let Some(ref name) = self.username {
            if name.is_empty() {
                errors.push("Username cannot be empty".to_string());
            }
        }

        if self.connection_timeout.as_millis() < 100 {
            errors.push("Connection timeout too short (minimum: 100ms)".to_string());
        }

        if self.tick_interval.is_zero() {
            errors.push("Client tick interval must be greater than 0".to_string());
        }

        errors
    }
}

/// Network quality probe configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitorConfig {
    #[serde(with = "duration_serde")]
    pub ping_interval: Duration,

    /// Age after which a ping counts as lost
    #[serde(with = "duration_serde")]
    pub ping_timeout: Duration,

    /// RTT samples kept for average and jitter
    pub sample_window: usize,

    pub bandwidth_payload_size: usize,

    pub throughput_packet_count: usize,

    pub throughput_packet_size: usize,

    #[serde(with = "duration_serde")]
    pub throughput_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            ping_interval: timeout::PING_INTERVAL,
            ping_timeout: timeout::PING_TIMEOUT,
            sample_window: LATENCY_SAMPLE_WINDOW,
            bandwidth_payload_size: BANDWIDTH_PAYLOAD_SIZE,
            throughput_packet_count: THROUGHPUT_PACKET_COUNT,
            throughput_packet_size: THROUGHPUT_PACKET_SIZE,
            throughput_timeout: timeout::THROUGHPUT_TIMEOUT,
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.ping_interval.as_millis() < 10 {
            errors.push("Ping interval too short (minimum: 10ms)".to_string());
        }

        if self.ping_timeout < self.ping_interval {
            errors.push("Ping timeout must not be shorter than the ping interval".to_string());
        }

        if self.sample_window < 2 {
            errors.push("Latency sample window must hold at least 2 samples".to_string());
        }

        if self.bandwidth_payload_size == 0 || self.bandwidth_payload_size > MAX_FRAME_SIZE / 2 {
            errors.push(format!(
                "Bandwidth payload size out of range: {} bytes",
                self.bandwidth_payload_size
            ));
        }

        if self.throughput_packet_count == 0 {
            errors.push("Throughput packet count must be greater than 0".to_string());
        }

        if self.throughput_packet_size == 0 || self.throughput_packet_size > 60 * 1024 {
            errors.push(format!(
                "Throughput packet size out of range: {} bytes (must fit in one datagram)",
                self.throughput_packet_size
            ));
        }

        if self.throughput_timeout.is_zero() {
            errors.push("Throughput timeout must be greater than 0".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to file instead of the console
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("session-net"),
            log_level: Level::INFO,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
