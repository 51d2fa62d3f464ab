//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via GRAPHWIRE_CONFIG)
//! 3. Environment variables

use graphwire_protocol::{ProtocolVersion, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_PORT, MAX_CHUNK_SIZE};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub protocol: ProtocolConfig,
    pub auth: AuthConfig,
    pub tls: TlsConfig,
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("GRAPHWIRE_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.protocol.apply_env_overrides();
        self.auth.apply_env_overrides();
        self.tls.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Loads secrets from external file if configured.
    pub fn load_secrets(&mut self) -> Result<(), ConfigError> {
        self.auth.load_secrets()
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.network.validate()?;
        self.protocol.versions()?;
        self.tls.validate()
    }
}

fn env_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Idle connection timeout in seconds.
    pub idle_timeout_secs: u64,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Largest reassembled request message in bytes.
    pub max_message_size: usize,
    /// Largest chunk body written to clients.
    pub max_chunk_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            idle_timeout_secs: 300,
            max_connections: 1000,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_chunk_size: MAX_CHUNK_SIZE,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("GRAPHWIRE_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        if let Ok(timeout) = std::env::var("GRAPHWIRE_IDLE_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.idle_timeout_secs = secs;
            }
        }

        if let Ok(max) = std::env::var("GRAPHWIRE_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }

        if let Ok(size) = std::env::var("GRAPHWIRE_MAX_MESSAGE_SIZE") {
            if let Ok(n) = size.parse() {
                self.max_message_size = n;
            }
        }

        if let Ok(size) = std::env::var("GRAPHWIRE_MAX_CHUNK_SIZE") {
            if let Ok(n) = size.parse() {
                self.max_chunk_size = n;
            }
        }
    }

    /// Returns idle timeout as Duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_chunk_size == 0 || self.max_chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::Validation(format!(
                "max_chunk_size must be between 1 and {}, got {}",
                MAX_CHUNK_SIZE, self.max_chunk_size
            )));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::Validation(
                "max_message_size must be positive".to_string(),
            ));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Validation(
                "max_connections must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Protocol configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Versions offered during the handshake.
    pub enabled_versions: Vec<u32>,
    /// Agent string reported in the `server` field of the handshake SUCCESS.
    pub server_agent: String,
    /// How long RESET waits for in-flight execution to stop, in milliseconds.
    pub reset_timeout_ms: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            enabled_versions: ProtocolVersion::ALL.iter().map(|v| v.number()).collect(),
            server_agent: format!("graphwire/{}", env!("CARGO_PKG_VERSION")),
            reset_timeout_ms: 5000,
        }
    }
}

impl ProtocolConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(list) = std::env::var("GRAPHWIRE_PROTOCOL_VERSIONS") {
            let parsed: Result<Vec<u32>, _> =
                list.split(',').map(|v| v.trim().parse::<u32>()).collect();
            if let Ok(versions) = parsed {
                self.enabled_versions = versions;
            }
        }

        if let Ok(agent) = std::env::var("GRAPHWIRE_SERVER_AGENT") {
            if !agent.is_empty() {
                self.server_agent = agent;
            }
        }

        if let Ok(ms) = std::env::var("GRAPHWIRE_RESET_TIMEOUT_MS") {
            if let Ok(n) = ms.parse() {
                self.reset_timeout_ms = n;
            }
        }
    }

    /// Returns the enabled versions, rejecting unknown numbers.
    pub fn versions(&self) -> Result<Vec<ProtocolVersion>, ConfigError> {
        if self.enabled_versions.is_empty() {
            return Err(ConfigError::Validation(
                "at least one protocol version must be enabled".to_string(),
            ));
        }
        self.enabled_versions
            .iter()
            .map(|&n| {
                ProtocolVersion::from_number(n).ok_or_else(|| {
                    ConfigError::Validation(format!("unknown protocol version {}", n))
                })
            })
            .collect()
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

/// Authentication configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Whether clients must present valid credentials.
    pub required: bool,
    /// SHA-256 hex hashes of `principal:credentials`.
    pub credential_hashes: Vec<String>,
    /// Optional path to external secrets file containing hashes (one per line).
    pub secrets_file: Option<PathBuf>,
}

impl AuthConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(auth) = std::env::var("GRAPHWIRE_AUTH_REQUIRED") {
            self.required = env_flag(&auth);
        }

        if let Ok(hash) = std::env::var("GRAPHWIRE_AUTH_CREDENTIAL_HASH") {
            if !hash.is_empty() {
                self.credential_hashes.push(hash);
            }
        }

        if let Ok(path) = std::env::var("GRAPHWIRE_AUTH_SECRETS_FILE") {
            self.secrets_file = Some(PathBuf::from(path));
        }
    }

    /// Loads credential hashes from the secrets file if configured.
    pub fn load_secrets(&mut self) -> Result<(), ConfigError> {
        if let Some(ref path) = self.secrets_file {
            let content =
                std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.clone(), e))?;
            for line in content.lines() {
                let line = line.trim();
                if !line.is_empty() && !line.starts_with('#') {
                    self.credential_hashes.push(line.to_string());
                }
            }
        }
        Ok(())
    }
}

/// TLS configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    /// Path to PEM-encoded server certificate file.
    pub cert_path: Option<PathBuf>,
    /// Path to PEM-encoded private key file.
    pub key_path: Option<PathBuf>,
    /// Require client certificate authentication (mTLS).
    pub require_client_cert: bool,
    /// Path to PEM-encoded CA certificate(s) for verifying client certs.
    /// Required if require_client_cert is true.
    pub client_ca_path: Option<PathBuf>,
}

impl TlsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("GRAPHWIRE_TLS_ENABLED") {
            self.enabled = env_flag(&enabled);
        }
        if let Ok(path) = std::env::var("GRAPHWIRE_TLS_CERT") {
            self.cert_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("GRAPHWIRE_TLS_KEY") {
            self.key_path = Some(PathBuf::from(path));
        }
        if let Ok(require) = std::env::var("GRAPHWIRE_TLS_REQUIRE_CLIENT_CERT") {
            self.require_client_cert = env_flag(&require);
        }
        if let Ok(path) = std::env::var("GRAPHWIRE_TLS_CLIENT_CA") {
            self.client_ca_path = Some(PathBuf::from(path));
        }
    }

    /// Validates TLS configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }

        if self.cert_path.is_none() {
            return Err(ConfigError::Validation(
                "TLS enabled but cert_path not set".to_string(),
            ));
        }
        if self.key_path.is_none() {
            return Err(ConfigError::Validation(
                "TLS enabled but key_path not set".to_string(),
            ));
        }
        if self.require_client_cert && self.client_ca_path.is_none() {
            return Err(ConfigError::Validation(
                "mTLS enabled but client_ca_path not set".to_string(),
            ));
        }

        Ok(())
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics HTTP server.
    pub enabled: bool,
    /// Address to bind the metrics server to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 9090)),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("GRAPHWIRE_METRICS_ENABLED") {
            self.enabled = env_flag(&enabled);
        }
        if let Ok(addr) = std::env::var("GRAPHWIRE_METRICS_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {1}", .0.display())]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file '{}': {1}", .0.display())]
    Parse(PathBuf, String),

    #[error("configuration validation failed: {0}")]
    Validation(String),
}

/// Serde module for SocketAddr (kept as a string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.bind_addr.port(), 7687);
        assert_eq!(config.network.max_chunk_size, 65535);
        assert_eq!(config.protocol.reset_timeout(), Duration::from_secs(5));
        assert_eq!(
            config.protocol.versions().unwrap(),
            vec![ProtocolVersion::V3, ProtocolVersion::V2, ProtocolVersion::V1]
        );
        assert!(config.protocol.server_agent.starts_with("graphwire/"));
        assert!(!config.auth.required);
        config.validate().unwrap();
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.network.bind_addr, config.network.bind_addr);
        assert_eq!(parsed.protocol.enabled_versions, config.protocol.enabled_versions);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
network:
  bind_addr: "0.0.0.0:9999"
protocol:
  enabled_versions: [1]
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.network.bind_addr.port(), 9999);
        assert_eq!(config.network.max_connections, 1000);
        assert_eq!(config.protocol.versions().unwrap(), vec![ProtocolVersion::V1]);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "auth:\n  required: true\n  credential_hashes: [\"abc\"]").unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert!(config.auth.required);
        assert_eq!(config.auth.credential_hashes, vec!["abc"]);

        let missing = Config::from_file("/nonexistent/graphwire.yaml");
        assert!(matches!(missing, Err(ConfigError::Io(..))));
    }

    #[test]
    fn test_secrets_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# comment\n\nhash-one\n  hash-two  ").unwrap();
        let mut auth = AuthConfig {
            secrets_file: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        auth.load_secrets().unwrap();
        assert_eq!(auth.credential_hashes, vec!["hash-one", "hash-two"]);
    }

    #[test]
    fn test_validation_errors() {
        let mut config = Config::default();
        config.protocol.enabled_versions = vec![3, 9];
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

        let mut config = Config::default();
        config.protocol.enabled_versions.clear();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.network.max_chunk_size = 70_000;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.tls.enabled = true;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("cert_path"));
    }
}
