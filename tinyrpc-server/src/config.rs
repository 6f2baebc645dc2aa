//! Process configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via TINYRPC_CONFIG)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tinyrpc_protocol::{CodecRegistry, CodecType};

/// Process configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// RPC listener configuration.
    pub network: NetworkConfig,
    /// Embedded registry configuration.
    pub registry: RegistryConfig,
    /// Heartbeat configuration.
    pub heartbeat: HeartbeatConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("TINYRPC_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.registry.apply_env_overrides();
        self.heartbeat.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Checks cross-section constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.codecs.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one codec must be accepted".to_string(),
            ));
        }
        let known = CodecRegistry::with_defaults();
        if let Some(unknown) = self.network.codecs.iter().find(|c| !known.contains(c)) {
            return Err(ConfigError::ValidationError(format!(
                "unknown codec: {}",
                unknown
            )));
        }
        if !self.registry.path.starts_with('/') {
            return Err(ConfigError::ValidationError(format!(
                "registry path must start with '/': {}",
                self.registry.path
            )));
        }
        if self.heartbeat.registry_url.is_some()
            && self.registry.timeout_secs > 0
            && self.heartbeat.interval_secs >= self.registry.timeout_secs
        {
            return Err(ConfigError::ValidationError(format!(
                "heartbeat interval ({}s) must be shorter than registry timeout ({}s)",
                self.heartbeat.interval_secs, self.registry.timeout_secs
            )));
        }
        Ok(())
    }

    /// Builds the codec registry the server negotiates with.
    pub fn codec_registry(&self) -> CodecRegistry {
        CodecRegistry::with_defaults().retain(&self.network.codecs)
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// RPC listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Codecs accepted from connecting clients.
    pub codecs: Vec<CodecType>,
    /// Maximum concurrently running dispatches per connection (0 = unlimited).
    pub max_inflight_requests: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], crate::DEFAULT_PORT)),
            codecs: vec![CodecType::BINARY, CodecType::JSON],
            max_inflight_requests: 0,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("TINYRPC_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        if let Ok(codecs) = std::env::var("TINYRPC_CODECS") {
            let codecs: Vec<_> = codecs
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(CodecType::new)
                .collect();
            if !codecs.is_empty() {
                self.codecs = codecs;
            }
        }

        if let Ok(max) = std::env::var("TINYRPC_MAX_INFLIGHT") {
            if let Ok(n) = max.parse() {
                self.max_inflight_requests = n;
            }
        }
    }
}

/// Embedded registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Run a registry in this process.
    pub enabled: bool,
    /// Address the registry HTTP server binds to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// URL path the registry answers on.
    pub path: String,
    /// Seconds after which a server without heartbeats is evicted (0 = never).
    pub timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 9999)),
            path: "/_gorpc_/registry".to_string(),
            timeout_secs: 300,
        }
    }
}

impl RegistryConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("TINYRPC_REGISTRY_ENABLED") {
            self.enabled = parse_bool(&enabled);
        }
        if let Ok(addr) = std::env::var("TINYRPC_REGISTRY_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }
        if let Ok(path) = std::env::var("TINYRPC_REGISTRY_PATH") {
            if !path.is_empty() {
                self.path = path;
            }
        }
        if let Ok(timeout) = std::env::var("TINYRPC_REGISTRY_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.timeout_secs = secs;
            }
        }
    }

    /// Returns the eviction timeout as Duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Registry to announce this server to. No heartbeats are sent when unset.
    pub registry_url: Option<String>,
    /// Seconds between heartbeats (0 = registry timeout minus one minute).
    pub interval_secs: u64,
}

impl HeartbeatConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("TINYRPC_REGISTRY_URL") {
            self.registry_url = (!url.is_empty()).then_some(url);
        }
        if let Ok(interval) = std::env::var("TINYRPC_HEARTBEAT_INTERVAL") {
            if let Ok(secs) = interval.parse() {
                self.interval_secs = secs;
            }
        }
    }

    /// Returns the heartbeat interval as Duration.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
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
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("TINYRPC_METRICS_ENABLED") {
            self.enabled = parse_bool(&enabled);
        }
        if let Ok(addr) = std::env::var("TINYRPC_METRICS_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }
    }
}

fn parse_bool(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// SocketAddr as a plain string in YAML.
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
        assert_eq!(config.network.bind_addr.port(), crate::DEFAULT_PORT);
        assert_eq!(
            config.network.codecs,
            vec![CodecType::BINARY, CodecType::JSON]
        );
        assert_eq!(config.codec_registry().codec_types().len(), 2);
        assert_eq!(config.network.max_inflight_requests, 0);
        assert_eq!(config.registry.path, "/_gorpc_/registry");
        assert_eq!(config.registry.timeout(), Duration::from_secs(300));
        assert!(config.heartbeat.registry_url.is_none());
        assert!(!config.metrics.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.network.bind_addr, config.network.bind_addr);
        assert_eq!(parsed.network.codecs, config.network.codecs);
        assert_eq!(parsed.registry.path, config.registry.path);
    }

    #[test]
    fn test_from_file_partial_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "network:\n  bind_addr: \"0.0.0.0:8000\"\n  codecs: [application/json]\n\
             heartbeat:\n  registry_url: http://127.0.0.1:9999/_gorpc_/registry\n  interval_secs: 30\n"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.network.bind_addr.port(), 8000);
        assert_eq!(config.network.codecs, vec![CodecType::JSON]);
        assert_eq!(config.codec_registry().codec_types(), vec![CodecType::JSON]);
        assert_eq!(config.heartbeat.interval(), Duration::from_secs(30));
        assert_eq!(
            config.heartbeat.registry_url.as_deref(),
            Some("http://127.0.0.1:9999/_gorpc_/registry")
        );
        // Unspecified sections keep their defaults.
        assert_eq!(config.registry.timeout_secs, 300);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.yaml");
        assert!(matches!(
            Config::from_file(&missing),
            Err(ConfigError::IoError(..))
        ));

        let bad = dir.path().join("bad.yaml");
        std::fs::write(&bad, "network:\n  bind_addr: not-an-address\n").unwrap();
        let err = Config::from_file(&bad).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(..)));
        assert!(err.to_string().contains("bad.yaml"));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tinyrpc.yaml");

        let mut config = Config::default();
        config.registry.enabled = true;
        config.network.max_inflight_requests = 16;
        config.save(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert!(loaded.registry.enabled);
        assert_eq!(loaded.network.max_inflight_requests, 16);
    }

    #[test]
    fn test_validate_rejects_slow_heartbeat() {
        let mut config = Config::default();
        config.heartbeat.registry_url = Some("http://127.0.0.1:9999/_gorpc_/registry".into());
        config.heartbeat.interval_secs = 600;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        config.heartbeat.interval_secs = 0;
        assert!(config.validate().is_ok());

        config.registry.path = "no-slash".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_codec() {
        let mut config = Config::default();
        config.network.codecs = vec![CodecType::JSON, CodecType::new("application/gob")];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(ref msg)) if msg.contains("application/gob")
        ));

        config.network.codecs.clear();
        assert!(config.validate().is_err());

        config.network.codecs = vec![CodecType::JSON];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        // No other test reads these variables.
        std::env::set_var("TINYRPC_MAX_INFLIGHT", "4");
        std::env::set_var("TINYRPC_CODECS", "application/json, ");
        std::env::set_var("TINYRPC_REGISTRY_ENABLED", "true");
        std::env::set_var("TINYRPC_REGISTRY_TIMEOUT", "120");
        std::env::set_var("TINYRPC_HEARTBEAT_INTERVAL", "60");
        std::env::set_var("TINYRPC_METRICS_BIND", "127.0.0.1:9191");

        let config = Config::from_env();

        std::env::remove_var("TINYRPC_MAX_INFLIGHT");
        std::env::remove_var("TINYRPC_CODECS");
        std::env::remove_var("TINYRPC_REGISTRY_ENABLED");
        std::env::remove_var("TINYRPC_REGISTRY_TIMEOUT");
        std::env::remove_var("TINYRPC_HEARTBEAT_INTERVAL");
        std::env::remove_var("TINYRPC_METRICS_BIND");

        assert_eq!(config.network.max_inflight_requests, 4);
        assert_eq!(config.network.codecs, vec![CodecType::JSON]);
        assert!(config.registry.enabled);
        assert_eq!(config.registry.timeout_secs, 120);
        assert_eq!(config.heartbeat.interval_secs, 60);
        assert_eq!(config.metrics.bind_addr.port(), 9191);
    }
}
