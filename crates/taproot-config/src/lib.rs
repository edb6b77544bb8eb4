//! # Taproot Configuration
//!
//! Startup configuration for the resolver, loadable from YAML, JSON, or
//! TOML (chosen by file extension). Every field has a sensible default;
//! an empty file is a valid configuration.
//!
//! The configuration is immutable once the process is up: it is built
//! here, validated, and passed by reference into the components. There
//! is no runtime re-tuning.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration error.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("file not found: {0}")]
    NotFound(PathBuf),
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener configuration.
    pub server: ServerConfig,

    /// Recursive resolution configuration.
    pub resolver: ResolverConfig,

    /// Message cache configuration.
    pub cache: CacheConfig,

    /// DNSSEC validation configuration.
    pub dnssec: DnssecConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            resolver: ResolverConfig::default(),
            cache: CacheConfig::default(),
            dnssec: DnssecConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from a file, picking the parser by extension.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path)?;

        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            Some("toml") => toml::from_str(&content)?,
            _ => serde_yaml::from_str(&content)?,
        };

        Ok(config)
    }

    /// Loads configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.resolver.max_queries_per_request == 0 {
            return Err(ConfigError::Validation(
                "resolver.max_queries_per_request must be at least 1".to_string(),
            ));
        }
        if self.resolver.desired_nameservers_per_zone == 0 {
            return Err(ConfigError::Validation(
                "resolver.desired_nameservers_per_zone must be at least 1".to_string(),
            ));
        }
        if self.cache.size == 0 {
            return Err(ConfigError::Validation(
                "cache.size must be at least 1".to_string(),
            ));
        }
        if self.cache.max_allowed_ttl_secs == 0 {
            return Err(ConfigError::Validation(
                "cache.max_allowed_ttl_secs must be at least 1".to_string(),
            ));
        }

        for anchor in &self.dnssec.trust_anchors {
            if anchor.digest.is_empty() || anchor.digest.len() % 2 != 0 {
                return Err(ConfigError::Validation(format!(
                    "trust anchor {} has a malformed digest",
                    anchor.key_tag
                )));
            }
        }

        Ok(())
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the UDP and TCP listeners bind to.
    pub listen: SocketAddr,

    /// Idle timeout for TCP connections, in seconds.
    pub tcp_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 5355),
            tcp_idle_timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    /// The TCP idle timeout as a [`Duration`].
    pub fn tcp_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.tcp_idle_timeout_secs)
    }
}

/// Recursive resolution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Delegation walker query budget per client request.
    pub max_queries_per_request: u32,

    /// Maximum servers queried per zone.
    pub desired_nameservers_per_zone: usize,

    /// Defer glue resolution until the first address suffices.
    pub lazy_enrichment: bool,

    /// Whole-request timeout in milliseconds.
    pub request_timeout_ms: u64,

    /// Drop the authority section from positive answers.
    pub remove_authority_section_for_positive_answers: bool,

    /// Drop the additional section from positive answers.
    pub remove_additional_section_for_positive_answers: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_queries_per_request: 50,
            desired_nameservers_per_zone: 5,
            lazy_enrichment: true,
            request_timeout_ms: 2_000,
            remove_authority_section_for_positive_answers: true,
            remove_additional_section_for_positive_answers: true,
        }
    }
}

impl ResolverConfig {
    /// The request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Message cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Total entry cap across all shards.
    pub size: usize,

    /// Hard ceiling on any cached TTL, in seconds.
    pub max_allowed_ttl_secs: u32,

    /// TTL for negative entries, in seconds.
    pub negative_ttl_secs: u32,

    /// Cleaner sweep interval, in seconds.
    pub cleaner_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            size: 100_000,
            max_allowed_ttl_secs: 172_800,
            negative_ttl_secs: 300,
            cleaner_interval_secs: 30,
        }
    }
}

/// DNSSEC validation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DnssecConfig {
    /// Run the authenticator pipeline for DO-bit queries.
    pub enabled: bool,

    /// Demand every RRSIG on an RRset verifies instead of any one.
    pub require_all_signatures_valid: bool,

    /// Strip unsigned authority/additional sections from Bogus answers.
    pub suppress_bogus_response_sections: bool,

    /// Root-zone DS trust anchors. Empty means the built-in ICANN KSKs.
    pub trust_anchors: Vec<TrustAnchorConfig>,
}

impl Default for DnssecConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            require_all_signatures_valid: false,
            suppress_bogus_response_sections: true,
            trust_anchors: Vec::new(),
        }
    }
}

/// One configured DS-format trust anchor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustAnchorConfig {
    /// DNSKEY key tag.
    pub key_tag: u16,

    /// DNSSEC algorithm number.
    pub algorithm: u8,

    /// DS digest type (2 = SHA-256, 4 = SHA-384).
    pub digest_type: u8,

    /// Hex-encoded digest.
    pub digest: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    pub level: String,

    /// Log format: text or json.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.listen.port(), 5355);
        assert_eq!(config.resolver.max_queries_per_request, 50);
        assert_eq!(config.cache.size, 100_000);
        assert!(!config.dnssec.enabled);
    }

    #[test]
    fn empty_yaml_is_the_default_config() {
        let config = Config::from_yaml("{}").unwrap();
        assert_eq!(config.cache.max_allowed_ttl_secs, 172_800);
        assert!(config.resolver.lazy_enrichment);
    }

    #[test]
    fn yaml_overrides_selected_fields() {
        let yaml = r#"
server:
  listen: "127.0.0.1:53"
resolver:
  max_queries_per_request: 25
dnssec:
  enabled: true
  trust_anchors:
    - key_tag: 20326
      algorithm: 8
      digest_type: 2
      digest: "E06D44B80B8F1D39A95C0B0D7C65D08458E880409BBC683457104237C7F8EC8D"
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.listen.port(), 53);
        assert_eq!(config.resolver.max_queries_per_request, 25);
        assert!(config.dnssec.enabled);
        assert_eq!(config.dnssec.trust_anchors.len(), 1);
        // Untouched sections keep their defaults.
        assert_eq!(config.cache.size, 100_000);
    }

    #[test]
    fn zero_budget_fails_validation() {
        let config = Config::from_yaml("resolver:\n  max_queries_per_request: 0\n").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn odd_length_anchor_digest_fails_validation() {
        let yaml = r#"
dnssec:
  trust_anchors:
    - key_tag: 1
      algorithm: 8
      digest_type: 2
      digest: "ABC"
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn missing_file_is_reported() {
        let err = Config::from_file("/nonexistent/taproot.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }
}
