//! Configuration for clinic-records

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::services::{RedemptionPolicy, ServiceOptions};

/// Default data directory
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("clinic-records")
}

/// Configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the SQLite database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// HTTP API port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Address the HTTP API binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Public origin used in portal links sent to patients
    #[serde(default = "default_portal_base_url")]
    pub portal_base_url: String,

    /// Whether a token stays redeemable after consent
    #[serde(default)]
    pub redemption_policy: RedemptionPolicy,

    /// Capacity of the in-process event bus
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_http_port() -> u16 {
    8090
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_portal_base_url() -> String {
    "http://localhost:8090".to_string()
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            http_port: default_http_port(),
            bind_address: default_bind_address(),
            portal_base_url: default_portal_base_url(),
            redemption_policy: RedemptionPolicy::default(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }

    /// Get database path
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(crate::db::DB_FILE)
    }

    pub fn service_options(&self) -> ServiceOptions {
        ServiceOptions {
            redemption_policy: self.redemption_policy,
            portal_base_url: self.portal_base_url.clone(),
            event_capacity: self.event_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_use_defaults() {
        let config: Config = toml::from_str("http_port = 9000\nredemption_policy = \"permissive\"").unwrap();
        assert_eq!(config.http_port, 9000);
        assert_eq!(config.redemption_policy, RedemptionPolicy::Permissive);
        assert_eq!(config.portal_base_url, default_portal_base_url());
        assert_eq!(config.event_capacity, 1024);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        config.save(config.config_path()).unwrap();
        assert_eq!(Config::load(config.config_path()).unwrap(), config);
    }
}
