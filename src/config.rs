//! Environment-driven configuration.
//!
//! Every variable is optional. A variable that is set but does not parse is a
//! startup error rather than a silent fallback to the default.

use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::storage::StorageConfig;
use crate::sync::admission::AdmissionConfig;
use crate::sync::SyncServerConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name}={value:?} is not a valid {expected}")]
    Invalid {
        name: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// Which document store backs the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Sled,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sled" => Ok(StorageBackend::Sled),
            "memory" => Ok(StorageBackend::Memory),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub storage_backend: StorageBackend,
    pub storage: StorageConfig,
    pub admission: AdmissionConfig,
    pub sync: SyncServerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 5000,
            storage_backend: StorageBackend::Sled,
            storage: StorageConfig::default(),
            admission: AdmissionConfig::default(),
            sync: SyncServerConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(port) = parse(&lookup, "PORT", "port number")? {
            config.port = port;
        }
        if let Some(path) = lookup("STORAGE_PATH") {
            config.storage.path = path;
        }
        if let Some(backend) = parse(&lookup, "STORAGE_BACKEND", "storage backend (sled|memory)")? {
            config.storage_backend = backend;
        }
        if let Some(max) = parse(&lookup, "ADMISSION_MAX_CONNECTIONS", "connection count")? {
            config.admission.max_connections = max;
        }
        if let Some(secs) = parse(&lookup, "ADMISSION_WINDOW_SECS", "number of seconds")? {
            config.admission.window = Duration::from_secs(secs);
        }
        if let Some(ms) = parse(&lookup, "PERSIST_DEBOUNCE_MS", "number of milliseconds")? {
            config.sync.persist_debounce = Duration::from_millis(ms);
        }
        if let Some(secs) = parse(&lookup, "INACTIVITY_TIMEOUT_SECS", "number of seconds")? {
            config.sync.sweeper.inactivity_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64, _>(&lookup, "SWEEP_INTERVAL_SECS", "number of seconds")? {
            // tokio intervals panic on a zero period
            config.sync.sweeper.interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parse(&lookup, "SHUTDOWN_GRACE_SECS", "number of seconds")? {
            config.sync.shutdown_grace = Duration::from_secs(secs);
        }
        if let Some(max) = parse(&lookup, "MAX_CONNECTIONS_PER_DOCUMENT", "connection count")? {
            config.sync.max_connections_per_document = max;
        }

        Ok(config)
    }
}

fn parse<T, F>(lookup: &F, name: &'static str, expected: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                name,
                value,
                expected,
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = from_pairs(&[]).unwrap();

        assert_eq!(config.port, 5000);
        assert_eq!(config.storage_backend, StorageBackend::Sled);
        assert_eq!(config.storage.path, "./data/collab.sled");
        assert_eq!(config.admission.max_connections, 30);
        assert_eq!(config.admission.window, Duration::from_secs(60));
        assert_eq!(config.sync.persist_debounce, Duration::from_millis(2000));
        assert_eq!(config.sync.sweeper.inactivity_timeout, Duration::from_secs(300));
        assert_eq!(config.sync.sweeper.interval, Duration::from_secs(60));
        assert_eq!(config.sync.shutdown_grace, Duration::from_secs(10));
        assert_eq!(config.sync.max_connections_per_document, 50);
    }

    #[test]
    fn test_overrides() {
        let config = from_pairs(&[
            ("PORT", "8080"),
            ("STORAGE_PATH", "/var/lib/collab"),
            ("STORAGE_BACKEND", "Memory"),
            ("ADMISSION_MAX_CONNECTIONS", "5"),
            ("ADMISSION_WINDOW_SECS", "10"),
            ("PERSIST_DEBOUNCE_MS", "250"),
            ("INACTIVITY_TIMEOUT_SECS", "30"),
            ("SWEEP_INTERVAL_SECS", "0"),
            ("SHUTDOWN_GRACE_SECS", "3"),
            ("MAX_CONNECTIONS_PER_DOCUMENT", "2"),
        ])
        .unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.storage.path, "/var/lib/collab");
        assert_eq!(config.storage_backend, StorageBackend::Memory);
        assert_eq!(config.admission.max_connections, 5);
        assert_eq!(config.admission.window, Duration::from_secs(10));
        assert_eq!(config.sync.persist_debounce, Duration::from_millis(250));
        assert_eq!(config.sync.sweeper.inactivity_timeout, Duration::from_secs(30));
        assert_eq!(config.sync.sweeper.interval, Duration::from_secs(1));
        assert_eq!(config.sync.shutdown_grace, Duration::from_secs(3));
        assert_eq!(config.sync.max_connections_per_document, 2);
    }

    #[test]
    fn test_invalid_values_are_errors() {
        let err = from_pairs(&[("PERSIST_DEBOUNCE_MS", "soon")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "PERSIST_DEBOUNCE_MS", .. }));

        assert!(from_pairs(&[("PORT", "70000")]).is_err());
        assert!(from_pairs(&[("STORAGE_BACKEND", "postgres")]).is_err());
    }
}
