//! Layered node configuration: defaults, then a TOML file, then `MEDISYNC_*`
//! environment variables.
//!
//! ```toml
//! [node]
//! peer_id = "ward3-tablet"
//! listen_addr = "0.0.0.0:9470"
//! documents = ["patient:1042", "patient:1043"]
//! peers = [{ id = "clinic-laptop", url = "ws://10.0.0.5:9470" }]
//!
//! [transport]
//! chunk_size = 65536
//! max_attempts = 20
//!
//! [backend]
//! base_url = "https://clinic.example.org/api"
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tokio::time::Duration;

use crate::bridge::BridgeConfig;
use crate::chunk::DEFAULT_CHUNK_SIZE;
use crate::http::HttpConfig;
use crate::storage::StoreConfig;
use crate::transport::{RetryPolicy, TransportConfig};

const ENV_PREFIX: &str = "MEDISYNC_";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub node: NodeSection,
    pub storage: StorageSection,
    pub transport: TransportSection,
    pub backend: BackendSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerEndpoint {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeSection {
    /// Id announced to peers
    pub peer_id: String,
    pub listen_addr: String,
    /// Document rooms this node serves
    pub documents: Vec<String>,
    /// Peers to dial on startup
    pub peers: Vec<PeerEndpoint>,
    pub pull_on_connect: bool,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            peer_id: "medisync-node".to_string(),
            listen_addr: "0.0.0.0:9470".to_string(),
            documents: Vec::new(),
            peers: Vec::new(),
            pull_on_connect: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageSection {
    pub path: PathBuf,
    pub sync_writes: bool,
    pub block_cache_mb: usize,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("medisync_data"),
            sync_writes: true,
            block_cache_mb: 32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportSection {
    pub chunk_size: usize,
    pub ack_timeout_secs: u64,
    pub reassembly_timeout_secs: u64,
    pub backoff_factor: f64,
    pub max_retry_interval_secs: u64,
    /// Resends before a delivery fails; unset retries forever
    pub max_attempts: Option<u32>,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            ack_timeout_secs: 15,
            reassembly_timeout_secs: 60,
            backoff_factor: 1.0,
            max_retry_interval_secs: 300,
            max_attempts: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendSection {
    /// No URL, no server sync
    pub base_url: Option<String>,
    pub token: Option<String>,
    pub sync_interval_secs: u64,
    pub batch_size: usize,
    pub request_timeout_secs: u64,
    pub offline_capacity: usize,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            base_url: None,
            token: None,
            sync_interval_secs: 30,
            batch_size: 100,
            request_timeout_secs: 30,
            offline_capacity: crate::offline::DEFAULT_CAPACITY,
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {key}: {value:?}")]
    InvalidEnv { key: String, value: String },
}

impl SyncConfig {
    /// Defaults, overlaid by `path` (if given) and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml_str(&text)?
            }
            None => Self::default(),
        };
        config.apply_env(std::env::vars())?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `MEDISYNC_*` overrides. Unknown keys are ignored.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "PEER_ID" => self.node.peer_id = value,
                "LISTEN_ADDR" => self.node.listen_addr = value,
                "DOCUMENTS" => {
                    self.node.documents = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                }
                "PULL_ON_CONNECT" => self.node.pull_on_connect = parse(&key, &value)?,
                "DATA_DIR" => self.storage.path = PathBuf::from(value),
                "SYNC_WRITES" => self.storage.sync_writes = parse(&key, &value)?,
                "CHUNK_SIZE" => self.transport.chunk_size = parse(&key, &value)?,
                "ACK_TIMEOUT_SECS" => self.transport.ack_timeout_secs = parse(&key, &value)?,
                "MAX_ATTEMPTS" => self.transport.max_attempts = Some(parse(&key, &value)?),
                "BACKEND_URL" => self.backend.base_url = Some(value),
                "BACKEND_TOKEN" => self.backend.token = Some(value),
                "SYNC_INTERVAL_SECS" => self.backend.sync_interval_secs = parse(&key, &value)?,
                _ => {}
            }
        }
        Ok(())
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            path: self.storage.path.clone(),
            block_cache_size: self.storage.block_cache_mb * 1024 * 1024,
            sync_writes: self.storage.sync_writes,
            ..StoreConfig::default()
        }
    }

    pub fn transport_config(&self) -> TransportConfig {
        let t = &self.transport;
        TransportConfig {
            chunk_size: t.chunk_size,
            ack_timeout: Duration::from_secs(t.ack_timeout_secs.max(1)),
            reassembly_timeout: Duration::from_secs(t.reassembly_timeout_secs.max(1)),
            retry: RetryPolicy {
                backoff_factor: t.backoff_factor,
                max_interval: Duration::from_secs(t.max_retry_interval_secs.max(1)),
                max_attempts: t.max_attempts,
            },
            pull_on_connect: self.node.pull_on_connect,
        }
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            interval: Duration::from_secs(self.backend.sync_interval_secs.max(1)),
            batch_size: self.backend.batch_size,
        }
    }

    /// `None` when no backend is configured.
    pub fn http_config(&self) -> Option<HttpConfig> {
        let base_url = self.backend.base_url.clone()?;
        Some(HttpConfig {
            token: self.backend.token.clone(),
            request_timeout: Duration::from_secs(self.backend.request_timeout_secs.max(1)),
            ..HttpConfig::new(base_url)
        })
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        let transport = config.transport_config();
        assert_eq!(transport.chunk_size, 16 * 1024);
        assert_eq!(transport.ack_timeout, Duration::from_secs(15));
        assert_eq!(transport.reassembly_timeout, Duration::from_secs(60));
        assert_eq!(transport.retry.max_attempts, None);
        assert!(config.http_config().is_none());
        assert!(config.store_config().sync_writes);
    }

    #[test]
    fn test_toml_overrides_sections() {
        let config = SyncConfig::from_toml_str(
            r#"
            [node]
            peer_id = "ward3-tablet"
            documents = ["patient:1", "patient:2"]
            peers = [{ id = "laptop", url = "ws://10.0.0.5:9470" }]

            [transport]
            chunk_size = 65536
            max_attempts = 5

            [backend]
            base_url = "https://clinic.example.org/api"
            token = "t0k"
            "#,
        )
        .unwrap();

        assert_eq!(config.node.peer_id, "ward3-tablet");
        assert_eq!(config.node.documents.len(), 2);
        assert_eq!(config.node.peers[0].id, "laptop");
        assert_eq!(config.transport_config().chunk_size, 65_536);
        assert_eq!(config.transport_config().retry.max_attempts, Some(5));
        // Untouched keys keep their defaults.
        assert_eq!(config.transport.ack_timeout_secs, 15);
        let http = config.http_config().unwrap();
        assert_eq!(http.token.as_deref(), Some("t0k"));
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(SyncConfig::from_toml_str("[node]\npeerid = \"x\"").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = SyncConfig::default();
        config
            .apply_env(env(&[
                ("MEDISYNC_PEER_ID", "kiosk"),
                ("MEDISYNC_DOCUMENTS", "a, b,,c"),
                ("MEDISYNC_ACK_TIMEOUT_SECS", "5"),
                ("MEDISYNC_BACKEND_URL", "http://localhost:8080/api"),
                ("HOME", "/root"),
            ]))
            .unwrap();

        assert_eq!(config.node.peer_id, "kiosk");
        assert_eq!(config.node.documents, vec!["a", "b", "c"]);
        assert_eq!(config.transport_config().ack_timeout, Duration::from_secs(5));
        assert!(config.http_config().is_some());
    }

    #[test]
    fn test_env_rejects_bad_numbers() {
        let mut config = SyncConfig::default();
        let err = config
            .apply_env(env(&[("MEDISYNC_CHUNK_SIZE", "big")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }

    #[test]
    fn test_missing_file() {
        let err = SyncConfig::load(Some(Path::new("/nonexistent/medisync.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
