//! Node configuration, loaded from YAML.
//!
//! ```yaml
//! node:
//!   id: 1
//!   role: cerebrum
//! connectors:
//!   - name: events
//!     port: 4100
//! auth:
//!   shared_secret: "correct horse battery staple"
//! store:
//!   path: /var/lib/cerebrum/proofs
//! ```
//!
//! Everything but `auth.shared_secret` has a default.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    net::{NodeId, CEREBRUM_PORT, DEFAULT_MAX_PAYLOAD},
    proof::store::RetryPolicy,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    ParseYaml(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Which end of the network this node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The hub: accepts synapses and relays their events to subscribers.
    #[default]
    Cerebrum,
    /// A peer that publishes to and subscribes through a cerebrum.
    Synapse,
}

/// `node.*`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub id: NodeId,
    #[serde(default)]
    pub role: Role,
}

/// One listening (or dialing) endpoint, `connectors[]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    #[serde(default = "ConnectorConfig::default_name")]
    pub name: String,
    #[serde(default = "ConnectorConfig::default_port")]
    pub port: u16,
    #[serde(default = "ConnectorConfig::default_bind")]
    pub bind: IpAddr,
    /// Accept connections on `bind:port`.
    #[serde(default = "ConnectorConfig::default_listen")]
    pub listen: bool,
    /// A cerebrum to dial and keep a connection to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<SocketAddr>,
    /// Largest payload accepted from a peer, in bytes.
    #[serde(default = "ConnectorConfig::default_max_payload")]
    pub max_payload: usize,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            name: Self::default_name(),
            port: Self::default_port(),
            bind: Self::default_bind(),
            listen: Self::default_listen(),
            upstream: None,
            max_payload: Self::default_max_payload(),
        }
    }
}

impl ConnectorConfig {
    fn default_name() -> String {
        "default".into()
    }

    fn default_port() -> u16 {
        CEREBRUM_PORT
    }

    fn default_bind() -> IpAddr {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }

    fn default_listen() -> bool {
        true
    }

    fn default_max_payload() -> usize {
        DEFAULT_MAX_PAYLOAD
    }
}

/// `reactors.*`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReactorConfig {
    /// Number of reactor threads. Twice the available cores if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    /// Pause after an accept error before accepting again.
    #[serde(default = "ReactorConfig::default_backoff_secs")]
    pub backoff_secs: u64,
}

impl ReactorConfig {
    fn default_backoff_secs() -> u64 {
        120
    }

    pub fn count(&self) -> usize {
        self.count.unwrap_or_else(|| {
            2 * thread::available_parallelism().map_or(1, |cores| cores.get())
        })
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }
}

/// `workers.*`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "WorkerConfig::default_threads")]
    pub readers: usize,
    #[serde(default = "WorkerConfig::default_threads")]
    pub writers: usize,
    /// Jobs a pool queues before rejecting and pausing the peer.
    #[serde(default = "WorkerConfig::default_queue_capacity")]
    pub queue_capacity: usize,
    /// How often rejected jobs are retried and pressure re-evaluated.
    #[serde(default = "WorkerConfig::default_pressure_check_ms")]
    pub pressure_check_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            readers: Self::default_threads(),
            writers: Self::default_threads(),
            queue_capacity: Self::default_queue_capacity(),
            pressure_check_ms: Self::default_pressure_check_ms(),
        }
    }
}

impl WorkerConfig {
    fn default_threads() -> usize {
        4
    }

    fn default_queue_capacity() -> usize {
        1024
    }

    fn default_pressure_check_ms() -> u64 {
        250
    }

    pub fn pressure_check(&self) -> Duration {
        Duration::from_millis(self.pressure_check_ms)
    }
}

/// `delivery.*`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Unacknowledged messages older than this are sent again.
    #[serde(default = "DeliveryConfig::default_redelivery_secs")]
    pub redelivery_secs: u64,
    /// How long a completed authentication proof is kept.
    #[serde(default = "DeliveryConfig::default_auth_grace_secs")]
    pub auth_grace_secs: u64,
    /// Delay before redialing a lost upstream.
    #[serde(default = "DeliveryConfig::default_reconnect_secs")]
    pub reconnect_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            redelivery_secs: Self::default_redelivery_secs(),
            auth_grace_secs: Self::default_auth_grace_secs(),
            reconnect_secs: Self::default_reconnect_secs(),
        }
    }
}

impl DeliveryConfig {
    fn default_redelivery_secs() -> u64 {
        30
    }

    fn default_auth_grace_secs() -> u64 {
        5
    }

    fn default_reconnect_secs() -> u64 {
        5
    }

    pub fn redelivery(&self) -> Duration {
        Duration::from_secs(self.redelivery_secs)
    }

    pub fn auth_grace(&self) -> Duration {
        Duration::from_secs(self.auth_grace_secs)
    }

    pub fn reconnect(&self) -> Duration {
        Duration::from_secs(self.reconnect_secs)
    }
}

/// `store.*`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory for proof documents. Proofs are kept in memory if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default = "StoreConfig::default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "StoreConfig::default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            retry_attempts: Self::default_retry_attempts(),
            retry_backoff_ms: Self::default_retry_backoff_ms(),
        }
    }
}

impl StoreConfig {
    fn default_retry_attempts() -> u32 {
        3
    }

    fn default_retry_backoff_ms() -> u64 {
        50
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry_attempts,
            backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

/// `auth.*`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Secret shared by the cerebrum and its synapses. Credentials are a MAC
    /// over the cerebrum's challenge keyed with a key derived from it.
    #[serde(default)]
    pub shared_secret: String,
}

impl AuthConfig {
    pub fn credential_key(&self) -> Option<[u8; 32]> {
        if self.shared_secret.is_empty() {
            return None;
        }
        Some(blake3::derive_key(
            "cerebrum 2023-10-01 synapse credentials",
            self.shared_secret.as_bytes(),
        ))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub connectors: Vec<ConnectorConfig>,
    #[serde(default)]
    pub reactors: ReactorConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl Config {
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reactors.count == Some(0) {
            return Err(ConfigError::Invalid("reactors.count must be at least 1".into()));
        }
        if self.workers.readers == 0 || self.workers.writers == 0 {
            return Err(ConfigError::Invalid("worker pools need at least one thread".into()));
        }
        if self.workers.queue_capacity == 0 {
            return Err(ConfigError::Invalid("workers.queue_capacity must be at least 1".into()));
        }
        let mut ports: Vec<_> = self.connectors.iter().map(|c| c.port).collect();
        ports.sort_unstable();
        if ports.windows(2).any(|w| w[0] == w[1]) {
            return Err(ConfigError::Invalid("connector ports must be unique".into()));
        }
        if self.auth.shared_secret.is_empty() {
            return Err(ConfigError::Invalid("auth.shared_secret is required".into()));
        }
        Ok(())
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}
