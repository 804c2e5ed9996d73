//! Server, client and storage configuration.
//!
//! Every struct deserializes from TOML with per-field defaults, so a config
//! file only needs to name what it overrides:
//!
//! ```toml
//! bind_addr = "0.0.0.0:9090"
//! working_dir = "/var/lib/concert/sessions"
//!
//! [log]
//! segment_size = 1000
//!
//! [roles.Review]
//! auto_archive = true
//! flags = { packages = false }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::{EventKind, SequenceNumber, SessionEvent, SessionFlags};

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Event log storage settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Records per segment file
    pub segment_size: u64,
    /// fsync after every append
    pub sync_writes: bool,
    /// Record bodies larger than this are LZ4 compressed
    pub compress_threshold: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            segment_size: 500,
            sync_writes: true,
            compress_threshold: 1024,
        }
    }
}

impl LogConfig {
    /// Small segments, no fsync.
    pub fn for_testing() -> Self {
        Self {
            segment_size: 4,
            sync_writes: false,
            compress_threshold: 64,
        }
    }
}

/// Selects which events are copied into an archive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveFilter {
    /// Inclusive lower bound (0 = from the start)
    pub lower_bound: SequenceNumber,
    /// Inclusive upper bound
    pub upper_bound: Option<SequenceNumber>,
    /// Sequence numbers to leave out
    pub exclude: Vec<SequenceNumber>,
    /// Only keep these kinds (None = all kinds)
    pub kinds: Option<Vec<EventKind>>,
}

impl ArchiveFilter {
    /// Whether this filter passes every event.
    pub fn is_all(&self) -> bool {
        self.lower_bound <= 1
            && self.upper_bound.is_none()
            && self.exclude.is_empty()
            && self.kinds.is_none()
    }

    pub fn matches(&self, event: &SessionEvent) -> bool {
        if event.sequence < self.lower_bound {
            return false;
        }
        if self.upper_bound.is_some_and(|upper| event.sequence > upper) {
            return false;
        }
        if self.exclude.contains(&event.sequence) {
            return false;
        }
        match &self.kinds {
            Some(kinds) => kinds.contains(&event.kind),
            None => true,
        }
    }
}

/// Per-role server policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RolePolicy {
    pub flags: SessionFlags,
    /// Archive the session before deleting it on shutdown
    pub auto_archive: bool,
    pub archive_filter: ArchiveFilter,
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds to
    pub bind_addr: String,
    /// Live session directories
    pub working_dir: PathBuf,
    /// Archived session directories
    pub archive_dir: PathBuf,
    /// Content-addressed blob store for the file sharing side-channel
    pub blob_dir: PathBuf,
    /// Expected client heartbeat cadence
    pub heartbeat_interval_secs: u64,
    /// Endpoints silent for this many intervals are marked disconnected
    pub heartbeat_timeout_multiplier: u32,
    /// How long a disconnected registration is kept for fast rejoin
    /// (None = heartbeat timeout)
    pub disconnect_grace_secs: Option<u64>,
    pub log: LogConfig,
    /// Policy for roles not listed in `roles`
    pub default_role: RolePolicy,
    pub roles: HashMap<String, RolePolicy>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            working_dir: PathBuf::from("concert_data/sessions"),
            archive_dir: PathBuf::from("concert_data/archives"),
            blob_dir: PathBuf::from("concert_data/blobs"),
            heartbeat_interval_secs: 5,
            heartbeat_timeout_multiplier: 3,
            disconnect_grace_secs: None,
            log: LogConfig::default(),
            default_role: RolePolicy::default(),
            roles: HashMap::new(),
        }
    }
}

impl ServerConfig {
    /// All directories under `root`, test-sized log settings.
    pub fn for_testing(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            working_dir: root.join("sessions"),
            archive_dir: root.join("archives"),
            blob_dir: root.join("blobs"),
            heartbeat_interval_secs: 1,
            log: LogConfig::for_testing(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.log.segment_size == 0 {
            return Err(ConfigError::Invalid("log.segment_size must be > 0".into()));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid("heartbeat_interval_secs must be > 0".into()));
        }
        if self.heartbeat_timeout_multiplier == 0 {
            return Err(ConfigError::Invalid("heartbeat_timeout_multiplier must be > 0".into()));
        }
        Ok(())
    }

    /// Policy for a role, falling back to `default_role`.
    pub fn role_policy(&self, role: &str) -> &RolePolicy {
        self.roles.get(role).unwrap_or(&self.default_role)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Silence after which a connected endpoint is considered stale.
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval() * self.heartbeat_timeout_multiplier
    }

    pub fn disconnect_grace(&self) -> Duration {
        self.disconnect_grace_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.heartbeat_timeout())
    }
}

/// Client session proxy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// WebSocket URL of the session server
    pub server_url: String,
    pub session_id: Uuid,
    /// Stable across reconnects so the server can revive the registration
    pub endpoint_id: Uuid,
    pub display_name: String,
    pub role: String,
    /// Where `{session_id, last_applied}` is persisted between runs
    pub checkpoint_path: Option<PathBuf>,
    pub heartbeat_interval_ms: u64,
    pub reconnect_backoff_min_ms: u64,
    pub reconnect_backoff_max_ms: u64,
    /// Payloads larger than this go through the file sharing side-channel
    pub inline_payload_limit: usize,
    /// Local changes held while not synchronized
    pub offline_queue_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            session_id: Uuid::nil(),
            endpoint_id: Uuid::new_v4(),
            display_name: "Anonymous".to_string(),
            role: String::new(),
            checkpoint_path: None,
            heartbeat_interval_ms: 5_000,
            reconnect_backoff_min_ms: 250,
            reconnect_backoff_max_ms: 10_000,
            inline_payload_limit: 256 * 1024,
            offline_queue_capacity: 10_000,
        }
    }
}

impl ClientConfig {
    pub fn new(session_id: Uuid, display_name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            session_id,
            display_name: display_name.into(),
            role: role.into(),
            ..Self::default()
        }
    }

    /// Fast heartbeats and reconnects.
    pub fn for_testing(session_id: Uuid, display_name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            heartbeat_interval_ms: 100,
            reconnect_backoff_min_ms: 10,
            reconnect_backoff_max_ms: 100,
            inline_payload_limit: 1024,
            ..Self::new(session_id, display_name, role)
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Backoff before reconnect attempt `attempt` (0-based), doubling up to the max.
    pub fn reconnect_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(20)).unwrap_or(u64::MAX);
        let ms = self
            .reconnect_backoff_min_ms
            .saturating_mul(factor)
            .min(self.reconnect_backoff_max_ms);
        Duration::from_millis(ms)
    }
}
