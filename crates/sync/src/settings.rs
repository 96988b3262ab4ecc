//! Queue settings
//!
//! Typed per-queue configuration with defaults, per-name overrides and
//! environment loading.
//!
//! Environment variables:
//! - `QUEUE_NAMES`: comma separated queue names with their own overrides
//! - `QUEUE_DEFAULT_<FIELD>`: default for every queue
//! - `QUEUE_<NAME>_<FIELD>`: override for one queue
//!
//! Fields: `TYPE`, `LENGTH`, `BATCH_LENGTH`, `BOOST_WORKERS`, `MAX_WORKERS`,
//! `WORKERS`, `BLOCK_TIMEOUT_MS`, `BOOST_TIMEOUT_MS`.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::worker::WorkerPoolConfig;

/// Settings for one named queue
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueueSettings {
    /// Backend type tag (empty means the default `channel` backend)
    #[serde(rename = "type")]
    pub queue_type: String,

    /// Queue name used for registration and logging
    pub name: String,

    /// Capacity of the task buffer
    pub length: usize,

    /// Maximum items handed to one handler call
    pub batch_length: usize,

    /// Workers added per boost
    pub boost_workers: usize,

    /// Worker cap; negative means unbounded
    pub max_workers: i64,

    /// Base workers started by `run`
    pub workers: usize,

    /// Time the buffer may stay full before a boost is considered
    #[serde(with = "duration_millis")]
    pub block_timeout: Duration,

    /// Lifetime of a boost
    #[serde(with = "duration_millis")]
    pub boost_timeout: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            queue_type: "channel".to_string(),
            name: "default".to_string(),
            length: 20,
            batch_length: 20,
            boost_workers: 5,
            max_workers: 10,
            workers: 1,
            block_timeout: Duration::from_secs(1),
            boost_timeout: Duration::from_secs(3 * 60),
        }
    }
}

impl QueueSettings {
    /// Create settings with defaults for the given queue name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the buffer length
    pub fn with_length(mut self, length: usize) -> Self {
        self.length = length;
        self
    }

    /// Set the batch length
    pub fn with_batch_length(mut self, batch_length: usize) -> Self {
        self.batch_length = batch_length;
        self
    }

    /// Set the number of base workers
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the worker cap (negative = unbounded)
    pub fn with_max_workers(mut self, max_workers: i64) -> Self {
        self.max_workers = max_workers;
        self
    }

    /// Set boost parameters
    pub fn with_boost(mut self, boost_workers: usize, block: Duration, boost: Duration) -> Self {
        self.boost_workers = boost_workers;
        self.block_timeout = block;
        self.boost_timeout = boost;
        self
    }

    /// Set the backend type tag
    pub fn with_type(mut self, queue_type: impl Into<String>) -> Self {
        self.queue_type = queue_type.into();
        self
    }

    /// Worker cap as an optional limit
    pub fn max_workers_limit(&self) -> Option<usize> {
        usize::try_from(self.max_workers).ok()
    }

    /// Pool configuration derived from these settings
    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            queue_length: self.length,
            batch_length: self.batch_length.max(1),
            block_timeout: self.block_timeout,
            boost_timeout: self.boost_timeout,
            boost_workers: self.boost_workers,
            max_workers: self.max_workers_limit(),
        }
    }

    /// Apply `QUEUE_<PREFIX>_<FIELD>` variables found through `lookup`
    fn apply_env<F>(&mut self, prefix: &str, lookup: &F) -> Result<(), SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |field: &str| lookup(&format!("QUEUE_{}_{}", prefix, field));

        if let Some(v) = var("TYPE") {
            self.queue_type = v;
        }
        if let Some(v) = var("LENGTH") {
            self.length = parse_var(prefix, "LENGTH", &v)?;
        }
        if let Some(v) = var("BATCH_LENGTH") {
            self.batch_length = parse_var(prefix, "BATCH_LENGTH", &v)?;
        }
        if let Some(v) = var("BOOST_WORKERS") {
            self.boost_workers = parse_var(prefix, "BOOST_WORKERS", &v)?;
        }
        if let Some(v) = var("MAX_WORKERS") {
            self.max_workers = parse_var(prefix, "MAX_WORKERS", &v)?;
        }
        if let Some(v) = var("WORKERS") {
            self.workers = parse_var(prefix, "WORKERS", &v)?;
        }
        if let Some(v) = var("BLOCK_TIMEOUT_MS") {
            self.block_timeout = Duration::from_millis(parse_var(prefix, "BLOCK_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = var("BOOST_TIMEOUT_MS") {
            self.boost_timeout = Duration::from_millis(parse_var(prefix, "BOOST_TIMEOUT_MS", &v)?);
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(prefix: &str, field: &str, value: &str) -> Result<T, SettingsError> {
    value.trim().parse().map_err(|_| SettingsError::Parse {
        key: format!("QUEUE_{}_{}", prefix, field),
        value: value.to_string(),
    })
}

/// Settings errors
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// A variable could not be parsed
    #[error("invalid value {value:?} for {key}")]
    Parse { key: String, value: String },

    /// Malformed JSON settings
    #[error("invalid queue settings json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Defaults plus per-queue overrides
///
/// When deserialized, each queue entry is layered over `defaults`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "RegistryOverlay")]
pub struct QueueSettingsRegistry {
    /// Settings inherited by every queue
    pub defaults: QueueSettings,

    /// Complete settings for individually configured queues
    pub queues: HashMap<String, QueueSettings>,
}

impl QueueSettingsRegistry {
    /// Create a registry with the given defaults
    pub fn new(defaults: QueueSettings) -> Self {
        Self {
            defaults,
            queues: HashMap::new(),
        }
    }

    /// Add or replace the settings for one queue
    pub fn insert(&mut self, settings: QueueSettings) {
        self.queues.insert(settings.name.clone(), settings);
    }

    /// Resolve the settings for a queue name
    ///
    /// Unknown names inherit the defaults under their own name.
    pub fn for_queue(&self, name: &str) -> QueueSettings {
        match self.queues.get(name) {
            Some(settings) => settings.clone(),
            None => QueueSettings {
                name: name.to_string(),
                ..self.defaults.clone()
            },
        }
    }

    /// Parse a registry from JSON
    ///
    /// Fields missing from a queue entry come from `defaults`.
    pub fn from_json(json: &str) -> Result<Self, SettingsError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load from process environment variables
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut defaults = QueueSettings::default();
        defaults.apply_env("DEFAULT", &lookup)?;

        let mut registry = Self::new(defaults);
        let names = lookup("QUEUE_NAMES").unwrap_or_default();
        for name in names.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            let mut settings = registry.for_queue(name);
            settings.apply_env(&name.to_uppercase(), &lookup)?;
            debug!(queue = %name, ?settings, "Loaded queue settings");
            registry.insert(settings);
        }
        Ok(registry)
    }
}

/// Serialized registry with partial queue entries
#[derive(Default, Deserialize)]
#[serde(default)]
struct RegistryOverlay {
    defaults: QueueSettings,
    queues: HashMap<String, serde_json::Map<String, serde_json::Value>>,
}

impl TryFrom<RegistryOverlay> for QueueSettingsRegistry {
    type Error = SettingsError;

    fn try_from(overlay: RegistryOverlay) -> Result<Self, Self::Error> {
        let mut registry = Self::new(overlay.defaults);
        for (name, fields) in overlay.queues {
            let mut merged = serde_json::to_value(registry.for_queue(&name))?;
            if let Some(base) = merged.as_object_mut() {
                base.extend(fields);
            }

            let mut settings: QueueSettings = serde_json::from_value(merged)?;
            if settings.name.is_empty() || settings.name == "default" {
                settings.name = name.clone();
            }
            registry.queues.insert(name, settings);
        }
        Ok(registry)
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
