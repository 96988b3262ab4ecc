// Worker process configuration

use filehost_sync::locker::MEMORY_LOCKER;
use filehost_sync::settings::{QueueSettingsRegistry, SettingsError};

use crate::mailer::MailerConfig;

/// Configuration for the worker process
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Locker backend name
    pub locker_type: String,
    /// Backend-specific locker configuration
    pub locker_config: String,
    /// Queue settings
    pub queues: QueueSettingsRegistry,
    /// Mailer settings
    pub mailer: MailerConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            locker_type: MEMORY_LOCKER.to_string(),
            locker_config: String::new(),
            queues: QueueSettingsRegistry::default(),
            mailer: MailerConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `LOCKER_TYPE`: Locker backend (default: "memory")
    /// - `LOCKER_CONFIG`: Backend-specific configuration string
    /// - `QUEUE_*`: Queue settings, see [`QueueSettingsRegistry::from_env`]
    /// - `MAILER_*`: Mailer settings, see [`MailerConfig::from_env`]
    pub fn from_env() -> Result<Self, SettingsError> {
        Ok(Self {
            locker_type: std::env::var("LOCKER_TYPE").unwrap_or_else(|_| MEMORY_LOCKER.to_string()),
            locker_config: std::env::var("LOCKER_CONFIG").unwrap_or_default(),
            queues: QueueSettingsRegistry::from_env()?,
            mailer: MailerConfig::from_env(),
        })
    }
}
