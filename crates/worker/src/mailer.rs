// Outbound mail queue
// Decision: Delivery is logged only; an SMTP transport plugs in behind the same queue handler

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use filehost_sync::{QueueError, QueueService, TypedQueue};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Name of the mail queue in queue settings
pub const MAIL_QUEUE: &str = "mail";

// =============================================================================
// Configuration
// =============================================================================

/// Mailer configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailerConfig {
    /// Sender display name
    pub from_name: String,
    /// Sender address
    pub from_address: String,
    /// Prefix prepended to every subject
    pub subject_prefix: String,
}

impl Default for MailerConfig {
    fn default() -> Self {
        Self {
            from_name: "Filehost".to_string(),
            from_address: "noreply@localhost".to_string(),
            subject_prefix: String::new(),
        }
    }
}

impl MailerConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `MAILER_FROM_NAME`: Sender display name (default: "Filehost")
    /// - `MAILER_FROM`: Sender address (default: "noreply@localhost")
    /// - `MAILER_SUBJECT_PREFIX`: Subject prefix (default: empty)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            from_name: std::env::var("MAILER_FROM_NAME").unwrap_or(defaults.from_name),
            from_address: std::env::var("MAILER_FROM").unwrap_or(defaults.from_address),
            subject_prefix: std::env::var("MAILER_SUBJECT_PREFIX").unwrap_or_default(),
        }
    }
}

// =============================================================================
// Message
// =============================================================================

/// One outbound mail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub subject: String,
    pub from_address: String,
    pub from_name: String,
    pub to: Vec<String>,
    pub date: DateTime<Utc>,
    pub body: String,
    pub headers: HashMap<String, Vec<String>>,
}

impl Message {
    /// Create a message from the configured sender
    pub fn new(config: &MailerConfig, to: Vec<String>, subject: &str, body: &str) -> Self {
        let subject = if config.subject_prefix.is_empty() {
            subject.to_string()
        } else {
            format!("{} {}", config.subject_prefix, subject)
        };

        Self {
            subject,
            from_address: config.from_address.clone(),
            from_name: config.from_name.clone(),
            to,
            date: Utc::now(),
            body: body.to_string(),
            headers: HashMap::new(),
        }
    }

    /// Set a header, replacing previous values
    pub fn set_header(&mut self, field: &str, values: Vec<String>) {
        self.headers.insert(field.to_string(), values);
    }
}

// =============================================================================
// Mailer
// =============================================================================

/// Queue-backed mail sender
#[derive(Clone)]
pub struct Mailer {
    config: MailerConfig,
    queue: TypedQueue<Message>,
}

impl Mailer {
    /// Create the `mail` queue and start its workers
    pub fn start(service: &QueueService, config: MailerConfig) -> Result<Self, QueueError> {
        let queue = service.create_typed_queue(MAIL_QUEUE, deliver)?;
        queue.run();
        info!(queue_id = queue.queue_id(), "Mailer service is running");
        Ok(Self { config, queue })
    }

    /// Get the mailer configuration
    pub fn config(&self) -> &MailerConfig {
        &self.config
    }

    /// Build a message from the configured sender
    pub fn message(&self, to: Vec<String>, subject: &str, body: &str) -> Message {
        Message::new(&self.config, to, subject, body)
    }

    /// Queue a message, waiting for buffer space
    pub async fn send(&self, message: Message) -> Result<(), QueueError> {
        self.queue.push(message).await
    }

    /// Queue a message without waiting
    pub fn send_async(&self, message: Message) {
        let queue = self.queue.clone();
        tokio::spawn(async move {
            if let Err(e) = queue.push(message).await {
                warn!(error = %e, "Failed to queue mail");
            }
        });
    }

    /// Wait until queued messages are delivered
    pub async fn flush(&self, cancel: &CancellationToken) -> Result<(), QueueError> {
        self.queue.flush(cancel).await
    }

    /// Stop accepting mail and drain the queue
    pub fn shutdown(&self) {
        self.queue.shutdown();
    }
}

async fn deliver(messages: Vec<Message>) {
    debug!(count = messages.len(), "Delivering mail batch");
    for message in messages {
        info!(
            to = ?message.to,
            subject = %message.subject,
            from = %message.from_address,
            "E-mail sent"
        );
    }
}
