pub mod config;
pub mod mailer;

// Re-export main types
pub use config::WorkerConfig;
pub use mailer::{Mailer, MailerConfig, Message, MAIL_QUEUE};
