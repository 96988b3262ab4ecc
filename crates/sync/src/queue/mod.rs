//! Named queue facade
//!
//! This module provides:
//! - [`Queue`] - Backend-independent queue interface
//! - [`ChannelQueue`] - In-process backend over [`WorkerPool`](crate::worker::WorkerPool)
//! - [`QueueRegistry`] - Backend constructors keyed by type tag
//! - [`QueueService`] - Creates named queues from settings and registers them
//! - [`TypedQueue`] - Statically typed wrapper
//!
//! # Example
//!
//! ```ignore
//! use filehost_sync::prelude::*;
//!
//! let service = QueueService::new(Arc::new(Manager::new()), QueueSettingsRegistry::from_env()?);
//!
//! let mail = service.create_typed_queue("mail", |mails: Vec<Mail>| async move {
//!     for mail in mails {
//!         deliver(mail).await;
//!     }
//! })?;
//! mail.run();
//! mail.push(Mail::new("user@example.com")).await?;
//! ```

mod channel;
mod data;
mod typed;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub use channel::ChannelQueue;
pub use data::{Data, Exemplar};
pub use typed::TypedQueue;

use crate::manager::{Manager, QueueId};
use crate::settings::{QueueSettings, QueueSettingsRegistry};
use crate::worker::{BatchHandler, PoolError};

/// Type tag of the in-process backend
pub const CHANNEL_QUEUE: &str = "channel";

/// Batch handler over type-erased items
pub type HandleFn = BatchHandler<Data>;

/// Queue errors
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// No backend registered for the type tag
    #[error("unsupported queue type: {0}")]
    UnsupportedType(String),

    /// Settings rejected by the backend
    #[error("invalid queue configuration: {0}")]
    InvalidConfiguration(String),

    /// Item type differs from the queue's exemplar
    #[error("queue {queue} accepts {expected}, got {actual}")]
    TypeMismatch {
        queue: String,
        expected: &'static str,
        actual: &'static str,
    },

    /// Worker pool error
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Named queue
#[async_trait]
pub trait Queue: Send + Sync {
    /// Configured name
    fn name(&self) -> &str;

    /// Manager-assigned id
    fn queue_id(&self) -> QueueId;

    /// Start the base workers
    fn run(&self);

    /// Enqueue one item
    async fn push(&self, data: Data) -> Result<(), QueueError>;

    /// Enqueue one item, giving up when `cancel` fires
    async fn push_with_cancel(
        &self,
        data: Data,
        cancel: &CancellationToken,
    ) -> Result<(), QueueError>;

    /// Wait until every pushed item has been handled
    async fn flush(&self, cancel: &CancellationToken) -> Result<(), QueueError>;

    /// Stop accepting items and let workers drain
    fn shutdown(&self);

    /// Stop all workers after a final flush
    fn terminate(&self);
}

/// Everything a backend needs to build a queue
pub struct QueueBuildContext {
    pub settings: QueueSettings,
    pub handler: HandleFn,
    pub exemplar: Exemplar,
    pub manager: Arc<Manager>,
}

/// Backend constructor
pub type QueueConstructor =
    Box<dyn Fn(QueueBuildContext) -> Result<Arc<dyn Queue>, QueueError> + Send + Sync>;

/// Backend constructors keyed by type tag
pub struct QueueRegistry {
    constructors: HashMap<String, QueueConstructor>,
}

impl Default for QueueRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(CHANNEL_QUEUE, |ctx| {
            ChannelQueue::new(ctx).map(|queue| Arc::new(queue) as Arc<dyn Queue>)
        });
        registry
    }
}

impl QueueRegistry {
    /// Create a registry with the built-in backends
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry without any backends
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Register a backend
    ///
    /// # Panics
    ///
    /// Panics if `queue_type` is already registered.
    pub fn register<F>(&mut self, queue_type: &str, constructor: F)
    where
        F: Fn(QueueBuildContext) -> Result<Arc<dyn Queue>, QueueError> + Send + Sync + 'static,
    {
        if self.constructors.contains_key(queue_type) {
            panic!("queue type registered twice: {}", queue_type);
        }
        self.constructors
            .insert(queue_type.to_string(), Box::new(constructor));
    }

    /// Resolve a configured type tag
    ///
    /// An empty tag means [`CHANNEL_QUEUE`].
    pub fn validate_type<'a>(&self, queue_type: &'a str) -> Result<&'a str, QueueError> {
        let queue_type = if queue_type.is_empty() {
            CHANNEL_QUEUE
        } else {
            queue_type
        };
        if self.constructors.contains_key(queue_type) {
            Ok(queue_type)
        } else {
            Err(QueueError::UnsupportedType(queue_type.to_string()))
        }
    }

    /// Build a backend
    pub fn create(
        &self,
        queue_type: &str,
        ctx: QueueBuildContext,
    ) -> Result<Arc<dyn Queue>, QueueError> {
        let constructor = self
            .constructors
            .get(queue_type)
            .ok_or_else(|| QueueError::UnsupportedType(queue_type.to_string()))?;
        constructor(ctx)
    }

    /// Get all registered type tags
    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for QueueRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueRegistry")
            .field("types", &self.constructors.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Creates named queues from settings
pub struct QueueService {
    manager: Arc<Manager>,
    settings: QueueSettingsRegistry,
    registry: QueueRegistry,
}

impl QueueService {
    /// Create a service with the built-in backends
    pub fn new(manager: Arc<Manager>, settings: QueueSettingsRegistry) -> Self {
        Self::with_registry(manager, settings, QueueRegistry::default())
    }

    /// Create a service with a custom backend registry
    pub fn with_registry(
        manager: Arc<Manager>,
        settings: QueueSettingsRegistry,
        registry: QueueRegistry,
    ) -> Self {
        Self {
            manager,
            settings,
            registry,
        }
    }

    /// Get the manager queues are registered with
    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    /// Get the settings registry
    pub fn settings(&self) -> &QueueSettingsRegistry {
        &self.settings
    }

    /// Create the queue `name` with its configured backend
    ///
    /// An unknown backend type falls back to [`CHANNEL_QUEUE`].
    pub fn create_queue(
        &self,
        name: &str,
        handler: HandleFn,
        exemplar: Exemplar,
    ) -> Result<Arc<dyn Queue>, QueueError> {
        let settings = self.settings.for_queue(name);
        let queue_type = match self.registry.validate_type(&settings.queue_type) {
            Ok(queue_type) => queue_type.to_string(),
            Err(e) => {
                warn!(queue = %name, error = %e, "Falling back to channel queue");
                CHANNEL_QUEUE.to_string()
            }
        };

        self.registry.create(
            &queue_type,
            QueueBuildContext {
                settings,
                handler,
                exemplar,
                manager: Arc::clone(&self.manager),
            },
        )
    }

    /// Create the queue `name` for items of type `T`
    pub fn create_typed_queue<T, F, Fut>(
        &self,
        name: &str,
        handler: F,
    ) -> Result<TypedQueue<T>, QueueError>
    where
        T: Send + 'static,
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let queue = self.create_queue(name, typed::erase_handler(handler), Exemplar::of::<T>())?;
        Ok(TypedQueue::new(queue))
    }
}

impl fmt::Debug for QueueService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueService")
            .field("manager", &self.manager)
            .field("registry", &self.registry)
            .finish()
    }
}

/// Wrap an async closure over erased items as a [`HandleFn`]
pub fn handle_fn<F, Fut>(handler: F) -> HandleFn
where
    F: Fn(Vec<Data>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |batch: Vec<Data>| -> BoxFuture<'static, ()> { Box::pin(handler(batch)) })
}
