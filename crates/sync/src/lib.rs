//! # Filehost Sync
//!
//! In-process coordination primitives for the file hosting backend.
//!
//! ## Features
//!
//! - **Key-scoped locks**: one holder per key, token-checked release, optional expiry
//! - **Adaptive worker pools**: batching workers that are temporarily boosted while
//!   pushers stay blocked
//! - **Named queues**: per-name settings, pluggable backends, runtime type checks
//! - **Pool manager**: administrative view of every queue and worker batch
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       QueueService                           │
//! │  (settings lookup, backend selection, manager registration) │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                ChannelQueue (Queue trait)                    │
//! │  (exemplar type check, run / shutdown / terminate)          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌──────────────────────────────────┐   ┌──────────────────────┐
//! │            WorkerPool             │──►│       Manager         │
//! │  (bounded buffer, boost, batches) │   │ (queues, worker sets) │
//! └──────────────────────────────────┘   └──────────────────────┘
//!
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Locker (InMemoryLocker)                      │
//! │  (user-{uid}-file keys around file tree mutations)          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use filehost_sync::prelude::*;
//!
//! let manager = Arc::new(Manager::new());
//! let service = QueueService::new(manager, QueueSettingsRegistry::from_env()?);
//!
//! let mail = service.create_typed_queue("mail", |mails: Vec<Mail>| async move {
//!     for mail in mails {
//!         deliver(mail).await;
//!     }
//! })?;
//! mail.run();
//!
//! let locker = InMemoryLocker::new();
//! let cancel = CancellationToken::new();
//! with_lock(&locker, &cancel, &user_file_lock_key(uid), LockOptions::default(), async {
//!     rename_file(uid, from, to).await?;
//!     mail.push(Mail::renamed(uid, to)).await?;
//!     Ok::<_, AppError>(())
//! })
//! .await?;
//! ```

pub mod locker;
pub mod manager;
pub mod queue;
pub mod settings;
pub mod telemetry;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::locker::{
        user_file_lock_key, with_lock, InMemoryLocker, LockError, LockOptions, LockToken, Locker,
        LockerRegistry,
    };
    pub use crate::manager::{ManagedPool, ManagedQueue, Manager, QueueId};
    pub use crate::queue::{
        handle_fn, Data, Exemplar, Queue, QueueError, QueueService, TypedQueue,
    };
    pub use crate::settings::{QueueSettings, QueueSettingsRegistry};
    pub use crate::worker::{PoolError, WorkerPool, WorkerPoolConfig};
    pub use tokio_util::sync::CancellationToken;
}

// Re-export key types at crate root
pub use locker::{InMemoryLocker, LockError, LockOptions, LockToken, Locker, LockerRegistry};
pub use manager::{ManagedPool, ManagedQueue, Manager};
pub use queue::{ChannelQueue, Data, Exemplar, Queue, QueueError, QueueService, TypedQueue};
pub use settings::{QueueSettings, QueueSettingsRegistry, SettingsError};
pub use worker::{PoolError, WorkerPool, WorkerPoolConfig};
