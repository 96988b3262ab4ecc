//! Pool manager
//!
//! Registry of every managed queue and of every worker batch running in it.
//! Used for administration only: listing queues, cancelling worker batches
//! and adjusting limits at runtime. Pools keep working if their record is
//! removed.
//!
//! This module provides:
//! - [`Manager`] - Queue id → [`ManagedQueue`] registry
//! - [`ManagedQueue`] - One queue with its worker batch records
//! - [`ManagedPool`] - Capabilities a pool exposes to the manager

mod managed;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use managed::{ManagedQueue, ManagedQueueSummary, PoolWorker, PoolWorkerInfo};

use crate::worker::BoostPhase;

/// Manager-assigned queue id
pub type QueueId = u64;

/// Queue-scoped worker batch id
pub type WorkerId = u64;

/// Administrative capabilities of a pool
pub trait ManagedPool: Send + Sync {
    /// Workers added per boost
    fn boost_workers(&self) -> usize;

    /// Boost lifetime
    fn boost_timeout(&self) -> Duration;

    /// Current block timeout
    fn block_timeout(&self) -> Duration;

    /// Worker cap (None = unbounded)
    fn max_number_of_workers(&self) -> Option<usize>;

    /// Live workers
    fn number_of_workers(&self) -> usize;

    /// Start `count` workers, optionally for a limited time
    fn add_worker(&self, count: usize, timeout: Option<Duration>) -> CancellationToken;

    /// Change the worker cap
    fn set_max_number_of_workers(&self, max: Option<usize>);

    /// Change boost size, worker cap and boost lifetime together
    fn set_managed_settings(
        &self,
        boost_workers: usize,
        max_workers: Option<usize>,
        boost_timeout: Duration,
    );

    /// Current boost phase
    fn phase(&self) -> BoostPhase;

    /// Items pushed but not yet handled
    fn pending(&self) -> i64;
}

#[derive(Default)]
struct ManagerState {
    counter: QueueId,
    queues: HashMap<QueueId, Arc<ManagedQueue>>,
}

/// Registry of managed queues
#[derive(Default)]
pub struct Manager {
    state: Mutex<ManagerState>,
}

impl Manager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pool and get its record
    ///
    /// Without a name the queue is called `queue-{id}`.
    pub fn add(
        &self,
        managed: Arc<dyn ManagedPool>,
        queue_type: &str,
        configuration: serde_json::Value,
        exemplar: &str,
        name: Option<&str>,
    ) -> Arc<ManagedQueue> {
        let queue = {
            let mut state = self.state.lock();
            state.counter += 1;
            let id = state.counter;
            let name = match name {
                Some(name) if !name.is_empty() => name.to_string(),
                _ => format!("queue-{}", id),
            };
            let queue = Arc::new(ManagedQueue::new(
                id,
                name,
                queue_type.to_string(),
                configuration,
                exemplar.to_string(),
                managed,
            ));
            state.queues.insert(id, Arc::clone(&queue));
            queue
        };

        info!(
            queue_id = queue.id(),
            queue = %queue.name(),
            queue_type,
            "Registered queue"
        );
        queue
    }

    /// Drop a queue record
    pub fn remove(&self, id: QueueId) -> Option<Arc<ManagedQueue>> {
        let removed = self.state.lock().queues.remove(&id);
        if removed.is_some() {
            debug!(queue_id = id, "Removed queue");
        }
        removed
    }

    /// Look up a queue record
    pub fn get_managed_queue(&self, id: QueueId) -> Option<Arc<ManagedQueue>> {
        self.state.lock().queues.get(&id).cloned()
    }

    /// Look up a queue record by name
    pub fn find_by_name(&self, name: &str) -> Option<Arc<ManagedQueue>> {
        self.state
            .lock()
            .queues
            .values()
            .find(|queue| queue.name() == name)
            .cloned()
    }

    /// All queue records sorted by id
    pub fn queues(&self) -> Vec<Arc<ManagedQueue>> {
        let mut queues: Vec<_> = self.state.lock().queues.values().cloned().collect();
        queues.sort_by_key(|queue| queue.id());
        queues
    }

    /// Snapshot of every queue for administrative output
    pub fn summaries(&self) -> Vec<ManagedQueueSummary> {
        self.queues().iter().map(|queue| queue.summary()).collect()
    }

    /// Get the number of registered queues
    pub fn len(&self) -> usize {
        self.state.lock().queues.len()
    }

    /// Check if no queue is registered
    pub fn is_empty(&self) -> bool {
        self.state.lock().queues.is_empty()
    }
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("queues", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{WorkerPool, WorkerPoolConfig};

    fn pool() -> Arc<dyn ManagedPool> {
        Arc::new(WorkerPool::new(
            WorkerPoolConfig::new(),
            |_batch: Vec<u32>| async {},
        ))
    }

    #[tokio::test]
    async fn test_add_assigns_increasing_ids() {
        let manager = Manager::new();
        let a = manager.add(pool(), "channel", serde_json::Value::Null, "u32", Some("mail"));
        let b = manager.add(pool(), "channel", serde_json::Value::Null, "u32", None);

        assert_eq!(a.id(), 1);
        assert_eq!(a.name(), "mail");
        assert_eq!(b.id(), 2);
        assert_eq!(b.name(), "queue-2");
        assert_eq!(manager.len(), 2);
    }

    #[tokio::test]
    async fn test_queues_sorted_by_id() {
        let manager = Manager::new();
        for _ in 0..5 {
            manager.add(pool(), "channel", serde_json::Value::Null, "u32", None);
        }
        manager.remove(3);

        let ids: Vec<_> = manager.queues().iter().map(|q| q.id()).collect();
        assert_eq!(ids, vec![1, 2, 4, 5]);
    }

    #[tokio::test]
    async fn test_lookup_and_remove() {
        let manager = Manager::new();
        let queue = manager.add(pool(), "channel", serde_json::Value::Null, "u32", Some("mail"));

        assert!(manager.get_managed_queue(queue.id()).is_some());
        assert_eq!(manager.find_by_name("mail").map(|q| q.id()), Some(queue.id()));

        assert!(manager.remove(queue.id()).is_some());
        assert!(manager.remove(queue.id()).is_none());
        assert!(manager.get_managed_queue(queue.id()).is_none());
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_summaries() {
        let manager = Manager::new();
        manager.add(
            pool(),
            "channel",
            serde_json::json!({"length": 20}),
            "u32",
            Some("mail"),
        );

        let summaries = manager.summaries();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].name, "mail");
        assert_eq!(summaries[0].configuration["length"], 20);
        assert!(format!("{:?}", manager).contains("queues: 1"));
    }
}
