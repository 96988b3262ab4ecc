//! Managed queue records

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{ManagedPool, QueueId, WorkerId};
use crate::settings::duration_millis;
use crate::worker::BoostPhase;

/// One batch of workers started together
#[derive(Debug, Clone)]
pub struct PoolWorker {
    /// Queue-scoped id
    pub id: WorkerId,

    /// Workers in the batch
    pub count: usize,

    /// Stops every worker of the batch
    pub cancel: CancellationToken,

    /// When the batch was started
    pub start: DateTime<Utc>,

    /// When the batch stops on its own, if ever
    pub end: Option<DateTime<Utc>>,

    /// Whether the batch only flushes
    pub is_flusher: bool,
}

impl PoolWorker {
    /// Serializable view without the token
    pub fn info(&self) -> PoolWorkerInfo {
        PoolWorkerInfo {
            id: self.id,
            count: self.count,
            start: self.start,
            end: self.end,
            is_flusher: self.is_flusher,
        }
    }
}

/// Serializable worker batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolWorkerInfo {
    pub id: WorkerId,
    pub count: usize,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub is_flusher: bool,
}

/// Serializable queue snapshot
#[derive(Debug, Clone, Serialize)]
pub struct ManagedQueueSummary {
    pub id: QueueId,
    pub name: String,
    #[serde(rename = "type")]
    pub queue_type: String,
    pub configuration: serde_json::Value,
    pub exemplar: String,
    pub phase: BoostPhase,
    pub pending: i64,
    pub number_of_workers: usize,
    pub max_number_of_workers: Option<usize>,
    pub boost_workers: usize,
    #[serde(with = "duration_millis")]
    pub block_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub boost_timeout: Duration,
    pub worker_number: usize,
    pub workers: Vec<PoolWorkerInfo>,
}

#[derive(Default)]
struct WorkerTable {
    counter: WorkerId,
    workers: HashMap<WorkerId, PoolWorker>,
}

/// A registered queue and its worker batches
pub struct ManagedQueue {
    id: QueueId,
    name: String,
    queue_type: String,
    configuration: serde_json::Value,
    exemplar: String,
    managed: Arc<dyn ManagedPool>,
    table: Mutex<WorkerTable>,
}

impl ManagedQueue {
    pub(super) fn new(
        id: QueueId,
        name: String,
        queue_type: String,
        configuration: serde_json::Value,
        exemplar: String,
        managed: Arc<dyn ManagedPool>,
    ) -> Self {
        Self {
            id,
            name,
            queue_type,
            configuration,
            exemplar,
            managed,
            table: Mutex::new(WorkerTable::default()),
        }
    }

    pub fn id(&self) -> QueueId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue_type(&self) -> &str {
        &self.queue_type
    }

    pub fn configuration(&self) -> &serde_json::Value {
        &self.configuration
    }

    /// Type name of the items the queue accepts
    pub fn exemplar(&self) -> &str {
        &self.exemplar
    }

    /// Record a worker batch
    pub fn register_worker(
        &self,
        count: usize,
        cancel: CancellationToken,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
        is_flusher: bool,
    ) -> WorkerId {
        let mut table = self.table.lock();
        table.counter += 1;
        let id = table.counter;
        table.workers.insert(
            id,
            PoolWorker {
                id,
                count,
                cancel,
                start,
                end,
                is_flusher,
            },
        );
        id
    }

    /// Stop a worker batch
    ///
    /// Returns false if no such batch is recorded.
    pub fn cancel_worker(&self, id: WorkerId) -> bool {
        let worker = self.table.lock().workers.remove(&id);
        match worker {
            Some(worker) => {
                debug!(queue = %self.name, worker_id = id, count = worker.count, "Cancelling workers");
                worker.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Forget a worker batch, stopping it if still running
    pub fn remove_worker(&self, id: WorkerId) {
        let worker = self.table.lock().workers.remove(&id);
        if let Some(worker) = worker {
            worker.cancel.cancel();
        }
    }

    /// Account for one worker of a batch exiting
    ///
    /// The batch is forgotten once its last worker is gone.
    pub fn worker_exited(&self, id: WorkerId) {
        let emptied = {
            let mut table = self.table.lock();
            let Some(worker) = table.workers.get_mut(&id) else {
                return;
            };
            worker.count = worker.count.saturating_sub(1);
            if worker.count == 0 {
                table.workers.remove(&id)
            } else {
                None
            }
        };
        if let Some(worker) = emptied {
            trace!(queue = %self.name, worker_id = id, "Worker batch finished");
            worker.cancel.cancel();
        }
    }

    /// Sum of workers over all recorded batches
    pub fn worker_number(&self) -> usize {
        self.table.lock().workers.values().map(|w| w.count).sum()
    }

    /// Recorded batches sorted by id
    pub fn workers(&self) -> Vec<PoolWorker> {
        let mut workers: Vec<_> = self.table.lock().workers.values().cloned().collect();
        workers.sort_by_key(|w| w.id);
        workers
    }

    /// The managed pool
    pub fn pool(&self) -> &Arc<dyn ManagedPool> {
        &self.managed
    }

    pub fn boost_workers(&self) -> usize {
        self.managed.boost_workers()
    }

    pub fn boost_timeout(&self) -> Duration {
        self.managed.boost_timeout()
    }

    pub fn block_timeout(&self) -> Duration {
        self.managed.block_timeout()
    }

    pub fn max_number_of_workers(&self) -> Option<usize> {
        self.managed.max_number_of_workers()
    }

    pub fn number_of_workers(&self) -> usize {
        self.managed.number_of_workers()
    }

    /// Start extra workers on the pool
    pub fn add_worker(&self, count: usize, timeout: Option<Duration>) -> CancellationToken {
        self.managed.add_worker(count, timeout)
    }

    pub fn set_max_number_of_workers(&self, max: Option<usize>) {
        self.managed.set_max_number_of_workers(max)
    }

    pub fn set_managed_settings(
        &self,
        boost_workers: usize,
        max_workers: Option<usize>,
        boost_timeout: Duration,
    ) {
        self.managed
            .set_managed_settings(boost_workers, max_workers, boost_timeout)
    }

    /// Serializable snapshot
    pub fn summary(&self) -> ManagedQueueSummary {
        let workers = self.workers();
        ManagedQueueSummary {
            id: self.id,
            name: self.name.clone(),
            queue_type: self.queue_type.clone(),
            configuration: self.configuration.clone(),
            exemplar: self.exemplar.clone(),
            phase: self.managed.phase(),
            pending: self.managed.pending(),
            number_of_workers: self.managed.number_of_workers(),
            max_number_of_workers: self.managed.max_number_of_workers(),
            boost_workers: self.managed.boost_workers(),
            block_timeout: self.managed.block_timeout(),
            boost_timeout: self.managed.boost_timeout(),
            worker_number: workers.iter().map(|w| w.count).sum(),
            workers: workers.iter().map(PoolWorker::info).collect(),
        }
    }
}

impl fmt::Debug for ManagedQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedQueue")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("queue_type", &self.queue_type)
            .field("exemplar", &self.exemplar)
            .finish()
    }
}
