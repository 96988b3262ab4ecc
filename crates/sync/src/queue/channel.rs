//! In-process queue backend

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{Data, Exemplar, Queue, QueueBuildContext, QueueError, CHANNEL_QUEUE};
use crate::manager::{ManagedQueue, Manager, QueueId};
use crate::worker::WorkerPool;

/// Queue backed by an in-process [`WorkerPool`]
pub struct ChannelQueue {
    name: String,
    pool: WorkerPool<Data>,
    exemplar: Exemplar,
    workers: usize,
    record: Arc<ManagedQueue>,
    manager: Arc<Manager>,
}

impl ChannelQueue {
    /// Build the pool and register it with the manager
    pub fn new(ctx: QueueBuildContext) -> Result<Self, QueueError> {
        let QueueBuildContext {
            settings,
            handler,
            exemplar,
            manager,
        } = ctx;

        if settings.length == 0 {
            return Err(QueueError::InvalidConfiguration(format!(
                "queue {} needs a length of at least 1",
                settings.name
            )));
        }
        let configuration = serde_json::to_value(&settings)
            .map_err(|e| QueueError::InvalidConfiguration(e.to_string()))?;

        let pool = WorkerPool::from_handler(settings.pool_config(), handler);
        let record = manager.add(
            Arc::new(pool.clone()),
            CHANNEL_QUEUE,
            configuration,
            exemplar.type_name(),
            Some(&settings.name),
        );
        pool.attach(&record);

        debug!(
            queue = %settings.name,
            queue_id = record.id(),
            length = settings.length,
            batch_length = settings.batch_length,
            "Created channel queue"
        );

        Ok(Self {
            name: settings.name,
            pool,
            exemplar,
            workers: settings.workers,
            record,
            manager,
        })
    }

    /// Get the underlying pool
    pub fn pool(&self) -> &WorkerPool<Data> {
        &self.pool
    }

    /// Get the manager record
    pub fn record(&self) -> &Arc<ManagedQueue> {
        &self.record
    }

    fn check(&self, data: &Data) -> Result<(), QueueError> {
        if self.exemplar.matches(data) {
            Ok(())
        } else {
            Err(QueueError::TypeMismatch {
                queue: self.name.clone(),
                expected: self.exemplar.type_name(),
                actual: data.type_name(),
            })
        }
    }
}

#[async_trait]
impl Queue for ChannelQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn queue_id(&self) -> QueueId {
        self.record.id()
    }

    fn run(&self) {
        info!(queue = %self.name, workers = self.workers, "Starting queue");
        self.pool.add_worker(self.workers, None);
    }

    async fn push(&self, data: Data) -> Result<(), QueueError> {
        self.check(&data)?;
        self.pool.push(data).await?;
        Ok(())
    }

    async fn push_with_cancel(
        &self,
        data: Data,
        cancel: &CancellationToken,
    ) -> Result<(), QueueError> {
        self.check(&data)?;
        self.pool.push_with_cancel(data, cancel).await?;
        Ok(())
    }

    async fn flush(&self, cancel: &CancellationToken) -> Result<(), QueueError> {
        self.pool.flush(cancel).await?;
        Ok(())
    }

    fn shutdown(&self) {
        self.pool.shutdown();
    }

    fn terminate(&self) {
        self.pool.terminate();
        self.manager.remove(self.record.id());
    }
}
