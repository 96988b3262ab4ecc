//! Adaptive worker pool
//!
//! A bounded buffer drained in batches by a dynamic set of workers. Pushers
//! that stay blocked for a full `block_timeout` add a temporary boost of
//! workers.

use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_channel::{Receiver, Sender, TrySendError};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::boost::{BoostDecision, BoostPhase, BoostState};
use crate::manager::{ManagedPool, ManagedQueue, WorkerId};
use crate::settings::duration_millis;

/// First idle wait before a partial batch is handed over
const FIRST_IDLE_FLUSH: Duration = Duration::from_millis(300);

/// Subsequent idle waits within the same quiet period
const NEXT_IDLE_FLUSH: Duration = Duration::from_millis(100);

/// How often `flush` re-checks the pending counter
const FLUSH_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Worker pool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Buffer capacity
    pub queue_length: usize,

    /// Maximum items per handler call
    pub batch_length: usize,

    /// Initial time a push may block before a boost (zero disables boosting)
    #[serde(with = "duration_millis")]
    pub block_timeout: Duration,

    /// Lifetime of a boost (zero disables boosting)
    #[serde(with = "duration_millis")]
    pub boost_timeout: Duration,

    /// Workers added per boost
    pub boost_workers: usize,

    /// Worker cap (None = unbounded)
    pub max_workers: Option<usize>,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            queue_length: 20,
            batch_length: 20,
            block_timeout: Duration::ZERO,
            boost_timeout: Duration::ZERO,
            boost_workers: 0,
            max_workers: None,
        }
    }
}

impl WorkerPoolConfig {
    /// Create a configuration without boosting
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the buffer capacity
    pub fn with_queue_length(mut self, length: usize) -> Self {
        self.queue_length = length;
        self
    }

    /// Set the batch length
    pub fn with_batch_length(mut self, length: usize) -> Self {
        self.batch_length = length.max(1);
        self
    }

    /// Set the initial block timeout
    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }

    /// Set the boost lifetime
    pub fn with_boost_timeout(mut self, timeout: Duration) -> Self {
        self.boost_timeout = timeout;
        self
    }

    /// Set the number of workers per boost
    pub fn with_boost_workers(mut self, workers: usize) -> Self {
        self.boost_workers = workers;
        self
    }

    /// Set the worker cap
    pub fn with_max_workers(mut self, max: Option<usize>) -> Self {
        self.max_workers = max;
        self
    }
}

/// Worker pool errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// The pool was shut down or terminated
    #[error("worker pool is closed")]
    Closed,

    /// The caller's cancellation token fired
    #[error("operation was cancelled")]
    Cancelled,
}

/// Batch handler invoked by the workers
pub type BatchHandler<T> = Arc<dyn Fn(Vec<T>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Adaptive batching worker pool
///
/// Cloning is cheap; clones share the same buffer, workers and state.
///
/// # Example
///
/// ```ignore
/// use filehost_sync::worker::{WorkerPool, WorkerPoolConfig};
///
/// let config = WorkerPoolConfig::new()
///     .with_queue_length(100)
///     .with_block_timeout(Duration::from_secs(1))
///     .with_boost_timeout(Duration::from_secs(180))
///     .with_boost_workers(5)
///     .with_max_workers(Some(10));
///
/// let pool = WorkerPool::new(config, |mails: Vec<Mail>| async move {
///     for mail in mails {
///         deliver(mail).await;
///     }
/// });
///
/// pool.add_worker(1, None);
/// pool.push(mail).await?;
///
/// pool.shutdown();
/// ```
pub struct WorkerPool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for WorkerPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct PoolInner<T> {
    config: WorkerPoolConfig,
    state: Mutex<BoostState>,
    sender: Sender<T>,
    receiver: Receiver<T>,
    handler: BatchHandler<T>,
    /// Parent of every worker token
    base: CancellationToken,
    pending: AtomicI64,
    managed: OnceLock<Weak<ManagedQueue>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Create a pool with an async batch handler
    pub fn new<F, Fut>(config: WorkerPoolConfig, handler: F) -> Self
    where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: BatchHandler<T> =
            Arc::new(move |batch: Vec<T>| -> BoxFuture<'static, ()> { Box::pin(handler(batch)) });
        Self::from_handler(config, handler)
    }

    /// Create a pool from a shared handler
    pub fn from_handler(config: WorkerPoolConfig, handler: BatchHandler<T>) -> Self {
        let (sender, receiver) = async_channel::bounded(config.queue_length.max(1));
        let state = Mutex::new(BoostState::new(&config));

        Self {
            inner: Arc::new(PoolInner {
                config,
                state,
                sender,
                receiver,
                handler,
                base: CancellationToken::new(),
                pending: AtomicI64::new(0),
                managed: OnceLock::new(),
            }),
        }
    }

    /// Report worker batches to a managed queue record
    ///
    /// Only the first call has an effect.
    pub fn attach(&self, queue: &Arc<ManagedQueue>) {
        if self.inner.managed.set(Arc::downgrade(queue)).is_err() {
            warn!(queue_id = queue.id(), "Worker pool already attached");
        }
    }

    /// Enqueue one item, waiting for buffer space
    pub async fn push(&self, data: T) -> Result<(), PoolError> {
        self.push_with_cancel(data, &CancellationToken::new()).await
    }

    /// Enqueue one item, giving up when `cancel` fires
    pub async fn push_with_cancel(
        &self,
        data: T,
        cancel: &CancellationToken,
    ) -> Result<(), PoolError> {
        let inner = &self.inner;
        if inner.base.is_cancelled() {
            return Err(PoolError::Closed);
        }

        inner.pending.fetch_add(1, Ordering::SeqCst);
        let boosting = inner.state.lock().should_boost_on_push();
        let result = if boosting {
            inner.push_boost(data, cancel).await
        } else {
            inner.send(&mut Box::pin(inner.sender.send(data)), cancel).await
        };

        if result.is_err() {
            inner.items_done(1);
        }
        result
    }

    /// Start `count` workers
    ///
    /// The returned token stops them. With a `timeout` they stop on their own
    /// once it elapses.
    pub fn add_worker(&self, count: usize, timeout: Option<Duration>) -> CancellationToken {
        let inner = &self.inner;
        let token = inner.base.child_token();
        if count == 0 {
            return token;
        }

        inner.state.lock().workers_started(count);
        let start = Utc::now();
        let end = timeout.and_then(|t| end_of(start, t));
        let batch = inner.register_batch(count, &token, start, end);
        inner.spawn_workers(count, &token, batch);

        if let Some(timeout) = timeout {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(timeout) => token.cancel(),
                }
            });
        }

        debug!(count, ?timeout, "Added workers");
        token
    }

    /// Wait until every pushed item has been handled
    ///
    /// Advisory: items pushed concurrently may extend the wait.
    pub async fn flush(&self, cancel: &CancellationToken) -> Result<(), PoolError> {
        loop {
            if self.pending() <= 0 {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(PoolError::Cancelled),
                _ = tokio::time::sleep(FLUSH_POLL_INTERVAL) => {}
            }
        }
    }

    /// Stop accepting items; workers drain the buffer and exit
    pub fn shutdown(&self) {
        if self.inner.sender.close() {
            info!(pending = self.pending(), "Worker pool shutting down");
        }
    }

    /// Stop every worker after a final flush of its batch
    pub fn terminate(&self) {
        if !self.inner.base.is_cancelled() {
            info!(pending = self.pending(), "Worker pool terminating");
            // Closed first so no send lands after the workers' final drain
            self.inner.sender.close();
            self.inner.base.cancel();
        }
    }

    /// Items pushed but not yet handled
    pub fn pending(&self) -> i64 {
        self.inner.pending.load(Ordering::SeqCst)
    }

    /// Current boost phase
    pub fn phase(&self) -> BoostPhase {
        self.inner.state.lock().phase()
    }

    /// Whether `shutdown` or `terminate` was called
    pub fn is_closed(&self) -> bool {
        self.inner.sender.is_closed() || self.inner.base.is_cancelled()
    }

    /// Get the configuration the pool was created with
    pub fn config(&self) -> &WorkerPoolConfig {
        &self.inner.config
    }

    /// Get the number of workers per boost
    pub fn boost_workers(&self) -> usize {
        self.inner.state.lock().boost_workers()
    }

    /// Get the boost lifetime
    pub fn boost_timeout(&self) -> Duration {
        self.inner.state.lock().boost_timeout()
    }

    /// Get the current block timeout
    pub fn block_timeout(&self) -> Duration {
        self.inner.state.lock().block_timeout()
    }

    /// Get the worker cap
    pub fn max_number_of_workers(&self) -> Option<usize> {
        self.inner.state.lock().max_workers()
    }

    /// Get the number of live workers
    pub fn number_of_workers(&self) -> usize {
        self.inner.state.lock().workers()
    }

    /// Change the worker cap
    pub fn set_max_number_of_workers(&self, max: Option<usize>) {
        self.inner.state.lock().set_max_workers(max);
    }

    /// Change boost size, worker cap and boost lifetime
    pub fn set_managed_settings(
        &self,
        boost_workers: usize,
        max_workers: Option<usize>,
        boost_timeout: Duration,
    ) {
        self.inner
            .state
            .lock()
            .set_managed_settings(boost_workers, max_workers, boost_timeout);
    }
}

impl<T: Send + 'static> PoolInner<T> {
    /// Race a pending send against pool termination and the caller's token
    async fn send<F>(&self, send: &mut F, cancel: &CancellationToken) -> Result<(), PoolError>
    where
        F: Future<Output = Result<(), async_channel::SendError<T>>> + Unpin,
    {
        tokio::select! {
            biased;
            _ = self.base.cancelled() => Err(PoolError::Closed),
            _ = cancel.cancelled() => Err(PoolError::Cancelled),
            sent = send => sent.map_err(|_| PoolError::Closed),
        }
    }

    async fn push_boost(self: &Arc<Self>, data: T, cancel: &CancellationToken) -> Result<(), PoolError> {
        let data = match self.sender.try_send(data) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Closed(_)) => return Err(PoolError::Closed),
            Err(TrySendError::Full(data)) => data,
        };

        let our_timeout = self.state.lock().block_timeout();
        let mut send = Box::pin(self.sender.send(data));

        tokio::select! {
            biased;
            _ = self.base.cancelled() => return Err(PoolError::Closed),
            _ = cancel.cancelled() => return Err(PoolError::Cancelled),
            sent = &mut send => return sent.map_err(|_| PoolError::Closed),
            _ = tokio::time::sleep(our_timeout) => {}
        }

        self.boost(our_timeout);
        self.send(&mut send, cancel).await
    }

    fn boost(self: &Arc<Self>, observed: Duration) {
        let decision = self.state.lock().on_blocked(observed);
        let BoostDecision::Boost { workers, lifetime } = decision else {
            trace!(?decision, ?observed, "Push blocked without boost");
            return;
        };

        let token = self.base.child_token();
        let start = Utc::now();
        let batch = self.register_batch(workers, &token, start, end_of(start, lifetime));
        self.spawn_workers(workers, &token, batch);

        debug!(
            workers,
            lifetime_ms = lifetime.as_millis() as u64,
            block_timeout_ms = self.state.lock().block_timeout().as_millis() as u64,
            "Boosting worker pool"
        );

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = inner.base.cancelled() => {}
                _ = tokio::time::sleep(lifetime) => {}
            }
            token.cancel();
            let block_timeout = {
                let mut state = inner.state.lock();
                state.on_boost_expired();
                state.block_timeout()
            };
            debug!(
                workers,
                block_timeout_ms = block_timeout.as_millis() as u64,
                "Boost expired"
            );
        });
    }

    fn spawn_workers(
        self: &Arc<Self>,
        count: usize,
        token: &CancellationToken,
        batch: Option<WorkerId>,
    ) {
        for _ in 0..count {
            let guard = WorkerGuard {
                inner: Arc::clone(self),
                batch,
            };
            let token = token.clone();
            tokio::spawn(async move {
                guard.inner.run_worker(token).await;
                drop(guard);
            });
        }
    }

    /// Record a worker batch with the manager until its token fires
    fn register_batch(
        &self,
        count: usize,
        token: &CancellationToken,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Option<WorkerId> {
        let queue = self.managed.get().and_then(Weak::upgrade)?;

        let worker_id = queue.register_worker(count, token.clone(), start, end, false);
        let queue = Arc::downgrade(&queue);
        let token = token.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            match queue.upgrade() {
                Some(queue) => queue.remove_worker(worker_id),
                None => debug!(worker_id, "Queue removed before its workers stopped"),
            }
        });
        Some(worker_id)
    }

    async fn run_worker(&self, token: CancellationToken) {
        let batch_length = self.config.batch_length.max(1);
        let mut batch = Vec::with_capacity(batch_length);
        let mut idle = FIRST_IDLE_FLUSH;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    if self.base.is_cancelled() {
                        while let Ok(item) = self.receiver.try_recv() {
                            batch.push(item);
                        }
                    }
                    self.handle(batch).await;
                    return;
                }
                received = self.receiver.recv() => match received {
                    Ok(item) => {
                        batch.push(item);
                        if batch.len() >= batch_length {
                            let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_length));
                            self.handle(full).await;
                            idle = FIRST_IDLE_FLUSH;
                        }
                    }
                    Err(_) => {
                        self.handle(batch).await;
                        return;
                    }
                },
                _ = tokio::time::sleep(idle) => {
                    idle = NEXT_IDLE_FLUSH;
                    if !batch.is_empty() {
                        let partial = std::mem::replace(&mut batch, Vec::with_capacity(batch_length));
                        self.handle(partial).await;
                    }
                }
            }
        }
    }

    async fn handle(&self, batch: Vec<T>) {
        if batch.is_empty() {
            return;
        }
        let _done = PendingGuard {
            pending: &self.pending,
            count: batch.len(),
        };
        (self.handler)(batch).await;
    }

    fn items_done(&self, count: usize) {
        self.pending.fetch_sub(count as i64, Ordering::SeqCst);
    }
}

/// Keeps the worker count right however a worker exits
struct WorkerGuard<T> {
    inner: Arc<PoolInner<T>>,
    /// Manager record of the batch this worker belongs to
    batch: Option<WorkerId>,
}

impl<T> Drop for WorkerGuard<T> {
    fn drop(&mut self) {
        let remaining = {
            let mut state = self.inner.state.lock();
            state.worker_stopped();
            state.workers()
        };
        let queue = self.inner.managed.get().and_then(Weak::upgrade);
        if let (Some(id), Some(queue)) = (self.batch, queue) {
            queue.worker_exited(id);
        }
        trace!(remaining, "Worker exited");
    }
}

/// Settles the pending counter for a batch, including when the handler panics
struct PendingGuard<'a> {
    pending: &'a AtomicI64,
    count: usize,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.fetch_sub(self.count as i64, Ordering::SeqCst);
    }
}

fn end_of(start: DateTime<Utc>, lifetime: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(lifetime)
        .ok()
        .and_then(|lifetime| start.checked_add_signed(lifetime))
}

impl<T: Send + 'static> ManagedPool for WorkerPool<T> {
    fn boost_workers(&self) -> usize {
        WorkerPool::boost_workers(self)
    }

    fn boost_timeout(&self) -> Duration {
        WorkerPool::boost_timeout(self)
    }

    fn block_timeout(&self) -> Duration {
        WorkerPool::block_timeout(self)
    }

    fn max_number_of_workers(&self) -> Option<usize> {
        WorkerPool::max_number_of_workers(self)
    }

    fn number_of_workers(&self) -> usize {
        WorkerPool::number_of_workers(self)
    }

    fn add_worker(&self, count: usize, timeout: Option<Duration>) -> CancellationToken {
        WorkerPool::add_worker(self, count, timeout)
    }

    fn set_max_number_of_workers(&self, max: Option<usize>) {
        WorkerPool::set_max_number_of_workers(self, max)
    }

    fn set_managed_settings(
        &self,
        boost_workers: usize,
        max_workers: Option<usize>,
        boost_timeout: Duration,
    ) {
        WorkerPool::set_managed_settings(self, boost_workers, max_workers, boost_timeout)
    }

    fn phase(&self) -> BoostPhase {
        WorkerPool::phase(self)
    }

    fn pending(&self) -> i64 {
        WorkerPool::pending(self)
    }
}
