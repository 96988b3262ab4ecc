//! Statically typed queue access

use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::error;

use super::{handle_fn, Data, HandleFn, Queue, QueueError};
use crate::manager::QueueId;

/// Queue of `T` items over a type-erased backend
pub struct TypedQueue<T> {
    inner: Arc<dyn Queue>,
    _marker: PhantomData<fn(T)>,
}

impl<T> Clone for TypedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _marker: PhantomData,
        }
    }
}

impl<T: Any + Send> TypedQueue<T> {
    pub(super) fn new(inner: Arc<dyn Queue>) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }

    /// Get the erased queue
    pub fn queue(&self) -> &Arc<dyn Queue> {
        &self.inner
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn queue_id(&self) -> QueueId {
        self.inner.queue_id()
    }

    pub fn run(&self) {
        self.inner.run()
    }

    pub async fn push(&self, item: T) -> Result<(), QueueError> {
        self.inner.push(Data::new(item)).await
    }

    pub async fn push_with_cancel(
        &self,
        item: T,
        cancel: &CancellationToken,
    ) -> Result<(), QueueError> {
        self.inner.push_with_cancel(Data::new(item), cancel).await
    }

    pub async fn flush(&self, cancel: &CancellationToken) -> Result<(), QueueError> {
        self.inner.flush(cancel).await
    }

    pub fn shutdown(&self) {
        self.inner.shutdown()
    }

    pub fn terminate(&self) {
        self.inner.terminate()
    }
}

/// Adapt a typed handler to erased batches
///
/// Items of another type cannot reach it through [`TypedQueue`]; any that do
/// are logged and dropped.
pub(super) fn erase_handler<T, F, Fut>(handler: F) -> HandleFn
where
    T: Any + Send,
    F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    handle_fn(move |batch: Vec<Data>| {
        let items: Vec<T> = batch
            .into_iter()
            .filter_map(|data| match data.downcast::<T>() {
                Ok(item) => Some(item),
                Err(data) => {
                    error!(
                        expected = std::any::type_name::<T>(),
                        actual = data.type_name(),
                        "Dropping item of unexpected type"
                    );
                    None
                }
            })
            .collect();
        handler(items)
    })
}
