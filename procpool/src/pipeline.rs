//! Producer/consumer pipeline over a pool.

use crate::codec::Task;
use crate::errors::PoolError;
use crate::pool::{Deferred, Pool};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex as AsyncMutex;

/// Unbounded FIFO of in-flight tasks bound to one pool.
///
/// Producers `queue` tasks as fast as the pool lets them check workers
/// out; the consumer takes results in queue order via `next`. After
/// `shutdown`, already-queued tasks remain collectable and the queue
/// drains to an end-of-stream marker.
pub struct Pipeline {
    pool: Pool,
    sender: Mutex<Option<UnboundedSender<Deferred>>>,
    receiver: AsyncMutex<UnboundedReceiver<Deferred>>,
}

impl Pipeline {
    pub(crate) fn new(pool: Pool) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Pipeline {
            pool,
            sender: Mutex::new(Some(sender)),
            receiver: AsyncMutex::new(receiver),
        }
    }

    /// True once `shutdown` has been called.
    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Dispatch a task and queue its handle for the consumer.
    pub async fn queue(&self, task: &Task, args: Vec<Value>) -> Result<(), PoolError> {
        if self.is_closed() {
            return Err(PoolError::PipelineClosed);
        }
        let handle = self.pool.defer(task, args).await?;
        match self.sender.lock().as_ref() {
            Some(sender) => sender.send(handle).map_err(|_| PoolError::PipelineClosed),
            // Shut down while the dispatch was in flight; the background
            // release still returns the worker, only the result is lost.
            None => Err(PoolError::PipelineClosed),
        }
    }

    /// Await the next queued result.
    ///
    /// Blocks while the pipeline is open and empty; returns `Ok(None)`
    /// once it is closed and drained. Task and pool failures are
    /// re-raised here, in queue order.
    pub async fn next(&self) -> Result<Option<Value>, PoolError> {
        let handle = { self.receiver.lock().await.recv().await };
        match handle {
            Some(handle) => handle.get().await.map(Some),
            None => Ok(None),
        }
    }

    /// Close the queue; already-queued tasks remain collectable.
    pub fn shutdown(&self) {
        if self.sender.lock().take().is_some() {
            debug!("pipeline closed");
        }
    }
}
