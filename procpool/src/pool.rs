//! Bounded pool of worker processes with multiplexed dispatch.
//!
//! Clients check workers out through a counting semaphore, one permit per
//! worker. Dispatch follows the early-release sequence: send the request,
//! wait for the mailbox's readable signal, hand the worker back, then
//! drain the response. Because mailboxes are multiplexed by request id,
//! the worker can serve the next client while the previous response is
//! still in its pipe.

use crate::codec::{Task, TaskRequest, TaskResponse};
use crate::config::PoolSettings;
use crate::errors::PoolError;
use crate::mailbox::Mailbox;
use crate::pipeline::Pipeline;
use crate::worker::Worker;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

struct PoolState {
    /// Idle workers; most recently used at the front.
    procs: VecDeque<Worker>,
    /// Workers currently alive, idle or leased.
    num_procs: usize,
    is_running: bool,
}

struct PoolShared {
    settings: PoolSettings,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState>,
}

/// Handle to a bounded set of worker processes.
///
/// Cheap to clone; all clones share the same workers. Workers are spawned
/// lazily, up to `max_procs`, and recycled after `max_reqs` requests.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<PoolShared>,
}

impl Pool {
    /// Validate `settings` and create an empty pool.
    pub fn new(settings: PoolSettings) -> Result<Self, PoolError> {
        let settings = settings.try_validate()?;
        let max_procs = settings.max_procs;
        Ok(Pool {
            shared: Arc::new(PoolShared {
                settings,
                permits: Arc::new(Semaphore::new(max_procs)),
                state: Mutex::new(PoolState {
                    procs: VecDeque::new(),
                    num_procs: 0,
                    is_running: true,
                }),
            }),
        })
    }

    /// Remaining worker permits.
    pub fn capacity(&self) -> usize {
        self.shared.permits.available_permits()
    }

    /// Run one task to completion and return its result.
    pub async fn process(&self, task: &Task, args: Vec<Value>) -> Result<Value, PoolError> {
        let request = task.request(args);
        let mut lease = self.acquire().await?;
        let mailbox = lease.mailbox();
        let id = lease.send(&request).await?;
        lease.readable().await?;
        self.release(lease).await;
        collect(&mailbox, id).await
    }

    /// Dispatch one task and return a handle to collect it later.
    ///
    /// The worker is released on the readable event by a background task,
    /// whether or not the handle is ever awaited.
    pub async fn defer(&self, task: &Task, args: Vec<Value>) -> Result<Deferred, PoolError> {
        let request = task.request(args);
        let mut lease = self.acquire().await?;
        let mailbox = lease.mailbox();
        let id = lease.send(&request).await?;

        let pool = self.clone();
        tokio::spawn(async move {
            if lease.readable().await.is_ok() {
                pool.release(lease).await;
            }
            // On error the lease drop guard retires the worker.
        });

        Ok(Deferred { mailbox, id })
    }

    /// Apply `task` to every input concurrently.
    ///
    /// Results come back in input order, with array results flattened in
    /// place. The first error in input order is surfaced only after every
    /// sibling has settled, so no worker is abandoned mid-request.
    pub async fn map(&self, task: &Task, inputs: Vec<Value>) -> Result<Vec<Value>, PoolError> {
        let mut handles = Vec::with_capacity(inputs.len());
        let mut dispatch_error = None;
        for input in inputs {
            match self.defer(task, vec![input]).await {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    dispatch_error = Some(err);
                    break;
                }
            }
        }

        let settled = futures::future::join_all(handles.into_iter().map(Deferred::get)).await;

        let mut results = Vec::with_capacity(settled.len());
        for outcome in settled {
            match outcome? {
                Value::Array(items) => results.extend(items),
                value => results.push(value),
            }
        }
        if let Some(err) = dispatch_error {
            return Err(err);
        }
        Ok(results)
    }

    /// New producer/consumer pipeline over this pool.
    pub fn pipeline(&self) -> Result<Pipeline, PoolError> {
        if !self.shared.state.lock().is_running {
            return Err(PoolError::PoolClosed);
        }
        Ok(Pipeline::new(self.clone()))
    }

    /// Stop accepting work, wait out in-flight requests, and terminate
    /// every worker. Idempotent; the pool stays closed afterwards.
    pub async fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if !state.is_running {
                return;
            }
            state.is_running = false;
        }
        debug!("pool shutting down");

        // Collecting every permit waits for all outstanding leases.
        let drained = self
            .shared
            .permits
            .acquire_many(self.shared.settings.max_procs as u32)
            .await
            .ok();

        let idle: Vec<Worker> = {
            let mut state = self.shared.state.lock();
            let workers: Vec<Worker> = state.procs.drain(..).collect();
            state.num_procs -= workers.len();
            workers
        };
        for worker in idle {
            worker.shutdown().await;
        }
        drop(drained);
        debug!("pool shut down");
    }

    /// Check one worker out: pop an idle one (retiring any found dead) or
    /// spawn, never exceeding `max_procs`.
    async fn acquire(&self) -> Result<Lease, PoolError> {
        if !self.shared.state.lock().is_running {
            return Err(PoolError::PoolClosed);
        }
        let permit = match Arc::clone(&self.shared.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return Err(PoolError::PoolClosed),
        };

        loop {
            let candidate = {
                let mut state = self.shared.state.lock();
                if !state.is_running {
                    return Err(PoolError::PoolClosed);
                }
                match state.procs.pop_front() {
                    Some(worker) => Some(worker),
                    None => {
                        state.num_procs += 1;
                        None
                    }
                }
            };

            match candidate {
                Some(mut worker) => {
                    if worker.alive() {
                        trace!("acquired idle worker, {} permits left", self.capacity());
                        return Ok(Lease::new(worker, permit, Arc::clone(&self.shared)));
                    }
                    debug!("retiring worker that died while idle");
                    self.shared.state.lock().num_procs -= 1;
                    worker.shutdown().await;
                }
                None => {
                    return match Worker::spawn(&self.shared.settings).await {
                        Ok(worker) => {
                            trace!("spawned worker, {} permits left", self.capacity());
                            Ok(Lease::new(worker, permit, Arc::clone(&self.shared)))
                        }
                        Err(err) => {
                            self.shared.state.lock().num_procs -= 1;
                            Err(err)
                        }
                    };
                }
            }
        }
    }

    /// Check a worker back in: exhausted or dead workers are retired and
    /// replaced lazily, healthy ones go back to the front of the idle
    /// deque. The permit returns in all cases, after the state update.
    async fn release(&self, mut lease: Lease) {
        let mut worker = match lease.worker.take() {
            Some(worker) => worker,
            None => return,
        };

        let keep = worker.alive() && self.shared.state.lock().is_running;
        if keep {
            self.shared.state.lock().procs.push_front(worker);
        } else {
            debug!("retiring worker after {} requests", worker.count());
            self.shared.state.lock().num_procs -= 1;
            worker.shutdown().await;
        }
        // `lease` drops here, returning the permit.
    }
}

/// One worker checked out under one semaphore permit.
///
/// Dropping an unconsumed lease (a cancelled caller) returns the worker
/// synchronously when it is healthy and reaps it on a background task
/// otherwise, so neither the permit nor the child process leaks.
struct Lease {
    worker: Option<Worker>,
    mailbox: Arc<Mailbox>,
    shared: Arc<PoolShared>,
    _permit: OwnedSemaphorePermit,
}

impl Lease {
    fn new(worker: Worker, permit: OwnedSemaphorePermit, shared: Arc<PoolShared>) -> Self {
        let mailbox = worker.mailbox();
        Lease {
            worker: Some(worker),
            mailbox,
            shared,
            _permit: permit,
        }
    }

    fn mailbox(&self) -> Arc<Mailbox> {
        Arc::clone(&self.mailbox)
    }

    async fn send(&mut self, request: &TaskRequest) -> Result<u64, PoolError> {
        match self.worker.as_mut() {
            Some(worker) => worker.send(request).await,
            None => Err(PoolError::WorkerDied),
        }
    }

    async fn readable(&self) -> Result<(), PoolError> {
        match self.worker.as_ref() {
            Some(worker) => worker.readable().await,
            None => Err(PoolError::WorkerDied),
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut worker = match self.worker.take() {
            Some(worker) => worker,
            None => return,
        };

        let alive = worker.alive();
        let mut state = self.shared.state.lock();
        if alive && state.is_running {
            state.procs.push_front(worker);
        } else {
            state.num_procs -= 1;
            drop(state);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { worker.shutdown().await });
            }
            // Without a runtime the child is killed when `worker` drops.
        }
    }
}

/// Handle to one dispatched task; await it via [`Deferred::get`].
pub struct Deferred {
    mailbox: Arc<Mailbox>,
    id: u64,
}

impl Deferred {
    /// Wait for the task's result.
    pub async fn get(self) -> Result<Value, PoolError> {
        collect(&self.mailbox, self.id).await
    }
}

/// Drain and decode the response for `id`.
async fn collect(mailbox: &Mailbox, id: u64) -> Result<Value, PoolError> {
    let payload = mailbox.recv(id).await?;
    let response: TaskResponse =
        serde_json::from_value(payload).map_err(|e| PoolError::Codec(e.to_string()))?;
    response.into_result()
}
