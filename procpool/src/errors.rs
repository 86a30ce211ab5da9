//! Error taxonomy for the pool, its mailboxes, and pipelines.

use commons::prelude_errors::*;

/// Errors surfaced by pool operations.
///
/// `TaskFailure` is local to one request and leaves its worker healthy.
/// `WorkerDied`, `Protocol` and `Codec` condemn the worker that produced
/// them; its pending requests all fail and the pool replaces it.
#[derive(Debug, Fail, Eq, PartialEq)]
pub enum PoolError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("pool has been shut down")]
    PoolClosed,
    #[error("worker exited with a request outstanding")]
    WorkerDied,
    #[error("failed to start worker process: {0}")]
    Spawn(String),
    #[error("task failed on the worker: {0}")]
    TaskFailure(String),
    #[error("protocol violation: no slot for response id {0}")]
    Protocol(u64),
    #[error("frame codec: {0}")]
    Codec(String),
    #[error("pipeline has been shut down")]
    PipelineClosed,
}
