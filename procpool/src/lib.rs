//! An asynchronous pool of worker subprocesses.
//!
//! Callers submit named tasks; the pool multiplexes many in-flight
//! requests over a bounded set of child processes, recycling each child
//! after a configurable number of requests. Results come back through
//! direct awaiting (`process`), deferred handles (`defer`), ordered
//! fan-out (`map`), or a producer/consumer pipeline.

#[macro_use]
extern crate log;
#[macro_use]
extern crate serde_derive;
#[macro_use]
extern crate smart_default;

pub mod codec;
pub mod config;
pub mod errors;
pub mod executor;
pub mod mailbox;
pub mod pipeline;
pub mod pool;
pub mod worker;

pub use crate::codec::{Task, TaskKind};
pub use crate::config::PoolSettings;
pub use crate::errors::PoolError;
pub use crate::pipeline::Pipeline;
pub use crate::pool::{Deferred, Pool};
