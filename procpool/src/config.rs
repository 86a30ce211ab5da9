//! Pool configuration.

use crate::errors::PoolError;
use std::path::PathBuf;

/// Default worker executable, resolved via `PATH` unless overridden.
pub static DEFAULT_WORKER_PROGRAM: &str = "procpool-worker";

/// Runtime pool settings (validated by [`PoolSettings::try_validate`]).
#[derive(Clone, Debug, SmartDefault)]
pub struct PoolSettings {
    /// Maximum number of concurrent worker processes.
    #[default(num_cpus::get())]
    pub max_procs: usize,

    /// Requests served by one worker before it is recycled; 0 = unlimited.
    pub max_reqs: u64,

    /// Worker executable to spawn.
    #[default(PathBuf::from(DEFAULT_WORKER_PROGRAM))]
    pub worker_path: PathBuf,

    /// Directories handed to each worker as search-path entries.
    pub include: Vec<PathBuf>,
}

impl PoolSettings {
    /// Validate and return runtime settings.
    pub fn try_validate(self) -> Result<Self, PoolError> {
        if self.max_procs == 0 {
            return Err(PoolError::Config(
                "max_procs must be at least 1".to_string(),
            ));
        }
        Ok(self)
    }
}
