//! Error handling helpers.

/// Error chain handling, pinned to a specific implementation.
pub mod prelude_errors {
    pub use anyhow::{anyhow as format_err, bail, ensure, Context, Error, Result as Fallible};
    pub use thiserror::Error as Fail;
}
