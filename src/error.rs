//! Crate error types.

use thiserror::Error;

use crate::actions::ConflictReport;

/// Builds an [`Error::InvariantViolation`] carrying the source location of
/// the check that failed.
macro_rules! invariant_error {
    // Single string version
    ($msg:expr) => {
        $crate::Error::InvariantViolation {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        $crate::Error::InvariantViolation {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

pub(crate) use invariant_error;

/// The generic Error type covering all failures this library can return.
///
/// # Error Categories
///
/// ## Fatal programming errors
/// - [`Error::InvariantViolation`] - Wrong-thread scope close, stack
///   mismatch, level-ordering violation, or unexpected scheduler state.
///   These indicate a bug in the stimulus or in the core itself and are
///   never recovered.
///
/// ## Stimulus failures
/// - [`Error::Failed`] - A stimulus thread body returned an error.
/// - [`Error::Panicked`] - A stimulus thread body panicked; the payload
///   message is preserved.
///
/// ## Post-hoc detection
/// - [`Error::Conflict`] - Multi-writer or peek-ordering violations found
///   at a timestep boundary, with the call sites of the offending actions.
///
/// ## Synchronization
/// - [`Error::LockError`] - A mutex or condvar was poisoned.
#[derive(Error, Debug)]
pub enum Error {
    /// A core ordering or lifecycle invariant was broken.
    ///
    /// The message names the violated invariant; `file`/`line` point at the
    /// check inside this crate that detected it.
    #[error("invariant violation: {message} ({file}:{line})")]
    InvariantViolation {
        /// Description of the violated invariant.
        message: String,
        /// Source file of the failed check.
        file: &'static str,
        /// Source line of the failed check.
        line: u32,
    },

    /// A stimulus thread body reported a failure.
    #[error("test failure: {0}")]
    Failed(String),

    /// A stimulus thread body panicked.
    #[error("stimulus thread panicked: {0}")]
    Panicked(String),

    /// Conflicting signal accesses were detected at a timestep boundary.
    #[error("{0}")]
    Conflict(ConflictReport),

    /// Spawning the OS thread backing a stimulus thread failed.
    #[error("os thread spawn failed: {0}")]
    Spawn(std::io::Error),

    /// A lock or condvar used by the scheduler was poisoned.
    #[error("synchronization failure: {0}")]
    LockError(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
