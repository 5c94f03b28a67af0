//! Fatal error definitions.
//!
//! Three kinds of conditions exist in the simulator: invariant violations
//! (fatal, modeled here), recoverable micro-architectural events (cache
//! misses, full buffers — ordinary return values, never errors), and
//! mispredictions (which drive the recovery machinery). Only the first kind
//! reaches this type. A [`FatalError`] unwinds through the stage functions
//! via `?` to the sim driver, which dumps statistics and exits with
//! [`FATAL_EXIT_CODE`].

use thiserror::Error;

use super::types::{Counter, ProcId};

/// Process exit code used for fatal invariant violations.
pub const FATAL_EXIT_CODE: i32 = 15;

/// A condition the simulator cannot recover from.
#[derive(Debug, Error)]
pub enum FatalError {
    /// A micro-architectural invariant was violated (count drift, state
    /// mismatch, double free, type-mask mismatch, ...).
    #[error("core {proc_id}: invariant violated: {msg}")]
    Invariant {
        /// Core on which the violation was detected.
        proc_id: ProcId,
        /// Description of the violated invariant.
        msg: String,
    },

    /// The forward-progress watchdog fired: a core retired nothing for
    /// longer than the configured limit.
    #[error(
        "core {proc_id}: no forward progress since cycle {last_progress} \
         (cycle {cycle}); ROB head: {rob_head}"
    )]
    ForwardProgress {
        /// Core that stopped making progress.
        proc_id: ProcId,
        /// Cycle of the last observed retirement.
        last_progress: Counter,
        /// Cycle at which the watchdog fired.
        cycle: Counter,
        /// Description of the op blocking the ROB head, or a note that the
        /// ROB is empty.
        rob_head: String,
    },

    /// A parameter value or combination was rejected.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An output file (stats dump, pipeview trace) could not be written.
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used by every fallible simulator function.
pub type SimResult<T> = Result<T, FatalError>;

/// Returns a [`FatalError::Invariant`] from the enclosing function.
#[macro_export]
macro_rules! fatal {
    ($proc_id:expr, $($arg:tt)*) => {
        return Err($crate::common::FatalError::Invariant {
            proc_id: $proc_id,
            msg: format!($($arg)*),
        })
    };
}

/// Checks a micro-architectural invariant, failing fatally if it does not
/// hold.
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $proc_id:expr, $($arg:tt)*) => {
        if !$cond {
            $crate::fatal!($proc_id, $($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(x: u32) -> SimResult<u32> {
        crate::ensure!(x < 10, 0, "x out of range: {x}");
        Ok(x * 2)
    }

    #[test]
    fn test_ensure_passes() {
        assert_eq!(check(4).ok(), Some(8));
    }

    #[test]
    fn test_ensure_fails_with_message() {
        let err = check(11).unwrap_err();
        assert!(err.to_string().contains("x out of range: 11"));
    }
}
