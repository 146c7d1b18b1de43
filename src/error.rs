//! Error taxonomy for the hard subsystem.
//!
//! Every fallible entry point in this crate returns [`Result`]. The variants mirror the
//! taxonomy of invariant violation, numerical divergence, resource overrun and I/O failure;
//! callers that need to distinguish "abort the step" from "this was corrected in place" should
//! match on [`Error`] rather than on the formatted message.

use thiserror::Error;

/// Catch-all error for the hard subsystem.
#[derive(Debug, Error)]
pub enum Error {
    /// One of `INV-M`, `INV-C`, `INV-R` or a `checkConsistence`-style mismatch was violated and
    /// no well-defined correction applies.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// `|dE_SD| > energy_error_max` or the AR inner step count exceeded `step_count_max`.
    #[error("energy budget exceeded: {0}")]
    EnergyBudgetExceeded(String),

    /// An array grew past `ARRAY_ALLOW_LIMIT`.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// A parameter-block read ran out of input before finishing.
    #[error("persistence record truncated: only {got} bytes available before end of input")]
    PersistenceTruncated {
        /// Number of bytes actually consumed before the input ran out.
        got: usize,
    },

    /// Error that does not originate from this crate (caller-supplied glue on the tree/soft
    /// side, which is out of scope here).
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Convenience alias for this crate's fallible operations.
pub type Result<T> = std::result::Result<T, Error>;
