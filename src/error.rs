//! Kernel error taxonomy.
//!
//! Everything the kernel can refuse to do is expressed through [`Error`].
//! Member hooks are written by collaborators and may fail for arbitrary
//! reasons; those failures travel through the [`Error::Hook`] variant and are
//! rethrown from `Simulation::run()` once the active priority bucket drains.

use crate::id::{GoodId, MemberId};

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds surfaced by the simulation kernel.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A non-negative bundle would have received a negative quantity.
    #[error("good [{good}] assigned illegal negative value {value} in Bundle")]
    Negativity { good: GoodId, value: f64 },

    /// Commit/abort without an open transaction, or `end_encompassing` with
    /// outstanding nested begins.
    #[error("no matching transaction: {0}")]
    NoTransaction(&'static str),

    /// A typed handle conversion failed at runtime.
    #[error("member {id} is not of the requested type")]
    InvalidCast { id: MemberId },

    /// An id lookup failed, or a lock operation referenced an absent member.
    #[error("member {id} not found")]
    NotFound { id: MemberId },

    /// The operation requires a simulation, but the member has been removed
    /// or was never inserted.
    #[error("action requires a simulation but the member does not belong to one")]
    NoSimulation,

    /// `MemberLock::transfer` between locks with different mode or state.
    #[error("lock transfer failed: recipient and source have different lock states")]
    LockMismatch,

    /// `lock()` on a held lock, or `unlock()` on a released one.
    #[error("lock operation invalid in current state: {0}")]
    LockInvalidState(&'static str),

    /// Operation not valid for the object's current state (prediction on a
    /// noninformative belief, `run()` re-entry, thread-count change during a
    /// run, ...).
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// A restricted draw could not produce an admissible sample within the
    /// allowed number of attempts.
    #[error("draw failure: {0}")]
    DrawFailure(String),

    /// `gibbs_initialize` failed to reach the admissible region.
    #[error("constraint failure: {0}")]
    ConstraintFailure(String),

    /// Input sizes or values out of contract.
    #[error("domain error: {0}")]
    Domain(String),

    /// A member hook failed during a stage; carried out of `run()`.
    #[error("member hook failed: {0}")]
    Hook(#[source] anyhow::Error),
}

impl Error {
    /// True for the two sampler-failure kinds, which callers commonly retry
    /// or downgrade together.
    pub fn is_draw_failure(&self) -> bool {
        matches!(self, Error::DrawFailure(_) | Error::ConstraintFailure(_))
    }
}
