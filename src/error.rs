//! Domain error family.
//!
//! Two tiers, matching the design in `SPEC_FULL.md` §7: a small `OmnipyError` family of
//! expected/recoverable conditions (`PdmError`, `PdmBusyError`, `TransmissionOutOfSyncError`),
//! and a blanket wrapping of anything else under `PdmError::unexpected`.

use std::error::Error as StdError;

/// A precondition, post-condition, or persistence failure raised by the command layer.
///
/// Carries a human-readable reason (surfaced to the caller) and, optionally, the underlying
/// cause (an I/O or serialization failure from a collaborator).
#[derive(Debug, thiserror::Error)]
#[error("{reason}")]
pub struct PdmError {
    reason: String,
    #[source]
    cause: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl PdmError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            cause: None,
        }
    }

    pub fn wrap(reason: impl Into<String>, cause: impl StdError + Send + Sync + 'static) -> Self {
        Self {
            reason: reason.into(),
            cause: Some(Box::new(cause)),
        }
    }

    /// Wraps an arbitrary failure as the generic "Unexpected error" condition described in
    /// §6 of the mutual exclusion wrapper design.
    pub fn unexpected(cause: impl StdError + Send + Sync + 'static) -> Self {
        Self::wrap("Unexpected error", cause)
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// The process-wide command lock was already held by another in-flight operation.
#[derive(Debug, Default, thiserror::Error)]
#[error("pdm is busy")]
pub struct PdmBusyError;

/// The radio link's frame-sequence view has diverged from the pod's.
#[derive(Debug, Default, thiserror::Error)]
#[error("transmission out of sync")]
pub struct TransmissionOutOfSyncError;

/// The `OmnipyError` family: every error a public PDM operation can return.
#[derive(Debug, thiserror::Error)]
pub enum OmnipyError {
    #[error(transparent)]
    Pdm(#[from] PdmError),
    #[error(transparent)]
    Busy(#[from] PdmBusyError),
    #[error(transparent)]
    OutOfSync(#[from] TransmissionOutOfSyncError),
}

impl OmnipyError {
    /// True for `TransmissionOutOfSyncError`, the one member of the family the transaction
    /// engine is expected to recover from internally before it ever reaches a caller.
    pub fn is_out_of_sync(&self) -> bool {
        matches!(self, OmnipyError::OutOfSync(_))
    }
}

