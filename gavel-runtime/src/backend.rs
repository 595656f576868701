//! The state-machine back end consumed by the applier.
//!
//! The consensus layer does not interpret commands; once a record commits,
//! the applier hands its command to an implementation of [`CommandBackend`]
//! and feeds the result back to the submitter's receipt. The trait is the
//! seam: production wires in the auction store, tests wire in counters, and
//! disabled-backend deployments wire in [`DisabledBackend`].

use async_trait::async_trait;
use bytes::Bytes;
use gavel_core::CommandKind;
use thiserror::Error;

/// A back-end failure. Fatal to the applier: the node logs it and stops
/// rather than skip a committed record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The back end could not be reached.
    #[error("backend unavailable: {reason}")]
    Unavailable {
        /// What went wrong.
        reason: String,
    },
    /// The back end rejected the command.
    #[error("{kind} command rejected: {reason}")]
    Rejected {
        /// The command kind that was rejected.
        kind: CommandKind,
        /// Why it was rejected.
        reason: String,
    },
}

/// Result type for back-end operations.
pub type BackendResult = Result<Option<Bytes>, BackendError>;

/// Executes committed commands against an opaque store.
///
/// The applier invokes this strictly in log order and awaits each call
/// before moving to the next record.
#[async_trait]
pub trait CommandBackend: Send + Sync {
    /// Applies one committed command, returning its result value (if the
    /// operation produces one).
    async fn apply(&self, kind: CommandKind, payload: Bytes) -> BackendResult;
}

/// A back end that does nothing.
///
/// Used when the node runs without a store attached: the applier still
/// advances its cursor and resolves receipts, with an empty result.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledBackend;

#[async_trait]
impl CommandBackend for DisabledBackend {
    async fn apply(&self, _kind: CommandKind, _payload: Bytes) -> BackendResult {
        Ok(None)
    }
}
