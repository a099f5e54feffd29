use std::fmt;

use thiserror::Error;

use crate::id::CursorId;
use crate::opctx::InterruptReason;
use crate::session::SessionId;

/// Which side of a checkout carries a session binding the other lacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMismatch {
    /// The cursor was opened inside a session; the caller runs outside one.
    CursorBound { cursor: SessionId },
    /// The caller runs inside a session; the cursor was opened outside one.
    CallerBound { caller: SessionId },
    /// Both sides are session-bound, to different sessions.
    BothBound { cursor: SessionId, caller: SessionId },
}

impl fmt::Display for SessionMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionMismatch::CursorBound { cursor } => {
                write!(f, "cursor belongs to session {cursor}, caller has no session")
            }
            SessionMismatch::CallerBound { caller } => {
                write!(f, "cursor has no session, caller runs in session {caller}")
            }
            SessionMismatch::BothBound { cursor, caller } => {
                write!(
                    f,
                    "cursor belongs to session {cursor}, caller runs in session {caller}"
                )
            }
        }
    }
}

/// Errors surfaced by the cursor registry.
///
/// Internal invariant violations (a cursor object missing when expected, a
/// double check-in) are programmer errors and panic instead of returning
/// one of these.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CursorError {
    /// No entry for the given namespace and id, or the entry is already
    /// marked for destruction and appears gone to callers.
    #[error("cursor {id} not found")]
    CursorNotFound { id: CursorId },

    /// The cursor is checked out by another operation. Busy cursors are
    /// refused, never queued for.
    #[error("cursor {id} is already in use")]
    CursorInUse { id: CursorId },

    /// Registration attempted after shutdown began.
    #[error("cursor registry is shutting down")]
    ShuttingDown,

    /// The auth predicate denied access to the cursor.
    #[error("unauthorized: {reason}")]
    Unauthorized { reason: String },

    /// The caller's session identity is incompatible with the cursor's.
    #[error("session mismatch: {0}")]
    SessionMismatch(SessionMismatch),

    /// The operation was flagged for interruption; surfaced by
    /// [`OperationContext::check_for_interrupt`](crate::opctx::OperationContext::check_for_interrupt).
    #[error("operation interrupted: {0}")]
    Interrupted(InterruptReason),
}
