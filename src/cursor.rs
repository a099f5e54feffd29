//! The cursor-object seam and its descriptor types.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::WallClock;
use crate::id::{CursorId, Namespace};
use crate::opctx::OperationContext;
use crate::session::{OperationKey, SessionId};

/// Whether a cursor merges results from one remote shard or several.
/// Affects stats reporting only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CursorType {
    SingleTarget,
    MultiTarget,
}

/// Whether the inactivity reaper may destroy an idle cursor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CursorLifetime {
    /// Reapable after the configured inactivity window.
    Mortal,
    /// Never reaped; destroyed only by exhaustion, kill, or shutdown.
    Immortal,
}

/// State a cursor is checked back in with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CursorState {
    NotExhausted,
    Exhausted,
}

/// Interface the registry requires of the cursor object itself.
///
/// The registry moves ownership of the cursor between its entry table and
/// the pinned handle; it never iterates results. Implementations own the
/// shard connections and merge logic.
pub trait RouterCursor: Send + 'static {
    /// Logical session the cursor was opened under, if any. Read once at
    /// registration.
    fn session_id(&self) -> Option<SessionId> {
        None
    }

    /// Documents already returned to the client.
    fn docs_returned(&self) -> u64 {
        0
    }

    /// True if the client asked that the cursor never time out.
    fn is_no_timeout(&self) -> bool {
        false
    }

    /// The command that opened the cursor, for diagnostics.
    fn originating_command(&self) -> Option<serde_json::Value> {
        None
    }

    /// Store the remaining per-operation time budget carried over from the
    /// originating command, for later operations on this cursor.
    fn stash_remaining_budget(&mut self, _budget: Duration) {}

    /// Called when the cursor is handed to an operation at checkout.
    fn attach_operation(&mut self, _opctx: &Arc<OperationContext>) {}

    /// Called when the cursor is taken back from an operation at check-in.
    fn detach_operation(&mut self) {}

    /// Release any remote resources the cursor holds. Idempotent; invoked
    /// before the cursor is dropped.
    fn kill(&mut self) {}
}

/// Redacted, enumeration-friendly description of a registered cursor.
///
/// Registry-side enumerations fill every field; a descriptor taken from a
/// pinned handle leaves the fields only the registry knows unset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenericCursor {
    pub namespace: Namespace,
    pub cursor_id: CursorId,
    pub session_id: Option<SessionId>,
    pub op_key: Option<OperationKey>,
    pub originating_client: Option<Uuid>,
    pub last_active: Option<WallClock>,
    pub docs_returned: u64,
    pub no_timeout: bool,
    pub originating_command: Option<serde_json::Value>,
}
