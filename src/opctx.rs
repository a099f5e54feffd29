//! Request-scoped operation context workers hand to the registry.

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use uuid::Uuid;

use crate::clock::WallClock;
use crate::error::CursorError;
use crate::session::{OperationKey, SessionId};

/// Why an operation was flagged for interruption.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterruptReason {
    /// A cursor the operation has checked out was killed.
    CursorKilled,
    /// The registry is shutting down.
    Shutdown,
}

impl fmt::Display for InterruptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterruptReason::CursorKilled => write!(f, "cursor killed"),
            InterruptReason::Shutdown => write!(f, "shutdown in progress"),
        }
    }
}

/// Context of one in-flight client operation.
///
/// While an operation has a cursor checked out, the registry keeps a
/// reference to its context so an administrative kill can interrupt it.
/// Interruption is cooperative: the worker observes the flag at its next
/// [`check_for_interrupt`](OperationContext::check_for_interrupt) call,
/// nothing is preempted. The owning worker must check its cursor back in
/// before the request ends; the registry asserts on that contract.
#[derive(Debug)]
pub struct OperationContext {
    client_id: Uuid,
    session_id: Option<SessionId>,
    op_key: Option<OperationKey>,
    deadline: Option<WallClock>,
    // Interrupt slot. Lock order: registry mutex first, then this lock,
    // never the reverse.
    interrupt: Mutex<Option<InterruptReason>>,
}

impl OperationContext {
    pub fn new(client_id: Uuid) -> Self {
        Self {
            client_id,
            session_id: None,
            op_key: None,
            deadline: None,
            interrupt: Mutex::new(None),
        }
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_op_key(mut self, op_key: OperationKey) -> Self {
        self.op_key = Some(op_key);
        self
    }

    pub fn with_deadline(mut self, deadline: WallClock) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    pub fn op_key(&self) -> Option<OperationKey> {
        self.op_key
    }

    pub fn deadline(&self) -> Option<WallClock> {
        self.deadline
    }

    /// Remaining time budget before the deadline, if one was set. Zero once
    /// the deadline has passed.
    pub fn remaining_budget(&self, now: WallClock) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Flag the operation as interrupted. The first reason wins; later
    /// calls keep it.
    pub fn interrupt(&self, reason: InterruptReason) {
        let mut slot = self.interrupt.lock().unwrap_or_else(|e| e.into_inner());
        slot.get_or_insert(reason);
    }

    pub fn interrupt_reason(&self) -> Option<InterruptReason> {
        *self.interrupt.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt_reason().is_some()
    }

    /// Worker-side suspension-point check. Returns the interruption as an
    /// error once the operation has been flagged.
    pub fn check_for_interrupt(&self) -> Result<(), CursorError> {
        match self.interrupt_reason() {
            Some(reason) => Err(CursorError::Interrupted(reason)),
            None => Ok(()),
        }
    }
}
