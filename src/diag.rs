//! Diagnostic ring log of registry lifecycle events.
//!
//! The ring exists to reconstruct hard-to-reproduce lifecycle bugs after
//! the fact: every registry mutation records an event while the mutex is
//! held, and the most recent events can be serialized together with the
//! current indices on demand.

use std::collections::VecDeque;

use serde::Serialize;

use crate::clock::WallClock;
use crate::id::{CursorId, Namespace};

/// Kind of lifecycle event recorded in the ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum EventKind {
    /// Any attempt to register a cursor.
    RegisterAttempt,
    /// A cursor actually registered.
    RegisterComplete,

    CheckoutAttempt,
    CheckoutComplete,

    /// Caller attempts to check a cursor in. Followed by either
    /// `CheckInCompleteCursorSaved` or events showing the cursor's removal.
    CheckInAttempt,
    CheckInCompleteCursorSaved,

    /// Detaching a cursor for destruction.
    DetachAttempt,
    DetachComplete,
    /// A namespace container emptied and both index entries were erased.
    NamespaceMapErased,

    /// Bracket the critical section of a predicate kill scan.
    PredicateKillAttempt,
    PredicateKillComplete,
    /// A predicate scan detached a cursor it intends to destroy.
    MarkedForDeletionByPredicate,

    /// Any call to the single-cursor kill path.
    KillCursorAttempt,
}

/// One recorded event.
///
/// Timestamps are optional: paths that have not already read the clock do
/// not read it while the registry mutex is held.
#[derive(Clone, Debug, Serialize)]
pub struct LogEvent {
    pub kind: EventKind,
    pub cursor_id: Option<CursorId>,
    pub namespace: Option<Namespace>,
    pub at: Option<WallClock>,
}

/// Fixed-capacity ring of the most recent events. Oldest entries are
/// evicted first.
#[derive(Debug)]
pub struct EventLog {
    events: VecDeque<LogEvent>,
    capacity: usize,
}

impl EventLog {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(
        &mut self,
        kind: EventKind,
        cursor_id: Option<CursorId>,
        namespace: Option<Namespace>,
        at: Option<WallClock>,
    ) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(LogEvent {
            kind,
            cursor_id,
            namespace,
            at,
        });
    }

    pub fn events(&self) -> impl Iterator<Item = &LogEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// One prefix-to-namespace index row.
#[derive(Clone, Debug, Serialize)]
pub struct PrefixMapping {
    pub prefix: u32,
    pub namespace: Namespace,
}

/// Cursor ids currently registered under one namespace.
#[derive(Clone, Debug, Serialize)]
pub struct NamespaceCursors {
    pub namespace: Namespace,
    pub prefix: u32,
    pub cursor_ids: Vec<CursorId>,
}

/// Snapshot of the registry's indices and recent event history.
#[derive(Debug, Serialize)]
pub struct DiagnosticReport {
    pub prefix_to_namespace: Vec<PrefixMapping>,
    pub namespaces: Vec<NamespaceCursors>,
    pub recent_events: Vec<LogEvent>,
}
