//! The cursor registry: registration, checkout, kill, reap, shutdown.
//!
//! One mutex guards every index and every entry field; cursor internals are
//! protected by the pinned-ness invariant (a cursor is owned either by its
//! entry or by exactly one [`PinnedCursor`], never both). The mutex is held
//! only across index manipulation and event-log writes. Cursors are
//! destroyed after the mutex is released.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use uuid::Uuid;

use crate::Result;
use crate::clock::{ClockSource, WallClock};
use crate::config::ManagerConfig;
use crate::cursor::{CursorLifetime, CursorState, CursorType, GenericCursor, RouterCursor};
use crate::diag::{DiagnosticReport, EventKind, EventLog, NamespaceCursors, PrefixMapping};
use crate::error::{CursorError, SessionMismatch};
use crate::id::{CursorId, Namespace};
use crate::opctx::{InterruptReason, OperationContext};
use crate::session::{AuthCheck, OperationKey, SessionId, UserName, is_coauthorized};

/// Open-cursor counts, broken down by type and checkout state. Entries
/// already marked for destruction are not counted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub cursors_single_target: usize,
    pub cursors_multi_target: usize,
    pub cursors_pinned: usize,
}

/// Which idle cursors an enumeration may see.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserMode {
    /// Report every idle cursor (administrative callers).
    IncludeAll,
    /// Report only cursors co-authorized with the caller's users.
    OwnedOnly,
}

/// Record of one registered cursor.
///
/// Holds the cursor object while the cursor is idle; while it is checked
/// out, holds a reference to the operation using it instead. Exactly one of
/// the two is present at any time.
pub struct CursorEntry<C> {
    cursor: Option<C>,
    cursor_type: CursorType,
    lifetime: CursorLifetime,
    last_active: WallClock,
    session_id: Option<SessionId>,
    op_key: Option<OperationKey>,
    originating_client: Uuid,
    authenticated_users: Vec<UserName>,
    operation: Option<Arc<OperationContext>>,
}

impl<C: RouterCursor> CursorEntry<C> {
    fn new(
        cursor: C,
        cursor_type: CursorType,
        lifetime: CursorLifetime,
        last_active: WallClock,
        op_key: Option<OperationKey>,
        originating_client: Uuid,
        authenticated_users: Vec<UserName>,
    ) -> Self {
        let session_id = cursor.session_id();
        Self {
            cursor: Some(cursor),
            cursor_type,
            lifetime,
            last_active,
            session_id,
            op_key,
            originating_client,
            authenticated_users,
            operation: None,
        }
    }

    pub fn cursor_type(&self) -> CursorType {
        self.cursor_type
    }

    pub fn lifetime(&self) -> CursorLifetime {
        self.lifetime
    }

    pub fn last_active(&self) -> WallClock {
        self.last_active
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    pub fn op_key(&self) -> Option<OperationKey> {
        self.op_key
    }

    pub fn originating_client(&self) -> Uuid {
        self.originating_client
    }

    pub fn authenticated_users(&self) -> &[UserName] {
        &self.authenticated_users
    }

    /// True while no operation has the cursor checked out.
    pub fn is_idle(&self) -> bool {
        self.operation.is_none()
    }

    /// The operation currently using the cursor, if any.
    pub fn operation(&self) -> Option<&Arc<OperationContext>> {
        self.operation.as_ref()
    }

    /// True if the cursor is checked out by an operation that has been
    /// interrupted; such an entry is destroyed at its next check-in and
    /// appears gone to callers. Takes the operation's interrupt lock; the
    /// registry mutex is always acquired first.
    pub fn is_kill_pending(&self) -> bool {
        self.operation.as_ref().is_some_and(|op| op.is_interrupted())
    }

    fn set_last_active(&mut self, now: WallClock) {
        self.last_active = now;
    }

    /// Hands the cursor to `opctx` and records the checkout.
    fn release_cursor(&mut self, opctx: Arc<OperationContext>) -> C {
        assert!(self.operation.is_none(), "cursor is already checked out");
        let cursor = self
            .cursor
            .take()
            .expect("idle entry must hold its cursor object");
        self.operation = Some(opctx);
        cursor
    }

    /// Takes the cursor out of an idle entry for destruction.
    fn take_cursor(&mut self) -> C {
        assert!(self.operation.is_none(), "cannot detach a checked-out cursor");
        self.cursor
            .take()
            .expect("idle entry must hold its cursor object")
    }

    /// Puts a checked-out cursor back and clears the using operation.
    fn put_back(&mut self, cursor: C) {
        assert!(self.cursor.is_none(), "cursor checked in twice");
        assert!(
            self.operation.is_some(),
            "cursor checked in but no operation holds it"
        );
        self.cursor = Some(cursor);
        self.operation = None;
    }

    fn to_generic(&self, cursor_id: CursorId, namespace: &Namespace) -> GenericCursor {
        let cursor = self
            .cursor
            .as_ref()
            .expect("descriptor requires an idle entry");
        GenericCursor {
            namespace: namespace.clone(),
            cursor_id,
            session_id: self.session_id,
            op_key: self.op_key,
            originating_client: Some(self.originating_client),
            last_active: Some(self.last_active),
            docs_returned: cursor.docs_returned(),
            no_timeout: cursor.is_no_timeout(),
            originating_command: cursor.originating_command(),
        }
    }
}

/// Entries sharing a namespace, all under one 32-bit id prefix.
struct CursorContainer<C> {
    prefix: u32,
    entries: BTreeMap<CursorId, CursorEntry<C>>,
}

struct RegistryState<C> {
    in_shutdown: bool,
    rng: StdRng,
    // Both index maps gain an entry with a namespace's first cursor and
    // lose it with the last.
    prefix_to_namespace: BTreeMap<u32, Namespace>,
    containers: BTreeMap<Namespace, CursorContainer<C>>,
    log: EventLog,
}

impl<C: RouterCursor> RegistryState<C> {
    fn entry(&self, namespace: &Namespace, cursor_id: CursorId) -> Option<&CursorEntry<C>> {
        self.containers.get(namespace)?.entries.get(&cursor_id)
    }

    fn entry_mut(
        &mut self,
        namespace: &Namespace,
        cursor_id: CursorId,
    ) -> Option<&mut CursorEntry<C>> {
        self.containers
            .get_mut(namespace)?
            .entries
            .get_mut(&cursor_id)
    }

    /// Finds or creates the namespace's container and draws an unused id
    /// under its prefix. Suffix zero and collisions are redrawn.
    fn allocate_id(&mut self, namespace: &Namespace) -> CursorId {
        if !self.containers.contains_key(namespace) {
            let prefix = loop {
                let candidate: u32 = self.rng.random();
                if !self.prefix_to_namespace.contains_key(&candidate) {
                    break candidate;
                }
            };
            self.prefix_to_namespace.insert(prefix, namespace.clone());
            self.containers.insert(
                namespace.clone(),
                CursorContainer {
                    prefix,
                    entries: BTreeMap::new(),
                },
            );
        }

        let container = self
            .containers
            .get_mut(namespace)
            .expect("container exists after insertion");
        loop {
            let suffix: u32 = self.rng.random();
            if suffix == 0 {
                continue;
            }
            let cursor_id = CursorId::from_parts(container.prefix, suffix);
            if !container.entries.contains_key(&cursor_id) {
                return cursor_id;
            }
        }
    }

    /// Erases the entry; drops the container and its prefix mapping when it
    /// was the last one.
    fn remove_entry(
        &mut self,
        namespace: &Namespace,
        cursor_id: CursorId,
    ) -> Option<CursorEntry<C>> {
        let container = self.containers.get_mut(namespace)?;
        let entry = container.entries.remove(&cursor_id)?;
        if container.entries.is_empty() {
            let prefix = container.prefix;
            self.containers.remove(namespace);
            self.prefix_to_namespace.remove(&prefix);
            self.log.record(
                EventKind::NamespaceMapErased,
                Some(cursor_id),
                Some(namespace.clone()),
                None,
            );
        }
        Some(entry)
    }

    fn report(&self) -> DiagnosticReport {
        DiagnosticReport {
            prefix_to_namespace: self
                .prefix_to_namespace
                .iter()
                .map(|(prefix, namespace)| PrefixMapping {
                    prefix: *prefix,
                    namespace: namespace.clone(),
                })
                .collect(),
            namespaces: self
                .containers
                .iter()
                .map(|(namespace, container)| NamespaceCursors {
                    namespace: namespace.clone(),
                    prefix: container.prefix,
                    cursor_ids: container.entries.keys().copied().collect(),
                })
                .collect(),
            recent_events: self.log.events().cloned().collect(),
        }
    }
}

/// Registry of the open cursors on one query-routing node.
///
/// All public operations are thread-safe and non-blocking, with one
/// exception: [`shutdown`](CursorManager::shutdown) waits for concurrently
/// checked-out cursors to be returned.
pub struct CursorManager<C: RouterCursor> {
    clock: Arc<dyn ClockSource>,
    config: ManagerConfig,
    state: Mutex<RegistryState<C>>,
    // Signaled whenever an entry is erased; shutdown waits on it.
    drained: Condvar,
    cursors_timed_out: AtomicU64,
}

impl<C: RouterCursor> CursorManager<C> {
    pub fn new(clock: Arc<dyn ClockSource>) -> Self {
        Self::with_config(clock, ManagerConfig::default())
    }

    pub fn with_config(clock: Arc<dyn ClockSource>, config: ManagerConfig) -> Self {
        let rng = StdRng::from_os_rng();
        Self::build(clock, config, rng)
    }

    /// Deterministic id generation for tests.
    pub fn with_seed(clock: Arc<dyn ClockSource>, config: ManagerConfig, seed: u64) -> Self {
        Self::build(clock, config, StdRng::seed_from_u64(seed))
    }

    fn build(clock: Arc<dyn ClockSource>, config: ManagerConfig, rng: StdRng) -> Self {
        let log = EventLog::with_capacity(config.diagnostic_log_capacity);
        Self {
            clock,
            config,
            state: Mutex::new(RegistryState {
                in_shutdown: false,
                rng,
                prefix_to_namespace: BTreeMap::new(),
                containers: BTreeMap::new(),
                log,
            }),
            drained: Condvar::new(),
            cursors_timed_out: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState<C>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers `cursor` and returns its freshly allocated id.
    ///
    /// The cursor's session binding is snapshotted, as are the operation's
    /// key and client. If the operation carries a deadline, the remaining
    /// budget is stashed on the cursor for later operations. On failure the
    /// cursor is killed before the error is returned.
    pub fn register_cursor(
        &self,
        opctx: &OperationContext,
        mut cursor: C,
        namespace: Namespace,
        cursor_type: CursorType,
        lifetime: CursorLifetime,
        authenticated_users: Vec<UserName>,
    ) -> Result<CursorId> {
        let now = self.clock.now();
        if let Some(budget) = opctx.remaining_budget(now) {
            cursor.stash_remaining_budget(budget);
        }

        let mut state = self.lock();
        state.log.record(
            EventKind::RegisterAttempt,
            None,
            Some(namespace.clone()),
            Some(now),
        );
        if state.in_shutdown {
            drop(state);
            cursor.kill();
            return Err(CursorError::ShuttingDown);
        }

        let cursor_id = state.allocate_id(&namespace);
        let entry = CursorEntry::new(
            cursor,
            cursor_type,
            lifetime,
            now,
            opctx.op_key(),
            opctx.client_id(),
            authenticated_users,
        );
        let container = state
            .containers
            .get_mut(&namespace)
            .expect("container exists after id allocation");
        let previous = container.entries.insert(cursor_id, entry);
        assert!(previous.is_none(), "allocated cursor id must be unused");
        state.log.record(
            EventKind::RegisterComplete,
            Some(cursor_id),
            Some(namespace.clone()),
            Some(now),
        );
        drop(state);

        tracing::debug!("registered cursor {} on {}", cursor_id, namespace);
        Ok(cursor_id)
    }

    /// Moves the cursor to the pinned state and transfers ownership to the
    /// returned handle. Only one operation may hold a given cursor at a
    /// time; a busy cursor is refused, not queued for.
    ///
    /// `auth_checker` is called with the users recorded at registration and
    /// its verdict is propagated. With [`AuthCheck::CheckSession`] the
    /// caller's session must match the cursor's binding. Checkout updates
    /// the cursor's last-active time and attaches it to `opctx`.
    pub fn check_out_cursor(
        &self,
        namespace: &Namespace,
        cursor_id: CursorId,
        opctx: &Arc<OperationContext>,
        auth_checker: impl FnOnce(&[UserName]) -> Result<()>,
        check_session: AuthCheck,
    ) -> Result<PinnedCursor<'_, C>> {
        let now = self.clock.now();
        let mut state = self.lock();
        state.log.record(
            EventKind::CheckoutAttempt,
            Some(cursor_id),
            Some(namespace.clone()),
            Some(now),
        );

        let Some(entry) = state.entry_mut(namespace, cursor_id) else {
            return Err(CursorError::CursorNotFound { id: cursor_id });
        };

        if !entry.is_idle() {
            // A kill-pending cursor is logically gone.
            return Err(if entry.is_kill_pending() {
                CursorError::CursorNotFound { id: cursor_id }
            } else {
                CursorError::CursorInUse { id: cursor_id }
            });
        }

        auth_checker(entry.authenticated_users())?;

        if check_session == AuthCheck::CheckSession {
            check_session_access(opctx.session_id(), entry.session_id())?;
        }

        let mut cursor = entry.release_cursor(Arc::clone(opctx));
        entry.set_last_active(now);
        state.log.record(
            EventKind::CheckoutComplete,
            Some(cursor_id),
            Some(namespace.clone()),
            Some(now),
        );
        drop(state);

        cursor.attach_operation(opctx);
        Ok(PinnedCursor {
            manager: self,
            cursor: Some(cursor),
            namespace: namespace.clone(),
            cursor_id,
        })
    }

    /// Transfers ownership of a pinned cursor back to the registry.
    ///
    /// Exhausted cursors, and cursors whose entry became kill-pending while
    /// they were out, are destroyed after the mutex is released; otherwise
    /// the cursor is parked for the next checkout.
    ///
    /// Private on purpose: callers check cursors in through [`PinnedCursor`].
    fn check_in_cursor(
        &self,
        mut cursor: C,
        namespace: &Namespace,
        cursor_id: CursorId,
        cursor_state: CursorState,
    ) {
        let now = self.clock.now();
        cursor.detach_operation();

        let mut state = self.lock();
        state.log.record(
            EventKind::CheckInAttempt,
            Some(cursor_id),
            Some(namespace.clone()),
            Some(now),
        );

        let Some(entry) = state.entry_mut(namespace, cursor_id) else {
            let report = state.report();
            tracing::error!(
                report = %serde_json::to_string(&report).unwrap_or_default(),
                "cursor {} checked in on {} but no entry exists",
                cursor_id,
                namespace
            );
            panic!("cursor {cursor_id} checked in on {namespace} but no entry exists");
        };
        assert!(
            !entry.is_idle(),
            "cursor {cursor_id} checked in but its entry is not pinned"
        );

        if cursor_state == CursorState::Exhausted || entry.is_kill_pending() {
            state
                .remove_entry(namespace, cursor_id)
                .expect("entry was just found");
            drop(state);
            self.drained.notify_all();
            cursor.kill();
            tracing::debug!("destroyed cursor {} on {} at check-in", cursor_id, namespace);
            return;
        }

        entry.put_back(cursor);
        entry.set_last_active(now);
        state.log.record(
            EventKind::CheckInCompleteCursorSaved,
            Some(cursor_id),
            Some(namespace.clone()),
            Some(now),
        );
    }

    /// Kills the given cursor. An idle cursor is destroyed before the call
    /// returns; a checked-out cursor has its operation interrupted and is
    /// destroyed when the worker checks it back in.
    ///
    /// A thread currently using the cursor must not call this on it; it
    /// should return the cursor exhausted instead.
    pub fn kill_cursor(&self, namespace: &Namespace, cursor_id: CursorId) -> Result<()> {
        let mut state = self.lock();
        state.log.record(
            EventKind::KillCursorAttempt,
            Some(cursor_id),
            Some(namespace.clone()),
            None,
        );

        let Some(entry) = state.entry_mut(namespace, cursor_id) else {
            return Err(CursorError::CursorNotFound { id: cursor_id });
        };

        if let Some(operation) = entry.operation() {
            if entry.is_kill_pending() {
                // Already marked; gone as far as callers can tell.
                return Err(CursorError::CursorNotFound { id: cursor_id });
            }
            operation.interrupt(InterruptReason::CursorKilled);
            drop(state);
            tracing::debug!(
                "marked pinned cursor {} on {} for destruction",
                cursor_id,
                namespace
            );
            return Ok(());
        }

        self.detach_and_kill(state, namespace, cursor_id);
        tracing::debug!("killed idle cursor {} on {}", cursor_id, namespace);
        Ok(())
    }

    /// Detach-and-kill: erases the entry of an idle cursor while holding
    /// the mutex, releases it, then destroys the cursor.
    fn detach_and_kill(
        &self,
        mut state: MutexGuard<'_, RegistryState<C>>,
        namespace: &Namespace,
        cursor_id: CursorId,
    ) {
        state.log.record(
            EventKind::DetachAttempt,
            Some(cursor_id),
            Some(namespace.clone()),
            None,
        );
        let mut entry = state
            .remove_entry(namespace, cursor_id)
            .expect("detach requires a registered cursor");
        state.log.record(
            EventKind::DetachComplete,
            Some(cursor_id),
            Some(namespace.clone()),
            None,
        );
        drop(state);
        self.drained.notify_all();

        let mut cursor = entry.take_cursor();
        cursor.kill();
    }

    /// Kills every cursor the predicate matches, in one critical section.
    /// Idle matches are destroyed after the mutex is released; checked-out
    /// matches are interrupted and destroyed at their next check-in.
    /// Returns the number of cursors affected.
    ///
    /// Predicates must be cheap and non-blocking: the registry mutex is
    /// held across the whole scan.
    pub fn kill_cursors_satisfying(
        &self,
        pred: impl FnMut(CursorId, &CursorEntry<C>) -> bool,
    ) -> usize {
        self.kill_matching(InterruptReason::CursorKilled, pred)
    }

    fn kill_matching(
        &self,
        reason: InterruptReason,
        mut pred: impl FnMut(CursorId, &CursorEntry<C>) -> bool,
    ) -> usize {
        let mut state = self.lock();
        state
            .log
            .record(EventKind::PredicateKillAttempt, None, None, None);

        let mut killed = 0usize;
        let mut doomed: Vec<CursorEntry<C>> = Vec::new();

        let RegistryState {
            containers,
            prefix_to_namespace,
            log,
            ..
        } = &mut *state;

        let mut emptied: Vec<Namespace> = Vec::new();
        for (namespace, container) in containers.iter_mut() {
            let matched: Vec<CursorId> = container
                .entries
                .iter()
                .filter(|&(id, entry)| pred(*id, entry))
                .map(|(id, _)| *id)
                .collect();

            for cursor_id in matched {
                killed += 1;
                let entry = container
                    .entries
                    .get_mut(&cursor_id)
                    .expect("matched id is present");
                if let Some(operation) = entry.operation() {
                    operation.interrupt(reason);
                } else {
                    let entry = container
                        .entries
                        .remove(&cursor_id)
                        .expect("matched id is present");
                    log.record(
                        EventKind::MarkedForDeletionByPredicate,
                        Some(cursor_id),
                        Some(namespace.clone()),
                        None,
                    );
                    doomed.push(entry);
                }
            }

            if container.entries.is_empty() {
                prefix_to_namespace.remove(&container.prefix);
                log.record(
                    EventKind::NamespaceMapErased,
                    None,
                    Some(namespace.clone()),
                    None,
                );
                emptied.push(namespace.clone());
            }
        }
        for namespace in emptied {
            containers.remove(&namespace);
        }

        state
            .log
            .record(EventKind::PredicateKillComplete, None, None, None);
        drop(state);

        if !doomed.is_empty() {
            self.drained.notify_all();
        }
        for mut entry in doomed {
            let mut cursor = entry.take_cursor();
            cursor.kill();
        }
        killed
    }

    /// Reaper entry point: kills idle mortal cursors whose last activity is
    /// at or before `cutoff`. Checked-out cursors are never reaped; an
    /// in-progress operation defines activity.
    pub fn kill_mortal_cursors_inactive_since(&self, cutoff: WallClock) -> usize {
        let killed = self.kill_cursors_satisfying(|_, entry| {
            entry.lifetime() == CursorLifetime::Mortal
                && entry.is_idle()
                && entry.last_active() <= cutoff
        });
        if killed > 0 {
            tracing::debug!("timed out {} inactive cursors", killed);
        }
        killed
    }

    /// Kills every cursor registered at the time of the call. Registrations
    /// racing with the call may survive; use
    /// [`shutdown`](CursorManager::shutdown) for a hard stop.
    pub fn kill_all_cursors(&self) -> usize {
        self.kill_cursors_satisfying(|_, _| true)
    }

    /// Kills every cursor bound to one of the given sessions.
    pub fn kill_cursors_for_sessions(&self, sessions: &BTreeSet<SessionId>) -> usize {
        self.kill_cursors_satisfying(|_, entry| {
            entry.session_id().is_some_and(|lsid| sessions.contains(&lsid))
        })
    }

    /// Kills all cursors, refuses further registrations, and blocks until
    /// every checked-out cursor has been returned and destroyed.
    ///
    /// The wait is cooperative: interrupted workers observe the flag at
    /// their next check and hand their cursors back.
    pub fn shutdown(&self) {
        {
            let mut state = self.lock();
            state.in_shutdown = true;
        }
        let killed = self.kill_matching(InterruptReason::Shutdown, |_, _| true);
        tracing::debug!("shutdown killed {} cursors", killed);

        let mut state = self.lock();
        while !state.containers.is_empty() {
            state = self
                .drained
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
        drop(state);
        tracing::debug!("cursor registry drained");
    }

    /// Computes the reap cutoff from the configured timeout, kills inactive
    /// mortal cursors, and adds them to the timed-out counter. Meant to be
    /// called periodically by an external reaper.
    pub fn reap_inactive(&self) -> usize {
        let cutoff = self
            .clock
            .now()
            .saturating_sub(Duration::from_millis(self.config.cursor_timeout_ms));
        let killed = self.kill_mortal_cursors_inactive_since(cutoff);
        self.increment_cursors_timed_out(killed as u64);
        killed
    }

    /// Runs the auth predicate over the cursor's user snapshot without
    /// touching checkout state, and propagates its verdict.
    pub fn check_auth_for_kill_cursors(
        &self,
        namespace: &Namespace,
        cursor_id: CursorId,
        auth_checker: impl FnOnce(&[UserName]) -> Result<()>,
    ) -> Result<()> {
        let state = self.lock();
        let entry = state
            .entry(namespace, cursor_id)
            .ok_or(CursorError::CursorNotFound { id: cursor_id })?;
        auth_checker(entry.authenticated_users())
    }

    pub fn stats(&self) -> Stats {
        let state = self.lock();
        let mut stats = Stats::default();
        for container in state.containers.values() {
            for entry in container.entries.values() {
                if entry.is_kill_pending() {
                    continue;
                }
                match entry.cursor_type() {
                    CursorType::SingleTarget => stats.cursors_single_target += 1,
                    CursorType::MultiTarget => stats.cursors_multi_target += 1,
                }
                if !entry.is_idle() {
                    stats.cursors_pinned += 1;
                }
            }
        }
        stats
    }

    /// Adds the session of every registered cursor to `out`.
    pub fn append_active_sessions(&self, out: &mut BTreeSet<SessionId>) {
        let state = self.lock();
        for container in state.containers.values() {
            for entry in container.entries.values() {
                if let Some(lsid) = entry.session_id() {
                    out.insert(lsid);
                }
            }
        }
    }

    /// Descriptors for the idle cursors. [`UserMode::OwnedOnly`] restricts
    /// the result to cursors co-authorized with `caller_users`.
    pub fn get_idle_cursors(
        &self,
        user_mode: UserMode,
        caller_users: &[UserName],
    ) -> Vec<GenericCursor> {
        let state = self.lock();
        let mut cursors = Vec::new();
        for (namespace, container) in state.containers.iter() {
            for (cursor_id, entry) in container.entries.iter() {
                if !entry.is_idle() {
                    continue;
                }
                if user_mode == UserMode::OwnedOnly
                    && !is_coauthorized(caller_users, entry.authenticated_users())
                {
                    continue;
                }
                cursors.push(entry.to_generic(*cursor_id, namespace));
            }
        }
        cursors
    }

    /// Ids of all open cursors bound to the given session.
    pub fn get_cursors_for_session(&self, session: SessionId) -> BTreeSet<CursorId> {
        let state = self.lock();
        let mut out = BTreeSet::new();
        for container in state.containers.values() {
            for (cursor_id, entry) in container.entries.iter() {
                if entry.is_kill_pending() {
                    continue;
                }
                if entry.session_id() == Some(session) {
                    out.insert(*cursor_id);
                }
            }
        }
        out
    }

    /// Ids of all open cursors whose operation key is in `keys`.
    pub fn get_cursors_for_op_keys(&self, keys: &[OperationKey]) -> BTreeSet<CursorId> {
        let keys: BTreeSet<OperationKey> = keys.iter().copied().collect();
        let state = self.lock();
        let mut out = BTreeSet::new();
        for container in state.containers.values() {
            for (cursor_id, entry) in container.entries.iter() {
                if entry.is_kill_pending() {
                    continue;
                }
                if entry.op_key().is_some_and(|key| keys.contains(&key)) {
                    out.insert(*cursor_id);
                }
            }
        }
        out
    }

    /// Namespace lookup from an id's prefix alone, for the close-by-id path
    /// that carries no namespace. The cursor itself need not exist; the
    /// result is `None` once no cursor holds the prefix.
    pub fn get_namespace_for_cursor_id(&self, cursor_id: CursorId) -> Option<Namespace> {
        self.lock()
            .prefix_to_namespace
            .get(&cursor_id.prefix())
            .cloned()
    }

    pub fn cursors_timed_out(&self) -> u64 {
        self.cursors_timed_out.load(Ordering::Relaxed)
    }

    pub fn increment_cursors_timed_out(&self, inc: u64) {
        self.cursors_timed_out.fetch_add(inc, Ordering::Relaxed);
    }

    /// Snapshot of the registry's indices and the recent event log.
    pub fn diagnostic_report(&self) -> DiagnosticReport {
        self.lock().report()
    }
}

impl<C: RouterCursor> Drop for CursorManager<C> {
    fn drop(&mut self) {
        // Outstanding pins borrow the manager, so every remaining entry is
        // idle; release their remote resources.
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        for container in state.containers.values_mut() {
            for entry in container.entries.values_mut() {
                if let Some(cursor) = entry.cursor.as_mut() {
                    cursor.kill();
                }
            }
        }
    }
}

/// A cursor opened inside a session may only be used from that session, and
/// a sessionless cursor only from outside one.
fn check_session_access(
    caller: Option<SessionId>,
    cursor: Option<SessionId>,
) -> Result<()> {
    match (cursor, caller) {
        (None, None) => Ok(()),
        (Some(c), Some(k)) if c == k => Ok(()),
        (Some(c), Some(k)) => Err(CursorError::SessionMismatch(SessionMismatch::BothBound {
            cursor: c,
            caller: k,
        })),
        (Some(c), None) => Err(CursorError::SessionMismatch(SessionMismatch::CursorBound {
            cursor: c,
        })),
        (None, Some(k)) => Err(CursorError::SessionMismatch(SessionMismatch::CallerBound {
            caller: k,
        })),
    }
}

/// Exclusive checkout of a registered cursor.
///
/// Owns the cursor until it is returned with
/// [`return_cursor`](PinnedCursor::return_cursor). Dropping the handle
/// without an explicit return checks the cursor back in exhausted, so an
/// early exit destroys the cursor rather than leaking its checkout.
pub struct PinnedCursor<'a, C: RouterCursor> {
    manager: &'a CursorManager<C>,
    cursor: Option<C>,
    namespace: Namespace,
    cursor_id: CursorId,
}

impl<C: RouterCursor> PinnedCursor<'_, C> {
    pub fn cursor_id(&self) -> CursorId {
        self.cursor_id
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Hands the cursor back to the registry. `Exhausted` destroys it;
    /// `NotExhausted` parks it for the next checkout.
    pub fn return_cursor(mut self, cursor_state: CursorState) {
        let cursor = self.cursor.take().expect("pinned handle owns its cursor");
        self.manager
            .check_in_cursor(cursor, &self.namespace, self.cursor_id, cursor_state);
    }

    /// Descriptor for the pinned cursor. Registry-only fields (last-active,
    /// originating client, operation key) are unset.
    pub fn to_generic_cursor(&self) -> GenericCursor {
        let cursor = self.cursor.as_ref().expect("pinned handle owns its cursor");
        GenericCursor {
            namespace: self.namespace.clone(),
            cursor_id: self.cursor_id,
            session_id: cursor.session_id(),
            op_key: None,
            originating_client: None,
            last_active: None,
            docs_returned: cursor.docs_returned(),
            no_timeout: cursor.is_no_timeout(),
            originating_command: cursor.originating_command(),
        }
    }
}

impl<C: RouterCursor> Deref for PinnedCursor<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.cursor.as_ref().expect("pinned handle owns its cursor")
    }
}

impl<C: RouterCursor> DerefMut for PinnedCursor<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        self.cursor.as_mut().expect("pinned handle owns its cursor")
    }
}

impl<C: RouterCursor> fmt::Debug for PinnedCursor<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedCursor")
            .field("cursor_id", &self.cursor_id)
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl<C: RouterCursor> Drop for PinnedCursor<'_, C> {
    fn drop(&mut self) {
        if let Some(cursor) = self.cursor.take() {
            self.manager.check_in_cursor(
                cursor,
                &self.namespace,
                self.cursor_id,
                CursorState::Exhausted,
            );
        }
    }
}
