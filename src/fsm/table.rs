use super::{EventKind, SessionState};

use super::EventKind::*;
use self::Handler as H;

/// Pool interaction contract of a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerClass {
    /// Nothing to do
    NoOp,
    /// Runs on the pinned connection, which stays pinned
    UsePinned,
    /// Borrows a connection, runs, and returns it within the same call
    BorrowAndReturn,
    /// Borrows a connection and pins it once the operation succeeded
    FetchThenPin,
    /// Runs on the pinned connection, then returns it to the pool (or destroys it on error)
    ReleaseAfterOp,
    /// Changes session flags on the pinned connection
    KeepPinned,
    /// Event is invalid in this state
    Forbidden,
}

/// Handler selected by a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    Noop,
    Forbidden,
    QueryPooled,
    QueryAttached,
    BeginAttached,
    BeginFetch,
    CommitOrRollbackAttached,
    CommitOrRollbackRelease,
    DisableAutoCommitFetch,
    DisableAutoCommitAttached,
    EnableAutoCommitAttached,
    EnableAutoCommitRelease,
    /// Prepare on the pinned connection, entering a prepared session
    StmtPrepareAttached,
    /// Prepare on a fresh connection, entering a prepared session
    StmtPrepareFetch,
    /// Prepare another statement inside an active prepared session
    StmtPrepareInSession,
    StmtForward,
    StmtCloseAttached,
    StmtCloseRelease,
}

impl Handler {
    pub fn class(self) -> HandlerClass {
        match self {
            Handler::Noop => HandlerClass::NoOp,
            Handler::Forbidden => HandlerClass::Forbidden,
            Handler::QueryPooled => HandlerClass::BorrowAndReturn,
            Handler::QueryAttached
            | Handler::BeginAttached
            | Handler::CommitOrRollbackAttached
            | Handler::StmtPrepareAttached
            | Handler::StmtPrepareInSession
            | Handler::StmtForward
            | Handler::StmtCloseAttached => HandlerClass::UsePinned,
            Handler::BeginFetch | Handler::DisableAutoCommitFetch | Handler::StmtPrepareFetch => {
                HandlerClass::FetchThenPin
            }
            Handler::DisableAutoCommitAttached | Handler::EnableAutoCommitAttached => {
                HandlerClass::KeepPinned
            }
            Handler::EnableAutoCommitRelease
            | Handler::CommitOrRollbackRelease
            | Handler::StmtCloseRelease => HandlerClass::ReleaseAfterOp,
        }
    }

    /// Whether this handler can run for `kind`
    pub fn accepts(self, kind: EventKind) -> bool {
        match self {
            Handler::Noop | Handler::Forbidden => true,
            Handler::QueryPooled | Handler::QueryAttached => kind == EventKind::Query,
            Handler::BeginAttached | Handler::BeginFetch => kind == EventKind::Begin,
            Handler::CommitOrRollbackAttached | Handler::CommitOrRollbackRelease => {
                kind == EventKind::CommitOrRollback
            }
            Handler::DisableAutoCommitFetch | Handler::DisableAutoCommitAttached => {
                kind == EventKind::DisableAutoCommit
            }
            Handler::EnableAutoCommitAttached | Handler::EnableAutoCommitRelease => {
                kind == EventKind::EnableAutoCommit
            }
            Handler::StmtPrepareAttached
            | Handler::StmtPrepareFetch
            | Handler::StmtPrepareInSession => kind == EventKind::StmtPrepare,
            Handler::StmtForward => kind == EventKind::StmtForwardData,
            Handler::StmtCloseAttached | Handler::StmtCloseRelease => kind == EventKind::StmtClose,
        }
    }
}

/// Target of a (state, event) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionEntry {
    pub next: SessionState,
    /// Move to `next` even when the handler fails
    pub force: bool,
    pub handler: Handler,
}

/// (from, event, to, force, handler); states use their numeric encoding
/// `InTransaction | AutoCommit << 1 | InPrepare << 2`
#[rustfmt::skip]
const TRANSITIONS: &[(u8, EventKind, u8, bool, Handler)] = &[
    // autocommit off, idle connection pinned
    (0, Query,             1, false, H::QueryAttached),
    (0, Begin,             1, false, H::BeginAttached),
    (0, CommitOrRollback,  0, false, H::Noop),
    (0, DisableAutoCommit, 0, false, H::Noop),
    (0, EnableAutoCommit,  2, true,  H::EnableAutoCommitRelease),
    (0, StmtPrepare,       4, false, H::StmtPrepareAttached),
    (0, StmtForwardData,   0, true,  H::Forbidden),
    (0, StmtClose,         0, true,  H::Noop),

    // transaction, autocommit off
    (1, Query,             1, false, H::QueryAttached),
    (1, Begin,             1, false, H::Noop),
    (1, CommitOrRollback,  0, true,  H::CommitOrRollbackAttached),
    (1, DisableAutoCommit, 1, true,  H::Noop),
    (1, EnableAutoCommit,  3, false, H::EnableAutoCommitAttached),
    (1, StmtPrepare,       5, false, H::StmtPrepareAttached),
    (1, StmtForwardData,   1, true,  H::Forbidden),
    (1, StmtClose,         1, true,  H::Noop),

    // initial
    (2, Query,             2, false, H::QueryPooled),
    (2, Begin,             3, false, H::BeginFetch),
    (2, CommitOrRollback,  2, false, H::Noop),
    (2, DisableAutoCommit, 0, false, H::DisableAutoCommitFetch),
    (2, EnableAutoCommit,  2, false, H::Noop),
    (2, StmtPrepare,       6, false, H::StmtPrepareFetch),
    (2, StmtForwardData,   2, true,  H::Forbidden),
    (2, StmtClose,         2, true,  H::Noop),

    // explicit transaction, autocommit on
    (3, Query,             3, false, H::QueryAttached),
    (3, Begin,             3, false, H::Noop),
    (3, CommitOrRollback,  2, true,  H::CommitOrRollbackRelease),
    (3, DisableAutoCommit, 1, false, H::DisableAutoCommitAttached),
    (3, EnableAutoCommit,  3, false, H::Noop),
    (3, StmtPrepare,       7, false, H::StmtPrepareAttached),
    (3, StmtForwardData,   3, true,  H::Forbidden),
    (3, StmtClose,         3, true,  H::Noop),

    // prepared, autocommit off
    (4, Query,             5, false, H::QueryAttached),
    (4, Begin,             5, false, H::BeginAttached),
    (4, CommitOrRollback,  4, true,  H::Noop),
    (4, DisableAutoCommit, 4, true,  H::Noop),
    (4, EnableAutoCommit,  6, false, H::EnableAutoCommitAttached),
    (4, StmtPrepare,       4, true,  H::StmtPrepareInSession),
    (4, StmtForwardData,   5, false, H::StmtForward),
    (4, StmtClose,         0, true,  H::StmtCloseAttached),

    // prepared, transaction, autocommit off
    (5, Query,             5, true,  H::QueryAttached),
    (5, Begin,             5, true,  H::Noop),
    (5, CommitOrRollback,  4, true,  H::CommitOrRollbackAttached),
    (5, DisableAutoCommit, 5, true,  H::Noop),
    (5, EnableAutoCommit,  7, false, H::EnableAutoCommitAttached),
    (5, StmtPrepare,       5, true,  H::StmtPrepareInSession),
    (5, StmtForwardData,   5, true,  H::StmtForward),
    (5, StmtClose,         1, true,  H::StmtCloseAttached),

    // prepared, autocommit on
    (6, Query,             6, true,  H::QueryAttached),
    (6, Begin,             7, false, H::BeginAttached),
    (6, CommitOrRollback,  6, true,  H::Noop),
    (6, DisableAutoCommit, 4, false, H::DisableAutoCommitAttached),
    (6, EnableAutoCommit,  6, true,  H::Noop),
    (6, StmtPrepare,       6, true,  H::StmtPrepareInSession),
    (6, StmtForwardData,   6, true,  H::StmtForward),
    (6, StmtClose,         2, true,  H::StmtCloseRelease),

    // prepared, explicit transaction, autocommit on
    (7, Query,             7, true,  H::QueryAttached),
    (7, Begin,             7, true,  H::Noop),
    (7, CommitOrRollback,  6, true,  H::CommitOrRollbackAttached),
    (7, DisableAutoCommit, 5, false, H::DisableAutoCommitAttached),
    (7, EnableAutoCommit,  7, true,  H::Noop),
    (7, StmtPrepare,       7, true,  H::StmtPrepareInSession),
    (7, StmtForwardData,   7, true,  H::StmtForward),
    (7, StmtClose,         3, true,  H::StmtCloseAttached),
];

/// Immutable (state, event) -> transition map
///
/// Built once at startup and shared by every session through an `Arc`.
#[derive(Debug, Clone)]
pub struct TransitionTable {
    entries: [[Option<TransitionEntry>; EventKind::COUNT]; SessionState::COUNT],
}

impl TransitionTable {
    /// Table with the full set of proxy transitions
    pub fn new() -> Self {
        let mut table = Self::empty();
        for &(from, event, to, force, handler) in TRANSITIONS {
            table.register(
                SessionState::from_bits_truncate(from),
                event,
                SessionState::from_bits_truncate(to),
                force,
                handler,
            );
        }
        table
    }

    /// Table without any transitions; every lookup misses
    pub fn empty() -> Self {
        Self {
            entries: [[None; EventKind::COUNT]; SessionState::COUNT],
        }
    }

    /// Add a transition
    ///
    /// # Panics
    ///
    /// On a second registration for the same (state, event) pair, or when
    /// `handler` cannot run for `event`.
    pub fn register(
        &mut self,
        from: SessionState,
        event: EventKind,
        next: SessionState,
        force: bool,
        handler: Handler,
    ) {
        if !handler.accepts(event) {
            panic!("handler {:?} cannot run for event {}", handler, event);
        }

        let slot = &mut self.entries[from.index()][event.index()];
        if let Some(existing) = slot {
            panic!(
                "duplicate transition for state {} event {}: already -> {} via {:?}",
                from, event, existing.next, existing.handler
            );
        }
        *slot = Some(TransitionEntry {
            next,
            force,
            handler,
        });
    }

    pub fn lookup(&self, state: SessionState, event: EventKind) -> Option<&TransitionEntry> {
        self.entries
            .get(state.index())
            .and_then(|row| row[event.index()].as_ref())
    }

    /// All registered transitions as (from, event, entry)
    pub fn entries(&self) -> impl Iterator<Item = (SessionState, EventKind, &TransitionEntry)> + '_ {
        SessionState::all_states().flat_map(move |state| {
            EventKind::ALL
                .into_iter()
                .filter_map(move |event| self.lookup(state, event).map(|e| (state, event, e)))
        })
    }

    pub fn len(&self) -> usize {
        self.entries().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TransitionTable {
    fn default() -> Self {
        Self::new()
    }
}
