use std::fmt;

use bitflags::bitflags;

bitflags! {
    /// Client-visible session properties that decide whether a backend
    /// connection must stay pinned
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SessionState: u8 {
        /// An explicit or implicit transaction is open
        const IN_TRANSACTION = 0x01;
        /// Autocommit is on
        const AUTOCOMMIT = 0x02;
        /// A prepared statement session is active
        const IN_PREPARE = 0x04;
    }
}

impl SessionState {
    /// Autocommit on, nothing else; the only state that needs no pinned connection
    pub const INITIAL: Self = Self::AUTOCOMMIT;

    /// Number of distinct states
    pub const COUNT: usize = 8;

    /// Every state, ordered by its numeric encoding
    pub fn all_states() -> impl Iterator<Item = SessionState> {
        (0..Self::COUNT as u8).map(Self::from_bits_truncate)
    }

    pub fn index(self) -> usize {
        self.bits() as usize
    }

    pub fn is_initial(self) -> bool {
        self == Self::INITIAL
    }

    pub fn in_transaction(self) -> bool {
        self.contains(Self::IN_TRANSACTION)
    }

    pub fn autocommit(self) -> bool {
        self.contains(Self::AUTOCOMMIT)
    }

    pub fn in_prepare(self) -> bool {
        self.contains(Self::IN_PREPARE)
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::INITIAL
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |set: bool, c: char| if set { c } else { '-' };
        write!(
            f,
            "{}({},{},{})",
            self.bits(),
            flag(self.in_transaction(), 'T'),
            flag(self.autocommit(), 'A'),
            flag(self.in_prepare(), 'P'),
        )
    }
}

/// Kind of client event driving the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventKind {
    Query = 0,
    Begin = 1,
    CommitOrRollback = 2,
    DisableAutoCommit = 3,
    EnableAutoCommit = 4,
    StmtPrepare = 5,
    /// COM_STMT_EXECUTE or COM_STMT_SEND_LONG_DATA against a prepared statement
    StmtForwardData = 6,
    StmtClose = 7,
}

impl EventKind {
    pub const COUNT: usize = 8;

    pub const ALL: [EventKind; Self::COUNT] = [
        EventKind::Query,
        EventKind::Begin,
        EventKind::CommitOrRollback,
        EventKind::DisableAutoCommit,
        EventKind::EnableAutoCommit,
        EventKind::StmtPrepare,
        EventKind::StmtForwardData,
        EventKind::StmtClose,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Query => "Query",
            EventKind::Begin => "Begin",
            EventKind::CommitOrRollback => "CommitOrRollback",
            EventKind::DisableAutoCommit => "DisableAutoCommit",
            EventKind::EnableAutoCommit => "EnableAutoCommit",
            EventKind::StmtPrepare => "StmtPrepare",
            EventKind::StmtForwardData => "StmtForwardData",
            EventKind::StmtClose => "StmtClose",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
