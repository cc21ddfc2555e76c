//! Session state machine
//!
//! A session's state is three independent flags. Every (state, event) pair
//! maps to a [`TransitionEntry`] naming the next state, whether the move
//! happens even when the handler fails, and the handler that performs the
//! backend and pool work.

mod state;
mod table;

pub use state::{EventKind, SessionState};
pub use table::{Handler, HandlerClass, TransitionEntry, TransitionTable};
