//! Session lifecycle

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use tracing::debug;

/// Lifecycle of one interception run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionState {
    /// Not started
    Idle = 0,
    /// Engine acquired, navigation started
    Loading = 1,
    /// Requests or page signals observed
    Capturing = 2,
    /// Capture stopped, releasing the engine
    Completing = 3,
    /// Delivered a result
    Completed = 4,
    /// Delivered an error
    Failed = 5,
    /// Cancelled by the caller
    Cancelled = 6,
}

impl SessionState {
    /// Whether no further transition is possible
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Loading,
            2 => Self::Capturing,
            3 => Self::Completing,
            4 => Self::Completed,
            5 => Self::Failed,
            _ => Self::Cancelled,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Capturing => "capturing",
            Self::Completing => "completing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Atomically updated [`SessionState`]
///
/// Transitions are compare-and-swap, so of several racing terminal signals
/// exactly one wins.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    /// Start in [`SessionState::Idle`]
    #[must_use]
    pub fn new() -> Self {
        Self(AtomicU8::new(SessionState::Idle as u8))
    }

    /// Current state
    #[must_use]
    pub fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`; returns `false` if the state was not `from`
    ///
    /// Terminal states never advance.
    pub fn advance(&self, from: SessionState, to: SessionState) -> bool {
        if from.is_terminal() {
            return false;
        }

        let moved = self
            .0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if moved {
            debug!("Session {} -> {}", from, to);
        }
        moved
    }

    /// Enter `terminal` from any non-terminal state
    ///
    /// Returns `true` only for the call that actually ended the session.
    ///
    /// # Panics
    ///
    /// Panics if `terminal` is not a terminal state
    pub fn finish(&self, terminal: SessionState) -> bool {
        assert!(terminal.is_terminal(), "finish requires a terminal state");

        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let from = SessionState::from_u8(current);
            if from.is_terminal() {
                return false;
            }
            match self.0.compare_exchange_weak(
                current,
                terminal as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    debug!("Session {} -> {}", from, terminal);
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_forward_transitions() {
        let state = StateCell::new();
        assert_eq!(state.get(), SessionState::Idle);

        assert!(state.advance(SessionState::Idle, SessionState::Loading));
        assert!(!state.advance(SessionState::Idle, SessionState::Loading));
        assert!(state.advance(SessionState::Loading, SessionState::Capturing));
        assert_eq!(state.get(), SessionState::Capturing);
    }

    #[test]
    fn test_terminal_is_final() {
        let state = StateCell::new();
        state.advance(SessionState::Idle, SessionState::Loading);

        assert!(state.finish(SessionState::Cancelled));
        assert!(!state.finish(SessionState::Completed));
        assert!(!state.advance(SessionState::Cancelled, SessionState::Loading));
        assert_eq!(state.get(), SessionState::Cancelled);
    }

    #[test]
    fn test_racing_finishers_resolve_once() {
        let state = Arc::new(StateCell::new());
        state.advance(SessionState::Idle, SessionState::Loading);

        let winners: usize = [
            SessionState::Completed,
            SessionState::Failed,
            SessionState::Cancelled,
        ]
        .into_iter()
        .cycle()
        .take(12)
        .map(|terminal| {
            let state = Arc::clone(&state);
            std::thread::spawn(move || usize::from(state.finish(terminal)))
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .sum();

        assert_eq!(winners, 1);
        assert!(state.get().is_terminal());
    }

    #[test]
    #[should_panic(expected = "finish requires a terminal state")]
    fn test_finish_rejects_non_terminal() {
        StateCell::new().finish(SessionState::Loading);
    }
}
