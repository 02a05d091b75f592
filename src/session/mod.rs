//! Orchestration of engine runs
//!
//! [`InterceptionSession`] drives one page load while capturing its requests;
//! [`ScriptPoller`] loads a page and evaluates a script until it produces a
//! value. Both hold the pooled engine exclusively for the duration of a run.

mod interception;
mod poller;
mod state;

use static_assertions::const_assert;

pub use interception::InterceptionSession;
pub use poller::{PollTiming, ScriptPoller};
pub use state::{SessionState, StateCell};

/// Time granted to teardown beyond an operation's own window
pub const GUARD_MARGIN_MS: u64 = 5_000;

/// Pause after a page finished loading before the first evaluation
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 500;

/// Pause between evaluations
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 300;

/// Default budget for script evaluation
pub const DEFAULT_SCRIPT_TIMEOUT_MS: u64 = 10_000;

/// Script result meaning "not ready yet"
pub const NULL_SENTINEL: &str = "null";

const_assert!(GUARD_MARGIN_MS > 0);
const_assert!(DEFAULT_POLL_INTERVAL_MS > 0);

/// Script result with the "not ready" sentinel folded into `None`
pub(crate) fn ready_value(value: Option<String>) -> Option<String> {
    value.filter(|value| value != NULL_SENTINEL)
}
