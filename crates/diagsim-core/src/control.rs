//! Control surface of a running ECU as seen from response handlers
//!
//! The core never schedules timers or sends frames on its own. A running
//! ECU implements [`EcuControl`] and hands itself to every handler,
//! interceptor, timer task and reset handler it invokes.

use std::time::Duration;

use crate::error::SimResult;
use crate::interceptor::Interceptor;
use crate::storage::KeyedStorage;

/// Deferred work scheduled with [`EcuControl::add_or_replace_timer`]
pub type TimerTask = Box<dyn FnOnce(&dyn EcuControl) -> SimResult<()> + Send + 'static>;

/// Operations a running ECU offers to the callbacks it invokes
pub trait EcuControl: Send + Sync {
    /// ECU name
    fn name(&self) -> &str;

    /// ECU-level storage, cleared when the ECU is reset
    fn storage(&self) -> &KeyedStorage;

    /// Schedule `task` to run once after `delay`, replacing any pending
    /// timer with the same name
    fn add_or_replace_timer(&self, name: &str, delay: Duration, task: TimerTask) -> SimResult<()>;

    /// Cancel a pending timer. Returns `false` if no timer of that name was
    /// pending (never scheduled, already fired or already cancelled).
    fn cancel_timer(&self, name: &str) -> bool;

    /// Register an interceptor, replacing one with the same name.
    /// Returns the interceptor name.
    fn add_interceptor(&self, interceptor: Interceptor) -> String;

    /// Remove an interceptor before it expires
    fn remove_interceptor(&self, name: &str) -> bool;

    /// Whether the ECU currently reports itself busy
    fn is_busy(&self) -> bool;

    /// Enter or leave the busy state
    fn set_busy(&self, busy: bool);

    /// Emit a frame outside the request/response cycle (delayed responses)
    fn send(&self, payload: Vec<u8>);
}
