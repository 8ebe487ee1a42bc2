//! Shared polling primitive used by all waiting code paths.
//!
//! Every blocking wait in the orchestrator (registry status waits, response
//! waits, flash phase transitions, sub-process reaping) goes through
//! [`poll_until`], so cancellation and deadline behaviour are uniform.

use std::thread;
use std::time::{Duration, Instant};

/// Poll `predicate` at `interval` until it returns true or `deadline` passes.
///
/// The predicate is evaluated at least once, even when the deadline has
/// already expired. Returns true if the predicate succeeded, false on
/// deadline expiry.
pub fn poll_until<F>(interval: Duration, deadline: Instant, mut predicate: F) -> bool
where
    F: FnMut() -> bool,
{
    loop {
        if predicate() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        thread::sleep(interval.min(deadline - now));
    }
}

/// Convenience wrapper: poll for up to `timeout` from now.
pub fn poll_for<F>(interval: Duration, timeout: Duration, predicate: F) -> bool
where
    F: FnMut() -> bool,
{
    poll_until(interval, Instant::now() + timeout, predicate)
}
