//! A pulsable event.
//!
//! A [`PulseEvent`] carries no payload and never latches: a pulse wakes
//! everything waiting at that moment, and a waiter that arrives after a
//! pulse waits for the next one. This is the notification shape the
//! memory manager needs in three places: "pages were freed, retry your
//! allocation", "page-out is needed", and "the memory warning level
//! changed".
//!
//! Waiting is generation-based. A waiter samples the event's generation
//! *before* deciding to wait (typically before releasing the lock that
//! guards the decision), then waits for the generation to move past the
//! sample. This closes the classic lost-wakeup window without the event
//! owning a queue.
//!
//! While waiting, the event repeatedly invokes a relax hook registered
//! by the embedding kernel, which is expected to yield the CPU to other
//! runnable threads. Without a registered hook the wait spins.

#![no_std]

#[cfg(test)]
extern crate std;

use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Once;

static RELAX_HOOK: Once<fn()> = Once::new();

/// Registers the function invoked on every iteration of a wait loop.
/// Must be called at most once.
pub fn set_wait_relax_hook(relax: fn()) {
    RELAX_HOOK.call_once(|| relax);
}

fn relax() {
    match RELAX_HOOK.get() {
        Some(hook) => hook(),
        None => core::hint::spin_loop(),
    }
}

/// An opaque sample of an event's generation, taken with
/// [`PulseEvent::current`] and consumed by [`PulseEvent::wait`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PulseToken(usize);

/// See the crate documentation.
pub struct PulseEvent {
    generation: AtomicUsize,
}

impl PulseEvent {
    pub const fn new() -> PulseEvent {
        PulseEvent { generation: AtomicUsize::new(0) }
    }

    /// Samples the current generation. A subsequent [`wait`](Self::wait)
    /// with this token returns as soon as any pulse has occurred after
    /// the sample, including pulses delivered between the two calls.
    pub fn current(&self) -> PulseToken {
        PulseToken(self.generation.load(Ordering::Acquire))
    }

    /// Wakes every waiter whose token predates this pulse.
    pub fn pulse(&self) {
        self.generation.fetch_add(1, Ordering::Release);
    }

    /// Blocks until the event has been pulsed after `token` was taken.
    pub fn wait(&self, token: PulseToken) {
        while self.generation.load(Ordering::Acquire) == token.0 {
            relax();
        }
    }

    /// Returns `true` if the event has been pulsed since `token` was taken.
    pub fn pulsed_since(&self, token: PulseToken) -> bool {
        self.generation.load(Ordering::Acquire) != token.0
    }
}

impl Default for PulseEvent {
    fn default() -> PulseEvent {
        PulseEvent::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pulse_wakes_earlier_token() {
        let event = PulseEvent::new();
        let token = event.current();
        assert!(!event.pulsed_since(token));
        event.pulse();
        assert!(event.pulsed_since(token));
        // Does not latch: a fresh token must wait for the *next* pulse.
        let fresh = event.current();
        assert!(!event.pulsed_since(fresh));
        // And wait() returns immediately for the stale token.
        event.wait(token);
    }
}
