//! The memory manager runs at two logical levels: "low", where code may
//! block and allocate, and "dispatch", where preemption is disabled and
//! blocking is forbidden.
//!
//! Short sequences that touch per-CPU state or walk another address
//! space's page tables must run at dispatch level. They do so by holding
//! a [`DispatchGuard`], which raises the level on creation and restores
//! it on drop.
//!
//! How preemption is actually disabled is the embedding kernel's
//! business; it registers a pair of hooks once during early boot. Before
//! hooks are registered (or on a host build) the guard only maintains
//! the level bookkeeping.

#![no_std]

#[cfg(test)]
extern crate std;

use core::marker::PhantomData;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Once;

/// The logical run level of the current CPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunLevel {
    /// Preemptible; may block and allocate.
    Low,
    /// Preemption disabled; must not block.
    Dispatch,
}

static RAISE_HOOK: Once<fn()> = Once::new();
static LOWER_HOOK: Once<fn()> = Once::new();

/// Tracks the nesting depth of dispatch-level guards.
static DISPATCH_DEPTH: AtomicUsize = AtomicUsize::new(0);

/// Registers the preemption disable/enable hooks.
/// Must be called at most once, before any guard is created.
pub fn set_preemption_hooks(disable: fn(), enable: fn()) {
    RAISE_HOOK.call_once(|| disable);
    LOWER_HOOK.call_once(|| enable);
}

/// Returns the current logical run level.
pub fn current_run_level() -> RunLevel {
    if DISPATCH_DEPTH.load(Ordering::Relaxed) == 0 {
        RunLevel::Low
    } else {
        RunLevel::Dispatch
    }
}

/// A scope at dispatch level. Creating one raises the level;
/// dropping it lowers the level back down (once the outermost
/// guard is gone).
///
/// The guard is intentionally `!Send`: the raised level is a
/// property of the current CPU.
pub struct DispatchGuard {
    _not_send: PhantomData<*const ()>,
}

impl DispatchGuard {
    pub fn raise() -> DispatchGuard {
        if DISPATCH_DEPTH.fetch_add(1, Ordering::Acquire) == 0 {
            if let Some(disable) = RAISE_HOOK.get() {
                disable();
            }
        }
        DispatchGuard { _not_send: PhantomData }
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        if DISPATCH_DEPTH.fetch_sub(1, Ordering::Release) == 1 {
            if let Some(enable) = LOWER_HOOK.get() {
                enable();
            }
        }
    }
}
