//! Critical section management
//!
//! On the target a critical section masks interrupt delivery; the board
//! crate provides the `critical-section` implementation. Host builds use the
//! `std` implementation of that crate, which serializes threads instead.

use core::cell::Cell;
use core::marker::PhantomData;
use critical_section::{CriticalSection, Mutex, RestoreState};

/// RAII guard for a critical section
///
/// Entering captures the prior interrupt state and dropping restores exactly
/// that state, so guards nest: the innermost drop leaves interrupts masked and
/// the outermost drop returns to the caller's original state. Guards must be
/// dropped in reverse order of creation, which is what scoping gives for free.
pub struct IrqGuard {
    state: RestoreState,
    // Release has to happen in the context that acquired.
    _not_send: PhantomData<*mut ()>,
}

impl IrqGuard {
    /// Enter a critical section
    #[allow(unsafe_code)]
    #[inline]
    pub fn enter() -> Self {
        // SAFETY: paired with the single `release` in `Drop`.
        let state = unsafe { critical_section::acquire() };
        Self {
            state,
            _not_send: PhantomData,
        }
    }

    /// Token for borrowing `critical_section::Mutex` contents while the guard lives
    #[allow(unsafe_code)]
    #[inline]
    pub fn cs(&self) -> CriticalSection<'_> {
        // SAFETY: the token cannot outlive `self`, and the section stays
        // entered until `self` is dropped.
        unsafe { CriticalSection::new() }
    }
}

impl Drop for IrqGuard {
    #[allow(unsafe_code)]
    #[inline]
    fn drop(&mut self) {
        // SAFETY: `state` came from the matching `acquire` in `enter`.
        unsafe { critical_section::release(self.state) }
    }
}

/// Run a closure inside a critical section
#[inline]
pub fn free<R>(f: impl FnOnce(CriticalSection<'_>) -> R) -> R {
    critical_section::with(f)
}

/// Per-site flag rejecting re-entry
///
/// Code reachable both from an interrupt handler and from a work callback
/// (the receive drain, for example) takes the flag for its duration. A second
/// caller arriving while the flag is held skips the work instead of running it
/// twice on the same state.
pub struct ReentryFlag {
    active: Mutex<Cell<bool>>,
}

impl ReentryFlag {
    /// Create a cleared flag
    pub const fn new() -> Self {
        Self {
            active: Mutex::new(Cell::new(false)),
        }
    }

    /// Take the flag, or `None` if someone already holds it
    pub fn try_enter(&self) -> Option<ReentryToken<'_>> {
        free(|cs| {
            let active = self.active.borrow(cs);
            if active.get() {
                None
            } else {
                active.set(true);
                Some(ReentryToken { flag: self })
            }
        })
    }

    /// Check whether the flag is currently held
    pub fn is_active(&self) -> bool {
        free(|cs| self.active.borrow(cs).get())
    }
}

impl Default for ReentryFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Proof of holding a [`ReentryFlag`]; clears it on drop
pub struct ReentryToken<'a> {
    flag: &'a ReentryFlag,
}

impl Drop for ReentryToken<'_> {
    fn drop(&mut self) {
        free(|cs| self.flag.active.borrow(cs).set(false));
    }
}
