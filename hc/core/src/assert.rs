//! Assertion hook for invariant violations
//!
//! A broken invariant is a programming error, not a recoverable condition.
//! The board installs a hook that halts or resets the MCU; without one the
//! failure becomes a panic and the firmware's panic handler decides.

use core::cell::Cell;
use core::panic::Location;
use critical_section::Mutex;

use crate::guard::free;

/// Handler for a failed assertion; never returns
pub type AssertHook = fn(&'static Location<'static>) -> !;

static HOOK: Mutex<Cell<Option<AssertHook>>> = Mutex::new(Cell::new(None));

/// Install the assertion hook, replacing any previous one
pub fn set_hook(hook: AssertHook) {
    free(|cs| HOOK.borrow(cs).set(Some(hook)));
}

/// Remove the assertion hook, falling back to panicking
pub fn clear_hook() {
    free(|cs| HOOK.borrow(cs).set(None));
}

/// Report a failed assertion at the caller's location
#[track_caller]
#[cold]
pub fn fail() -> ! {
    let location = Location::caller();
    error!(
        "assertion failed at {}:{}",
        location.file(),
        location.line()
    );

    match free(|cs| HOOK.borrow(cs).get()) {
        Some(hook) => hook(location),
        None => panic!("assertion failed at {}:{}", location.file(), location.line()),
    }
}

/// Check an invariant, routing a violation to [`fail`]
#[macro_export]
macro_rules! hc_assert {
    ($cond:expr $(,)?) => {
        if !$cond {
            $crate::assert::fail();
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic;

    fn hook(location: &'static Location<'static>) -> ! {
        panic!("hook:{}", location.line())
    }

    fn message(payload: Box<dyn std::any::Any + Send>) -> String {
        match payload.downcast::<String>() {
            Ok(text) => *text,
            Err(_) => String::new(),
        }
    }

    #[test]
    fn test_assert_routes_to_hook() {
        // The hook is global state, so every phase lives in this one test.
        let passed = panic::catch_unwind(|| hc_assert!(1 + 1 == 2));
        assert!(passed.is_ok());

        let fallback = panic::catch_unwind(|| hc_assert!(false)).unwrap_err();
        assert!(message(fallback).starts_with("assertion failed at"));

        set_hook(hook);
        let hooked = panic::catch_unwind(|| fail()).unwrap_err();
        assert!(message(hooked).starts_with("hook:"));

        clear_hook();
        let cleared = panic::catch_unwind(|| fail()).unwrap_err();
        assert!(message(cleared).starts_with("assertion failed at"));
    }
}
