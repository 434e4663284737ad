//! Time management types and utilities

use core::cell::Cell;
use core::fmt;
use critical_section::Mutex;

use crate::guard::{free, IrqGuard};
use crate::port::{Events, Timer16};

/// Longest single sleep, in ticks
///
/// A quarter of the 16-bit counter period: the compare channel always lands
/// well inside the next wrap, and the main loop refreshes the time source often
/// enough to observe every counter wrap.
pub const MAX_SLEEP_TICKS: u64 = 16384;

/// Monotonic point in time, in hardware timer ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Instant(u64);

impl Instant {
    /// Time zero (timer start)
    pub const ZERO: Self = Self(0);

    /// Latest representable instant
    pub const MAX: Self = Self(u64::MAX);

    /// Create an instant from a raw tick count
    pub const fn from_ticks(ticks: u64) -> Self {
        Self(ticks)
    }

    /// Get the raw tick count
    pub const fn ticks(self) -> u64 {
        self.0
    }

    /// Instant `ticks` later
    pub const fn after(self, ticks: u32) -> Self {
        Self(self.0.saturating_add(ticks as u64))
    }

    /// Low 16 bits, as the hardware compare register sees them
    pub const fn low16(self) -> u16 {
        self.0 as u16
    }

    /// Ticks elapsed since an earlier instant, zero if `earlier` is later
    pub const fn elapsed_since(self, earlier: Instant) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tick:{}", self.0)
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Instant {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "tick:{}", self.0);
    }
}

/// 64-bit time built on a 16-bit free-running counter
///
/// The cached value only moves forward in [`update`](Self::update); between
/// updates [`now`](Self::now) returns the same instant, which gives every
/// work item dispatched in one pass the same notion of "now".
pub struct TimeSource {
    cached: Mutex<Cell<u64>>,
}

impl TimeSource {
    /// Create a time source starting at tick zero
    pub const fn new() -> Self {
        Self {
            cached: Mutex::new(Cell::new(0)),
        }
    }

    /// Cached time from the last update
    pub fn now(&self) -> Instant {
        free(|cs| Instant(self.cached.borrow(cs).get()))
    }

    /// Fold the current counter value into the cached time
    ///
    /// Must run at least once per counter period, otherwise a wrap is missed.
    pub fn update<T: Timer16 + ?Sized>(&self, timer: &T) -> Instant {
        free(|cs| {
            let cached = self.cached.borrow(cs);
            let counter = timer.counter();
            let mut time = cached.get();
            if counter < time as u16 {
                time += 0x1_0000;
            }
            time = (time & !0xFFFF) | u64::from(counter);
            cached.set(time);
            Instant(time)
        })
    }

    /// Update, then return the fresh time
    pub fn precise<T: Timer16 + ?Sized>(&self, timer: &T) -> Instant {
        self.update(timer)
    }

    /// Arm the compare channel for the next required wake-up
    ///
    /// Deadlines farther than [`MAX_SLEEP_TICKS`] are clamped to that distance.
    /// If the compare point has already passed by the time it is written, the
    /// event flag is raised so the main loop does not sleep through it.
    pub fn schedule_wake_up<T, E>(&self, timer: &T, events: &E, deadline: Instant)
    where
        T: Timer16 + ?Sized,
        E: Events + ?Sized,
    {
        let guard = IrqGuard::enter();
        let now = self.cached.borrow(guard.cs()).get();

        match deadline.0.checked_sub(now) {
            Some(ahead) if ahead >= MAX_SLEEP_TICKS => {
                let counter = timer.counter();
                timer.set_compare(counter.wrapping_add(MAX_SLEEP_TICKS as u16));
            }
            Some(_) => {
                let expiry = deadline.low16();
                timer.set_compare(expiry);
                let counter = timer.counter();
                if (expiry.wrapping_sub(counter) as i16) < 1 {
                    events.signal();
                }
            }
            None => {
                timer.set_compare(deadline.low16());
                events.signal();
            }
        }
    }
}

impl Default for TimeSource {
    fn default() -> Self {
        Self::new()
    }
}
