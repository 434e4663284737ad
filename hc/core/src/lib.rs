#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![deny(unsafe_code)]

//! # HC Core
//!
//! Leaf primitives shared by the firmware's scheduler and packet transport:
//! interrupt-safe critical sections, an allocation-free intrusive list, the
//! 64-bit time source built on a 16-bit hardware counter, the capability
//! traits the board must provide and the assertion hook.
//!
//! Everything here is `no_std`, allocation-free and usable from `static`
//! items, so one root context can be built at startup and shared by
//! interrupt handlers and the main loop.

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod assert;
pub mod guard;
pub mod list;
pub mod port;
pub mod time;

pub use guard::{free, IrqGuard, ReentryFlag, ReentryToken};
pub use list::IntrusiveList;
pub use port::{Events, Port, Timer16};
pub use time::{Instant, TimeSource, MAX_SLEEP_TICKS};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type used throughout the firmware core
pub type HcResult<T> = Result<T, HcError>;

/// Error types for core operations
///
/// Overruns and corrupt frames are absorbed by the packet queue and never
/// show up here; these are the few outcomes a caller has to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HcError {
    /// No free slot left in a fixed-capacity table
    CapacityExceeded,
    /// Payload longer than the frame format allows
    PayloadTooLarge,
    /// Output buffer cannot hold the result
    BufferTooSmall,
    /// Frame does not follow the wire layout
    Malformed,
    /// Frame content does not match its CRC-32 trailer
    CrcMismatch,
    /// Transmit path rejected the frame
    TransmitFailed,
}

impl core::fmt::Display for HcError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            HcError::CapacityExceeded => write!(f, "Capacity exceeded"),
            HcError::PayloadTooLarge => write!(f, "Payload too large"),
            HcError::BufferTooSmall => write!(f, "Buffer too small"),
            HcError::Malformed => write!(f, "Malformed frame"),
            HcError::CrcMismatch => write!(f, "CRC mismatch"),
            HcError::TransmitFailed => write!(f, "Transmit failed"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for HcError {}

#[cfg(feature = "defmt")]
impl defmt::Format for HcError {
    fn format(&self, fmt: defmt::Formatter) {
        match self {
            HcError::CapacityExceeded => defmt::write!(fmt, "CapacityExceeded"),
            HcError::PayloadTooLarge => defmt::write!(fmt, "PayloadTooLarge"),
            HcError::BufferTooSmall => defmt::write!(fmt, "BufferTooSmall"),
            HcError::Malformed => defmt::write!(fmt, "Malformed"),
            HcError::CrcMismatch => defmt::write!(fmt, "CrcMismatch"),
            HcError::TransmitFailed => defmt::write!(fmt, "TransmitFailed"),
        }
    }
}
