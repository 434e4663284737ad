#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![forbid(unsafe_code)]

//! # HC Packet
//!
//! Framed packet transport over a byte stream. Outgoing payloads are wrapped
//! in self-delimiting frames protected by CRC-32; incoming bytes land in a
//! ring buffer that hands complete, verified payloads to the consumer and
//! silently skips garbage between frames.
//!
//! ```text
//! ESC | mask | payload ^ mask | crc32_le ^ mask | ESC | END
//! ```

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod crc;
pub mod frame;
pub mod queue;
pub mod rx;
pub mod tx;

pub use crc::{crc32, Crc32};
pub use frame::{decode, encode, encoded_len, Frame};
pub use queue::{DiagCounter, PacketInQueue, PacketRef, Peek};
pub use rx::{idle_timeout_ms, DmaRx, Drained};
pub use tx::{send, send_frame, ByteSink};

/// Frame delimiter, opens and closes every frame
pub const ESC: u8 = 0xAA;

/// Follows the closing `ESC`
pub const END: u8 = 0xFF;

/// CRC-32 trailer size
pub const CRC_SIZE: usize = 4;

/// Longest payload one frame carries
pub const MAX_PAYLOAD: usize = 249;

/// Longest scrambled region: payload plus CRC
pub const MAX_CONTENT: usize = MAX_PAYLOAD + CRC_SIZE;

/// Longest frame on the wire
pub const MAX_FRAME: usize = MAX_CONTENT + 4;

/// Receive queue size used when none is given
pub const DEFAULT_QUEUE_SIZE: usize = 1024;
