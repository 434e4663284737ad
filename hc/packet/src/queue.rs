//! Incoming packet ring buffer
//!
//! The receive interrupt appends raw line bytes with [`PacketInQueue::write`];
//! the main loop pulls verified payloads with [`PacketInQueue::peek`] and
//! releases them with [`PacketInQueue::drop_packet`]. Frames are located,
//! unscrambled and checked in place, and a payload is copied out only when
//! the consumer asks for it.
//!
//! One producer and one consumer share the queue through `&self`. Each side
//! advances only its own cursor. The producer's write and the consumer's
//! decision to move a wrapped frame run under the critical-section guard;
//! scanning, CRC checks and payload handling do not.
//!
//! Nothing here reports an error. Overruns truncate the newest data and force
//! a frame terminator; corrupt frames are skipped. Both are only counted.

use core::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};

use hc_core::guard::free;

use crate::crc::Crc32;
use crate::{CRC_SIZE, DEFAULT_QUEUE_SIZE, END, ESC, MAX_CONTENT, MAX_FRAME, MAX_PAYLOAD};

#[allow(clippy::declare_interior_mutable_const)]
const ZERO: AtomicU8 = AtomicU8::new(0);

/// `pending_start` value while no packet is handed out
const NONE: usize = usize::MAX;

/// Saturating event counter with a sticky "something happened" flag in bit 31
///
/// Read without synchronization by diagnostics; an occasional torn or stale
/// value is acceptable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DiagCounter(u32);

impl DiagCounter {
    /// Sticky flag bit
    pub const FLAG: u32 = 0x8000_0000;

    /// Zero count, flag clear
    pub const fn new() -> Self {
        Self(0)
    }

    /// Add `amount`, saturating at 2^31 - 1, and set the flag
    pub fn add(&mut self, amount: usize) {
        let limit = !Self::FLAG;
        let amount = u32::try_from(amount).unwrap_or(limit);
        self.0 = self.count().saturating_add(amount).min(limit) | Self::FLAG;
    }

    /// Counted amount without the flag
    pub const fn count(&self) -> u32 {
        self.0 & !Self::FLAG
    }

    /// Whether anything was counted since the flag was last cleared
    pub const fn is_flagged(&self) -> bool {
        self.0 & Self::FLAG != 0
    }

    /// Acknowledge the flag, keeping the count
    pub fn clear_flag(&mut self) {
        self.0 &= !Self::FLAG;
    }

    /// Raw value as stored
    pub const fn raw(&self) -> u32 {
        self.0
    }
}

/// Load-modify-store without read-modify-write atomics, which thumbv6m lacks
fn bump(counter: &AtomicU32, amount: usize) {
    let mut value = DiagCounter(counter.load(Ordering::Relaxed));
    value.add(amount);
    counter.store(value.raw(), Ordering::Relaxed);
}

fn clear_flag(counter: &AtomicU32) {
    let mut value = DiagCounter(counter.load(Ordering::Relaxed));
    value.clear_flag();
    counter.store(value.raw(), Ordering::Relaxed);
}

/// Location of a verified payload inside the ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PacketRef {
    start: usize,
    len: usize,
}

impl PacketRef {
    /// Payload length in bytes
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the payload is empty
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Result of looking for the next packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Peek {
    /// No complete frame buffered yet
    NoPacket,
    /// A bare `ESC, END` marker was consumed
    EndMarker,
    /// A verified payload, valid until dropped
    Packet(PacketRef),
}

impl Peek {
    /// The packet, if one was found
    pub fn packet(self) -> Option<PacketRef> {
        match self {
            Peek::Packet(packet) => Some(packet),
            _ => None,
        }
    }
}

enum Scan {
    Done(Peek),
    Invalid,
}

/// Ring buffer reassembling frames from raw received bytes
///
/// `N` must be a power of two larger than one maximum-size frame. Usable as a
/// `static` shared by the receive interrupt (producer) and the main loop
/// (consumer); calling the consumer methods from two contexts at once is not
/// supported.
pub struct PacketInQueue<const N: usize = DEFAULT_QUEUE_SIZE> {
    buffer: [AtomicU8; N],
    /// Advanced by the producer only
    write_pos: AtomicUsize,
    /// Advanced by the consumer; moved back only under the guard
    read_pos: AtomicUsize,
    overrun: AtomicU32,
    invalid: AtomicU32,
    /// Packet returned by the last `peek` and not dropped yet; already unscrambled
    pending_start: AtomicUsize,
    pending_len: AtomicUsize,
}

impl<const N: usize> PacketInQueue<N> {
    const MASK: usize = N - 1;

    const _ASSERT: () = assert!(
        N.is_power_of_two() && N > MAX_FRAME,
        "queue size must be a power of two above the maximum frame size"
    );

    /// Create an empty queue
    pub const fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::_ASSERT;

        Self {
            buffer: [ZERO; N],
            write_pos: AtomicUsize::new(0),
            read_pos: AtomicUsize::new(0),
            overrun: AtomicU32::new(0),
            invalid: AtomicU32::new(0),
            pending_start: AtomicUsize::new(NONE),
            pending_len: AtomicUsize::new(0),
        }
    }

    /// Append received bytes; returns whether the consumer should be notified
    ///
    /// Notification is requested when an `ESC` lands behind other buffered
    /// data (a frame may have just ended) or an `END` directly follows an
    /// `ESC`. When the ring fills up, the rest of `data` is dropped, an
    /// `ESC, END` terminator is stamped over the last two buffered bytes and
    /// the consumer is always notified.
    pub fn write(&self, data: &[u8]) -> bool {
        // A relocating consumer must never see half of a write.
        free(|_| {
            let read_pos = self.read_pos.load(Ordering::Acquire);
            let mut write_pos = self.write_pos.load(Ordering::Relaxed);
            let mut notify = false;

            for (written, &byte) in data.iter().enumerate() {
                let next = (write_pos + 1) & Self::MASK;
                if next == read_pos {
                    let lost = data.len() - written;
                    bump(&self.overrun, lost);
                    self.store(write_pos.wrapping_sub(2), ESC);
                    self.store(write_pos.wrapping_sub(1), END);
                    self.write_pos.store(write_pos, Ordering::Release);
                    warn!("packet queue overrun, {} bytes dropped", lost);
                    return true;
                }
                if (byte == ESC || byte == END) && read_pos != write_pos {
                    let after_esc = self.load(write_pos.wrapping_sub(1)) == ESC;
                    notify = notify || byte == ESC || after_esc;
                }
                self.store(write_pos, byte);
                write_pos = next;
            }

            self.write_pos.store(write_pos, Ordering::Release);
            notify
        })
    }

    /// Find the next verified packet without consuming it
    ///
    /// Garbage and invalid frames in front of it are consumed and counted.
    /// Peeking again before [`drop_packet`](Self::drop_packet) returns the
    /// same packet.
    pub fn peek(&self) -> Peek {
        if let Some(packet) = self.pending() {
            return Peek::Packet(packet);
        }
        loop {
            if let Scan::Done(result) = self.scan() {
                return result;
            }
        }
    }

    /// Copy the payload of the packet returned by the last `peek` into `out`
    ///
    /// Returns the payload length; `None` if `packet` was already dropped or
    /// `out` is shorter than the payload.
    pub fn read_payload(&self, packet: PacketRef, out: &mut [u8]) -> Option<usize> {
        if self.pending() != Some(packet) {
            return None;
        }
        let out = out.get_mut(..packet.len)?;
        for (pos, dst) in (packet.start..).zip(out.iter_mut()) {
            *dst = self.load(pos);
        }
        Some(packet.len)
    }

    /// Run `f` on a copy of a peeked packet's payload; `None` if it was dropped
    pub fn with_payload<R>(&self, packet: PacketRef, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let mut copy = [0u8; MAX_PAYLOAD];
        let len = self.read_payload(packet, &mut copy)?;
        Some(f(&copy[..len]))
    }

    /// Release a peeked packet, making its space writable again
    ///
    /// Dropping a packet that is not the pending one does nothing, so a
    /// repeated drop never moves the read position twice.
    pub fn drop_packet(&self, packet: PacketRef) {
        if self.pending() != Some(packet) {
            return;
        }
        self.pending_start.store(NONE, Ordering::Relaxed);
        self.publish((packet.start + packet.len + CRC_SIZE) & Self::MASK);
    }

    /// Hand every complete packet to `f`, dropping each afterwards
    ///
    /// End markers are skipped. Returns the number of packets delivered.
    pub fn drain(&self, mut f: impl FnMut(&[u8])) -> usize {
        let mut delivered = 0;
        loop {
            match self.peek() {
                Peek::NoPacket => return delivered,
                Peek::EndMarker => {}
                Peek::Packet(packet) => {
                    self.with_payload(packet, &mut f);
                    self.drop_packet(packet);
                    delivered += 1;
                }
            }
        }
    }

    /// Bytes lost to overruns
    pub fn overrun_bytes(&self) -> DiagCounter {
        DiagCounter(self.overrun.load(Ordering::Relaxed))
    }

    /// Frames discarded as malformed or failing their CRC
    pub fn invalid_packets(&self) -> DiagCounter {
        DiagCounter(self.invalid.load(Ordering::Relaxed))
    }

    /// Acknowledge both statistics flags
    pub fn clear_flags(&self) {
        clear_flag(&self.overrun);
        clear_flag(&self.invalid);
    }

    /// Whether no bytes are buffered
    pub fn is_empty(&self) -> bool {
        self.read_pos.load(Ordering::Relaxed) == self.write_pos.load(Ordering::Relaxed)
    }

    /// Number of buffered bytes, including consumed-but-unreleased ones
    pub fn buffered(&self) -> usize {
        let write_pos = self.write_pos.load(Ordering::Relaxed);
        write_pos.wrapping_sub(self.read_pos.load(Ordering::Relaxed)) & Self::MASK
    }

    /// Largest number of bytes the ring can hold
    pub const fn capacity(&self) -> usize {
        N - 1
    }

    fn load(&self, pos: usize) -> u8 {
        self.buffer[pos & Self::MASK].load(Ordering::Relaxed)
    }

    fn store(&self, pos: usize, byte: u8) {
        self.buffer[pos & Self::MASK].store(byte, Ordering::Relaxed);
    }

    fn publish(&self, read_pos: usize) {
        self.read_pos.store(read_pos, Ordering::Release);
    }

    fn pending(&self) -> Option<PacketRef> {
        let start = self.pending_start.load(Ordering::Relaxed);
        (start != NONE).then(|| PacketRef {
            start,
            len: self.pending_len.load(Ordering::Relaxed),
        })
    }

    fn discard(&self, resume: usize) -> Scan {
        self.publish(resume);
        bump(&self.invalid, 1);
        debug!("invalid frame discarded");
        Scan::Invalid
    }

    fn scan(&self) -> Scan {
        let write_pos = self.write_pos.load(Ordering::Acquire);
        let mut read_pos = self.read_pos.load(Ordering::Relaxed);
        if read_pos == write_pos {
            return Scan::Done(Peek::NoPacket);
        }

        // Skip to an ESC followed by anything but another ESC.
        let mut mask_pos = (read_pos + 1) & Self::MASK;
        while mask_pos != write_pos && (self.load(read_pos) != ESC || self.load(mask_pos) == ESC) {
            read_pos = mask_pos;
            mask_pos = (mask_pos + 1) & Self::MASK;
        }
        if mask_pos == write_pos {
            self.publish(read_pos);
            return Scan::Done(Peek::NoPacket);
        }

        let mask = self.load(mask_pos);
        if mask == END {
            self.publish((mask_pos + 1) & Self::MASK);
            return Scan::Done(Peek::EndMarker);
        }

        let mut data_begin = (mask_pos + 1) & Self::MASK;
        let mut data_end = data_begin;
        while data_end != write_pos && self.load(data_end) != ESC {
            data_end = (data_end + 1) & Self::MASK;
        }
        let size = data_end.wrapping_sub(data_begin) & Self::MASK;

        if data_end == write_pos {
            // Incomplete. A span already too long to be a frame never will be one.
            if size > MAX_CONTENT {
                read_pos = data_end;
                bump(&self.invalid, 1);
                debug!("unterminated {} byte frame discarded", size);
            }
            self.publish(read_pos);
            return Scan::Done(Peek::NoPacket);
        }
        if !(CRC_SIZE..=MAX_CONTENT).contains(&size) {
            return self.discard(data_end);
        }

        let crc_pos = data_end.wrapping_sub(CRC_SIZE) & Self::MASK;
        let mut crc = u32::from_le_bytes([
            self.load(crc_pos),
            self.load(crc_pos + 1),
            self.load(crc_pos + 2),
            self.load(crc_pos + 3),
        ]);

        if data_begin > crc_pos && crc_pos != 0 {
            match self.relocate(data_begin, crc_pos, data_end, size) {
                Some(start) => data_begin = start,
                None => return Scan::Invalid,
            }
        }

        let len = size - CRC_SIZE;
        let mut check = Crc32::new();
        for pos in data_begin..data_begin + len {
            let byte = self.load(pos) ^ mask;
            if mask != 0 {
                self.store(pos, byte);
            }
            check.add(byte);
        }
        if mask != 0 {
            crc ^= u32::from_le_bytes([mask; 4]);
        }
        if check.get() != crc {
            return self.discard(data_end);
        }

        self.pending_len.store(len, Ordering::Relaxed);
        self.pending_start.store(data_begin, Ordering::Relaxed);
        Scan::Done(Peek::Packet(PacketRef {
            start: data_begin,
            len,
        }))
    }

    /// Move content crossing the physical end back so it ends exactly there
    ///
    /// Returns the new start, or `None` when the producer is too close behind
    /// and the frame was dropped instead.
    fn relocate(
        &self,
        data_begin: usize,
        crc_pos: usize,
        data_end: usize,
        size: usize,
    ) -> Option<usize> {
        let start = data_begin - crc_pos;
        let claimed = free(|_| {
            let write_pos = self.write_pos.load(Ordering::Relaxed);
            let free_space = data_begin.wrapping_sub(write_pos + 1) & Self::MASK;
            let claimed = free_space > crc_pos;
            self.publish(if claimed { start } else { data_end });
            claimed
        });
        if !claimed {
            bump(&self.overrun, size + 2);
            warn!("no room to unwrap {} byte frame, dropped", size);
            return None;
        }

        // The destination lies below the source, so a forward copy is safe.
        for offset in 0..N - data_begin {
            self.store(start + offset, self.load(data_begin + offset));
        }
        let split = start + N - data_begin;
        for offset in 0..crc_pos {
            self.store(split + offset, self.load(offset));
        }
        for pos in 0..data_end {
            self.store(pos, 0);
        }
        Some(start)
    }
}

impl<const N: usize> Default for PacketInQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}
