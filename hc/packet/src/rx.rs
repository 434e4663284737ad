//! Circular DMA receive drain
//!
//! The UART receiver runs a DMA channel in circular mode over a small buffer.
//! Whenever the half/full-transfer interrupt fires, or the line goes quiet for
//! [`idle_timeout_ms`], the driver calls [`DmaRx::drain`] to move everything the
//! DMA wrote since the last call into a [`PacketInQueue`].

use core::cell::Cell;
use critical_section::Mutex;

use hc_core::guard::free;
use hc_core::ReentryFlag;

use crate::queue::PacketInQueue;

/// Outcome of one drain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Drained {
    /// Any byte was moved into the queue
    pub received: bool,
    /// The queue asked for its consumer to be scheduled
    pub notify: bool,
}

/// Read side of a circular DMA buffer of `M` bytes
///
/// `M` must be a power of two.
pub struct DmaRx<const M: usize> {
    read_index: Mutex<Cell<usize>>,
    total: Mutex<Cell<u32>>,
    reported: Mutex<Cell<u32>>,
    busy: ReentryFlag,
}

impl<const M: usize> DmaRx<M> {
    const MASK: usize = M - 1;

    const _ASSERT: () = assert!(M.is_power_of_two(), "DMA buffer size must be a power of two");

    /// Start reading at the beginning of the buffer
    pub const fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::_ASSERT;

        Self {
            read_index: Mutex::new(Cell::new(0)),
            total: Mutex::new(Cell::new(0)),
            reported: Mutex::new(Cell::new(0)),
            busy: ReentryFlag::new(),
        }
    }

    /// Copy newly received bytes from `buffer` into `queue`
    ///
    /// `remaining` reads the DMA channel's transfer counter (bytes left until
    /// the buffer wraps). It is sampled again after each pass, so bytes that
    /// arrive during the drain are picked up too. Returns `None` when a drain
    /// is already running, for example when the receive interrupt preempts the
    /// timeout work doing the same.
    pub fn drain<const N: usize>(
        &self,
        buffer: &[u8; M],
        mut remaining: impl FnMut() -> usize,
        queue: &PacketInQueue<N>,
    ) -> Option<Drained> {
        let _token = self.busy.try_enter()?;
        let mut drained = Drained::default();
        let mut read = free(|cs| self.read_index.borrow(cs).get());
        let mut moved = 0usize;

        loop {
            let write = M.wrapping_sub(remaining()) & Self::MASK;
            if write == read {
                break;
            }
            drained.received = true;
            if read > write {
                drained.notify |= queue.write(&buffer[read..]);
                moved += M - read;
                read = 0;
            }
            if read < write {
                drained.notify |= queue.write(&buffer[read..write]);
                moved += write - read;
                read = write;
            }
        }

        free(|cs| self.read_index.borrow(cs).set(read));
        self.account(moved);
        Some(drained)
    }

    /// Total bytes moved so far, wrapping at `u32::MAX`
    pub fn total_received(&self) -> u32 {
        free(|cs| self.total.borrow(cs).get())
    }

    fn account(&self, moved: usize) {
        let total = free(|cs| {
            let total = self.total.borrow(cs);
            total.set(total.get().wrapping_add(moved as u32));
            total.get()
        });
        let reported = free(|cs| self.reported.borrow(cs).get());
        if total.wrapping_sub(reported) >= 1024 {
            info!("uart received {} KiB", total / 1024);
            free(|cs| self.reported.borrow(cs).set(total));
        }
    }
}

impl<const M: usize> Default for DmaRx<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// Line idle timeout in milliseconds for a receive buffer of `buffer_len` bytes
///
/// 80% of the time the line needs to fill the buffer at `baud` (10 bits per
/// byte), rounded up, plus one; never below 2 ms.
pub const fn idle_timeout_ms(baud: u32, buffer_len: usize) -> u32 {
    let bytes_per_sec = if baud >= 10 { baud as u64 / 10 } else { 1 };
    let fill_ms = buffer_len as u64 * 1000;
    let timeout = ((fill_ms + bytes_per_sec - 1) * 4) / (5 * bytes_per_sec) + 1;
    if timeout < 2 {
        2
    } else if timeout > u32::MAX as u64 {
        u32::MAX
    } else {
        timeout as u32
    }
}
