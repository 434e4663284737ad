//! Capabilities the board must provide to the core
//!
//! The core never touches peripheral registers itself. A board crate
//! implements these traits over its timer and event hardware and hands one
//! value to the scheduler at construction.

/// Free-running 16-bit hardware counter with one compare channel
pub trait Timer16 {
    /// Current counter value
    fn counter(&self) -> u16;

    /// Arm the compare channel; its match raises the wake-up interrupt
    fn set_compare(&self, value: u16);
}

/// Processor event flag used to sleep the main loop
pub trait Events {
    /// Set the event flag so the next `wait` returns immediately
    fn signal(&self);

    /// Sleep until an interrupt or the event flag; consumes the flag
    fn wait(&self);

    /// Request the interrupt that dispatches interrupt-tier work
    ///
    /// Only used with the `irq-priority` scheduler tier.
    fn pend_irq_dispatch(&self) {}
}

/// Everything the scheduler needs from the board
pub trait Port: Timer16 + Events {}

impl<T: Timer16 + Events> Port for T {}

/// `Events` on ARM Cortex-M through the SEV/WFE instructions
#[cfg(feature = "cortex-m")]
#[derive(Debug, Clone, Copy, Default)]
pub struct CortexEvents;

#[cfg(feature = "cortex-m")]
impl Events for CortexEvents {
    #[inline]
    fn signal(&self) {
        cortex_m::asm::sev();
    }

    #[inline]
    fn wait(&self) {
        cortex_m::asm::wfe();
    }

    fn pend_irq_dispatch(&self) {
        cortex_m::peripheral::SCB::set_pendsv();
    }
}
