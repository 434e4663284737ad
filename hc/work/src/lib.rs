#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![forbid(unsafe_code)]

//! # HC Work
//!
//! Cooperative scheduler for the firmware main loop. Work items run to
//! completion in priority order; interrupt handlers only queue them. Delayed
//! items wait in a deadline-ordered list and idle items run whenever nothing
//! else is ready, right before the processor sleeps.
//!
//! With the `irq-priority` feature a fourth tier is dispatched straight from
//! interrupt context through [`Scheduler::process_irq`].

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod scheduler;
pub mod work;

pub use scheduler::Scheduler;
pub use work::{
    Context, DelayedWorkId, Executor, Handler, IdleWorkId, Priority, Step, WorkId, WorkKey,
    WorkState,
};
