//! Work item handles, states and the handler context

use core::fmt;

use hc_core::Instant;

/// Dispatch tier of a work item
///
/// Higher tiers always run first; items in one tier run in FIFO order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    /// Dispatched from interrupt context by `Scheduler::process_irq`
    #[cfg(feature = "irq-priority")]
    Irq = 3,
}

impl Priority {
    pub(crate) const fn tier(self) -> usize {
        self as usize
    }
}

/// Lifecycle state of a work item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WorkState {
    /// Not in any list
    Idle,
    /// Callback is executing
    Running,
    /// Waiting in a run tier
    Queued,
    /// Waiting in a delayed list for its deadline
    Scheduled,
}

impl fmt::Display for WorkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkState::Idle => write!(f, "Idle"),
            WorkState::Running => write!(f, "Running"),
            WorkState::Queued => write!(f, "Queued"),
            WorkState::Scheduled => write!(f, "Scheduled"),
        }
    }
}

/// Handle of an immediate work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct WorkId(pub(crate) u16);

/// Handle of a delayed work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DelayedWorkId(pub(crate) u16);

/// Handle of an idle work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct IdleWorkId(pub(crate) u16);

/// Any registered item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WorkKey {
    Work(WorkId),
    Delayed(DelayedWorkId),
    Idle(IdleWorkId),
}

impl WorkKey {
    pub(crate) const fn slot(self) -> usize {
        match self {
            WorkKey::Work(WorkId(index))
            | WorkKey::Delayed(DelayedWorkId(index))
            | WorkKey::Idle(IdleWorkId(index)) => index as usize,
        }
    }
}

impl From<WorkId> for WorkKey {
    fn from(id: WorkId) -> Self {
        WorkKey::Work(id)
    }
}

impl From<DelayedWorkId> for WorkKey {
    fn from(id: DelayedWorkId) -> Self {
        WorkKey::Delayed(id)
    }
}

impl From<IdleWorkId> for WorkKey {
    fn from(id: IdleWorkId) -> Self {
        WorkKey::Idle(id)
    }
}

/// Callback of a work item
pub type Handler<'a> = &'a (dyn Fn(&Context<'_>) + Sync);

/// Scheduling operations available without naming the scheduler's type
///
/// Handlers only see a `&dyn Executor`, so they can re-arm themselves or
/// trigger other items regardless of the port and capacity the scheduler was
/// built with.
pub trait Executor {
    /// Queue an immediate item on its tier; no effect if already queued
    fn run(&self, work: WorkId);

    /// Take a queued item off its tier; no effect otherwise
    fn cancel(&self, work: WorkId);

    /// Schedule a delayed item `delay` ticks from now
    ///
    /// From inside the item's own callback the delay counts from its previous
    /// deadline instead, which keeps periodic work on a fixed cadence. With
    /// `reschedule` false an already pending item keeps its deadline.
    fn run_after(&self, work: DelayedWorkId, delay: u32, reschedule: bool);

    /// Schedule a delayed item at an absolute deadline
    fn run_at(&self, work: DelayedWorkId, deadline: Instant, reschedule: bool);

    /// Take a delayed item out of the delayed list or its run tier
    fn cancel_delayed(&self, work: DelayedWorkId);

    /// Add an idle item to the set run whenever nothing else is ready
    fn enable_idle(&self, work: IdleWorkId);

    /// Remove an idle item from the idle set
    fn disable_idle(&self, work: IdleWorkId);

    /// Current state of any item
    fn state(&self, key: WorkKey) -> WorkState;

    /// Cached time of the current dispatch pass
    fn now(&self) -> Instant;
}

/// What a handler gets when it is invoked
pub struct Context<'c> {
    key: WorkKey,
    executor: &'c dyn Executor,
}

impl<'c> Context<'c> {
    pub(crate) fn new(key: WorkKey, executor: &'c dyn Executor) -> Self {
        Self { key, executor }
    }

    /// The item being run
    pub fn key(&self) -> WorkKey {
        self.key
    }

    /// The scheduler running this item
    pub fn executor(&self) -> &'c dyn Executor {
        self.executor
    }

    /// Cached time of the current dispatch pass
    pub fn now(&self) -> Instant {
        self.executor.now()
    }

    /// Run the current item again as soon as its tier allows
    ///
    /// Delayed items are re-armed with a zero delay from their own deadline.
    /// Idle items stay in the idle set anyway, so this is a no-op for them.
    pub fn requeue(&self) {
        match self.key {
            WorkKey::Work(id) => self.executor.run(id),
            WorkKey::Delayed(id) => self.executor.run_after(id, 0, true),
            WorkKey::Idle(_) => {}
        }
    }

    /// Re-arm the current delayed item `delay` ticks after its deadline
    pub fn run_after(&self, delay: u32) {
        match self.key {
            WorkKey::Delayed(id) => self.executor.run_after(id, delay, true),
            _ => hc_core::assert::fail(),
        }
    }
}

/// Outcome of one dispatch pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Step {
    /// One item ran
    Ran(WorkKey),
    /// Nothing was ready; idle items ran
    Idle,
}
