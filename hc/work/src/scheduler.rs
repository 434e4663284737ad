//! Cooperative work scheduler
//!
//! One [`Scheduler`] owns every registered item. Items sit in at most one of
//! the run tiers, the delayed list or the idle set; all list and state changes
//! happen under a critical section, while callbacks always run outside it.

use core::cell::RefCell;
use critical_section::Mutex;

use hc_core::guard::free;
use hc_core::{hc_assert, HcError, HcResult, Instant, IntrusiveList, Port, TimeSource};
use hc_core::MAX_SLEEP_TICKS;

use crate::work::{
    Context, DelayedWorkId, Executor, Handler, IdleWorkId, Priority, Step, WorkId, WorkKey,
    WorkState,
};

#[cfg(not(feature = "irq-priority"))]
const RUN_TIERS: usize = 3;
#[cfg(feature = "irq-priority")]
const RUN_TIERS: usize = 4;

/// Tiers drained by the main loop; the interrupt tier is not among them
const MAIN_TIERS: usize = 3;

const DELAYED: usize = RUN_TIERS;
const IRQ_DELAYED: usize = RUN_TIERS + 1;
const IDLE: usize = RUN_TIERS + 2;
const LISTS: usize = RUN_TIERS + 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Free,
    Work,
    Delayed,
    Idle,
}

#[derive(Clone, Copy)]
struct Slot<'a> {
    kind: Kind,
    priority: Priority,
    state: WorkState,
    deadline: Instant,
    handler: Option<Handler<'a>>,
}

impl Slot<'_> {
    const EMPTY: Self = Self {
        kind: Kind::Free,
        priority: Priority::Normal,
        state: WorkState::Idle,
        deadline: Instant::ZERO,
        handler: None,
    };
}

struct Queues<'a, const N: usize> {
    lists: IntrusiveList<LISTS, N>,
    slots: [Slot<'a>; N],
}

impl<'a, const N: usize> Queues<'a, N> {
    const fn new() -> Self {
        Self {
            lists: IntrusiveList::new(),
            slots: [Slot::EMPTY; N],
        }
    }

    fn slot(&self, index: usize, kind: Kind) -> &Slot<'a> {
        let slot = &self.slots[index];
        hc_assert!(slot.kind == kind);
        slot
    }

    fn key(&self, index: usize) -> WorkKey {
        let id = index as u16;
        match self.slots[index].kind {
            Kind::Work => WorkKey::Work(WorkId(id)),
            Kind::Delayed => WorkKey::Delayed(DelayedWorkId(id)),
            Kind::Idle => WorkKey::Idle(IdleWorkId(id)),
            Kind::Free => hc_core::assert::fail(),
        }
    }

    fn enqueue(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        slot.state = WorkState::Queued;
        let tier = slot.priority.tier();
        self.lists.push_back(tier, index);
    }

    fn unlink(&mut self, index: usize) {
        self.lists.remove(index);
        self.slots[index].state = WorkState::Idle;
    }

    fn delayed_list(&self, index: usize) -> usize {
        match self.slots[index].priority {
            #[cfg(feature = "irq-priority")]
            Priority::Irq => IRQ_DELAYED,
            _ => DELAYED,
        }
    }

    /// Insert a delayed item behind every item due no later than `deadline`
    fn schedule(&mut self, index: usize, deadline: Instant, reschedule: bool) -> bool {
        let state = self.slot(index, Kind::Delayed).state;
        if matches!(state, WorkState::Queued | WorkState::Scheduled) {
            if !reschedule {
                return false;
            }
            self.unlink(index);
        }

        let list = self.delayed_list(index);
        let anchor = self
            .lists
            .iter(list)
            .find(|&other| self.slots[other].deadline > deadline);
        match anchor {
            Some(anchor) => self.lists.insert_before(index, anchor),
            None => self.lists.push_back(list, index),
        }

        let slot = &mut self.slots[index];
        slot.deadline = deadline;
        slot.state = WorkState::Scheduled;
        true
    }

    /// Whether the head of a delayed list is due at `now`
    fn is_due(&self, list: usize, now: Instant) -> bool {
        self.lists
            .front(list)
            .is_some_and(|index| self.slots[index].deadline <= now)
    }

    /// Move the head of a delayed list to its run tier if it is due
    fn promote_due(&mut self, list: usize, now: Instant) -> bool {
        match self.lists.front(list) {
            Some(index) if self.is_due(list, now) => {
                self.enqueue(index);
                true
            }
            _ => false,
        }
    }

    fn earliest_deadline(&self) -> Option<Instant> {
        let first = |list: usize| self.lists.front(list).map(|index| self.slots[index].deadline);
        match (first(DELAYED), first(IRQ_DELAYED)) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn pop(&mut self, tiers: core::ops::Range<usize>) -> Option<(usize, Handler<'a>)> {
        for tier in tiers.rev() {
            if let Some(index) = self.lists.front(tier) {
                self.lists.remove(index);
                let slot = &mut self.slots[index];
                slot.state = WorkState::Running;
                if let Some(handler) = slot.handler {
                    return Some((index, handler));
                }
            }
        }
        None
    }
}

/// Root scheduling context
///
/// Built once at startup, typically as a `static`, and shared by interrupt
/// handlers (which queue and schedule work) and the main loop (which runs it).
/// `N` bounds the total number of registered items of all kinds.
///
/// ```ignore
/// static SCHEDULER: Scheduler<'static, Board, 16> = Scheduler::new(Board::new());
/// ```
pub struct Scheduler<'a, P: Port, const N: usize> {
    port: P,
    time: TimeSource,
    queues: Mutex<RefCell<Queues<'a, N>>>,
}

impl<'a, P: Port, const N: usize> Scheduler<'a, P, N> {
    /// Create a scheduler with no registered items
    pub const fn new(port: P) -> Self {
        Self {
            port,
            time: TimeSource::new(),
            queues: Mutex::new(RefCell::new(Queues::new())),
        }
    }

    /// The board port the scheduler drives
    pub fn port(&self) -> &P {
        &self.port
    }

    /// The time source advanced by the dispatch loop
    pub fn time(&self) -> &TimeSource {
        &self.time
    }

    fn with<R>(&self, f: impl FnOnce(&mut Queues<'a, N>) -> R) -> R {
        free(|cs| f(&mut self.queues.borrow_ref_mut(cs)))
    }

    fn register(&self, kind: Kind, priority: Priority, handler: Handler<'a>) -> HcResult<u16> {
        self.with(|queues| {
            let index = queues
                .slots
                .iter()
                .position(|slot| slot.kind == Kind::Free)
                .ok_or(HcError::CapacityExceeded)?;
            queues.slots[index] = Slot {
                kind,
                priority,
                handler: Some(handler),
                ..Slot::EMPTY
            };
            Ok(index as u16)
        })
        .inspect_err(|_| warn!("work table full ({} slots)", N))
    }

    /// Register an immediate item
    pub fn add_work(&self, priority: Priority, handler: Handler<'a>) -> HcResult<WorkId> {
        self.register(Kind::Work, priority, handler).map(WorkId)
    }

    /// Register a delayed item
    pub fn add_delayed(&self, priority: Priority, handler: Handler<'a>) -> HcResult<DelayedWorkId> {
        self.register(Kind::Delayed, priority, handler)
            .map(DelayedWorkId)
    }

    /// Register an idle item; it stays disabled until [`enable_idle`](Self::enable_idle)
    pub fn add_idle(&self, handler: Handler<'a>) -> HcResult<IdleWorkId> {
        self.register(Kind::Idle, Priority::Low, handler)
            .map(IdleWorkId)
    }

    /// Queue an immediate item on its tier
    ///
    /// Safe from interrupt context. Queuing an already queued item does
    /// nothing; queuing a running item runs it again after it returns.
    pub fn run(&self, work: WorkId) {
        self.port.signal();
        let index = usize::from(work.0);
        let _priority = self.with(|queues| {
            let slot = queues.slot(index, Kind::Work);
            if slot.state != WorkState::Queued {
                queues.enqueue(index);
            }
            queues.slots[index].priority
        });

        #[cfg(feature = "irq-priority")]
        if _priority == Priority::Irq {
            self.port.pend_irq_dispatch();
        }
    }

    /// Take a queued item off its tier
    pub fn cancel(&self, work: WorkId) {
        let index = usize::from(work.0);
        self.with(|queues| {
            if queues.slot(index, Kind::Work).state == WorkState::Queued {
                queues.unlink(index);
            }
        });
    }

    /// Schedule a delayed item `delay` ticks from now, or from its own deadline while it runs
    pub fn run_after(&self, work: DelayedWorkId, delay: u32, reschedule: bool) {
        self.port.signal();
        let index = usize::from(work.0);
        let now = self.time.now();
        self.with(|queues| {
            let slot = queues.slot(index, Kind::Delayed);
            let base = if slot.state == WorkState::Running {
                slot.deadline
            } else {
                now
            };
            if queues.schedule(index, base.after(delay), reschedule) {
                trace!("delayed work {} due in {} ticks", index, delay);
            }
        });
    }

    /// Schedule a delayed item at an absolute deadline
    pub fn run_at(&self, work: DelayedWorkId, deadline: Instant, reschedule: bool) {
        self.port.signal();
        let index = usize::from(work.0);
        self.with(|queues| queues.schedule(index, deadline, reschedule));
    }

    /// Take a delayed item out of the delayed list or its run tier
    pub fn cancel_delayed(&self, work: DelayedWorkId) {
        let index = usize::from(work.0);
        self.with(|queues| {
            let state = queues.slot(index, Kind::Delayed).state;
            if matches!(state, WorkState::Queued | WorkState::Scheduled) {
                queues.unlink(index);
            }
        });
    }

    /// Pending deadline of a scheduled delayed item
    pub fn deadline(&self, work: DelayedWorkId) -> Option<Instant> {
        let index = usize::from(work.0);
        self.with(|queues| {
            let slot = queues.slot(index, Kind::Delayed);
            (slot.state == WorkState::Scheduled).then_some(slot.deadline)
        })
    }

    /// Add an idle item to the idle set; no effect if already there
    pub fn enable_idle(&self, work: IdleWorkId) {
        let index = usize::from(work.0);
        self.with(|queues| {
            queues.slot(index, Kind::Idle);
            if !queues.lists.is_linked(index) {
                queues.lists.push_back(IDLE, index);
            }
        });
    }

    /// Remove an idle item from the idle set
    pub fn disable_idle(&self, work: IdleWorkId) {
        let index = usize::from(work.0);
        self.with(|queues| {
            queues.slot(index, Kind::Idle);
            queues.lists.remove(index);
        });
    }

    /// Current state of any item; enabled idle items report `Queued`
    pub fn state(&self, key: WorkKey) -> WorkState {
        let index = key.slot();
        self.with(|queues| match key {
            WorkKey::Work(_) => queues.slot(index, Kind::Work).state,
            WorkKey::Delayed(_) => queues.slot(index, Kind::Delayed).state,
            WorkKey::Idle(_) => {
                queues.slot(index, Kind::Idle);
                if queues.lists.is_linked(index) {
                    WorkState::Queued
                } else {
                    WorkState::Idle
                }
            }
        })
    }

    /// Cached time of the current dispatch pass
    pub fn now(&self) -> Instant {
        self.time.now()
    }

    /// Earliest pending deadline over both delayed lists
    pub fn earliest_deadline(&self) -> Option<Instant> {
        self.with(|queues| queues.earliest_deadline())
    }

    /// Refresh the time, move due delayed items to their run tiers and arm the next wake-up
    ///
    /// Returns how many items became ready.
    pub fn process_delayed(&self) -> usize {
        let now = self.time.precise(&self.port);
        let mut promoted = 0;
        // One short critical section per item keeps interrupt latency bounded.
        while self.with(|queues| queues.promote_due(DELAYED, now)) {
            promoted += 1;
        }
        if promoted > 0 {
            trace!("{} delayed items ready", promoted);
        }
        self.arm_wake_up(now);
        promoted
    }

    fn arm_wake_up(&self, now: Instant) {
        let wake = self
            .earliest_deadline()
            .unwrap_or(now.after(MAX_SLEEP_TICKS as u32));
        self.time.schedule_wake_up(&self.port, &self.port, wake);

        // The compare match is already behind us and only wakes the main loop,
        // which never drains the interrupt tier.
        #[cfg(feature = "irq-priority")]
        if self.with(|queues| queues.is_due(IRQ_DELAYED, now)) {
            self.port.pend_irq_dispatch();
        }
    }

    fn dispatch(&self, index: usize, handler: Handler<'a>) -> WorkKey {
        let key = self.with(|queues| queues.key(index));
        handler(&Context::new(key, self));
        self.with(|queues| {
            let slot = &mut queues.slots[index];
            if slot.state == WorkState::Running {
                slot.state = WorkState::Idle;
            }
        });
        key
    }

    /// Run every enabled idle item once
    ///
    /// Items disabled by an earlier idle callback in the same pass are skipped.
    pub fn execute_idle(&self) {
        let pending: heapless::Vec<(usize, Handler<'a>), N> = self.with(|queues| {
            queues
                .lists
                .iter(IDLE)
                .filter_map(|index| Some((index, queues.slots[index].handler?)))
                .collect()
        });

        for (index, handler) in pending {
            if self.with(|queues| queues.lists.is_linked(index)) {
                handler(&Context::new(WorkKey::Idle(IdleWorkId(index as u16)), self));
            }
        }
    }

    /// One dispatch pass: promote due items, then run the highest ready item or the idle set
    pub fn step(&self) -> Step {
        self.process_delayed();
        match self.with(|queues| queues.pop(0..MAIN_TIERS)) {
            Some((index, handler)) => Step::Ran(self.dispatch(index, handler)),
            None => {
                self.execute_idle();
                Step::Idle
            }
        }
    }

    /// Main loop; never returns
    pub fn run_loop(&self) -> ! {
        info!("scheduler started, {} slots", N);
        loop {
            // Clear the event flag so the second wait sleeps unless something happened.
            self.port.signal();
            self.port.wait();
            if self.step() == Step::Idle {
                self.port.wait();
            }
        }
    }

    /// Drain the interrupt tier; call from the dispatch and timer interrupts
    #[cfg(feature = "irq-priority")]
    pub fn process_irq(&self) -> usize {
        let now = self.time.precise(&self.port);
        while self.with(|queues| queues.promote_due(IRQ_DELAYED, now)) {}

        let irq = Priority::Irq.tier();
        let mut ran = 0;
        while let Some((index, handler)) = self.with(|queues| queues.pop(irq..irq + 1)) {
            self.dispatch(index, handler);
            ran += 1;
        }
        self.arm_wake_up(now);
        ran
    }
}

impl<P: Port, const N: usize> Executor for Scheduler<'_, P, N> {
    fn run(&self, work: WorkId) {
        Scheduler::run(self, work)
    }

    fn cancel(&self, work: WorkId) {
        Scheduler::cancel(self, work)
    }

    fn run_after(&self, work: DelayedWorkId, delay: u32, reschedule: bool) {
        Scheduler::run_after(self, work, delay, reschedule)
    }

    fn run_at(&self, work: DelayedWorkId, deadline: Instant, reschedule: bool) {
        Scheduler::run_at(self, work, deadline, reschedule)
    }

    fn cancel_delayed(&self, work: DelayedWorkId) {
        Scheduler::cancel_delayed(self, work)
    }

    fn enable_idle(&self, work: IdleWorkId) {
        Scheduler::enable_idle(self, work)
    }

    fn disable_idle(&self, work: IdleWorkId) {
        Scheduler::disable_idle(self, work)
    }

    fn state(&self, key: WorkKey) -> WorkState {
        Scheduler::state(self, key)
    }

    fn now(&self) -> Instant {
        Scheduler::now(self)
    }
}
