//! Scheduler tests for hc-work
//! These run on the host with a mock port standing in for the timer and event hardware

use std::cell::Cell;
use std::sync::{Mutex, OnceLock};

use hc_core::{Events, HcError, Instant, Timer16, MAX_SLEEP_TICKS};
use hc_work::{Handler, IdleWorkId, Priority, Scheduler, Step, WorkKey, WorkState};

#[derive(Default)]
struct MockPort {
    counter: Cell<u16>,
    compare: Cell<Option<u16>>,
    signals: Cell<u32>,
    pends: Cell<u32>,
}

impl MockPort {
    fn advance(&self, ticks: u16) {
        self.counter.set(self.counter.get().wrapping_add(ticks));
    }
}

impl Timer16 for MockPort {
    fn counter(&self) -> u16 {
        self.counter.get()
    }

    fn set_compare(&self, value: u16) {
        self.compare.set(Some(value));
    }
}

impl Events for MockPort {
    fn signal(&self) {
        self.signals.set(self.signals.get() + 1);
    }

    fn wait(&self) {}

    fn pend_irq_dispatch(&self) {
        self.pends.set(self.pends.get() + 1);
    }
}

/// Records the order handlers ran in
#[derive(Default)]
struct Trace(Mutex<Vec<&'static str>>);

impl Trace {
    fn push(&self, name: &'static str) {
        self.0.lock().unwrap().push(name);
    }

    fn take(&self) -> Vec<&'static str> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

fn scheduler<'a>() -> Scheduler<'a, MockPort, 8> {
    Scheduler::new(MockPort::default())
}

#[test]
fn test_higher_tier_runs_first() {
    let trace = Trace::default();
    let low: Handler<'_> = &|_| trace.push("low");
    let normal: Handler<'_> = &|_| trace.push("normal");
    let high: Handler<'_> = &|_| trace.push("high");

    let sched = scheduler();
    let low = sched.add_work(Priority::Low, low).unwrap();
    let normal = sched.add_work(Priority::Normal, normal).unwrap();
    let high = sched.add_work(Priority::High, high).unwrap();

    sched.run(low);
    sched.run(normal);
    sched.run(high);

    assert_eq!(sched.step(), Step::Ran(WorkKey::Work(high)));
    assert_eq!(sched.step(), Step::Ran(WorkKey::Work(normal)));
    assert_eq!(sched.step(), Step::Ran(WorkKey::Work(low)));
    assert_eq!(sched.step(), Step::Idle);
    assert_eq!(trace.take(), vec!["high", "normal", "low"]);
}

#[test]
fn test_fifo_within_tier() {
    let trace = Trace::default();
    let a: Handler<'_> = &|_| trace.push("a");
    let b: Handler<'_> = &|_| trace.push("b");
    let c: Handler<'_> = &|_| trace.push("c");

    let sched = scheduler();
    let ids = [a, b, c].map(|handler| sched.add_work(Priority::Normal, handler).unwrap());

    sched.run(ids[1]);
    sched.run(ids[2]);
    sched.run(ids[0]);
    while sched.step() != Step::Idle {}

    assert_eq!(trace.take(), vec!["b", "c", "a"]);
}

#[test]
fn test_run_is_idempotent_while_queued() {
    let trace = Trace::default();
    let work: Handler<'_> = &|_| trace.push("work");

    let sched = scheduler();
    let id = sched.add_work(Priority::Normal, work).unwrap();

    sched.run(id);
    sched.run(id);
    assert_eq!(sched.state(id.into()), WorkState::Queued);
    assert_eq!(sched.port().signals.get(), 2);

    assert_eq!(sched.step(), Step::Ran(id.into()));
    assert_eq!(sched.step(), Step::Idle);
    assert_eq!(trace.take(), vec!["work"]);
    assert_eq!(sched.state(id.into()), WorkState::Idle);
}

#[test]
fn test_cancel_only_affects_queued() {
    let trace = Trace::default();
    let work: Handler<'_> = &|_| trace.push("work");

    let sched = scheduler();
    let id = sched.add_work(Priority::High, work).unwrap();

    sched.cancel(id);
    assert_eq!(sched.state(id.into()), WorkState::Idle);

    sched.run(id);
    sched.cancel(id);
    assert_eq!(sched.state(id.into()), WorkState::Idle);
    assert_eq!(sched.step(), Step::Idle);
    assert!(trace.take().is_empty());
}

#[test]
fn test_handler_sees_running_and_requeues() {
    let runs = Mutex::new(Vec::new());
    let work: Handler<'_> = &|ctx| {
        let state = ctx.executor().state(ctx.key());
        let mut runs = runs.lock().unwrap();
        runs.push(state);
        if runs.len() < 3 {
            ctx.requeue();
        }
    };

    let sched = scheduler();
    let id = sched.add_work(Priority::Normal, work).unwrap();
    sched.run(id);

    let mut passes = 0;
    while sched.step() != Step::Idle {
        passes += 1;
    }
    assert_eq!(passes, 3);
    assert_eq!(*runs.lock().unwrap(), vec![WorkState::Running; 3]);
    assert_eq!(sched.state(id.into()), WorkState::Idle);
}

#[test]
fn test_delayed_runs_at_deadline() {
    let trace = Trace::default();
    let timeout: Handler<'_> = &|_| trace.push("timeout");

    let sched = scheduler();
    let id = sched.add_delayed(Priority::Normal, timeout).unwrap();

    sched.run_after(id, 100, true);
    assert_eq!(sched.state(id.into()), WorkState::Scheduled);
    assert_eq!(sched.deadline(id), Some(Instant::from_ticks(100)));

    sched.port().advance(99);
    assert_eq!(sched.step(), Step::Idle);
    assert!(trace.take().is_empty());

    sched.port().advance(1);
    assert_eq!(sched.step(), Step::Ran(id.into()));
    assert_eq!(trace.take(), vec!["timeout"]);
    assert_eq!(sched.state(id.into()), WorkState::Idle);
    assert_eq!(sched.deadline(id), None);
}

#[test]
fn test_periodic_work_keeps_cadence() {
    let ticks = Mutex::new(Vec::new());
    let periodic: Handler<'_> = &|ctx| {
        ticks.lock().unwrap().push(ctx.now().ticks());
        ctx.run_after(100);
    };

    let sched = scheduler();
    let id = sched.add_delayed(Priority::Normal, periodic).unwrap();
    sched.run_after(id, 100, true);

    // Dispatched late: the next deadline still counts from the previous one.
    sched.port().advance(130);
    assert_eq!(sched.step(), Step::Ran(id.into()));
    assert_eq!(sched.deadline(id), Some(Instant::from_ticks(200)));

    sched.port().advance(75);
    assert_eq!(sched.step(), Step::Ran(id.into()));
    assert_eq!(sched.deadline(id), Some(Instant::from_ticks(300)));

    assert_eq!(*ticks.lock().unwrap(), vec![130, 205]);
}

#[test]
fn test_reschedule_flag() {
    let nop: Handler<'_> = &|_| {};
    let sched = scheduler();
    let id = sched.add_delayed(Priority::Low, nop).unwrap();

    sched.run_after(id, 100, true);
    sched.run_after(id, 50, false);
    assert_eq!(sched.deadline(id), Some(Instant::from_ticks(100)));

    sched.run_after(id, 50, true);
    assert_eq!(sched.deadline(id), Some(Instant::from_ticks(50)));

    sched.run_at(id, Instant::from_ticks(700), false);
    assert_eq!(sched.deadline(id), Some(Instant::from_ticks(50)));
}

#[test]
fn test_equal_deadlines_run_in_schedule_order() {
    let trace = Trace::default();
    let first: Handler<'_> = &|_| trace.push("first");
    let second: Handler<'_> = &|_| trace.push("second");
    let early: Handler<'_> = &|_| trace.push("early");

    let sched = scheduler();
    let first = sched.add_delayed(Priority::Normal, first).unwrap();
    let second = sched.add_delayed(Priority::Normal, second).unwrap();
    let early = sched.add_delayed(Priority::Normal, early).unwrap();

    sched.run_at(first, Instant::from_ticks(40), true);
    sched.run_at(second, Instant::from_ticks(40), true);
    sched.run_at(early, Instant::from_ticks(10), true);

    sched.port().advance(50);
    while sched.step() != Step::Idle {}
    assert_eq!(trace.take(), vec!["early", "first", "second"]);
}

#[test]
fn test_cancel_delayed() {
    let trace = Trace::default();
    let work: Handler<'_> = &|_| trace.push("work");

    let sched = scheduler();
    let id = sched.add_delayed(Priority::High, work).unwrap();

    sched.run_after(id, 10, true);
    sched.cancel_delayed(id);
    assert_eq!(sched.state(id.into()), WorkState::Idle);

    sched.port().advance(20);
    assert_eq!(sched.step(), Step::Idle);
    assert!(trace.take().is_empty());
}

#[test]
fn test_idle_work_runs_only_when_nothing_ready() {
    let trace = Trace::default();
    let idle: Handler<'_> = &|_| trace.push("idle");
    let work: Handler<'_> = &|_| trace.push("work");

    let sched = scheduler();
    let idle = sched.add_idle(idle).unwrap();
    let work = sched.add_work(Priority::Low, work).unwrap();

    assert_eq!(sched.state(idle.into()), WorkState::Idle);
    sched.enable_idle(idle);
    sched.enable_idle(idle);
    assert_eq!(sched.state(idle.into()), WorkState::Queued);

    sched.run(work);
    assert_eq!(sched.step(), Step::Ran(work.into()));
    assert_eq!(sched.step(), Step::Idle);
    assert_eq!(trace.take(), vec!["work", "idle"]);

    sched.disable_idle(idle);
    assert_eq!(sched.step(), Step::Idle);
    assert!(trace.take().is_empty());
}

#[test]
fn test_idle_work_disabled_during_pass_is_skipped() {
    let trace = Trace::default();
    let victim = OnceLock::<IdleWorkId>::new();
    let first: Handler<'_> = &|ctx| {
        trace.push("first");
        if let Some(&victim) = victim.get() {
            ctx.executor().disable_idle(victim);
        }
    };
    let second: Handler<'_> = &|_| trace.push("second");

    let sched = scheduler();
    let first = sched.add_idle(first).unwrap();
    let second = sched.add_idle(second).unwrap();
    victim.set(second).unwrap();

    sched.enable_idle(first);
    sched.enable_idle(second);
    sched.execute_idle();

    assert_eq!(trace.take(), vec!["first"]);
    assert_eq!(sched.state(second.into()), WorkState::Idle);
}

#[test]
fn test_wake_up_follows_earliest_deadline() {
    let nop: Handler<'_> = &|_| {};
    let sched = scheduler();
    let near = sched.add_delayed(Priority::Normal, nop).unwrap();
    let far = sched.add_delayed(Priority::Normal, nop).unwrap();

    sched.port().advance(1000);
    sched.step();
    assert_eq!(
        sched.port().compare.get(),
        Some(1000 + MAX_SLEEP_TICKS as u16)
    );

    sched.run_at(far, Instant::from_ticks(200_000), true);
    sched.step();
    assert_eq!(
        sched.port().compare.get(),
        Some(1000 + MAX_SLEEP_TICKS as u16)
    );

    sched.run_at(near, Instant::from_ticks(1500), true);
    sched.step();
    assert_eq!(sched.port().compare.get(), Some(1500));
    assert_eq!(sched.earliest_deadline(), Some(Instant::from_ticks(1500)));
}

#[test]
fn test_time_extends_across_counter_wraps() {
    let sched = scheduler();
    for _ in 0..10 {
        sched.port().advance(10_000);
        sched.step();
    }
    assert_eq!(sched.now(), Instant::from_ticks(100_000));
}

#[test]
fn test_capacity_exceeded() {
    let nop: Handler<'_> = &|_| {};
    let sched: Scheduler<'_, MockPort, 2> = Scheduler::new(MockPort::default());
    assert!(sched.add_work(Priority::Normal, nop).is_ok());
    assert!(sched.add_idle(nop).is_ok());
    assert_eq!(
        sched.add_delayed(Priority::Normal, nop),
        Err(HcError::CapacityExceeded)
    );
}

#[cfg(feature = "irq-priority")]
mod irq_tier {
    use super::*;

    #[test]
    fn test_irq_work_bypasses_main_loop() {
        let trace = Trace::default();
        let urgent: Handler<'_> = &|_| trace.push("urgent");

        let sched = scheduler();
        let id = sched.add_work(Priority::Irq, urgent).unwrap();

        sched.run(id);
        assert_eq!(sched.port().pends.get(), 1);
        assert_eq!(sched.step(), Step::Idle);
        assert!(trace.take().is_empty());

        assert_eq!(sched.process_irq(), 1);
        assert_eq!(trace.take(), vec!["urgent"]);
        assert_eq!(sched.state(id.into()), WorkState::Idle);
    }

    #[test]
    fn test_main_loop_wakes_for_irq_deadlines() {
        let nop: Handler<'_> = &|_| {};
        let trace = Trace::default();
        let urgent: Handler<'_> = &|_| trace.push("urgent");

        let sched = scheduler();
        let irq = sched.add_delayed(Priority::Irq, urgent).unwrap();
        let normal = sched.add_delayed(Priority::Normal, nop).unwrap();

        sched.run_at(normal, Instant::from_ticks(900), true);
        sched.run_at(irq, Instant::from_ticks(300), true);
        sched.step();
        assert_eq!(sched.port().compare.get(), Some(300));

        sched.port().advance(300);
        assert_eq!(sched.step(), Step::Idle);
        assert_eq!(sched.state(irq.into()), WorkState::Scheduled);

        assert_eq!(sched.process_irq(), 1);
        assert_eq!(trace.take(), vec!["urgent"]);
        assert_eq!(sched.port().compare.get(), Some(900));
    }

    #[test]
    fn test_overdue_irq_deadline_pends_dispatch() {
        let trace = Trace::default();
        let urgent: Handler<'_> = &|_| trace.push("urgent");

        let sched = scheduler();
        let irq = sched.add_delayed(Priority::Irq, urgent).unwrap();
        sched.port().advance(1000);
        sched.step();
        assert_eq!(sched.port().pends.get(), 0);

        // Already in the past: the compare match cannot fire in time.
        sched.run_at(irq, Instant::from_ticks(500), true);
        assert_eq!(sched.step(), Step::Idle);
        assert_eq!(sched.port().pends.get(), 1);
        assert_eq!(sched.state(irq.into()), WorkState::Scheduled);

        assert_eq!(sched.process_irq(), 1);
        assert_eq!(trace.take(), vec!["urgent"]);
        assert_eq!(sched.state(irq.into()), WorkState::Idle);

        sched.step();
        assert_eq!(sched.port().pends.get(), 1);
    }
}
