/*
 * Timestamps and One-Shot Timer Events
 *
 * The scheduler is driven entirely by one-shot timer events: the per-CPU
 * tick and the per-CPU utilization sampling event. This module provides the
 * event objects and the per-CPU pending queues they live on, plus the
 * monotonic timestamp source the whole core uses for accounting.
 *
 * The hardware side stays outside the core: a clock source is registered at
 * boot, and the board's timer interrupt handler calls `process_events()` to
 * fire whatever is due on the local CPU. Handlers run in IRQ context and
 * may re-arm their own event.
 */

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::config::CPU_COUNT;
use crate::smp;
use crate::sync::IrqSpinLock;

/// Monotonic nanosecond clock provided by the platform.
pub trait ClockSource: Sync {
    fn timestamp_ns(&self) -> u64;
}

static CLOCK: spin::Once<&'static dyn ClockSource> = spin::Once::new();

/// Register the platform clock source. Later calls are ignored.
pub fn register_clock(clock: &'static dyn ClockSource) {
    CLOCK.call_once(|| clock);
}

/// Current monotonic timestamp in nanoseconds.
///
/// # Panics
/// Panics if no clock source has been registered.
#[inline]
pub fn timestamp_ns() -> u64 {
    CLOCK
        .get()
        .expect("clock source not registered")
        .timestamp_ns()
}

/// Callback invoked when a timer event expires, in IRQ context.
pub type TimerEventHandler = fn(&Arc<TimerEvent>);

/// A one-shot timer event.
///
/// An event is armed with [`event_start`] on the CPU it should fire on and
/// expires at most once per arming. [`event_restart`] re-arms it with the
/// last programmed duration. Events are owned per CPU: start, restart, stop
/// and expiry all happen on the owning CPU.
pub struct TimerEvent {
    name: &'static str,
    handler: TimerEventHandler,
    expiry_ns: AtomicU64,
    duration_ns: AtomicU64,
    active: AtomicBool,
    hcpu: AtomicU32,
}

impl TimerEvent {
    pub fn new(name: &'static str, handler: TimerEventHandler) -> Arc<Self> {
        Arc::new(Self {
            name,
            handler,
            expiry_ns: AtomicU64::new(0),
            duration_ns: AtomicU64::new(0),
            active: AtomicBool::new(false),
            hcpu: AtomicU32::new(0),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Expiry timestamp of the current arming, meaningful while active.
    pub fn expiry_ns(&self) -> u64 {
        self.expiry_ns.load(Ordering::Acquire)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

struct EventQueue {
    events: Vec<Arc<TimerEvent>>,
}

impl EventQueue {
    const fn new() -> Self {
        Self { events: Vec::new() }
    }
}

static QUEUES: [IrqSpinLock<EventQueue>; CPU_COUNT] =
    [const { IrqSpinLock::new(EventQueue::new()) }; CPU_COUNT];

/// Reset the local CPU's event queue. Called once per CPU during bring-up.
pub fn init(hcpu: u32) {
    QUEUES[hcpu as usize].lock_irqsave().events.clear();
    log::info!("timer: CPU{} event queue ready", hcpu);
}

/// Arm `ev` to fire `ns_from_now` nanoseconds from now on the calling CPU.
///
/// Re-arming an already active event simply moves its expiry.
pub fn event_start(ev: &Arc<TimerEvent>, ns_from_now: u64) {
    let cpu = smp::processor_id();
    let now = timestamp_ns();

    ev.duration_ns.store(ns_from_now, Ordering::Release);
    ev.expiry_ns
        .store(now.saturating_add(ns_from_now), Ordering::Release);
    ev.hcpu.store(cpu, Ordering::Release);
    ev.active.store(true, Ordering::Release);

    let mut q = QUEUES[cpu as usize].lock_irqsave();
    if !q.events.iter().any(|e| Arc::ptr_eq(e, ev)) {
        q.events.push(ev.clone());
    }
}

/// Re-arm `ev` with its last programmed duration, measured from now.
pub fn event_restart(ev: &Arc<TimerEvent>) {
    let duration = ev.duration_ns.load(Ordering::Acquire);
    event_start(ev, duration);
}

/// Disarm `ev` on the calling CPU.
pub fn event_stop(ev: &Arc<TimerEvent>) {
    ev.active.store(false, Ordering::Release);
    let cpu = smp::processor_id();
    let mut q = QUEUES[cpu as usize].lock_irqsave();
    q.events.retain(|e| !Arc::ptr_eq(e, ev));
}

/// Earliest pending expiry on the calling CPU, for programming the hardware
/// one-shot comparator.
pub fn next_expiry() -> Option<u64> {
    let cpu = smp::processor_id();
    let q = QUEUES[cpu as usize].lock_irqsave();
    q.events
        .iter()
        .filter(|e| e.is_active())
        .map(|e| e.expiry_ns())
        .min()
}

/// Fire every due event on the calling CPU.
///
/// Called from the platform timer interrupt handler. Each due event is
/// removed from the queue before its handler runs, so handlers are free to
/// re-arm themselves or other events.
pub fn process_events() {
    loop {
        let now = timestamp_ns();
        let due = {
            let mut q = QUEUES[smp::processor_id() as usize].lock_irqsave();
            let idx = q
                .events
                .iter()
                .position(|e| e.is_active() && e.expiry_ns() <= now);
            idx.map(|i| q.events.remove(i))
        };

        match due {
            Some(ev) => {
                ev.active.store(false, Ordering::Release);
                log::trace!("timer: firing event '{}'", ev.name());
                (ev.handler)(&ev);
            }
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::harness;
    use core::sync::atomic::AtomicUsize;

    static FIRED: AtomicUsize = AtomicUsize::new(0);

    fn count_handler(_ev: &Arc<TimerEvent>) {
        FIRED.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn one_shot_fires_once() {
        let _w = harness::world();
        harness::set_cpu(0);
        init(0);
        FIRED.store(0, Ordering::SeqCst);

        let ev = TimerEvent::new("test", count_handler);
        event_start(&ev, 1000);

        process_events();
        assert_eq!(FIRED.load(Ordering::SeqCst), 0);

        harness::advance_clock(1000);
        process_events();
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);

        // One-shot: does not fire again without re-arming.
        harness::advance_clock(10_000);
        process_events();
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn restart_uses_last_duration() {
        let _w = harness::world();
        harness::set_cpu(0);
        init(0);
        FIRED.store(0, Ordering::SeqCst);

        let ev = TimerEvent::new("restart", count_handler);
        event_start(&ev, 500);
        harness::advance_clock(500);
        process_events();
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);

        event_restart(&ev);
        assert!(ev.is_active());
        harness::advance_clock(499);
        process_events();
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
        harness::advance_clock(1);
        process_events();
        assert_eq!(FIRED.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stop_disarms() {
        let _w = harness::world();
        harness::set_cpu(0);
        init(0);
        FIRED.store(0, Ordering::SeqCst);

        let ev = TimerEvent::new("stop", count_handler);
        event_start(&ev, 100);
        event_stop(&ev);
        harness::advance_clock(1000);
        process_events();
        assert_eq!(FIRED.load(Ordering::SeqCst), 0);
    }
}
