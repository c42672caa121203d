/*
 * Per-CPU VCPU Scheduler
 *
 * This module is the scheduling mechanism of the hypervisor: it multiplexes
 * VCPUs (guest virtual CPUs and orphan hypervisor threads) onto each host
 * CPU. Which VCPU runs next is decided by the pluggable ready-queue policy
 * in scheduler/policies; everything else lives here:
 *
 * 1. THE STATE MACHINE: state_change() drives every VCPU transition
 *    (reset, kick, pause, resume, halt, destroy) including the pause/resume
 *    refcount reconciliation and the preemption that follows a wakeup.
 * 2. THE TICK: a per-CPU one-shot timer event expires the running VCPU's
 *    time slice and performs the context switch, charging the running
 *    bucket while subtracting interrupt time serviced during the slice.
 * 3. IRQ COUPLING: irq_enter()/irq_exit() bracket every host trap. The
 *    scheduler switches on IRQ exit when the current VCPU stopped being
 *    runnable or when a yield was requested, and accounts trap time into
 *    the per-CPU IRQ counter.
 * 4. MIGRATION: set_hcpu() moves a runnable VCPU between host CPUs via an
 *    async IPI executed on the old owner, which serializes migration
 *    against that CPU's own tick.
 * 5. SAMPLING: a second per-CPU timer event maintains a rolling window of
 *    idle and IRQ time for the monitor interfaces.
 *
 * LOCKING:
 * ========
 *
 * Acquire order is: VCPU sched_lock -> per-CPU local state -> per-CPU
 * ready queue. The ready-queue lock is never held across either of the
 * other two. Cross-CPU checks against another CPU's current VCPU use the
 * published atomic id, never a remote lock.
 *
 * Each per-CPU control record is owned by its CPU: only the owning CPU
 * mutates it, except the ready queue (touched by migration IPIs running on
 * the old owner) and the sampling window (behind a reader/writer lock).
 */

pub mod policies;
pub mod traits;

use alloc::boxed::Box;
use alloc::format;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use crate::arch::{self, Regs};
use crate::config::{
    CPU_COUNT, IDLE_PERIOD_SECS, IDLE_TSLICE_SECS, THREAD_STACK_SIZE, VCPU_MIN_PRIORITY,
};
use crate::error::{Error, Result};
use crate::smp::{self, CpuMask};
use crate::sync::{HeldLock, IrqRwLock, IrqSpinLock};
use crate::time::{self, TimerEvent};
use crate::vcpu::manager::VcpuManager;
use crate::vcpu::{GuestId, Vcpu, VcpuId, VcpuState};
use policies::PriorityRoundRobin;
use traits::SchedPolicy;

/// Sentinel for "no current VCPU" in the published current-id word.
const NO_VCPU: u32 = u32::MAX;

const IDLE_VCPU_TIMESLICE: u64 = IDLE_TSLICE_SECS * 1_000_000_000;
const SAMPLE_EVENT_PERIOD: u64 = IDLE_PERIOD_SECS * 1_000_000_000;

/// Per-CPU fields touched only by the owning CPU.
///
/// `irq_regs` is the trap frame pointer saved by `irq_enter`; it is valid
/// for the duration of the trap and only ever dereferenced on the owning
/// CPU inside that window.
struct CpuLocal {
    current: Option<Arc<Vcpu>>,
    idle: Option<Arc<Vcpu>>,
    /// Snapshot of `irq_process_ns` taken when the current VCPU was
    /// installed, so its slice is not charged for interrupt service.
    current_vcpu_irq_ns: u64,
    irq_context: bool,
    irq_regs: *mut Regs,
    irq_enter_tstamp: u64,
    /// Monotonic accumulator of wall time spent in hardware traps.
    irq_process_ns: u64,
    yield_on_irq_exit: bool,
    tick_ev: Option<Arc<TimerEvent>>,
    sample_ev: Option<Arc<TimerEvent>>,
}

// SAFETY: the raw trap-frame pointer is only dereferenced on the owning CPU
// while the trap that produced it is still on the stack.
unsafe impl Send for CpuLocal {}

impl CpuLocal {
    const fn new() -> Self {
        Self {
            current: None,
            idle: None,
            current_vcpu_irq_ns: 0,
            irq_context: false,
            irq_regs: core::ptr::null_mut(),
            irq_enter_tstamp: 0,
            irq_process_ns: 0,
            yield_on_irq_exit: false,
            tick_ev: None,
            sample_ev: None,
        }
    }
}

/// Rolling idle/IRQ sample window of one CPU.
struct Sampling {
    period_ns: u64,
    idle_ns: u64,
    idle_last_ns: u64,
    irq_ns: u64,
    irq_last_ns: u64,
}

impl Sampling {
    const fn new() -> Self {
        Self {
            period_ns: SAMPLE_EVENT_PERIOD,
            idle_ns: 0,
            idle_last_ns: 0,
            irq_ns: 0,
            irq_last_ns: 0,
        }
    }
}

/// Control structure of one host CPU's scheduler.
struct SchedControl {
    rq: IrqSpinLock<Option<Box<dyn SchedPolicy>>>,
    /// Id of the current VCPU, readable from any CPU.
    current_id: AtomicU32,
    /// Priority of the current VCPU, readable from any CPU.
    current_prio: AtomicU8,
    local: IrqSpinLock<CpuLocal>,
    sample: IrqRwLock<Sampling>,
}

impl SchedControl {
    const fn new() -> Self {
        Self {
            rq: IrqSpinLock::new(None),
            current_id: AtomicU32::new(NO_VCPU),
            current_prio: AtomicU8::new(VCPU_MIN_PRIORITY),
            local: IrqSpinLock::new(CpuLocal::new()),
            sample: IrqRwLock::new(Sampling::new()),
        }
    }
}

static SCHED: [SchedControl; CPU_COUNT] = [const { SchedControl::new() }; CPU_COUNT];

fn ctl(hcpu: u32) -> &'static SchedControl {
    &SCHED[hcpu as usize]
}

fn this_ctl() -> &'static SchedControl {
    ctl(smp::processor_id())
}

// ============================================================================
// READY QUEUE ACCESS
// ============================================================================

fn with_rq<R>(schedp: &SchedControl, f: impl FnOnce(&mut dyn SchedPolicy) -> R) -> R {
    let mut rq = schedp.rq.lock_irqsave();
    let policy = rq.as_mut().expect("scheduler: ready queue not initialized");
    f(&mut **policy)
}

fn rq_setup(schedp: &SchedControl, vcpu: &Arc<Vcpu>) -> Result<()> {
    with_rq(schedp, |rq| rq.setup(vcpu))
}

fn rq_cleanup(schedp: &SchedControl, vcpu: &Arc<Vcpu>) -> Result<()> {
    with_rq(schedp, |rq| rq.cleanup(vcpu))
}

fn rq_enqueue(schedp: &SchedControl, vcpu: &Arc<Vcpu>) -> Result<()> {
    with_rq(schedp, |rq| rq.enqueue(vcpu))
}

fn rq_dequeue(schedp: &SchedControl) -> Option<(Arc<Vcpu>, u64)> {
    with_rq(schedp, |rq| rq.dequeue())
}

fn rq_detach(schedp: &SchedControl, vcpu: &Arc<Vcpu>) -> Result<()> {
    with_rq(schedp, |rq| rq.detach(vcpu))
}

fn rq_preempt_needed(schedp: &SchedControl) -> bool {
    let prio = schedp.current_prio.load(Ordering::SeqCst);
    with_rq(schedp, |rq| rq.preempt_needed(prio))
}

fn rq_length(schedp: &SchedControl, priority: u8) -> usize {
    with_rq(schedp, |rq| rq.length(priority))
}

// ============================================================================
// CONTEXT SWITCH
// ============================================================================

/// Publish `next` as the CPU's current VCPU and program its time slice.
fn install_current(schedp: &SchedControl, next: &Arc<Vcpu>, time_slice: u64) {
    let tick_ev = {
        let mut local = schedp.local.lock_irqsave();
        local.current = Some(next.clone());
        local.current_vcpu_irq_ns = local.irq_process_ns;
        local.tick_ev.clone()
    };
    schedp.current_id.store(next.id().0, Ordering::SeqCst);
    schedp.current_prio.store(next.priority(), Ordering::SeqCst);
    if let Some(ev) = tick_ev {
        time::event_start(&ev, time_slice);
    }
}

/// Pick and install the next VCPU, switching register files through the
/// architecture port. Runs with the trap frame of the interrupted context.
fn scheduler_next(schedp: &SchedControl, regs: *mut Regs) {
    let tstamp = time::timestamp_ns();
    let current = { schedp.local.lock_irqsave().current.clone() };

    let Some(current) = current else {
        // First switch on this CPU after init.
        let (next, time_slice) =
            rq_dequeue(schedp).expect("scheduler: ready queue empty on first switch");
        let mut nf = next.sched.write_irqsave();
        arch::port().vcpu_switch(None, &next, regs);
        nf.ready_nsecs += tstamp - nf.state_tstamp;
        next.set_state(VcpuState::Running);
        nf.state_tstamp = tstamp;
        drop(nf);
        install_current(schedp, &next, time_slice);
        return;
    };

    let mut cf = current.sched.write_irqsave();
    let current_state = current.state();
    let mut save_current = false;

    if current_state.is_saveable() {
        if current_state == VcpuState::Running {
            // Charge the slice, minus interrupt time serviced during it.
            let irq_delta = {
                let mut local = schedp.local.lock_irqsave();
                let delta = local.irq_process_ns - local.current_vcpu_irq_ns;
                local.current_vcpu_irq_ns = local.irq_process_ns;
                delta
            };
            cf.running_nsecs += (tstamp - cf.state_tstamp).saturating_sub(irq_delta);
            current.set_state(VcpuState::Ready);
            cf.state_tstamp = tstamp;
            if let Err(e) = rq_enqueue(schedp, &current) {
                log::warn!("scheduler: failed to requeue '{}' ({})", current.name(), e);
            }
        }
        save_current = true;
    }

    let (next, time_slice) =
        rq_dequeue(schedp).expect("scheduler: ready queue empty, idle vcpu missing");

    if Arc::ptr_eq(&next, &current) {
        cf.ready_nsecs += tstamp - cf.state_tstamp;
        current.set_state(VcpuState::Running);
        cf.state_tstamp = tstamp;
        drop(cf);
    } else {
        let mut nf = next.sched.write_irqsave();
        let prev = if save_current { Some(&*current) } else { None };
        arch::port().vcpu_switch(prev, &next, regs);
        nf.ready_nsecs += tstamp - nf.state_tstamp;
        next.set_state(VcpuState::Running);
        nf.state_tstamp = tstamp;
        drop(nf);
        drop(cf);
    }

    install_current(schedp, &next, time_slice);
}

/// Switch entry point honoring the current VCPU's preempt count: a pinned
/// VCPU gets its slice extended instead of being switched out.
fn scheduler_switch(schedp: &SchedControl, regs: *mut Regs) {
    assert!(!regs.is_null(), "scheduler: switch with null regs");

    let (current, tick_ev) = {
        let local = schedp.local.lock_irqsave();
        (local.current.clone(), local.tick_ev.clone())
    };

    match current {
        Some(vcpu) if vcpu.preempt_count() > 0 => {
            if let Some(ev) = tick_ev {
                time::event_restart(&ev);
            }
        }
        _ => scheduler_next(schedp, regs),
    }
}

/// Tick timer event handler. Fires in IRQ context; the saved trap frame is
/// the context being preempted.
fn scheduler_timer_event(_ev: &Arc<TimerEvent>) {
    let schedp = this_ctl();
    let regs = { schedp.local.lock_irqsave().irq_regs };
    if !regs.is_null() {
        scheduler_switch(schedp, regs);
    }
}

/// Synchronous orphan preemption entry, called by the architecture port
/// from the orphan-yield trap with the orphan's saved frame.
pub fn preempt_orphan(regs: *mut Regs) {
    scheduler_switch(this_ctl(), regs);
}

// ============================================================================
// STATE MACHINE
// ============================================================================

/// Drive a VCPU state transition. See [`state_change_locked`] for the
/// variant used while holding a caller-side lock.
pub fn state_change(vcpu: &Arc<Vcpu>, new_state: VcpuState) -> Result<()> {
    do_state_change(vcpu, new_state, None)
}

/// Like [`state_change`], but releases `held` around any synchronous orphan
/// preemption triggered by the transition, so the caller's locking scheme
/// cannot deadlock against the switch path.
pub fn state_change_locked(
    vcpu: &Arc<Vcpu>,
    new_state: VcpuState,
    held: &dyn HeldLock,
) -> Result<()> {
    do_state_change(vcpu, new_state, Some(held))
}

fn do_state_change(vcpu: &Arc<Vcpu>, new_state: VcpuState, held: Option<&dyn HeldLock>) -> Result<()> {
    let chcpu = smp::processor_id();
    let mut rc: Result<()> = Ok(());
    let mut preempt = false;
    let mut skip = false;

    let mut guard = vcpu.sched.write_irqsave();
    let vhcpu = guard.hcpu;
    let schedp = ctl(vhcpu);
    let current_state = vcpu.state();
    let is_current = schedp.current_id.load(Ordering::SeqCst) == vcpu.id().0;

    match new_state {
        VcpuState::Unknown => {
            // Existing VCPU being destroyed.
            rc = rq_cleanup(schedp, vcpu);
        }
        VcpuState::Reset => {
            if current_state == VcpuState::Unknown {
                // New VCPU.
                rc = rq_setup(schedp, vcpu);
            } else if current_state != VcpuState::Reset {
                guard.resume_count = 0;
                if !is_current && current_state == VcpuState::Ready {
                    rc = rq_detach(schedp, vcpu);
                }
                if rc.is_ok() {
                    if is_current && current_state == VcpuState::Running {
                        preempt = true;
                    }
                    guard.reset_count += 1;
                    rc = arch::port().vcpu_init(vcpu);
                    if rc.is_ok() {
                        vcpu.virq.reset();
                    }
                }
            } else {
                rc = Err(Error::Invalid);
            }
        }
        VcpuState::Ready => {
            if current_state.is_interruptible() {
                guard.resume_count += 1;
                if guard.resume_count < 0 {
                    rc = Err(Error::Again);
                    skip = true;
                }
            }
            if !skip {
                if current_state == VcpuState::Ready || current_state == VcpuState::Running {
                    // Already runnable.
                    skip = true;
                } else if current_state == VcpuState::Reset || current_state == VcpuState::Paused {
                    rc = rq_enqueue(schedp, vcpu);
                    if rc.is_ok() && !is_current {
                        preempt = rq_preempt_needed(schedp);
                    }
                } else {
                    rc = Err(Error::Invalid);
                }
            }
        }
        VcpuState::Running => {
            // Only the scheduler itself installs RUNNING.
            rc = Err(Error::Invalid);
        }
        VcpuState::Paused | VcpuState::Halted => {
            // The decrement sticks even when the request is rejected:
            // every pause costs one resume, so overlapping pause/resume
            // pairs from independent actors reconcile back to zero.
            if new_state == VcpuState::Paused && current_state.is_interruptible() {
                guard.resume_count -= 1;
                if guard.resume_count > 0 {
                    rc = Err(Error::Again);
                    skip = true;
                } else if guard.resume_count == 0 {
                    // An outstanding resume already covers this pause:
                    // report success without a state change.
                    skip = true;
                }
            }
            if !skip && rc.is_ok() {
                if current_state == VcpuState::Ready || current_state == VcpuState::Running {
                    if is_current {
                        preempt = true;
                    } else if current_state == VcpuState::Ready {
                        rc = rq_detach(schedp, vcpu);
                    }
                } else if new_state == VcpuState::Paused && current_state == VcpuState::Paused {
                    // Another actor paused it first.
                    rc = Err(Error::Again);
                } else {
                    rc = Err(Error::Invalid);
                }
            }
        }
    }

    if !skip && rc.is_ok() {
        let tstamp = time::timestamp_ns();
        match current_state {
            VcpuState::Ready => guard.ready_nsecs += tstamp - guard.state_tstamp,
            VcpuState::Running => guard.running_nsecs += tstamp - guard.state_tstamp,
            VcpuState::Paused => guard.paused_nsecs += tstamp - guard.state_tstamp,
            VcpuState::Halted => guard.halted_nsecs += tstamp - guard.state_tstamp,
            _ => {}
        }
        if new_state == VcpuState::Reset {
            guard.ready_nsecs = 0;
            guard.running_nsecs = 0;
            guard.paused_nsecs = 0;
            guard.halted_nsecs = 0;
            guard.reset_tstamp = tstamp;
        }
        vcpu.set_state(new_state);
        guard.state_tstamp = tstamp;
    }
    drop(guard);

    if preempt {
        preempt_current(schedp, chcpu, vhcpu, held);
    }

    match rc {
        Err(Error::Again) => {
            log::debug!(
                "scheduler: vcpu '{}' {:?} -> {:?} deferred",
                vcpu.name(),
                current_state,
                new_state
            );
        }
        Err(e) => {
            log::warn!(
                "scheduler: vcpu '{}' {:?} -> {:?} failed ({})",
                vcpu.name(),
                current_state,
                new_state,
                e
            );
        }
        Ok(()) => {}
    }

    rc
}

/// Preempt whatever runs where a transition demands it: set the yield flag
/// for a normal VCPU, switch an orphan out directly, or poke another CPU.
fn preempt_current(schedp: &SchedControl, chcpu: u32, vhcpu: u32, held: Option<&dyn HeldLock>) {
    if chcpu == vhcpu {
        let (current, in_irq, irq_regs) = {
            let local = schedp.local.lock_irqsave();
            (local.current.clone(), local.irq_context, local.irq_regs)
        };
        let Some(current) = current else { return };

        if current.is_normal() {
            schedp.local.lock_irqsave().yield_on_irq_exit = true;
        } else if in_irq {
            scheduler_switch(schedp, irq_regs);
        } else {
            if let Some(lock) = held {
                lock.release();
            }
            arch::port().vcpu_preempt_orphan();
            if let Some(lock) = held {
                lock.reacquire();
            }
        }
    } else if schedp.current_id.load(Ordering::SeqCst) != NO_VCPU {
        let _ = force_resched(vhcpu);
    }
}

// ============================================================================
// FORCED RESCHEDULING AND MIGRATION
// ============================================================================

/// Async IPI body for a forced reschedule.
///
/// Nothing to do here: the call runs on the target's highest-priority IPI
/// bottom-half orphan, so once the bottom-half finishes, the target's
/// scheduler naturally reconsiders its ready queue.
fn resched_ipi(_a0: usize, _a1: usize, _a2: usize) {}

/// Force `hcpu` to reconsider its ready queue.
pub fn force_resched(hcpu: u32) -> Result<()> {
    if hcpu >= CPU_COUNT as u32 {
        return Err(Error::Invalid);
    }
    if !smp::is_cpu_online(hcpu) {
        return Err(Error::NotAvail);
    }

    let _ = smp::ipi_async_call(CpuMask::of(hcpu), resched_ipi, 0, 0, 0);
    Ok(())
}

/// Async IPI body migrating a VCPU away from the calling (old) host CPU.
/// Preconditions are revalidated under the VCPU's lock: the world may have
/// moved between the post and the execution, in which case this is a no-op.
fn migrate_vcpu_ipi(vcpu_id: usize, new_hcpu: usize, _a2: usize) {
    let Some(vcpu) = VcpuManager::get(VcpuId(vcpu_id as u32)) else {
        return;
    };
    let old_hcpu = smp::processor_id();
    let new_hcpu = new_hcpu as u32;

    let mut guard = vcpu.sched.write_irqsave();
    if vcpu.state() != VcpuState::Ready || guard.hcpu != old_hcpu || guard.hcpu == new_hcpu {
        return;
    }

    if let Err(e) = rq_detach(ctl(old_hcpu), &vcpu) {
        log::warn!("scheduler: migrate detach of '{}' failed ({})", vcpu.name(), e);
        return;
    }
    guard.hcpu = new_hcpu;
    if let Err(e) = rq_enqueue(ctl(new_hcpu), &vcpu) {
        log::warn!("scheduler: migrate enqueue of '{}' failed ({})", vcpu.name(), e);
        return;
    }

    log::debug!(
        "scheduler: migrated '{}' CPU{} -> CPU{}",
        vcpu.name(),
        old_hcpu,
        new_hcpu
    );
    let _ = force_resched(new_hcpu);
    // Migration is linearizable at the release of the VCPU lock.
}

/// Host CPU currently owning `vcpu`.
pub fn get_hcpu(vcpu: &Arc<Vcpu>) -> u32 {
    vcpu.sched.read_irqsave().hcpu
}

/// Move `vcpu` to `hcpu`.
///
/// The new CPU must be in the VCPU's affinity mask. A READY or RUNNING
/// VCPU is migrated asynchronously by an IPI on its current owner, so the
/// move does not race that CPU's tick; anything else changes owner
/// immediately.
pub fn set_hcpu(vcpu: &Arc<Vcpu>, hcpu: u32) -> Result<()> {
    if hcpu >= CPU_COUNT as u32 {
        return Err(Error::Invalid);
    }

    let mut migrate = false;
    let old_hcpu;
    {
        let mut guard = vcpu.sched.write_irqsave();
        old_hcpu = guard.hcpu;
        if old_hcpu == hcpu {
            return Ok(());
        }
        if !guard.cpu_affinity.test(hcpu) {
            return Err(Error::Invalid);
        }
        let state = vcpu.state();
        if state == VcpuState::Ready || state == VcpuState::Running {
            migrate = true;
        } else {
            guard.hcpu = hcpu;
        }
    }

    if migrate {
        let _ = smp::ipi_async_call(
            CpuMask::of(old_hcpu),
            migrate_vcpu_ipi,
            vcpu.id().0 as usize,
            hcpu as usize,
            0,
        );
    }

    Ok(())
}

// ============================================================================
// PREEMPTION CONTROL AND YIELD
// ============================================================================

/// Disable involuntary preemption of the current VCPU. No-op in IRQ
/// context. Nests; pair every call with [`preempt_enable`].
pub fn preempt_disable() {
    let local = this_ctl().local.lock_irqsave();
    if !local.irq_context
        && let Some(vcpu) = &local.current
    {
        vcpu.preempt_count_inc();
    }
}

/// Re-enable involuntary preemption of the current VCPU.
pub fn preempt_enable() {
    let local = this_ctl().local.lock_irqsave();
    if !local.irq_context
        && let Some(vcpu) = &local.current
    {
        vcpu.preempt_count_dec();
    }
}

/// Voluntarily give up the CPU.
///
/// A normal VCPU yields lazily: the flag makes the next IRQ exit switch.
/// An orphan yields synchronously through the architecture port.
///
/// # Panics
/// Panics when called from IRQ context or before the first switch.
pub fn yield_now() {
    let flags = arch::port().irq_save();

    let (current, in_irq) = {
        let local = this_ctl().local.lock_irqsave();
        (local.current.clone(), local.irq_context)
    };

    if in_irq {
        panic!("scheduler: cannot yield in IRQ context");
    }
    let current = current.expect("scheduler: yield with no current vcpu");

    if current.is_normal() {
        if current.state() == VcpuState::Running {
            this_ctl().local.lock_irqsave().yield_on_irq_exit = true;
        }
    } else {
        arch::port().vcpu_preempt_orphan();
    }

    arch::port().irq_restore(flags);
}

// ============================================================================
// IRQ ENTER / EXIT COUPLING
// ============================================================================

/// Bracket the start of host trap handling.
///
/// `vcpu_context` is true when the trap came out of VCPU execution itself
/// (a synchronous guest exit) rather than a hardware interrupt; only
/// hardware traps are timed into the IRQ accumulator.
pub fn irq_enter(regs: *mut Regs, vcpu_context: bool) {
    let schedp = this_ctl();
    let mut local = schedp.local.lock_irqsave();
    if vcpu_context {
        local.irq_context = false;
    } else {
        local.irq_context = true;
        local.irq_enter_tstamp = time::timestamp_ns();
    }
    local.irq_regs = regs;
    local.yield_on_irq_exit = false;
}

/// Bracket the end of host trap handling.
///
/// Switches context when the current VCPU stopped being runnable during
/// the trap or a yield was requested, delivers pending virtual interrupts,
/// and charges the trap duration to the per-CPU IRQ accumulator.
pub fn irq_exit(regs: *mut Regs) {
    let schedp = this_ctl();

    let (current, yield_requested, irq_regs) = {
        let local = schedp.local.lock_irqsave();
        (local.current.clone(), local.yield_on_irq_exit, local.irq_regs)
    };

    if let Some(current) = current {
        if current.state() != VcpuState::Running || yield_requested {
            scheduler_next(schedp, irq_regs);
            schedp.local.lock_irqsave().yield_on_irq_exit = false;
        }

        current.virq_process(regs);
    }

    let mut local = schedp.local.lock_irqsave();
    if local.irq_context {
        local.irq_process_ns += time::timestamp_ns() - local.irq_enter_tstamp;
    }
    local.irq_context = false;
    local.irq_regs = core::ptr::null_mut();
}

// ============================================================================
// IDLE ORPHAN AND INIT
// ============================================================================

/// Body of the per-CPU idle orphan: park until work shows up, then yield.
fn idle_orphan_body() {
    loop {
        let hcpu = smp::processor_id();
        if ready_count(hcpu, VCPU_MIN_PRIORITY) == 0 {
            arch::port().wait_for_irq();
        }
        yield_now();
    }
}

/// Bring up the scheduler of the calling CPU.
///
/// Creates the ready queue and the idle orphan, marks the CPU online, and
/// arms the tick and sampling events. Must run on `hcpu` itself, before
/// the CPU's timer trap is enabled.
pub fn init(hcpu: u32) -> Result<()> {
    if hcpu >= CPU_COUNT as u32 {
        return Err(Error::Invalid);
    }
    debug_assert_eq!(smp::processor_id(), hcpu);

    let schedp = ctl(hcpu);

    let policy = Box::new(PriorityRoundRobin::new());
    log::info!("scheduler: CPU{} using '{}' policy", hcpu, policy.name());
    *schedp.rq.lock_irqsave() = Some(policy);

    schedp.current_id.store(NO_VCPU, Ordering::SeqCst);
    schedp.current_prio.store(VCPU_MIN_PRIORITY, Ordering::SeqCst);
    {
        let mut local = schedp.local.lock_irqsave();
        *local = CpuLocal::new();
        local.tick_ev = Some(TimerEvent::new("sched/tick", scheduler_timer_event));
        local.sample_ev = Some(TimerEvent::new("sched/sample", scheduler_sample_event));
    }
    *schedp.sample.write_irqsave() = Sampling::new();

    time::init(hcpu);

    let name = format!("idle/{}", hcpu);
    let idle = VcpuManager::orphan_create(
        &name,
        idle_orphan_body,
        THREAD_STACK_SIZE,
        VCPU_MIN_PRIORITY,
        IDLE_VCPU_TIMESLICE,
        IDLE_VCPU_TIMESLICE,
        IDLE_VCPU_TIMESLICE,
    )?;
    schedp.local.lock_irqsave().idle = Some(idle.clone());

    // Online before affinity: the affinity check rejects offline CPUs.
    smp::set_cpu_online(hcpu, true);

    VcpuManager::set_affinity(&idle, CpuMask::of(hcpu))?;
    VcpuManager::kick(&idle)?;

    let (tick_ev, sample_ev) = {
        let local = schedp.local.lock_irqsave();
        (local.tick_ev.clone().unwrap(), local.sample_ev.clone().unwrap())
    };
    time::event_start(&tick_ev, 0);
    time::event_start(&sample_ev, SAMPLE_EVENT_PERIOD);

    log::info!("scheduler: CPU{} online", hcpu);
    Ok(())
}

/// Drop every per-CPU control back to its boot state. Test-only world
/// reset; real CPUs are re-initialized through [`init`].
#[cfg(test)]
pub(crate) fn test_reset() {
    for schedp in &SCHED {
        *schedp.rq.lock_irqsave() = None;
        schedp.current_id.store(NO_VCPU, Ordering::SeqCst);
        schedp.current_prio.store(VCPU_MIN_PRIORITY, Ordering::SeqCst);
        *schedp.local.lock_irqsave() = CpuLocal::new();
        *schedp.sample.write_irqsave() = Sampling::new();
    }
}

// ============================================================================
// SAMPLING
// ============================================================================

/// Sampling timer event handler: close the current window and re-arm.
fn scheduler_sample_event(_ev: &Arc<TimerEvent>) {
    let schedp = this_ctl();

    let idle = { schedp.local.lock_irqsave().idle.clone() };
    let idle_ns = idle.map(|v| VcpuManager::stats(&v).running_nsecs).unwrap_or(0);

    let irq_ns = { schedp.local.lock_irqsave().irq_process_ns };

    let next_period = {
        let mut sample = schedp.sample.write_irqsave();
        sample.idle_ns = idle_ns.saturating_sub(sample.idle_last_ns);
        sample.idle_last_ns = idle_ns;
        sample.irq_ns = irq_ns.saturating_sub(sample.irq_last_ns);
        sample.irq_last_ns = irq_ns;
        sample.period_ns
    };

    let sample_ev = { schedp.local.lock_irqsave().sample_ev.clone() };
    if let Some(ev) = sample_ev {
        time::event_start(&ev, next_period);
    }
}

/// Idle time of `hcpu` over the last completed sample window.
pub fn idle_time(hcpu: u32) -> u64 {
    if hcpu >= CPU_COUNT as u32 || !smp::is_cpu_online(hcpu) {
        return 0;
    }
    ctl(hcpu).sample.read_irqsave().idle_ns
}

/// IRQ time of `hcpu` over the last completed sample window.
pub fn irq_time(hcpu: u32) -> u64 {
    if hcpu >= CPU_COUNT as u32 || !smp::is_cpu_online(hcpu) {
        return 0;
    }
    ctl(hcpu).sample.read_irqsave().irq_ns
}

/// Sampling period of `hcpu`.
pub fn get_sample_period(hcpu: u32) -> u64 {
    if hcpu >= CPU_COUNT as u32 || !smp::is_cpu_online(hcpu) {
        return SAMPLE_EVENT_PERIOD;
    }
    ctl(hcpu).sample.read_irqsave().period_ns
}

/// Change the sampling period of `hcpu`, taking effect at the next window.
pub fn set_sample_period(hcpu: u32, period_ns: u64) {
    if hcpu >= CPU_COUNT as u32 || !smp::is_cpu_online(hcpu) {
        return;
    }
    ctl(hcpu).sample.write_irqsave().period_ns = period_ns;
}

// ============================================================================
// INTROSPECTION
// ============================================================================

/// Current VCPU of the calling CPU.
pub fn current_vcpu() -> Option<Arc<Vcpu>> {
    this_ctl().local.lock_irqsave().current.clone()
}

/// Guest of the calling CPU's current VCPU.
pub fn current_guest() -> Option<GuestId> {
    current_vcpu().and_then(|v| v.guest())
}

/// Idle orphan of `hcpu`.
pub fn idle_vcpu(hcpu: u32) -> Option<Arc<Vcpu>> {
    if hcpu >= CPU_COUNT as u32 || !smp::is_cpu_online(hcpu) {
        return None;
    }
    ctl(hcpu).local.lock_irqsave().idle.clone()
}

/// Number of READY VCPUs queued at `priority` on `hcpu`.
pub fn ready_count(hcpu: u32, priority: u8) -> usize {
    if hcpu >= CPU_COUNT as u32 || !smp::is_cpu_online(hcpu) {
        return 0;
    }
    rq_length(ctl(hcpu), priority)
}

/// True while the calling CPU is handling a hardware trap.
pub fn irq_context() -> bool {
    this_ctl().local.lock_irqsave().irq_context
}

/// True when the calling CPU runs a normal VCPU outside IRQ context.
pub fn normal_context() -> bool {
    let local = this_ctl().local.lock_irqsave();
    match &local.current {
        Some(vcpu) if !local.irq_context => vcpu.is_normal(),
        _ => false,
    }
}

/// True when the calling CPU runs an orphan VCPU outside IRQ context.
pub fn orphan_context() -> bool {
    let local = this_ctl().local.lock_irqsave();
    match &local.current {
        Some(vcpu) if !local.irq_context => !vcpu.is_normal(),
        _ => false,
    }
}
