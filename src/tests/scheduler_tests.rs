/*
 * Scheduler End-to-End Scenarios
 *
 * Each test boots one or two CPUs through the mock port, drives the
 * scheduler with simulated timer traps and control calls, and checks the
 * externally visible contract: who is current, who is queued where, what
 * the accounting buckets say.
 */

use alloc::sync::Arc;

use super::harness::{self, boot_cpu, simulate_tick};
use crate::arch::Regs;
use crate::config::{VCPU_MAX_PRIORITY, VCPU_MIN_PRIORITY};
use crate::error::Error;
use crate::scheduler;
use crate::smp::{self, CpuMask};
use crate::vcpu::manager::VcpuManager;
use crate::vcpu::{GuestId, Vcpu, VcpuState};

const MS: u64 = 1_000_000;
const SLICE: u64 = 100 * MS;

fn orphan_body() {}

fn spawn_orphan(name: &str, priority: u8) -> Arc<Vcpu> {
    VcpuManager::orphan_create(name, orphan_body, 16 * 1024, priority, SLICE, SLICE, SLICE)
        .unwrap()
}

fn spawn_guest(name: &str, guest: u32, priority: u8) -> Arc<Vcpu> {
    VcpuManager::guest_vcpu_create(name, GuestId(guest), 0x4000_0000, priority, SLICE, SLICE, SLICE)
        .unwrap()
}

fn resume_count(vcpu: &Arc<Vcpu>) -> i32 {
    vcpu.sched.read_irqsave().resume_count
}

#[test]
fn boot_installs_idle_orphan() {
    let _w = harness::world();

    harness::set_cpu(0);
    scheduler::init(0).unwrap();

    // Until the first tick the idle orphan sits queued in the lowest band.
    assert_eq!(scheduler::ready_count(0, VCPU_MIN_PRIORITY), 1);
    assert!(scheduler::current_vcpu().is_none());

    simulate_tick(0);

    let current = scheduler::current_vcpu().unwrap();
    assert_eq!(current.name(), "idle/0");
    assert_eq!(current.state(), VcpuState::Running);
    assert!(!current.is_normal());
    assert!(scheduler::orphan_context());
    assert!(!scheduler::irq_context());
    assert_eq!(scheduler::ready_count(0, VCPU_MIN_PRIORITY), 0);

    let idle = scheduler::idle_vcpu(0).unwrap();
    assert!(Arc::ptr_eq(&idle, &current));
}

#[test]
fn kick_preempts_lower_priority_orphan() {
    let _w = harness::world();
    boot_cpu(0);

    let idle_id = scheduler::idle_vcpu(0).unwrap().id().0;
    let a = spawn_orphan("worker-a", 5);
    VcpuManager::set_affinity(&a, CpuMask::of(0)).unwrap();
    assert_eq!(a.state(), VcpuState::Reset);

    harness::clear_switches();
    VcpuManager::kick(&a).unwrap();

    // The idle orphan was preempted synchronously.
    let current = scheduler::current_vcpu().unwrap();
    assert!(Arc::ptr_eq(&current, &a));
    assert_eq!(a.state(), VcpuState::Running);
    assert_eq!(harness::switches(), vec![(Some(idle_id), a.id().0)]);

    // Idle went back to its band.
    assert_eq!(scheduler::ready_count(0, VCPU_MIN_PRIORITY), 1);
    assert_eq!(scheduler::ready_count(0, 5), 0);
}

#[test]
fn equal_priority_does_not_preempt() {
    let _w = harness::world();
    boot_cpu(0);

    let a = spawn_orphan("eq-a", 5);
    VcpuManager::kick(&a).unwrap();
    let b = spawn_orphan("eq-b", 5);
    VcpuManager::kick(&b).unwrap();

    // Strictly-greater rule: b waits for a's slice to expire.
    assert!(Arc::ptr_eq(&scheduler::current_vcpu().unwrap(), &a));
    assert_eq!(b.state(), VcpuState::Ready);
    assert_eq!(scheduler::ready_count(0, 5), 1);
}

#[test]
fn slice_rollover_rotates_within_band() {
    let _w = harness::world();
    boot_cpu(0);

    let a = spawn_orphan("rr-a", 5);
    VcpuManager::kick(&a).unwrap();
    let b = spawn_orphan("rr-b", 5);
    VcpuManager::kick(&b).unwrap();

    harness::clear_switches();
    harness::advance_clock(SLICE);
    simulate_tick(0);

    // Exactly one switch: a to b, a requeued behind nobody else.
    assert!(Arc::ptr_eq(&scheduler::current_vcpu().unwrap(), &b));
    assert_eq!(a.state(), VcpuState::Ready);
    assert_eq!(scheduler::ready_count(0, 5), 1);
    assert_eq!(harness::switches(), vec![(Some(a.id().0), b.id().0)]);
}

#[test]
fn sole_top_vcpu_is_repicked_at_slice_end() {
    let _w = harness::world();
    boot_cpu(0);

    let a = spawn_orphan("solo", 5);
    VcpuManager::kick(&a).unwrap();

    harness::clear_switches();
    harness::advance_clock(SLICE);
    simulate_tick(0);

    // Nothing above or beside it: the same VCPU continues, no register
    // file shuffling happens, and the slice got charged.
    assert!(Arc::ptr_eq(&scheduler::current_vcpu().unwrap(), &a));
    assert_eq!(a.state(), VcpuState::Running);
    assert!(harness::switches().is_empty());
    assert_eq!(scheduler::ready_count(0, 5), 0);
    assert_eq!(VcpuManager::stats(&a).running_nsecs, SLICE);
}

#[test]
fn preempt_disable_pins_current_across_tick() {
    let _w = harness::world();
    boot_cpu(0);

    let a = spawn_orphan("pinned", 5);
    VcpuManager::kick(&a).unwrap();
    let b = spawn_orphan("waiter", 5);
    VcpuManager::kick(&b).unwrap();

    scheduler::preempt_disable();
    assert_eq!(a.preempt_count(), 1);

    harness::clear_switches();
    harness::advance_clock(SLICE);
    simulate_tick(0);

    // Tick extended the slice instead of switching.
    assert!(Arc::ptr_eq(&scheduler::current_vcpu().unwrap(), &a));
    assert_eq!(a.state(), VcpuState::Running);
    assert_eq!(b.state(), VcpuState::Ready);
    assert!(harness::switches().is_empty());

    scheduler::preempt_enable();
    assert_eq!(a.preempt_count(), 0);

    harness::advance_clock(SLICE);
    simulate_tick(0);
    assert!(Arc::ptr_eq(&scheduler::current_vcpu().unwrap(), &b));
}

#[test]
fn pause_resume_refcount_scenario() {
    let _w = harness::world();
    boot_cpu(0);

    let a = spawn_orphan("pausable", 5);
    VcpuManager::kick(&a).unwrap();
    assert!(Arc::ptr_eq(&scheduler::current_vcpu().unwrap(), &a));

    // First pause takes effect and switches the current VCPU out.
    VcpuManager::pause(&a).unwrap();
    assert_eq!(a.state(), VcpuState::Paused);
    assert_eq!(resume_count(&a), -1);
    assert_eq!(scheduler::current_vcpu().unwrap().name(), "idle/0");

    // Second pause lost the race. The decrement sticks, so the balancing
    // resumes below reconcile the counter back to zero.
    assert_eq!(VcpuManager::pause(&a), Err(Error::Again));
    assert_eq!(a.state(), VcpuState::Paused);
    assert_eq!(resume_count(&a), -2);

    // One resume is still owed to the first pause.
    assert_eq!(VcpuManager::resume(&a), Err(Error::Again));
    assert_eq!(a.state(), VcpuState::Paused);
    assert_eq!(resume_count(&a), -1);

    // The second resume takes effect.
    VcpuManager::resume(&a).unwrap();
    assert_eq!(a.state(), VcpuState::Running);
    assert_eq!(resume_count(&a), 0);
}

#[test]
fn pause_resume_pairing_law() {
    let _w = harness::world();
    boot_cpu(0);

    let a = spawn_orphan("paired", 5);
    VcpuManager::kick(&a).unwrap();

    // pause/resume interleaved: always lands back in the original state
    // with a zero counter.
    VcpuManager::pause(&a).unwrap();
    VcpuManager::resume(&a).unwrap();
    VcpuManager::pause(&a).unwrap();
    VcpuManager::resume(&a).unwrap();
    assert_eq!(a.state(), VcpuState::Running);
    assert_eq!(resume_count(&a), 0);

    // resume-first ordering: the early resume is banked and cancels the
    // first pause, the second pause takes effect.
    VcpuManager::resume(&a).unwrap();
    assert_eq!(resume_count(&a), 1);
    assert_eq!(VcpuManager::pause(&a), Ok(()));
    assert_eq!(a.state(), VcpuState::Running);
    assert_eq!(resume_count(&a), 0);
    VcpuManager::pause(&a).unwrap();
    VcpuManager::resume(&a).unwrap();
    assert_eq!(a.state(), VcpuState::Running);
    assert_eq!(resume_count(&a), 0);

    // pause-pause-resume-resume from two actors.
    let _ = VcpuManager::pause(&a);
    let _ = VcpuManager::pause(&a);
    let _ = VcpuManager::resume(&a);
    let _ = VcpuManager::resume(&a);
    assert_eq!(a.state(), VcpuState::Running);
    assert_eq!(resume_count(&a), 0);
}

#[test]
fn kick_is_idempotent_for_runnable_vcpus() {
    let _w = harness::world();
    boot_cpu(0);

    let a = spawn_orphan("idem", 5);
    VcpuManager::kick(&a).unwrap();
    assert_eq!(a.state(), VcpuState::Running);

    // Kicking a running VCPU succeeds without any queue effect; the
    // banked resume is cancelled by a later pause.
    VcpuManager::kick(&a).unwrap();
    assert_eq!(a.state(), VcpuState::Running);
    assert_eq!(scheduler::ready_count(0, 5), 0);
    assert_eq!(resume_count(&a), 1);
    assert_eq!(VcpuManager::pause(&a), Ok(()));
    assert_eq!(a.state(), VcpuState::Running);
}

#[test]
fn halted_vcpu_needs_reset_before_kick() {
    let _w = harness::world();
    boot_cpu(0);

    let a = spawn_orphan("haltme", 5);
    VcpuManager::kick(&a).unwrap();

    VcpuManager::halt(&a).unwrap();
    assert_eq!(a.state(), VcpuState::Halted);
    assert_eq!(scheduler::current_vcpu().unwrap().name(), "idle/0");

    assert_eq!(VcpuManager::kick(&a), Err(Error::Invalid));
    assert_eq!(a.state(), VcpuState::Halted);

    VcpuManager::reset(&a).unwrap();
    assert_eq!(a.state(), VcpuState::Reset);
    VcpuManager::kick(&a).unwrap();
    assert_eq!(a.state(), VcpuState::Running);
}

#[test]
fn reset_clears_accounting_and_requeues() {
    let _w = harness::world();
    boot_cpu(0);

    let a = spawn_orphan("resettable", 5);
    VcpuManager::kick(&a).unwrap();
    harness::advance_clock(30 * MS);

    // Reset of the running VCPU preempts it and zeroes the buckets.
    VcpuManager::reset(&a).unwrap();
    assert_eq!(a.state(), VcpuState::Reset);
    assert_eq!(scheduler::current_vcpu().unwrap().name(), "idle/0");

    let stats = VcpuManager::stats(&a);
    assert_eq!(stats.running_nsecs, 0);
    assert_eq!(stats.ready_nsecs, 0);
    assert_eq!(stats.reset_count, 1);
    assert_eq!(resume_count(&a), 0);
    assert_eq!(scheduler::ready_count(0, 5), 0);

    // A queued VCPU is detached by reset.
    let b = spawn_orphan("queued", 4);
    VcpuManager::kick(&b).unwrap();
    assert_eq!(b.state(), VcpuState::Running);
    VcpuManager::kick(&a).unwrap();
    assert_eq!(a.state(), VcpuState::Running);
    assert_eq!(b.state(), VcpuState::Ready);
    VcpuManager::reset(&b).unwrap();
    assert_eq!(scheduler::ready_count(0, 4), 0);
    assert_eq!(b.state(), VcpuState::Reset);
}

#[test]
fn orphan_yield_rotates_to_band_peer() {
    let _w = harness::world();
    boot_cpu(0);

    let a = spawn_orphan("yield-a", 5);
    VcpuManager::kick(&a).unwrap();
    let b = spawn_orphan("yield-b", 5);
    VcpuManager::kick(&b).unwrap();

    harness::clear_switches();
    scheduler::yield_now();

    assert!(Arc::ptr_eq(&scheduler::current_vcpu().unwrap(), &b));
    assert_eq!(a.state(), VcpuState::Ready);
    assert_eq!(harness::switches(), vec![(Some(a.id().0), b.id().0)]);
}

#[test]
fn normal_vcpu_yields_on_irq_exit() {
    let _w = harness::world();
    boot_cpu(0);

    let g1 = spawn_guest("guest0/cpu0", 7, 6);
    VcpuManager::kick(&g1).unwrap();
    let g2 = spawn_guest("guest0/cpu1", 7, 6);
    VcpuManager::kick(&g2).unwrap();

    assert!(Arc::ptr_eq(&scheduler::current_vcpu().unwrap(), &g1));
    assert!(scheduler::normal_context());
    assert_eq!(scheduler::current_guest(), Some(GuestId(7)));

    // A normal VCPU yields from inside its own trap window (WFI emulation
    // and friends): the flag is armed after irq_enter and honored by
    // irq_exit on the way back to the guest.
    let mut regs = Regs::default();
    scheduler::irq_enter(&mut regs, true);
    scheduler::yield_now();
    assert!(Arc::ptr_eq(&scheduler::current_vcpu().unwrap(), &g1));
    scheduler::irq_exit(&mut regs);

    assert!(Arc::ptr_eq(&scheduler::current_vcpu().unwrap(), &g2));
    assert_eq!(g1.state(), VcpuState::Ready);
}

#[test]
fn cross_cpu_migration() {
    let _w = harness::world();
    boot_cpu(0);
    smp::ipi_init().unwrap();
    boot_cpu(1);
    smp::ipi_init().unwrap();

    harness::set_cpu(0);
    let a = spawn_orphan("migrant", 5);
    VcpuManager::set_affinity(&a, CpuMask::of(0)).unwrap();
    VcpuManager::kick(&a).unwrap();
    assert!(Arc::ptr_eq(&scheduler::current_vcpu().unwrap(), &a));

    // Migration target must be inside the affinity mask.
    assert_eq!(scheduler::set_hcpu(&a, 1), Err(Error::Invalid));
    assert_eq!(scheduler::set_hcpu(&a, 8), Err(Error::Invalid));

    let mut mask = CpuMask::of(0);
    mask.set(1);
    VcpuManager::set_affinity(&a, mask).unwrap();

    // The request rides an IPI to the old owner; posting it wakes the
    // bottom-half orphan, which preempts the migrating VCPU first.
    scheduler::set_hcpu(&a, 1).unwrap();
    assert_eq!(scheduler::current_vcpu().unwrap().name(), "ipi/0");
    assert_eq!(a.state(), VcpuState::Ready);
    assert_eq!(scheduler::ready_count(0, 5), 1);

    // Drain the bottom half: the VCPU hops queues exactly once.
    smp::ipi_process_pending();
    assert_eq!(scheduler::get_hcpu(&a), 1);
    assert_eq!(a.state(), VcpuState::Ready);
    assert_eq!(scheduler::ready_count(0, 5), 0);
    assert_eq!(scheduler::ready_count(1, 5), 1);

    // The new owner got its doorbell rung.
    assert!(harness::ipis().contains(&1));

    // Same-CPU request is a no-op.
    scheduler::set_hcpu(&a, 1).unwrap();
    assert_eq!(scheduler::get_hcpu(&a), 1);
}

#[test]
fn migration_ipi_revalidates_preconditions() {
    let _w = harness::world();
    boot_cpu(0);
    smp::ipi_init().unwrap();
    boot_cpu(1);

    harness::set_cpu(0);
    let a = spawn_orphan("stale", 5);
    let mut mask = CpuMask::of(0);
    mask.set(1);
    VcpuManager::set_affinity(&a, mask).unwrap();
    VcpuManager::kick(&a).unwrap();

    scheduler::set_hcpu(&a, 1).unwrap();

    // The world moves before the IPI runs: the VCPU gets paused.
    VcpuManager::pause(&a).unwrap();
    assert_eq!(a.state(), VcpuState::Paused);

    // The stale migration must no-op.
    smp::ipi_process_pending();
    assert_eq!(scheduler::get_hcpu(&a), 0);
    assert_eq!(scheduler::ready_count(1, 5), 0);
}

#[test]
fn irq_time_is_not_charged_to_the_running_vcpu() {
    let _w = harness::world();
    boot_cpu(0);

    let a = spawn_orphan("charged", 5);
    VcpuManager::kick(&a).unwrap();

    // Halfway through the slice, a 5 ms hardware trap arrives.
    harness::advance_clock(50 * MS);
    harness::set_cpu(0);
    let mut regs = Regs::default();
    scheduler::irq_enter(&mut regs, false);
    assert!(scheduler::irq_context());
    harness::advance_clock(5 * MS);
    scheduler::irq_exit(&mut regs);
    assert!(!scheduler::irq_context());

    // Slice expiry after 100 ms of wall time: only 95 ms are charged.
    harness::advance_clock(45 * MS);
    simulate_tick(0);
    assert_eq!(VcpuManager::stats(&a).running_nsecs, 95 * MS);
}

#[test]
fn sample_window_reports_idle_and_irq_time() {
    let _w = harness::world();
    let t0 = harness::now_ns();
    boot_cpu(0);
    assert_eq!(scheduler::get_sample_period(0), 1_000 * MS);

    // 5 ms trap while idle runs.
    harness::advance_clock(100 * MS);
    harness::set_cpu(0);
    let mut regs = Regs::default();
    scheduler::irq_enter(&mut regs, false);
    harness::advance_clock(5 * MS);
    scheduler::irq_exit(&mut regs);

    // Idle gets displaced 200 ms in.
    harness::advance_clock(95 * MS);
    let a = spawn_orphan("busy", 5);
    VcpuManager::kick(&a).unwrap();

    // Cross the window boundary.
    let elapsed = harness::now_ns() - t0;
    harness::advance_clock(1_000 * MS - elapsed);
    simulate_tick(0);

    // Idle owned the CPU for 200 ms minus the 5 ms spent in the trap.
    assert_eq!(scheduler::idle_time(0), 195 * MS);
    assert_eq!(scheduler::irq_time(0), 5 * MS);

    scheduler::set_sample_period(0, 500 * MS);
    assert_eq!(scheduler::get_sample_period(0), 500 * MS);
}

#[test]
fn state_time_buckets_add_up() {
    let _w = harness::world();
    boot_cpu(0);

    let a = spawn_orphan("ledger", 5);
    harness::advance_clock(10 * MS); // time in RESET, not bucketed

    VcpuManager::kick(&a).unwrap();
    harness::advance_clock(30 * MS);
    VcpuManager::pause(&a).unwrap();
    harness::advance_clock(20 * MS);
    VcpuManager::resume(&a).unwrap();
    harness::advance_clock(40 * MS);
    simulate_tick(0);

    let stats = VcpuManager::stats(&a);
    assert_eq!(stats.running_nsecs, 70 * MS);
    assert_eq!(stats.paused_nsecs, 20 * MS);
    assert_eq!(stats.ready_nsecs, 0);
    assert_eq!(stats.halted_nsecs, 0);
}

#[test]
fn force_resched_validates_target() {
    let _w = harness::world();
    boot_cpu(0);

    assert_eq!(scheduler::force_resched(64), Err(Error::Invalid));
    assert_eq!(scheduler::force_resched(2), Err(Error::NotAvail));
    scheduler::force_resched(0).unwrap();
}

#[test]
fn introspection_rejects_offline_cpus() {
    let _w = harness::world();
    boot_cpu(0);

    assert!(scheduler::idle_vcpu(2).is_none());
    assert_eq!(scheduler::ready_count(2, VCPU_MIN_PRIORITY), 0);
    assert_eq!(scheduler::idle_time(2), 0);
    assert_eq!(scheduler::irq_time(2), 0);
    assert_eq!(scheduler::get_sample_period(2), 1_000 * MS);
    assert_eq!(scheduler::ready_count(0, VCPU_MAX_PRIORITY + 1), 0);
}

#[test]
fn state_change_locked_releases_held_lock() {
    let _w = harness::world();
    boot_cpu(0);

    static HELD: spin::Mutex<()> = spin::Mutex::new(());

    let a = spawn_orphan("locked-kick", 5);

    // Hold the lock the way a wait-queue caller would, then kick: the
    // synchronous orphan preemption must run with the lock released.
    core::mem::forget(HELD.lock());
    scheduler::state_change_locked(&a, VcpuState::Ready, &HELD).unwrap();

    assert!(Arc::ptr_eq(&scheduler::current_vcpu().unwrap(), &a));
    assert!(HELD.is_locked());
    unsafe { HELD.force_unlock() };
}
