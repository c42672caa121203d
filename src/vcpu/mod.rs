/*
 * Virtual CPU (VCPU) Entity
 *
 * A VCPU is the schedulable unit of the hypervisor. It is either a normal
 * VCPU (owned by a guest, with a full guest register file) or an orphan
 * (a hypervisor-context thread with no guest, such as the per-CPU idle loop
 * and the IPI bottom-halves).
 *
 * Field placement follows the locking design:
 * - identity and creation-time parameters are plain fields
 * - the state word and scheduling parameters are atomics, readable from any
 *   CPU without taking a lock
 * - ownership and accounting (host CPU, affinity, resume refcount, time
 *   buckets) live behind the per-VCPU `sched` rwlock
 *
 * State values are disjoint bits so the SAVEABLE and INTERRUPTIBLE classes
 * are a single mask test on the atomic word.
 */

pub mod manager;
pub mod virq;

use alloc::boxed::Box;
use alloc::string::String;
use core::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};

use crate::arch::{self, Regs};
use crate::smp::CpuMask;
use crate::sync::{IrqRwLock, IrqSpinLock};
use virq::VirqState;

/// Stable VCPU identifier, an index into the manager arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VcpuId(pub u32);

/// Identifier of the guest a normal VCPU belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GuestId(pub u32);

/// VCPU lifecycle states.
///
/// The values are disjoint bits: `SAVEABLE_MASK` and `INTERRUPTIBLE_MASK`
/// below classify states with one AND. Only the scheduler itself ever
/// writes `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum VcpuState {
    /// Not yet registered with the scheduler, or being destroyed
    Unknown = 0x01,
    /// Registered, scheduling parameters installed, not runnable yet
    Reset = 0x02,
    /// On a ready queue, waiting for a slice
    Ready = 0x04,
    /// Current VCPU of its host CPU
    Running = 0x08,
    /// Taken off the scheduler by a pause request
    Paused = 0x10,
    /// Taken off the scheduler permanently (until reset)
    Halted = 0x20,
}

impl VcpuState {
    /// States in which the VCPU context is live on some host CPU.
    pub const SAVEABLE_MASK: u32 = VcpuState::Ready as u32 | VcpuState::Running as u32;

    /// States a pause/resume request may be applied to.
    pub const INTERRUPTIBLE_MASK: u32 =
        VcpuState::Ready as u32 | VcpuState::Running as u32 | VcpuState::Paused as u32;

    pub const fn bits(self) -> u32 {
        self as u32
    }

    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0x01 => Some(VcpuState::Unknown),
            0x02 => Some(VcpuState::Reset),
            0x04 => Some(VcpuState::Ready),
            0x08 => Some(VcpuState::Running),
            0x10 => Some(VcpuState::Paused),
            0x20 => Some(VcpuState::Halted),
            _ => None,
        }
    }

    pub fn is_saveable(self) -> bool {
        self.bits() & Self::SAVEABLE_MASK != 0
    }

    pub fn is_interruptible(self) -> bool {
        self.bits() & Self::INTERRUPTIBLE_MASK != 0
    }
}

/// Ownership and accounting fields guarded by the per-VCPU `sched` rwlock.
#[derive(Debug)]
pub struct VcpuSched {
    /// Host CPU currently owning this VCPU
    pub hcpu: u32,
    /// Host CPUs this VCPU may execute on
    pub cpu_affinity: CpuMask,
    /// Reconciles overlapping pause/resume requests. Positive values block
    /// pause, negative values block resume.
    pub resume_count: i32,
    /// Number of resets since creation
    pub reset_count: u32,
    /// Timestamp of the last accepted state transition
    pub state_tstamp: u64,
    /// Timestamp of the last reset
    pub reset_tstamp: u64,
    /// Cumulative nanoseconds spent READY
    pub ready_nsecs: u64,
    /// Cumulative nanoseconds spent RUNNING, IRQ time excluded
    pub running_nsecs: u64,
    /// Cumulative nanoseconds spent PAUSED
    pub paused_nsecs: u64,
    /// Cumulative nanoseconds spent HALTED
    pub halted_nsecs: u64,
}

/// A schedulable context: guest VCPU or orphan thread.
pub struct Vcpu {
    id: VcpuId,
    name: String,
    is_normal: bool,
    guest: Option<GuestId>,
    start_pc: u64,
    stack: Option<Box<[u8]>>,

    priority: AtomicU8,
    time_slice_ns: AtomicU64,
    deadline_ns: AtomicU64,
    periodicity_ns: AtomicU64,

    /// Nonzero disables involuntary preemption of this VCPU.
    preempt_count: AtomicU32,

    state: AtomicU32,

    pub(crate) sched: IrqRwLock<VcpuSched>,
    pub(crate) regs: IrqSpinLock<Regs>,
    pub(crate) virq: VirqState,
}

impl Vcpu {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: VcpuId,
        name: String,
        is_normal: bool,
        guest: Option<GuestId>,
        start_pc: u64,
        stack: Option<Box<[u8]>>,
        hcpu: u32,
        priority: u8,
        time_slice_ns: u64,
        deadline_ns: u64,
        periodicity_ns: u64,
    ) -> Self {
        let stack_top = match &stack {
            Some(s) => s.as_ptr() as u64 + s.len() as u64,
            None => 0,
        };
        Self {
            id,
            name,
            is_normal,
            guest,
            start_pc,
            stack,
            priority: AtomicU8::new(priority),
            time_slice_ns: AtomicU64::new(time_slice_ns),
            deadline_ns: AtomicU64::new(deadline_ns),
            periodicity_ns: AtomicU64::new(periodicity_ns),
            preempt_count: AtomicU32::new(0),
            state: AtomicU32::new(VcpuState::Unknown.bits()),
            sched: IrqRwLock::new(VcpuSched {
                hcpu,
                cpu_affinity: CpuMask::all(),
                resume_count: 0,
                reset_count: 0,
                state_tstamp: 0,
                reset_tstamp: 0,
                ready_nsecs: 0,
                running_nsecs: 0,
                paused_nsecs: 0,
                halted_nsecs: 0,
            }),
            regs: IrqSpinLock::new(Regs::new(start_pc, stack_top)),
            virq: VirqState::new(),
        }
    }

    pub fn id(&self) -> VcpuId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True for guest VCPUs, false for orphan threads.
    pub fn is_normal(&self) -> bool {
        self.is_normal
    }

    pub fn guest(&self) -> Option<GuestId> {
        self.guest
    }

    /// Entry address of this context after a reset.
    pub fn start_pc(&self) -> u64 {
        self.start_pc
    }

    /// Top of the orphan stack, 0 for normal VCPUs.
    pub fn stack_top(&self) -> u64 {
        match &self.stack {
            Some(s) => s.as_ptr() as u64 + s.len() as u64,
            None => 0,
        }
    }

    pub fn state(&self) -> VcpuState {
        VcpuState::from_bits(self.state.load(Ordering::Acquire)).expect("corrupt vcpu state word")
    }

    pub(crate) fn set_state(&self, state: VcpuState) {
        self.state.store(state.bits(), Ordering::Release);
    }

    pub fn priority(&self) -> u8 {
        self.priority.load(Ordering::Acquire)
    }

    pub fn time_slice_ns(&self) -> u64 {
        self.time_slice_ns.load(Ordering::Acquire)
    }

    pub fn deadline_ns(&self) -> u64 {
        self.deadline_ns.load(Ordering::Acquire)
    }

    pub fn periodicity_ns(&self) -> u64 {
        self.periodicity_ns.load(Ordering::Acquire)
    }

    pub fn preempt_count(&self) -> u32 {
        self.preempt_count.load(Ordering::Acquire)
    }

    pub(crate) fn preempt_count_inc(&self) {
        self.preempt_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn preempt_count_dec(&self) {
        let _ = self
            .preempt_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
    }

    /// Host CPU currently owning this VCPU.
    pub fn hcpu(&self) -> u32 {
        self.sched.read_irqsave().hcpu
    }

    /// Virtual interrupt lines of this VCPU.
    pub fn virq(&self) -> &VirqState {
        &self.virq
    }

    /// Deliver pending virtual interrupts into the given frame, for normal
    /// VCPUs. Called on IRQ exit by the scheduler.
    pub(crate) fn virq_process(&self, regs: *mut Regs) {
        if self.is_normal && self.virq.pending() {
            arch::port().vcpu_irq_deliver(self, regs);
        }
    }
}

impl core::fmt::Debug for Vcpu {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Vcpu")
            .field("id", &self.id.0)
            .field("name", &self.name)
            .field("is_normal", &self.is_normal)
            .field("state", &self.state())
            .field("priority", &self.priority())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_masks() {
        assert!(VcpuState::Ready.is_saveable());
        assert!(VcpuState::Running.is_saveable());
        assert!(!VcpuState::Paused.is_saveable());
        assert!(VcpuState::Paused.is_interruptible());
        assert!(!VcpuState::Reset.is_interruptible());
        assert!(!VcpuState::Unknown.is_interruptible());
        assert_eq!(VcpuState::from_bits(0x08), Some(VcpuState::Running));
        assert_eq!(VcpuState::from_bits(0x03), None);
    }
}
