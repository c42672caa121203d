/*
 * SMP Support: CPU Masks, Online Map, Async IPIs
 *
 * Cross-CPU coordination in the core happens through asynchronous IPI
 * calls: a function plus three word arguments queued to a target CPU and
 * executed there by that CPU's high-priority IPI bottom-half orphan. The
 * scheduler uses this for forced rescheduling and for VCPU migration, which
 * must be serialized on the VCPU's current owner.
 *
 * Posting a call kicks the target's bottom-half orphan (when it is parked)
 * and rings the architecture IPI doorbell. The bottom-half drains its queue
 * and parks itself again.
 */

use alloc::format;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::config::{CPU_COUNT, IPI_QUEUE_LEN, THREAD_STACK_SIZE, VCPU_MAX_PRIORITY};
use crate::error::{Error, Result};
use crate::sync::IrqSpinLock;
use crate::vcpu::manager::VcpuManager;
use crate::vcpu::{Vcpu, VcpuState};
use crate::{arch, config, scheduler};

/// Bitmask of host CPUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuMask(u32);

impl CpuMask {
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Mask containing every possible CPU.
    pub const fn all() -> Self {
        Self((1u32 << CPU_COUNT) - 1)
    }

    /// Mask containing exactly `cpu`.
    pub const fn of(cpu: u32) -> Self {
        Self(1 << cpu)
    }

    pub fn set(&mut self, cpu: u32) {
        self.0 |= 1 << cpu;
    }

    pub fn clear(&mut self, cpu: u32) {
        self.0 &= !(1 << cpu);
    }

    pub fn test(&self, cpu: u32) -> bool {
        cpu < CPU_COUNT as u32 && self.0 & (1 << cpu) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Lowest numbered CPU in the mask.
    pub fn first(&self) -> Option<u32> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros())
        }
    }

    pub fn and(&self, other: CpuMask) -> CpuMask {
        CpuMask(self.0 & other.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        (0..CPU_COUNT as u32).filter(move |&c| self.test(c))
    }
}

static ONLINE: AtomicU32 = AtomicU32::new(0);

/// Identifier of the calling CPU.
#[inline]
pub fn processor_id() -> u32 {
    arch::port().processor_id()
}

pub fn is_boot_cpu() -> bool {
    processor_id() == 0
}

pub fn set_cpu_online(cpu: u32, online: bool) {
    if online {
        ONLINE.fetch_or(1 << cpu, Ordering::SeqCst);
    } else {
        ONLINE.fetch_and(!(1 << cpu), Ordering::SeqCst);
    }
}

pub fn is_cpu_online(cpu: u32) -> bool {
    cpu < CPU_COUNT as u32 && ONLINE.load(Ordering::SeqCst) & (1 << cpu) != 0
}

pub fn online_mask() -> CpuMask {
    CpuMask(ONLINE.load(Ordering::SeqCst))
}

// ============================================================================
// ASYNC IPI CALLS
// ============================================================================

/// Function shape of an asynchronous IPI call. The three words are whatever
/// the poster and the handler agree on (VCPU ids, CPU numbers, cookies).
pub type AsyncFunc = fn(usize, usize, usize);

#[derive(Clone, Copy)]
struct AsyncCall {
    func: AsyncFunc,
    args: (usize, usize, usize),
}

static IPI_QUEUES: [IrqSpinLock<heapless::Deque<AsyncCall, IPI_QUEUE_LEN>>; CPU_COUNT] =
    [const { IrqSpinLock::new(heapless::Deque::new()) }; CPU_COUNT];

static IPI_VCPUS: [IrqSpinLock<Option<Arc<Vcpu>>>; CPU_COUNT] =
    [const { IrqSpinLock::new(None) }; CPU_COUNT];

/// Queue `func(a0, a1, a2)` for execution on every online CPU in `dest`.
///
/// The call runs on the target's IPI bottom-half orphan, which preempts
/// whatever was running there. Offline CPUs in the mask are skipped. A full
/// target queue drops the call with a warning; posters that need a
/// guarantee must check the result.
pub fn ipi_async_call(dest: CpuMask, func: AsyncFunc, a0: usize, a1: usize, a2: usize) -> Result<()> {
    let mut posted_all = true;

    for cpu in dest.iter() {
        if !is_cpu_online(cpu) {
            continue;
        }

        let full = {
            let mut q = IPI_QUEUES[cpu as usize].lock_irqsave();
            q.push_back(AsyncCall {
                func,
                args: (a0, a1, a2),
            })
            .is_err()
        };
        if full {
            log::warn!("smp: CPU{} IPI queue full, call dropped", cpu);
            posted_all = false;
            continue;
        }

        // Wake the bottom-half orphan if it is parked.
        let bh = IPI_VCPUS[cpu as usize].lock_irqsave().clone();
        if let Some(bh) = bh {
            let state = bh.state();
            if state == VcpuState::Paused || state == VcpuState::Reset {
                let _ = VcpuManager::kick(&bh);
            }
        }

        if cpu != processor_id() {
            arch::port().trigger_ipi(cpu);
        }
    }

    if posted_all { Ok(()) } else { Err(Error::NoMem) }
}

/// Drain and execute the calling CPU's pending async calls.
///
/// Runs on the IPI bottom-half orphan. Calls execute outside the queue lock
/// so they may post further IPIs.
pub fn ipi_process_pending() {
    let cpu = processor_id();
    loop {
        let call = IPI_QUEUES[cpu as usize].lock_irqsave().pop_front();
        match call {
            Some(c) => (c.func)(c.args.0, c.args.1, c.args.2),
            None => break,
        }
    }
}

/// Body of the per-CPU IPI bottom-half orphan: drain the queue, then park
/// until the next post kicks us.
fn ipi_orphan_body() {
    loop {
        ipi_process_pending();
        if let Some(me) = scheduler::current_vcpu() {
            let _ = scheduler::state_change(&me, VcpuState::Paused);
        }
    }
}

/// Create the calling CPU's IPI bottom-half orphan.
///
/// Must run after `scheduler::init` for this CPU. The orphan is created
/// parked; the first posted call kicks it.
pub fn ipi_init() -> Result<()> {
    let cpu = processor_id();

    let name = format!("ipi/{}", cpu);
    let bh = VcpuManager::orphan_create(
        &name,
        ipi_orphan_body,
        THREAD_STACK_SIZE,
        VCPU_MAX_PRIORITY,
        config::VCPU_DEF_TIME_SLICE_NS,
        config::VCPU_DEF_TIME_SLICE_NS,
        config::VCPU_DEF_TIME_SLICE_NS,
    )?;
    VcpuManager::set_affinity(&bh, CpuMask::of(cpu))?;

    *IPI_VCPUS[cpu as usize].lock_irqsave() = Some(bh);
    log::info!("smp: CPU{} IPI bottom-half ready", cpu);

    Ok(())
}

/// Clear the online map, IPI queues and bottom-half registry. Test-only
/// world reset.
#[cfg(test)]
pub(crate) fn test_reset() {
    ONLINE.store(0, Ordering::SeqCst);
    for queue in &IPI_QUEUES {
        while queue.lock_irqsave().pop_front().is_some() {}
    }
    for slot in &IPI_VCPUS {
        *slot.lock_irqsave() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpumask_ops() {
        let mut m = CpuMask::empty();
        assert!(m.is_empty());
        m.set(0);
        m.set(2);
        assert!(m.test(0));
        assert!(!m.test(1));
        assert!(m.test(2));
        assert_eq!(m.first(), Some(0));
        m.clear(0);
        assert_eq!(m.first(), Some(2));
        assert_eq!(CpuMask::of(1).and(m), CpuMask::empty());
        assert_eq!(CpuMask::all().iter().count(), CPU_COUNT);
    }

    #[test]
    fn cpumask_out_of_range() {
        let m = CpuMask::all();
        assert!(!m.test(CPU_COUNT as u32));
    }
}
