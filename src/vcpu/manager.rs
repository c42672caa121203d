/*
 * VCPU Manager
 *
 * Owns every VCPU in the system. VCPUs live in a fixed-capacity arena of
 * reference-counted handles indexed by VcpuId; guests and the scheduler
 * refer to VCPUs by id or by handle, never by direct ownership, which
 * breaks the guest <-> vcpu reference cycle.
 *
 * VcpuManager is a Zero-Sized Type that namespaces the lifecycle API:
 * creation of orphans and guest VCPUs, the kick/pause/resume/halt/reset
 * wrappers over the scheduler state machine, affinity control and stats.
 */

use alloc::string::ToString;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use super::{GuestId, Vcpu, VcpuId, VcpuState};
use crate::config::{MAX_VCPU_COUNT, VCPU_MAX_PRIORITY};
use crate::error::{Error, Result};
use crate::smp::{self, CpuMask};
use crate::sync::IrqSpinLock;
use crate::{scheduler, time};

static VCPUS: IrqSpinLock<Vec<Option<Arc<Vcpu>>>> = IrqSpinLock::new(Vec::new());

/// Point-in-time statistics of one VCPU.
///
/// `running_nsecs` of a currently RUNNING VCPU includes the time elapsed in
/// the ongoing slice, so consumers like the utilization sampler see live
/// values rather than slice-granular ones.
#[derive(Debug, Clone, Copy)]
pub struct VcpuStats {
    pub state: VcpuState,
    pub reset_count: u32,
    pub last_reset_tstamp: u64,
    pub ready_nsecs: u64,
    pub running_nsecs: u64,
    pub paused_nsecs: u64,
    pub halted_nsecs: u64,
}

/// VCPU lifecycle and bookkeeping API.
pub struct VcpuManager;

impl VcpuManager {
    /// Reserve an arena slot and publish the VCPU built by `make`.
    fn publish(make: impl FnOnce(VcpuId) -> Vcpu) -> Result<Arc<Vcpu>> {
        let mut table = VCPUS.lock_irqsave();

        let slot = match table.iter().position(|s| s.is_none()) {
            Some(idx) => idx,
            None if table.len() < MAX_VCPU_COUNT => {
                table.push(None);
                table.len() - 1
            }
            None => return Err(Error::NoMem),
        };

        let vcpu = Arc::new(make(VcpuId(slot as u32)));
        table[slot] = Some(vcpu.clone());
        Ok(vcpu)
    }

    /// Create an orphan VCPU: a hypervisor-context thread with its own
    /// stack and no guest register file.
    ///
    /// The new orphan is registered with the scheduler of the calling CPU
    /// and left in RESET; kick it to make it runnable.
    ///
    /// # Arguments
    /// * `name` - unique human readable name
    /// * `entry` - thread body, must never return
    /// * `stack_size` - stack allocation in bytes
    /// * `priority` - scheduling priority
    /// * `time_slice_ns` / `deadline_ns` / `periodicity_ns` - scheduling
    ///   parameters; only the slice is used by the default policy
    pub fn orphan_create(
        name: &str,
        entry: fn(),
        stack_size: usize,
        priority: u8,
        time_slice_ns: u64,
        deadline_ns: u64,
        periodicity_ns: u64,
    ) -> Result<Arc<Vcpu>> {
        if name.is_empty() || priority > VCPU_MAX_PRIORITY || stack_size == 0 || time_slice_ns == 0
        {
            return Err(Error::Invalid);
        }

        let stack = vec![0u8; stack_size].into_boxed_slice();
        let hcpu = smp::processor_id();
        let vcpu = Self::publish(|id| {
            Vcpu::new(
                id,
                name.to_string(),
                false,
                None,
                entry as usize as u64,
                Some(stack),
                hcpu,
                priority,
                time_slice_ns,
                deadline_ns,
                periodicity_ns,
            )
        })?;

        if let Err(e) = scheduler::state_change(&vcpu, VcpuState::Reset) {
            Self::unpublish(vcpu.id());
            return Err(e);
        }

        log::info!("manager: created orphan vcpu '{}' (prio {})", name, priority);
        Ok(vcpu)
    }

    /// Create a normal VCPU belonging to `guest`.
    ///
    /// The guest register file starts at `entry_pc`; the stack pointer is
    /// whatever the guest image sets up for itself.
    pub fn guest_vcpu_create(
        name: &str,
        guest: GuestId,
        entry_pc: u64,
        priority: u8,
        time_slice_ns: u64,
        deadline_ns: u64,
        periodicity_ns: u64,
    ) -> Result<Arc<Vcpu>> {
        if name.is_empty() || priority > VCPU_MAX_PRIORITY || time_slice_ns == 0 {
            return Err(Error::Invalid);
        }

        let hcpu = smp::processor_id();
        let vcpu = Self::publish(|id| {
            Vcpu::new(
                id,
                name.to_string(),
                true,
                Some(guest),
                entry_pc,
                None,
                hcpu,
                priority,
                time_slice_ns,
                deadline_ns,
                periodicity_ns,
            )
        })?;

        if let Err(e) = scheduler::state_change(&vcpu, VcpuState::Reset) {
            Self::unpublish(vcpu.id());
            return Err(e);
        }

        log::info!(
            "manager: created vcpu '{}' for guest {} (prio {})",
            name,
            guest.0,
            priority
        );
        Ok(vcpu)
    }

    fn unpublish(id: VcpuId) {
        let mut table = VCPUS.lock_irqsave();
        if let Some(slot) = table.get_mut(id.0 as usize) {
            *slot = None;
        }
    }

    /// Tear a VCPU down. It is unregistered from its scheduler and removed
    /// from the arena; outstanding handles keep the object alive but it
    /// will never run again.
    pub fn destroy(vcpu: &Arc<Vcpu>) -> Result<()> {
        scheduler::state_change(vcpu, VcpuState::Unknown)?;
        Self::unpublish(vcpu.id());
        log::info!("manager: destroyed vcpu '{}'", vcpu.name());
        Ok(())
    }

    /// Make a RESET or PAUSED VCPU runnable.
    pub fn kick(vcpu: &Arc<Vcpu>) -> Result<()> {
        scheduler::state_change(vcpu, VcpuState::Ready)
    }

    /// Pause a runnable VCPU. Balanced by [`Self::resume`].
    pub fn pause(vcpu: &Arc<Vcpu>) -> Result<()> {
        scheduler::state_change(vcpu, VcpuState::Paused)
    }

    /// Resume a paused VCPU.
    pub fn resume(vcpu: &Arc<Vcpu>) -> Result<()> {
        scheduler::state_change(vcpu, VcpuState::Ready)
    }

    /// Halt a runnable VCPU until the next reset.
    pub fn halt(vcpu: &Arc<Vcpu>) -> Result<()> {
        scheduler::state_change(vcpu, VcpuState::Halted)
    }

    /// Reset a VCPU: reinstall scheduling parameters, zero the accounting
    /// buckets and rebuild the architectural state.
    pub fn reset(vcpu: &Arc<Vcpu>) -> Result<()> {
        scheduler::state_change(vcpu, VcpuState::Reset)
    }

    /// Look a VCPU up by id.
    pub fn get(id: VcpuId) -> Option<Arc<Vcpu>> {
        VCPUS
            .lock_irqsave()
            .get(id.0 as usize)
            .and_then(|s| s.clone())
    }

    /// Number of live VCPUs.
    pub fn count() -> usize {
        VCPUS.lock_irqsave().iter().filter(|s| s.is_some()).count()
    }

    /// Visit every live VCPU.
    pub fn iterate(mut f: impl FnMut(&Arc<Vcpu>)) {
        let snapshot: Vec<Arc<Vcpu>> = {
            let table = VCPUS.lock_irqsave();
            table.iter().flatten().cloned().collect()
        };
        for vcpu in &snapshot {
            f(vcpu);
        }
    }

    /// Restrict the host CPUs a VCPU may run on.
    ///
    /// The mask must contain at least one online CPU. If the VCPU's
    /// current host CPU leaves the mask, it is moved to the first CPU of
    /// the mask.
    pub fn set_affinity(vcpu: &Arc<Vcpu>, mask: CpuMask) -> Result<()> {
        let usable = mask.and(smp::online_mask());
        if usable.is_empty() {
            return Err(Error::Invalid);
        }

        let hcpu = {
            let mut guard = vcpu.sched.write_irqsave();
            guard.cpu_affinity = mask;
            guard.hcpu
        };

        if !mask.test(hcpu) {
            let target = usable.first().unwrap();
            scheduler::set_hcpu(vcpu, target)?;
        }
        Ok(())
    }

    /// Host CPUs the VCPU may run on.
    pub fn get_affinity(vcpu: &Arc<Vcpu>) -> CpuMask {
        vcpu.sched.read_irqsave().cpu_affinity
    }

    /// Current state of a VCPU.
    pub fn get_state(vcpu: &Arc<Vcpu>) -> VcpuState {
        vcpu.state()
    }

    /// Snapshot a VCPU's accounting, adjusting the running bucket of a
    /// currently RUNNING VCPU by the elapsed part of its slice.
    pub fn stats(vcpu: &Arc<Vcpu>) -> VcpuStats {
        let guard = vcpu.sched.read_irqsave();
        let state = vcpu.state();

        let mut running_nsecs = guard.running_nsecs;
        if state == VcpuState::Running {
            running_nsecs += time::timestamp_ns().saturating_sub(guard.state_tstamp);
        }

        VcpuStats {
            state,
            reset_count: guard.reset_count,
            last_reset_tstamp: guard.reset_tstamp,
            ready_nsecs: guard.ready_nsecs,
            running_nsecs,
            paused_nsecs: guard.paused_nsecs,
            halted_nsecs: guard.halted_nsecs,
        }
    }

    /// Drop every VCPU. Test-only world reset.
    #[cfg(test)]
    pub(crate) fn test_reset() {
        VCPUS.lock_irqsave().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::harness;

    fn nop_body() {}

    #[test]
    fn orphan_create_validates_arguments() {
        let _w = harness::world();
        harness::set_cpu(0);
        crate::scheduler::init(0).unwrap();

        assert_eq!(
            VcpuManager::orphan_create("", nop_body, 4096, 1, 1000, 1000, 1000).unwrap_err(),
            Error::Invalid
        );
        assert_eq!(
            VcpuManager::orphan_create("bad-prio", nop_body, 4096, VCPU_MAX_PRIORITY + 1, 1000, 1000, 1000)
                .unwrap_err(),
            Error::Invalid
        );
        assert_eq!(
            VcpuManager::orphan_create("no-slice", nop_body, 4096, 1, 0, 1000, 1000).unwrap_err(),
            Error::Invalid
        );
    }

    #[test]
    fn create_lookup_destroy() {
        let _w = harness::world();
        harness::set_cpu(0);
        crate::scheduler::init(0).unwrap();

        let v = VcpuManager::orphan_create("worker", nop_body, 4096, 2, 1000, 1000, 1000).unwrap();
        assert_eq!(v.state(), VcpuState::Reset);
        assert!(!v.is_normal());

        let found = VcpuManager::get(v.id()).unwrap();
        assert!(Arc::ptr_eq(&found, &v));

        let before = VcpuManager::count();
        VcpuManager::destroy(&v).unwrap();
        assert_eq!(VcpuManager::count(), before - 1);
        assert!(VcpuManager::get(v.id()).is_none());
        assert_eq!(v.state(), VcpuState::Unknown);
    }

    #[test]
    fn affinity_requires_online_cpu() {
        let _w = harness::world();
        harness::set_cpu(0);
        crate::scheduler::init(0).unwrap();

        let v = VcpuManager::orphan_create("pin", nop_body, 4096, 2, 1000, 1000, 1000).unwrap();
        // CPU 3 is offline in this world.
        assert_eq!(
            VcpuManager::set_affinity(&v, CpuMask::of(3)),
            Err(Error::Invalid)
        );
        VcpuManager::set_affinity(&v, CpuMask::of(0)).unwrap();
        assert!(VcpuManager::get_affinity(&v).test(0));
    }
}
