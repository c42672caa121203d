/*
 * IRQ Chip Capability Trait
 *
 * An IRQ chip is the driver of one interrupt controller (or one cascaded
 * sub-controller). Flow handlers and the IRQ control API talk to hardware
 * only through this trait.
 *
 * The capability set is deliberately loose: any subset may be implemented.
 * Composite operations have composing defaults (mask_ack falls back to
 * mask + ack, enable to unmask, disable to mask), and optional operations
 * that cannot be synthesized carry a `can_*` probe so callers can tell
 * "absent" from "failed".
 */

use super::{HostIrq, IrqType};
use crate::error::{Error, Result};
use crate::smp::CpuMask;

/// Operations of one interrupt controller.
pub trait IrqChip: Send + Sync {
    fn name(&self) -> &'static str;

    /// Enable the line. Falls back to unmasking.
    fn irq_enable(&self, irq: &HostIrq) {
        self.irq_unmask(irq);
    }

    /// Disable the line. Falls back to masking.
    fn irq_disable(&self, irq: &HostIrq) {
        self.irq_mask(irq);
    }

    fn irq_mask(&self, _irq: &HostIrq) {}

    fn irq_unmask(&self, _irq: &HostIrq) {}

    /// Acknowledge the pending occurrence at the controller.
    fn irq_ack(&self, _irq: &HostIrq) {}

    /// Combined mask-and-ack. Controllers with a dedicated register
    /// override this; the default composes the two primitives in the
    /// mask-then-ack order level flows rely on.
    fn irq_mask_ack(&self, irq: &HostIrq) {
        self.irq_mask(irq);
        self.irq_ack(irq);
    }

    /// End-of-interrupt notification for fast-EOI flows.
    fn irq_eoi(&self, _irq: &HostIrq) {}

    /// Whether [`Self::irq_set_type`] talks to real hardware.
    fn can_set_type(&self) -> bool {
        false
    }

    /// Program the trigger sense of the line.
    fn irq_set_type(&self, _irq: &HostIrq, _irq_type: IrqType) -> Result<()> {
        Err(Error::NoSys)
    }

    /// Whether [`Self::irq_set_affinity`] talks to real hardware.
    fn can_set_affinity(&self) -> bool {
        false
    }

    /// Steer the line towards a set of host CPUs.
    fn irq_set_affinity(&self, _irq: &HostIrq, _dest: &CpuMask, _force: bool) -> Result<()> {
        Err(Error::NoSys)
    }

    /// Whether [`Self::irq_raise`] talks to real hardware.
    fn can_raise(&self) -> bool {
        false
    }

    /// Software-trigger the line on a set of host CPUs.
    fn irq_raise(&self, _irq: &HostIrq, _dest: &CpuMask) {}
}
