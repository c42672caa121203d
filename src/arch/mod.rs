/*
 * Architecture Port Interface
 *
 * The hypervisor core is architecture independent. Everything that touches
 * real hardware (interrupt flags, context switch register shuffling, IPI
 * doorbells, wait-for-interrupt) goes through the `ArchPort` trait. A
 * back-end installs itself once at boot with `arch::install`, the same
 * register-once pattern the `log` crate uses for its logger.
 *
 * Why this is important:
 * - Keeps VCPU scheduling and IRQ dispatch logic free of inline assembly
 * - Lets multiple architectures share one scheduler implementation
 * - Makes the core testable with a mock port on a hosted target
 */

use crate::error::Result;
use crate::vcpu::Vcpu;

/// Saved CPU interrupt flag state, returned by [`ArchPort::irq_save`] and
/// consumed by [`ArchPort::irq_restore`]. Opaque to the core.
#[derive(Debug, Clone, Copy)]
pub struct IrqFlags(pub usize);

/// Saved register frame of an interrupted context.
///
/// The core treats this as an opaque blob: it is captured at trap entry,
/// handed to the scheduler so a context switch can swap register files, and
/// interpreted only by the architecture port. The layout is generous enough
/// for the register files of the supported targets.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Regs {
    /// General purpose registers
    pub gpr: [u64; 16],
    /// Stack pointer
    pub sp: u64,
    /// Program counter / return address of the interrupted context
    pub pc: u64,
    /// Processor state / flags word
    pub pstate: u64,
}

impl Regs {
    /// Build an initial frame for a fresh context.
    ///
    /// # Arguments
    /// * `entry` - address execution starts at
    /// * `stack_top` - initial stack pointer
    pub const fn new(entry: u64, stack_top: u64) -> Self {
        Self {
            gpr: [0; 16],
            sp: stack_top,
            pc: entry,
            pstate: 0,
        }
    }
}

impl Default for Regs {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

/// Operations an architecture back-end must provide.
///
/// All methods may be called from IRQ context unless noted. Optional hooks
/// have default implementations so a port only implements what its hardware
/// needs.
pub trait ArchPort: Sync {
    /// Identifier of the CPU executing the caller.
    fn processor_id(&self) -> u32;

    /// Disable local interrupts, returning the previous flag state.
    fn irq_save(&self) -> IrqFlags;

    /// Restore a flag state previously returned by [`Self::irq_save`].
    fn irq_restore(&self, flags: IrqFlags);

    /// Unconditionally enable local interrupts.
    fn irq_enable(&self);

    /// Park the CPU until the next interrupt.
    fn wait_for_irq(&self);

    /// Switch register files: save the interrupted frame `regs` into
    /// `prev` (when present) and load `next`'s saved frame into `regs`.
    ///
    /// `prev` is `None` exactly once per CPU, on the first switch after
    /// scheduler init. Callers never pass `prev == next`.
    fn vcpu_switch(&self, prev: Option<&Vcpu>, next: &Vcpu, regs: *mut Regs);

    /// Reset a VCPU's architectural state to its boot frame.
    fn vcpu_init(&self, vcpu: &Vcpu) -> Result<()>;

    /// Synchronously yield the calling orphan VCPU from normal (non-IRQ)
    /// context. Returns when the orphan is next scheduled.
    fn vcpu_preempt_orphan(&self);

    /// Deliver pending virtual interrupts to a normal VCPU's frame.
    fn vcpu_irq_deliver(&self, _vcpu: &Vcpu, _regs: *mut Regs) {}

    /// Ring the IPI doorbell of another CPU.
    fn trigger_ipi(&self, hcpu: u32);

    /// Board interrupt controller bring-up, run during host IRQ init.
    fn host_irq_init(&self) -> Result<()> {
        Ok(())
    }

    /// Per-CPU interrupt plumbing, run after controller bring-up.
    fn cpu_irq_setup(&self) -> Result<()> {
        Ok(())
    }
}

static PORT: spin::Once<&'static dyn ArchPort> = spin::Once::new();

/// Install the architecture port. Must be called exactly once, before any
/// scheduler or IRQ layer API is used. Later calls are ignored.
pub fn install(port: &'static dyn ArchPort) {
    PORT.call_once(|| port);
}

/// Access the installed port.
///
/// # Panics
/// Panics if no port has been installed. Using the core without a port is a
/// programmer error, not a runtime condition.
#[inline]
pub fn port() -> &'static dyn ArchPort {
    *PORT.get().expect("arch port not installed")
}
