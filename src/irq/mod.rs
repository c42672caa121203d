/*
 * Host IRQ Dispatch
 *
 * Per-IRQ objects, flow handlers and the generic dispatch entry invoked
 * from the architecture trap path. Each logical IRQ number maps to one
 * HostIrq carrying its chip, its flow handler and per-CPU action lists.
 *
 * Dispatch path: the architecture trap calls active_irq_exec(), which asks
 * the controller's active callback for pending logical IRQ numbers and
 * runs generic_irq_exec() for each one until the controller reports no
 * more. generic_irq_exec() bumps the per-CPU counter, marks the line in
 * progress and runs the flow handler, which walks the registered actions
 * in order until one claims the interrupt.
 *
 * Logical numbers at or above HOST_IRQ_COUNT resolve through the extended
 * IRQ map (see irq/extirq.rs).
 *
 * LOCKING: per-IRQ per-CPU action lists are reader/writer locked with
 * interrupts disabled; dispatch takes them as reader. The chip and handler
 * slots are copied out of their locks before any chip operation runs, so
 * no lock is ever held across a call into a chip.
 */

pub mod chip;
pub mod extirq;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::any::Any;
use core::sync::atomic::{AtomicU32, Ordering};
use lazy_static::lazy_static;

pub use chip::IrqChip;

use crate::config::{CPU_COUNT, HOST_IRQ_COUNT, MAX_IRQ_ACTIONS_PER_CPU};
use crate::error::{Error, Result};
use crate::smp::{self, CpuMask};
use crate::sync::IrqRwLock;
use crate::arch;

bitflags! {
    /// Trigger sense of an IRQ line.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IrqType: u32 {
        const EDGE_RISING  = 1 << 0;
        const EDGE_FALLING = 1 << 1;
        const LEVEL_HIGH   = 1 << 2;
        const LEVEL_LOW    = 1 << 3;
    }
}

impl IrqType {
    pub const NONE: IrqType = IrqType::empty();
    pub const EDGE_BOTH: IrqType = IrqType::EDGE_RISING.union(IrqType::EDGE_FALLING);
    pub const LEVEL_MASK: IrqType = IrqType::LEVEL_HIGH.union(IrqType::LEVEL_LOW);
    pub const SENSE_MASK: IrqType = IrqType::all();
}

bitflags! {
    /// State bits of a HostIrq. The low nibble stores the trigger sense
    /// using the same encoding as [`IrqType`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HostIrqState: u32 {
        const TRIGGER_EDGE_RISING  = 1 << 0;
        const TRIGGER_EDGE_FALLING = 1 << 1;
        const TRIGGER_LEVEL_HIGH   = 1 << 2;
        const TRIGGER_LEVEL_LOW    = 1 << 3;
        const LEVEL        = 1 << 8;
        const PER_CPU      = 1 << 9;
        const DISABLED     = 1 << 10;
        const MASKED       = 1 << 11;
        const INPROGRESS   = 1 << 12;
        const GUEST_ROUTED = 1 << 13;
        const AFFINITY_SET = 1 << 14;
    }
}

impl HostIrqState {
    const TRIGGER_MASK: HostIrqState = HostIrqState::TRIGGER_EDGE_RISING
        .union(HostIrqState::TRIGGER_EDGE_FALLING)
        .union(HostIrqState::TRIGGER_LEVEL_HIGH)
        .union(HostIrqState::TRIGGER_LEVEL_LOW);
}

/// Opaque identity of a registered device consumer. The value is whatever
/// the driver uses to recognize itself (typically a pointer or a small
/// enum); registration enforces uniqueness per (IRQ, CPU).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceId(pub usize);

/// Result of one action invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
    /// Not our interrupt, try the next action.
    None,
    /// Claimed; stop walking the action list.
    Handled,
}

/// Device interrupt handler registered with [`register`].
pub type IrqFunction = fn(u32, DeviceId) -> IrqReturn;

/// Erased per-chip cookie.
pub type ChipData = &'static (dyn Any + Send + Sync);

/// Erased per-flow-handler cookie.
pub type HandlerData = &'static (dyn Any + Send + Sync);

/// Flow handler: the per-IRQ dispatch policy around the action list.
pub type FlowHandler = fn(&HostIrq, u32, Option<HandlerData>);

/// One registered consumer of an IRQ on one CPU.
#[derive(Clone, Copy)]
struct IrqAction {
    func: IrqFunction,
    dev: DeviceId,
}

/// Per-IRQ object: chip binding, flow handler, state bits and the per-CPU
/// action lists and occurrence counters.
pub struct HostIrq {
    num: u32,
    name: IrqRwLock<Option<String>>,
    state: AtomicU32,
    count: [AtomicU32; CPU_COUNT],
    chip: IrqRwLock<Option<&'static dyn IrqChip>>,
    chip_data: IrqRwLock<Option<ChipData>>,
    handler: IrqRwLock<Option<FlowHandler>>,
    handler_data: IrqRwLock<Option<HandlerData>>,
    actions: [IrqRwLock<heapless::Vec<IrqAction, MAX_IRQ_ACTIONS_PER_CPU>>; CPU_COUNT],
}

impl HostIrq {
    fn new(num: u32) -> Self {
        Self {
            num,
            name: IrqRwLock::new(None),
            state: AtomicU32::new(
                (HostIrqState::DISABLED | HostIrqState::MASKED).bits(),
            ),
            count: core::array::from_fn(|_| AtomicU32::new(0)),
            chip: IrqRwLock::new(None),
            chip_data: IrqRwLock::new(None),
            handler: IrqRwLock::new(None),
            handler_data: IrqRwLock::new(None),
            actions: core::array::from_fn(|_| IrqRwLock::new(heapless::Vec::new())),
        }
    }

    pub fn num(&self) -> u32 {
        self.num
    }

    pub fn name(&self) -> Option<String> {
        self.name.read_irqsave().clone()
    }

    pub fn state(&self) -> HostIrqState {
        HostIrqState::from_bits_truncate(self.state.load(Ordering::Acquire))
    }

    fn set_state_bits(&self, bits: HostIrqState) {
        self.state.fetch_or(bits.bits(), Ordering::AcqRel);
    }

    fn clear_state_bits(&self, bits: HostIrqState) {
        self.state.fetch_and(!bits.bits(), Ordering::AcqRel);
    }

    pub fn is_per_cpu(&self) -> bool {
        self.state().contains(HostIrqState::PER_CPU)
    }

    pub fn is_disabled(&self) -> bool {
        self.state().contains(HostIrqState::DISABLED)
    }

    pub fn is_masked(&self) -> bool {
        self.state().contains(HostIrqState::MASKED)
    }

    pub fn is_level(&self) -> bool {
        self.state().contains(HostIrqState::LEVEL)
    }

    pub fn is_inprogress(&self) -> bool {
        self.state().contains(HostIrqState::INPROGRESS)
    }

    pub fn is_guest_routed(&self) -> bool {
        self.state().contains(HostIrqState::GUEST_ROUTED)
    }

    /// Trigger sense currently programmed.
    pub fn get_type(&self) -> IrqType {
        IrqType::from_bits_truncate(self.state.load(Ordering::Acquire))
    }

    /// Occurrences dispatched on one CPU.
    pub fn count(&self, cpu: u32) -> u32 {
        self.count[cpu as usize].load(Ordering::Acquire)
    }

    pub fn chip(&self) -> Option<&'static dyn IrqChip> {
        *self.chip.read_irqsave()
    }

    pub fn chip_data(&self) -> Option<ChipData> {
        *self.chip_data.read_irqsave()
    }

    pub fn handler(&self) -> Option<FlowHandler> {
        *self.handler.read_irqsave()
    }

    pub fn handler_data(&self) -> Option<HandlerData> {
        *self.handler_data.read_irqsave()
    }

    pub(crate) fn install_name(&self, name: String) {
        *self.name.write_irqsave() = Some(name);
    }

    pub(crate) fn install_chip(&self, chip: &'static dyn IrqChip) {
        *self.chip.write_irqsave() = Some(chip);
    }

    pub(crate) fn install_chip_data(&self, data: Option<ChipData>) {
        *self.chip_data.write_irqsave() = data;
    }
}

struct HostIrqsCtrl {
    active: IrqRwLock<Option<fn(u32) -> u32>>,
}

static HIRQ_CTRL: HostIrqsCtrl = HostIrqsCtrl {
    active: IrqRwLock::new(None),
};

lazy_static! {
    /// Native IRQ table, one entry per physical controller line.
    static ref HOST_IRQS: Vec<Arc<HostIrq>> = (0..HOST_IRQ_COUNT)
        .map(|num| Arc::new(HostIrq::new(num)))
        .collect();
}

/// Resolve a logical IRQ number, native or extended.
pub fn get(hirq: u32) -> Option<Arc<HostIrq>> {
    if hirq < HOST_IRQ_COUNT {
        Some(HOST_IRQS[hirq as usize].clone())
    } else {
        extirq::get(hirq)
    }
}

/// Number of native host IRQ lines.
pub fn count() -> u32 {
    HOST_IRQ_COUNT
}

/// Install the controller's "which logical IRQ is pending" callback. The
/// callback returns a number at or above `HOST_IRQ_COUNT` when nothing is
/// pending anymore.
pub fn set_active_callback(active: fn(u32) -> u32) {
    *HIRQ_CTRL.active.write_irqsave() = Some(active);
}

// ============================================================================
// DISPATCH
// ============================================================================

/// Dispatch one logical IRQ: count it, mark it in progress and run its
/// flow handler on the calling CPU.
pub fn generic_irq_exec(hirq: u32) -> Result<()> {
    let irq = get(hirq).ok_or(Error::NotAvail)?;
    let cpu = smp::processor_id();

    irq.count[cpu as usize].fetch_add(1, Ordering::AcqRel);

    let per_cpu = irq.is_per_cpu();
    if !per_cpu {
        irq.set_state_bits(HostIrqState::INPROGRESS);
    }
    if let Some(handler) = irq.handler() {
        handler(&irq, cpu, irq.handler_data());
    }
    if !per_cpu {
        irq.clear_state_bits(HostIrqState::INPROGRESS);
    }

    Ok(())
}

/// Architecture trap entry: drain every pending logical IRQ reported by
/// the controller's active callback for `cpu_irq`.
pub fn active_irq_exec(cpu_irq: u32) -> Result<()> {
    let active = { *HIRQ_CTRL.active.read_irqsave() };
    let active = active.ok_or(Error::NotAvail)?;

    let mut hirq = active(cpu_irq);
    while hirq < HOST_IRQ_COUNT {
        let _ = generic_irq_exec(hirq);
        hirq = active(cpu_irq);
    }

    Ok(())
}

fn run_actions(irq: &HostIrq, cpu: u32) -> bool {
    let actions = irq.actions[cpu as usize].read_irqsave();
    for action in actions.iter() {
        if (action.func)(irq.num(), action.dev) == IrqReturn::Handled {
            return true;
        }
    }
    false
}

/// Fast-EOI flow: walk the actions, then signal end-of-interrupt.
pub fn handle_fast_eoi(irq: &HostIrq, cpu: u32, _data: Option<HandlerData>) {
    let claimed = run_actions(irq, cpu);

    if let Some(chip) = irq.chip() {
        chip.irq_eoi(irq);
    }

    if !claimed {
        log::trace!("irq: line {} unclaimed on CPU{}", irq.num(), cpu);
    }
}

/// Level flow: mask-and-ack before the actions so a still-asserted level
/// line cannot storm, unmask afterwards.
pub fn handle_level_irq(irq: &HostIrq, cpu: u32, _data: Option<HandlerData>) {
    if let Some(chip) = irq.chip() {
        chip.irq_mask_ack(irq);
    }

    let claimed = run_actions(irq, cpu);

    if let Some(chip) = irq.chip() {
        chip.irq_unmask(irq);
    }

    if !claimed {
        log::trace!("irq: line {} unclaimed on CPU{}", irq.num(), cpu);
    }
}

// ============================================================================
// CONTROL API
// ============================================================================

/// Bind a chip to a logical IRQ.
pub fn set_chip(hirq: u32, chip: &'static dyn IrqChip) -> Result<()> {
    let irq = get(hirq).ok_or(Error::NotAvail)?;
    irq.install_chip(chip);
    Ok(())
}

/// Attach an opaque chip cookie to a logical IRQ.
pub fn set_chip_data(hirq: u32, data: ChipData) -> Result<()> {
    let irq = get(hirq).ok_or(Error::NotAvail)?;
    irq.install_chip_data(Some(data));
    Ok(())
}

/// Install the flow handler of a logical IRQ.
pub fn set_handler(hirq: u32, handler: FlowHandler) -> Result<()> {
    let irq = get(hirq).ok_or(Error::NotAvail)?;
    *irq.handler.write_irqsave() = Some(handler);
    Ok(())
}

/// Attach an opaque flow-handler cookie to a logical IRQ.
pub fn set_handler_data(hirq: u32, data: HandlerData) -> Result<()> {
    let irq = get(hirq).ok_or(Error::NotAvail)?;
    *irq.handler_data.write_irqsave() = Some(data);
    Ok(())
}

/// Enable a logical IRQ at its chip.
pub fn enable(hirq: u32) -> Result<()> {
    let irq = get(hirq).ok_or(Error::NotAvail)?;
    irq.clear_state_bits(HostIrqState::DISABLED | HostIrqState::MASKED);
    match irq.chip() {
        Some(chip) => {
            chip.irq_enable(&irq);
            Ok(())
        }
        None => Err(Error::NotAvail),
    }
}

/// Disable a logical IRQ at its chip.
pub fn disable(hirq: u32) -> Result<()> {
    let irq = get(hirq).ok_or(Error::NotAvail)?;
    irq.set_state_bits(HostIrqState::DISABLED | HostIrqState::MASKED);
    if let Some(chip) = irq.chip() {
        chip.irq_disable(&irq);
    }
    Ok(())
}

/// Mask a logical IRQ.
pub fn mask(hirq: u32) -> Result<()> {
    let irq = get(hirq).ok_or(Error::NotAvail)?;
    if let Some(chip) = irq.chip() {
        chip.irq_mask(&irq);
        irq.set_state_bits(HostIrqState::MASKED);
    }
    Ok(())
}

/// Unmask a logical IRQ.
pub fn unmask(hirq: u32) -> Result<()> {
    let irq = get(hirq).ok_or(Error::NotAvail)?;
    if let Some(chip) = irq.chip() {
        chip.irq_unmask(&irq);
        irq.clear_state_bits(HostIrqState::MASKED);
    }
    Ok(())
}

/// Program the trigger sense of a logical IRQ.
///
/// `IrqType::NONE` is accepted and does nothing. Chips without trigger
/// programming also report success, leaving the recorded sense unchanged.
pub fn set_type(hirq: u32, irq_type: IrqType) -> Result<()> {
    let irq = get(hirq).ok_or(Error::NotAvail)?;

    let sense = irq_type & IrqType::SENSE_MASK;
    if sense == IrqType::NONE {
        return Ok(());
    }

    let chip = match irq.chip() {
        Some(chip) if chip.can_set_type() => chip,
        _ => return Ok(()),
    };

    chip.irq_set_type(&irq, sense)?;

    irq.clear_state_bits(HostIrqState::TRIGGER_MASK);
    irq.set_state_bits(HostIrqState::from_bits_truncate(sense.bits()));
    if sense.intersects(IrqType::LEVEL_MASK) {
        irq.set_state_bits(HostIrqState::LEVEL);
    } else {
        irq.clear_state_bits(HostIrqState::LEVEL);
    }

    Ok(())
}

/// Steer a logical IRQ towards a set of host CPUs.
pub fn set_affinity(hirq: u32, dest: CpuMask, force: bool) -> Result<()> {
    let irq = get(hirq).ok_or(Error::NotAvail)?;

    match irq.chip() {
        Some(chip) if chip.can_set_affinity() => {
            irq.set_state_bits(HostIrqState::AFFINITY_SET);
            chip.irq_set_affinity(&irq, &dest, force)
        }
        _ => Err(Error::Fail),
    }
}

/// Software-trigger a logical IRQ on a set of host CPUs.
pub fn raise(hirq: u32, dest: CpuMask) -> Result<()> {
    let irq = get(hirq).ok_or(Error::NotAvail)?;
    if let Some(chip) = irq.chip()
        && chip.can_raise()
    {
        chip.irq_raise(&irq, &dest);
    }
    Ok(())
}

pub fn mark_per_cpu(hirq: u32) -> Result<()> {
    let irq = get(hirq).ok_or(Error::NotAvail)?;
    irq.set_state_bits(HostIrqState::PER_CPU);
    Ok(())
}

pub fn unmark_per_cpu(hirq: u32) -> Result<()> {
    let irq = get(hirq).ok_or(Error::NotAvail)?;
    irq.clear_state_bits(HostIrqState::PER_CPU);
    Ok(())
}

pub fn mark_guest_routed(hirq: u32) -> Result<()> {
    let irq = get(hirq).ok_or(Error::NotAvail)?;
    irq.set_state_bits(HostIrqState::GUEST_ROUTED);
    Ok(())
}

pub fn unmark_guest_routed(hirq: u32) -> Result<()> {
    let irq = get(hirq).ok_or(Error::NotAvail)?;
    irq.clear_state_bits(HostIrqState::GUEST_ROUTED);
    Ok(())
}

// ============================================================================
// ACTION REGISTRATION
// ============================================================================

fn action_add(irq: &HostIrq, func: IrqFunction, dev: DeviceId, cpu: u32) -> Result<()> {
    let mut actions = irq.actions[cpu as usize].write_irqsave();

    if actions.iter().any(|a| a.dev == dev) {
        return Err(Error::Fail);
    }
    actions
        .push(IrqAction { func, dev })
        .map_err(|_| Error::NoMem)
}

fn action_del(irq: &HostIrq, dev: DeviceId, cpu: u32, disable_out: &mut bool) -> Result<()> {
    let mut actions = irq.actions[cpu as usize].write_irqsave();

    let idx = actions
        .iter()
        .position(|a| a.dev == dev)
        .ok_or(Error::Fail)?;
    actions.remove(idx);
    if actions.is_empty() {
        *disable_out = true;
    }
    Ok(())
}

/// Register a device action on a logical IRQ and enable the line.
///
/// Per-CPU IRQs register on the calling CPU only; everything else is
/// replicated on all CPUs. At most one action per (IRQ, CPU, dev).
pub fn register(hirq: u32, name: &str, func: IrqFunction, dev: DeviceId) -> Result<()> {
    let irq = get(hirq).ok_or(Error::NotAvail)?;

    irq.install_name(String::from(name));

    if irq.is_per_cpu() {
        action_add(&irq, func, dev, smp::processor_id())?;
    } else {
        for cpu in 0..CPU_COUNT as u32 {
            action_add(&irq, func, dev, cpu)?;
        }
    }

    log::debug!("irq: '{}' registered on line {}", name, hirq);
    enable(hirq)
}

/// Remove a device action from a logical IRQ; the line is disabled when
/// its last consumer goes away.
pub fn unregister(hirq: u32, dev: DeviceId) -> Result<()> {
    let irq = get(hirq).ok_or(Error::NotAvail)?;

    let mut disable_line = false;
    if irq.is_per_cpu() {
        action_del(&irq, dev, smp::processor_id(), &mut disable_line)?;
    } else {
        for cpu in 0..CPU_COUNT as u32 {
            action_del(&irq, dev, cpu, &mut disable_line)?;
        }
    }

    if disable_line {
        return disable(hirq);
    }
    Ok(())
}

// ============================================================================
// INIT
// ============================================================================

/// Interrupt controller init callback, stands in for a device-tree match
/// entry. Supplied by the board layer.
pub type HostIrqInitFn = fn() -> Result<()>;

/// Bring up host IRQ handling on the calling CPU.
///
/// Boot CPU ordering: build the native table, run the architecture
/// controller init, run the board controller callbacks, set up the CPU's
/// interrupt plumbing, initialize the extended map, and finally enable
/// interrupts. Secondary CPUs skip the one-time global steps.
pub fn init(controllers: &[HostIrqInitFn]) -> Result<()> {
    if smp::is_boot_cpu() {
        lazy_static::initialize(&HOST_IRQS);
        log::info!("irq: {} native lines", HOST_IRQ_COUNT);
    }

    arch::port().host_irq_init()?;

    for controller in controllers {
        if let Err(e) = controller() {
            log::debug!("irq: CPU{} controller init failed ({})", smp::processor_id(), e);
        }
    }

    arch::port().cpu_irq_setup()?;

    if smp::is_boot_cpu() {
        extirq::init()?;
    }

    arch::port().irq_enable();
    Ok(())
}
