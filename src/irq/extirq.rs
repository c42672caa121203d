/*
 * Extended IRQ Map
 *
 * Virtualizes IRQ numbers beyond the physical controller's range: a group
 * of contiguous logical IRQs above HOST_IRQ_COUNT multiplexed onto one
 * parent hardware IRQ. Cascaded sub-controllers (GPIO banks, secondary
 * muxes) get their own logical lines without stealing native numbers; the
 * parent's flow handler demuxes and calls generic_irq_exec() on the
 * children.
 *
 * The allocator is intentionally append-only: groups are carved out of a
 * single growing number range and there is no unmap path. Group and child
 * lifetime is the lifetime of the program.
 */

use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::{ChipData, DeviceId, HostIrq, IrqChip};
use crate::config::{EXTENDED_IRQ_GROUP_NB, EXTENDED_IRQ_NB, HOST_IRQ_COUNT};
use crate::error::{Error, Result};
use crate::sync::IrqSpinLock;

/// A contiguous range of extended IRQs sharing one parent hardware IRQ.
pub struct ExtIrqGroup {
    base: u32,
    count: u32,
    hwirq: u32,
    dev: DeviceId,
    irqs: Vec<Arc<HostIrq>>,
}

impl core::fmt::Debug for ExtIrqGroup {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ExtIrqGroup")
            .field("base", &self.base)
            .field("count", &self.count)
            .field("hwirq", &self.hwirq)
            .field("dev", &self.dev)
            .finish()
    }
}

impl ExtIrqGroup {
    /// First logical IRQ number of the group.
    pub fn base(&self) -> u32 {
        self.base
    }

    /// Number of lines in the group.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Parent hardware IRQ the group cascades from.
    pub fn hwirq(&self) -> u32 {
        self.hwirq
    }

    /// Device cookie supplied at map time.
    pub fn dev(&self) -> DeviceId {
        self.dev
    }

    /// Logical IRQ number of the child at `offset`.
    pub fn irq_of(&self, offset: u32) -> Result<u32> {
        if offset >= self.count {
            return Err(Error::NotAvail);
        }
        Ok(self.base + offset)
    }

    /// Offset of a logical IRQ number within the group.
    pub fn offset_of(&self, irq: u32) -> u32 {
        irq - self.base
    }

    /// Child IRQ object at `offset`.
    pub fn child(&self, offset: u32) -> Option<&Arc<HostIrq>> {
        self.irqs.get(offset as usize)
    }
}

struct ExtIrqTable {
    groups: Vec<Arc<ExtIrqGroup>>,
    children: Vec<Option<Arc<HostIrq>>>,
    next_base: u32,
}

impl ExtIrqTable {
    const fn new() -> Self {
        Self {
            groups: Vec::new(),
            children: Vec::new(),
            next_base: HOST_IRQ_COUNT,
        }
    }

    fn ensure_children(&mut self) {
        if self.children.is_empty() {
            self.children.resize(EXTENDED_IRQ_NB as usize, None);
        }
    }
}

static EXTIRQS: IrqSpinLock<ExtIrqTable> = IrqSpinLock::new(ExtIrqTable::new());

/// Allocate the child lookup table. Called once from host IRQ init.
pub fn init() -> Result<()> {
    let mut table = EXTIRQS.lock_irqsave();
    table.ensure_children();
    log::info!(
        "extirq: {} lines above {}, {} groups max",
        EXTENDED_IRQ_NB,
        HOST_IRQ_COUNT,
        EXTENDED_IRQ_GROUP_NB
    );
    Ok(())
}

/// Resolve an extended IRQ number to its child object.
pub fn get(eirq: u32) -> Option<Arc<HostIrq>> {
    if eirq < HOST_IRQ_COUNT {
        return None;
    }
    let idx = (eirq - HOST_IRQ_COUNT) as usize;
    EXTIRQS
        .lock_irqsave()
        .children
        .get(idx)
        .and_then(|slot| slot.clone())
}

/// Map a group of `size` extended IRQs onto parent `hwirq`.
///
/// Children are named `"<basename>.<1..=size>"` and inherit the parent's
/// chip and chip data unless explicit ones are given. The parent must
/// exist and must have a chip bound.
pub fn map(
    hwirq: u32,
    basename: &str,
    size: u32,
    chip: Option<&'static dyn IrqChip>,
    chip_data: Option<ChipData>,
    dev: DeviceId,
) -> Result<Arc<ExtIrqGroup>> {
    // At most 999 lines per group, to keep the ".NNN" suffix bounded.
    if size == 0 || size > 999 {
        return Err(Error::NotAvail);
    }

    let parent = match super::get(hwirq) {
        Some(parent) => parent,
        None => {
            log::warn!("extirq: parent hwirq {} does not exist", hwirq);
            return Err(Error::Fail);
        }
    };

    let chip = match chip.or_else(|| parent.chip()) {
        Some(chip) => chip,
        None => {
            log::warn!("extirq: parent hwirq {} has no chip", hwirq);
            return Err(Error::Fail);
        }
    };
    let chip_data = chip_data.or_else(|| parent.chip_data());

    let mut table = EXTIRQS.lock_irqsave();
    table.ensure_children();

    if table.groups.len() >= EXTENDED_IRQ_GROUP_NB {
        return Err(Error::NotAvail);
    }
    if table.next_base + size > HOST_IRQ_COUNT + EXTENDED_IRQ_NB {
        return Err(Error::NotAvail);
    }

    let base = table.next_base;
    let mut irqs = Vec::with_capacity(size as usize);
    for i in 0..size {
        let irq = Arc::new(HostIrq::new(base + i));
        irq.install_name(format!("{}.{}", basename, i + 1));
        irq.install_chip(chip);
        irq.install_chip_data(chip_data);

        let idx = (base + i - HOST_IRQ_COUNT) as usize;
        table.children[idx] = Some(irq.clone());
        irqs.push(irq);
    }
    table.next_base += size;

    let group = Arc::new(ExtIrqGroup {
        base,
        count: size,
        hwirq,
        dev,
        irqs,
    });
    table.groups.push(group.clone());

    log::info!(
        "extirq: mapped '{}' x{} at {} onto hwirq {}",
        basename,
        size,
        base,
        hwirq
    );
    Ok(group)
}
