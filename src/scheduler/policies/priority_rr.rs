/*
 * Priority Round-Robin Ready Queue
 *
 * The default ready-queue algorithm: one FIFO queue per priority level,
 * dequeue always serves the highest non-empty band, ties within a band are
 * broken by insertion order. The effective time slice of a dequeued VCPU is
 * its own configured slice.
 *
 * Preemption rule: a queued VCPU preempts the current one only when its
 * priority is strictly greater. Rotation between equal-priority VCPUs
 * happens on time-slice expiry, not on wakeup.
 */

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use super::super::traits::SchedPolicy;
use crate::config::{VCPU_MAX_PRIORITY, VCPU_MIN_PRIORITY};
use crate::error::{Error, Result};
use crate::vcpu::Vcpu;

/// Number of priority bands.
const PRIORITY_LEVELS: usize = (VCPU_MAX_PRIORITY - VCPU_MIN_PRIORITY + 1) as usize;

/// Strict-priority FIFO ready queue.
pub struct PriorityRoundRobin {
    bands: [VecDeque<Arc<Vcpu>>; PRIORITY_LEVELS],
}

impl PriorityRoundRobin {
    pub fn new() -> Self {
        Self {
            bands: core::array::from_fn(|_| VecDeque::new()),
        }
    }

    fn band(priority: u8) -> Option<usize> {
        if (VCPU_MIN_PRIORITY..=VCPU_MAX_PRIORITY).contains(&priority) {
            Some((priority - VCPU_MIN_PRIORITY) as usize)
        } else {
            None
        }
    }

    /// Highest non-empty band priority, if any VCPU is queued.
    fn top_priority(&self) -> Option<u8> {
        self.bands
            .iter()
            .enumerate()
            .rev()
            .find(|(_, b)| !b.is_empty())
            .map(|(i, _)| VCPU_MIN_PRIORITY + i as u8)
    }
}

impl Default for PriorityRoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedPolicy for PriorityRoundRobin {
    fn name(&self) -> &'static str {
        "priority-rr"
    }

    fn setup(&mut self, vcpu: &Arc<Vcpu>) -> Result<()> {
        if Self::band(vcpu.priority()).is_none() {
            return Err(Error::Invalid);
        }
        Ok(())
    }

    fn cleanup(&mut self, vcpu: &Arc<Vcpu>) -> Result<()> {
        // A destroyed VCPU may or may not still be queued.
        let _ = self.detach(vcpu);
        Ok(())
    }

    fn enqueue(&mut self, vcpu: &Arc<Vcpu>) -> Result<()> {
        let band = Self::band(vcpu.priority()).ok_or(Error::Invalid)?;
        self.bands[band].push_back(vcpu.clone());
        Ok(())
    }

    fn dequeue(&mut self) -> Option<(Arc<Vcpu>, u64)> {
        for band in self.bands.iter_mut().rev() {
            if let Some(vcpu) = band.pop_front() {
                let slice = vcpu.time_slice_ns();
                return Some((vcpu, slice));
            }
        }
        None
    }

    fn detach(&mut self, vcpu: &Arc<Vcpu>) -> Result<()> {
        let band = Self::band(vcpu.priority()).ok_or(Error::Invalid)?;
        let queue = &mut self.bands[band];
        match queue.iter().position(|v| Arc::ptr_eq(v, vcpu)) {
            Some(idx) => {
                queue.remove(idx);
                Ok(())
            }
            None => Err(Error::Fail),
        }
    }

    fn preempt_needed(&self, current_priority: u8) -> bool {
        match self.top_priority() {
            Some(top) => top > current_priority,
            None => false,
        }
    }

    fn length(&self, priority: u8) -> usize {
        match Self::band(priority) {
            Some(band) => self.bands[band].len(),
            None => 0,
        }
    }
}
