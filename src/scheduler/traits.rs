/*
 * Ready-Queue Policy Trait
 *
 * This trait separates the scheduling policy (which VCPU runs next) from
 * the scheduling mechanism (context switches, state machine, timers).
 * Each host CPU owns one boxed policy instance behind its ready-queue
 * spinlock; the mechanism never looks inside it.
 *
 * This separation allows swapping scheduling algorithms without changing
 * any code outside scheduler/policies/.
 */

use alloc::sync::Arc;

use crate::error::Result;
use crate::vcpu::Vcpu;

/// A per-CPU ready-queue algorithm.
///
/// The mechanism guarantees:
/// - all calls are made under the owning CPU's ready-queue lock
/// - `enqueue` is never called for a VCPU already on this queue
/// - a VCPU is detached from its old queue before moving to another CPU
///
/// Policies read only the lock-free VCPU fields (priority, time slice);
/// they never touch the VCPU scheduling lock.
pub trait SchedPolicy: Send {
    /// Policy name for logging.
    fn name(&self) -> &'static str;

    /// Register a VCPU that just left the UNKNOWN state.
    fn setup(&mut self, vcpu: &Arc<Vcpu>) -> Result<()>;

    /// Unregister a VCPU that is being destroyed. Must tolerate the VCPU
    /// not being queued.
    fn cleanup(&mut self, vcpu: &Arc<Vcpu>) -> Result<()>;

    /// Place a VCPU at the tail of its priority band. O(1).
    fn enqueue(&mut self, vcpu: &Arc<Vcpu>) -> Result<()>;

    /// Remove and return the head of the highest non-empty band, together
    /// with its effective time slice in nanoseconds.
    fn dequeue(&mut self) -> Option<(Arc<Vcpu>, u64)>;

    /// Remove a specific VCPU from its band. Fails if it is not queued.
    fn detach(&mut self, vcpu: &Arc<Vcpu>) -> Result<()>;

    /// Should the current VCPU (running at `current_priority`) be preempted
    /// in favor of something on this queue?
    fn preempt_needed(&self, current_priority: u8) -> bool;

    /// Number of queued VCPUs in one priority band.
    fn length(&self, priority: u8) -> usize;
}
