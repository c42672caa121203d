/*
 * Compile-Time Configuration
 *
 * Sizing constants for the hypervisor core. These mirror what a board
 * configuration would normally provide; the core is dimensioned at compile
 * time so that no steady-state allocation is ever needed for per-CPU or
 * per-IRQ bookkeeping.
 */

/// Number of host CPUs the core is built for.
pub const CPU_COUNT: usize = 4;

/// Number of native host IRQ lines (the physical controller's range).
pub const HOST_IRQ_COUNT: u32 = 128;

/// Number of extended (virtual) IRQ lines above `HOST_IRQ_COUNT`.
pub const EXTENDED_IRQ_NB: u32 = 64;

/// Maximum number of extended IRQ groups.
pub const EXTENDED_IRQ_GROUP_NB: usize = 8;

/// Maximum registered actions per IRQ per CPU.
pub const MAX_IRQ_ACTIONS_PER_CPU: usize = 8;

/// Maximum number of VCPUs managed at once.
pub const MAX_VCPU_COUNT: usize = 64;

/// Stack size for orphan VCPUs (64 KiB per orphan).
pub const THREAD_STACK_SIZE: usize = 64 * 1024;

/// Lowest VCPU priority. Reserved for the per-CPU idle orphan.
pub const VCPU_MIN_PRIORITY: u8 = 0;

/// Highest VCPU priority. Used by the IPI bottom-half orphans.
pub const VCPU_MAX_PRIORITY: u8 = 7;

/// Time slice of the idle orphan, in seconds.
pub const IDLE_TSLICE_SECS: u64 = 1;

/// Utilization sampling period, in seconds.
pub const IDLE_PERIOD_SECS: u64 = 1;

/// Default VCPU time slice when a caller does not specify one.
pub const VCPU_DEF_TIME_SLICE_NS: u64 = 100 * 1000 * 1000;

/// Pending async IPI calls buffered per CPU.
pub const IPI_QUEUE_LEN: usize = 16;
