/*
 * Kestrel Hypervisor Core
 *
 * This crate is the architecture-independent core of the Kestrel bare-metal
 * hypervisor: the per-CPU VCPU scheduler, the host interrupt dispatch layer
 * it is interlocked with, and the timer/IPI glue in between.
 *
 * Why this is important:
 * - Multiplexes guest virtual CPUs and orphan hypervisor threads onto each
 *   host CPU with strict-priority preemptive scheduling
 * - Delivers device interrupts through per-IRQ flow handlers that cooperate
 *   with the scheduler's preemption and accounting
 * - Tracks per-CPU running/ready/idle/IRQ time over a rolling sample window
 *
 * Key features:
 * - Per-CPU ready queues behind a pluggable policy trait
 * - VCPU state machine with pause/resume refcounting and cross-CPU
 *   migration serialized by async IPIs
 * - Interrupt-safe locking primitives with RAII flag restore
 * - Extended IRQ map for cascaded interrupt controllers
 * - No steady-state allocation: everything is sized at init
 *
 * The hosting image supplies the hardware: an architecture port
 * (arch::install) and a clock source (time::register_clock) must be
 * registered before bring-up. Per-CPU boot order is scheduler::init,
 * smp::ipi_init, then irq::init, after which the CPU's timer trap may be
 * enabled.
 */

#![cfg_attr(not(test), no_std)]
#![allow(dead_code)]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod error;
pub mod irq;
pub mod scheduler;
pub mod smp;
pub mod sync;
pub mod time;
pub mod vcpu;

#[cfg(test)]
mod tests;

pub use error::{Error, Result};
pub use vcpu::manager::{VcpuManager, VcpuStats};
pub use vcpu::{GuestId, Vcpu, VcpuId, VcpuState};
