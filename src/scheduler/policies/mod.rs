/*
 * Scheduling Policies Module
 *
 * This module contains the ready-queue algorithm implementations. Each
 * policy implements the SchedPolicy trait and is instantiated once per
 * host CPU at scheduler init.
 *
 * Available policies:
 * - PriorityRoundRobin: strict priority bands, FIFO within a band
 *   (current default)
 * - (Future) Edf: Earliest Deadline First, using the per-VCPU deadline
 *   and periodicity parameters
 */

pub mod priority_rr;

pub use priority_rr::PriorityRoundRobin;
