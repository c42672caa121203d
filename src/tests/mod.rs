/*
 * Test Suite for the Hypervisor Core
 *
 * End-to-end scenario suites driven through the mock architecture port:
 *
 * - scheduler_tests: kick-and-preempt, slice rollover, preemption pinning,
 *   pause/resume refcounting, cross-CPU migration, yield, IRQ-time
 *   accounting and the sampling window
 * - irq_tests: flow handlers, the control API, registration rules and the
 *   extended IRQ map
 *
 * Unit tests for individual data structures live next to their modules in
 * #[cfg(test)] blocks; these suites cover the cross-module flows.
 */


mod scheduler_tests;
