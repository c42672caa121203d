/*
 * Interrupt-Safe Synchronization Primitives
 *
 * This module wraps the spin crate's locks in guards that save and restore
 * the local CPU interrupt flag. Every lock shared between thread context
 * and IRQ context must be taken through these wrappers, otherwise a timer
 * or device interrupt arriving while the lock is held can deadlock the CPU
 * against itself.
 *
 * The guards are RAII: interrupts are disabled before the spin acquire and
 * the saved flag state is restored after the lock is released, on every
 * exit path.
 */

use core::ops::{Deref, DerefMut};

use crate::arch::{self, IrqFlags};

/// Spinlock whose guard keeps local interrupts disabled.
pub struct IrqSpinLock<T> {
    inner: spin::Mutex<T>,
}

/// RAII guard for [`IrqSpinLock`]. Restores the interrupt flag on drop,
/// after the lock itself has been released.
pub struct IrqSpinGuard<'a, T> {
    guard: Option<spin::MutexGuard<'a, T>>,
    flags: IrqFlags,
}

impl<T> IrqSpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
        }
    }

    /// Disable local interrupts and acquire the lock.
    pub fn lock_irqsave(&self) -> IrqSpinGuard<'_, T> {
        let flags = arch::port().irq_save();
        IrqSpinGuard {
            guard: Some(self.inner.lock()),
            flags,
        }
    }
}

impl<T> Deref for IrqSpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_ref().unwrap()
    }
}

impl<T> DerefMut for IrqSpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().unwrap()
    }
}

impl<T> Drop for IrqSpinGuard<'_, T> {
    fn drop(&mut self) {
        // Release the lock before re-enabling interrupts.
        self.guard.take();
        arch::port().irq_restore(self.flags);
    }
}

/// Reader/writer lock whose guards keep local interrupts disabled.
pub struct IrqRwLock<T> {
    inner: spin::RwLock<T>,
}

pub struct IrqReadGuard<'a, T> {
    guard: Option<spin::RwLockReadGuard<'a, T>>,
    flags: IrqFlags,
}

pub struct IrqWriteGuard<'a, T> {
    guard: Option<spin::RwLockWriteGuard<'a, T>>,
    flags: IrqFlags,
}

impl<T> IrqRwLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::RwLock::new(value),
        }
    }

    /// Disable local interrupts and acquire the lock for reading.
    pub fn read_irqsave(&self) -> IrqReadGuard<'_, T> {
        let flags = arch::port().irq_save();
        IrqReadGuard {
            guard: Some(self.inner.read()),
            flags,
        }
    }

    /// Disable local interrupts and acquire the lock for writing.
    pub fn write_irqsave(&self) -> IrqWriteGuard<'_, T> {
        let flags = arch::port().irq_save();
        IrqWriteGuard {
            guard: Some(self.inner.write()),
            flags,
        }
    }
}

impl<T> Deref for IrqReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_ref().unwrap()
    }
}

impl<T> Drop for IrqReadGuard<'_, T> {
    fn drop(&mut self) {
        self.guard.take();
        arch::port().irq_restore(self.flags);
    }
}

impl<T> Deref for IrqWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_ref().unwrap()
    }
}

impl<T> DerefMut for IrqWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().unwrap()
    }
}

impl<T> Drop for IrqWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.guard.take();
        arch::port().irq_restore(self.flags);
    }
}

/// A caller-held lock that the scheduler may temporarily release.
///
/// `scheduler::state_change_locked` releases the held lock around a
/// synchronous orphan preemption so the caller's locking scheme cannot
/// deadlock against the switch path, then reacquires it before returning.
///
/// Implementations must tolerate `release` and `reacquire` being invoked
/// from the context that currently holds the lock. The caller must actually
/// hold the lock when passing it in, and must not touch it until the call
/// returns.
pub trait HeldLock {
    fn release(&self);
    fn reacquire(&self);
}

impl<T> HeldLock for spin::Mutex<T> {
    fn release(&self) {
        // The contract above guarantees the calling context holds the lock.
        unsafe { self.force_unlock() };
        arch::port().irq_enable();
    }

    fn reacquire(&self) {
        let _ = arch::port().irq_save();
        core::mem::forget(self.lock());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn irqspinlock_basic() {
        crate::tests::harness::setup();
        let lock = IrqSpinLock::new(5u32);
        {
            let mut g = lock.lock_irqsave();
            *g += 1;
        }
        assert_eq!(*lock.lock_irqsave(), 6);
    }

    #[test]
    fn irqrwlock_read_then_write() {
        crate::tests::harness::setup();
        let lock = IrqRwLock::new(7u32);
        {
            let g = lock.read_irqsave();
            assert_eq!(*g, 7);
        }
        {
            let mut g = lock.write_irqsave();
            *g = 9;
        }
        assert_eq!(*lock.read_irqsave(), 9);
    }
}
