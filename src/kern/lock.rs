//! Locking primitives
//!
//! Provides the spin lock used for the kernel's global tables, with an
//! interrupt-disabling variant for data touched from interrupt context.
//!
//! ## Lock ordering
//!
//! There are two top-level spinlocks in this subsystem:
//!
//! - the **process lock** (process index, pgroup/session tables, family
//!   links, per-process state), and
//! - the **thread lock** (thread index, run queues, dead queue, death-stack
//!   bitmap, per-thread scheduling state).
//!
//! The process lock may be held over an acquisition of the thread lock,
//! never the reverse. The semaphore and VM table locks are leaves that may
//! be taken while the thread lock is held; neither ever acquires the
//! process lock.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::interrupt::{int_disable_interrupts, int_restore_interrupts};

/// A spin lock protecting data.
pub struct SpinLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    fn acquire(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// Acquire the lock, spinning until available.
    pub fn lock(&self) -> SpinGuard<'_, T> {
        self.acquire();
        SpinGuard { lock: self }
    }

    /// Disable local interrupts, then acquire the lock. The guard restores
    /// interrupts after releasing. This is the required pattern for any
    /// mutation of the global indexes, run queues, or group membership.
    pub fn lock_irq(&self) -> IrqSpinGuard<'_, T> {
        int_disable_interrupts();
        self.acquire();
        IrqSpinGuard { lock: self }
    }

    /// Try to acquire without spinning.
    pub fn try_lock(&self) -> Option<SpinGuard<'_, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinGuard { lock: self })
        } else {
            None
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Release the lock without a guard. A freshly dispatched thread uses
    /// this to drop the thread lock its creator's dispatcher was holding.
    ///
    /// # Safety
    /// The caller must own the critical section the lock protects.
    pub unsafe fn force_unlock(&self) {
        self.release();
    }
}

/// RAII guard for a plain acquisition.
pub struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

/// RAII guard for an interrupt-disabling acquisition.
pub struct IrqSpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for IrqSpinGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for IrqSpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for IrqSpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release();
        int_restore_interrupts();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_guards_data() {
        let lock = SpinLock::new(42);
        {
            let mut guard = lock.lock();
            assert_eq!(*guard, 42);
            *guard = 100;
        }
        assert_eq!(*lock.lock(), 100);
    }

    #[test]
    fn test_try_lock() {
        let lock = SpinLock::new(());
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_irq_guard_releases() {
        let lock = SpinLock::new(5);
        {
            let _guard = lock.lock_irq();
            assert!(lock.is_locked());
        }
        assert!(!lock.is_locked());
    }
}
