//! Spinlock used for kernel state shared across harts.
//!
//! The kernel body itself is serialised by the platform's global trap lock,
//! so most core state needs no locking of its own. This lock covers the few
//! pieces that are touched outside the dispatcher as well: the log ring
//! buffer and the machine-mode kernel instance.

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

// Lock states as u32. 32-bit atomics lower to AMOSWAP.W and aligned LW/SW
// on RISC-V, which are serialised across harts; byte atomics may not be.
const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// A mutual exclusion primitive based on spinning.
///
/// Acquisition is a single atomic swap; release is a store. There is no
/// fairness guarantee, which is acceptable for the short critical sections
/// the kernel uses it for.
pub struct Spinlock<T> {
    locked: AtomicU32,
    data: UnsafeCell<T>,
}

// Safety: the lock serialises all access to the inner value.
unsafe impl<T: Send> Sync for Spinlock<T> {}
unsafe impl<T: Send> Send for Spinlock<T> {}

impl<T> Spinlock<T> {
    /// Create a new spinlock wrapping the given value.
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicU32::new(UNLOCKED),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock, spinning until it is available.
    #[inline]
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            while self.locked.load(Ordering::Relaxed) == LOCKED {
                spin_loop();
            }
        }
    }

    /// Acquire the lock if it is free right now.
    #[inline]
    pub fn try_lock(&self) -> Option<SpinlockGuard<'_, T>> {
        if self.locked.swap(LOCKED, Ordering::Acquire) == UNLOCKED {
            Some(SpinlockGuard { lock: self })
        } else {
            None
        }
    }
}

/// RAII guard; the lock is released when the guard is dropped.
pub struct SpinlockGuard<'a, T> {
    lock: &'a Spinlock<T>,
}

impl<T> Deref for SpinlockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard proves exclusive ownership of the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard proves exclusive ownership of the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinlockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(UNLOCKED, Ordering::Release);
    }
}
