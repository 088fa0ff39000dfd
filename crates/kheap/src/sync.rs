//! Busy-wait lock guarding one heap instance.
//!
//! Besides the acquisition site, the lock remembers which execution context
//! holds it when a context-id hook has been installed with
//! [`set_context_id`]. Acquiring the lock again from the holding context is
//! reported as a [`Violation::RecursiveLock`](crate::error::Violation)
//! instead of spinning forever.

use core::{
    cell::UnsafeCell,
    fmt, hint,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use spin::Once;

use crate::error::{self, Location, RecursiveLockSnafu};

const NO_HOLDER: usize = 0;

static CONTEXT_ID: Once<fn() -> usize> = Once::new();

/// Installs the function identifying the running execution context (hart,
/// CPU or thread). It must never return 0. Only the first call has an effect.
pub fn set_context_id(f: fn() -> usize) {
    CONTEXT_ID.call_once(|| f);
}

fn current_context() -> Option<usize> {
    CONTEXT_ID.get().map(|f| f())
}

pub struct SpinMutex<T> {
    locked: AtomicBool,
    holder: AtomicUsize,
    data: UnsafeCell<T>,
    locked_at: UnsafeCell<Location>,
}

unsafe impl<T> Sync for SpinMutex<T> where T: Send {}

impl<T> fmt::Debug for SpinMutex<T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("SpinMutex");
        match self.try_lock() {
            Some(guard) => d.field("data", &&*guard),
            None => d.field("data", &"<locked>"),
        };
        d.finish()
    }
}

impl<T> SpinMutex<T> {
    #[track_caller]
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            holder: AtomicUsize::new(NO_HOLDER),
            data: UnsafeCell::new(data),
            locked_at: UnsafeCell::new(Location(core::panic::Location::caller())),
        }
    }

    /// Returns `true` if the running context already holds this lock.
    ///
    /// Always `false` when no context-id hook is installed.
    pub fn is_held_by_current(&self) -> bool {
        match current_context() {
            Some(id) => {
                self.locked.load(Ordering::Acquire) && self.holder.load(Ordering::Relaxed) == id
            }
            None => false,
        }
    }

    /// Spins until the lock is acquired.
    ///
    /// # Panics
    ///
    /// Panics if the running context already holds the lock. Without a
    /// context-id hook this cannot be detected and the call never returns.
    #[track_caller]
    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        if self.is_held_by_current() {
            let locked_at = unsafe { *self.locked_at.get() };
            error::report(RecursiveLockSnafu { locked_at }.build());
        }

        while self.locked.swap(true, Ordering::Acquire) {
            hint::spin_loop();
        }
        self.acquired()
    }

    #[track_caller]
    pub fn try_lock(&self) -> Option<SpinMutexGuard<'_, T>> {
        if self.locked.swap(true, Ordering::Acquire) {
            return None;
        }
        Some(self.acquired())
    }

    #[track_caller]
    fn acquired(&self) -> SpinMutexGuard<'_, T> {
        self.holder
            .store(current_context().unwrap_or(NO_HOLDER), Ordering::Relaxed);
        unsafe {
            *self.locked_at.get() = Location::default();
        }
        SpinMutexGuard { mutex: self }
    }

    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

pub struct SpinMutexGuard<'a, T> {
    mutex: &'a SpinMutex<T>,
}

unsafe impl<T> Sync for SpinMutexGuard<'_, T> where T: Sync {}

impl<T> Drop for SpinMutexGuard<'_, T> {
    fn drop(&mut self) {
        assert!(
            self.mutex.is_locked(),
            "SpinMutexGuard dropped without holding the lock"
        );
        self.mutex.holder.store(NO_HOLDER, Ordering::Relaxed);
        self.mutex.locked.store(false, Ordering::Release);
    }
}

impl<T> Deref for SpinMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for SpinMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.mutex.data.get() }
    }
}
