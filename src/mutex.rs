use core::cell::UnsafeCell;
use core::fmt::{self, Debug, Display, Formatter};
use core::ops::{Deref, DerefMut};

use crate::error::Result;
use crate::raw::{PriorityLock, Token};

/// A mutual exclusion primitive protecting a value with any [`PriorityLock`].
///
/// The lock variant decides how priorities are handled while the value is
/// borrowed. Locking returns a [`MutexGuard`] that releases the lock when
/// dropped, any release error is then logged. Call [`MutexGuard::unlock`] to
/// observe that error instead.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::thread;
///
/// use cb2lock::raw::Inherit;
/// use cb2lock::sched::SimScheduler;
/// use cb2lock::Mutex;
///
/// let sched = Arc::new(SimScheduler::new());
/// let mutex = Arc::new(Mutex::new(Inherit::new(sched), 0));
/// let c_mutex = Arc::clone(&mutex);
///
/// thread::spawn(move || {
///     *c_mutex.lock().unwrap() = 10;
/// })
/// .join().expect("thread::spawn failed");
///
/// assert_eq!(*mutex.lock().unwrap(), 10);
/// ```
pub struct Mutex<T: ?Sized, L> {
    lock: L,
    data: UnsafeCell<T>,
}

// SAFETY: Access to `data` is serialized by `lock`, a `PriorityLock` which is
// `Send + Sync` itself.
unsafe impl<T: ?Sized + Send, L: PriorityLock> Send for Mutex<T, L> {}
// SAFETY: Same as above, guards only hand out `&mut T` while the lock is held.
unsafe impl<T: ?Sized + Send, L: PriorityLock> Sync for Mutex<T, L> {}

impl<T, L> Mutex<T, L> {
    /// Creates a new mutex protecting `value` with `lock`.
    #[inline]
    pub const fn new(lock: L, value: T) -> Self {
        Self { lock, data: UnsafeCell::new(value) }
    }

    /// Consumes this mutex, returning the underlying data.
    #[inline]
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// Consumes this mutex, returning the lock and the underlying data.
    pub fn into_parts(self) -> (L, T) {
        (self.lock, self.data.into_inner())
    }
}

impl<T: ?Sized, L: PriorityLock> Mutex<T, L> {
    /// Acquires the lock, blocking the current thread until it is able to do
    /// so.
    ///
    /// Fails with the error of [`PriorityLock::acquire`], in which case the
    /// lock is not held.
    pub fn lock(&self) -> Result<MutexGuard<'_, T, L>> {
        let token = self.lock.acquire()?;
        Ok(MutexGuard { mutex: self, token: Some(token) })
    }

    /// Acquires the lock and then runs the closure against the protected data.
    ///
    /// The lock is released after the closure returns, and a release error
    /// takes precedence over the closure's return value.
    pub fn lock_with<F, Ret>(&self, f: F) -> Result<Ret>
    where
        F: FnOnce(&mut T) -> Ret,
    {
        let mut guard = self.lock()?;
        let ret = f(&mut *guard);
        guard.unlock()?;
        Ok(ret)
    }

    /// Returns the underlying lock.
    #[inline]
    pub const fn raw(&self) -> &L {
        &self.lock
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// The mutable borrow statically guarantees that no lock is held, so no
    /// locking takes place.
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T, L> From<(L, T)> for Mutex<T, L> {
    fn from((lock, value): (L, T)) -> Self {
        Self::new(lock, value)
    }
}

impl<T: ?Sized + Debug, L: PriorityLock + Debug> Debug for Mutex<T, L> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex").field("lock", &self.lock).finish_non_exhaustive()
    }
}

/// An RAII implementation of a "scoped lock" of a [`Mutex`].
///
/// The lock is released when the guard is dropped, restoring the holder's
/// priority where the variant changed it. The guard cannot be sent to other
/// threads.
#[must_use = "if unused the Mutex will immediately unlock"]
pub struct MutexGuard<'a, T: ?Sized, L: PriorityLock> {
    mutex: &'a Mutex<T, L>,
    token: Option<Token>,
}

impl<T: ?Sized, L: PriorityLock> MutexGuard<'_, T, L> {
    /// Returns the token proving this guard holds the lock.
    pub fn token(&self) -> Option<&Token> {
        self.token.as_ref()
    }

    /// Releases the lock, returning the error [`PriorityLock::release`]
    /// reported, if any.
    pub fn unlock(mut self) -> Result<()> {
        match self.token.take() {
            Some(token) => self.mutex.lock.release(token),
            None => Ok(()),
        }
    }
}

impl<T: ?Sized, L: PriorityLock> Deref for MutexGuard<'_, T, L> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: The guard holds the lock until it is dropped.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized, L: PriorityLock> DerefMut for MutexGuard<'_, T, L> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The guard holds the lock until it is dropped.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized + Debug, L: PriorityLock> Debug for MutexGuard<'_, T, L> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Debug::fmt(&**self, f)
    }
}

impl<T: ?Sized + Display, L: PriorityLock> Display for MutexGuard<'_, T, L> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&**self, f)
    }
}

impl<T: ?Sized, L: PriorityLock> Drop for MutexGuard<'_, T, L> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            let tid = token.tid();
            if let Err(err) = self.mutex.lock.release(token) {
                tracing::error!(%tid, kind = %self.mutex.lock.kind(), %err, "failed to release lock");
            }
        }
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::Arc;

    use super::Mutex;
    use crate::error::Error;
    use crate::priority::Priority;
    use crate::raw::{Ceiling, Plain, PriorityLock};
    use crate::sched::{Scheduler, SimScheduler};

    #[test]
    fn guard_restores_priority_on_drop() {
        let sched = Arc::new(SimScheduler::new());
        let mutex = Mutex::new(Ceiling::new(Arc::clone(&sched), Priority::HIGHEST), vec![1]);
        let me = sched.current();
        {
            let mut guard = mutex.lock().unwrap();
            guard.push(2);
            assert_eq!(sched.priority(me).unwrap(), Priority::HIGHEST);
        }
        assert_eq!(sched.priority(me).unwrap(), Priority::NEUTRAL);
        assert!(!mutex.raw().is_locked());
        assert_eq!(mutex.into_inner(), [1, 2]);
    }

    #[test]
    fn unlock_surfaces_release_errors() {
        let sched = Arc::new(SimScheduler::new());
        let mutex = Mutex::new(Ceiling::new(Arc::clone(&sched), Priority::HIGHEST), ());
        let guard = mutex.lock().unwrap();
        sched.exit();
        let err = guard.unlock().unwrap_err();
        assert!(matches!(err, Error::NoSuchThread { op: "set", .. }));
        assert!(!mutex.raw().is_locked());
    }

    #[test]
    fn dropped_guard_logs_and_unlocks() {
        let sched = Arc::new(SimScheduler::new());
        let mutex = Mutex::new(Ceiling::new(Arc::clone(&sched), Priority::HIGHEST), 0);
        let guard = mutex.lock().unwrap();
        sched.exit();
        drop(guard);
        assert!(!mutex.raw().is_locked());
    }

    #[test]
    fn lock_with_returns_closure_value() {
        let mutex = Mutex::new(Plain::new(SimScheduler::new()), 20);
        let ret = mutex.lock_with(|data| {
            *data += 1;
            *data * 2
        });
        assert_eq!(ret.unwrap(), 42);
        assert!(mutex.lock_with(|data| *data == 21).unwrap());
    }

    #[test]
    fn get_mut_and_into_parts() {
        let mut mutex: Mutex<_, _> = (Plain::new(SimScheduler::new()), String::from("a")).into();
        mutex.get_mut().push('b');
        assert_eq!(format!("{}", mutex.lock().unwrap()), "ab");
        let (lock, data) = mutex.into_parts();
        assert_eq!(data, "ab");
        lock.destroy().unwrap();
    }
}
