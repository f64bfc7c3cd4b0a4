//! Selects between the production primitives and their Loom instrumented
//! counterparts.

pub mod hint {
    #[cfg(not(all(loom, test)))]
    pub use core::hint::spin_loop;

    #[cfg(all(loom, test))]
    pub use loom::hint::spin_loop;
}

pub mod thread {
    #[cfg(not(all(loom, test)))]
    pub use std::thread::{current, yield_now, ThreadId};

    #[cfg(all(loom, test))]
    pub use loom::thread::{current, yield_now, ThreadId};
}

pub mod sync {
    #[cfg(not(all(loom, test)))]
    pub use parking_lot::{Mutex, MutexGuard};

    #[cfg(all(loom, test))]
    pub use crate::loom::{Mutex, MutexGuard};
}

pub mod raw {
    #[cfg(not(all(loom, test)))]
    pub use self::parking::RawLock;

    #[cfg(all(loom, test))]
    pub use crate::loom::RawLock;

    #[cfg(not(all(loom, test)))]
    mod parking {
        use parking_lot::lock_api::RawMutex as _;

        /// A guardless mutual exclusion primitive, so that acquisition and
        /// release can happen in separate calls.
        pub struct RawLock(parking_lot::RawMutex);

        impl RawLock {
            pub const fn new() -> Self {
                Self(<parking_lot::RawMutex as parking_lot::lock_api::RawMutex>::INIT)
            }

            #[inline]
            pub fn lock(&self) {
                self.0.lock();
            }

            #[inline]
            pub fn try_lock(&self) -> bool {
                self.0.try_lock()
            }

            /// # Safety
            ///
            /// The lock must be held, though not necessarily by the calling
            /// thread's own stack frame.
            #[inline]
            pub unsafe fn unlock(&self) {
                // SAFETY: Caller guaranteed that the lock is held.
                unsafe { self.0.unlock() }
            }

            #[inline]
            pub fn is_locked(&self) -> bool {
                self.0.is_locked()
            }
        }
    }
}
