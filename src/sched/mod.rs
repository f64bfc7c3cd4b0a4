//! Priority accessors.
//!
//! The locks in this crate never talk to the operating system directly. Every
//! priority read or write, and the lookup of the calling thread's identity and
//! CPU, goes through the [`Scheduler`] trait. [`OsScheduler`] forwards to the
//! Linux `getpriority(2)`, `setpriority(2)`, `gettid(2)` and `sched_getcpu(3)`
//! calls, while [`SimScheduler`] keeps an in-process priority table that can
//! be driven without privileges.

use std::sync::Arc;

use crate::error::Result;
use crate::priority::{Priority, Tid};

#[cfg(target_os = "linux")]
mod os;
#[cfg(target_os = "linux")]
pub use os::OsScheduler;

mod sim;
pub use sim::{PriorityEvent, SimScheduler};

/// Read and write access to thread scheduling priorities.
///
/// Implementations must be shareable across every thread that contends on a
/// lock.
pub trait Scheduler: Send + Sync {
    /// Returns the identity of the calling thread.
    fn current(&self) -> Tid;

    /// Returns the current scheduling priority of `tid`.
    fn priority(&self, tid: Tid) -> Result<Priority>;

    /// Sets the scheduling priority of `tid`.
    ///
    /// Fails with [`PermissionDenied`] when the caller may not set a priority
    /// that urgent, or with [`NoSuchThread`] when `tid` is gone.
    ///
    /// [`PermissionDenied`]: crate::Error::PermissionDenied
    /// [`NoSuchThread`]: crate::Error::NoSuchThread
    fn set_priority(&self, tid: Tid, priority: Priority) -> Result<()>;

    /// Returns the index of the CPU the calling thread is running on, if
    /// known.
    fn current_cpu(&self) -> Option<usize>;
}

impl<S: Scheduler + ?Sized> Scheduler for &S {
    #[inline]
    fn current(&self) -> Tid {
        (**self).current()
    }

    #[inline]
    fn priority(&self, tid: Tid) -> Result<Priority> {
        (**self).priority(tid)
    }

    #[inline]
    fn set_priority(&self, tid: Tid, priority: Priority) -> Result<()> {
        (**self).set_priority(tid, priority)
    }

    #[inline]
    fn current_cpu(&self) -> Option<usize> {
        (**self).current_cpu()
    }
}

impl<S: Scheduler + ?Sized> Scheduler for Arc<S> {
    #[inline]
    fn current(&self) -> Tid {
        (**self).current()
    }

    #[inline]
    fn priority(&self, tid: Tid) -> Result<Priority> {
        (**self).priority(tid)
    }

    #[inline]
    fn set_priority(&self, tid: Tid, priority: Priority) -> Result<()> {
        (**self).set_priority(tid, priority)
    }

    #[inline]
    fn current_cpu(&self) -> Option<usize> {
        (**self).current_cpu()
    }
}
