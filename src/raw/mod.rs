//! Priority aware lock variants.
//!
//! Every variant guards a caller defined critical section and implements the
//! [`PriorityLock`] contract: [`acquire`] blocks until the calling thread
//! holds the lock and returns a [`Token`] with the thread's saved state,
//! [`release`] consumes that token. Variants differ in how they touch thread
//! priorities while doing so:
//!
//! - [`Plain`] never changes priorities, except for demoting a holder that
//!   runs on the reserved CPU.
//! - [`Inherit`] raises a less urgent owner to the priority of a blocked
//!   requester.
//! - [`Ceiling`] raises every holder to a fixed ceiling before locking.
//! - [`Cb2`] decides through a weighted lottery whether a requester donates
//!   its priority to the owner.
//!
//! The lock is not data carrying. See [`Mutex`] for an RAII wrapper that
//! protects a value with any of these variants.
//!
//! [`acquire`]: PriorityLock::acquire
//! [`release`]: PriorityLock::release
//! [`Mutex`]: crate::Mutex

use core::marker::PhantomData;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::priority::{Priority, Tid};
use crate::registry::LockKind;
use crate::sched::Scheduler;

mod cb2;
mod ceiling;
mod inherit;
mod owned;
mod plain;

pub use cb2::{Cb2, Lottery, Tickets};
pub use ceiling::Ceiling;
pub use inherit::Inherit;
pub use plain::Plain;

/// The CPU reserved for the deliberately low priority thread.
///
/// A holder running there demotes itself to [`Priority::LOWEST`] right after
/// acquiring, to bias contention away from that CPU.
pub const RESERVED_CPU: usize = 0;

/// The four operation contract shared by every lock variant.
///
/// Initialization is done by each variant's constructor (or
/// [`RuntimeLock::initialize`]), destruction by [`destroy`].
///
/// [`RuntimeLock::initialize`]: crate::RuntimeLock::initialize
/// [`destroy`]: PriorityLock::destroy
pub trait PriorityLock: Send + Sync {
    /// Returns the variant tag of this lock.
    fn kind(&self) -> LockKind;

    /// Blocks the calling thread until it exclusively holds the lock.
    ///
    /// May read or change the calling thread's priority and the priority of
    /// the current owner. On error, the lock is not held by the caller.
    fn acquire(&self) -> Result<Token>;

    /// Releases the lock held through `token`, restoring the calling thread's
    /// priority where the variant changed it.
    ///
    /// The lock is released even if restoring the priority fails.
    ///
    /// # Panics
    ///
    /// Panics if `token` was not handed out by this lock.
    fn release(&self, token: Token) -> Result<()>;

    /// Returns `true` if some thread currently holds the lock.
    fn is_locked(&self) -> bool;

    /// Tears the lock down.
    ///
    /// Fails with [`Error::Busy`] if the lock is still held. The lock is
    /// dropped either way, and any outstanding [`Token`] is rejected by every
    /// other lock instance.
    fn destroy(self) -> Result<()>
    where
        Self: Sized,
    {
        if self.is_locked() {
            return Err(Error::Busy(self.kind()));
        }
        tracing::trace!(kind = %self.kind(), "destroyed");
        Ok(())
    }
}

/// Proof that the calling thread holds a [`PriorityLock`], together with the
/// priority it had before acquiring.
///
/// Tokens cannot be sent to other threads, so a lock is always released by
/// the thread that acquired it. A token is bound to the identity of the lock
/// instance that issued it, not to its address, so it is rejected by every
/// other instance, including one that later reuses the same memory.
#[derive(Debug)]
#[must_use = "a token must be handed back to `release`, or the lock stays held"]
pub struct Token {
    lock: LockId,
    tid: Tid,
    original: Option<Priority>,
    marker: PhantomData<*const ()>,
}

impl Token {
    fn new(lock: LockId, tid: Tid, original: Option<Priority>) -> Self {
        Self { lock, tid, original, marker: PhantomData }
    }

    /// Panics unless this token was handed out by the lock identified by
    /// `lock`.
    fn check(&self, lock: LockId) {
        assert_eq!(self.lock, lock, "token released on a lock that did not issue it");
    }

    /// Returns the identity of the holding thread.
    #[must_use]
    pub const fn tid(&self) -> Tid {
        self.tid
    }

    /// Returns the priority the holder had before acquiring, if the variant
    /// recorded it.
    #[must_use]
    pub const fn original_priority(&self) -> Option<Priority> {
        self.original
    }
}

/// A process wide unique identity of a lock instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct LockId(u64);

impl LockId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// The reserved CPU demotion policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ReservedCpu(Option<usize>);

impl ReservedCpu {
    pub(crate) const fn new(cpu: Option<usize>) -> Self {
        Self(cpu)
    }

    pub(crate) const fn cpu(self) -> Option<usize> {
        self.0
    }

    /// Demotes `me` to the lowest priority if it runs on the reserved CPU.
    pub(crate) fn apply<S: Scheduler>(self, sched: &S, me: Tid) -> Result<()> {
        let Some(reserved) = self.0 else { return Ok(()) };
        if sched.current_cpu() == Some(reserved) {
            tracing::debug!(tid = %me, cpu = reserved, "demoting holder on reserved cpu");
            sched.set_priority(me, Priority::LOWEST)?;
        }
        Ok(())
    }
}

impl Default for ReservedCpu {
    fn default() -> Self {
        Self(Some(RESERVED_CPU))
    }
}
