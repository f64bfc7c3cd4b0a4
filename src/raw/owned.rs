use crate::cfg::raw::RawLock;
use crate::cfg::sync::{Mutex, MutexGuard};
use crate::error::Result;
use crate::priority::{Priority, Tid};
use crate::sched::Scheduler;

use super::{LockId, ReservedCpu, Token};

/// Ownership metadata, only accessed with the metadata lock held.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Ownership {
    /// The thread holding the main lock, if it already claimed it.
    pub owner: Option<Tid>,
    /// The last observed priority of the owner.
    pub owner_priority: Option<Priority>,
}

impl AsMut<Ownership> for Ownership {
    fn as_mut(&mut self) -> &mut Ownership {
        self
    }
}

/// A main lock paired with a metadata lock that tracks its owner.
///
/// Shared by the donating variants: the metadata lock is taken before any
/// attempt on the main lock and is never held across a blocking wait on it.
pub(crate) struct OwnedLock<S, M> {
    pub id: LockId,
    pub sched: S,
    pub reserved: ReservedCpu,
    main: RawLock,
    meta: Mutex<M>,
}

impl<S: Scheduler, M: AsMut<Ownership>> OwnedLock<S, M> {
    pub fn new(sched: S, meta: M) -> Self {
        let reserved = ReservedCpu::default();
        let (id, main, meta) = (LockId::next(), RawLock::new(), Mutex::new(meta));
        Self { id, sched, reserved, main, meta }
    }

    /// Returns the calling thread and its current priority.
    pub fn caller(&self) -> Result<(Tid, Priority)> {
        let me = self.sched.current();
        let original = self.sched.priority(me)?;
        Ok((me, original))
    }

    pub fn meta(&self) -> MutexGuard<'_, M> {
        self.meta.lock()
    }

    /// Attempts the main lock without blocking, claiming ownership on success.
    pub fn try_claim(&self, meta: &mut M, me: Tid) -> Result<bool> {
        if !self.main.try_lock() {
            return Ok(false);
        }
        tracing::trace!(tid = %me, "acquired uncontended");
        self.claim(meta, me)?;
        Ok(true)
    }

    /// Releases the metadata lock, blocks on the main lock and claims
    /// ownership once it is granted.
    pub fn block(&self, meta: MutexGuard<'_, M>, me: Tid) -> Result<()> {
        drop(meta);
        tracing::trace!(tid = %me, "waiting on main lock");
        self.main.lock();
        let mut meta = self.meta.lock();
        self.claim(&mut meta, me)
    }

    /// Records `me` as owner of the already held main lock. On failure the
    /// main lock is released again.
    fn claim(&self, meta: &mut M, me: Tid) -> Result<()> {
        let ownership = meta.as_mut();
        ownership.owner = Some(me);
        ownership.owner_priority = None;
        if let Err(err) = self.reserved.apply(&self.sched, me) {
            *ownership = Ownership::default();
            // SAFETY: The main lock was acquired just before this call.
            unsafe { self.main.unlock() };
            return Err(err);
        }
        Ok(())
    }

    /// Releases the main lock and restores the holder's saved priority.
    pub fn release(&self, token: &Token) -> Result<()> {
        {
            let mut meta = self.meta.lock();
            // SAFETY: A token is only handed out while the main lock is held,
            // and it is consumed by this release.
            unsafe { self.main.unlock() };
            *meta.as_mut() = Ownership::default();
        }
        tracing::trace!(tid = %token.tid, "released");
        match token.original {
            Some(original) => self.sched.set_priority(token.tid, original),
            None => Ok(()),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.main.is_locked()
    }

    pub fn owner(&self) -> Option<Tid> {
        self.meta.lock().as_mut().owner
    }
}
