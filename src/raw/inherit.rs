use core::fmt::{self, Debug, Formatter};

use crate::error::Result;
use crate::priority::Tid;
use crate::registry::LockKind;
use crate::sched::Scheduler;

use super::owned::{OwnedLock, Ownership};
use super::{PriorityLock, Token};

/// A priority inheritance lock.
///
/// A requester that finds the lock taken by a less urgent owner raises the
/// owner to its own priority, unconditionally, and then blocks. The owner
/// gets its original priority back when it releases.
///
/// Two locks are used: the main lock for the critical section and a metadata
/// lock for the owner bookkeeping. The metadata lock is never held while
/// blocking on the main lock, so the two cannot deadlock, although release
/// now has to take the metadata lock too.
///
/// # Example
///
/// ```
/// use cb2lock::raw::Inherit;
/// use cb2lock::sched::SimScheduler;
/// use cb2lock::PriorityLock;
///
/// let lock = Inherit::new(SimScheduler::new());
/// let token = lock.acquire().unwrap();
/// assert!(lock.is_locked());
/// lock.release(token).unwrap();
/// lock.destroy().unwrap();
/// ```
pub struct Inherit<S> {
    inner: OwnedLock<S, Ownership>,
}

impl<S: Scheduler> Inherit<S> {
    /// Creates a new, unlocked priority inheritance lock.
    pub fn new(sched: S) -> Self {
        Self { inner: OwnedLock::new(sched, Ownership::default()) }
    }

    /// Overrides the reserved CPU, `None` disables the demotion policy.
    #[must_use]
    pub fn with_reserved_cpu(mut self, cpu: Option<usize>) -> Self {
        self.inner.reserved = super::ReservedCpu::new(cpu);
        self
    }

    /// Returns the thread currently recorded as owner.
    #[must_use]
    pub fn owner(&self) -> Option<Tid> {
        self.inner.owner()
    }

    /// Returns the scheduler this lock consults.
    pub fn scheduler(&self) -> &S {
        &self.inner.sched
    }
}

impl<S: Scheduler> PriorityLock for Inherit<S> {
    fn kind(&self) -> LockKind {
        LockKind::Inherit
    }

    fn acquire(&self) -> Result<Token> {
        let (me, original) = self.inner.caller()?;
        let mut meta = self.inner.meta();
        if self.inner.try_claim(&mut meta, me)? {
            return Ok(Token::new(self.inner.id, me, Some(original)));
        }

        // The owner may not have claimed the lock yet after waking up, in
        // which case there is nobody to boost.
        if let Some(owner) = meta.owner {
            let sched = &self.inner.sched;
            let owner_priority = sched.priority(owner)?;
            meta.owner_priority = Some(owner_priority);
            if owner_priority.is_less_urgent_than(original) {
                tracing::debug!(tid = %me, %owner, from = %owner_priority, to = %original, "inheriting priority");
                sched.set_priority(owner, original)?;
                meta.owner_priority = Some(original);
            }
        }

        self.inner.block(meta, me)?;
        Ok(Token::new(self.inner.id, me, Some(original)))
    }

    fn release(&self, token: Token) -> Result<()> {
        token.check(self.inner.id);
        self.inner.release(&token)
    }

    fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

impl<S> Debug for Inherit<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inherit").field("reserved_cpu", &self.inner.reserved.cpu()).finish_non_exhaustive()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::mpsc::channel;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::Inherit;
    use crate::error::Error;
    use crate::priority::Priority;
    use crate::raw::PriorityLock;
    use crate::sched::{Scheduler, SimScheduler};
    use crate::test::tests;

    type Lock = Inherit<Arc<SimScheduler>>;

    #[test]
    fn lots_and_lots_acquire() {
        tests::lots_and_lots_acquire::<Lock>(Inherit::new);
    }

    #[test]
    fn priority_restored() {
        tests::priority_restored::<Lock>(Inherit::new);
    }

    #[test]
    fn contention_terminates() {
        tests::contention_terminates::<Lock>(Inherit::new);
    }

    #[test]
    fn smoke() {
        tests::smoke::<Lock>(Inherit::new);
    }

    #[test]
    fn lots_and_lots_mutex() {
        tests::lots_and_lots_mutex::<Lock>(Inherit::new);
    }

    #[test]
    fn destroy_while_held() {
        tests::destroy_while_held::<Lock>(Inherit::new);
    }

    #[test]
    fn low_priority_holder_inherits() {
        tests::low_priority_holder_boosted::<Lock>(Inherit::new);
    }

    #[test]
    fn exited_owner_fails_contender() {
        tests::exited_owner_fails_contender::<Lock>(Inherit::new);
    }

    #[test]
    fn failed_claim_unlocks() {
        tests::failed_claim_unlocks::<Inherit<Arc<tests::NoDemotion>>>(Inherit::new);
    }

    #[test]
    fn failed_claim_clears_owner() {
        let sched = Arc::new(tests::NoDemotion::default());
        let lock = Inherit::new(Arc::clone(&sched));
        sched.0.pin(0);
        assert!(lock.acquire().is_err());
        assert_eq!(lock.owner(), None);

        sched.0.pin(1);
        let me = sched.current();
        let token = lock.acquire().unwrap();
        assert_eq!(lock.owner(), Some(me));
        lock.release(token).unwrap();
        assert_eq!(lock.owner(), None);
    }

    /// Without the privilege to raise the owner, the requester gives up and
    /// the owner keeps both the lock and its priority.
    #[test]
    fn denied_inheritance_fails_requester() {
        let sched = Arc::new(SimScheduler::unprivileged());
        let lock = Arc::new(Inherit::new(Arc::clone(&sched)));
        let (tx, rx) = channel();
        let (done_tx, done_rx) = channel::<()>();
        let (h_lock, h_sched) = (Arc::clone(&lock), Arc::clone(&sched));
        let holder = thread::spawn(move || {
            let me = h_sched.assign(Priority::LOWEST);
            let token = h_lock.acquire().unwrap();
            tx.send(me).unwrap();
            done_rx.recv().unwrap();
            h_lock.release(token).unwrap();
            assert_eq!(h_sched.priority(me).unwrap(), Priority::LOWEST);
            let token = h_lock.acquire().unwrap();
            assert_eq!(h_lock.owner(), Some(me));
            h_lock.release(token).unwrap();
        });

        sched.assign(Priority::HIGHEST);
        let a = rx.recv().unwrap();
        let err = lock.acquire().unwrap_err();
        assert!(matches!(err, Error::PermissionDenied { tid, .. } if tid == a));
        assert!(lock.is_locked());
        assert_eq!(lock.owner(), Some(a));
        assert_eq!(sched.priority(a).unwrap(), Priority::LOWEST);
        done_tx.send(()).unwrap();
        holder.join().unwrap();
        assert!(!lock.is_locked());
        assert_eq!(lock.owner(), None);
    }

    #[test]
    fn reserved_cpu_demotion_is_restored() {
        let sched = Arc::new(SimScheduler::new());
        let lock = Inherit::new(Arc::clone(&sched));
        sched.pin(0);
        let me = sched.assign(Priority::NEUTRAL);
        let token = lock.acquire().unwrap();
        assert_eq!(sched.priority(me).unwrap(), Priority::LOWEST);
        lock.release(token).unwrap();
        assert_eq!(sched.priority(me).unwrap(), Priority::NEUTRAL);
    }

    #[test]
    fn more_urgent_owner_is_left_alone() {
        let sched = Arc::new(SimScheduler::new());
        let lock = Arc::new(Inherit::new(Arc::clone(&sched)));
        let owner = sched.assign(Priority::HIGHEST);
        let token = lock.acquire().unwrap();
        assert_eq!(lock.owner(), Some(owner));

        let (tx, rx) = channel();
        let (c_lock, c_sched) = (Arc::clone(&lock), Arc::clone(&sched));
        let waiter = thread::spawn(move || {
            let me = c_sched.assign(Priority::LOWEST);
            tx.send(me).unwrap();
            let token = c_lock.acquire().unwrap();
            c_lock.release(token).unwrap();
        });
        let waiter_tid = rx.recv().unwrap();
        thread::sleep(Duration::from_millis(20));
        lock.release(token).unwrap();
        waiter.join().unwrap();
        assert!(sched.events().iter().all(|e| e.by != waiter_tid || e.target == waiter_tid));
        assert_eq!(sched.priority(waiter_tid).unwrap(), Priority::LOWEST);
    }
}

#[cfg(all(loom, test))]
mod model {
    use super::Inherit;
    use crate::loom::models;

    #[test]
    fn lock_join() {
        models::lock_join(Inherit::new);
    }
}
