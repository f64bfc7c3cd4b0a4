use core::fmt::{self, Debug, Formatter};

use crate::cfg::raw::RawLock;
use crate::error::Result;
use crate::registry::LockKind;
use crate::sched::Scheduler;

use super::{LockId, PriorityLock, ReservedCpu, Token};

/// The baseline lock, with no priority inversion mitigation.
///
/// The only priority change it ever makes is the reserved CPU policy: a
/// holder running on the reserved CPU demotes itself to the lowest priority
/// right after acquiring. That demotion is sticky, it is not reverted on
/// release.
///
/// # Example
///
/// ```
/// use cb2lock::raw::Plain;
/// use cb2lock::sched::SimScheduler;
/// use cb2lock::PriorityLock;
///
/// let lock = Plain::new(SimScheduler::new());
/// let token = lock.acquire().unwrap();
/// assert!(token.original_priority().is_none());
/// lock.release(token).unwrap();
/// ```
pub struct Plain<S> {
    id: LockId,
    sched: S,
    reserved: ReservedCpu,
    main: RawLock,
}

impl<S: Scheduler> Plain<S> {
    /// Creates a new, unlocked plain lock.
    pub fn new(sched: S) -> Self {
        let reserved = ReservedCpu::default();
        Self { id: LockId::next(), sched, reserved, main: RawLock::new() }
    }

    /// Overrides the reserved CPU, `None` disables the demotion policy.
    #[must_use]
    pub fn with_reserved_cpu(mut self, cpu: Option<usize>) -> Self {
        self.reserved = ReservedCpu::new(cpu);
        self
    }

    /// Returns the scheduler this lock consults.
    pub fn scheduler(&self) -> &S {
        &self.sched
    }
}

impl<S: Scheduler> PriorityLock for Plain<S> {
    fn kind(&self) -> LockKind {
        LockKind::Plain
    }

    fn acquire(&self) -> Result<Token> {
        let me = self.sched.current();
        self.main.lock();
        if let Err(err) = self.reserved.apply(&self.sched, me) {
            // SAFETY: Locked just above, and no token was handed out.
            unsafe { self.main.unlock() };
            return Err(err);
        }
        tracing::trace!(tid = %me, "acquired");
        Ok(Token::new(self.id, me, None))
    }

    fn release(&self, token: Token) -> Result<()> {
        token.check(self.id);
        // SAFETY: The token proves the main lock is held, and it is consumed.
        unsafe { self.main.unlock() };
        tracing::trace!(tid = %token.tid, "released");
        Ok(())
    }

    fn is_locked(&self) -> bool {
        self.main.is_locked()
    }
}

impl<S> Debug for Plain<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plain").field("reserved_cpu", &self.reserved.cpu()).finish_non_exhaustive()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::Arc;

    use super::Plain;
    use crate::error::Error;
    use crate::priority::Priority;
    use crate::raw::PriorityLock;
    use crate::sched::{Scheduler, SimScheduler};
    use crate::test::tests;

    type Lock = Plain<Arc<SimScheduler>>;

    #[test]
    fn lots_and_lots_acquire() {
        tests::lots_and_lots_acquire::<Lock>(Plain::new);
    }

    #[test]
    fn contention_terminates() {
        tests::contention_terminates::<Lock>(Plain::new);
    }

    #[test]
    fn smoke() {
        tests::smoke::<Lock>(Plain::new);
    }

    #[test]
    fn lots_and_lots_mutex() {
        tests::lots_and_lots_mutex::<Lock>(Plain::new);
    }

    #[test]
    fn destroy_while_held() {
        tests::destroy_while_held::<Lock>(Plain::new);
    }

    #[test]
    fn failed_claim_unlocks() {
        tests::failed_claim_unlocks::<Plain<Arc<tests::NoDemotion>>>(Plain::new);
    }

    #[test]
    fn leaves_priorities_alone() {
        let sched = Arc::new(SimScheduler::new());
        let lock = Plain::new(Arc::clone(&sched));
        sched.assign(Priority::HIGHEST);
        let token = lock.acquire().unwrap();
        lock.release(token).unwrap();
        assert!(sched.events().is_empty());
    }

    #[test]
    fn reserved_cpu_demotion_is_sticky() {
        let sched = Arc::new(SimScheduler::unprivileged());
        let lock = Plain::new(Arc::clone(&sched));
        sched.pin(0);
        let me = sched.assign(Priority::NEUTRAL);
        let token = lock.acquire().unwrap();
        assert_eq!(sched.priority(me).unwrap(), Priority::LOWEST);
        lock.release(token).unwrap();
        assert_eq!(sched.priority(me).unwrap(), Priority::LOWEST);
    }

    #[test]
    fn reserved_cpu_can_be_disabled() {
        let sched = Arc::new(SimScheduler::new());
        let lock = Plain::new(Arc::clone(&sched)).with_reserved_cpu(None);
        sched.pin(0);
        let token = lock.acquire().unwrap();
        lock.release(token).unwrap();
        assert!(sched.events().is_empty());
    }

    #[test]
    #[should_panic(expected = "did not issue it")]
    fn foreign_token_panics() {
        let sched = SimScheduler::new();
        let (one, other) = (Plain::new(&sched), Plain::new(&sched));
        let token = one.acquire().unwrap();
        let _ = other.release(token);
    }

    #[test]
    #[should_panic(expected = "did not issue it")]
    fn token_outliving_its_lock_panics() {
        let sched = SimScheduler::new();
        let mut stale = None;
        for _ in 0..2 {
            let lock = Plain::new(&sched);
            match stale.take() {
                // Possibly at the very same address as the destroyed lock.
                Some(token) => {
                    let _ = lock.release(token);
                }
                None => {
                    stale = Some(lock.acquire().unwrap());
                    assert!(matches!(lock.destroy(), Err(Error::Busy(_))));
                }
            }
        }
    }

    #[test]
    fn moved_lock_accepts_its_token() {
        let sched = SimScheduler::new();
        let lock = Plain::new(&sched);
        let token = lock.acquire().unwrap();
        let moved = Box::new(lock);
        moved.release(token).unwrap();
        assert!(!moved.is_locked());
    }
}

#[cfg(all(loom, test))]
mod model {
    use super::Plain;
    use crate::loom::models;

    #[test]
    fn lock_join() {
        models::lock_join(Plain::new);
    }
}
