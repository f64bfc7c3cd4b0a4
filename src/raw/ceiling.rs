use core::fmt::{self, Debug, Formatter};

use crate::cfg::raw::RawLock;
use crate::error::Result;
use crate::priority::Priority;
use crate::registry::LockKind;
use crate::sched::Scheduler;

use super::{LockId, PriorityLock, Token};

/// A static priority ceiling lock.
///
/// Every thread raises itself to the configured ceiling before it even tries
/// the lock, and drops back to its original priority after releasing. With a
/// ceiling that dominates every possible contender, a holder can never be
/// preempted by a thread that would then block on it.
///
/// No owner bookkeeping is needed, so there is no metadata lock.
///
/// # Example
///
/// ```
/// use cb2lock::raw::Ceiling;
/// use cb2lock::sched::{Scheduler, SimScheduler};
/// use cb2lock::{Priority, PriorityLock};
///
/// let sched = SimScheduler::new();
/// let lock = Ceiling::new(&sched, Priority::HIGHEST);
/// let token = lock.acquire().unwrap();
/// assert_eq!(sched.priority(token.tid()).unwrap(), Priority::HIGHEST);
/// lock.release(token).unwrap();
/// assert_eq!(sched.priority(sched.current()).unwrap(), Priority::NEUTRAL);
/// ```
pub struct Ceiling<S> {
    id: LockId,
    sched: S,
    ceiling: Priority,
    main: RawLock,
}

impl<S: Scheduler> Ceiling<S> {
    /// Creates a new, unlocked ceiling lock.
    pub fn new(sched: S, ceiling: Priority) -> Self {
        Self { id: LockId::next(), sched, ceiling, main: RawLock::new() }
    }

    /// Returns the configured ceiling.
    #[must_use]
    pub const fn ceiling(&self) -> Priority {
        self.ceiling
    }

    /// Returns the scheduler this lock consults.
    pub fn scheduler(&self) -> &S {
        &self.sched
    }
}

impl<S: Scheduler> PriorityLock for Ceiling<S> {
    fn kind(&self) -> LockKind {
        LockKind::Ceiling
    }

    fn acquire(&self) -> Result<Token> {
        let me = self.sched.current();
        let original = self.sched.priority(me)?;
        self.sched.set_priority(me, self.ceiling)?;
        tracing::trace!(tid = %me, ceiling = %self.ceiling, "raised to ceiling");
        self.main.lock();
        Ok(Token::new(self.id, me, Some(original)))
    }

    fn release(&self, token: Token) -> Result<()> {
        token.check(self.id);
        // SAFETY: The token proves the main lock is held, and it is consumed.
        unsafe { self.main.unlock() };
        tracing::trace!(tid = %token.tid, "released");
        match token.original {
            Some(original) => self.sched.set_priority(token.tid, original),
            None => Ok(()),
        }
    }

    fn is_locked(&self) -> bool {
        self.main.is_locked()
    }
}

impl<S> Debug for Ceiling<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ceiling").field("ceiling", &self.ceiling).finish_non_exhaustive()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    use super::Ceiling;
    use crate::error::Error;
    use crate::priority::Priority;
    use crate::raw::PriorityLock;
    use crate::sched::{Scheduler, SimScheduler};
    use crate::test::tests;

    type Lock = Ceiling<Arc<SimScheduler>>;

    fn highest(sched: Arc<SimScheduler>) -> Lock {
        Ceiling::new(sched, Priority::HIGHEST)
    }

    #[test]
    fn lots_and_lots_acquire() {
        tests::lots_and_lots_acquire::<Lock>(highest);
    }

    #[test]
    fn priority_restored() {
        tests::priority_restored::<Lock>(highest);
    }

    #[test]
    fn contention_terminates() {
        tests::contention_terminates::<Lock>(highest);
    }

    #[test]
    fn smoke() {
        tests::smoke::<Lock>(highest);
    }

    #[test]
    fn lots_and_lots_mutex() {
        tests::lots_and_lots_mutex::<Lock>(highest);
    }

    #[test]
    fn destroy_while_held() {
        tests::destroy_while_held::<Lock>(highest);
    }

    #[test]
    fn holder_runs_at_ceiling() {
        const THREADS: usize = 6;
        const ITERS: usize = 200;
        let ceiling = Priority::new(-5).unwrap();
        let sched = Arc::new(SimScheduler::new());
        let lock = Arc::new(Ceiling::new(Arc::clone(&sched), ceiling));
        let checked = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let (lock, sched, checked) = (lock.clone(), sched.clone(), checked.clone());
                thread::spawn(move || {
                    let raw = i32::try_from(i).unwrap() * 7 - 20;
                    let me = sched.assign(Priority::new(raw).unwrap());
                    for _ in 0..ITERS {
                        let token = lock.acquire().unwrap();
                        assert_eq!(sched.priority(me).unwrap(), ceiling);
                        checked.fetch_add(1, Ordering::Relaxed);
                        lock.release(token).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(checked.load(Ordering::Relaxed), THREADS * ITERS);
    }

    #[test]
    fn unprivileged_ceiling_fails_before_locking() {
        let sched = SimScheduler::unprivileged();
        let lock = Ceiling::new(&sched, Priority::HIGHEST);
        let err = lock.acquire().unwrap_err();
        assert!(matches!(err, Error::PermissionDenied { .. }));
        assert!(!lock.is_locked());
        assert_eq!(sched.priority(sched.current()).unwrap(), Priority::NEUTRAL);
    }
}

#[cfg(all(loom, test))]
mod model {
    use super::Ceiling;
    use crate::loom::models;
    use crate::priority::Priority;

    #[test]
    fn lock_join() {
        models::lock_join(|sched| Ceiling::new(sched, Priority::HIGHEST));
    }
}
