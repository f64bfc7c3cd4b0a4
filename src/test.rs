/// Generic test cases shared by every lock variant.
///
/// Each case takes a factory that builds the lock under test on top of a
/// shared [`SimScheduler`], so that priorities can be assigned and inspected
/// without elevated privileges.
#[cfg(all(not(loom), test))]
pub mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::channel;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use crate::error::{Error, Result};
    use crate::mutex::Mutex;
    use crate::priority::{Priority, Tid};
    use crate::raw::PriorityLock;
    use crate::sched::{Scheduler, SimScheduler};

    /// Builds a lock on top of a simulated scheduler.
    pub type Factory<L> = fn(Arc<SimScheduler>) -> L;

    /// A simulated scheduler that refuses to demote anyone to the lowest
    /// priority, so the reserved CPU policy always fails.
    #[derive(Debug, Default)]
    pub struct NoDemotion(pub SimScheduler);

    impl Scheduler for NoDemotion {
        fn current(&self) -> Tid {
            self.0.current()
        }

        fn priority(&self, tid: Tid) -> Result<Priority> {
            self.0.priority(tid)
        }

        fn set_priority(&self, tid: Tid, priority: Priority) -> Result<()> {
            if priority == Priority::LOWEST {
                return Err(Error::PermissionDenied { tid, priority });
            }
            self.0.set_priority(tid, priority)
        }

        fn current_cpu(&self) -> Option<usize> {
            self.0.current_cpu()
        }
    }

    const THREADS: usize = 8;
    const ITERS: usize = 500;

    fn setup<L>(factory: Factory<L>) -> (Arc<SimScheduler>, Arc<L>) {
        let sched = Arc::new(SimScheduler::new());
        let lock = Arc::new(factory(Arc::clone(&sched)));
        (sched, lock)
    }

    /// Spins until `cond` holds, failing the test after a generous deadline.
    pub fn wait_until<F: FnMut() -> bool>(mut cond: F) {
        let deadline = Instant::now() + Duration::from_secs(30);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::yield_now();
        }
    }

    pub fn smoke<L: PriorityLock>(factory: Factory<L>) {
        let (_, lock) = setup(factory);
        for _ in 0..3 {
            let token = lock.acquire().unwrap();
            assert!(lock.is_locked());
            lock.release(token).unwrap();
            assert!(!lock.is_locked());
        }
    }

    /// No two threads are ever inside the critical section at once.
    pub fn lots_and_lots_acquire<L: PriorityLock + 'static>(factory: Factory<L>) {
        let (_, lock) = setup(factory);
        let inside = Arc::new(AtomicUsize::new(0));
        let total = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = channel();
        for _ in 0..THREADS {
            let (lock, inside, total, tx) = (lock.clone(), inside.clone(), total.clone(), tx.clone());
            thread::spawn(move || {
                for _ in 0..ITERS {
                    let token = lock.acquire().unwrap();
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    total.fetch_add(1, Ordering::Relaxed);
                    assert_eq!(inside.fetch_sub(1, Ordering::SeqCst), 1);
                    lock.release(token).unwrap();
                }
                tx.send(()).unwrap();
            });
        }
        drop(tx);
        for _ in 0..THREADS {
            rx.recv().unwrap();
        }
        assert_eq!(total.load(Ordering::Relaxed), THREADS * ITERS);
        assert!(!lock.is_locked());
    }

    /// Every thread observes its own priority unchanged after each release.
    pub fn priority_restored<L: PriorityLock + 'static>(factory: Factory<L>) {
        let (sched, lock) = setup(factory);
        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let (lock, sched) = (lock.clone(), sched.clone());
                thread::spawn(move || {
                    let raw = i32::try_from(i * 5).unwrap() - 20;
                    let priority = Priority::new(raw).unwrap();
                    let me = sched.assign(priority);
                    for _ in 0..ITERS {
                        let before = sched.priority(me).unwrap();
                        let token = lock.acquire().unwrap();
                        assert_eq!(token.original_priority().unwrap_or(before), before);
                        lock.release(token).unwrap();
                        assert_eq!(sched.priority(me).unwrap(), before);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    /// Contenders that pile up behind a slow holder all get through.
    pub fn contention_terminates<L: PriorityLock + 'static>(factory: Factory<L>) {
        let (_, lock) = setup(factory);
        let token = lock.acquire().unwrap();
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let lock = lock.clone();
                thread::spawn(move || {
                    let token = lock.acquire().unwrap();
                    lock.release(token).unwrap();
                })
            })
            .collect();
        thread::sleep(Duration::from_millis(10));
        lock.release(token).unwrap();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(!lock.is_locked());
    }

    pub fn lots_and_lots_mutex<L: PriorityLock + 'static>(factory: Factory<L>) {
        let sched = Arc::new(SimScheduler::new());
        let mutex = Arc::new(Mutex::new(factory(sched), 0usize));
        let (tx, rx) = channel();
        for _ in 0..THREADS {
            let (mutex, tx) = (mutex.clone(), tx.clone());
            thread::spawn(move || {
                for _ in 0..ITERS {
                    *mutex.lock().unwrap() += 1;
                }
                tx.send(()).unwrap();
            });
        }
        drop(tx);
        for _ in 0..THREADS {
            rx.recv().unwrap();
        }
        assert_eq!(*mutex.lock().unwrap(), THREADS * ITERS);
    }

    pub fn destroy_while_held<L: PriorityLock>(factory: Factory<L>) {
        let sched = Arc::new(SimScheduler::new());
        let (held, idle) = (factory(Arc::clone(&sched)), factory(sched));
        let token = held.acquire().unwrap();
        let kind = held.kind();
        drop(token);
        let err = held.destroy().unwrap_err();
        assert!(matches!(err, Error::Busy(k) if k == kind));

        let token = idle.acquire().unwrap();
        idle.release(token).unwrap();
        idle.destroy().unwrap();
    }

    /// A lowest priority holder contended by a highest priority and a neutral
    /// requester runs at the highest priority before it releases.
    pub fn low_priority_holder_boosted<L: PriorityLock + 'static>(factory: Factory<L>) {
        let (sched, lock) = setup(factory);
        let a = sched.assign(Priority::LOWEST);
        let token = lock.acquire().unwrap();

        let handles: Vec<_> = [Priority::HIGHEST, Priority::NEUTRAL]
            .into_iter()
            .map(|priority| {
                let (lock, sched) = (lock.clone(), sched.clone());
                thread::spawn(move || {
                    let me = sched.assign(priority);
                    let token = lock.acquire().unwrap();
                    lock.release(token).unwrap();
                    assert_eq!(sched.priority(me).unwrap(), priority);
                })
            })
            .collect();
        wait_until(|| sched.priority(a).unwrap() == Priority::HIGHEST);
        lock.release(token).unwrap();
        assert_eq!(sched.priority(a).unwrap(), Priority::LOWEST);
        for handle in handles {
            handle.join().unwrap();
        }
    }

    /// A contender fails when the owner it would inspect is gone, and the
    /// lock stays with that owner until it releases.
    pub fn exited_owner_fails_contender<L: PriorityLock + 'static>(factory: Factory<L>) {
        let (sched, lock) = setup(factory);
        let (tx, rx) = channel();
        let (done_tx, done_rx) = channel::<()>();
        let (h_lock, h_sched) = (lock.clone(), sched.clone());
        let holder = thread::spawn(move || {
            h_sched.assign(Priority::LOWEST);
            let token = h_lock.acquire().unwrap();
            h_sched.exit();
            tx.send(()).unwrap();
            done_rx.recv().unwrap();
            let err = h_lock.release(token).unwrap_err();
            assert!(matches!(err, Error::NoSuchThread { op: "set", .. }), "{err}");
        });

        sched.assign(Priority::HIGHEST);
        rx.recv().unwrap();
        let err = lock.acquire().unwrap_err();
        assert!(matches!(err, Error::NoSuchThread { op: "get", .. }), "{err}");
        assert!(lock.is_locked());
        done_tx.send(()).unwrap();
        holder.join().unwrap();
        assert!(!lock.is_locked());

        let token = lock.acquire().unwrap();
        lock.release(token).unwrap();
        assert!(!lock.is_locked());
    }

    /// A holder that cannot be demoted on the reserved CPU gives the lock
    /// back, whether it got it right away or after blocking.
    pub fn failed_claim_unlocks<L: PriorityLock + 'static>(factory: fn(Arc<NoDemotion>) -> L) {
        let sched = Arc::new(NoDemotion::default());
        let lock = Arc::new(factory(Arc::clone(&sched)));
        sched.0.pin(0);
        let err = lock.acquire().unwrap_err();
        assert!(matches!(err, Error::PermissionDenied { priority: Priority::LOWEST, .. }));
        assert!(!lock.is_locked());

        let (tx, rx) = channel();
        let h_lock = lock.clone();
        let holder = thread::spawn(move || {
            let token = h_lock.acquire().unwrap();
            tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(20));
            h_lock.release(token).unwrap();
        });
        rx.recv().unwrap();
        let err = lock.acquire().unwrap_err();
        assert!(matches!(err, Error::PermissionDenied { .. }));
        holder.join().unwrap();
        assert!(!lock.is_locked());

        let c_lock = lock.clone();
        thread::spawn(move || {
            let token = c_lock.acquire().unwrap();
            c_lock.release(token).unwrap();
        })
        .join()
        .unwrap();
        assert!(!lock.is_locked());
    }
}
