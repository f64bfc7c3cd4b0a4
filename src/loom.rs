use loom::sync::atomic::{AtomicBool, Ordering};

/// A Loom instrumented counterpart of the guardless main lock.
pub struct RawLock(AtomicBool);

impl RawLock {
    pub fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    pub fn lock(&self) {
        while !self.try_lock() {
            loom::thread::yield_now();
        }
    }

    pub fn try_lock(&self) -> bool {
        self.0.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed).is_ok()
    }

    /// # Safety
    ///
    /// The lock must be held.
    pub unsafe fn unlock(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// A Loom mutex with the non poisoning signature of `parking_lot`'s.
pub struct Mutex<T>(loom::sync::Mutex<T>);

pub type MutexGuard<'a, T> = loom::sync::MutexGuard<'a, T>;

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Self(loom::sync::Mutex::new(value))
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.0.lock().unwrap()
    }
}

pub mod models {
    use core::array;

    use loom::cell::UnsafeCell;
    use loom::{model, thread};

    use crate::raw::PriorityLock;
    use crate::sched::SimScheduler;

    type Int = usize;
    const THREADS: Int = 2;

    /// Builds a lock on top of a simulated scheduler.
    pub type Factory<L> = fn(std::sync::Arc<SimScheduler>) -> L;

    struct Shared<L> {
        lock: L,
        data: UnsafeCell<Int>,
    }

    // SAFETY: `data` is only accessed while `lock` is held.
    unsafe impl<L: PriorityLock> Sync for Shared<L> {}

    /// Increments the shared integer inside the critical section.
    fn inc<L: PriorityLock>(shared: &Shared<L>) {
        let token = shared.lock.acquire().unwrap();
        // SAFETY: The lock is held.
        shared.data.with_mut(|data| unsafe { *data += 1 });
        shared.lock.release(token).unwrap();
    }

    /// Evaluates that concurrent `acquire` calls will serialize all mutations
    /// against the shared data, therefore no data races.
    pub fn lock_join<L: PriorityLock + 'static>(factory: Factory<L>) {
        model(move || {
            let sched = std::sync::Arc::new(SimScheduler::new());
            let shared = loom::sync::Arc::new(Shared { lock: factory(sched), data: UnsafeCell::new(0) });
            let handles: [_; THREADS] = array::from_fn(|_| {
                let shared = loom::sync::Arc::clone(&shared);
                thread::spawn(move || inc(&shared))
            });
            for handle in handles {
                handle.join().unwrap();
            }
            // SAFETY: Every other thread was joined.
            let data = shared.data.with(|data| unsafe { *data });
            assert_eq!(THREADS, data);
            assert!(!shared.lock.is_locked());
        });
    }
}
