use std::io;

use nix::errno::Errno;
use nix::unistd::gettid;

use super::Scheduler;
use crate::error::{Error, Result};
use crate::priority::{Priority, Tid};

/// A [`Scheduler`] backed by the Linux per-thread nice value.
///
/// Priorities are read and written with `getpriority(2)` and `setpriority(2)`
/// on `PRIO_PROCESS`, which on Linux addresses a single thread when given a
/// thread id. Making a thread more urgent than [`Priority::NEUTRAL`] requires
/// `CAP_SYS_NICE` or a suitable `RLIMIT_NICE`.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsScheduler;

impl OsScheduler {
    /// Creates a new `OsScheduler`.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

fn errno_error(op: &'static str, tid: Tid, priority: Option<Priority>, errno: Errno) -> Error {
    match (errno, priority) {
        (Errno::EPERM | Errno::EACCES, Some(priority)) => Error::PermissionDenied { tid, priority },
        (Errno::ESRCH, _) => Error::NoSuchThread { op, tid },
        _ => Error::Os { op, tid, source: io::Error::from(errno) },
    }
}

impl Scheduler for OsScheduler {
    fn current(&self) -> Tid {
        Tid::from_raw(gettid().as_raw())
    }

    fn priority(&self, tid: Tid) -> Result<Priority> {
        // `-1` is a valid nice value, errno is the only failure signal.
        Errno::clear();
        // SAFETY: `getpriority` has no memory safety preconditions.
        let raw = unsafe { libc::getpriority(libc::PRIO_PROCESS, tid.as_raw() as libc::id_t) };
        if raw == -1 {
            let errno = Errno::last();
            if errno != Errno::UnknownErrno {
                return Err(errno_error("get", tid, None, errno));
            }
        }
        Priority::new(raw)
    }

    fn set_priority(&self, tid: Tid, priority: Priority) -> Result<()> {
        let who = tid.as_raw() as libc::id_t;
        // SAFETY: `setpriority` has no memory safety preconditions.
        let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, who, priority.get()) };
        if rc == -1 {
            return Err(errno_error("set", tid, Some(priority), Errno::last()));
        }
        Ok(())
    }

    fn current_cpu(&self) -> Option<usize> {
        // SAFETY: `sched_getcpu` has no memory safety preconditions.
        let cpu = unsafe { libc::sched_getcpu() };
        usize::try_from(cpu).ok()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use super::OsScheduler;
    use crate::error::Error;
    use crate::priority::Tid;
    use crate::sched::Scheduler;

    // Far above any `pid_max` the kernel accepts.
    const MISSING: Tid = Tid::from_raw(0x3fff_ffff);

    #[test]
    fn reads_own_priority() {
        let sched = OsScheduler::new();
        let me = sched.current();
        assert!(me.as_raw() > 0);
        let priority = sched.priority(me).unwrap();
        // Rewriting the current value never needs privileges.
        sched.set_priority(me, priority).unwrap();
        assert_eq!(sched.priority(me).unwrap(), priority);
    }

    #[test]
    fn missing_thread() {
        let sched = OsScheduler::new();
        let err = sched.priority(MISSING).unwrap_err();
        assert!(matches!(err, Error::NoSuchThread { op: "get", .. }), "{err}");
    }

    #[test]
    fn thread_ids_are_per_thread() {
        let sched = OsScheduler::new();
        let me = sched.current();
        let other = std::thread::spawn(move || OsScheduler::new().current()).join().unwrap();
        assert_ne!(me, other);
        assert!(sched.current_cpu().is_some());
    }
}
