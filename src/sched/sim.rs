use core::fmt::{self, Debug, Formatter};

use super::Scheduler;
use crate::cfg::sync::Mutex;
use crate::cfg::thread::{self, ThreadId};
use crate::error::{Error, Result};
use crate::priority::{Priority, Tid};

/// A priority change observed by a [`SimScheduler`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PriorityEvent {
    /// The thread that requested the change.
    pub by: Tid,
    /// The thread whose priority changed.
    pub target: Tid,
    /// The priority before the change.
    pub from: Priority,
    /// The priority after the change.
    pub to: Priority,
}

struct SimThread {
    key: ThreadId,
    tid: Tid,
    priority: Priority,
    cpu: usize,
    exited: bool,
}

struct SimState {
    threads: Vec<SimThread>,
    events: Vec<PriorityEvent>,
    next_tid: i32,
}

impl SimState {
    /// Returns the record of the calling thread, registering it on first use.
    fn current(&mut self) -> &mut SimThread {
        let key = thread::current().id();
        let index = match self.threads.iter().position(|t| t.key == key) {
            Some(index) => index,
            None => {
                let tid = Tid::from_raw(self.next_tid);
                self.next_tid += 1;
                let cpu = SimScheduler::DEFAULT_CPU;
                let priority = Priority::NEUTRAL;
                self.threads.push(SimThread { key, tid, priority, cpu, exited: false });
                self.threads.len() - 1
            }
        };
        &mut self.threads[index]
    }

    fn live(&mut self, op: &'static str, tid: Tid) -> Result<&mut SimThread> {
        self.threads
            .iter_mut()
            .find(|t| t.tid == tid && !t.exited)
            .ok_or(Error::NoSuchThread { op, tid })
    }
}

/// An in-process [`Scheduler`] that records priorities in a table instead of
/// changing real OS scheduling parameters.
///
/// Threads are registered lazily the first time they touch the scheduler,
/// starting at [`Priority::NEUTRAL`] on CPU [`SimScheduler::DEFAULT_CPU`].
/// Every successful [`set_priority`] call is appended to an event log that can
/// be inspected with [`events`].
///
/// A privileged scheduler accepts any priority. An unprivileged one rejects
/// priorities more urgent than neutral, just like an OS would for a process
/// without `CAP_SYS_NICE`.
///
/// # Example
///
/// ```
/// use cb2lock::sched::{Scheduler, SimScheduler};
/// use cb2lock::Priority;
///
/// let sched = SimScheduler::unprivileged();
/// let me = sched.current();
/// assert_eq!(sched.priority(me).unwrap(), Priority::NEUTRAL);
/// assert!(sched.set_priority(me, Priority::HIGHEST).is_err());
/// sched.set_priority(me, Priority::LOWEST).unwrap();
/// assert_eq!(sched.events().len(), 1);
/// ```
///
/// [`set_priority`]: Scheduler::set_priority
/// [`events`]: SimScheduler::events
pub struct SimScheduler {
    state: Mutex<SimState>,
    privileged: bool,
}

impl SimScheduler {
    /// The CPU new threads are placed on.
    pub const DEFAULT_CPU: usize = 1;

    /// The first thread id handed out.
    const FIRST_TID: i32 = 1000;

    /// Creates a privileged simulated scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::with_privilege(true)
    }

    /// Creates a simulated scheduler that refuses priorities more urgent than
    /// [`Priority::NEUTRAL`].
    #[must_use]
    pub fn unprivileged() -> Self {
        Self::with_privilege(false)
    }

    fn with_privilege(privileged: bool) -> Self {
        let state = SimState { threads: Vec::new(), events: Vec::new(), next_tid: Self::FIRST_TID };
        Self { state: Mutex::new(state), privileged }
    }

    /// Moves the calling thread to `cpu`.
    pub fn pin(&self, cpu: usize) {
        self.state.lock().current().cpu = cpu;
    }

    /// Sets the calling thread's priority, bypassing privilege checks and the
    /// event log.
    ///
    /// This models a harness that assigns priorities before the experiment
    /// starts.
    pub fn assign(&self, priority: Priority) -> Tid {
        let mut state = self.state.lock();
        let current = state.current();
        current.priority = priority;
        current.tid
    }

    /// Marks the calling thread as exited. Further accesses to its priority
    /// fail with [`Error::NoSuchThread`].
    pub fn exit(&self) {
        self.state.lock().current().exited = true;
    }

    /// Returns a copy of every priority change recorded so far.
    #[must_use]
    pub fn events(&self) -> Vec<PriorityEvent> {
        self.state.lock().events.clone()
    }

    /// Discards the recorded priority changes.
    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }
}

impl Default for SimScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for SimScheduler {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SimScheduler")
            .field("privileged", &self.privileged)
            .field("threads", &state.threads.len())
            .field("events", &state.events.len())
            .finish()
    }
}

impl Scheduler for SimScheduler {
    fn current(&self) -> Tid {
        self.state.lock().current().tid
    }

    fn priority(&self, tid: Tid) -> Result<Priority> {
        self.state.lock().live("get", tid).map(|t| t.priority)
    }

    fn set_priority(&self, tid: Tid, priority: Priority) -> Result<()> {
        let mut state = self.state.lock();
        let by = state.current().tid;
        let target = state.live("set", tid)?;
        if !self.privileged && Priority::NEUTRAL.is_less_urgent_than(priority) {
            return Err(Error::PermissionDenied { tid, priority });
        }
        let from = target.priority;
        target.priority = priority;
        state.events.push(PriorityEvent { by, target: tid, from, to: priority });
        Ok(())
    }

    fn current_cpu(&self) -> Option<usize> {
        Some(self.state.lock().current().cpu)
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::Arc;
    use std::thread;

    use super::{PriorityEvent, SimScheduler};
    use crate::error::Error;
    use crate::priority::Priority;
    use crate::sched::Scheduler;

    #[test]
    fn threads_register_lazily() {
        let sched = Arc::new(SimScheduler::new());
        let me = sched.current();
        assert_eq!(sched.current(), me);
        let c_sched = Arc::clone(&sched);
        let other = thread::spawn(move || c_sched.current()).join().unwrap();
        assert_ne!(me, other);
        assert_eq!(sched.priority(other).unwrap(), Priority::NEUTRAL);
        assert_eq!(sched.current_cpu(), Some(SimScheduler::DEFAULT_CPU));
    }

    #[test]
    fn privilege_is_enforced() {
        let sched = SimScheduler::unprivileged();
        let me = sched.assign(Priority::LOWEST);
        let err = sched.set_priority(me, Priority::HIGHEST).unwrap_err();
        assert!(matches!(err, Error::PermissionDenied { .. }));
        sched.set_priority(me, Priority::NEUTRAL).unwrap();
        assert_eq!(sched.priority(me).unwrap(), Priority::NEUTRAL);
    }

    #[test]
    fn exited_threads_are_gone() {
        let sched = Arc::new(SimScheduler::new());
        let c_sched = Arc::clone(&sched);
        let tid = thread::spawn(move || {
            let tid = c_sched.current();
            c_sched.exit();
            tid
        })
        .join()
        .unwrap();
        let err = sched.priority(tid).unwrap_err();
        assert!(matches!(err, Error::NoSuchThread { op: "get", .. }));
        let err = sched.set_priority(tid, Priority::NEUTRAL).unwrap_err();
        assert!(matches!(err, Error::NoSuchThread { op: "set", .. }));
    }

    #[test]
    fn events_are_recorded() {
        let sched = SimScheduler::new();
        let me = sched.assign(Priority::LOWEST);
        sched.set_priority(me, Priority::HIGHEST).unwrap();
        let expected =
            PriorityEvent { by: me, target: me, from: Priority::LOWEST, to: Priority::HIGHEST };
        assert_eq!(sched.events(), [expected]);
        sched.clear_events();
        assert!(sched.events().is_empty());
    }

    #[test]
    fn pinning() {
        let sched = SimScheduler::new();
        sched.pin(0);
        assert_eq!(sched.current_cpu(), Some(0));
    }
}
