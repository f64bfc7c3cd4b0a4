//! Mutual exclusion locks that mitigate [priority inversion], for comparing
//! mitigation strategies under real contention.
//!
//! Priority inversion happens when a low priority thread holds a lock that a
//! high priority thread needs, while medium priority threads keep the holder
//! from running. This crate provides four lock variants behind a common
//! [`PriorityLock`] contract:
//!
//! - [`raw::Plain`]: no mitigation at all, the baseline;
//! - [`raw::Inherit`]: [priority inheritance], a blocked requester always
//!   raises a less urgent owner to its own priority;
//! - [`raw::Ceiling`]: a static [priority ceiling], every holder runs at a
//!   fixed, dominating priority; and
//! - [`raw::Cb2`]: lottery based donation, a requester raises the owner only
//!   if it wins a draw weighted by both priorities, a fixed pool of bystander
//!   tickets and its own donation history.
//!
//! Thread priorities follow the Unix nice scale: a *smaller* [`Priority`]
//! is *more* urgent, from [`Priority::HIGHEST`] (-20) to
//! [`Priority::LOWEST`] (19). They are read and written through a
//! [`sched::Scheduler`]: [`sched::OsScheduler`] talks to the operating system
//! (Linux only), [`sched::SimScheduler`] keeps an in-process table and is
//! what the examples below use.
//!
//! ## Locking with a raw priority lock
//!
//! A raw lock does not protect any data. Acquiring returns a [`Token`] that
//! records the caller's priority before acquiring, it must be handed back to
//! `release` on the same thread.
//!
//! ```
//! use std::sync::Arc;
//! use std::thread;
//!
//! use cb2lock::raw::Inherit;
//! use cb2lock::sched::{Scheduler, SimScheduler};
//! use cb2lock::{Priority, PriorityLock};
//!
//! let sched = Arc::new(SimScheduler::new());
//! let lock = Arc::new(Inherit::new(Arc::clone(&sched)));
//!
//! let low = sched.assign(Priority::LOWEST);
//! let token = lock.acquire().unwrap();
//!
//! let (c_lock, c_sched) = (Arc::clone(&lock), Arc::clone(&sched));
//! let waiter = thread::spawn(move || {
//!     c_sched.assign(Priority::HIGHEST);
//!     let token = c_lock.acquire().unwrap();
//!     c_lock.release(token).unwrap();
//! });
//!
//! // The waiter lends its priority to the holder.
//! while sched.priority(low).unwrap() != Priority::HIGHEST {
//!     thread::yield_now();
//! }
//! lock.release(token).unwrap();
//! assert_eq!(sched.priority(low).unwrap(), Priority::LOWEST);
//! waiter.join().expect("thread::spawn failed");
//! ```
//!
//! ## Locking with a mutex
//!
//! [`Mutex`] wraps any variant and protects a value, releasing the lock when
//! its [`MutexGuard`] goes out of scope.
//!
//! ```
//! use cb2lock::raw::{Cb2, Tickets};
//! use cb2lock::sched::SimScheduler;
//! use cb2lock::Mutex;
//!
//! let tickets = Tickets::new(10).unwrap();
//! let lock: Cb2<_> = Cb2::new(SimScheduler::new(), tickets);
//! let mutex = Mutex::new(lock, 0);
//! *mutex.lock().unwrap() += 1;
//! assert_eq!(mutex.into_inner(), 1);
//! ```
//!
//! ## Selecting a variant at runtime
//!
//! [`RuntimeLock::initialize`] builds a variant from a [`LockKind`] and a
//! [`LockAttr`], which is how an experiment harness would pick one from its
//! command line. See the [`registry`] module.
//!
//! ## Logging
//!
//! Lock transitions are reported through [`tracing`]: acquisitions and
//! releases at the `trace` level, priority donations, lottery draws and
//! reserved CPU demotions at the `debug` level. No subscriber is installed.
//!
//! [priority inversion]: https://en.wikipedia.org/wiki/Priority_inversion
//! [priority inheritance]: https://en.wikipedia.org/wiki/Priority_inheritance
//! [priority ceiling]: https://en.wikipedia.org/wiki/Priority_ceiling_protocol
//! [`tracing`]: https://docs.rs/tracing

#![allow(clippy::doc_markdown)]
#![allow(clippy::inline_always)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]
#![warn(missing_docs)]
#![warn(rust_2024_compatibility)]
#![warn(clippy::undocumented_unsafe_blocks)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod error;
pub mod history;
pub mod priority;
pub mod raw;
pub mod registry;
pub mod relax;
pub mod sched;

mod mutex;

pub(crate) mod cfg;

#[cfg(test)]
pub(crate) mod test;

#[cfg(all(loom, test))]
#[cfg(not(tarpaulin))]
pub(crate) mod loom;

pub use error::{Error, Result};
pub use history::{DonationHistory, Donations};
pub use mutex::{Mutex, MutexGuard};
pub use priority::{Priority, Tid};
pub use raw::{PriorityLock, Token};
pub use registry::{LockAttr, LockKind, RuntimeLock};
