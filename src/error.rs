//! Error types shared by every lock variant and priority accessor.
//!
//! Errors fall in three classes: configuration errors raised while
//! initializing a lock, priority accessor errors raised while reading or
//! writing a thread's scheduling priority, and primitive errors raised while
//! tearing a lock down.

use std::io;

use thiserror::Error;

use crate::priority::{Priority, Tid};
use crate::registry::LockKind;

/// A specialized [`Result`](core::result::Result) type for this crate.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors that can occur while initializing, acquiring, releasing or
/// destroying a priority aware lock.
#[derive(Debug, Error)]
pub enum Error {
    /// A lock variant was initialized without a required attribute.
    #[error("{kind} lock requires a {field} attribute")]
    MissingAttr {
        /// The variant being initialized.
        kind: LockKind,
        /// The name of the missing attribute.
        field: &'static str,
    },

    /// The CB2 ticket pool must be strictly positive.
    #[error("ticket pool must be positive, got {0}")]
    InvalidTickets(i64),

    /// A priority value outside of the `[-20, 19]` scale.
    #[error("priority {0} is outside of [{min}, {max}]", min = Priority::HIGHEST, max = Priority::LOWEST)]
    PriorityOutOfRange(i32),

    /// The caller lacks the privilege to set the requested priority.
    #[error("permission denied setting priority of thread {tid} to {priority}")]
    PermissionDenied {
        /// The target thread.
        tid: Tid,
        /// The priority that was refused.
        priority: Priority,
    },

    /// The target thread does not exist (anymore).
    #[error("failed to {op} priority: thread {tid} not found")]
    NoSuchThread {
        /// The accessor operation that failed.
        op: &'static str,
        /// The target thread.
        tid: Tid,
    },

    /// Any other failure reported by the operating system.
    #[error("failed to {op} priority of thread {tid}: {source}")]
    Os {
        /// The accessor operation that failed.
        op: &'static str,
        /// The target thread.
        tid: Tid,
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },

    /// The lock is still held and cannot be destroyed.
    #[error("{0} lock is still held")]
    Busy(LockKind),
}

impl Error {
    /// Returns `true` if this is a configuration error raised at
    /// initialization time.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(
            self,
            Self::MissingAttr { .. } | Self::InvalidTickets(_) | Self::PriorityOutOfRange(_)
        )
    }

    /// Returns `true` if this error was reported by a priority accessor.
    #[must_use]
    pub const fn is_accessor(&self) -> bool {
        matches!(self, Self::PermissionDenied { .. } | Self::NoSuchThread { .. } | Self::Os { .. })
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use super::Error;
    use crate::priority::{Priority, Tid};
    use crate::registry::LockKind;

    #[test]
    fn messages_name_the_failing_call() {
        let err = Error::MissingAttr { kind: LockKind::Ceiling, field: "ceiling" };
        assert_eq!(err.to_string(), "ceiling lock requires a ceiling attribute");

        let err = Error::NoSuchThread { op: "get", tid: Tid::from_raw(42) };
        assert_eq!(err.to_string(), "failed to get priority: thread 42 not found");

        let err = Error::PermissionDenied { tid: Tid::from_raw(7), priority: Priority::HIGHEST };
        assert_eq!(err.to_string(), "permission denied setting priority of thread 7 to -20");

        let err = Error::PriorityOutOfRange(25);
        assert_eq!(err.to_string(), "priority 25 is outside of [-20, 19]");
    }

    #[test]
    fn classes() {
        assert!(Error::InvalidTickets(0).is_config());
        assert!(!Error::InvalidTickets(0).is_accessor());
        assert!(Error::NoSuchThread { op: "set", tid: Tid::from_raw(1) }.is_accessor());
        assert!(!Error::Busy(LockKind::Plain).is_config());
        assert!(!Error::Busy(LockKind::Plain).is_accessor());
    }
}
