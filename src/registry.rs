//! Runtime selection of a lock variant.
//!
//! An experiment harness picks the variant from a tag, a string or an integer,
//! and hands it an attribute that carries the variant specific configuration.
//! [`RuntimeLock::initialize`] validates the pair and builds the lock.
//!
//! ```
//! use cb2lock::sched::SimScheduler;
//! use cb2lock::{LockAttr, LockKind, PriorityLock, RuntimeLock};
//!
//! let kind: LockKind = "cb2".parse().unwrap();
//! let attr = LockAttr::Tickets { pool: 10, seed: Some(42) };
//! let lock: RuntimeLock<_> = RuntimeLock::initialize(kind, attr, SimScheduler::new()).unwrap();
//! assert_eq!(lock.description(), "lottery based priority donation");
//!
//! let token = lock.acquire().unwrap();
//! lock.release(token).unwrap();
//! lock.destroy().unwrap();
//! ```

use core::fmt::{self, Debug, Formatter};

use strum::{Display, EnumIter, EnumString, FromRepr};

use crate::error::{Error, Result};
use crate::priority::{Priority, Tid};
use crate::raw::{Cb2, Ceiling, Inherit, Plain, PriorityLock, Tickets, Token};
use crate::relax::{Relax, Yield};
use crate::sched::Scheduler;

/// The tag of a lock variant.
///
/// Parses case insensitively from its name, with `none` accepted for
/// [`LockKind::Plain`] and `protect` for [`LockKind::Ceiling`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString, EnumIter, FromRepr)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[repr(i32)]
pub enum LockKind {
    /// No priority inversion mitigation.
    #[strum(to_string = "plain", serialize = "none")]
    Plain = 0,
    /// Deterministic priority inheritance.
    Inherit = 1,
    /// Static priority ceiling.
    #[strum(to_string = "ceiling", serialize = "protect")]
    Ceiling = 2,
    /// Lottery based priority donation.
    Cb2 = 3,
}

impl LockKind {
    /// Returns the variant with the numeric tag `tag`.
    #[must_use]
    pub fn from_tag(tag: i32) -> Option<Self> {
        Self::from_repr(tag)
    }

    /// Returns the numeric tag of this variant.
    #[must_use]
    pub const fn tag(self) -> i32 {
        self as i32
    }

    /// Returns a human readable name of the mitigation this variant applies.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::Plain => "no priority inversion mitigation",
            Self::Inherit => "priority inheritance",
            Self::Ceiling => "priority ceiling",
            Self::Cb2 => "lottery based priority donation",
        }
    }
}

/// The configuration handed to [`RuntimeLock::initialize`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LockAttr {
    /// No configuration, as required by [`LockKind::Plain`] and
    /// [`LockKind::Inherit`].
    #[default]
    Unused,
    /// The ceiling of a [`LockKind::Ceiling`] lock.
    Ceiling(Priority),
    /// The ticket pool of a [`LockKind::Cb2`] lock, with an optional seed for
    /// its lottery.
    Tickets {
        /// Bystander tickets, must be strictly positive.
        pool: i64,
        /// Lottery seed, drawn from entropy when `None`.
        seed: Option<u64>,
    },
}

impl LockAttr {
    /// Builds a ceiling attribute from a raw priority value.
    pub fn ceiling(raw: i32) -> Result<Self> {
        Priority::new(raw).map(Self::Ceiling)
    }
}

/// A lock variant selected at runtime.
pub enum RuntimeLock<S, R = Yield> {
    /// See [`Plain`].
    Plain(Plain<S>),
    /// See [`Inherit`].
    Inherit(Inherit<S>),
    /// See [`Ceiling`].
    Ceiling(Ceiling<S>),
    /// See [`Cb2`].
    Cb2(Cb2<S, R>),
}

impl<S: Scheduler, R> RuntimeLock<S, R> {
    /// Builds the `kind` variant from `attr`.
    ///
    /// Fails with [`Error::MissingAttr`] if `kind` requires an attribute that
    /// `attr` does not carry, and with [`Error::InvalidTickets`] on a non
    /// positive ticket pool. Variants without configuration ignore `attr`.
    pub fn initialize(kind: LockKind, attr: LockAttr, sched: S) -> Result<Self> {
        let lock = match (kind, attr) {
            (LockKind::Plain, _) => Self::Plain(Plain::new(sched)),
            (LockKind::Inherit, _) => Self::Inherit(Inherit::new(sched)),
            (LockKind::Ceiling, LockAttr::Ceiling(ceiling)) => {
                Self::Ceiling(Ceiling::new(sched, ceiling))
            }
            (LockKind::Ceiling, _) => return Err(Error::MissingAttr { kind, field: "ceiling" }),
            (LockKind::Cb2, LockAttr::Tickets { pool, seed }) => {
                let tickets = Tickets::new(pool)?;
                let tickets = seed.map_or(tickets, |seed| tickets.seed(seed));
                Self::Cb2(Cb2::new(sched, tickets))
            }
            (LockKind::Cb2, _) => return Err(Error::MissingAttr { kind, field: "tickets" }),
        };
        tracing::info!(%kind, description = kind.description(), "initialized lock");
        Ok(lock)
    }

    /// Overrides the reserved CPU of variants that apply the demotion policy.
    #[must_use]
    pub fn with_reserved_cpu(self, cpu: Option<usize>) -> Self {
        match self {
            Self::Plain(lock) => Self::Plain(lock.with_reserved_cpu(cpu)),
            Self::Inherit(lock) => Self::Inherit(lock.with_reserved_cpu(cpu)),
            Self::Ceiling(lock) => Self::Ceiling(lock),
            Self::Cb2(lock) => Self::Cb2(lock.with_reserved_cpu(cpu)),
        }
    }

    /// Returns a human readable name of the selected variant.
    #[must_use]
    pub fn description(&self) -> &'static str {
        self.tag().description()
    }

    /// Returns the recorded owner, for variants that track it.
    #[must_use]
    pub fn owner(&self) -> Option<Tid> {
        match self {
            Self::Inherit(lock) => lock.owner(),
            Self::Cb2(lock) => lock.owner(),
            Self::Plain(_) | Self::Ceiling(_) => None,
        }
    }

    /// Returns the CB2 lock, if that is the selected variant.
    #[must_use]
    pub fn as_cb2(&self) -> Option<&Cb2<S, R>> {
        match self {
            Self::Cb2(lock) => Some(lock),
            _ => None,
        }
    }

    fn tag(&self) -> LockKind {
        match self {
            Self::Plain(_) => LockKind::Plain,
            Self::Inherit(_) => LockKind::Inherit,
            Self::Ceiling(_) => LockKind::Ceiling,
            Self::Cb2(_) => LockKind::Cb2,
        }
    }
}

impl<S: Scheduler, R: Relax> PriorityLock for RuntimeLock<S, R> {
    fn kind(&self) -> LockKind {
        self.tag()
    }

    fn acquire(&self) -> Result<Token> {
        match self {
            Self::Plain(lock) => lock.acquire(),
            Self::Inherit(lock) => lock.acquire(),
            Self::Ceiling(lock) => lock.acquire(),
            Self::Cb2(lock) => lock.acquire(),
        }
    }

    fn release(&self, token: Token) -> Result<()> {
        match self {
            Self::Plain(lock) => lock.release(token),
            Self::Inherit(lock) => lock.release(token),
            Self::Ceiling(lock) => lock.release(token),
            Self::Cb2(lock) => lock.release(token),
        }
    }

    fn is_locked(&self) -> bool {
        match self {
            Self::Plain(lock) => lock.is_locked(),
            Self::Inherit(lock) => lock.is_locked(),
            Self::Ceiling(lock) => lock.is_locked(),
            Self::Cb2(lock) => lock.is_locked(),
        }
    }
}

impl<S, R> Debug for RuntimeLock<S, R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain(lock) => lock.fmt(f),
            Self::Inherit(lock) => lock.fmt(f),
            Self::Ceiling(lock) => lock.fmt(f),
            Self::Cb2(lock) => lock.fmt(f),
        }
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::Arc;

    use strum::IntoEnumIterator;

    use super::{LockAttr, LockKind, RuntimeLock};
    use crate::error::Error;
    use crate::priority::Priority;
    use crate::raw::PriorityLock;
    use crate::sched::SimScheduler;
    use crate::test::tests;

    type Lock = RuntimeLock<Arc<SimScheduler>>;

    fn init(kind: LockKind, attr: LockAttr) -> crate::error::Result<Lock> {
        RuntimeLock::initialize(kind, attr, Arc::new(SimScheduler::new()))
    }

    fn attr_for(kind: LockKind) -> LockAttr {
        match kind {
            LockKind::Plain | LockKind::Inherit => LockAttr::Unused,
            LockKind::Ceiling => LockAttr::Ceiling(Priority::HIGHEST),
            LockKind::Cb2 => LockAttr::Tickets { pool: 10, seed: Some(1) },
        }
    }

    #[test]
    fn parses_names_and_aliases() {
        for (name, kind) in [
            ("plain", LockKind::Plain),
            ("none", LockKind::Plain),
            ("Inherit", LockKind::Inherit),
            ("CEILING", LockKind::Ceiling),
            ("protect", LockKind::Ceiling),
            ("cb2", LockKind::Cb2),
        ] {
            assert_eq!(name.parse::<LockKind>().unwrap(), kind);
        }
        assert!("fifo".parse::<LockKind>().is_err());
    }

    #[test]
    fn tags_round_trip() {
        for kind in LockKind::iter() {
            assert_eq!(LockKind::from_tag(kind.tag()), Some(kind));
            assert_eq!(kind.to_string().parse::<LockKind>().unwrap(), kind);
        }
        assert_eq!(LockKind::from_tag(4), None);
        assert_eq!(LockKind::from_tag(-1), None);
        assert_eq!(LockKind::Cb2.to_string(), "cb2");
    }

    #[test]
    fn initializes_every_kind() {
        for kind in LockKind::iter() {
            let lock = init(kind, attr_for(kind)).unwrap();
            assert_eq!(lock.kind(), kind);
            assert_eq!(lock.description(), kind.description());
            let token = lock.acquire().unwrap();
            lock.release(token).unwrap();
            lock.destroy().unwrap();
        }
    }

    #[test]
    fn missing_attributes_are_rejected() {
        let err = init(LockKind::Ceiling, LockAttr::Unused).unwrap_err();
        assert!(matches!(err, Error::MissingAttr { kind: LockKind::Ceiling, field: "ceiling" }));
        assert!(err.is_config());
        let attr = LockAttr::Ceiling(Priority::NEUTRAL);
        let err = init(LockKind::Cb2, attr).unwrap_err();
        assert!(matches!(err, Error::MissingAttr { kind: LockKind::Cb2, field: "tickets" }));
    }

    #[test]
    fn non_positive_ticket_pool_is_rejected() {
        for pool in [0, -3] {
            let err = init(LockKind::Cb2, LockAttr::Tickets { pool, seed: None }).unwrap_err();
            assert!(matches!(err, Error::InvalidTickets(p) if p == pool));
        }
    }

    #[test]
    fn ceiling_attr_range() {
        assert_eq!(LockAttr::ceiling(-7).unwrap(), LockAttr::Ceiling(Priority::new(-7).unwrap()));
        assert!(matches!(LockAttr::ceiling(20), Err(Error::PriorityOutOfRange(20))));
    }

    #[test]
    fn attr_is_ignored_when_unused() {
        let lock = init(LockKind::Inherit, LockAttr::Tickets { pool: -1, seed: None }).unwrap();
        assert!(lock.as_cb2().is_none());
        assert_eq!(lock.owner(), None);
    }

    #[test]
    fn lots_and_lots_acquire() {
        for kind in LockKind::iter() {
            let factory: tests::Factory<Lock> = match kind {
                LockKind::Plain => {
                    |s| RuntimeLock::initialize(LockKind::Plain, LockAttr::Unused, s).unwrap()
                }
                LockKind::Inherit => {
                    |s| RuntimeLock::initialize(LockKind::Inherit, LockAttr::Unused, s).unwrap()
                }
                LockKind::Ceiling => |s| {
                    RuntimeLock::initialize(LockKind::Ceiling, LockAttr::Ceiling(Priority::HIGHEST), s)
                        .unwrap()
                },
                LockKind::Cb2 => |s| {
                    let attr = LockAttr::Tickets { pool: 10, seed: Some(9) };
                    RuntimeLock::initialize(LockKind::Cb2, attr, s).unwrap()
                },
            };
            tests::lots_and_lots_acquire(factory);
        }
    }
}
