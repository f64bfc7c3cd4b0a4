//! Scheduling priorities and thread identities.

use core::fmt::{self, Display, Formatter};

use crate::error::{Error, Result};

/// A thread scheduling priority on the `[-20, 19]` nice scale.
///
/// A smaller value denotes a more urgent thread. Setting a value below
/// [`Priority::NEUTRAL`] usually requires elevated privileges.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(i32);

impl Priority {
    /// The most urgent priority.
    pub const HIGHEST: Self = Self(-20);

    /// The least urgent priority.
    pub const LOWEST: Self = Self(19);

    /// The default priority of a new thread.
    pub const NEUTRAL: Self = Self(0);

    /// Creates a new priority, failing if `value` is outside of the scale.
    ///
    /// # Examples
    ///
    /// ```
    /// use cb2lock::Priority;
    ///
    /// assert_eq!(Priority::new(-20).unwrap(), Priority::HIGHEST);
    /// assert!(Priority::new(20).is_err());
    /// ```
    pub fn new(value: i32) -> Result<Self> {
        if value < Self::HIGHEST.0 || value > Self::LOWEST.0 {
            return Err(Error::PriorityOutOfRange(value));
        }
        Ok(Self(value))
    }

    /// Returns the raw nice value.
    #[must_use]
    #[inline(always)]
    pub const fn get(self) -> i32 {
        self.0
    }

    /// Returns `true` if `self` is numerically greater, that is, less urgent
    /// than `other`.
    ///
    /// This is the single boost rule used by the donating locks: an owner is
    /// boosted iff it is less urgent than the requester.
    #[must_use]
    #[inline(always)]
    pub const fn is_less_urgent_than(self, other: Self) -> bool {
        self.0 > other.0
    }
}

impl Default for Priority {
    #[inline(always)]
    fn default() -> Self {
        Self::NEUTRAL
    }
}

impl TryFrom<i32> for Priority {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Priority> for i32 {
    #[inline(always)]
    fn from(priority: Priority) -> Self {
        priority.0
    }
}

impl Display for Priority {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// An opaque, OS assigned thread identifier.
///
/// Stable for the lifetime of the thread it names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid(i32);

impl Tid {
    /// Wraps a raw thread id.
    #[must_use]
    #[inline(always)]
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    /// Returns the raw thread id.
    #[must_use]
    #[inline(always)]
    pub const fn as_raw(self) -> i32 {
        self.0
    }
}

impl Display for Tid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use super::Priority;

    #[test]
    fn range_is_enforced() {
        assert!(Priority::new(-21).is_err());
        assert!(Priority::new(20).is_err());
        for raw in -20..=19 {
            assert_eq!(Priority::new(raw).unwrap().get(), raw);
        }
    }

    #[test]
    fn urgency_is_inverted_numeric_order() {
        assert!(Priority::LOWEST.is_less_urgent_than(Priority::HIGHEST));
        assert!(Priority::NEUTRAL.is_less_urgent_than(Priority::HIGHEST));
        assert!(!Priority::HIGHEST.is_less_urgent_than(Priority::NEUTRAL));
        assert!(!Priority::NEUTRAL.is_less_urgent_than(Priority::NEUTRAL));
    }

    #[test]
    fn default_is_neutral() {
        assert_eq!(Priority::default(), Priority::NEUTRAL);
        assert_eq!(i32::from(Priority::default()), 0);
    }
}
