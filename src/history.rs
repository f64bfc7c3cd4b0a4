//! Donation history for the CB2 lottery.
//!
//! Every requester gets an entry the first time it finds a CB2 lock taken,
//! whether or not it then runs the lottery. A won draw that led to a donation
//! bumps its donation count, a lost one lowers it again (never below zero). The count is subtracted from the
//! ticket pool to form the requester's bonus, so a requester that keeps
//! winning keeps shrinking its own odds.
//!
//! The table is not synchronized: it lives inside the CB2 metadata and is
//! only touched with the metadata lock held.

use std::collections::HashMap;

use crate::priority::Tid;

/// The donation record of one requester.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Donations {
    /// Net number of lottery wins, floored at zero.
    pub count: u32,
    /// Total number of lottery draws.
    pub draws: u64,
}

/// A mapping from requester identity to its [`Donations`] record.
#[derive(Clone, Debug, Default)]
pub struct DonationHistory {
    entries: HashMap<Tid, Donations>,
}

impl DonationHistory {
    /// Creates an empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the donation count of `tid`, zero if it never contended.
    #[must_use]
    pub fn count(&self, tid: Tid) -> u32 {
        self.entries.get(&tid).map_or(0, |d| d.count)
    }

    /// Returns the record of `tid`, if it ever contended.
    #[must_use]
    pub fn get(&self, tid: Tid) -> Option<Donations> {
        self.entries.get(&tid).copied()
    }

    /// Returns the bonus `tid` receives out of `pool` tickets.
    ///
    /// This is `pool - count`, clamped at zero.
    #[must_use]
    pub fn bonus(&self, tid: Tid, pool: u32) -> u32 {
        pool.saturating_sub(self.count(tid))
    }

    /// Registers that `tid` found the lock taken, creating its entry if
    /// needed.
    pub(crate) fn record_contention(&mut self, tid: Tid) {
        self.entries.entry(tid).or_default();
    }

    /// Registers a draw by `tid`, creating its entry if needed.
    pub(crate) fn record_draw(&mut self, tid: Tid) {
        self.entries.entry(tid).or_default().draws += 1;
    }

    /// Registers a lottery win by `tid`.
    pub(crate) fn record_win(&mut self, tid: Tid) {
        let entry = self.entries.entry(tid).or_default();
        entry.count = entry.count.saturating_add(1);
    }

    /// Registers a lottery loss by `tid`.
    pub(crate) fn record_loss(&mut self, tid: Tid) {
        let entry = self.entries.entry(tid).or_default();
        entry.count = entry.count.saturating_sub(1);
    }

    /// Returns the number of requesters with an entry.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no requester ever ran the lottery.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over every requester and its record, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (Tid, Donations)> + '_ {
        self.entries.iter().map(|(tid, d)| (*tid, *d))
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use proptest::prelude::*;

    use super::{DonationHistory, Donations};
    use crate::priority::Tid;

    const REQ: Tid = Tid::from_raw(1);
    const POOL: u32 = 10;

    #[test]
    fn entries_are_lazy() {
        let mut history = DonationHistory::new();
        assert!(history.is_empty());
        assert_eq!(history.count(REQ), 0);
        assert_eq!(history.bonus(REQ, POOL), POOL);
        assert_eq!(history.get(REQ), None);
        history.record_draw(REQ);
        assert_eq!(history.get(REQ), Some(Donations { count: 0, draws: 1 }));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn contention_creates_an_empty_entry() {
        let mut history = DonationHistory::new();
        history.record_contention(REQ);
        assert_eq!(history.get(REQ), Some(Donations::default()));
        history.record_win(REQ);
        history.record_contention(REQ);
        assert_eq!(history.get(REQ), Some(Donations { count: 1, draws: 0 }));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn loss_is_floored_at_zero() {
        let mut history = DonationHistory::new();
        history.record_loss(REQ);
        assert_eq!(history.count(REQ), 0);
        history.record_win(REQ);
        history.record_win(REQ);
        history.record_loss(REQ);
        assert_eq!(history.count(REQ), 1);
    }

    #[test]
    fn bonus_is_clamped() {
        let mut history = DonationHistory::new();
        for _ in 0..POOL + 5 {
            history.record_win(REQ);
        }
        assert_eq!(history.bonus(REQ, POOL), 0);
    }

    #[test]
    fn entries_are_per_requester() {
        let other = Tid::from_raw(2);
        let mut history = DonationHistory::new();
        history.record_win(REQ);
        assert_eq!(history.count(other), 0);
        assert_eq!(history.iter().count(), 1);
    }

    proptest! {
        #[test]
        fn repeated_wins_decay_bonus(pool in 1u32..1000, wins in 0usize..2000) {
            let mut history = DonationHistory::new();
            let mut last = history.bonus(REQ, pool);
            for _ in 0..wins {
                history.record_win(REQ);
                let bonus = history.bonus(REQ, pool);
                prop_assert!(bonus <= last);
                last = bonus;
            }
        }

        #[test]
        fn count_tracks_net_wins(outcomes in proptest::collection::vec(any::<bool>(), 0..200)) {
            let mut history = DonationHistory::new();
            let mut expected = 0u32;
            for won in outcomes {
                if won {
                    history.record_win(REQ);
                    expected += 1;
                } else {
                    history.record_loss(REQ);
                    expected = expected.saturating_sub(1);
                }
                prop_assert_eq!(history.count(REQ), expected);
            }
        }
    }
}
