use core::fmt::{self, Debug, Formatter};
use core::marker::PhantomData;

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;

use crate::error::{Error, Result};
use crate::history::DonationHistory;
use crate::priority::{Priority, Tid};
use crate::registry::LockKind;
use crate::relax::{Relax, Yield};
use crate::sched::Scheduler;

use super::owned::{OwnedLock, Ownership};
use super::{PriorityLock, ReservedCpu, Token};

/// The ticket configuration of a [`Cb2`] lock.
///
/// The pool is the aggregate weight of every bystander thread on the
/// contended CPU. It is fixed for the lifetime of the lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tickets {
    pool: u32,
    seed: Option<u64>,
}

impl Tickets {
    /// Creates a ticket configuration with `pool` bystander tickets.
    ///
    /// Fails with [`Error::InvalidTickets`] unless `pool` is strictly
    /// positive and fits in a `u32`.
    pub fn new(pool: i64) -> Result<Self> {
        match u32::try_from(pool) {
            Ok(pool) if pool > 0 => Ok(Self { pool, seed: None }),
            _ => Err(Error::InvalidTickets(pool)),
        }
    }

    /// Seeds the lottery, making its draws reproducible.
    #[must_use]
    pub const fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Returns the bystander ticket pool.
    #[must_use]
    pub const fn pool(&self) -> u32 {
        self.pool
    }
}

/// The CB2 donation lottery.
///
/// For a requester `R` with donation count `n` against an owner `O`:
///
/// ```text
/// K       = max(pool - n, 0)
/// tickets = priority(R) + priority(O) + K
/// sum     = pool + tickets
/// ```
///
/// A ticket `t` is drawn uniformly from `[0, sum)` and the requester donates
/// iff `t > pool`. A non positive `sum` always loses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Lottery {
    pool: u32,
}

impl Lottery {
    /// Creates the lottery for a ticket configuration.
    #[must_use]
    pub const fn new(tickets: Tickets) -> Self {
        Self { pool: tickets.pool }
    }

    /// Returns the requester bonus `K` for a donation count.
    #[must_use]
    pub const fn bonus(self, count: u32) -> u32 {
        self.pool.saturating_sub(count)
    }

    /// Returns the size of the ticket range a draw is taken from.
    #[must_use]
    pub fn sum(self, count: u32, requester: Priority, owner: Priority) -> i64 {
        let tickets =
            i64::from(requester.get()) + i64::from(owner.get()) + i64::from(self.bonus(count));
        i64::from(self.pool) + tickets
    }

    /// Returns how many tickets of the range make the requester win.
    #[must_use]
    pub fn winning(self, count: u32, requester: Priority, owner: Priority) -> i64 {
        let sum = self.sum(count, requester, owner);
        (sum - i64::from(self.pool) - 1).max(0)
    }

    /// Returns the exact probability that a draw makes the requester donate.
    #[must_use]
    pub fn win_probability(self, count: u32, requester: Priority, owner: Priority) -> f64 {
        let winning = self.winning(count, requester, owner);
        if winning == 0 {
            return 0.0;
        }
        winning as f64 / self.sum(count, requester, owner) as f64
    }

    /// Draws a ticket and returns `true` if the requester wins.
    pub fn draw<G: Rng + ?Sized>(
        self,
        rng: &mut G,
        count: u32,
        requester: Priority,
        owner: Priority,
    ) -> bool {
        let sum = self.sum(count, requester, owner);
        sum > 0 && rng.gen_range(0..sum) > i64::from(self.pool)
    }
}

/// The state guarded by the CB2 metadata lock.
struct Cb2State {
    ownership: Ownership,
    history: DonationHistory,
    rng: Pcg64Mcg,
}

impl AsMut<Ownership> for Cb2State {
    fn as_mut(&mut self) -> &mut Ownership {
        &mut self.ownership
    }
}

/// A lottery based priority donation lock.
///
/// Like [`Inherit`], a requester that finds the lock taken by a less urgent
/// owner considers raising the owner to its own priority. Unlike it, the
/// donation is decided by a [`Lottery`] weighted by both priorities, by the
/// bystander ticket pool and by how often the requester already won.
///
/// - On a win the owner is boosted, the requester's donation count grows and
///   the requester retries the whole acquisition after relaxing with `R`,
///   instead of blocking, so the boosted owner gets a chance to finish first.
/// - On a loss the requester's donation count shrinks (never below zero) and
///   it blocks on the main lock.
///
/// Over many contentions, urgent requesters are favored statistically while
/// no single requester keeps donating forever.
///
/// # Example
///
/// ```
/// use cb2lock::raw::{Cb2, Tickets};
/// use cb2lock::sched::SimScheduler;
/// use cb2lock::PriorityLock;
///
/// let tickets = Tickets::new(10).unwrap().seed(42);
/// let lock: Cb2<_> = Cb2::new(SimScheduler::new(), tickets);
/// let token = lock.acquire().unwrap();
/// lock.release(token).unwrap();
/// assert!(lock.history().is_empty());
/// ```
///
/// [`Inherit`]: super::Inherit
pub struct Cb2<S, R = Yield> {
    inner: OwnedLock<S, Cb2State>,
    lottery: Lottery,
    relax: PhantomData<fn() -> R>,
}

impl<S: Scheduler, R> Cb2<S, R> {
    /// Creates a new, unlocked CB2 lock.
    pub fn new(sched: S, tickets: Tickets) -> Self {
        let rng = tickets.seed.map_or_else(Pcg64Mcg::from_entropy, Pcg64Mcg::seed_from_u64);
        let state = Cb2State { ownership: Ownership::default(), history: DonationHistory::new(), rng };
        Self { inner: OwnedLock::new(sched, state), lottery: Lottery::new(tickets), relax: PhantomData }
    }

    /// Overrides the reserved CPU, `None` disables the demotion policy.
    #[must_use]
    pub fn with_reserved_cpu(mut self, cpu: Option<usize>) -> Self {
        self.inner.reserved = ReservedCpu::new(cpu);
        self
    }

    /// Returns the lottery this lock runs.
    #[must_use]
    pub const fn lottery(&self) -> Lottery {
        self.lottery
    }

    /// Returns the donation count of `tid`.
    #[must_use]
    pub fn donation_count(&self, tid: Tid) -> u32 {
        self.inner.meta().history.count(tid)
    }

    /// Returns a snapshot of the donation history.
    #[must_use]
    pub fn history(&self) -> DonationHistory {
        self.inner.meta().history.clone()
    }

    /// Returns the thread currently recorded as owner.
    #[must_use]
    pub fn owner(&self) -> Option<Tid> {
        self.inner.owner()
    }

    /// Returns the scheduler this lock consults.
    pub fn scheduler(&self) -> &S {
        &self.inner.sched
    }

    /// Runs the lottery for `me` against `owner`. A loss is recorded right
    /// away, a win only once the donation went through.
    fn draw(&self, state: &mut Cb2State, me: Tid, requester: Priority, owner: Priority) -> bool {
        let count = state.history.count(me);
        state.history.record_draw(me);
        let won = self.lottery.draw(&mut state.rng, count, requester, owner);
        if !won {
            state.history.record_loss(me);
        }
        tracing::debug!(
            tid = %me,
            bonus = self.lottery.bonus(count),
            sum = self.lottery.sum(count, requester, owner),
            won,
            "donation lottery"
        );
        won
    }
}

impl<S: Scheduler, R: Relax> PriorityLock for Cb2<S, R> {
    fn kind(&self) -> LockKind {
        LockKind::Cb2
    }

    fn acquire(&self) -> Result<Token> {
        let (me, original) = self.inner.caller()?;
        let sched = &self.inner.sched;
        let mut relax = R::new();
        loop {
            let mut meta = self.inner.meta();
            if self.inner.try_claim(&mut meta, me)? {
                return Ok(Token::new(self.inner.id, me, Some(original)));
            }

            meta.history.record_contention(me);
            if let Some(owner) = meta.ownership.owner {
                let owner_priority = sched.priority(owner)?;
                meta.ownership.owner_priority = Some(owner_priority);
                if owner_priority.is_less_urgent_than(original)
                    && self.draw(&mut meta, me, original, owner_priority)
                {
                    tracing::debug!(tid = %me, %owner, from = %owner_priority, to = %original, "donating priority");
                    sched.set_priority(owner, original)?;
                    meta.ownership.owner_priority = Some(original);
                    meta.history.record_win(me);
                    drop(meta);
                    relax.relax();
                    continue;
                }
            }

            self.inner.block(meta, me)?;
            return Ok(Token::new(self.inner.id, me, Some(original)));
        }
    }

    fn release(&self, token: Token) -> Result<()> {
        token.check(self.inner.id);
        self.inner.release(&token)
    }

    fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

impl<S, R> Debug for Cb2<S, R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cb2")
            .field("lottery", &self.lottery)
            .field("reserved_cpu", &self.inner.reserved.cpu())
            .finish_non_exhaustive()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::mpsc::channel;
    use std::sync::{Arc, Barrier};
    use std::thread;

    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use super::{Cb2, Lottery, Tickets};
    use crate::error::Error;
    use crate::history::Donations;
    use crate::priority::{Priority, Tid};
    use crate::raw::PriorityLock;
    use crate::relax::Spin;
    use crate::sched::{Scheduler, SimScheduler};
    use crate::test::tests;

    type Lock = Cb2<Arc<SimScheduler>>;

    const POOL: i64 = 10;

    fn seeded(sched: Arc<SimScheduler>) -> Lock {
        Cb2::new(sched, Tickets::new(POOL).unwrap().seed(0x5eed))
    }

    fn prio(raw: i32) -> Priority {
        Priority::new(raw).unwrap()
    }

    #[test]
    fn lots_and_lots_acquire() {
        tests::lots_and_lots_acquire::<Lock>(seeded);
    }

    #[test]
    fn lots_and_lots_acquire_spinning() {
        tests::lots_and_lots_acquire::<Cb2<Arc<SimScheduler>, Spin>>(|sched| {
            Cb2::new(sched, Tickets::new(1).unwrap())
        });
    }

    #[test]
    fn priority_restored() {
        tests::priority_restored::<Lock>(seeded);
    }

    #[test]
    fn contention_terminates() {
        tests::contention_terminates::<Lock>(seeded);
    }

    #[test]
    fn smoke() {
        tests::smoke::<Lock>(seeded);
    }

    #[test]
    fn lots_and_lots_mutex() {
        tests::lots_and_lots_mutex::<Lock>(seeded);
    }

    #[test]
    fn destroy_while_held() {
        tests::destroy_while_held::<Lock>(seeded);
    }

    #[test]
    fn ticket_pool_must_be_positive() {
        for pool in [0, -1, -10, i64::from(u32::MAX) + 1] {
            let err = Tickets::new(pool).unwrap_err();
            assert!(matches!(err, Error::InvalidTickets(p) if p == pool));
        }
        assert_eq!(Tickets::new(1).unwrap().pool(), 1);
    }

    #[test]
    fn high_priority_requester_odds() {
        let lottery = Lottery::new(Tickets::new(POOL).unwrap());
        let (b, a) = (Priority::HIGHEST, Priority::LOWEST);
        // K = 10, tickets = -20 + 19 + 10 = 9, sum = 19, wins on 11..=18.
        assert_eq!(lottery.sum(0, b, a), 19);
        assert_eq!(lottery.winning(0, b, a), 8);
        assert!((lottery.win_probability(0, b, a) - 8.0 / 19.0).abs() < f64::EPSILON);
        // K = 2, tickets = 1, sum = 11, no ticket is above the pool.
        assert_eq!(lottery.win_probability(8, b, a), 0.0);
        // A requester more urgent than the whole pool range never wins.
        assert_eq!(lottery.win_probability(0, b, prio(-19)), 0.0);
    }

    #[test]
    fn win_probability_decays_with_count() {
        let lottery = Lottery::new(Tickets::new(POOL).unwrap());
        let (b, a) = (Priority::HIGHEST, Priority::LOWEST);
        let odds: Vec<f64> = (0..=8).map(|n| lottery.win_probability(n, b, a)).collect();
        assert!(odds.windows(2).all(|w| w[1] < w[0]), "{odds:?}");
    }

    #[test]
    fn seeded_draws_follow_the_odds() {
        const DRAWS: usize = 1000;
        let lottery = Lottery::new(Tickets::new(POOL).unwrap());
        let (b, a) = (Priority::HIGHEST, Priority::LOWEST);
        let mut rng = Pcg64Mcg::seed_from_u64(7);
        let fresh = (0..DRAWS).filter(|_| lottery.draw(&mut rng, 0, b, a)).count();
        let worn = (0..DRAWS).filter(|_| lottery.draw(&mut rng, 8, b, a)).count();
        assert!(fresh > DRAWS / 4 && fresh < DRAWS / 2, "{fresh}");
        assert_eq!(worn, 0);
    }

    #[test]
    fn same_seed_same_draws() {
        let lottery = Lottery::new(Tickets::new(POOL).unwrap());
        let (b, a) = (Priority::HIGHEST, Priority::LOWEST);
        let run = |seed| {
            let mut rng = Pcg64Mcg::seed_from_u64(seed);
            (0..64).map(|_| lottery.draw(&mut rng, 0, b, a)).collect::<Vec<_>>()
        };
        assert_eq!(run(3), run(3));
    }

    proptest! {
        #[test]
        fn bonus_never_negative_and_decays(pool in 1i64..1000, wins in 0u32..2000) {
            let lottery = Lottery::new(Tickets::new(pool).unwrap());
            let mut last = lottery.bonus(0);
            for count in 1..=wins {
                let bonus = lottery.bonus(count);
                prop_assert!(bonus <= last);
                last = bonus;
            }
        }

        #[test]
        fn odds_never_grow_with_count(
            pool in 1i64..100,
            requester in -20i32..=19,
            owner in -20i32..=19,
            count in 0u32..200,
        ) {
            let lottery = Lottery::new(Tickets::new(pool).unwrap());
            let (r, o) = (prio(requester), prio(owner));
            let now = lottery.win_probability(count, r, o);
            let next = lottery.win_probability(count + 1, r, o);
            prop_assert!((0.0..1.0).contains(&now));
            prop_assert!(next <= now);
        }
    }

    #[test]
    fn exited_owner_fails_contender() {
        tests::exited_owner_fails_contender::<Lock>(seeded);
    }

    #[test]
    fn failed_claim_unlocks() {
        tests::failed_claim_unlocks::<Cb2<Arc<tests::NoDemotion>>>(|sched| {
            Cb2::new(sched, Tickets::new(POOL).unwrap())
        });
    }

    #[test]
    fn winner_boosts_the_owner() {
        let sched = Arc::new(SimScheduler::new());
        let lock = Arc::new(seeded(Arc::clone(&sched)));
        let a = sched.assign(Priority::LOWEST);
        let token = lock.acquire().unwrap();
        assert_eq!(lock.owner(), Some(a));

        let (tx, rx) = channel();
        let (b_lock, b_sched) = (Arc::clone(&lock), Arc::clone(&sched));
        let requester = thread::spawn(move || {
            let me = b_sched.assign(Priority::HIGHEST);
            tx.send(me).unwrap();
            let token = b_lock.acquire().unwrap();
            assert_eq!(b_lock.owner(), Some(me));
            b_lock.release(token).unwrap();
        });
        let b = rx.recv().unwrap();
        tests::wait_until(|| lock.history().get(b).is_some_and(|d| d.draws > 0));
        let won = lock.donation_count(b) == 1;
        if won {
            assert_eq!(sched.priority(a).unwrap(), Priority::HIGHEST);
        }
        lock.release(token).unwrap();
        requester.join().unwrap();

        let boosts = sched.events().iter().filter(|e| e.by == b && e.target == a).count();
        assert_eq!(boosts, usize::from(won));
        assert_eq!(sched.priority(a).unwrap(), Priority::LOWEST);
        assert_eq!(lock.history().get(b).unwrap().draws, 1);
    }

    /// Without the privilege to raise the owner, a won draw fails the
    /// acquisition and leaves the requester's count untouched.
    #[test]
    fn denied_donation_is_not_counted() {
        let mut denied = false;
        for seed in 0..64 {
            let sched = Arc::new(SimScheduler::unprivileged());
            let tickets = Tickets::new(POOL).unwrap().seed(seed);
            let lock: Arc<Lock> = Arc::new(Cb2::new(Arc::clone(&sched), tickets));
            let a = sched.assign(Priority::LOWEST);
            let token = lock.acquire().unwrap();

            let (tx, rx) = channel();
            let (b_lock, b_sched) = (Arc::clone(&lock), Arc::clone(&sched));
            let requester = thread::spawn(move || {
                tx.send(b_sched.assign(Priority::HIGHEST)).unwrap();
                // Restoring -20 on release is refused too, only the
                // acquisition outcome matters here.
                b_lock.acquire().map(|token| {
                    let _ = b_lock.release(token);
                })
            });
            let b = rx.recv().unwrap();
            tests::wait_until(|| lock.history().get(b).is_some_and(|d| d.draws > 0));
            lock.release(token).unwrap();
            let Err(err) = requester.join().unwrap() else { continue };

            assert!(matches!(
                err,
                Error::PermissionDenied { tid, priority } if tid == a && priority == Priority::HIGHEST
            ));
            assert_eq!(lock.history().get(b), Some(Donations { count: 0, draws: 1 }));
            assert_eq!(sched.priority(a).unwrap(), Priority::LOWEST);
            assert!(!lock.is_locked());
            assert_eq!(lock.owner(), None);
            let token = lock.acquire().unwrap();
            assert_eq!(lock.owner(), Some(a));
            lock.release(token).unwrap();
            denied = true;
            break;
        }
        assert!(denied, "no seed produced a winning draw");
    }

    #[test]
    fn contention_creates_an_entry_without_drawing() {
        let sched = Arc::new(SimScheduler::new());
        let lock = Arc::new(seeded(Arc::clone(&sched)));
        sched.assign(Priority::HIGHEST);
        let token = lock.acquire().unwrap();
        assert!(lock.history().is_empty());

        let (tx, rx) = channel();
        let (c_lock, c_sched) = (Arc::clone(&lock), Arc::clone(&sched));
        let waiter = thread::spawn(move || {
            tx.send(c_sched.assign(Priority::LOWEST)).unwrap();
            let token = c_lock.acquire().unwrap();
            c_lock.release(token).unwrap();
        });
        let c = rx.recv().unwrap();
        tests::wait_until(|| lock.history().get(c).is_some());
        assert_eq!(lock.history().get(c), Some(Donations::default()));
        lock.release(token).unwrap();
        waiter.join().unwrap();

        assert_eq!(lock.history().len(), 1);
        assert_eq!(lock.donation_count(c), 0);
        assert!(sched.events().iter().all(|e| e.by != c || e.target == c));
    }

    /// A lowest priority holder is contended by a highest priority requester
    /// and a neutral bystander, round after round, on the same lock.
    #[test]
    fn repeated_inversions() {
        const ROUNDS: usize = 1000;
        let sched = Arc::new(SimScheduler::new());
        let lock = Arc::new(seeded(Arc::clone(&sched)));
        let lottery = lock.lottery();
        let start = Arc::new(Barrier::new(3));
        let end = Arc::new(Barrier::new(3));
        let (tx, rx) = channel();

        let contenders: Vec<_> = [Priority::HIGHEST, Priority::NEUTRAL]
            .into_iter()
            .map(|priority| {
                let (lock, sched, tx) = (lock.clone(), sched.clone(), tx.clone());
                let (start, end) = (start.clone(), end.clone());
                thread::spawn(move || {
                    let me = sched.assign(priority);
                    tx.send((priority, me)).unwrap();
                    for _ in 0..ROUNDS {
                        start.wait();
                        let token = lock.acquire().unwrap();
                        lock.release(token).unwrap();
                        assert_eq!(sched.priority(me).unwrap(), priority);
                        end.wait();
                    }
                })
            })
            .collect();
        drop(tx);
        let ids: Vec<_> = rx.iter().take(2).collect();
        let b = ids.iter().find(|(p, _)| *p == Priority::HIGHEST).unwrap().1;
        let c = ids.iter().find(|(p, _)| *p == Priority::NEUTRAL).unwrap().1;

        let a = sched.assign(Priority::LOWEST);
        let donated_by =
            |tid: Tid| sched.events().iter().filter(|e| e.by == tid && e.target == a).count();
        // Draw count and bonus right after the previous win, cleared by a loss.
        let mut streak: Option<(u64, u32)> = None;
        let (mut wins, mut back_to_back) = (0u32, 0u32);
        for _ in 0..ROUNDS {
            let token = lock.acquire().unwrap();
            let before = lock.history();
            let boosts = donated_by(b);
            start.wait();
            // B draws exactly once against this round's owner: a loss blocks
            // it, a win makes the owner as urgent as B.
            let drawn = before.get(b).unwrap_or_default();
            tests::wait_until(|| lock.history().get(b).is_some_and(|d| d.draws > drawn.draws));
            let mid = lock.history();
            lock.release(token).unwrap();
            assert_eq!(sched.priority(a).unwrap(), Priority::LOWEST);
            end.wait();

            let now = mid.get(b).unwrap();
            assert_eq!(now.draws, drawn.draws + 1);
            let won = now.count == drawn.count + 1;
            assert_eq!(donated_by(b) - boosts, usize::from(won));
            if !won {
                streak = None;
                continue;
            }
            wins += 1;
            let bonus = lottery.bonus(drawn.count);
            assert!(bonus >= 3, "won with a bonus of {bonus}");
            if let Some((draws, last)) = streak {
                if draws == drawn.draws {
                    assert!(bonus < last, "bonus went from {last} to {bonus}");
                    back_to_back += 1;
                }
            }
            streak = Some((now.draws, bonus));

            // B's win leaves the bystander's standing alone.
            let (c_before, c_mid) = (before.get(c).unwrap_or_default(), mid.get(c).unwrap_or_default());
            if c_mid.draws == c_before.draws {
                assert_eq!(c_mid.count, c_before.count);
            }
        }
        for handle in contenders {
            handle.join().unwrap();
        }

        let history = lock.history();
        let by_b = history.get(b).unwrap();
        assert!(by_b.draws >= ROUNDS as u64);
        assert!(history.get(a).is_none());
        assert!(wins > 0);
        assert!(back_to_back > 0);
        assert!(u64::from(wins) * 2 < by_b.draws, "{wins} of {}", by_b.draws);
        assert_eq!(donated_by(b), wins as usize);
        if let Some(by_c) = history.get(c) {
            assert!(donated_by(c) as u64 <= by_c.draws);
        }
    }
}

#[cfg(all(loom, test))]
mod model {
    use super::{Cb2, Tickets};
    use crate::loom::models;

    #[test]
    fn lock_join() {
        models::lock_join::<Cb2<_>>(|sched| Cb2::new(sched, Tickets::new(10).unwrap().seed(3)));
    }
}
