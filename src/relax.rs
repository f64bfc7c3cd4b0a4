// Modified version of relax.rs from spin-rs to support Loom yielding,
// exponential backoff and retries after a won donation lottery.
//
// Original file at its most recent change (at the time of writing):
// https://github.com/mvdnes/spin-rs/blob/5860ee114094cf200b97348ff332155fbd7159b4/src/relax.rs
//
// Copyright (c) 2014 Mathijs van de Nes
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Strategies that determine how a CB2 requester waits before retrying after
//! it won a donation lottery.
//!
//! A winning requester does not block on the main lock. It releases the
//! metadata lock, relaxes once, and then retries the whole acquisition, giving
//! the freshly boosted owner a chance to finish its critical section first.

use crate::cfg::{hint, thread};

/// A trait implemented by retry relax strategies.
///
/// A new value is created for each [`acquire`] call, and [`relax`] is invoked
/// once per retry of that call.
///
/// # Example
///
/// ```
/// use cb2lock::relax::Relax;
///
/// struct Nap;
///
/// impl Relax for Nap {
///     fn new() -> Self {
///         Self
///     }
///
///     fn relax(&mut self) {
///         std::thread::sleep(std::time::Duration::from_micros(50));
///     }
/// }
/// ```
/// [`acquire`]: crate::PriorityLock::acquire
/// [`relax`]: Relax::relax
pub trait Relax {
    /// Returns the initial value for this relaxing strategy.
    fn new() -> Self;

    /// Performs the relaxing operation between two retries.
    fn relax(&mut self);
}

/// Yields the current time slice to the OS scheduler, so a boosted owner
/// sharing the CPU can run right away.
///
/// This is the default retry policy.
pub struct Yield;

impl Relax for Yield {
    #[inline(always)]
    fn new() -> Self {
        Self
    }

    #[inline(always)]
    fn relax(&mut self) {
        thread::yield_now();
    }
}

/// Busy-waits for a single [`core::hint::spin_loop`] before retrying.
///
/// Only useful when the owner is known to run on another CPU.
pub struct Spin;

impl Relax for Spin {
    #[inline(always)]
    fn new() -> Self {
        Self
    }

    #[inline(always)]
    fn relax(&mut self) {
        hint::spin_loop();
    }
}

/// Retries immediately, without any hint to the CPU.
pub struct Loop;

impl Relax for Loop {
    #[inline(always)]
    fn new() -> Self {
        Self
    }

    #[inline(always)]
    fn relax(&mut self) {}
}

// Exponential backoff is based on the crossbeam-utils implementation.
// link to most recent change (as the time of writing):
// https://github.com/crossbeam-rs/crossbeam/blob/371de8c2d304db07662450995848f3dc9598ac99/crossbeam-utils/src/backoff.rs
//
// Copyright (c) 2019 The Crossbeam Project Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

/// Spins with exponential backoff, doubling the spin count on each retry up
/// to `1 << SpinBackoff::MAX` iterations.
pub struct SpinBackoff {
    shifts: u32,
}

impl SpinBackoff {
    /// The largest shift the backoff counter can reach.
    const MAX: u32 = 6;
}

const _: () = assert!(SpinBackoff::MAX < u32::BITS);

impl Relax for SpinBackoff {
    #[inline(always)]
    fn new() -> Self {
        Self { shifts: 0 }
    }

    fn relax(&mut self) {
        for _ in 0..1u32 << self.shifts {
            hint::spin_loop();
        }
        if self.shifts < Self::MAX {
            self.shifts += 1;
        }
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use super::{Loop, Relax, Spin, SpinBackoff, Yield};

    fn returns<R: Relax>() {
        let mut relax = R::new();
        for _ in 0..100 {
            relax.relax();
        }
    }

    #[test]
    fn yields() {
        returns::<Yield>();
    }

    #[test]
    fn spins() {
        returns::<Spin>();
    }

    #[test]
    fn loops() {
        returns::<Loop>();
    }

    #[test]
    fn backoff_saturates() {
        let mut relax = SpinBackoff::new();
        for _ in 0..=SpinBackoff::MAX * 2 {
            relax.relax();
        }
        assert_eq!(relax.shifts, SpinBackoff::MAX);
    }
}
