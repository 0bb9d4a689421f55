//! Low-level concurrency utility.

use std::sync::atomic::{
    Ordering::{AcqRel, Acquire},
    AtomicBool,
};


/// Single-winner flag that can be claimed once.
///
/// Any number of racers may call [`claim`](Self::claim) concurrently. Exactly one of them
/// observes `true`; every other call, concurrent or later, observes `false`.
#[derive(Debug, Default)]
pub struct Claim {
    // transitions from false to true exactly once. the thread that performs the transition is
    // the winner.
    claimed: AtomicBool,
}

impl Claim {
    /// Construct unclaimed.
    pub const fn new() -> Self {
        Claim { claimed: AtomicBool::new(false) }
    }

    /// Try to atomically claim the flag. Returns whether this call won.
    pub fn claim(&self) -> bool {
        // already claimed: lose without attempting the CAS
        if self.claimed.load(Acquire) {
            return false;
        }
        self.claimed
            .compare_exchange(false, true, AcqRel, Acquire)
            .is_ok()
    }

    /// Whether some racer already claimed the flag.
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Acquire)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering::Relaxed},
            Arc,
            Barrier,
        },
        thread,
    };

    #[test]
    fn claim_once() {
        let claim = Claim::new();
        assert!(!claim.is_claimed());
        assert!(claim.claim());
        assert!(claim.is_claimed());
        assert!(!claim.claim());
    }

    #[test]
    fn exactly_one_winner_under_contention() {
        for _ in 0..200 {
            let claim = Arc::new(Claim::new());
            let winners = Arc::new(AtomicUsize::new(0));
            let barrier = Arc::new(Barrier::new(8));
            let joins = (0..8)
                .map(|_| {
                    let claim = Arc::clone(&claim);
                    let winners = Arc::clone(&winners);
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        if claim.claim() {
                            winners.fetch_add(1, Relaxed);
                        }
                    })
                })
                .collect::<Vec<_>>();
            for join in joins {
                join.join().unwrap();
            }
            assert_eq!(winners.load(Relaxed), 1);
        }
    }
}
