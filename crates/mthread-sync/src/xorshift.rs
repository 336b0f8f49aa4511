use std::cell::Cell;
use std::hash::{BuildHasher, RandomState};
use std::sync::atomic::{AtomicUsize, Ordering};

const FIXED_STATE: u64 = 0x9a7013f475bb8c23;

/// A fast, thread-local pseudorandom generator used to pick a randomized stealing order.
///
/// [xorshift*] tolerates weak seeding as long as the seed isn't zero, which is all a
/// work-stealing probe sequence needs.
///
/// [xorshift*]: https://en.wikipedia.org/wiki/Xorshift#xorshift*
pub struct XorShift64Star {
    state: Cell<u64>,
}

impl XorShift64Star {
    /// Returns a generator seeded with a fixed, non-zero state.
    ///
    /// Useful for initializing a `thread_local!` in `const` context; call
    /// [`Self::randomize`] once the owning thread is known to give workers distinct
    /// steal orders.
    #[inline(always)]
    pub const fn fixed() -> Self {
        Self {
            state: Cell::new(FIXED_STATE),
        }
    }

    /// Reseeds from a process-wide counter, so distinct workers get distinct sequences.
    pub fn randomize(&self) {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);

        let mut seed = 0;
        let rs = RandomState::new();
        while seed == 0 {
            seed = rs.hash_one(COUNTER.fetch_add(1, Ordering::Relaxed));
        }

        self.state.set(seed);
    }

    fn next(&self) -> u64 {
        let mut x = self.state.get();
        debug_assert_ne!(x, 0);
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state.set(x);
        x.wrapping_mul(0x2545_f491_4f6c_dd1d)
    }

    /// Returns a value in `0..n`.
    pub fn next_usize(&self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::XorShift64Star;

    #[test]
    fn stays_in_range() {
        let rng = XorShift64Star::fixed();
        for _ in 0..1000 {
            assert!(rng.next_usize(7) < 7);
        }
    }

    #[test]
    fn randomize_changes_sequence() {
        let a = XorShift64Star::fixed();
        let b = XorShift64Star::fixed();
        b.randomize();
        // Extremely unlikely to collide across 32 draws if reseeding worked.
        let seq_a: Vec<usize> = (0..32).map(|_| a.next_usize(1 << 20)).collect();
        let seq_b: Vec<usize> = (0..32).map(|_| b.next_usize(1 << 20)).collect();
        assert_ne!(seq_a, seq_b);
    }
}
