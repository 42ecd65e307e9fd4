//! Process-unique 64-bit identifier streams.
//!
//! Each owning container (rendering context, pipeline, shader object)
//! carries its own stream: an atomic xorshift64 state advanced once per
//! issued identifier. Identifiers are unique for the life of the process,
//! not cryptographic, and are never persisted across runs.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;

/// One xorshift64 permutation step. A nonzero state never reaches zero.
#[inline]
fn shuffle(mut state: u64) -> u64 {
    state ^= state >> 12;
    state ^= state << 25;
    state ^= state >> 27;
    state
}

/// A per-container UID generator.
///
/// The state is advanced with a CAS loop, so concurrent callers on the
/// same stream always observe distinct identifiers.
pub struct UidStream {
    state: AtomicU64,
}

impl UidStream {
    /// Creates a stream seeded from 64 random bits.
    ///
    /// The seed is drawn from `u32::MAX..=u64::MAX`, which keeps the
    /// state nonzero (zero is the xorshift fixed point).
    pub fn new() -> Self {
        let seed = rand::thread_rng().gen_range(u32::MAX as u64..=u64::MAX);
        Self {
            state: AtomicU64::new(seed),
        }
    }

    /// Creates a stream with an explicit seed, for reproducible tests.
    pub fn with_seed(seed: u64) -> Self {
        assert!(seed != 0, "UID stream seed must be nonzero");
        Self {
            state: AtomicU64::new(seed),
        }
    }

    /// Issues the next identifier in the stream.
    pub fn next(&self) -> u64 {
        let previous = self
            .state
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |s| Some(shuffle(s)))
            .expect("xorshift update never fails");
        shuffle(previous)
    }
}

impl Default for UidStream {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn seeded_streams_are_reproducible() {
        let a = UidStream::with_seed(0x1234_5678_9abc_def0);
        let b = UidStream::with_seed(0x1234_5678_9abc_def0);
        for _ in 0..64 {
            assert_eq!(a.next(), b.next());
        }
    }

    #[test]
    fn identifiers_are_unique_and_nonzero() {
        let stream = UidStream::new();
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let uid = stream.next();
            assert_ne!(uid, 0);
            assert!(seen.insert(uid), "UID issued twice");
        }
    }

    #[test]
    fn concurrent_callers_never_collide() {
        let stream = Arc::new(UidStream::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let stream = stream.clone();
            handles.push(std::thread::spawn(move || {
                (0..2_000).map(|_| stream.next()).collect::<Vec<_>>()
            }));
        }
        let mut seen = HashSet::new();
        for handle in handles {
            for uid in handle.join().unwrap() {
                assert!(seen.insert(uid), "UID issued twice across threads");
            }
        }
    }

    #[test]
    #[should_panic]
    fn zero_seed_is_rejected() {
        let _ = UidStream::with_seed(0);
    }
}
