//! Environment abstraction for deterministic testing.
//!
//! Decouples engine logic from system resources (time, randomness). Enables
//! deterministic simulation (virtual clock, seeded RNG) and production use with
//! real system resources. The engine is synchronous, so unlike a networked
//! driver there is no sleep primitive here.

use std::time::Duration;

/// Abstract environment providing time and randomness.
///
/// # Safety
///
/// Implementations MUST guarantee:
///
/// - `now()` never goes backwards
/// - `random_bytes()` uses cryptographically secure entropy in production
/// - Methods are infallible except in exceptional circumstances (e.g., OS
///   entropy exhaustion, incorrect simulation setup)
pub trait Environment: Clone + Send + Sync + 'static {
    /// The specific instant type used by this environment.
    ///
    /// Production environments use `std::time::Instant`, while simulation
    /// environments use virtual time.
    type Instant: Copy + Ord + Send + Sync + std::fmt::Debug + std::ops::Sub<Output = Duration>;

    /// Current time (monotonic).
    ///
    /// # Invariants
    ///
    /// - Subsequent calls must return times >= previous calls.
    fn now(&self) -> Self::Instant;

    /// Fills the provided buffer with random bytes.
    ///
    /// # Invariants
    ///
    /// - Given the same RNG seed, this produces the same sequence of bytes
    /// - Uses cryptographically secure RNG
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`.
    ///
    /// Used for transaction ids.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Generates a fixed-size random array (seeds, nonces).
    ///
    /// Callers holding secrets in the result are responsible for zeroizing it.
    fn random_array<const N: usize>(&self) -> [u8; N] {
        let mut bytes = [0u8; N];
        self.random_bytes(&mut bytes);
        bytes
    }
}

#[cfg(test)]
pub(crate) mod test_env {
    //! Seeded environment for unit tests inside this crate.
    //!
    //! Integration tests use `roomseal_harness::SimEnv`; unit tests cannot,
    //! since the harness links its own copy of this crate.

    #![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use rand::{RngCore, SeedableRng};
    use rand_chacha::ChaCha20Rng;

    use super::Environment;

    #[derive(Clone)]
    pub(crate) struct TestEnv {
        rng: Arc<Mutex<ChaCha20Rng>>,
        clock: Arc<Mutex<Duration>>,
    }

    impl TestEnv {
        pub(crate) fn with_seed(seed: u64) -> Self {
            Self {
                rng: Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(seed))),
                clock: Arc::new(Mutex::new(Duration::ZERO)),
            }
        }

        pub(crate) fn advance(&self, by: Duration) {
            *self.clock.lock().expect("clock poisoned") += by;
        }
    }

    impl Environment for TestEnv {
        type Instant = Duration;

        fn now(&self) -> Duration {
            *self.clock.lock().expect("clock poisoned")
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            self.rng.lock().expect("rng poisoned").fill_bytes(buffer);
        }
    }
}
