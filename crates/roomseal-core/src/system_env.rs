//! Production Environment implementation using system time and RNG.

use crate::env::Environment;

/// Production environment using system time and cryptographic RNG.
///
/// # Security
///
/// The RNG uses getrandom which provides OS-level cryptographic randomness
/// (e.g., /dev/urandom on Linux, `BCryptGenRandom` on Windows). Suitable for
/// identity seeds, one-time prekeys, ephemeral keys and nonces.
///
/// # Panics
///
/// Panics if the OS RNG fails. An engine without functioning cryptographic
/// randomness cannot generate keys safely, and continuing would compromise
/// every secret it creates.
#[derive(Clone, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = std::time::Instant;

    #[allow(clippy::disallowed_methods)]
    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer)
            .expect("invariant: OS RNG failure is unrecoverable - keys cannot be generated safely");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    #[allow(clippy::disallowed_methods)]
    fn system_env_time_advances() {
        let env = SystemEnv::new();

        let t1 = env.now();
        std::thread::sleep(Duration::from_millis(10));
        let t2 = env.now();

        assert!(t2 > t1, "Time should advance");
    }

    #[test]
    fn system_env_random_arrays_differ() {
        let env = SystemEnv::new();

        let a: [u8; 32] = env.random_array();
        let b: [u8; 32] = env.random_array();

        // Extremely unlikely to be equal if random
        assert_ne!(a, b, "Random bytes should differ");
    }

    #[test]
    fn system_env_random_bytes_fills_buffer() {
        let env = SystemEnv::new();

        let mut bytes = [0u8; 64];
        env.random_bytes(&mut bytes);

        let non_zero_count = bytes.iter().filter(|&&b| b != 0).count();
        assert!(non_zero_count > 32, "Most bytes should be non-zero");
    }
}
