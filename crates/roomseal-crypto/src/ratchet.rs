//! Symmetric ratchet shared by the pairwise and group layers
//!
//! # Security Properties
//!
//! - Forward Secrecy: Old chain keys are overwritten when advancing
//! - Key Uniqueness: Each generation produces a unique message key
//! - Determinism: Same chain key and generation always produce the same keys

use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// Label for deriving the next chain key
const CHAIN_LABEL: &[u8] = b"chain";

/// Label for deriving a message key
const MESSAGE_LABEL: &[u8] = b"message";

/// Maximum number of generations to skip when catching up.
/// This limits the work done when receiving out-of-order messages.
pub const MAX_SKIP: u32 = 1000;

/// A message key derived from the ratchet.
///
/// Used for a single encryption or decryption, then dropped (and zeroized).
pub struct MessageKey {
    /// The 32-byte symmetric key for XChaCha20-Poly1305
    key: [u8; 32],
    /// The generation (ratchet step) this key was derived from
    generation: u32,
}

impl MessageKey {
    /// 32-byte symmetric key for XChaCha20-Poly1305 AEAD.
    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    /// Ratchet generation this key was derived from.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl Drop for MessageKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Forward-secure symmetric ratchet.
///
/// Each [`advance()`](Self::advance) call:
/// 1. Derives a message key from the current chain key
/// 2. Derives the next chain key
/// 3. Overwrites the old chain key (forward secrecy)
pub struct SymmetricRatchet {
    /// Current chain key (32 bytes)
    chain_key: [u8; 32],
    /// Current generation (number of `advance()` calls since generation 0)
    generation: u32,
}

impl SymmetricRatchet {
    /// Create a new ratchet from a seed at generation 0.
    pub fn new(seed: &[u8; 32]) -> Self {
        Self::from_parts(seed, 0)
    }

    /// Resume a ratchet from an exported chain key at a known generation.
    ///
    /// Used when importing a group session key or restoring a pickle.
    pub fn from_parts(chain_key: &[u8; 32], generation: u32) -> Self {
        Self { chain_key: *chain_key, generation }
    }

    /// Current generation number.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Current chain key.
    ///
    /// Exposing it hands out the ability to derive every future message key.
    /// Only session-key export and pickling read it.
    pub(crate) fn chain_key(&self) -> &[u8; 32] {
        &self.chain_key
    }

    /// True once the generation counter cannot advance any further.
    pub fn is_exhausted(&self) -> bool {
        self.generation == u32::MAX
    }

    /// Advance the ratchet and derive the message key for the current
    /// generation.
    ///
    /// Fails with [`CryptoError::GenerationOverflow`] instead of wrapping once
    /// the counter space is used up.
    pub fn advance(&mut self) -> Result<MessageKey, CryptoError> {
        if self.is_exhausted() {
            return Err(CryptoError::GenerationOverflow { current: self.generation });
        }

        let message_key = self.derive(MESSAGE_LABEL);
        let next_chain_key = self.derive(CHAIN_LABEL);

        self.chain_key.zeroize();
        self.chain_key = next_chain_key;

        let current_gen = self.generation;
        self.generation += 1;

        Ok(MessageKey { key: message_key, generation: current_gen })
    }

    /// Advance the ratchet to a specific generation and return its key.
    ///
    /// Generations behind the current position are unrecoverable. Skips
    /// longer than [`MAX_SKIP`] are refused.
    pub fn advance_to(&mut self, target: u32) -> Result<MessageKey, CryptoError> {
        if target < self.generation || target - self.generation > MAX_SKIP {
            return Err(CryptoError::RatchetTooFarBehind {
                current: self.generation,
                requested: target,
            });
        }

        loop {
            let key = self.advance()?;
            if key.generation() == target {
                return Ok(key);
            }
        }
    }

    fn derive(&self, label: &[u8]) -> [u8; 32] {
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.chain_key) else {
            unreachable!("HMAC-SHA256 accepts any key size");
        };
        mac.update(label);
        let result = mac.finalize().into_bytes();

        let mut key = [0u8; 32];
        key.copy_from_slice(&result);
        key
    }
}

impl Drop for SymmetricRatchet {
    fn drop(&mut self) {
        self.chain_key.zeroize();
    }
}
