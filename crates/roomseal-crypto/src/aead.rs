//! Message sealing using `XChaCha20-Poly1305`
//!
//! All functions are pure: random nonce material must be provided by the
//! caller.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};
use serde::{Deserialize, Serialize};

use crate::{error::CryptoError, ratchet::MessageKey};

/// Size of the random part of the nonce (20 bytes)
pub const NONCE_RANDOM_SIZE: usize = 20;

/// Poly1305 tag size (16 bytes)
const POLY1305_TAG_SIZE: usize = 16;

/// A ratchet-keyed ciphertext with the metadata needed to decrypt it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedMessage {
    /// The ratchet generation (for key derivation)
    pub generation: u32,
    /// The 24-byte `XChaCha20` nonce
    pub nonce: [u8; 24],
    /// The ciphertext including 16-byte Poly1305 tag
    pub ciphertext: Vec<u8>,
}

impl SealedMessage {
    /// Plaintext length (ciphertext length minus authentication tag).
    pub fn plaintext_len(&self) -> usize {
        self.ciphertext.len().saturating_sub(POLY1305_TAG_SIZE)
    }
}

/// Seal a message under a ratchet message key.
///
/// `associated_data` binds the ciphertext to its session; the same bytes
/// must be supplied to [`open_message`].
pub fn seal_message(
    plaintext: &[u8],
    message_key: &MessageKey,
    associated_data: &[u8],
    random_suffix: [u8; NONCE_RANDOM_SIZE],
) -> SealedMessage {
    let nonce = build_nonce(message_key.generation(), random_suffix);
    let ciphertext = encrypt_raw(message_key.key(), &nonce, plaintext, associated_data);

    SealedMessage { generation: message_key.generation(), nonce, ciphertext }
}

/// Open a message sealed with [`seal_message`].
///
/// # Errors
///
/// - `DecryptionFailed`: generation mismatch, wrong key, wrong associated
///   data or tampered ciphertext
pub fn open_message(
    sealed: &SealedMessage,
    message_key: &MessageKey,
    associated_data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if message_key.generation() != sealed.generation {
        return Err(CryptoError::DecryptionFailed {
            reason: format!(
                "generation mismatch: key is {}, message is {}",
                message_key.generation(),
                sealed.generation
            ),
        });
    }

    decrypt_raw(message_key.key(), &sealed.nonce, &sealed.ciphertext, associated_data)
}

/// Encrypt with an explicit key and nonce.
pub(crate) fn encrypt_raw(
    key: &[u8; 32],
    nonce: &[u8; 24],
    plaintext: &[u8],
    associated_data: &[u8],
) -> Vec<u8> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let payload = Payload { msg: plaintext, aad: associated_data };

    let Ok(ciphertext) = cipher.encrypt(XNonce::from_slice(nonce), payload) else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };
    ciphertext
}

/// Decrypt with an explicit key and nonce.
pub(crate) fn decrypt_raw(
    key: &[u8; 32],
    nonce: &[u8; 24],
    ciphertext: &[u8],
    associated_data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let payload = Payload { msg: ciphertext, aad: associated_data };

    cipher.decrypt(XNonce::from_slice(nonce), payload).map_err(|_| {
        CryptoError::DecryptionFailed { reason: "authentication failed".to_string() }
    })
}

/// Build a 24-byte nonce for `XChaCha20`.
///
/// Structure:
/// - bytes 0-3: generation (big-endian)
/// - bytes 4-23: random suffix (caller-provided)
fn build_nonce(generation: u32, random_suffix: [u8; NONCE_RANDOM_SIZE]) -> [u8; 24] {
    let mut nonce = [0u8; 24];
    nonce[0..4].copy_from_slice(&generation.to_be_bytes());
    nonce[4..24].copy_from_slice(&random_suffix);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratchet::SymmetricRatchet;

    fn key_at(seed_byte: u8, generation: u32) -> MessageKey {
        let mut ratchet = SymmetricRatchet::new(&[seed_byte; 32]);
        ratchet.advance_to(generation).unwrap()
    }

    #[test]
    fn seal_open_roundtrip() {
        let key = key_at(1, 0);
        let sealed = seal_message(b"Hello, World!", &key, b"session", [0xAB; NONCE_RANDOM_SIZE]);

        let opened = open_message(&sealed, &key, b"session").unwrap();
        assert_eq!(opened, b"Hello, World!");
        assert_eq!(sealed.plaintext_len(), 13);
    }

    #[test]
    fn sealed_message_carries_generation() {
        let key = key_at(1, 7);
        let sealed = seal_message(b"x", &key, b"", [0; NONCE_RANDOM_SIZE]);

        assert_eq!(sealed.generation, 7);
        assert_eq!(&sealed.nonce[0..4], &7u32.to_be_bytes());
    }

    #[test]
    fn wrong_associated_data_fails() {
        let key = key_at(2, 0);
        let sealed = seal_message(b"secret", &key, b"session-a", [0; NONCE_RANDOM_SIZE]);

        let result = open_message(&sealed, &key, b"session-b");
        assert!(matches!(
            result,
            Err(CryptoError::DecryptionFailed { reason }) if reason.contains("authentication")
        ));
    }

    #[test]
    fn generation_mismatch_fails_before_decrypting() {
        let key0 = key_at(3, 0);
        let key1 = key_at(3, 1);
        let sealed = seal_message(b"secret", &key0, b"", [0; NONCE_RANDOM_SIZE]);

        let result = open_message(&sealed, &key1, b"");
        assert!(matches!(
            result,
            Err(CryptoError::DecryptionFailed { reason }) if reason.contains("generation")
        ));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = key_at(4, 0);
        let mut sealed = seal_message(b"original", &key, b"", [0; NONCE_RANDOM_SIZE]);
        sealed.ciphertext[0] ^= 0xFF;

        assert!(open_message(&sealed, &key, b"").is_err());
    }

    #[test]
    fn ciphertext_overhead_is_tag_size() {
        let key = key_at(5, 0);
        let sealed = seal_message(b"test message", &key, b"", [0; NONCE_RANDOM_SIZE]);
        assert_eq!(sealed.ciphertext.len(), 12 + POLY1305_TAG_SIZE);
    }
}
