//! Ed25519 signing over caller-held seeds

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};

use crate::error::CryptoError;

/// Ed25519 public key for a 32-byte signing seed.
pub fn signing_public_key(seed: &[u8; 32]) -> [u8; 32] {
    SigningKey::from_bytes(seed).verifying_key().to_bytes()
}

/// Sign `message` with the key derived from `seed`.
///
/// The expanded signing key only lives for the duration of the call and is
/// zeroized when dropped.
pub fn sign(seed: &[u8; 32], message: &[u8]) -> [u8; 64] {
    SigningKey::from_bytes(seed).sign(message).to_bytes()
}

/// Verify an Ed25519 signature.
///
/// Rejects malformed public keys and signatures as well as signatures that do
/// not verify. Uses strict verification (no small-order keys, canonical `S`).
pub fn verify_signature(
    public_key: &[u8; 32],
    message: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    let key = VerifyingKey::from_bytes(public_key).map_err(|_| CryptoError::InvalidSignature)?;
    let signature = Signature::from_slice(signature).map_err(|_| CryptoError::InvalidSignature)?;

    key.verify_strict(message, &signature).map_err(|_| CryptoError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: [u8; 32] = [7u8; 32];

    #[test]
    fn sign_verify_roundtrip() {
        let public = signing_public_key(&SEED);
        let signature = sign(&SEED, b"payload");

        assert!(verify_signature(&public, b"payload", &signature).is_ok());
    }

    #[test]
    fn modified_message_fails() {
        let public = signing_public_key(&SEED);
        let signature = sign(&SEED, b"payload");

        assert_eq!(
            verify_signature(&public, b"payloaD", &signature),
            Err(CryptoError::InvalidSignature)
        );
    }

    #[test]
    fn wrong_key_fails() {
        let other = signing_public_key(&[8u8; 32]);
        let signature = sign(&SEED, b"payload");

        assert!(verify_signature(&other, b"payload", &signature).is_err());
    }

    #[test]
    fn truncated_signature_fails() {
        let public = signing_public_key(&SEED);
        let signature = sign(&SEED, b"payload");

        assert!(verify_signature(&public, b"payload", &signature[..63]).is_err());
    }

    #[test]
    fn signing_is_deterministic() {
        assert_eq!(sign(&SEED, b"m"), sign(&SEED, b"m"));
    }
}
