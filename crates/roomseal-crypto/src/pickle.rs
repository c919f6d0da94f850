//! Encrypted at-rest snapshots ("pickles")
//!
//! ```text
//! pickle = version (1 byte) || nonce (24 bytes) || XChaCha20-Poly1305(body)
//! key    = HKDF-SHA256(pickle_key, "roomsealPickleV1")
//! ```
//!
//! The version byte is authenticated as associated data. Every failure to
//! open a pickle (short input, unknown version, wrong key, tampering) is
//! reported as [`CryptoError::InvalidPickle`] so callers cannot distinguish
//! a wrong key from a corrupted blob.

use zeroize::Zeroizing;

use crate::{
    aead::{decrypt_raw, encrypt_raw},
    derivation::derive_pickle_key,
    error::CryptoError,
};

/// Current pickle format version.
pub const PICKLE_VERSION: u8 = 1;

const HEADER_LEN: usize = 1 + 24;

/// Encrypt `plaintext` under a caller-held pickle key.
///
/// `nonce` must be fresh random bytes.
pub fn seal_pickle(pickle_key: &[u8], plaintext: &[u8], nonce: [u8; 24]) -> Vec<u8> {
    let key = derive_pickle_key(pickle_key);
    let ciphertext = encrypt_raw(&key, &nonce, plaintext, &[PICKLE_VERSION]);

    let mut out = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    out.push(PICKLE_VERSION);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    out
}

/// Decrypt a pickle produced by [`seal_pickle`].
pub fn open_pickle(pickle_key: &[u8], pickle: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if pickle.len() < HEADER_LEN || pickle[0] != PICKLE_VERSION {
        return Err(CryptoError::InvalidPickle);
    }

    let mut nonce = [0u8; 24];
    nonce.copy_from_slice(&pickle[1..HEADER_LEN]);

    let key = derive_pickle_key(pickle_key);
    decrypt_raw(&key, &nonce, &pickle[HEADER_LEN..], &[PICKLE_VERSION])
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::InvalidPickle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let sealed = seal_pickle(b"pickle key", b"state", [3; 24]);
        assert_eq!(sealed[0], PICKLE_VERSION);
        assert_eq!(open_pickle(b"pickle key", &sealed).unwrap().as_slice(), b"state");
    }

    #[test]
    fn wrong_key_is_invalid_pickle() {
        let sealed = seal_pickle(b"pickle key", b"state", [3; 24]);
        assert_eq!(open_pickle(b"other key", &sealed), Err(CryptoError::InvalidPickle));
    }

    #[test]
    fn corruption_is_invalid_pickle() {
        let mut sealed = seal_pickle(b"k", b"state", [3; 24]);
        let last = sealed.len() - 1;
        sealed[last] ^= 0x80;
        assert_eq!(open_pickle(b"k", &sealed), Err(CryptoError::InvalidPickle));
    }

    #[test]
    fn short_or_unknown_version_is_invalid_pickle() {
        assert_eq!(open_pickle(b"k", &[PICKLE_VERSION; 10]), Err(CryptoError::InvalidPickle));

        let mut sealed = seal_pickle(b"k", b"state", [3; 24]);
        sealed[0] = 9;
        assert_eq!(open_pickle(b"k", &sealed), Err(CryptoError::InvalidPickle));
    }
}
