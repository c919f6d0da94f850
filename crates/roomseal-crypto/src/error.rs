//! Error types for primitive operations

use thiserror::Error;

/// Errors from the ratchet, AEAD, signature, handshake and pickle primitives.
///
/// These never cross the engine's public boundary directly; `roomseal-core`
/// wraps them into its own taxonomy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Ratchet cannot reach the requested generation.
    ///
    /// Either the generation is behind the ratchet (keys already discarded)
    /// or too far ahead to skip to.
    #[error("ratchet cannot reach generation {requested} from {current}")]
    RatchetTooFarBehind {
        /// Current ratchet generation
        current: u32,
        /// Requested generation
        requested: u32,
    },

    /// Ratchet generation would overflow
    #[error("ratchet generation overflow at {current}")]
    GenerationOverflow {
        /// Current generation when overflow was detected
        current: u32,
    },

    /// Decryption failed (authentication tag mismatch)
    #[error("decryption failed: {reason}")]
    DecryptionFailed {
        /// Reason for decryption failure
        reason: String,
    },

    /// Invalid key material length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected key length
        expected: usize,
        /// Actual key length
        actual: usize,
    },

    /// Ed25519 signature did not verify (or was not parseable)
    #[error("signature verification failed")]
    InvalidSignature,

    /// Pickle could not be opened.
    ///
    /// A wrong pickle key and corrupted data are indistinguishable.
    #[error("invalid pickle")]
    InvalidPickle,

    /// Encoded message or key could not be parsed
    #[error("malformed encoding: {reason}")]
    Malformed {
        /// What failed to parse
        reason: String,
    },

    /// An inbound session can only be created from a pre-key message
    #[error("expected a pre-key message")]
    NotPreKeyMessage,
}

impl CryptoError {
    /// Returns true if this error is fatal (unrecoverable)
    ///
    /// Fatal errors indicate tampering, exhausted state or corrupt inputs.
    /// Non-fatal errors may succeed once the peer state catches up.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::DecryptionFailed { .. }
            | Self::InvalidKeyLength { .. }
            | Self::GenerationOverflow { .. }
            | Self::InvalidSignature
            | Self::InvalidPickle
            | Self::Malformed { .. }
            | Self::NotPreKeyMessage => true,

            Self::RatchetTooFarBehind { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decryption_failed_is_fatal() {
        let err = CryptoError::DecryptionFailed { reason: "tag mismatch".to_string() };
        assert!(err.is_fatal());
    }

    #[test]
    fn ratchet_behind_is_not_fatal() {
        let err = CryptoError::RatchetTooFarBehind { current: 3, requested: 1 };
        assert!(!err.is_fatal());
    }

    #[test]
    fn error_display() {
        let err = CryptoError::RatchetTooFarBehind { current: 10, requested: 100 };
        assert_eq!(err.to_string(), "ratchet cannot reach generation 100 from 10");
        assert_eq!(CryptoError::InvalidPickle.to_string(), "invalid pickle");
    }
}
