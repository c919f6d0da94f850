//! Error types for the session engine.
//!
//! Each layer has its own enum; [`EngineError`] is what public engine
//! operations return. Primitive [`CryptoError`]s are wrapped at the identity,
//! pairwise session and group session boundaries and never surface on their
//! own.

use roomseal_crypto::CryptoError;
use thiserror::Error;

use crate::{
    establisher::{EstablishReport, SkippedDevice},
    ids::{DeviceId, RoomId, UserId},
    peer_store::{PeerSessionError, StoreError},
    transport::TransportError,
};

/// Errors from [`Identity`](crate::identity::Identity) lifecycle operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// Keys requested before `generate()` or `restore()`
    #[error("identity is not initialized")]
    NotInitialized,

    /// `generate()` or `restore()` called on an identity that already holds
    /// a secret
    #[error("identity secret already allocated")]
    AlreadyAllocated,

    /// Operation on a destroyed identity
    #[error("identity has been destroyed")]
    Destroyed,

    /// `destroy()` called twice
    #[error("identity destroyed twice")]
    DoubleDestroy,

    /// Pickle is malformed or the pickle key is wrong
    #[error("invalid pickle")]
    InvalidPickle,

    /// No local one-time prekey matches the one named in a handshake
    #[error("unknown one-time prekey")]
    UnknownOneTimeKey,

    /// Payload could not be encoded for signing
    #[error("encoding failed: {0}")]
    Encoding(String),
}

impl IdentityError {
    /// Returns true if this error indicates a programmer error or an
    /// unusable identity.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::NotInitialized
            | Self::AlreadyAllocated
            | Self::Destroyed
            | Self::DoubleDestroy
            | Self::Encoding(_) => true,

            Self::InvalidPickle | Self::UnknownOneTimeKey => false,
        }
    }
}

/// Errors from group sessions (either side).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GroupSessionError {
    /// The message index space is used up; the session must be replaced
    #[error("group session ratchet exhausted")]
    RatchetExhausted,

    /// Received session key failed its signature check or did not parse
    #[error("invalid session key: {0}")]
    InvalidSessionKey(CryptoError),

    /// Room message failed verification or decryption
    #[error("group decryption failed: {0}")]
    Decrypt(CryptoError),

    /// Pickle is malformed or the pickle key is wrong
    #[error("invalid pickle")]
    InvalidPickle,
}

impl GroupSessionError {
    /// Returns true if the session cannot be used any further.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::RatchetExhausted => true,
            Self::InvalidSessionKey(_) | Self::InvalidPickle => false,
            Self::Decrypt(e) => e.is_fatal(),
        }
    }
}

/// Errors returned by engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Identity lifecycle error
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// Server unreachable or returned an error
    #[error("network error: {0}")]
    Network(TransportError),

    /// Server or peer sent something that does not parse
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No device could receive the room key
    #[error("no recipients: all {} devices were skipped", .skipped.len())]
    NoRecipients {
        /// Every device considered and why it was skipped
        skipped: Vec<SkippedDevice>,
    },

    /// Room key delivery failed after pairwise sessions were established.
    ///
    /// The sessions in `report` are kept.
    #[error("room key delivery failed: {source}")]
    Delivery {
        /// What the pass achieved before delivery failed
        report: Box<EstablishReport>,
        /// The transport failure
        source: TransportError,
    },

    /// Group session error
    #[error(transparent)]
    GroupSession(#[from] GroupSessionError),

    /// Pairwise session error
    #[error(transparent)]
    PeerSession(#[from] PeerSessionError),

    /// Session store invariant violated
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Sender device keys did not verify, or the message claims a different
    /// sender key
    #[error("unverified sender {user_id}/{device_id}")]
    UnverifiedSender {
        /// Claimed sender
        user_id: UserId,
        /// Claimed sender device
        device_id: DeviceId,
    },

    /// To-device message carries no ciphertext for this device
    #[error("message is not addressed to this device")]
    NotForThisDevice,

    /// Decrypted payload names a different sender or recipient
    #[error("payload binding mismatch: {0}")]
    PayloadMismatch(String),

    /// No inbound group session with this id
    #[error("unknown group session {session_id}")]
    UnknownGroupSession {
        /// Session id from the event
        session_id: String,
    },

    /// Room key could not be distributed to anyone yet
    #[error("room {room_id} has no ready group session")]
    RoomNotReady {
        /// Room
        room_id: RoomId,
    },
}

impl EngineError {
    /// Returns true if the error indicates an engine bug or an unusable
    /// identity. Callers should stop using the engine instance.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Identity(e) => e.is_fatal(),
            Self::Store(e) => e.is_fatal(),
            Self::Network(_)
            | Self::Protocol(_)
            | Self::NoRecipients { .. }
            | Self::Delivery { .. }
            | Self::GroupSession(_)
            | Self::PeerSession(_)
            | Self::UnverifiedSender { .. }
            | Self::NotForThisDevice
            | Self::PayloadMismatch(_)
            | Self::UnknownGroupSession { .. }
            | Self::RoomNotReady { .. } => false,
        }
    }

    /// Returns true if calling the same operation again may succeed without
    /// any other change.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(e) | Self::Delivery { source: e, .. } => e.is_transient(),
            Self::NoRecipients { .. } | Self::RoomNotReady { .. } => true,
            _ => false,
        }
    }
}

impl From<TransportError> for EngineError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::MalformedResponse(reason) => Self::Protocol(reason),
            other => Self::Network(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_response_is_protocol_error() {
        let err = EngineError::from(TransportError::MalformedResponse("bad".to_string()));
        assert!(matches!(err, EngineError::Protocol(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn network_errors_are_retryable() {
        let err = EngineError::from(TransportError::Timeout);
        assert!(matches!(err, EngineError::Network(TransportError::Timeout)));
        assert!(err.is_retryable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn lifecycle_misuse_is_fatal() {
        assert!(EngineError::from(IdentityError::DoubleDestroy).is_fatal());
        assert!(EngineError::from(IdentityError::AlreadyAllocated).is_fatal());
        assert!(!EngineError::from(IdentityError::InvalidPickle).is_fatal());
    }

    #[test]
    fn no_recipients_is_recoverable() {
        let err = EngineError::NoRecipients { skipped: Vec::new() };
        assert!(!err.is_fatal());
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "no recipients: all 0 devices were skipped");
    }
}
