//! Pairwise sessions: prekey handshake plus symmetric chains
//!
//! The initiator combines its identity key and a fresh ephemeral (base) key
//! with the responder's identity key and one claimed one-time prekey:
//!
//! ```text
//! S = DH(IK_a, OTK_b) || DH(EK_a, IK_b) || DH(EK_a, OTK_b)
//! (initiator chain, responder chain) = HKDF(S)
//! ```
//!
//! Until the initiator receives a reply, every message it sends is a
//! [`PairwiseMessage::PreKey`] carrying the public handshake inputs, so the
//! responder can create its side of the session from whichever message
//! arrives first.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use crate::{
    aead::{NONCE_RANDOM_SIZE, SealedMessage, open_message, seal_message},
    derivation::derive_pairwise_chains,
    encoding::{encode_b64, from_cbor, to_cbor},
    error::CryptoError,
    ratchet::SymmetricRatchet,
};

/// Message exchanged over a pairwise session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairwiseMessage {
    /// First messages from the initiator, carrying the handshake inputs.
    PreKey {
        /// Initiator's X25519 identity key
        identity_key: [u8; 32],
        /// Initiator's ephemeral X25519 key for this session
        base_key: [u8; 32],
        /// Responder's one-time prekey the initiator claimed
        one_time_key: [u8; 32],
        /// Encrypted payload
        body: SealedMessage,
    },
    /// Messages on an established session.
    Normal {
        /// Encrypted payload
        body: SealedMessage,
    },
}

impl PairwiseMessage {
    /// Wire message type: 0 for pre-key messages, 1 for normal messages.
    pub fn message_type(&self) -> u8 {
        match self {
            Self::PreKey { .. } => 0,
            Self::Normal { .. } => 1,
        }
    }

    /// One-time prekey this message was addressed to, if it is a pre-key
    /// message.
    pub fn one_time_key(&self) -> Option<&[u8; 32]> {
        match self {
            Self::PreKey { one_time_key, .. } => Some(one_time_key),
            Self::Normal { .. } => None,
        }
    }

    /// Encrypted payload.
    pub fn body(&self) -> &SealedMessage {
        match self {
            Self::PreKey { body, .. } | Self::Normal { body } => body,
        }
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        to_cbor(self)
    }

    /// Parse from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        from_cbor(bytes)
    }
}

/// X25519 public key for a secret scalar.
pub fn x25519_public_key(secret: &[u8; 32]) -> [u8; 32] {
    PublicKey::from(&StaticSecret::from(*secret)).to_bytes()
}

/// Public handshake inputs repeated on every pre-key message.
#[derive(Clone, Copy)]
struct PreKeyHeader {
    identity_key: [u8; 32],
    one_time_key: [u8; 32],
}

/// One side of an established pairwise session.
pub struct PairwiseSession {
    session_id: [u8; 32],
    base_key: [u8; 32],
    sending: SymmetricRatchet,
    receiving: SymmetricRatchet,
    /// Present on the initiator until the first reply is decrypted.
    pending_prekey: Option<PreKeyHeader>,
}

impl PairwiseSession {
    /// Create the initiator side of a session.
    ///
    /// `ephemeral_seed` must be fresh random bytes; it is zeroized before
    /// returning.
    ///
    /// The responder's keys must already be signature-verified.
    ///
    /// # Errors
    ///
    /// - `Malformed` if any DH output is all zeros (low-order remote key)
    pub fn outbound(
        our_identity_secret: &[u8; 32],
        mut ephemeral_seed: [u8; 32],
        their_identity_key: &[u8; 32],
        their_one_time_key: &[u8; 32],
    ) -> Result<Self, CryptoError> {
        let our_identity = StaticSecret::from(*our_identity_secret);
        let ephemeral = StaticSecret::from(ephemeral_seed);
        ephemeral_seed.zeroize();

        let our_identity_key = PublicKey::from(&our_identity).to_bytes();
        let base_key = PublicKey::from(&ephemeral).to_bytes();
        let their_identity = PublicKey::from(*their_identity_key);
        let their_one_time = PublicKey::from(*their_one_time_key);

        let shared = concat_dh([
            our_identity.diffie_hellman(&their_one_time),
            ephemeral.diffie_hellman(&their_identity),
            ephemeral.diffie_hellman(&their_one_time),
        ])?;

        let chains = derive_pairwise_chains(shared.as_ref());
        let session_id =
            compute_session_id(&our_identity_key, &base_key, their_identity_key, their_one_time_key);

        Ok(Self {
            session_id,
            base_key,
            sending: SymmetricRatchet::new(&chains.initiator),
            receiving: SymmetricRatchet::new(&chains.responder),
            pending_prekey: Some(PreKeyHeader {
                identity_key: our_identity_key,
                one_time_key: *their_one_time_key,
            }),
        })
    }

    /// Create the responder side of a session from a pre-key message and
    /// decrypt that message.
    ///
    /// `their_identity_key` is the sender's identity key as known from the
    /// device directory; a pre-key message claiming a different identity is
    /// rejected.
    pub fn inbound(
        our_identity_secret: &[u8; 32],
        our_one_time_secret: &[u8; 32],
        their_identity_key: &[u8; 32],
        message: &PairwiseMessage,
    ) -> Result<(Self, Vec<u8>), CryptoError> {
        let PairwiseMessage::PreKey { identity_key, base_key, one_time_key, .. } = message else {
            return Err(CryptoError::NotPreKeyMessage);
        };

        if identity_key != their_identity_key {
            return Err(CryptoError::DecryptionFailed {
                reason: "pre-key message identity does not match sender".to_string(),
            });
        }

        let our_identity = StaticSecret::from(*our_identity_secret);
        let our_one_time = StaticSecret::from(*our_one_time_secret);
        if PublicKey::from(&our_one_time).as_bytes() != one_time_key {
            return Err(CryptoError::DecryptionFailed {
                reason: "pre-key message addressed to a different one-time key".to_string(),
            });
        }

        let their_identity = PublicKey::from(*identity_key);
        let their_base = PublicKey::from(*base_key);

        let shared = concat_dh([
            our_one_time.diffie_hellman(&their_identity),
            our_identity.diffie_hellman(&their_base),
            our_one_time.diffie_hellman(&their_base),
        ])?;

        let chains = derive_pairwise_chains(shared.as_ref());
        let our_identity_key = PublicKey::from(&our_identity).to_bytes();
        let session_id = compute_session_id(identity_key, base_key, &our_identity_key, one_time_key);

        let mut session = Self {
            session_id,
            base_key: *base_key,
            sending: SymmetricRatchet::new(&chains.responder),
            receiving: SymmetricRatchet::new(&chains.initiator),
            pending_prekey: None,
        };

        let plaintext = session.decrypt(message)?;
        Ok((session, plaintext))
    }

    /// Session identifier (unpadded base64), identical on both sides.
    pub fn session_id(&self) -> String {
        encode_b64(&self.session_id)
    }

    /// True if `message` is a pre-key message belonging to this session.
    pub fn matches_prekey(&self, message: &PairwiseMessage) -> bool {
        matches!(message, PairwiseMessage::PreKey { base_key, .. } if *base_key == self.base_key)
    }

    /// True while this (initiator) side still sends pre-key messages.
    pub fn is_pending_prekey(&self) -> bool {
        self.pending_prekey.is_some()
    }

    /// Generation of the next outgoing message.
    pub fn sending_index(&self) -> u32 {
        self.sending.generation()
    }

    /// Encrypt a message, advancing the sending chain.
    pub fn encrypt(
        &mut self,
        plaintext: &[u8],
        random_suffix: [u8; NONCE_RANDOM_SIZE],
    ) -> Result<PairwiseMessage, CryptoError> {
        let key = self.sending.advance()?;
        let body = seal_message(plaintext, &key, &self.session_id, random_suffix);

        Ok(match self.pending_prekey {
            Some(header) => PairwiseMessage::PreKey {
                identity_key: header.identity_key,
                base_key: self.base_key,
                one_time_key: header.one_time_key,
                body,
            },
            None => PairwiseMessage::Normal { body },
        })
    }

    /// Decrypt a message, advancing the receiving chain only if the message
    /// authenticates.
    pub fn decrypt(&mut self, message: &PairwiseMessage) -> Result<Vec<u8>, CryptoError> {
        if matches!(message, PairwiseMessage::PreKey { .. }) && !self.matches_prekey(message) {
            return Err(CryptoError::DecryptionFailed {
                reason: "pre-key message belongs to a different session".to_string(),
            });
        }

        let body = message.body();
        let mut trial =
            SymmetricRatchet::from_parts(self.receiving.chain_key(), self.receiving.generation());
        let key = trial.advance_to(body.generation)?;
        let plaintext = open_message(body, &key, &self.session_id)?;

        self.receiving = trial;
        if matches!(message, PairwiseMessage::Normal { .. }) {
            self.pending_prekey = None;
        }

        Ok(plaintext)
    }
}

fn concat_dh(outputs: [x25519_dalek::SharedSecret; 3]) -> Result<Zeroizing<[u8; 96]>, CryptoError> {
    let mut shared = Zeroizing::new([0u8; 96]);
    for (i, output) in outputs.iter().enumerate() {
        if !output.was_contributory() {
            return Err(CryptoError::Malformed {
                reason: "non-contributory Diffie-Hellman output".to_string(),
            });
        }
        shared[i * 32..(i + 1) * 32].copy_from_slice(output.as_bytes());
    }
    Ok(shared)
}

fn compute_session_id(
    initiator_identity: &[u8; 32],
    base_key: &[u8; 32],
    responder_identity: &[u8; 32],
    one_time_key: &[u8; 32],
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(initiator_identity);
    hasher.update(base_key);
    hasher.update(responder_identity);
    hasher.update(one_time_key);
    hasher.finalize().into()
}
