//! Group ratchet: one sender, many receivers
//!
//! The sender owns an [`OutboundGroupRatchet`]: a [`SymmetricRatchet`] plus a
//! per-session Ed25519 key. Every message is signed with that key, and the
//! session id *is* the public half, so receivers can attribute each message
//! to exactly one session without trusting the transport.
//!
//! To let others read, the sender exports a [`SessionKey`] (the chain key at
//! the current index, signed) and delivers it over pairwise sessions.
//! Receivers import it into an [`InboundGroupRatchet`], which can decrypt any
//! message from that index onward but nothing earlier.

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::{
    aead::{NONCE_RANDOM_SIZE, SealedMessage, open_message, seal_message},
    encoding::{decode_b64, encode_b64, from_cbor, to_cbor},
    error::CryptoError,
    ratchet::SymmetricRatchet,
    signing::{sign, signing_public_key, verify_signature},
};

/// Exported group session state, sufficient to decrypt from `index` onward.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey {
    index: u32,
    chain_key: [u8; 32],
    signing_public: [u8; 32],
    signature: Vec<u8>,
}

impl SessionKey {
    /// First message index this key can decrypt.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Session id this key belongs to.
    pub fn session_id(&self) -> String {
        encode_b64(&self.signing_public)
    }

    /// Encode for transport inside an encrypted pairwise payload.
    pub fn to_base64(&self) -> Zeroizing<String> {
        let bytes = Zeroizing::new(to_cbor(self));
        Zeroizing::new(encode_b64(&bytes))
    }

    /// Decode a key received over a pairwise session.
    ///
    /// The signature is checked on import, not here.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = Zeroizing::new(decode_b64(encoded)?);
        from_cbor(&bytes)
    }

    fn signed_bytes(index: u32, chain_key: &[u8; 32], signing_public: &[u8; 32]) -> Zeroizing<Vec<u8>> {
        let mut bytes = Zeroizing::new(Vec::with_capacity(68));
        bytes.extend_from_slice(&index.to_be_bytes());
        bytes.extend_from_slice(chain_key);
        bytes.extend_from_slice(signing_public);
        bytes
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKey")
            .field("session_id", &self.session_id())
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

/// An encrypted, signed group message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMessage {
    /// Encrypted payload; `body.generation` is the message index
    pub body: SealedMessage,
    /// Ed25519 signature by the session key over the sealed payload
    pub signature: Vec<u8>,
}

impl GroupMessage {
    /// Message index within its session.
    pub fn message_index(&self) -> u32 {
        self.body.generation
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        to_cbor(self)
    }

    /// Parse from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        from_cbor(bytes)
    }

    fn signed_bytes(body: &SealedMessage) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(28 + body.ciphertext.len());
        bytes.extend_from_slice(&body.generation.to_be_bytes());
        bytes.extend_from_slice(&body.nonce);
        bytes.extend_from_slice(&body.ciphertext);
        bytes
    }
}

/// Serializable state of either side of a group ratchet.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub enum GroupRatchetPickle {
    /// Sending side
    Outbound {
        /// Chain key at `generation`
        chain_key: [u8; 32],
        /// Next message index
        generation: u32,
        /// Ed25519 signing seed
        signing_seed: [u8; 32],
    },
    /// Receiving side
    Inbound {
        /// Chain key at the first known index
        initial_chain_key: [u8; 32],
        /// First known index
        initial_generation: u32,
        /// Chain key at the furthest decrypted position
        latest_chain_key: [u8; 32],
        /// Generation of `latest_chain_key`
        latest_generation: u32,
        /// Session public signing key
        signing_public: [u8; 32],
    },
}

/// Sending side of a group session.
pub struct OutboundGroupRatchet {
    ratchet: SymmetricRatchet,
    signing_seed: Zeroizing<[u8; 32]>,
    signing_public: [u8; 32],
}

impl OutboundGroupRatchet {
    /// Create a fresh session from caller-provided random material.
    pub fn new(mut chain_seed: [u8; 32], mut signing_seed: [u8; 32]) -> Self {
        let ratchet = SymmetricRatchet::new(&chain_seed);
        let signing_public = signing_public_key(&signing_seed);
        let session = Self { ratchet, signing_seed: Zeroizing::new(signing_seed), signing_public };

        chain_seed.zeroize();
        signing_seed.zeroize();
        session
    }

    /// Session id: unpadded base64 of the session signing key.
    pub fn session_id(&self) -> String {
        encode_b64(&self.signing_public)
    }

    /// Index the next encrypted message will carry.
    pub fn message_index(&self) -> u32 {
        self.ratchet.generation()
    }

    /// True once no further message can be encrypted.
    pub fn is_exhausted(&self) -> bool {
        self.ratchet.is_exhausted()
    }

    /// Export the signed session key at the current index.
    pub fn session_key(&self) -> SessionKey {
        let index = self.ratchet.generation();
        let chain_key = *self.ratchet.chain_key();
        let signed = SessionKey::signed_bytes(index, &chain_key, &self.signing_public);
        let signature = sign(&self.signing_seed, &signed).to_vec();

        SessionKey { index, chain_key, signing_public: self.signing_public, signature }
    }

    /// Encrypt and sign one message, advancing the ratchet.
    ///
    /// # Errors
    ///
    /// - `GenerationOverflow` once the index space is exhausted
    pub fn encrypt(
        &mut self,
        plaintext: &[u8],
        random_suffix: [u8; NONCE_RANDOM_SIZE],
    ) -> Result<GroupMessage, CryptoError> {
        let key = self.ratchet.advance()?;
        let body = seal_message(plaintext, &key, &self.signing_public, random_suffix);
        let signature = sign(&self.signing_seed, &GroupMessage::signed_bytes(&body)).to_vec();

        Ok(GroupMessage { body, signature })
    }

    /// Snapshot for persistence.
    pub fn pickle(&self) -> GroupRatchetPickle {
        GroupRatchetPickle::Outbound {
            chain_key: *self.ratchet.chain_key(),
            generation: self.ratchet.generation(),
            signing_seed: *self.signing_seed,
        }
    }

    /// Restore from a snapshot.
    ///
    /// # Errors
    ///
    /// - `InvalidPickle` if the snapshot is of the receiving side
    pub fn from_pickle(pickle: &GroupRatchetPickle) -> Result<Self, CryptoError> {
        let GroupRatchetPickle::Outbound { chain_key, generation, signing_seed } = pickle else {
            return Err(CryptoError::InvalidPickle);
        };

        Ok(Self {
            ratchet: SymmetricRatchet::from_parts(chain_key, *generation),
            signing_seed: Zeroizing::new(*signing_seed),
            signing_public: signing_public_key(signing_seed),
        })
    }
}

/// Receiving side of a group session.
pub struct InboundGroupRatchet {
    initial: SymmetricRatchet,
    latest: SymmetricRatchet,
    signing_public: [u8; 32],
}

impl InboundGroupRatchet {
    /// Import a session key after checking its signature.
    ///
    /// # Errors
    ///
    /// - `InvalidSignature` if the key was not signed by its session key
    pub fn import(key: &SessionKey) -> Result<Self, CryptoError> {
        let signed = SessionKey::signed_bytes(key.index, &key.chain_key, &key.signing_public);
        verify_signature(&key.signing_public, &signed, &key.signature)?;

        Ok(Self {
            initial: SymmetricRatchet::from_parts(&key.chain_key, key.index),
            latest: SymmetricRatchet::from_parts(&key.chain_key, key.index),
            signing_public: key.signing_public,
        })
    }

    /// Session id this ratchet decrypts.
    pub fn session_id(&self) -> String {
        encode_b64(&self.signing_public)
    }

    /// Earliest message index this ratchet can decrypt.
    pub fn first_known_index(&self) -> u32 {
        self.initial.generation()
    }

    /// Verify and decrypt a message.
    ///
    /// Messages at or beyond the furthest index seen so far are decrypted by
    /// stepping forward from there; earlier ones are re-derived from the
    /// first known index. Either way the skip is bounded by
    /// [`MAX_SKIP`](crate::ratchet::MAX_SKIP).
    ///
    /// # Errors
    ///
    /// - `InvalidSignature` if the message was not signed by this session
    /// - `RatchetTooFarBehind` if the index precedes the first known index
    ///   or is too far ahead
    /// - `DecryptionFailed` if the ciphertext does not authenticate
    pub fn decrypt(&mut self, message: &GroupMessage) -> Result<Vec<u8>, CryptoError> {
        verify_signature(
            &self.signing_public,
            &GroupMessage::signed_bytes(&message.body),
            &message.signature,
        )?;

        let target = message.body.generation;
        let from_latest = target >= self.latest.generation();
        let start = if from_latest { &self.latest } else { &self.initial };

        let mut trial = SymmetricRatchet::from_parts(start.chain_key(), start.generation());
        let key = trial.advance_to(target)?;
        let plaintext = open_message(&message.body, &key, &self.signing_public)?;

        if from_latest {
            self.latest = trial;
        }
        Ok(plaintext)
    }

    /// Snapshot for persistence.
    pub fn pickle(&self) -> GroupRatchetPickle {
        GroupRatchetPickle::Inbound {
            initial_chain_key: *self.initial.chain_key(),
            initial_generation: self.initial.generation(),
            latest_chain_key: *self.latest.chain_key(),
            latest_generation: self.latest.generation(),
            signing_public: self.signing_public,
        }
    }

    /// Restore from a snapshot.
    ///
    /// # Errors
    ///
    /// - `InvalidPickle` if the snapshot is of the sending side
    pub fn from_pickle(pickle: &GroupRatchetPickle) -> Result<Self, CryptoError> {
        let GroupRatchetPickle::Inbound {
            initial_chain_key,
            initial_generation,
            latest_chain_key,
            latest_generation,
            signing_public,
        } = pickle
        else {
            return Err(CryptoError::InvalidPickle);
        };

        Ok(Self {
            initial: SymmetricRatchet::from_parts(initial_chain_key, *initial_generation),
            latest: SymmetricRatchet::from_parts(latest_chain_key, *latest_generation),
            signing_public: *signing_public,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbound() -> OutboundGroupRatchet {
        OutboundGroupRatchet::new([1; 32], [2; 32])
    }

    #[test]
    fn session_id_is_signing_key() {
        let session = outbound();
        assert_eq!(session.session_id(), encode_b64(&signing_public_key(&[2; 32])));
    }

    #[test]
    fn imported_key_decrypts_following_messages() {
        let mut sender = outbound();
        let mut receiver = InboundGroupRatchet::import(&sender.session_key()).unwrap();

        assert_eq!(receiver.session_id(), sender.session_id());
        for i in 0..3u8 {
            let message = sender.encrypt(&[i; 4], [i; NONCE_RANDOM_SIZE]).unwrap();
            assert_eq!(receiver.decrypt(&message).unwrap(), vec![i; 4]);
        }
    }

    #[test]
    fn late_joiner_cannot_read_history() {
        let mut sender = outbound();
        let early = sender.encrypt(b"before", [0; NONCE_RANDOM_SIZE]).unwrap();

        let mut receiver = InboundGroupRatchet::import(&sender.session_key()).unwrap();
        assert_eq!(receiver.first_known_index(), 1);

        assert!(matches!(
            receiver.decrypt(&early),
            Err(CryptoError::RatchetTooFarBehind { .. })
        ));

        let later = sender.encrypt(b"after", [0; NONCE_RANDOM_SIZE]).unwrap();
        assert_eq!(receiver.decrypt(&later).unwrap(), b"after");
    }

    #[test]
    fn out_of_order_messages_decrypt() {
        let mut sender = outbound();
        let mut receiver = InboundGroupRatchet::import(&sender.session_key()).unwrap();

        let first = sender.encrypt(b"one", [0; NONCE_RANDOM_SIZE]).unwrap();
        let second = sender.encrypt(b"two", [0; NONCE_RANDOM_SIZE]).unwrap();

        assert_eq!(receiver.decrypt(&second).unwrap(), b"two");
        assert_eq!(receiver.decrypt(&first).unwrap(), b"one");
    }

    #[test]
    fn forged_signature_is_rejected() {
        let mut sender = outbound();
        let mut receiver = InboundGroupRatchet::import(&sender.session_key()).unwrap();

        let mut message = sender.encrypt(b"hi", [0; NONCE_RANDOM_SIZE]).unwrap();
        message.signature[0] ^= 0x01;

        assert_eq!(receiver.decrypt(&message), Err(CryptoError::InvalidSignature));
    }

    #[test]
    fn tampered_session_key_is_rejected() {
        let sender = outbound();
        let mut key = sender.session_key();
        key.chain_key[0] ^= 0x01;

        assert!(matches!(InboundGroupRatchet::import(&key), Err(CryptoError::InvalidSignature)));
    }

    #[test]
    fn session_key_base64_roundtrip() {
        let sender = outbound();
        let key = sender.session_key();

        let decoded = SessionKey::from_base64(&key.to_base64()).unwrap();
        assert_eq!(decoded.index(), key.index());
        assert_eq!(decoded.session_id(), key.session_id());
        assert!(InboundGroupRatchet::import(&decoded).is_ok());
    }

    #[test]
    fn outbound_pickle_resumes_sequence() {
        let mut sender = outbound();
        sender.encrypt(b"a", [0; NONCE_RANDOM_SIZE]).unwrap();

        let mut restored = OutboundGroupRatchet::from_pickle(&sender.pickle()).unwrap();
        assert_eq!(restored.session_id(), sender.session_id());
        assert_eq!(restored.message_index(), 1);

        let mut receiver = InboundGroupRatchet::import(&sender.session_key()).unwrap();
        let message = restored.encrypt(b"b", [0; NONCE_RANDOM_SIZE]).unwrap();
        assert_eq!(receiver.decrypt(&message).unwrap(), b"b");
    }

    #[test]
    fn pickle_side_mismatch_is_rejected() {
        let sender = outbound();
        let receiver = InboundGroupRatchet::import(&sender.session_key()).unwrap();

        assert!(matches!(
            OutboundGroupRatchet::from_pickle(&receiver.pickle()),
            Err(CryptoError::InvalidPickle)
        ));
        assert!(matches!(
            InboundGroupRatchet::from_pickle(&sender.pickle()),
            Err(CryptoError::InvalidPickle)
        ));
    }

    #[test]
    fn exhausted_session_refuses_to_encrypt() {
        let sender = outbound();
        let GroupRatchetPickle::Outbound { chain_key, signing_seed, .. } = sender.pickle() else {
            unreachable!();
        };
        let mut near_end = OutboundGroupRatchet::from_pickle(&GroupRatchetPickle::Outbound {
            chain_key,
            generation: u32::MAX,
            signing_seed,
        })
        .unwrap();

        assert!(near_end.is_exhausted());
        assert!(matches!(
            near_end.encrypt(b"x", [0; NONCE_RANDOM_SIZE]),
            Err(CryptoError::GenerationOverflow { .. })
        ));
    }
}
