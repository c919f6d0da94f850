//! Room-level group sessions.
//!
//! [`GroupSession`] is the sending side for one room: it wraps the outbound
//! group ratchet and remembers which devices already hold its key.
//! [`InboundGroupSession`] is the receiving side, created from an `m.room_key`
//! payload.

use std::{collections::HashSet, time::Duration};

use roomseal_crypto::{
    CryptoError, GroupMessage, GroupRatchetPickle, InboundGroupRatchet, OutboundGroupRatchet,
    SessionKey,
    encoding::{decode_b64, encode_b64, from_cbor, to_cbor},
    open_pickle, seal_pickle,
};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::{
    config::{MEGOLM_ALGORITHM, RotationPolicy},
    env::Environment,
    error::GroupSessionError,
    ids::{DeviceId, RoomId, UserId},
    peer_store::PeerKey,
    wire::{MegolmEncryptedContent, RoomKeyContent},
};

/// Outbound group session for one room.
pub struct GroupSession<I> {
    room_id: RoomId,
    ratchet: OutboundGroupRatchet,
    created_at: I,
    message_count: u64,
    shared_with: HashSet<PeerKey>,
}

#[derive(Serialize, Deserialize)]
struct SharedDevice {
    user_id: UserId,
    device_id: DeviceId,
    encryption_key: [u8; 32],
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct GroupSessionPickle {
    #[zeroize(skip)]
    room_id: RoomId,
    #[zeroize(skip)]
    message_count: u64,
    #[zeroize(skip)]
    shared_with: Vec<SharedDevice>,
    ratchet: GroupRatchetPickle,
}

impl<I> GroupSession<I>
where
    I: Copy + Ord + std::ops::Sub<Output = Duration>,
{
    /// Create a fresh session: new chain seed, new session signing key.
    pub fn generate<E: Environment<Instant = I>>(room_id: RoomId, env: &E) -> Self {
        let ratchet = OutboundGroupRatchet::new(env.random_array(), env.random_array());

        tracing::info!(
            room_id = %room_id,
            session_id = %ratchet.session_id(),
            "Created outbound group session"
        );

        Self { room_id, ratchet, created_at: env.now(), message_count: 0, shared_with: HashSet::new() }
    }

    /// Room this session encrypts for.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Session id (base64 of the session signing key).
    pub fn session_id(&self) -> String {
        self.ratchet.session_id()
    }

    /// Index the next message will carry.
    pub fn message_index(&self) -> u32 {
        self.ratchet.message_index()
    }

    /// Messages encrypted so far.
    pub fn message_count(&self) -> u64 {
        self.message_count
    }

    /// When the session was created (or restored).
    pub fn created_at(&self) -> I {
        self.created_at
    }

    /// Export the signed session key at the current index.
    pub fn session_key(&self) -> SessionKey {
        self.ratchet.session_key()
    }

    /// `m.room_key` content distributing the current session key.
    pub fn room_key_content(&self) -> RoomKeyContent {
        RoomKeyContent {
            algorithm: MEGOLM_ALGORITHM.to_string(),
            room_id: self.room_id.clone(),
            session_id: self.session_id(),
            session_key: self.session_key().to_base64().to_string(),
        }
    }

    /// Encrypt one room message.
    ///
    /// # Errors
    ///
    /// - `RatchetExhausted` at the end of the index space; the index never
    ///   wraps
    pub fn encrypt<E: Environment<Instant = I>>(
        &mut self,
        plaintext: &[u8],
        env: &E,
    ) -> Result<GroupMessage, GroupSessionError> {
        let message = self.ratchet.encrypt(plaintext, env.random_array()).map_err(|e| match e {
            CryptoError::GenerationOverflow { .. } => GroupSessionError::RatchetExhausted,
            other => GroupSessionError::Decrypt(other),
        })?;

        self.message_count += 1;
        Ok(message)
    }

    /// Wrap an encrypted message as room event content.
    pub fn encrypted_content(
        &self,
        message: &GroupMessage,
        sender_key: String,
        device_id: DeviceId,
    ) -> MegolmEncryptedContent {
        MegolmEncryptedContent {
            algorithm: MEGOLM_ALGORITHM.to_string(),
            sender_key,
            ciphertext: encode_b64(&message.to_bytes()),
            session_id: self.session_id(),
            device_id,
        }
    }

    /// True if the policy says this session should be replaced before the
    /// next message.
    pub fn needs_rotation(&self, policy: &RotationPolicy, now: I) -> bool {
        self.ratchet.is_exhausted()
            || self.message_count >= policy.max_messages
            || now - self.created_at >= policy.max_age
    }

    /// Record that a device received this session's key.
    pub fn mark_shared(&mut self, device: PeerKey) {
        self.shared_with.insert(device);
    }

    /// Has this device received the key?
    pub fn is_shared_with(&self, device: &PeerKey) -> bool {
        self.shared_with.contains(device)
    }

    /// Number of devices holding the key.
    pub fn shared_count(&self) -> usize {
        self.shared_with.len()
    }

    /// Encrypt the session under `pickle_key`.
    ///
    /// The creation instant is not persisted; a restored session's age
    /// restarts at restore time.
    pub fn pickle<E: Environment>(&self, pickle_key: &[u8], env: &E) -> Vec<u8> {
        let pickle = GroupSessionPickle {
            room_id: self.room_id.clone(),
            message_count: self.message_count,
            shared_with: self
                .shared_with
                .iter()
                .map(|key| SharedDevice {
                    user_id: key.user_id.clone(),
                    device_id: key.device_id.clone(),
                    encryption_key: key.encryption_key,
                })
                .collect(),
            ratchet: self.ratchet.pickle(),
        };

        let plaintext = Zeroizing::new(to_cbor(&pickle));
        seal_pickle(pickle_key, &plaintext, env.random_array())
    }

    /// Restore a session pickled with [`pickle`](Self::pickle).
    ///
    /// # Errors
    ///
    /// - `InvalidPickle` if malformed or the key is wrong
    pub fn from_pickle<E: Environment<Instant = I>>(
        pickle_key: &[u8],
        pickle: &[u8],
        env: &E,
    ) -> Result<Self, GroupSessionError> {
        let plaintext =
            open_pickle(pickle_key, pickle).map_err(|_| GroupSessionError::InvalidPickle)?;
        let pickle: GroupSessionPickle =
            from_cbor(&plaintext).map_err(|_| GroupSessionError::InvalidPickle)?;
        let ratchet = OutboundGroupRatchet::from_pickle(&pickle.ratchet)
            .map_err(|_| GroupSessionError::InvalidPickle)?;

        Ok(Self {
            room_id: pickle.room_id.clone(),
            ratchet,
            created_at: env.now(),
            message_count: pickle.message_count,
            shared_with: pickle
                .shared_with
                .iter()
                .map(|d| PeerKey {
                    user_id: d.user_id.clone(),
                    device_id: d.device_id.clone(),
                    encryption_key: d.encryption_key,
                })
                .collect(),
        })
    }
}

impl<I> std::fmt::Debug for GroupSession<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupSession")
            .field("room_id", &self.room_id)
            .field("session_id", &self.ratchet.session_id())
            .field("message_index", &self.ratchet.message_index())
            .field("shared_with", &self.shared_with.len())
            .finish_non_exhaustive()
    }
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct InboundGroupSessionPickle {
    #[zeroize(skip)]
    room_id: RoomId,
    #[zeroize(skip)]
    sender_key: String,
    ratchet: GroupRatchetPickle,
}

/// Receiving side of another device's group session.
pub struct InboundGroupSession {
    room_id: RoomId,
    sender_key: String,
    ratchet: InboundGroupRatchet,
}

impl InboundGroupSession {
    /// Import a room key received from `sender_key` over a pairwise session.
    ///
    /// # Errors
    ///
    /// - `InvalidSessionKey` if the key does not parse, is not signed by its
    ///   session, or does not match the advertised session id
    pub fn import(sender_key: String, content: &RoomKeyContent) -> Result<Self, GroupSessionError> {
        let key = SessionKey::from_base64(&content.session_key)
            .map_err(GroupSessionError::InvalidSessionKey)?;
        let ratchet =
            InboundGroupRatchet::import(&key).map_err(GroupSessionError::InvalidSessionKey)?;

        if ratchet.session_id() != content.session_id {
            return Err(GroupSessionError::InvalidSessionKey(CryptoError::Malformed {
                reason: "session id does not match session key".to_string(),
            }));
        }

        Ok(Self { room_id: content.room_id.clone(), sender_key, ratchet })
    }

    /// Room the session belongs to.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Curve25519 key of the device that shared the session.
    pub fn sender_key(&self) -> &str {
        &self.sender_key
    }

    /// Session id.
    pub fn session_id(&self) -> String {
        self.ratchet.session_id()
    }

    /// Earliest decryptable message index.
    pub fn first_known_index(&self) -> u32 {
        self.ratchet.first_known_index()
    }

    /// Verify and decrypt a room event. Returns the plaintext and message
    /// index.
    pub fn decrypt(
        &mut self,
        content: &MegolmEncryptedContent,
    ) -> Result<(Vec<u8>, u32), GroupSessionError> {
        let bytes = decode_b64(&content.ciphertext).map_err(GroupSessionError::Decrypt)?;
        let message = GroupMessage::from_bytes(&bytes).map_err(GroupSessionError::Decrypt)?;
        let plaintext = self.ratchet.decrypt(&message).map_err(GroupSessionError::Decrypt)?;

        Ok((plaintext, message.message_index()))
    }

    /// Encrypt the session under `pickle_key`.
    pub fn pickle<E: Environment>(&self, pickle_key: &[u8], env: &E) -> Vec<u8> {
        let pickle = InboundGroupSessionPickle {
            room_id: self.room_id.clone(),
            sender_key: self.sender_key.clone(),
            ratchet: self.ratchet.pickle(),
        };

        let plaintext = Zeroizing::new(to_cbor(&pickle));
        seal_pickle(pickle_key, &plaintext, env.random_array())
    }

    /// Restore a session pickled with [`pickle`](Self::pickle).
    pub fn from_pickle(pickle_key: &[u8], pickle: &[u8]) -> Result<Self, GroupSessionError> {
        let plaintext =
            open_pickle(pickle_key, pickle).map_err(|_| GroupSessionError::InvalidPickle)?;
        let pickle: InboundGroupSessionPickle =
            from_cbor(&plaintext).map_err(|_| GroupSessionError::InvalidPickle)?;
        let ratchet = InboundGroupRatchet::from_pickle(&pickle.ratchet)
            .map_err(|_| GroupSessionError::InvalidPickle)?;

        Ok(Self { room_id: pickle.room_id.clone(), sender_key: pickle.sender_key.clone(), ratchet })
    }
}

impl std::fmt::Debug for InboundGroupSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundGroupSession")
            .field("room_id", &self.room_id)
            .field("session_id", &self.ratchet.session_id())
            .field("first_known_index", &self.ratchet.first_known_index())
            .finish_non_exhaustive()
    }
}
