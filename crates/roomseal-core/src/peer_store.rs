//! Pairwise sessions by remote device key.
//!
//! One session per `(user, device, identity key)`. The store is owned by the
//! [`SessionEstablisher`](crate::establisher::SessionEstablisher) and
//! mutated only through `&mut` access, so it needs no internal locking.

use std::collections::HashMap;

use roomseal_crypto::{CryptoError, NONCE_RANDOM_SIZE, PairwiseMessage, PairwiseSession};
use thiserror::Error;

use crate::ids::{DeviceId, UserId};

/// Identifies one remote device identity.
///
/// A device that re-keys gets a new `PeerKey`, and therefore a new session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerKey {
    /// Remote user
    pub user_id: UserId,
    /// Remote device
    pub device_id: DeviceId,
    /// Remote X25519 identity key
    pub encryption_key: [u8; 32],
}

/// Errors from a single pairwise session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerSessionError {
    /// Message could not be decrypted or did not belong to this session
    #[error("pairwise decryption failed: {0}")]
    Decrypt(CryptoError),

    /// Session could not be created
    #[error("pairwise handshake failed: {0}")]
    Handshake(CryptoError),

    /// Sending chain exhausted
    #[error("pairwise session exhausted")]
    Exhausted,
}

impl PeerSessionError {
    /// Returns true if this error is fatal for the session.
    ///
    /// A message from too far behind or ahead is dropped without harming the
    /// session.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Decrypt(e) | Self::Handshake(e) => e.is_fatal(),
            Self::Exhausted => true,
        }
    }
}

/// Store errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A session for this exact key already exists
    #[error("session already exists for {user_id}/{device_id}")]
    AlreadyExists {
        /// Remote user
        user_id: UserId,
        /// Remote device
        device_id: DeviceId,
    },
}

impl StoreError {
    /// Always fatal: a duplicate session indicates an engine bug.
    pub fn is_fatal(&self) -> bool {
        true
    }
}

/// An established pairwise session with one remote device.
pub struct PeerSession<I> {
    key: PeerKey,
    session: PairwiseSession,
    established_at: I,
}

impl<I: Copy> PeerSession<I> {
    /// Wrap a session created by the handshake.
    pub fn new(key: PeerKey, session: PairwiseSession, established_at: I) -> Self {
        Self { key, session, established_at }
    }

    /// Remote device this session talks to.
    pub fn key(&self) -> &PeerKey {
        &self.key
    }

    /// When the handshake completed.
    pub fn established_at(&self) -> I {
        self.established_at
    }

    /// Session id shared by both sides.
    pub fn session_id(&self) -> String {
        self.session.session_id()
    }

    /// True if `message` is a pre-key message for this session.
    pub fn matches_prekey(&self, message: &PairwiseMessage) -> bool {
        self.session.matches_prekey(message)
    }

    /// Encrypt one message to the remote device.
    pub fn encrypt(
        &mut self,
        plaintext: &[u8],
        random_suffix: [u8; NONCE_RANDOM_SIZE],
    ) -> Result<PairwiseMessage, PeerSessionError> {
        self.session.encrypt(plaintext, random_suffix).map_err(|e| match e {
            CryptoError::GenerationOverflow { .. } => PeerSessionError::Exhausted,
            other => PeerSessionError::Handshake(other),
        })
    }

    /// Decrypt one message from the remote device.
    pub fn decrypt(&mut self, message: &PairwiseMessage) -> Result<Vec<u8>, PeerSessionError> {
        self.session.decrypt(message).map_err(PeerSessionError::Decrypt)
    }
}

impl<I> std::fmt::Debug for PeerSession<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("user_id", &self.key.user_id)
            .field("device_id", &self.key.device_id)
            .field("session_id", &self.session.session_id())
            .finish_non_exhaustive()
    }
}

/// All pairwise sessions of one identity.
pub struct PeerSessionStore<I> {
    sessions: HashMap<PeerKey, PeerSession<I>>,
}

impl<I> Default for PeerSessionStore<I> {
    fn default() -> Self {
        Self { sessions: HashMap::new() }
    }
}

impl<I: Copy> PeerSessionStore<I> {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Session for an exact key.
    pub fn get(&self, key: &PeerKey) -> Option<&PeerSession<I>> {
        self.sessions.get(key)
    }

    /// Mutable session for an exact key.
    pub fn get_mut(&mut self, key: &PeerKey) -> Option<&mut PeerSession<I>> {
        self.sessions.get_mut(key)
    }

    /// True if a session exists for this exact key.
    pub fn contains(&self, key: &PeerKey) -> bool {
        self.sessions.contains_key(key)
    }

    /// Insert a new session. Never overwrites.
    ///
    /// # Errors
    ///
    /// - `AlreadyExists` if a session is stored under the same key
    pub fn insert(&mut self, session: PeerSession<I>) -> Result<(), StoreError> {
        let key = session.key.clone();
        if self.sessions.contains_key(&key) {
            return Err(StoreError::AlreadyExists { user_id: key.user_id, device_id: key.device_id });
        }

        self.sessions.insert(key, session);
        Ok(())
    }

    /// Remove and return a session.
    pub fn remove(&mut self, key: &PeerKey) -> Option<PeerSession<I>> {
        self.sessions.remove(key)
    }

    /// Sessions with any identity key of the given device.
    pub fn sessions_for_device(&self, user_id: &UserId, device_id: &DeviceId) -> Vec<&PeerSession<I>> {
        self.sessions
            .values()
            .filter(|s| &s.key.user_id == user_id && &s.key.device_id == device_id)
            .collect()
    }

    /// Number of sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// True if the store holds no sessions.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
