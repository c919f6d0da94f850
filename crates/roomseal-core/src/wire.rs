//! JSON shapes exchanged with the homeserver and inside encrypted payloads.
//!
//! Keys and ciphertexts are unpadded base64 strings. Signatures are nested as
//! `signatures[user_id]["ed25519:<device_id>"]`.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{
    config::SIGNED_ONE_TIME_KEY_ALGORITHM,
    ids::{DeviceId, RoomId, UserId},
    transport::TransportError,
};

/// `signatures[user_id][key_id] = base64 signature`
pub type Signatures = BTreeMap<UserId, BTreeMap<String, String>>;

/// Ed25519 key id for a device, e.g. `ed25519:ALICEDEV`.
pub fn ed25519_key_id(device_id: &DeviceId) -> String {
    format!("ed25519:{device_id}")
}

/// Curve25519 key id for a device, e.g. `curve25519:ALICEDEV`.
pub fn curve25519_key_id(device_id: &DeviceId) -> String {
    format!("curve25519:{device_id}")
}

/// Signed identity key bundle of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceKeys {
    /// Owning user
    pub user_id: UserId,
    /// Device
    pub device_id: DeviceId,
    /// Supported encryption algorithms
    pub algorithms: Vec<String>,
    /// `curve25519:<device>` and `ed25519:<device>` public keys
    pub keys: BTreeMap<String, String>,
    /// Signatures over the canonical encoding of the other fields
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub signatures: Signatures,
}

impl DeviceKeys {
    /// Signature by `user_id` under `key_id`, if present.
    pub fn signature(&self, user_id: &UserId, key_id: &str) -> Option<&str> {
        self.signatures.get(user_id)?.get(key_id).map(String::as_str)
    }
}

/// A signed one-time prekey: `{"key": <base64>, "signatures": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedKey {
    /// Base64 X25519 public key
    pub key: String,
    /// Signature by the owning device over `{"key": ...}`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub signatures: Signatures,
}

/// Key upload request body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysUploadRequest {
    /// Device identity keys (sent on every publish)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_keys: Option<DeviceKeys>,
    /// One-time prekeys by key id (`signed_curve25519:<id>`)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub one_time_keys: BTreeMap<String, SignedKey>,
}

/// Key upload response body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysUploadResponse {
    /// Remaining one-time prekeys on the server, by algorithm
    #[serde(default)]
    pub one_time_key_counts: BTreeMap<String, u64>,
}

impl KeysUploadResponse {
    /// Remaining signed one-time prekeys. An absent count means none.
    pub fn signed_one_time_key_count(&self) -> u64 {
        self.one_time_key_counts.get(SIGNED_ONE_TIME_KEY_ALGORITHM).copied().unwrap_or(0)
    }
}

/// One device to claim a prekey for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceRef {
    /// Owning user
    pub user_id: UserId,
    /// Device
    pub device_id: DeviceId,
}

/// Claim response: at most one prekey per device, absent devices omitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysClaimResponse {
    /// `one_time_keys[user][device][key_id] = signed key`
    #[serde(default)]
    pub one_time_keys: BTreeMap<UserId, BTreeMap<DeviceId, BTreeMap<String, SignedKey>>>,
}

impl KeysClaimResponse {
    /// Remove and return the signed prekey claimed for a device.
    ///
    /// Only `signed_curve25519` keys are accepted; anything else counts as
    /// missing.
    pub fn take(&mut self, user_id: &UserId, device_id: &DeviceId) -> Option<(String, SignedKey)> {
        let keys = self.one_time_keys.get_mut(user_id)?.remove(device_id)?;
        let prefix = format!("{SIGNED_ONE_TIME_KEY_ALGORITHM}:");
        keys.into_iter().find(|(key_id, _)| key_id.starts_with(&prefix))
    }
}

/// Pairwise ciphertext for one recipient identity key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OlmCiphertext {
    /// 0 = pre-key message, 1 = normal message
    #[serde(rename = "type")]
    pub message_type: u8,
    /// Base64 encoded pairwise message
    pub body: String,
}

/// Content of an `m.room.encrypted` to-device event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OlmEncryptedContent {
    /// Always the pairwise algorithm
    pub algorithm: String,
    /// Sender's curve25519 identity key
    pub sender_key: String,
    /// Ciphertexts keyed by recipient curve25519 identity key
    pub ciphertext: BTreeMap<String, OlmCiphertext>,
}

/// `batch[user][device] = content`, sent in a single request.
pub type ToDeviceBatch = BTreeMap<UserId, BTreeMap<DeviceId, OlmEncryptedContent>>;

/// Plaintext inside a pairwise message.
///
/// Binds the event to the sender and intended recipient so a ciphertext
/// cannot be replayed to, or claimed from, another device. Senders fill
/// `content` with a typed reference; receivers decode it as a [`Value`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OlmPayload<C = Value> {
    /// Inner event type, e.g. `m.room_key`
    #[serde(rename = "type")]
    pub event_type: String,
    /// Inner event content
    pub content: C,
    /// Sending user
    pub sender: UserId,
    /// Sending device
    pub sender_device: DeviceId,
    /// Sender's keys; `ed25519` is its signing key
    pub keys: BTreeMap<String, String>,
    /// Intended recipient user
    pub recipient: UserId,
    /// Recipient's keys; `ed25519` is its signing key
    pub recipient_keys: BTreeMap<String, String>,
}

/// Content of an `m.room_key` event.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct RoomKeyContent {
    /// Group algorithm
    #[zeroize(skip)]
    pub algorithm: String,
    /// Room the key is for
    #[zeroize(skip)]
    pub room_id: RoomId,
    /// Group session id
    #[zeroize(skip)]
    pub session_id: String,
    /// Exported, signed group session key (base64)
    pub session_key: String,
}

impl fmt::Debug for RoomKeyContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomKeyContent")
            .field("algorithm", &self.algorithm)
            .field("room_id", &self.room_id)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

/// Content of an `m.room.encrypted` room event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MegolmEncryptedContent {
    /// Always the group algorithm
    pub algorithm: String,
    /// Sender's curve25519 identity key
    pub sender_key: String,
    /// Base64 encoded group message
    pub ciphertext: String,
    /// Group session id
    pub session_id: String,
    /// Sending device
    pub device_id: DeviceId,
}

/// Strongly typed decode of a JSON body.
///
/// Malformed input surfaces as [`TransportError::MalformedResponse`], which
/// the engine reports as a protocol error.
pub fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, TransportError> {
    serde_json::from_slice(bytes).map_err(|e| TransportError::MalformedResponse(e.to_string()))
}

/// Encode a value as JSON bytes.
pub(crate) fn encode_json<T: Serialize>(value: &T) -> Vec<u8> {
    let Ok(bytes) = serde_json::to_vec(value) else {
        unreachable!("wire types have string keys and serialize infallibly");
    };
    bytes
}
