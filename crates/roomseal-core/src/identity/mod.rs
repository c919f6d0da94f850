//! The local device's long-lived key material.
//!
//! An [`Identity`] owns one secret handle: a 64-byte [`SecureBuffer`] holding
//! the Ed25519 signing seed (bytes `0..32`) and the X25519 identity secret
//! (bytes `32..64`). The handle is allocated once, never copied, and wiped on
//! `destroy()` or drop. Signing keys are materialized from it only for the
//! duration of a single signature.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized ──generate()/restore()──► Ready ──destroy()──► Destroyed
//!                                                 destroy() again: DoubleDestroy
//! ```

mod budget;
mod one_time_keys;

use std::{collections::BTreeMap, fmt};

pub use budget::OneTimePrekeyBudget;
use one_time_keys::{OneTimeKeyPickle, OneTimeKeyPool, one_time_key_id};
use roomseal_crypto::{
    SecureBuffer, canonical_json,
    encoding::{encode_b64, from_cbor, to_cbor},
    open_pickle, seal_pickle, sign, signing_public_key, x25519_public_key,
};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::{
    config::{EngineConfig, MEGOLM_ALGORITHM, OLM_ALGORITHM},
    env::Environment,
    error::{EngineError, IdentityError},
    ids::{DeviceId, UserId},
    transport::{Homeserver, PickleStore},
    wire::{DeviceKeys, KeysUploadRequest, SignedKey, Signatures, curve25519_key_id, ed25519_key_id},
};

/// Length of the combined secret handle.
const SECRET_LEN: usize = 64;

/// Public identity keys of this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityKeys {
    /// X25519 identity key
    pub encryption: [u8; 32],
    /// Ed25519 signing key
    pub signing: [u8; 32],
}

impl IdentityKeys {
    /// X25519 identity key, base64.
    pub fn encryption_b64(&self) -> String {
        encode_b64(&self.encryption)
    }

    /// Ed25519 signing key, base64.
    pub fn signing_b64(&self) -> String {
        encode_b64(&self.signing)
    }
}

/// Outcome of [`Identity::publish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishResult {
    /// One-time prekeys the server held before this publish
    pub remaining_before: usize,
    /// Fresh prekeys generated locally
    pub generated: usize,
    /// Prekeys uploaded in this publish
    pub uploaded: usize,
    /// One-time prekeys the server holds after this publish
    pub remaining_after: usize,
}

struct Secrets {
    handle: SecureBuffer,
    keys: IdentityKeys,
    one_time_keys: OneTimeKeyPool,
}

enum State {
    Uninitialized,
    Ready(Secrets),
    Destroyed(SecureBuffer),
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct IdentityPickle {
    #[zeroize(skip)]
    user_id: UserId,
    #[zeroize(skip)]
    device_id: DeviceId,
    secret: Vec<u8>,
    one_time_keys: Vec<OneTimeKeyPickle>,
    next_one_time_key_id: u64,
}

/// This device's identity keys and one-time prekeys.
pub struct Identity {
    user_id: UserId,
    device_id: DeviceId,
    state: State,
}

impl Identity {
    /// Create an uninitialized identity for `user_id`/`device_id`.
    pub fn new(user_id: UserId, device_id: DeviceId) -> Self {
        Self { user_id, device_id, state: State::Uninitialized }
    }

    /// Create an identity with freshly generated keys.
    pub fn generated<E: Environment>(user_id: UserId, device_id: DeviceId, env: &E) -> Self {
        let mut identity = Self::new(user_id, device_id);
        let Ok(()) = identity.generate(env) else {
            unreachable!("a new identity is uninitialized");
        };
        identity
    }

    /// Owning user.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// This device.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Allocate the secret handle from the environment's CSPRNG.
    ///
    /// # Errors
    ///
    /// - `AlreadyAllocated` if keys were already generated or restored
    /// - `Destroyed` after `destroy()`
    pub fn generate<E: Environment>(&mut self, env: &E) -> Result<(), IdentityError> {
        self.ensure_uninitialized()?;

        let mut handle = SecureBuffer::zeroed(SECRET_LEN);
        env.random_bytes(handle.as_bytes_mut());
        let keys = derive_public_keys(&handle);

        self.state = State::Ready(Secrets { handle, keys, one_time_keys: OneTimeKeyPool::default() });

        tracing::info!(
            user_id = %self.user_id,
            device_id = %self.device_id,
            signing_key = %keys.signing_b64(),
            "Generated device identity"
        );
        Ok(())
    }

    /// Restore keys and prekeys from a pickle.
    ///
    /// The pickle must belong to this user and device.
    ///
    /// # Errors
    ///
    /// - `InvalidPickle` if the pickle is malformed, the key is wrong, or it
    ///   belongs to another device (indistinguishable)
    /// - `AlreadyAllocated` / `Destroyed` as for [`generate`](Self::generate)
    pub fn restore(&mut self, pickle_key: &[u8], pickle: &[u8]) -> Result<(), IdentityError> {
        self.ensure_uninitialized()?;

        let (user_id, device_id, secrets) = unpickle(pickle_key, pickle)?;
        if user_id != self.user_id || device_id != self.device_id {
            return Err(IdentityError::InvalidPickle);
        }

        self.state = State::Ready(secrets);
        tracing::debug!(user_id = %self.user_id, device_id = %self.device_id, "Restored identity");
        Ok(())
    }

    /// Construct an identity directly from a pickle.
    pub fn from_pickle(pickle_key: &[u8], pickle: &[u8]) -> Result<Self, IdentityError> {
        let (user_id, device_id, secrets) = unpickle(pickle_key, pickle)?;
        Ok(Self { user_id, device_id, state: State::Ready(secrets) })
    }

    /// Public identity keys.
    ///
    /// # Errors
    ///
    /// - `NotInitialized` before `generate()`/`restore()`
    /// - `Destroyed` after `destroy()`
    pub fn identity_keys(&self) -> Result<IdentityKeys, IdentityError> {
        Ok(self.secrets()?.keys)
    }

    /// Ed25519 signature by the device signing key.
    pub fn sign(&self, message: &[u8]) -> Result<[u8; 64], IdentityError> {
        Ok(sign(self.signing_seed()?, message))
    }

    /// Base64 signature over the canonical JSON encoding of `value`.
    pub fn sign_json<T: Serialize>(&self, value: &T) -> Result<String, IdentityError> {
        let canonical =
            canonical_json(value).map_err(|e| IdentityError::Encoding(e.to_string()))?;
        Ok(encode_b64(&self.sign(&canonical)?))
    }

    /// Signed device key bundle advertising both algorithms.
    pub fn device_keys(&self) -> Result<DeviceKeys, IdentityError> {
        let keys = self.identity_keys()?;
        let mut bundle = DeviceKeys {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            algorithms: vec![OLM_ALGORITHM.to_string(), MEGOLM_ALGORITHM.to_string()],
            keys: BTreeMap::from([
                (curve25519_key_id(&self.device_id), keys.encryption_b64()),
                (ed25519_key_id(&self.device_id), keys.signing_b64()),
            ]),
            signatures: BTreeMap::new(),
        };

        let signature = self.sign_json(&bundle)?;
        bundle.signatures = self.signatures_with(signature);
        Ok(bundle)
    }

    /// Upload device keys and top up one-time prekeys.
    ///
    /// 1. Uploads the signed device keys and reads the server's prekey count
    /// 2. Generates fresh prekeys if the unpublished local ones cannot cover
    ///    the shortfall to half the configured pool size
    /// 3. Uploads exactly the shortfall, each prekey signed individually
    /// 4. Marks the uploaded prekeys published so they are never offered again
    ///
    /// Nothing is retried: a failed upload leaves the keys unpublished and
    /// the next publish offers them again.
    ///
    /// # Errors
    ///
    /// - `Network` if the server is unreachable
    /// - `Protocol` if a response is malformed
    pub fn publish<H: Homeserver, E: Environment>(
        &mut self,
        server: &H,
        env: &E,
        config: &EngineConfig,
    ) -> Result<PublishResult, EngineError> {
        let device_keys = self.device_keys()?;
        let response =
            server.upload_keys(&KeysUploadRequest { device_keys: Some(device_keys), ..Default::default() })?;
        let remaining_before = saturating_usize(response.signed_one_time_key_count());

        let (budget, one_time_keys, ids) = {
            let secrets = self.secrets_mut()?;
            let budget = OneTimePrekeyBudget::new(
                config.max_one_time_keys,
                remaining_before,
                secrets.one_time_keys.unpublished_count(),
            );
            secrets.one_time_keys.generate(budget.to_generate(), env);

            let offered = secrets.one_time_keys.unpublished(budget.needed());
            let ids: Vec<u64> = offered.iter().map(|(id, _)| *id).collect();
            (budget, offered, ids)
        };

        let mut result = PublishResult {
            remaining_before,
            generated: budget.to_generate(),
            uploaded: 0,
            remaining_after: remaining_before,
        };

        if one_time_keys.is_empty() {
            tracing::debug!(
                device_id = %self.device_id,
                remaining = remaining_before,
                "One-time prekeys are stocked"
            );
            return Ok(result);
        }

        let mut signed_keys = BTreeMap::new();
        for (id, public) in &one_time_keys {
            let mut signed = SignedKey { key: encode_b64(public), signatures: BTreeMap::new() };
            let signature = self.sign_json(&signed)?;
            signed.signatures = self.signatures_with(signature);
            signed_keys.insert(one_time_key_id(*id), signed);
        }

        let response = server.upload_keys(&KeysUploadRequest {
            device_keys: None,
            one_time_keys: signed_keys,
        })?;

        self.secrets_mut()?.one_time_keys.mark_published(&ids);
        result.uploaded = ids.len();
        result.remaining_after = saturating_usize(response.signed_one_time_key_count());

        tracing::info!(
            device_id = %self.device_id,
            remaining_before = result.remaining_before,
            generated = result.generated,
            uploaded = result.uploaded,
            remaining_after = result.remaining_after,
            "Published one-time prekeys"
        );
        Ok(result)
    }

    /// Zero the secret handle and every prekey secret.
    ///
    /// # Errors
    ///
    /// - `DoubleDestroy` if already destroyed
    pub fn destroy(&mut self) -> Result<(), IdentityError> {
        match std::mem::replace(&mut self.state, State::Destroyed(SecureBuffer::zeroed(0))) {
            State::Ready(mut secrets) => {
                secrets.handle.wipe();
                secrets.one_time_keys.wipe_all();
                self.state = State::Destroyed(secrets.handle);
                tracing::info!(user_id = %self.user_id, device_id = %self.device_id, "Destroyed identity");
                Ok(())
            },
            State::Uninitialized => Ok(()),
            State::Destroyed(handle) => {
                self.state = State::Destroyed(handle);
                tracing::error!(
                    user_id = %self.user_id,
                    device_id = %self.device_id,
                    "Identity destroyed twice"
                );
                Err(IdentityError::DoubleDestroy)
            },
        }
    }

    /// True once `destroy()` has run.
    pub fn is_destroyed(&self) -> bool {
        matches!(self.state, State::Destroyed(_))
    }

    /// True if the secret handle holds only zeros (or was never allocated).
    pub fn secret_is_zeroed(&self) -> bool {
        match &self.state {
            State::Uninitialized => true,
            State::Ready(secrets) => secrets.handle.is_zeroed(),
            State::Destroyed(handle) => handle.is_zeroed(),
        }
    }

    /// Local one-time prekeys not yet uploaded.
    pub fn unpublished_one_time_keys(&self) -> Result<usize, IdentityError> {
        Ok(self.secrets()?.one_time_keys.unpublished_count())
    }

    /// Local one-time prekeys held, published or not.
    pub fn one_time_key_count(&self) -> Result<usize, IdentityError> {
        Ok(self.secrets()?.one_time_keys.len())
    }

    /// Remove and wipe the prekey with this public key after an inbound
    /// handshake used it.
    ///
    /// # Errors
    ///
    /// - `UnknownOneTimeKey` if no such prekey is held (already consumed)
    pub fn consume_one_time_key(&mut self, public: &[u8; 32]) -> Result<(), IdentityError> {
        if self.secrets_mut()?.one_time_keys.remove(public) {
            tracing::debug!(device_id = %self.device_id, "Consumed one-time prekey");
            Ok(())
        } else {
            Err(IdentityError::UnknownOneTimeKey)
        }
    }

    /// Encrypt the identity under `pickle_key`.
    pub fn pickle<E: Environment>(&self, pickle_key: &[u8], env: &E) -> Result<Vec<u8>, IdentityError> {
        let secrets = self.secrets()?;
        let (one_time_keys, next_one_time_key_id) = secrets.one_time_keys.to_pickle();
        let pickle = IdentityPickle {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            secret: secrets.handle.as_bytes().to_vec(),
            one_time_keys,
            next_one_time_key_id,
        };

        let plaintext = Zeroizing::new(to_cbor(&pickle));
        Ok(seal_pickle(pickle_key, &plaintext, env.random_array()))
    }

    /// Pickle and hand the ciphertext to `store`.
    pub fn persist<S: PickleStore, E: Environment>(
        &self,
        store: &S,
        identity_id: &str,
        pickle_key: &[u8],
        env: &E,
    ) -> Result<(), EngineError> {
        let pickle = self.pickle(pickle_key, env)?;
        store.persist_pickle(identity_id, &pickle)?;
        Ok(())
    }

    /// Load a pickle from `store`. `None` if nothing was stored.
    pub fn load<S: PickleStore>(
        store: &S,
        identity_id: &str,
        pickle_key: &[u8],
    ) -> Result<Option<Self>, EngineError> {
        match store.load_pickle(identity_id)? {
            Some(pickle) => Ok(Some(Self::from_pickle(pickle_key, &pickle)?)),
            None => Ok(None),
        }
    }

    /// X25519 identity secret, for pairwise handshakes.
    pub(crate) fn encryption_secret(&self) -> Result<&[u8; 32], IdentityError> {
        self.secrets()?.handle.array_at::<32>(32).ok_or(IdentityError::NotInitialized)
    }

    /// Secret of a held one-time prekey.
    pub(crate) fn one_time_secret(&self, public: &[u8; 32]) -> Result<&[u8; 32], IdentityError> {
        self.secrets()?.one_time_keys.secret_for(public).ok_or(IdentityError::UnknownOneTimeKey)
    }

    fn signing_seed(&self) -> Result<&[u8; 32], IdentityError> {
        self.secrets()?.handle.array_at::<32>(0).ok_or(IdentityError::NotInitialized)
    }

    fn signatures_with(&self, signature: String) -> Signatures {
        BTreeMap::from([(
            self.user_id.clone(),
            BTreeMap::from([(ed25519_key_id(&self.device_id), signature)]),
        )])
    }

    fn ensure_uninitialized(&self) -> Result<(), IdentityError> {
        match self.state {
            State::Uninitialized => Ok(()),
            State::Ready(_) => Err(IdentityError::AlreadyAllocated),
            State::Destroyed(_) => Err(IdentityError::Destroyed),
        }
    }

    fn secrets(&self) -> Result<&Secrets, IdentityError> {
        match &self.state {
            State::Ready(secrets) => Ok(secrets),
            State::Uninitialized => Err(IdentityError::NotInitialized),
            State::Destroyed(_) => Err(IdentityError::Destroyed),
        }
    }

    fn secrets_mut(&mut self) -> Result<&mut Secrets, IdentityError> {
        match &mut self.state {
            State::Ready(secrets) => Ok(secrets),
            State::Uninitialized => Err(IdentityError::NotInitialized),
            State::Destroyed(_) => Err(IdentityError::Destroyed),
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            State::Uninitialized => "uninitialized",
            State::Ready(_) => "ready",
            State::Destroyed(_) => "destroyed",
        };
        f.debug_struct("Identity")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("state", &state)
            .finish_non_exhaustive()
    }
}

fn derive_public_keys(handle: &SecureBuffer) -> IdentityKeys {
    match (handle.array_at::<32>(0), handle.array_at::<32>(32)) {
        (Some(signing_seed), Some(encryption_secret)) => IdentityKeys {
            encryption: x25519_public_key(encryption_secret),
            signing: signing_public_key(signing_seed),
        },
        _ => unreachable!("secret handle is {SECRET_LEN} bytes"),
    }
}

fn unpickle(pickle_key: &[u8], pickle: &[u8]) -> Result<(UserId, DeviceId, Secrets), IdentityError> {
    let plaintext = open_pickle(pickle_key, pickle).map_err(|_| IdentityError::InvalidPickle)?;
    let mut pickle: IdentityPickle =
        from_cbor(&plaintext).map_err(|_| IdentityError::InvalidPickle)?;

    if pickle.secret.len() != SECRET_LEN {
        return Err(IdentityError::InvalidPickle);
    }

    let handle = SecureBuffer::from_slice_wiping(&mut pickle.secret);
    let keys = derive_public_keys(&handle);
    let one_time_keys =
        OneTimeKeyPool::from_pickle(&mut pickle.one_time_keys, pickle.next_one_time_key_id);

    Ok((
        pickle.user_id.clone(),
        pickle.device_id.clone(),
        Secrets { handle, keys, one_time_keys },
    ))
}

fn saturating_usize(count: u64) -> usize {
    usize::try_from(count).unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use roomseal_crypto::verify_signature;

    use super::*;
    use crate::env::test_env::TestEnv;

    fn identity(seed: u64) -> (Identity, TestEnv) {
        let env = TestEnv::with_seed(seed);
        let identity = Identity::generated(UserId::from("@alice:x"), DeviceId::from("ALICE"), &env);
        (identity, env)
    }

    #[test]
    fn keys_require_initialization() {
        let identity = Identity::new(UserId::from("@a:x"), DeviceId::from("A"));
        assert_eq!(identity.identity_keys(), Err(IdentityError::NotInitialized));
        assert_eq!(identity.sign(b"m"), Err(IdentityError::NotInitialized));
    }

    #[test]
    fn generate_twice_is_rejected() {
        let (mut identity, env) = identity(1);
        let keys = identity.identity_keys().unwrap();

        assert_eq!(identity.generate(&env), Err(IdentityError::AlreadyAllocated));
        assert_eq!(identity.identity_keys().unwrap(), keys, "keys unchanged");
    }

    #[test]
    fn signature_verifies_with_published_key() {
        let (identity, _) = identity(2);
        let keys = identity.identity_keys().unwrap();
        let signature = identity.sign(b"hello").unwrap();

        assert!(verify_signature(&keys.signing, b"hello", &signature).is_ok());
    }

    #[test]
    fn destroy_zeroes_and_second_destroy_fails() {
        let (mut identity, env) = identity(3);
        assert!(!identity.secret_is_zeroed());

        identity.destroy().unwrap();
        assert!(identity.is_destroyed());
        assert!(identity.secret_is_zeroed());

        assert_eq!(identity.destroy(), Err(IdentityError::DoubleDestroy));
        assert!(identity.secret_is_zeroed());
        assert_eq!(identity.identity_keys(), Err(IdentityError::Destroyed));
        assert_eq!(identity.generate(&env), Err(IdentityError::Destroyed));
    }

    #[test]
    fn device_keys_are_self_signed() {
        let (identity, _) = identity(4);
        let bundle = identity.device_keys().unwrap();
        let device = crate::device::RemoteDevice::from_device_keys(bundle).unwrap();

        assert!(device.verify().is_ok());
        assert!(device.can_receive_room_keys());
        assert_eq!(device.encryption_key(), &identity.identity_keys().unwrap().encryption);
    }

    #[test]
    fn pickle_roundtrip_preserves_keys() {
        let (identity, env) = identity(5);
        let pickle = identity.pickle(b"secret", &env).unwrap();

        let restored = Identity::from_pickle(b"secret", &pickle).unwrap();
        assert_eq!(restored.identity_keys().unwrap(), identity.identity_keys().unwrap());
        assert_eq!(restored.user_id(), identity.user_id());
    }

    #[test]
    fn pickle_with_wrong_key_is_invalid() {
        let (identity, env) = identity(6);
        let pickle = identity.pickle(b"secret", &env).unwrap();

        assert!(matches!(Identity::from_pickle(b"wrong", &pickle), Err(IdentityError::InvalidPickle)));
    }

    #[test]
    fn restore_checks_owner_and_double_init() {
        let (identity, env) = identity(7);
        let pickle = identity.pickle(b"k", &env).unwrap();

        let mut other = Identity::new(UserId::from("@mallory:x"), DeviceId::from("ALICE"));
        assert_eq!(other.restore(b"k", &pickle), Err(IdentityError::InvalidPickle));

        let mut same = Identity::new(UserId::from("@alice:x"), DeviceId::from("ALICE"));
        same.restore(b"k", &pickle).unwrap();
        assert_eq!(same.restore(b"k", &pickle), Err(IdentityError::AlreadyAllocated));
    }

    #[test]
    fn debug_output_has_no_secrets() {
        let (identity, _) = identity(8);
        let rendered = format!("{identity:?}");
        assert!(rendered.contains("ready"));
        assert!(!rendered.contains("handle"));
    }
}
