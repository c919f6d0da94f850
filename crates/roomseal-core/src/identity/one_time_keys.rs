//! Local pool of one-time prekeys.

use std::collections::BTreeMap;

use roomseal_crypto::{SecureBuffer, encoding::encode_b64, x25519_public_key};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{config::SIGNED_ONE_TIME_KEY_ALGORITHM, env::Environment};

/// Server-visible key id for a local prekey id.
pub(crate) fn one_time_key_id(id: u64) -> String {
    format!("{SIGNED_ONE_TIME_KEY_ALGORITHM}:{}", encode_b64(&id.to_be_bytes()))
}

struct OneTimeKey {
    public: [u8; 32],
    secret: SecureBuffer,
    published: bool,
}

/// Serialized form of one prekey, only ever held inside an encrypted pickle.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub(crate) struct OneTimeKeyPickle {
    id: u64,
    secret: [u8; 32],
    published: bool,
}

/// Prekeys by local id, in generation order.
///
/// A key leaves the pool only when an inbound handshake consumes it, so a
/// published id can never be generated or uploaded again.
#[derive(Default)]
pub(crate) struct OneTimeKeyPool {
    keys: BTreeMap<u64, OneTimeKey>,
    next_id: u64,
}

impl OneTimeKeyPool {
    /// Generate `count` fresh unpublished keys.
    pub(crate) fn generate<E: Environment>(&mut self, count: usize, env: &E) {
        for _ in 0..count {
            let mut secret = SecureBuffer::zeroed(32);
            env.random_bytes(secret.as_bytes_mut());
            let public = match secret.array_at::<32>(0) {
                Some(bytes) => x25519_public_key(bytes),
                None => unreachable!("buffer was allocated with 32 bytes"),
            };

            self.keys.insert(self.next_id, OneTimeKey { public, secret, published: false });
            self.next_id += 1;
        }
    }

    /// Keys not yet uploaded.
    pub(crate) fn unpublished_count(&self) -> usize {
        self.keys.values().filter(|k| !k.published).count()
    }

    /// Up to `limit` unpublished keys, oldest first, as `(id, public key)`.
    pub(crate) fn unpublished(&self, limit: usize) -> Vec<(u64, [u8; 32])> {
        self.keys
            .iter()
            .filter(|(_, k)| !k.published)
            .take(limit)
            .map(|(id, k)| (*id, k.public))
            .collect()
    }

    /// Mark keys as uploaded. They are never offered again.
    pub(crate) fn mark_published(&mut self, ids: &[u64]) {
        for id in ids {
            if let Some(key) = self.keys.get_mut(id) {
                key.published = true;
            }
        }
    }

    /// Secret of the key with this public half.
    pub(crate) fn secret_for(&self, public: &[u8; 32]) -> Option<&[u8; 32]> {
        self.keys.values().find(|k| &k.public == public).and_then(|k| k.secret.array_at::<32>(0))
    }

    /// Remove and wipe the key with this public half.
    pub(crate) fn remove(&mut self, public: &[u8; 32]) -> bool {
        let id = self.keys.iter().find(|(_, k)| &k.public == public).map(|(id, _)| *id);
        match id.and_then(|id| self.keys.remove(&id)) {
            Some(mut key) => {
                key.secret.wipe();
                true
            },
            None => false,
        }
    }

    /// Wipe every secret and empty the pool.
    pub(crate) fn wipe_all(&mut self) {
        for key in self.keys.values_mut() {
            key.secret.wipe();
        }
        self.keys.clear();
    }

    /// Number of keys held (published or not).
    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }

    pub(crate) fn to_pickle(&self) -> (Vec<OneTimeKeyPickle>, u64) {
        let keys = self
            .keys
            .iter()
            .filter_map(|(id, k)| {
                k.secret.array_at::<32>(0).map(|secret| OneTimeKeyPickle {
                    id: *id,
                    secret: *secret,
                    published: k.published,
                })
            })
            .collect();
        (keys, self.next_id)
    }

    pub(crate) fn from_pickle(keys: &mut [OneTimeKeyPickle], next_id: u64) -> Self {
        let mut pool = Self { keys: BTreeMap::new(), next_id };
        for key in keys {
            let public = x25519_public_key(&key.secret);
            let secret = SecureBuffer::from_slice_wiping(&mut key.secret);
            pool.keys.insert(key.id, OneTimeKey { public, secret, published: key.published });
        }
        pool
    }
}
