//! Remote devices and the directory they are fetched from.
//!
//! A [`RemoteDevice`] is parsed from the server's signed key bundle but is not
//! trusted until [`RemoteDevice::verify`] succeeds. Parsing only checks shape;
//! signature checks happen where the keys are about to be used.

use std::collections::BTreeMap;

use roomseal_crypto::{
    CryptoError, canonical_json,
    encoding::{decode_b64, decode_key, encode_b64},
    verify_signature,
};

use crate::{
    config::{MEGOLM_ALGORITHM, OLM_ALGORITHM},
    ids::{DeviceId, UserId},
    peer_store::PeerKey,
    transport::{Homeserver, TransportError},
    wire::{DeviceKeys, SignedKey, Signatures, curve25519_key_id, ed25519_key_id},
};

/// A device of another (or the same) user, as published on the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDevice {
    user_id: UserId,
    device_id: DeviceId,
    encryption_key: [u8; 32],
    signing_key: [u8; 32],
    pairwise_capable: bool,
    group_capable: bool,
    bundle: DeviceKeys,
}

impl RemoteDevice {
    /// Parse a device key bundle.
    ///
    /// # Errors
    ///
    /// - `Malformed` if either identity key is missing or not base64
    /// - `InvalidKeyLength` if a key is not 32 bytes
    pub fn from_device_keys(bundle: DeviceKeys) -> Result<Self, CryptoError> {
        let curve = bundle.keys.get(&curve25519_key_id(&bundle.device_id)).ok_or_else(|| {
            CryptoError::Malformed { reason: "missing curve25519 key".to_string() }
        })?;
        let ed = bundle.keys.get(&ed25519_key_id(&bundle.device_id)).ok_or_else(|| {
            CryptoError::Malformed { reason: "missing ed25519 key".to_string() }
        })?;

        let encryption_key = decode_key(curve)?;
        let signing_key = decode_key(ed)?;
        let pairwise_capable = bundle.algorithms.iter().any(|a| a == OLM_ALGORITHM);
        let group_capable = bundle.algorithms.iter().any(|a| a == MEGOLM_ALGORITHM);

        Ok(Self {
            user_id: bundle.user_id.clone(),
            device_id: bundle.device_id.clone(),
            encryption_key,
            signing_key,
            pairwise_capable,
            group_capable,
            bundle,
        })
    }

    /// Owning user.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Device id.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// X25519 identity key.
    pub fn encryption_key(&self) -> &[u8; 32] {
        &self.encryption_key
    }

    /// X25519 identity key, base64.
    pub fn encryption_key_b64(&self) -> String {
        encode_b64(&self.encryption_key)
    }

    /// Ed25519 signing key.
    pub fn signing_key(&self) -> &[u8; 32] {
        &self.signing_key
    }

    /// Advertises the pairwise algorithm.
    pub fn is_pairwise_capable(&self) -> bool {
        self.pairwise_capable
    }

    /// Advertises the group algorithm.
    pub fn is_group_capable(&self) -> bool {
        self.group_capable
    }

    /// Can receive room keys: needs both algorithms.
    pub fn can_receive_room_keys(&self) -> bool {
        self.pairwise_capable && self.group_capable
    }

    /// Key under which pairwise sessions with this device are stored.
    pub fn peer_key(&self) -> PeerKey {
        PeerKey {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            encryption_key: self.encryption_key,
        }
    }

    /// Check the device's self-signature over its key bundle.
    ///
    /// # Errors
    ///
    /// - `InvalidSignature` if the signature is absent or does not verify
    pub fn verify(&self) -> Result<(), CryptoError> {
        let canonical = canonical_json(&self.bundle)?;
        self.verify_own_signature(&self.bundle.signatures, &canonical)
    }

    /// Check a claimed one-time prekey was signed by this device and return
    /// its public key.
    pub fn verify_one_time_key(&self, signed: &SignedKey) -> Result<[u8; 32], CryptoError> {
        let canonical = canonical_json(signed)?;
        self.verify_own_signature(&signed.signatures, &canonical)?;
        decode_key(&signed.key)
    }

    fn verify_own_signature(
        &self,
        signatures: &Signatures,
        canonical: &[u8],
    ) -> Result<(), CryptoError> {
        let signature = signatures
            .get(&self.user_id)
            .and_then(|by_key| by_key.get(&ed25519_key_id(&self.device_id)))
            .ok_or(CryptoError::InvalidSignature)?;
        let signature = decode_b64(signature).map_err(|_| CryptoError::InvalidSignature)?;

        verify_signature(&self.signing_key, canonical, &signature)
    }
}

/// A room member and every device they publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomMember {
    /// Member's user id
    pub user_id: UserId,
    /// Member's devices (unverified until used)
    pub devices: Vec<RemoteDevice>,
}

/// Devices of a set of users, grouped by user.
#[derive(Debug, Clone, Default)]
pub struct DeviceDirectory {
    devices: BTreeMap<UserId, BTreeMap<DeviceId, RemoteDevice>>,
}

impl DeviceDirectory {
    /// Fetch the device lists of `users`.
    ///
    /// Bundles that do not parse, or that belong to a user that was not
    /// asked for, are dropped with a warning. Requested users with no devices
    /// still appear as members with an empty device list.
    pub fn fetch<H: Homeserver>(server: &H, users: &[UserId]) -> Result<Self, TransportError> {
        let bundles = server.list_devices(users)?;

        let mut directory = Self::default();
        for user_id in users {
            directory.devices.entry(user_id.clone()).or_default();
        }

        for bundle in bundles {
            let (user_id, device_id) = (bundle.user_id.clone(), bundle.device_id.clone());

            if !directory.devices.contains_key(&user_id) {
                tracing::warn!(
                    user_id = %user_id,
                    device_id = %device_id,
                    "Ignoring device of a user that was not requested"
                );
                continue;
            }

            match RemoteDevice::from_device_keys(bundle) {
                Ok(device) => {
                    directory.insert(device);
                },
                Err(e) => {
                    tracing::warn!(
                        user_id = %user_id,
                        device_id = %device_id,
                        error = %e,
                        "Dropping malformed device keys"
                    );
                },
            }
        }

        tracing::debug!(users = users.len(), devices = directory.len(), "Fetched device directory");
        Ok(directory)
    }

    /// Add or replace a device.
    pub fn insert(&mut self, device: RemoteDevice) {
        self.devices
            .entry(device.user_id.clone())
            .or_default()
            .insert(device.device_id.clone(), device);
    }

    /// Look up a single device.
    pub fn device(&self, user_id: &UserId, device_id: &DeviceId) -> Option<&RemoteDevice> {
        self.devices.get(user_id)?.get(device_id)
    }

    /// Members in user id order, each with their devices in device id order.
    pub fn members(&self) -> Vec<RoomMember> {
        self.devices
            .iter()
            .map(|(user_id, devices)| RoomMember {
                user_id: user_id.clone(),
                devices: devices.values().cloned().collect(),
            })
            .collect()
    }

    /// Total number of devices.
    pub fn len(&self) -> usize {
        self.devices.values().map(BTreeMap::len).sum()
    }

    /// True if no devices are known.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use roomseal_crypto::{sign, signing_public_key};

    use super::*;

    fn signed_bundle(user: &str, device: &str, seed: [u8; 32]) -> DeviceKeys {
        let user_id = UserId::from(user);
        let device_id = DeviceId::from(device);
        let mut bundle = DeviceKeys {
            user_id: user_id.clone(),
            device_id: device_id.clone(),
            algorithms: vec![OLM_ALGORITHM.to_string(), MEGOLM_ALGORITHM.to_string()],
            keys: BTreeMap::from([
                (curve25519_key_id(&device_id), encode_b64(&[9u8; 32])),
                (ed25519_key_id(&device_id), encode_b64(&signing_public_key(&seed))),
            ]),
            signatures: BTreeMap::new(),
        };
        let signature = sign(&seed, &canonical_json(&bundle).unwrap());
        bundle.signatures = BTreeMap::from([(
            user_id,
            BTreeMap::from([(ed25519_key_id(&device_id), encode_b64(&signature))]),
        )]);
        bundle
    }

    #[test]
    fn valid_bundle_verifies() {
        let device = RemoteDevice::from_device_keys(signed_bundle("@a:x", "DEV", [1; 32])).unwrap();
        assert!(device.verify().is_ok());
        assert!(device.can_receive_room_keys());
        assert_eq!(device.encryption_key(), &[9u8; 32]);
    }

    #[test]
    fn altered_bundle_fails_verification() {
        let mut bundle = signed_bundle("@a:x", "DEV", [1; 32]);
        bundle.algorithms.pop();

        let device = RemoteDevice::from_device_keys(bundle).unwrap();
        assert_eq!(device.verify(), Err(CryptoError::InvalidSignature));
        assert!(!device.can_receive_room_keys());
    }

    #[test]
    fn unsigned_bundle_fails_verification() {
        let mut bundle = signed_bundle("@a:x", "DEV", [1; 32]);
        bundle.signatures.clear();

        let device = RemoteDevice::from_device_keys(bundle).unwrap();
        assert_eq!(device.verify(), Err(CryptoError::InvalidSignature));
    }

    #[test]
    fn missing_key_is_malformed() {
        let mut bundle = signed_bundle("@a:x", "DEV", [1; 32]);
        bundle.keys.remove("curve25519:DEV");

        assert!(matches!(
            RemoteDevice::from_device_keys(bundle),
            Err(CryptoError::Malformed { .. })
        ));
    }

    #[test]
    fn signed_one_time_key_verifies() {
        let seed = [1; 32];
        let device = RemoteDevice::from_device_keys(signed_bundle("@a:x", "DEV", seed)).unwrap();

        let mut signed = SignedKey { key: encode_b64(&[5u8; 32]), signatures: BTreeMap::new() };
        let signature = sign(&seed, &canonical_json(&signed).unwrap());
        signed.signatures = BTreeMap::from([(
            UserId::from("@a:x"),
            BTreeMap::from([("ed25519:DEV".to_string(), encode_b64(&signature))]),
        )]);

        assert_eq!(device.verify_one_time_key(&signed).unwrap(), [5u8; 32]);

        signed.key = encode_b64(&[6u8; 32]);
        assert_eq!(device.verify_one_time_key(&signed), Err(CryptoError::InvalidSignature));
    }

    #[test]
    fn directory_groups_members() {
        let mut directory = DeviceDirectory::default();
        for (user, device) in [("@b:x", "B1"), ("@a:x", "A2"), ("@a:x", "A1")] {
            directory.insert(RemoteDevice::from_device_keys(signed_bundle(user, device, [2; 32])).unwrap());
        }

        let members = directory.members();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].user_id, UserId::from("@a:x"));
        assert_eq!(members[0].devices[0].device_id(), &DeviceId::from("A1"));
        assert_eq!(directory.len(), 3);
        assert!(directory.device(&UserId::from("@b:x"), &DeviceId::from("B1")).is_some());
    }
}
