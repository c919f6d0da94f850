//! In-memory homeserver for deterministic tests.
//!
//! `SimHomeserver` keeps the server-side key directory, one-time prekey
//! stock and to-device inboxes for every simulated device. Each device talks
//! to it through a [`SimSession`] handle, which implements [`Homeserver`] and
//! stamps requests with the device's identity.
//!
//! Faults are injected per request kind and consumed by the next request of
//! that kind.

#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex},
};

use roomseal_core::{
    DeviceId, Homeserver, TransportError, UserId,
    config::SIGNED_ONE_TIME_KEY_ALGORITHM,
    wire::{
        DeviceKeys, DeviceRef, KeysClaimResponse, KeysUploadRequest, KeysUploadResponse,
        OlmEncryptedContent, SignedKey, ToDeviceBatch,
    },
};

type DeviceAddr = (UserId, DeviceId);

/// A to-device event waiting in a device's inbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToDeviceEvent {
    /// Sending user, as authenticated by the server
    pub sender: UserId,
    /// Sending device
    pub sender_device: DeviceId,
    /// Event type
    pub event_type: String,
    /// Encrypted content
    pub content: OlmEncryptedContent,
}

#[derive(Default)]
struct Faults {
    upload: Option<TransportError>,
    one_time_key_upload: Option<TransportError>,
    claim: Option<TransportError>,
    send: Option<TransportError>,
    list: Option<TransportError>,
}

#[derive(Default)]
struct ServerState {
    device_keys: BTreeMap<DeviceAddr, DeviceKeys>,
    /// Unclaimed prekeys per device, in key id order
    one_time_keys: BTreeMap<DeviceAddr, BTreeMap<String, SignedKey>>,
    inboxes: HashMap<DeviceAddr, Vec<ToDeviceEvent>>,
    seen_txns: HashSet<(DeviceAddr, String)>,
    withheld: HashSet<DeviceAddr>,
    tampered: HashSet<DeviceAddr>,
    faults: Faults,
    uploads: Vec<(DeviceAddr, KeysUploadRequest)>,
    claims: Vec<Vec<DeviceRef>>,
    sends: usize,
}

/// Shared simulated homeserver.
///
/// Clones refer to the same server.
#[derive(Clone, Default)]
pub struct SimHomeserver {
    inner: Arc<Mutex<ServerState>>,
}

impl SimHomeserver {
    /// Create an empty server.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connection handle for one device.
    pub fn session(&self, user_id: impl Into<UserId>, device_id: impl Into<DeviceId>) -> SimSession {
        SimSession { server: self.clone(), user_id: user_id.into(), device_id: device_id.into() }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ServerState> {
        self.inner.lock().expect("Mutex poisoned")
    }

    /// Fail the next key upload with `error`.
    pub fn fail_next_upload(&self, error: TransportError) {
        self.state().faults.upload = Some(error);
    }

    /// Fail the next upload that carries one-time prekeys with `error`.
    pub fn fail_next_one_time_key_upload(&self, error: TransportError) {
        self.state().faults.one_time_key_upload = Some(error);
    }

    /// Fail the next prekey claim with `error`.
    pub fn fail_next_claim(&self, error: TransportError) {
        self.state().faults.claim = Some(error);
    }

    /// Fail the next to-device send with `error`.
    pub fn fail_next_send(&self, error: TransportError) {
        self.state().faults.send = Some(error);
    }

    /// Fail the next device list query with `error`.
    pub fn fail_next_list(&self, error: TransportError) {
        self.state().faults.list = Some(error);
    }

    /// Answer claims for this device as if it had no prekeys left.
    pub fn withhold_one_time_keys(&self, user_id: &UserId, device_id: &DeviceId) {
        self.state().withheld.insert((user_id.clone(), device_id.clone()));
    }

    /// Corrupt the signature of every prekey claimed for this device.
    pub fn tamper_one_time_keys(&self, user_id: &UserId, device_id: &DeviceId) {
        self.state().tampered.insert((user_id.clone(), device_id.clone()));
    }

    /// Replace a device's published key bundle, bypassing upload checks.
    ///
    /// Used to serve forged or stale bundles.
    pub fn set_device_keys(&self, keys: DeviceKeys) {
        let addr = (keys.user_id.clone(), keys.device_id.clone());
        self.state().device_keys.insert(addr, keys);
    }

    /// Published key bundle of a device.
    pub fn device_keys(&self, user_id: &UserId, device_id: &DeviceId) -> Option<DeviceKeys> {
        self.state().device_keys.get(&(user_id.clone(), device_id.clone())).cloned()
    }

    /// Unclaimed prekeys held for a device.
    pub fn one_time_key_count(&self, user_id: &UserId, device_id: &DeviceId) -> usize {
        self.state().one_time_keys.get(&(user_id.clone(), device_id.clone())).map_or(0, BTreeMap::len)
    }

    /// Every successful upload so far, oldest first.
    pub fn uploads(&self) -> Vec<KeysUploadRequest> {
        self.state().uploads.iter().map(|(_, request)| request.clone()).collect()
    }

    /// Devices named in each claim request, oldest first.
    pub fn claim_requests(&self) -> Vec<Vec<DeviceRef>> {
        self.state().claims.clone()
    }

    /// Number of successful to-device requests.
    pub fn send_count(&self) -> usize {
        self.state().sends
    }

    /// Remove and return everything queued for a device.
    pub fn take_to_device(&self, user_id: &UserId, device_id: &DeviceId) -> Vec<ToDeviceEvent> {
        self.state().inboxes.remove(&(user_id.clone(), device_id.clone())).unwrap_or_default()
    }

    /// Queue an event for a device as if `sender` had sent it.
    pub fn inject_to_device(&self, recipient: (&UserId, &DeviceId), event: ToDeviceEvent) {
        self.state()
            .inboxes
            .entry((recipient.0.clone(), recipient.1.clone()))
            .or_default()
            .push(event);
    }
}

/// One device's connection to a [`SimHomeserver`].
#[derive(Clone)]
pub struct SimSession {
    server: SimHomeserver,
    user_id: UserId,
    device_id: DeviceId,
}

impl SimSession {
    /// The server behind this handle.
    pub fn server(&self) -> &SimHomeserver {
        &self.server
    }

    fn addr(&self) -> DeviceAddr {
        (self.user_id.clone(), self.device_id.clone())
    }
}

impl Homeserver for SimSession {
    fn upload_keys(&self, request: &KeysUploadRequest) -> Result<KeysUploadResponse, TransportError> {
        let mut state = self.server.state();
        if let Some(error) = state.faults.upload.take() {
            return Err(error);
        }
        if !request.one_time_keys.is_empty()
            && let Some(error) = state.faults.one_time_key_upload.take()
        {
            return Err(error);
        }

        let addr = self.addr();
        if let Some(keys) = &request.device_keys
            && (keys.user_id != addr.0 || keys.device_id != addr.1)
        {
            return Err(TransportError::Network("device keys for another device".to_string()));
        }

        let stock = state.one_time_keys.entry(addr.clone()).or_default();
        if let Some(key_id) = request.one_time_keys.keys().find(|key_id| stock.contains_key(*key_id)) {
            return Err(TransportError::Network(format!("one-time key {key_id} already exists")));
        }
        stock.extend(request.one_time_keys.iter().map(|(id, key)| (id.clone(), key.clone())));
        let remaining = stock.len() as u64;

        if let Some(keys) = &request.device_keys {
            state.device_keys.insert(addr.clone(), keys.clone());
        }
        state.uploads.push((addr, request.clone()));

        tracing::trace!(user_id = %self.user_id, device_id = %self.device_id, remaining, "Keys uploaded");
        Ok(KeysUploadResponse {
            one_time_key_counts: BTreeMap::from([(SIGNED_ONE_TIME_KEY_ALGORITHM.to_string(), remaining)]),
        })
    }

    fn claim_one_time_keys(&self, devices: &[DeviceRef]) -> Result<KeysClaimResponse, TransportError> {
        let mut state = self.server.state();
        if let Some(error) = state.faults.claim.take() {
            return Err(error);
        }
        state.claims.push(devices.to_vec());

        let mut response = KeysClaimResponse::default();
        for device in devices {
            let addr = (device.user_id.clone(), device.device_id.clone());
            if state.withheld.contains(&addr) {
                continue;
            }
            let tampered = state.tampered.contains(&addr);

            let Some((key_id, mut key)) = state.one_time_keys.get_mut(&addr).and_then(BTreeMap::pop_first)
            else {
                continue;
            };

            if tampered {
                for signature in key.signatures.values_mut().flat_map(BTreeMap::values_mut) {
                    *signature = flip_first_char(signature);
                }
            }

            response
                .one_time_keys
                .entry(addr.0)
                .or_default()
                .insert(addr.1, BTreeMap::from([(key_id, key)]));
        }

        Ok(response)
    }

    fn send_to_device(
        &self,
        event_type: &str,
        txn_id: &str,
        batch: &ToDeviceBatch,
    ) -> Result<(), TransportError> {
        let mut state = self.server.state();
        if let Some(error) = state.faults.send.take() {
            return Err(error);
        }

        // Retried transactions are delivered once
        if !state.seen_txns.insert((self.addr(), txn_id.to_string())) {
            return Ok(());
        }
        state.sends += 1;

        for (user_id, devices) in batch {
            for (device_id, content) in devices {
                state.inboxes.entry((user_id.clone(), device_id.clone())).or_default().push(ToDeviceEvent {
                    sender: self.user_id.clone(),
                    sender_device: self.device_id.clone(),
                    event_type: event_type.to_string(),
                    content: content.clone(),
                });
            }
        }

        Ok(())
    }

    fn list_devices(&self, users: &[UserId]) -> Result<Vec<DeviceKeys>, TransportError> {
        let mut state = self.server.state();
        if let Some(error) = state.faults.list.take() {
            return Err(error);
        }

        Ok(state
            .device_keys
            .iter()
            .filter(|((user_id, _), _)| users.contains(user_id))
            .map(|(_, keys)| keys.clone())
            .collect())
    }
}

/// Change the first character of a base64 string to another valid one.
fn flip_first_char(encoded: &str) -> String {
    let mut chars = encoded.chars();
    let replacement = match chars.next() {
        Some('A') => 'B',
        _ => 'A',
    };
    std::iter::once(replacement).chain(chars).collect()
}
