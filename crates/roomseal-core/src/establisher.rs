//! Session establishment and room key distribution.
//!
//! The [`SessionEstablisher`] owns every pairwise session of one identity and
//! every room's outbound group session. For a room it runs, per device:
//!
//! ```text
//! verify device keys ─► claim prekey ─► verify prekey ─► handshake ─► share room key
//! ```
//!
//! Problems with one device never abort the pass: the device is skipped and
//! reported. The pass fails only if nobody could receive the key, or if the
//! single to-device delivery request fails.
//!
//! # Room States
//!
//! ```text
//! NoGroupSession ──ensure──► Establishing ──delivered to ≥1 device──► Ready
//!        ▲                        │
//!        └──── zero recipients ───┘  (key held by no device)
//! ```
//!
//! A restored session enters `Ready` directly if its key was already shared.
//!
//! A pass that fails at the claim or at delivery leaves the room
//! `Establishing`; the next pass reuses its session.

use std::collections::{BTreeMap, HashMap, HashSet};

use roomseal_crypto::{
    CryptoError, PairwiseMessage, PairwiseSession,
    encoding::{decode_b64, encode_b64},
};
use serde_json::Value;
use zeroize::Zeroizing;

use crate::{
    config::{ENCRYPTED_EVENT, EngineConfig, MEGOLM_ALGORITHM, OLM_ALGORITHM, ROOM_KEY_EVENT},
    device::{RemoteDevice, RoomMember},
    env::Environment,
    error::EngineError,
    group_session::{GroupSession, InboundGroupSession},
    identity::Identity,
    ids::{DeviceId, RoomId, UserId},
    peer_store::{PeerSession, PeerSessionError, PeerSessionStore},
    transport::Homeserver,
    wire::{
        DeviceRef, KeysClaimResponse, MegolmEncryptedContent, OlmCiphertext, OlmEncryptedContent,
        OlmPayload, RoomKeyContent, ToDeviceBatch, decode_json, encode_json,
    },
};

/// Key name of the signing key inside `keys` / `recipient_keys`.
const ED25519: &str = "ed25519";

/// Per-room establishment state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    /// No outbound group session exists for the room
    NoGroupSession,
    /// A session exists but its key has not been delivered to anyone yet
    Establishing,
    /// The key reached at least one device
    Ready,
}

/// Why a device did not receive the room key in a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The local device itself
    OwnDevice,
    /// Device does not advertise both the pairwise and group algorithms
    MissingCapabilities,
    /// Server had no one-time prekey for the device
    MissingOneTimeKey,
    /// Device keys or the claimed prekey failed signature verification
    InvalidSignature,
    /// Keys parsed but could not be used for a handshake
    MalformedKeys,
    /// A session already existed for the exact device key
    SessionConflict,
    /// The pairwise session refused to encrypt
    EncryptionFailed,
}

/// A device left out of a pass, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedDevice {
    /// Device owner
    pub user_id: UserId,
    /// Device
    pub device_id: DeviceId,
    /// Reason
    pub reason: SkipReason,
}

/// What one `ensure_group_session` pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EstablishReport {
    /// Group session id being distributed
    pub session_id: String,
    /// Devices with a pairwise session created in this pass
    pub established: Vec<DeviceRef>,
    /// Devices the room key was sent to in this pass (new and reused sessions)
    pub shared: Vec<DeviceRef>,
    /// Devices that already held the room key
    pub already_shared: Vec<DeviceRef>,
    /// Devices left out
    pub skipped: Vec<SkippedDevice>,
}

impl EstablishReport {
    fn skip(&mut self, device: &RemoteDevice, reason: SkipReason) {
        self.skipped.push(SkippedDevice {
            user_id: device.user_id().clone(),
            device_id: device.device_id().clone(),
            reason,
        });
    }
}

/// A decrypted to-device event whose sender and recipient binding checked
/// out.
#[derive(Clone)]
pub struct DecryptedToDevice {
    /// Sending user
    pub sender: UserId,
    /// Sending device
    pub sender_device: DeviceId,
    /// Sender's curve25519 identity key (base64)
    pub sender_key: String,
    /// Inner event type
    pub event_type: String,
    /// Inner event content
    pub content: Value,
}

impl std::fmt::Debug for DecryptedToDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptedToDevice")
            .field("sender", &self.sender)
            .field("sender_device", &self.sender_device)
            .field("event_type", &self.event_type)
            .finish_non_exhaustive()
    }
}

/// A decrypted room event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedRoomEvent {
    /// Plaintext
    pub plaintext: Vec<u8>,
    /// Index of the message within its group session
    pub message_index: u32,
    /// Group session id
    pub session_id: String,
    /// Curve25519 key of the sending device
    pub sender_key: String,
}

struct RoomEntry<I> {
    state: RoomState,
    session: GroupSession<I>,
}

/// Creates pairwise sessions and distributes room keys for one identity.
pub struct SessionEstablisher<E: Environment, H: Homeserver> {
    env: E,
    server: H,
    config: EngineConfig,
    peers: PeerSessionStore<E::Instant>,
    rooms: HashMap<RoomId, RoomEntry<E::Instant>>,
    inbound: HashMap<String, InboundGroupSession>,
}

impl<E: Environment, H: Homeserver> SessionEstablisher<E, H> {
    /// Create an establisher with no sessions.
    pub fn new(env: E, server: H, config: EngineConfig) -> Self {
        Self {
            env,
            server,
            config,
            peers: PeerSessionStore::new(),
            rooms: HashMap::new(),
            inbound: HashMap::new(),
        }
    }

    /// Environment in use.
    pub fn env(&self) -> &E {
        &self.env
    }

    /// Homeserver in use.
    pub fn server(&self) -> &H {
        &self.server
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Pairwise sessions.
    pub fn peers(&self) -> &PeerSessionStore<E::Instant> {
        &self.peers
    }

    /// Establishment state of a room.
    pub fn room_state(&self, room_id: &RoomId) -> RoomState {
        self.rooms.get(room_id).map_or(RoomState::NoGroupSession, |entry| entry.state)
    }

    /// Outbound group session of a room, if any. Pickle it to persist the
    /// room across restarts.
    pub fn group_session(&self, room_id: &RoomId) -> Option<&GroupSession<E::Instant>> {
        self.rooms.get(room_id).map(|entry| &entry.session)
    }

    /// Mutable outbound group session of a room that is `Ready`.
    pub(crate) fn ready_session_mut(&mut self, room_id: &RoomId) -> Option<&mut GroupSession<E::Instant>> {
        self.rooms
            .get_mut(room_id)
            .filter(|entry| entry.state == RoomState::Ready)
            .map(|entry| &mut entry.session)
    }

    /// Drop a room's outbound group session. The next pass creates a new one.
    pub fn retire_group_session(&mut self, room_id: &RoomId) -> Option<GroupSession<E::Instant>> {
        let entry = self.rooms.remove(room_id)?;
        tracing::info!(
            room_id = %room_id,
            session_id = %entry.session.session_id(),
            messages = entry.session.message_count(),
            "Retired outbound group session"
        );
        Some(entry.session)
    }

    /// Install a restored outbound group session for its room.
    ///
    /// The room is `Ready` if the session's key already reached a device,
    /// otherwise `Establishing` so the next pass distributes it. Returns the
    /// session it replaced, if any.
    pub fn restore_group_session(
        &mut self,
        session: GroupSession<E::Instant>,
    ) -> Option<GroupSession<E::Instant>> {
        let room_id = session.room_id().clone();
        let state = if session.shared_count() > 0 { RoomState::Ready } else { RoomState::Establishing };
        tracing::info!(
            room_id = %room_id,
            session_id = %session.session_id(),
            shared = session.shared_count(),
            ?state,
            "Restored outbound group session"
        );
        self.rooms.insert(room_id, RoomEntry { state, session }).map(|entry| entry.session)
    }

    /// Inbound group session by id.
    pub fn inbound_session(&self, session_id: &str) -> Option<&InboundGroupSession> {
        self.inbound.get(session_id)
    }

    /// Every inbound group session, for persistence.
    pub fn inbound_sessions(&self) -> impl Iterator<Item = &InboundGroupSession> {
        self.inbound.values()
    }

    /// Install an inbound group session, from a room key or a pickle.
    ///
    /// If a session with the same id is already known, the one that can
    /// decrypt from the earlier index is kept. Returns the session id.
    pub fn import_inbound_session(&mut self, session: InboundGroupSession) -> String {
        let session_id = session.session_id();
        let keep_existing = self
            .inbound
            .get(&session_id)
            .is_some_and(|existing| existing.first_known_index() <= session.first_known_index());
        if !keep_existing {
            tracing::debug!(
                room_id = %session.room_id(),
                session_id = %session_id,
                first_index = session.first_known_index(),
                "Imported inbound group session"
            );
            self.inbound.insert(session_id.clone(), session);
        }
        session_id
    }

    /// Make sure every eligible device of `members` holds the room's current
    /// group session key.
    ///
    /// Creates the room's group session if needed, creates pairwise sessions
    /// for devices that have none, and delivers the room key to every device
    /// that lacks it in a single to-device request.
    ///
    /// # Errors
    ///
    /// - `NoRecipients` if no device holds or received the key; the room's
    ///   session is discarded
    /// - `Delivery` if the to-device request fails; pairwise sessions created
    ///   so far are kept and listed in the report
    /// - `Network` / `Protocol` if the prekey claim fails
    pub fn ensure_group_session(
        &mut self,
        room_id: &RoomId,
        members: &[RoomMember],
        identity: &Identity,
    ) -> Result<EstablishReport, EngineError> {
        let own_keys = identity.identity_keys()?;

        if !self.rooms.contains_key(room_id) {
            let session = GroupSession::generate(room_id.clone(), &self.env);
            self.rooms.insert(room_id.clone(), RoomEntry { state: RoomState::Establishing, session });
        }
        let Some(entry) = self.rooms.get(room_id) else {
            unreachable!("room entry was just ensured");
        };

        let mut report = EstablishReport { session_id: entry.session.session_id(), ..Default::default() };

        // Filter and verify before spending any prekeys
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for device in members.iter().flat_map(|member| member.devices.iter()) {
            if !seen.insert(device.peer_key()) {
                continue;
            }

            if device.user_id() == identity.user_id() && device.device_id() == identity.device_id() {
                report.skip(device, SkipReason::OwnDevice);
                continue;
            }

            if !device.can_receive_room_keys() {
                tracing::debug!(
                    user_id = %device.user_id(),
                    device_id = %device.device_id(),
                    "Skipping device without required algorithms"
                );
                report.skip(device, SkipReason::MissingCapabilities);
                continue;
            }

            if let Err(e) = device.verify() {
                tracing::warn!(
                    user_id = %device.user_id(),
                    device_id = %device.device_id(),
                    error = %e,
                    "Excluding device with unverifiable keys"
                );
                report.skip(device, SkipReason::InvalidSignature);
                continue;
            }

            if entry.session.is_shared_with(&device.peer_key()) {
                report.already_shared.push(device_ref(device));
                continue;
            }

            candidates.push(device);
        }

        let to_claim: Vec<DeviceRef> = candidates
            .iter()
            .filter(|device| !self.peers.contains(&device.peer_key()))
            .map(|device| device_ref(device))
            .collect();

        let mut claimed = if to_claim.is_empty() {
            KeysClaimResponse::default()
        } else {
            self.server.claim_one_time_keys(&to_claim)?
        };

        let mut recipients = Vec::new();
        for device in candidates {
            let peer_key = device.peer_key();
            if self.peers.contains(&peer_key) {
                recipients.push(device);
                continue;
            }

            let Some((key_id, signed)) = claimed.take(device.user_id(), device.device_id()) else {
                tracing::warn!(
                    user_id = %device.user_id(),
                    device_id = %device.device_id(),
                    "No one-time prekey available for device"
                );
                report.skip(device, SkipReason::MissingOneTimeKey);
                continue;
            };

            let one_time_key = match device.verify_one_time_key(&signed) {
                Ok(key) => key,
                Err(e) => {
                    tracing::warn!(
                        user_id = %device.user_id(),
                        device_id = %device.device_id(),
                        key_id = %key_id,
                        error = %e,
                        "Claimed one-time prekey failed verification"
                    );
                    report.skip(device, SkipReason::InvalidSignature);
                    continue;
                },
            };

            let session = match PairwiseSession::outbound(
                identity.encryption_secret()?,
                self.env.random_array(),
                device.encryption_key(),
                &one_time_key,
            ) {
                Ok(session) => session,
                Err(e) => {
                    tracing::warn!(
                        user_id = %device.user_id(),
                        device_id = %device.device_id(),
                        error = %e,
                        "Pairwise handshake failed"
                    );
                    report.skip(device, SkipReason::MalformedKeys);
                    continue;
                },
            };

            if let Err(e) = self.peers.insert(PeerSession::new(peer_key, session, self.env.now())) {
                tracing::error!(
                    user_id = %device.user_id(),
                    device_id = %device.device_id(),
                    error = %e,
                    "Refusing to overwrite existing pairwise session"
                );
                report.skip(device, SkipReason::SessionConflict);
                continue;
            }

            tracing::debug!(
                user_id = %device.user_id(),
                device_id = %device.device_id(),
                "Established pairwise session"
            );
            report.established.push(device_ref(device));
            recipients.push(device);
        }

        let room_key = entry.session.room_key_content();
        let own_signing_key = own_keys.signing_b64();
        let own_sender_key = own_keys.encryption_b64();
        let mut batch = ToDeviceBatch::new();
        let mut delivered = Vec::new();
        for device in recipients {
            match self.encrypt_room_key(identity, &own_signing_key, &own_sender_key, device, &room_key) {
                Ok(content) => {
                    batch
                        .entry(device.user_id().clone())
                        .or_default()
                        .insert(device.device_id().clone(), content);
                    report.shared.push(device_ref(device));
                    delivered.push(device.peer_key());
                },
                Err(e) => {
                    tracing::warn!(
                        user_id = %device.user_id(),
                        device_id = %device.device_id(),
                        error = %e,
                        "Could not encrypt room key for device"
                    );
                    report.skip(device, SkipReason::EncryptionFailed);
                },
            }
        }

        if batch.is_empty() {
            return self.finish_without_delivery(room_id, report);
        }

        let txn_id = format!("{:016x}", self.env.random_u64());
        if let Err(source) = self.server.send_to_device(ENCRYPTED_EVENT, &txn_id, &batch) {
            tracing::warn!(
                room_id = %room_id,
                txn_id = %txn_id,
                established = report.established.len(),
                error = %source,
                "Room key delivery failed"
            );
            return Err(EngineError::Delivery { report: Box::new(report), source });
        }

        let Some(entry) = self.rooms.get_mut(room_id) else {
            unreachable!("room entry exists for the whole pass");
        };
        for key in delivered {
            entry.session.mark_shared(key);
        }
        entry.state = RoomState::Ready;

        tracing::info!(
            room_id = %room_id,
            session_id = %report.session_id,
            txn_id = %txn_id,
            established = report.established.len(),
            shared = report.shared.len(),
            skipped = report.skipped.len(),
            "Distributed room key"
        );
        Ok(report)
    }

    fn encrypt_room_key(
        &mut self,
        identity: &Identity,
        own_signing_key: &str,
        own_sender_key: &str,
        device: &RemoteDevice,
        room_key: &RoomKeyContent,
    ) -> Result<OlmEncryptedContent, EngineError> {
        let payload = OlmPayload {
            event_type: ROOM_KEY_EVENT.to_string(),
            content: room_key,
            sender: identity.user_id().clone(),
            sender_device: identity.device_id().clone(),
            keys: BTreeMap::from([(ED25519.to_string(), own_signing_key.to_string())]),
            recipient: device.user_id().clone(),
            recipient_keys: BTreeMap::from([(ED25519.to_string(), encode_b64(device.signing_key()))]),
        };
        let plaintext = Zeroizing::new(encode_json(&payload));

        let random = self.env.random_array();
        let Some(session) = self.peers.get_mut(&device.peer_key()) else {
            unreachable!("every recipient holds a pairwise session");
        };
        let message = session.encrypt(&plaintext, random)?;

        Ok(OlmEncryptedContent {
            algorithm: OLM_ALGORITHM.to_string(),
            sender_key: own_sender_key.to_string(),
            ciphertext: BTreeMap::from([(
                device.encryption_key_b64(),
                OlmCiphertext { message_type: message.message_type(), body: encode_b64(&message.to_bytes()) },
            )]),
        })
    }

    fn finish_without_delivery(
        &mut self,
        room_id: &RoomId,
        report: EstablishReport,
    ) -> Result<EstablishReport, EngineError> {
        let Some(entry) = self.rooms.get_mut(room_id) else {
            unreachable!("room entry exists for the whole pass");
        };

        if entry.session.shared_count() > 0 {
            entry.state = RoomState::Ready;
            tracing::debug!(room_id = %room_id, "Room key already held by every eligible device");
            return Ok(report);
        }

        // Nobody holds this key, including any left over from an aborted pass
        self.rooms.remove(room_id);
        tracing::warn!(
            room_id = %room_id,
            skipped = report.skipped.len(),
            "No device could receive the room key"
        );
        Err(EngineError::NoRecipients { skipped: report.skipped })
    }

    /// Decrypt a to-device `m.room.encrypted` event from `sender`.
    ///
    /// The sender's device keys are verified first. A pre-key message that
    /// matches no existing session creates an inbound session and consumes
    /// the local one-time prekey it names. The decrypted payload must name
    /// `sender` as sender and this device as recipient.
    ///
    /// # Errors
    ///
    /// - `UnverifiedSender` if the device keys do not verify or the event's
    ///   sender key differs from the device's
    /// - `NotForThisDevice` if no ciphertext is addressed to this device
    /// - `Protocol` if the ciphertext or payload does not parse
    /// - `PeerSession` if decryption or the handshake fails
    /// - `Identity(UnknownOneTimeKey)` if the named prekey was already used
    /// - `PayloadMismatch` if the sender/recipient binding is wrong
    pub fn decrypt_from_device(
        &mut self,
        identity: &mut Identity,
        sender: &RemoteDevice,
        content: &OlmEncryptedContent,
    ) -> Result<DecryptedToDevice, EngineError> {
        if sender.verify().is_err() || content.sender_key != sender.encryption_key_b64() {
            tracing::warn!(
                user_id = %sender.user_id(),
                device_id = %sender.device_id(),
                "Rejecting to-device message from unverified sender"
            );
            return Err(EngineError::UnverifiedSender {
                user_id: sender.user_id().clone(),
                device_id: sender.device_id().clone(),
            });
        }
        if content.algorithm != OLM_ALGORITHM {
            return Err(EngineError::Protocol(format!("unexpected algorithm {}", content.algorithm)));
        }

        let own_keys = identity.identity_keys()?;
        let ciphertext =
            content.ciphertext.get(&own_keys.encryption_b64()).ok_or(EngineError::NotForThisDevice)?;

        let bytes = decode_b64(&ciphertext.body).map_err(|e| EngineError::Protocol(e.to_string()))?;
        let message =
            PairwiseMessage::from_bytes(&bytes).map_err(|e| EngineError::Protocol(e.to_string()))?;
        if message.message_type() != ciphertext.message_type {
            return Err(EngineError::Protocol("message type mismatch".to_string()));
        }

        let peer_key = sender.peer_key();
        let use_existing = self.peers.get(&peer_key).is_some_and(|session| {
            matches!(message, PairwiseMessage::Normal { .. }) || session.matches_prekey(&message)
        });

        let plaintext = if use_existing {
            let Some(session) = self.peers.get_mut(&peer_key) else {
                unreachable!("session presence was just checked");
            };
            Zeroizing::new(session.decrypt(&message)?)
        } else {
            let one_time_key = *message
                .one_time_key()
                .ok_or(PeerSessionError::Handshake(CryptoError::NotPreKeyMessage))?;

            let (session, plaintext) = PairwiseSession::inbound(
                identity.encryption_secret()?,
                identity.one_time_secret(&one_time_key)?,
                sender.encryption_key(),
                &message,
            )
            .map_err(PeerSessionError::Handshake)?;

            identity.consume_one_time_key(&one_time_key)?;
            if self.peers.remove(&peer_key).is_some() {
                tracing::info!(
                    user_id = %sender.user_id(),
                    device_id = %sender.device_id(),
                    "Peer started a new pairwise session; replacing the old one"
                );
            }
            self.peers.insert(PeerSession::new(peer_key, session, self.env.now()))?;

            tracing::debug!(
                user_id = %sender.user_id(),
                device_id = %sender.device_id(),
                "Created inbound pairwise session"
            );
            Zeroizing::new(plaintext)
        };

        let payload: OlmPayload = decode_json(&plaintext)?;
        check_binding(&payload, sender, identity, &own_keys.signing_b64())?;

        Ok(DecryptedToDevice {
            sender: payload.sender,
            sender_device: payload.sender_device,
            sender_key: content.sender_key.clone(),
            event_type: payload.event_type,
            content: payload.content,
        })
    }

    /// Import the group session carried by a decrypted `m.room_key` event,
    /// as [`import_inbound_session`](Self::import_inbound_session) does.
    /// Returns the session id.
    pub fn receive_room_key(&mut self, event: &DecryptedToDevice) -> Result<String, EngineError> {
        if event.event_type != ROOM_KEY_EVENT {
            return Err(EngineError::Protocol(format!("expected {ROOM_KEY_EVENT}, got {}", event.event_type)));
        }

        let content: RoomKeyContent = serde_json::from_value(event.content.clone())
            .map_err(|e| EngineError::Protocol(e.to_string()))?;
        if content.algorithm != MEGOLM_ALGORITHM {
            return Err(EngineError::Protocol(format!("unexpected algorithm {}", content.algorithm)));
        }

        let session = InboundGroupSession::import(event.sender_key.clone(), &content)?;
        Ok(self.import_inbound_session(session))
    }

    /// Decrypt a room event with a previously imported group session.
    ///
    /// # Errors
    ///
    /// - `UnknownGroupSession` if the session was never received
    /// - `PayloadMismatch` if the event's room or sender key differs from the
    ///   session's
    /// - `GroupSession` if verification or decryption fails
    pub fn decrypt_room_event(
        &mut self,
        room_id: &RoomId,
        content: &MegolmEncryptedContent,
    ) -> Result<DecryptedRoomEvent, EngineError> {
        let session = self
            .inbound
            .get_mut(&content.session_id)
            .ok_or_else(|| EngineError::UnknownGroupSession { session_id: content.session_id.clone() })?;

        if session.room_id() != room_id {
            return Err(EngineError::PayloadMismatch("group session belongs to another room".to_string()));
        }
        if session.sender_key() != content.sender_key {
            return Err(EngineError::PayloadMismatch("group session shared by another device".to_string()));
        }

        let (plaintext, message_index) = session.decrypt(content)?;
        Ok(DecryptedRoomEvent {
            plaintext,
            message_index,
            session_id: content.session_id.clone(),
            sender_key: content.sender_key.clone(),
        })
    }
}

fn device_ref(device: &RemoteDevice) -> DeviceRef {
    DeviceRef { user_id: device.user_id().clone(), device_id: device.device_id().clone() }
}

fn check_binding(
    payload: &OlmPayload,
    sender: &RemoteDevice,
    identity: &Identity,
    own_signing_key: &str,
) -> Result<(), EngineError> {
    if &payload.sender != sender.user_id() || &payload.sender_device != sender.device_id() {
        return Err(EngineError::PayloadMismatch("sender".to_string()));
    }
    if payload.keys.get(ED25519) != Some(&encode_b64(sender.signing_key())) {
        return Err(EngineError::PayloadMismatch("sender keys".to_string()));
    }
    if &payload.recipient != identity.user_id() {
        return Err(EngineError::PayloadMismatch("recipient".to_string()));
    }
    if payload.recipient_keys.get(ED25519).map(String::as_str) != Some(own_signing_key) {
        return Err(EngineError::PayloadMismatch("recipient keys".to_string()));
    }
    Ok(())
}
