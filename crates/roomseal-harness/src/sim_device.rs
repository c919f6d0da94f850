//! A simulated client device: identity, establisher and encryptor wired to
//! one [`SimHomeserver`] session.

use roomseal_core::{
    DecryptedToDevice, DeviceDirectory, DeviceId, EngineConfig, EngineError, Encryptor, Identity,
    PublishResult, RemoteDevice, RoomId, RoomMember, SessionEstablisher, UserId,
    config::ROOM_KEY_EVENT, wire::MegolmEncryptedContent,
};

use crate::{SimEnv, SimHomeserver, SimSession};

/// One device taking part in a simulation.
pub struct SimDevice {
    /// Local identity
    pub identity: Identity,
    /// Session state
    pub establisher: SessionEstablisher<SimEnv, SimSession>,
    /// Room message encryption, rotating per the establisher's config
    pub encryptor: Encryptor,
}

impl SimDevice {
    /// Device with a fresh identity and default configuration. Nothing is
    /// published yet.
    pub fn new(server: &SimHomeserver, env: &SimEnv, user_id: &str, device_id: &str) -> Self {
        Self::with_config(server, env, user_id, device_id, EngineConfig::default())
    }

    /// Device with a fresh identity and the given configuration.
    pub fn with_config(
        server: &SimHomeserver,
        env: &SimEnv,
        user_id: &str,
        device_id: &str,
        config: EngineConfig,
    ) -> Self {
        let identity = Identity::generated(UserId::from(user_id), DeviceId::from(device_id), env);
        let establisher = SessionEstablisher::new(env.clone(), server.session(user_id, device_id), config);
        Self { identity, establisher, encryptor: Encryptor }
    }

    /// Device that has already published its keys.
    pub fn published(
        server: &SimHomeserver,
        env: &SimEnv,
        user_id: &str,
        device_id: &str,
    ) -> Result<Self, EngineError> {
        let mut device = Self::new(server, env, user_id, device_id);
        device.publish()?;
        Ok(device)
    }

    /// Owning user.
    pub fn user_id(&self) -> &UserId {
        self.identity.user_id()
    }

    /// Device id.
    pub fn device_id(&self) -> &DeviceId {
        self.identity.device_id()
    }

    /// Upload device keys and top up one-time prekeys.
    pub fn publish(&mut self) -> Result<PublishResult, EngineError> {
        self.identity.publish(self.establisher.server(), self.establisher.env(), self.establisher.config())
    }

    /// This device as other devices see it.
    pub fn remote(&self) -> Result<RemoteDevice, EngineError> {
        let keys = self.identity.device_keys()?;
        RemoteDevice::from_device_keys(keys).map_err(|e| EngineError::Protocol(e.to_string()))
    }

    /// Fetch the current device lists of `users` from the server.
    pub fn directory(&self, users: &[UserId]) -> Result<DeviceDirectory, EngineError> {
        Ok(DeviceDirectory::fetch(self.establisher.server(), users)?)
    }

    /// Room members for `users`, as the server lists them.
    pub fn members(&self, users: &[UserId]) -> Result<Vec<RoomMember>, EngineError> {
        Ok(self.directory(users)?.members())
    }

    /// Encrypt a room message to `users`.
    pub fn send_room_message(
        &mut self,
        room_id: &RoomId,
        users: &[UserId],
        plaintext: &[u8],
    ) -> Result<MegolmEncryptedContent, EngineError> {
        let members = self.members(users)?;
        self.encryptor.encrypt_for_room(&mut self.establisher, &self.identity, room_id, &members, plaintext)
    }

    /// Drain the inbox and decrypt every event, importing room keys.
    ///
    /// Senders are looked up on the server; an unknown sender yields
    /// `UnverifiedSender`.
    pub fn receive_to_device(&mut self) -> Vec<Result<DecryptedToDevice, EngineError>> {
        let server = self.establisher.server().server().clone();
        let events = server.take_to_device(self.identity.user_id(), self.identity.device_id());

        events
            .into_iter()
            .map(|event| -> Result<DecryptedToDevice, EngineError> {
                let sender = server
                    .device_keys(&event.sender, &event.sender_device)
                    .and_then(|keys| RemoteDevice::from_device_keys(keys).ok())
                    .ok_or_else(|| EngineError::UnverifiedSender {
                        user_id: event.sender.clone(),
                        device_id: event.sender_device.clone(),
                    })?;

                let decrypted =
                    self.establisher.decrypt_from_device(&mut self.identity, &sender, &event.content)?;
                if decrypted.event_type == ROOM_KEY_EVENT {
                    self.establisher.receive_room_key(&decrypted)?;
                }
                Ok(decrypted)
            })
            .collect()
    }
}
