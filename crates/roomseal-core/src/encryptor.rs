//! Room message encryption.
//!
//! Wraps the establisher's outbound group sessions with the rotation policy
//! from its [`EngineConfig`](crate::EngineConfig): a session that hit its
//! message or age limit, or whose ratchet ran out, is retired and a fresh one
//! distributed before the message goes out.

use crate::{
    device::RoomMember,
    env::Environment,
    error::{EngineError, GroupSessionError},
    establisher::{RoomState, SessionEstablisher},
    identity::Identity,
    ids::RoomId,
    transport::Homeserver,
    wire::MegolmEncryptedContent,
};

/// Encrypts room messages, establishing and rotating group sessions as
/// needed.
#[derive(Debug, Clone, Copy, Default)]
pub struct Encryptor;

impl Encryptor {
    /// Encrypt `plaintext` for a room.
    ///
    /// If the room has no ready group session, one is established with
    /// `members` first. Membership changes are not tracked here: callers that
    /// add devices to a ready room call
    /// [`SessionEstablisher::ensure_group_session`] themselves.
    ///
    /// # Errors
    ///
    /// - Anything `ensure_group_session` returns when establishment is needed
    /// - `RoomNotReady` if establishment succeeded without making the room
    ///   ready
    /// - `Identity` if the identity is not usable
    pub fn encrypt_for_room<E: Environment, H: Homeserver>(
        &self,
        establisher: &mut SessionEstablisher<E, H>,
        identity: &Identity,
        room_id: &RoomId,
        members: &[RoomMember],
        plaintext: &[u8],
    ) -> Result<MegolmEncryptedContent, EngineError> {
        let now = establisher.env().now();
        let policy = establisher.config().rotation;
        let rotate = establisher
            .group_session(room_id)
            .is_some_and(|session| session.needs_rotation(&policy, now));
        if rotate {
            establisher.retire_group_session(room_id);
        }

        if establisher.room_state(room_id) != RoomState::Ready {
            establisher.ensure_group_session(room_id, members, identity)?;
        }

        let sender_key = identity.identity_keys()?.encryption_b64();
        let env = establisher.env().clone();

        for attempt in 0..2 {
            let session = establisher
                .ready_session_mut(room_id)
                .ok_or_else(|| EngineError::RoomNotReady { room_id: room_id.clone() })?;

            match session.encrypt(plaintext, &env) {
                Ok(message) => {
                    let content =
                        session.encrypted_content(&message, sender_key, identity.device_id().clone());
                    tracing::trace!(
                        room_id = %room_id,
                        session_id = %content.session_id,
                        index = message.message_index(),
                        "Encrypted room message"
                    );
                    return Ok(content);
                },
                Err(GroupSessionError::RatchetExhausted) if attempt == 0 => {
                    tracing::info!(room_id = %room_id, "Group session exhausted, rotating");
                    establisher.retire_group_session(room_id);
                    establisher.ensure_group_session(room_id, members, identity)?;
                },
                Err(e) => return Err(e.into()),
            }
        }

        Err(GroupSessionError::RatchetExhausted.into())
    }
}
