//! Collaborator interfaces: the homeserver and pickle persistence.
//!
//! Both are synchronous. Each method is one request/response round-trip that
//! the calling thread waits on; the engine never retries on its own.

use thiserror::Error;

use crate::{
    ids::UserId,
    wire::{DeviceKeys, DeviceRef, KeysClaimResponse, KeysUploadRequest, KeysUploadResponse, ToDeviceBatch},
};

/// Errors surfaced by collaborator implementations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Request could not be delivered or the server returned an error
    #[error("network error: {0}")]
    Network(String),

    /// No response within the collaborator's deadline
    #[error("request timed out")]
    Timeout,

    /// Response arrived but could not be understood
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl TransportError {
    /// Returns true if repeating the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout)
    }
}

/// The key server and to-device relay, typed at the boundary.
pub trait Homeserver {
    /// Upload device keys and/or signed one-time prekeys.
    ///
    /// The response reports how many one-time prekeys the server holds for
    /// this device after the upload.
    fn upload_keys(&self, request: &KeysUploadRequest) -> Result<KeysUploadResponse, TransportError>;

    /// Claim one signed one-time prekey for each listed device.
    ///
    /// Devices for which the server has no prekey are simply absent from the
    /// response.
    fn claim_one_time_keys(&self, devices: &[DeviceRef]) -> Result<KeysClaimResponse, TransportError>;

    /// Deliver one encrypted message per device in a single request.
    fn send_to_device(
        &self,
        event_type: &str,
        txn_id: &str,
        batch: &ToDeviceBatch,
    ) -> Result<(), TransportError>;

    /// Signed device key bundles for every device of the given users.
    fn list_devices(&self, users: &[UserId]) -> Result<Vec<DeviceKeys>, TransportError>;
}

/// Storage for encrypted identity pickles.
///
/// Implementations only ever see ciphertext; the pickle key stays with the
/// caller.
pub trait PickleStore {
    /// Store (or replace) the pickle for `identity_id`.
    fn persist_pickle(&self, identity_id: &str, pickle: &[u8]) -> Result<(), TransportError>;

    /// Load the pickle for `identity_id`, if one was stored.
    fn load_pickle(&self, identity_id: &str) -> Result<Option<Vec<u8>>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_failures_are_transient() {
        assert!(TransportError::Network("connection reset".to_string()).is_transient());
        assert!(TransportError::Timeout.is_transient());
        assert!(!TransportError::MalformedResponse("bad json".to_string()).is_transient());
    }
}
