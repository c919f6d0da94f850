//! Fuzz target for wire and message decoding
//!
//! Every byte string a peer or the homeserver can hand the engine goes
//! through one of these decoders before any key material is touched.
//!
//! # Strategy
//!
//! - Random bytes as pairwise and group messages (CBOR)
//! - Random strings as exported session keys (base64 + CBOR)
//! - Random bytes as JSON wire shapes and encrypted payloads
//! - Decoded messages are re-encoded and decoded again
//!
//! # Invariants
//!
//! - NEVER panic on malformed input
//! - A message that decodes re-encodes to something that decodes to itself
//! - A decoded session key with a bad signature is refused on import

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use roomseal_core::wire::{
    DeviceKeys, KeysClaimResponse, MegolmEncryptedContent, OlmEncryptedContent, OlmPayload,
    RoomKeyContent, decode_json,
};
use roomseal_crypto::{GroupMessage, InboundGroupRatchet, PairwiseMessage, SessionKey};

#[derive(Debug, Clone, Arbitrary)]
enum Input {
    Pairwise(Vec<u8>),
    Group(Vec<u8>),
    SessionKey(String),
    Json(Vec<u8>),
}

fuzz_target!(|input: Input| {
    match input {
        Input::Pairwise(bytes) => {
            if let Ok(message) = PairwiseMessage::from_bytes(&bytes) {
                let again = PairwiseMessage::from_bytes(&message.to_bytes());
                assert_eq!(again.ok().as_ref(), Some(&message));
                assert!(message.message_type() <= 1);
            }
        }

        Input::Group(bytes) => {
            if let Ok(message) = GroupMessage::from_bytes(&bytes) {
                let again = GroupMessage::from_bytes(&message.to_bytes());
                assert_eq!(again.ok().as_ref(), Some(&message));
            }
        }

        Input::SessionKey(encoded) => {
            if let Ok(key) = SessionKey::from_base64(&encoded) {
                // Arbitrary input essentially never carries a valid signature
                let _ = InboundGroupRatchet::import(&key);
            }
        }

        Input::Json(bytes) => {
            let _ = decode_json::<DeviceKeys>(&bytes);
            let _ = decode_json::<KeysClaimResponse>(&bytes);
            let _ = decode_json::<OlmEncryptedContent>(&bytes);
            let _ = decode_json::<MegolmEncryptedContent>(&bytes);
            let _ = decode_json::<OlmPayload>(&bytes);
            let _ = decode_json::<RoomKeyContent>(&bytes);
        }
    }
});
