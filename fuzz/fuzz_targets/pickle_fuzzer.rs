//! Fuzz target for pickle decryption and restore
//!
//! Pickles come back from storage the engine does not control, so every
//! restore path must treat them as hostile.
//!
//! # Strategy
//!
//! - Random bytes opened under random keys
//! - Valid pickles opened under a different key
//! - Valid pickles with one byte flipped
//!
//! # Invariants
//!
//! - NEVER panic on malformed pickles
//! - Every failure is reported as an invalid pickle
//! - A valid pickle opens only under its own key

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use roomseal_core::{DeviceId, Identity, IdentityError, InboundGroupSession, UserId};
use roomseal_crypto::{open_pickle, seal_pickle};

#[derive(Debug, Clone, Arbitrary)]
enum Input {
    Random { key: Vec<u8>, bytes: Vec<u8> },
    Sealed { key: Vec<u8>, other_key: Vec<u8>, plaintext: Vec<u8>, nonce: [u8; 24], flip: usize },
}

fuzz_target!(|input: Input| {
    match input {
        Input::Random { key, bytes } => {
            let _ = open_pickle(&key, &bytes);
            if let Err(e) = Identity::from_pickle(&key, &bytes) {
                assert_eq!(e, IdentityError::InvalidPickle);
            }
            let _ = InboundGroupSession::from_pickle(&key, &bytes);

            let mut identity = Identity::new(UserId::from("@fuzz:x"), DeviceId::from("FUZZ"));
            let _ = identity.restore(&key, &bytes);
        }

        Input::Sealed { key, other_key, plaintext, nonce, flip } => {
            let sealed = seal_pickle(&key, &plaintext, nonce);
            let opened = open_pickle(&key, &sealed).ok();
            assert_eq!(opened.as_deref().map(Vec::as_slice), Some(plaintext.as_slice()));

            if other_key != key {
                assert!(open_pickle(&other_key, &sealed).is_err());
            }

            let mut tampered = sealed;
            let index = flip % tampered.len();
            tampered[index] ^= 0x80;
            assert!(open_pickle(&key, &tampered).is_err());
        }
    }
});
