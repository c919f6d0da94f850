//! Fuzz target for the symmetric ratchet and message sealing
//!
//! # Strategy
//!
//! - Arbitrary seeds and starting generations (including near `u32::MAX`)
//! - Random sequences of advance and advance_to operations
//! - Seal with one key, open with the key the receiver derives
//! - Flip ciphertext bytes and associated data
//!
//! # Invariants
//!
//! - Sender and receiver derive identical keys for every generation
//! - The generation never decreases and never wraps
//! - Skips beyond MAX_SKIP and backwards skips are refused
//! - Seal/open round-trips; any tampering fails to open

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use roomseal_crypto::{
    NONCE_RANDOM_SIZE, SymmetricRatchet, open_message, ratchet::MAX_SKIP, seal_message,
};

#[derive(Debug, Clone, Arbitrary)]
struct Scenario {
    seed: [u8; 32],
    start: Start,
    operations: Vec<Operation>,
    random: [u8; NONCE_RANDOM_SIZE],
    plaintext: Vec<u8>,
    flip: Option<usize>,
}

#[derive(Debug, Clone, Arbitrary)]
enum Start {
    Zero,
    At(u32),
    NearEnd(u8),
}

#[derive(Debug, Clone, Arbitrary)]
enum Operation {
    Advance,
    Skip(u16),
    Back(u16),
}

fuzz_target!(|scenario: Scenario| {
    let start = match scenario.start {
        Start::Zero => 0,
        Start::At(generation) => generation,
        Start::NearEnd(distance) => u32::MAX - u32::from(distance),
    };

    let mut sender = SymmetricRatchet::from_parts(&scenario.seed, start);
    let mut receiver = SymmetricRatchet::from_parts(&scenario.seed, start);

    for operation in scenario.operations.iter().take(64) {
        let before = sender.generation();
        match operation {
            Operation::Advance => {
                let sent = sender.advance();
                let received = receiver.advance_to(before);
                match (sent, received) {
                    (Ok(sent), Ok(received)) => assert_eq!(sent.key(), received.key()),
                    (Err(_), _) => assert!(sender.is_exhausted()),
                    (Ok(_), Err(e)) => panic!("receiver diverged: {e}"),
                }
            }

            Operation::Skip(distance) => {
                let target = before.saturating_add(u32::from(*distance));
                let sent = sender.advance_to(target);
                let received = receiver.advance_to(target);

                if u32::from(*distance) > MAX_SKIP {
                    assert!(sent.is_err());
                    assert_eq!(sender.generation(), before);
                }
                match (sent, received) {
                    (Ok(sent), Ok(received)) => assert_eq!(sent.key(), received.key()),
                    (Ok(_), Err(e)) | (Err(e), Ok(_)) => panic!("ratchets diverged: {e}"),
                    (Err(_), Err(_)) => {}
                }
            }

            Operation::Back(distance) => {
                if *distance > 0 && before >= u32::from(*distance) {
                    assert!(sender.advance_to(before - u32::from(*distance)).is_err());
                    assert_eq!(sender.generation(), before);
                }
            }
        }
        assert!(sender.generation() >= before);
    }

    let mut sealer = SymmetricRatchet::new(&scenario.seed);
    let mut opener = SymmetricRatchet::new(&scenario.seed);
    let (Ok(seal_key), Ok(open_key)) = (sealer.advance(), opener.advance()) else {
        return;
    };

    let mut sealed = seal_message(&scenario.plaintext, &seal_key, b"session", scenario.random);
    assert_eq!(open_message(&sealed, &open_key, b"session").ok(), Some(scenario.plaintext.clone()));
    assert!(open_message(&sealed, &open_key, b"other").is_err());

    if let Some(index) = scenario.flip {
        let len = sealed.ciphertext.len();
        sealed.ciphertext[index % len] ^= 0x01;
        assert!(open_message(&sealed, &open_key, b"session").is_err());
    }
});
