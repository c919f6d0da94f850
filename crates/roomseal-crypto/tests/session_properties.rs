//! Property-based tests for pairwise and group sessions
//!
//! These tests verify the invariants the session engine relies on:
//!
//! 1. **Group delivery**: every message of a session decrypts, in any order,
//!    for a receiver that imported the key before it was sent
//! 2. **Forward secrecy**: a key exported at index `k` cannot decrypt any
//!    message before `k`
//! 3. **Authenticity**: a tampered group message is rejected and leaves the
//!    receiver able to decrypt the untampered one
//! 4. **Conversation**: a pairwise session carries any interleaving of
//!    messages in both directions

use proptest::prelude::*;
use roomseal_crypto::{
    InboundGroupRatchet, NONCE_RANDOM_SIZE, OutboundGroupRatchet, PairwiseMessage, PairwiseSession,
    canonical_json_value, x25519_public_key,
};

fn seed() -> impl Strategy<Value = [u8; 32]> {
    any::<[u8; 32]>()
}

fn messages(max: usize) -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 1..max)
}

fn random(i: usize) -> [u8; NONCE_RANDOM_SIZE] {
    [i as u8; NONCE_RANDOM_SIZE]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_group_messages_decrypt_in_any_order(
        chain_seed in seed(),
        signing_seed in seed(),
        plaintexts in messages(24),
        order_seed in any::<u64>(),
    ) {
        let mut outbound = OutboundGroupRatchet::new(chain_seed, signing_seed);
        let mut inbound = InboundGroupRatchet::import(&outbound.session_key()).unwrap();

        let mut sent: Vec<_> = plaintexts
            .iter()
            .enumerate()
            .map(|(i, p)| (p.clone(), outbound.encrypt(p, random(i)).unwrap()))
            .collect();

        // Deterministic shuffle driven by the seed
        let mut state = order_seed;
        for i in (1..sent.len()).rev() {
            state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            let j = (state >> 33) as usize % (i + 1);
            sent.swap(i, j);
        }

        for (plaintext, message) in &sent {
            prop_assert_eq!(&inbound.decrypt(message).unwrap(), plaintext);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_late_import_cannot_read_history(
        chain_seed in seed(),
        signing_seed in seed(),
        total in 2usize..20,
        join_at_fraction in 0.0f64..1.0,
    ) {
        let join_at = ((total as f64) * join_at_fraction) as usize;
        let mut outbound = OutboundGroupRatchet::new(chain_seed, signing_seed);

        let mut sent = Vec::new();
        let mut late_key = None;
        for i in 0..total {
            if i == join_at {
                late_key = Some(outbound.session_key());
            }
            sent.push(outbound.encrypt(&[i as u8], random(i)).unwrap());
        }

        let key = late_key.unwrap();
        prop_assert_eq!(key.index() as usize, join_at);
        let mut inbound = InboundGroupRatchet::import(&key).unwrap();
        prop_assert_eq!(inbound.first_known_index() as usize, join_at);

        for (i, message) in sent.iter().enumerate() {
            let result = inbound.decrypt(message);
            if i < join_at {
                prop_assert!(result.is_err(), "message {} predates the key", i);
            } else {
                prop_assert_eq!(result.unwrap(), vec![i as u8]);
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_tampered_group_message_is_rejected(
        chain_seed in seed(),
        signing_seed in seed(),
        plaintext in prop::collection::vec(any::<u8>(), 0..128),
        flip_at in any::<usize>(),
        flip_signature in any::<bool>(),
    ) {
        let mut outbound = OutboundGroupRatchet::new(chain_seed, signing_seed);
        let mut inbound = InboundGroupRatchet::import(&outbound.session_key()).unwrap();
        let message = outbound.encrypt(&plaintext, random(0)).unwrap();

        let mut tampered = message.clone();
        if flip_signature {
            let i = flip_at % tampered.signature.len();
            tampered.signature[i] ^= 0x01;
        } else {
            let i = flip_at % tampered.body.ciphertext.len();
            tampered.body.ciphertext[i] ^= 0x01;
        }

        prop_assert!(inbound.decrypt(&tampered).is_err());
        prop_assert_eq!(inbound.decrypt(&message).unwrap(), plaintext);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(30))]

    #[test]
    fn prop_pairwise_conversation(
        alice_secret in seed(),
        bob_secret in seed(),
        one_time_secret in seed(),
        ephemeral in seed(),
        turns in prop::collection::vec(any::<bool>(), 1..20),
    ) {
        let bob_identity = x25519_public_key(&bob_secret);
        let one_time = x25519_public_key(&one_time_secret);

        let Ok(mut alice) =
            PairwiseSession::outbound(&alice_secret, ephemeral, &bob_identity, &one_time)
        else {
            // Degenerate keys that produce non-contributory DH are refused up front
            return Ok(());
        };

        let first = alice.encrypt(b"hello", random(0)).unwrap();
        let (mut bob, plaintext) = PairwiseSession::inbound(
            &bob_secret,
            &one_time_secret,
            &x25519_public_key(&alice_secret),
            &first,
        )
        .unwrap();
        prop_assert_eq!(plaintext, b"hello".to_vec());
        prop_assert_eq!(alice.session_id(), bob.session_id());

        let mut bob_replied = false;
        for (i, alice_speaks) in turns.iter().enumerate() {
            let text = format!("turn {i}").into_bytes();
            if *alice_speaks {
                let message = alice.encrypt(&text, random(i)).unwrap();
                prop_assert_eq!(matches!(message, PairwiseMessage::PreKey { .. }), !bob_replied);
                prop_assert_eq!(bob.decrypt(&message).unwrap(), text);
            } else {
                let message = bob.encrypt(&text, random(i)).unwrap();
                let is_normal = matches!(message, PairwiseMessage::Normal { .. });
                prop_assert!(is_normal);
                prop_assert_eq!(alice.decrypt(&message).unwrap(), text);
                bob_replied = true;
                prop_assert!(!alice.is_pending_prekey());
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_canonical_json_ignores_key_order(
        entries in prop::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..10),
    ) {
        let forward: serde_json::Map<String, serde_json::Value> =
            entries.iter().map(|(k, v)| (k.clone(), serde_json::Value::from(*v))).collect();
        let reverse: serde_json::Map<String, serde_json::Value> =
            entries.iter().rev().map(|(k, v)| (k.clone(), serde_json::Value::from(*v))).collect();

        prop_assert_eq!(
            canonical_json_value(&serde_json::Value::Object(forward)),
            canonical_json_value(&serde_json::Value::Object(reverse))
        );
    }
}
