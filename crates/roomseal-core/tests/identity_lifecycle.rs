//! Identity publishing and persistence against the simulated homeserver.

use std::collections::BTreeSet;

use roomseal_core::{
    DeviceId, EngineConfig, EngineError, Identity, IdentityError, RemoteDevice, TransportError,
    UserId,
};
use roomseal_harness::{MemoryPickleStore, SimDevice, SimEnv, SimHomeserver};

const PICKLE_KEY: &[u8] = b"correct horse battery staple";

/// INVARIANT: the first publish stocks the server to half the maximum.
#[test]
fn first_publish_fills_to_target() {
    let env = SimEnv::with_seed(1);
    let server = SimHomeserver::new();
    let mut alice = SimDevice::new(&server, &env, "@alice:x", "ALICE");

    let result = alice.publish().unwrap();

    assert_eq!(result.remaining_before, 0);
    assert_eq!(result.generated, 50);
    assert_eq!(result.uploaded, 50);
    assert_eq!(result.remaining_after, 50);
    assert_eq!(server.one_time_key_count(alice.user_id(), alice.device_id()), 50);
    assert!(server.device_keys(alice.user_id(), alice.device_id()).is_some());
}

/// INVARIANT: publishing replaces exactly what was claimed, and no key id is
/// ever uploaded twice.
#[test]
fn publish_replaces_claimed_keys_without_reuse() {
    let env = SimEnv::with_seed(2);
    let server = SimHomeserver::new();
    let mut bob = SimDevice::published(&server, &env, "@bob:x", "BOB").unwrap();
    let mut alice = SimDevice::published(&server, &env, "@alice:x", "ALICE").unwrap();

    alice.send_room_message(&"!room:x".into(), &[bob.user_id().clone()], b"hi").unwrap();
    assert_eq!(server.one_time_key_count(bob.user_id(), bob.device_id()), 49);

    let result = bob.publish().unwrap();
    assert_eq!(result.remaining_before, 49);
    assert_eq!(result.generated, 1);
    assert_eq!(result.uploaded, 1);
    assert_eq!(result.remaining_after, 50);

    let mut seen = BTreeSet::new();
    for upload in server.uploads() {
        for key_id in upload.one_time_keys.keys() {
            assert!(seen.insert(key_id.clone()), "key id {key_id} uploaded twice");
        }
    }
}

/// INVARIANT: with 5 keys left from a failed upload and 10 on the server, a
/// publish against a pool of 100 generates 35 and uploads 40, and none of
/// those ids is offered again.
#[test]
fn publish_tops_up_with_leftover_keys() {
    let env = SimEnv::with_seed(12);
    let server = SimHomeserver::new();
    let mut alice = SimDevice::published(&server, &env, "@alice:x", "ALICE").unwrap();
    let mut carol = SimDevice::new(&server, &env, "@carol:x", "CAROL");
    let pool = |max_one_time_keys| EngineConfig { max_one_time_keys, ..EngineConfig::default() };

    let stocked = carol.identity.publish(carol.establisher.server(), &env, &pool(20)).unwrap();
    assert_eq!(stocked.uploaded, 10);

    server.fail_next_one_time_key_upload(TransportError::Timeout);
    let failed = carol.identity.publish(carol.establisher.server(), &env, &pool(30));
    assert!(matches!(failed, Err(EngineError::Network(TransportError::Timeout))));
    assert_eq!(carol.identity.unpublished_one_time_keys().unwrap(), 5);
    assert_eq!(server.one_time_key_count(carol.user_id(), carol.device_id()), 10);

    let result = carol.publish().unwrap();
    assert_eq!(result.remaining_before, 10);
    assert_eq!(result.generated, 35);
    assert_eq!(result.uploaded, 40);
    assert_eq!(result.remaining_after, 50);
    assert_eq!(carol.identity.unpublished_one_time_keys().unwrap(), 0);

    alice.send_room_message(&"!room:x".into(), &[carol.user_id().clone()], b"hi").unwrap();
    let refill = carol.publish().unwrap();
    assert_eq!(refill.generated, 1);
    assert_eq!(refill.uploaded, 1);

    // Alice's keys were uploaded first; the last three uploads are Carol's
    let uploads: Vec<BTreeSet<String>> = server
        .uploads()
        .iter()
        .filter(|upload| !upload.one_time_keys.is_empty())
        .map(|upload| upload.one_time_keys.keys().cloned().collect())
        .collect();
    let [.., first, topped_up, refilled] = uploads.as_slice() else {
        panic!("expected three uploads from carol, got {}", uploads.len());
    };
    assert_eq!((first.len(), topped_up.len(), refilled.len()), (10, 40, 1));
    assert!(first.is_disjoint(topped_up));
    assert!(refilled.is_disjoint(topped_up));
    assert!(refilled.is_disjoint(first));
}

/// INVARIANT: a stocked server gets no new keys.
#[test]
fn publish_when_stocked_uploads_nothing() {
    let env = SimEnv::with_seed(3);
    let server = SimHomeserver::new();
    let mut alice = SimDevice::published(&server, &env, "@alice:x", "ALICE").unwrap();

    let result = alice.publish().unwrap();

    assert_eq!(result.generated, 0);
    assert_eq!(result.uploaded, 0);
    assert_eq!(alice.identity.unpublished_one_time_keys().unwrap(), 0);
}

/// INVARIANT: keys generated for a failed upload are offered again and are
/// not regenerated.
#[test]
fn failed_upload_keeps_keys_unpublished() {
    let env = SimEnv::with_seed(4);
    let server = SimHomeserver::new();
    let mut carol = SimDevice::new(&server, &env, "@carol:x", "CAROL");
    server.fail_next_one_time_key_upload(TransportError::Timeout);

    assert!(matches!(carol.publish(), Err(EngineError::Network(TransportError::Timeout))));
    assert_eq!(carol.identity.unpublished_one_time_keys().unwrap(), 50);

    let result = carol.publish().unwrap();
    assert_eq!(result.generated, 0);
    assert_eq!(result.uploaded, 50);
    assert_eq!(carol.identity.unpublished_one_time_keys().unwrap(), 0);
    assert_eq!(server.one_time_key_count(carol.user_id(), carol.device_id()), 50);
}

/// INVARIANT: a published bundle verifies for other devices.
#[test]
fn published_bundle_verifies() {
    let env = SimEnv::with_seed(5);
    let server = SimHomeserver::new();
    let alice = SimDevice::published(&server, &env, "@alice:x", "ALICE").unwrap();

    let keys = server.device_keys(alice.user_id(), alice.device_id()).unwrap();
    let remote = RemoteDevice::from_device_keys(keys).unwrap();
    assert!(remote.verify().is_ok());
    assert!(remote.can_receive_room_keys());
}

/// INVARIANT: an identity persisted through the store comes back with the
/// same keys, and only with the right pickle key.
#[test]
fn persist_and_load_through_store() {
    let env = SimEnv::with_seed(6);
    let store = MemoryPickleStore::new();
    let identity = Identity::generated(UserId::from("@alice:x"), DeviceId::from("ALICE"), &env);

    identity.persist(&store, "alice", PICKLE_KEY, &env).unwrap();

    let loaded = Identity::load(&store, "alice", PICKLE_KEY).unwrap().unwrap();
    assert_eq!(loaded.identity_keys().unwrap(), identity.identity_keys().unwrap());
    assert_eq!(loaded.device_id(), identity.device_id());

    let wrong = Identity::load(&store, "alice", b"wrong key");
    assert!(matches!(wrong, Err(EngineError::Identity(IdentityError::InvalidPickle))));

    assert!(Identity::load(&store, "nobody", PICKLE_KEY).unwrap().is_none());
}

/// INVARIANT: stored bytes are encrypted, and tampering is detected.
#[test]
fn stored_pickle_is_opaque_and_authenticated() {
    let env = SimEnv::with_seed(7);
    let store = MemoryPickleStore::new();
    let identity = Identity::generated(UserId::from("@alice:x"), DeviceId::from("ALICE"), &env);
    identity.persist(&store, "alice", PICKLE_KEY, &env).unwrap();

    let mut raw = store.raw("alice").unwrap();
    let user_id = b"@alice:x";
    assert!(!raw.windows(user_id.len()).any(|w| w == user_id), "pickle is encrypted");

    let last = raw.len() - 1;
    raw[last] ^= 0x01;
    store.set_raw("alice", raw);
    assert!(matches!(
        Identity::load(&store, "alice", PICKLE_KEY),
        Err(EngineError::Identity(IdentityError::InvalidPickle))
    ));
}

/// INVARIANT: a failed write surfaces as a network error and stores nothing.
#[test]
fn persist_failure_is_reported() {
    let env = SimEnv::with_seed(8);
    let store = MemoryPickleStore::new();
    let identity = Identity::generated(UserId::from("@alice:x"), DeviceId::from("ALICE"), &env);
    store.fail_next_write(TransportError::Network("disk full".to_string()));

    let result = identity.persist(&store, "alice", PICKLE_KEY, &env);
    assert!(matches!(result, Err(EngineError::Network(_))));
    assert!(store.is_empty());
}

/// INVARIANT: a restored identity keeps its unconsumed prekeys and can still
/// complete handshakes addressed to them.
#[test]
fn restored_identity_accepts_pending_handshake() {
    let env = SimEnv::with_seed(9);
    let server = SimHomeserver::new();
    let mut alice = SimDevice::published(&server, &env, "@alice:x", "ALICE").unwrap();
    let mut bob = SimDevice::published(&server, &env, "@bob:x", "BOB").unwrap();
    let content = alice.send_room_message(&"!room:x".into(), &[bob.user_id().clone()], b"hi").unwrap();

    let pickle = bob.identity.pickle(PICKLE_KEY, &env).unwrap();
    bob.identity = Identity::from_pickle(PICKLE_KEY, &pickle).unwrap();

    let received = bob.receive_to_device();
    assert!(received[0].is_ok());
    let decrypted = bob.establisher.decrypt_room_event(&"!room:x".into(), &content).unwrap();
    assert_eq!(decrypted.plaintext, b"hi");
    assert_eq!(bob.identity.one_time_key_count().unwrap(), 49);
}

/// INVARIANT: a prekey consumed by one handshake cannot start another.
#[test]
fn consumed_prekey_cannot_be_reused() {
    let env = SimEnv::with_seed(10);
    let server = SimHomeserver::new();
    let mut alice = SimDevice::published(&server, &env, "@alice:x", "ALICE").unwrap();
    let mut bob = SimDevice::published(&server, &env, "@bob:x", "BOB").unwrap();
    alice.send_room_message(&"!room:x".into(), &[bob.user_id().clone()], b"hi").unwrap();

    let events = server.take_to_device(bob.user_id(), bob.device_id());
    for event in &events {
        server.inject_to_device((bob.user_id(), bob.device_id()), event.clone());
    }
    assert!(bob.receive_to_device()[0].is_ok());

    // Drop the session so the replay has to start a new one
    let mut fresh = SimDevice::new(&server, &env, "@bob:x", "BOB");
    std::mem::swap(&mut fresh.identity, &mut bob.identity);
    for event in events {
        server.inject_to_device((fresh.user_id(), fresh.device_id()), event);
    }
    let replay = fresh.receive_to_device();
    assert!(matches!(replay[0], Err(EngineError::Identity(IdentityError::UnknownOneTimeKey))));
}

/// INVARIANT: a destroyed identity refuses every key operation, and a second
/// destroy is reported.
#[test]
fn destroyed_identity_is_unusable() {
    let env = SimEnv::with_seed(11);
    let server = SimHomeserver::new();
    let mut alice = SimDevice::published(&server, &env, "@alice:x", "ALICE").unwrap();

    alice.identity.destroy().unwrap();
    assert!(alice.identity.secret_is_zeroed());
    assert_eq!(alice.identity.destroy(), Err(IdentityError::DoubleDestroy));
    assert!(matches!(alice.publish(), Err(EngineError::Identity(IdentityError::Destroyed))));
    assert!(matches!(alice.identity.pickle(PICKLE_KEY, &env), Err(IdentityError::Destroyed)));
}
