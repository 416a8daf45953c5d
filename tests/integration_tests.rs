use secure_session::{
    CiphertextEnvelope, Error, KeyKind, PeerId, SessionConfig, SessionManager,
};

fn manager(name: &str, config: SessionConfig) -> (PeerId, SessionManager) {
    let id = PeerId::new(name).unwrap();
    let manager = SessionManager::new(id.clone(), config).unwrap();
    (id, manager)
}

/// Hands `to`'s first prekey bundle to `from`, the way a directory would.
fn introduce(from: &SessionManager, to_id: &PeerId, to: &SessionManager) {
    let bundle = to
        .export_public_bundle()
        .unwrap()
        .first_pre_key_bundle()
        .unwrap();
    from.process_peer_bundle(to_id, bundle).unwrap();
}

fn connected(config: SessionConfig) -> (PeerId, SessionManager, PeerId, SessionManager) {
    let (alice_id, alice) = manager("alice", config);
    let (bob_id, bob) = manager("bob", config);
    introduce(&alice, &bob_id, &bob);
    (alice_id, alice, bob_id, bob)
}

fn flip_bit(encoded: &str, bit: usize) -> String {
    let mut envelope = CiphertextEnvelope::decode(encoded).unwrap();
    envelope.ciphertext[bit / 8] ^= 1 << (bit % 8);
    envelope.encode()
}

#[test]
fn test_complete_conversation() {
    let (alice_id, alice, bob_id, bob) = connected(SessionConfig::default());

    for round in 0..5 {
        for i in 0..3 {
            let text = format!("alice {round}.{i}");
            let envelope = alice.encrypt(&bob_id, text.as_bytes()).unwrap();
            assert_eq!(bob.decrypt(&alice_id, &envelope).unwrap(), text.as_bytes());
        }

        let text = format!("bob {round}");
        let envelope = bob.encrypt(&alice_id, text.as_bytes()).unwrap();
        assert_eq!(alice.decrypt(&bob_id, &envelope).unwrap(), text.as_bytes());
    }

    assert!(alice.has_session(&bob_id).unwrap());
    assert!(bob.has_session(&alice_id).unwrap());
}

#[test]
fn test_empty_and_large_messages() {
    let (alice_id, alice, bob_id, bob) = connected(SessionConfig::default());

    let empty = alice.encrypt(&bob_id, b"").unwrap();
    assert_eq!(bob.decrypt(&alice_id, &empty).unwrap(), b"");

    let large = vec![0x42u8; 1024 * 1024];
    let envelope = alice.encrypt(&bob_id, &large).unwrap();
    assert_eq!(bob.decrypt(&alice_id, &envelope).unwrap(), large);
}

#[test]
fn test_one_time_prekey_consumed_once() {
    let (bob_id, bob) = manager("bob", SessionConfig::default());
    let (alice_id, alice) = manager("alice", SessionConfig::default());
    let (carol_id, carol) = manager("carol", SessionConfig::default());

    // A misbehaving directory hands the same one-time prekey to two initiators.
    let bundle = bob
        .export_public_bundle()
        .unwrap()
        .first_pre_key_bundle()
        .unwrap();
    let one_time_id = bundle.one_time_pre_key.unwrap().id;
    alice.process_peer_bundle(&bob_id, bundle.clone()).unwrap();
    carol.process_peer_bundle(&bob_id, bundle).unwrap();

    let from_alice = alice.encrypt(&bob_id, b"from alice").unwrap();
    let from_carol = carol.encrypt(&bob_id, b"from carol").unwrap();

    assert_eq!(bob.decrypt(&alice_id, &from_alice).unwrap(), b"from alice");
    assert_eq!(
        bob.decrypt(&carol_id, &from_carol),
        Err(Error::KeyNotFound {
            kind: KeyKind::OneTime,
            id: one_time_id
        })
    );
    assert!(!bob.has_session(&carol_id).unwrap());
}

#[test]
fn test_out_of_order_delivery() {
    let (alice_id, alice, bob_id, bob) = connected(SessionConfig::default());

    let m1 = alice.encrypt(&bob_id, b"M1").unwrap();
    let m2 = alice.encrypt(&bob_id, b"M2").unwrap();
    let m3 = alice.encrypt(&bob_id, b"M3").unwrap();

    assert_eq!(bob.decrypt(&alice_id, &m3).unwrap(), b"M3");
    assert_eq!(bob.decrypt(&alice_id, &m1).unwrap(), b"M1");
    assert_eq!(bob.decrypt(&alice_id, &m2).unwrap(), b"M2");

    for envelope in [&m1, &m2, &m3] {
        assert_eq!(
            bob.decrypt(&alice_id, envelope),
            Err(Error::DuplicateMessage)
        );
    }
}

#[test]
fn test_out_of_order_across_ratchet_steps() {
    let (alice_id, alice, bob_id, bob) = connected(SessionConfig::default());

    let a1 = alice.encrypt(&bob_id, b"a1").unwrap();
    bob.decrypt(&alice_id, &a1).unwrap();

    let b1 = bob.encrypt(&alice_id, b"b1").unwrap();
    let b2 = bob.encrypt(&alice_id, b"b2").unwrap();
    alice.decrypt(&bob_id, &b2).unwrap();

    let a2 = alice.encrypt(&bob_id, b"a2").unwrap();
    bob.decrypt(&alice_id, &a2).unwrap();
    let b3 = bob.encrypt(&alice_id, b"b3").unwrap();

    assert_eq!(alice.decrypt(&bob_id, &b3).unwrap(), b"b3");
    assert_eq!(alice.decrypt(&bob_id, &b1).unwrap(), b"b1");
}

#[test]
fn test_replay_rejected() {
    let (alice_id, alice, bob_id, bob) = connected(SessionConfig::default());

    let envelope = alice.encrypt(&bob_id, b"pay 10").unwrap();
    assert_eq!(bob.decrypt(&alice_id, &envelope).unwrap(), b"pay 10");
    assert_eq!(
        bob.decrypt(&alice_id, &envelope),
        Err(Error::DuplicateMessage)
    );
}

#[test]
fn test_tampering_any_bit() {
    let (alice_id, alice, bob_id, bob) = connected(SessionConfig::default());
    let first = alice.encrypt(&bob_id, b"hello").unwrap();
    bob.decrypt(&alice_id, &first).unwrap();

    let target = alice.encrypt(&bob_id, b"tamper me").unwrap();
    let bits = CiphertextEnvelope::decode(&target).unwrap().ciphertext.len() * 8;

    for bit in 0..bits {
        assert_eq!(
            bob.decrypt(&alice_id, &flip_bit(&target, bit)),
            Err(Error::Authentication),
            "bit {bit} flipped"
        );
    }

    assert_eq!(bob.decrypt(&alice_id, &target).unwrap(), b"tamper me");
    let next = alice.encrypt(&bob_id, b"next").unwrap();
    assert_eq!(bob.decrypt(&alice_id, &next).unwrap(), b"next");
}

#[test]
fn test_tampered_header_rejected() {
    let (alice_id, alice, bob_id, bob) = connected(SessionConfig::default());
    let first = alice.encrypt(&bob_id, b"hello").unwrap();
    bob.decrypt(&alice_id, &first).unwrap();

    let envelope = alice.encrypt(&bob_id, b"counter").unwrap();
    let mut tampered = CiphertextEnvelope::decode(&envelope).unwrap();
    tampered.previous_chain_length += 1;

    assert_eq!(
        bob.decrypt(&alice_id, &tampered.encode()),
        Err(Error::Authentication)
    );
    assert_eq!(bob.decrypt(&alice_id, &envelope).unwrap(), b"counter");
}

#[test]
fn test_evicted_message_key() {
    let config = SessionConfig::default().with_max_skipped_keys(2);
    let (alice_id, alice, bob_id, bob) = connected(config);

    let envelopes: Vec<_> = (0..4u8)
        .map(|i| alice.encrypt(&bob_id, &[i]).unwrap())
        .collect();

    assert_eq!(bob.decrypt(&alice_id, &envelopes[3]).unwrap(), vec![3]);
    assert_eq!(
        bob.decrypt(&alice_id, &envelopes[0]),
        Err(Error::MessageKeyEvicted)
    );
    assert_eq!(bob.decrypt(&alice_id, &envelopes[1]).unwrap(), vec![1]);
    assert_eq!(bob.decrypt(&alice_id, &envelopes[2]).unwrap(), vec![2]);
}

#[test]
fn test_invalid_bundle_signature_rejected() {
    let (_, alice) = manager("alice", SessionConfig::default());
    let (bob_id, bob) = manager("bob", SessionConfig::default());
    let (_, mallory) = manager("mallory", SessionConfig::default());

    let mut bundle = bob
        .export_public_bundle()
        .unwrap()
        .first_pre_key_bundle()
        .unwrap();
    bundle.identity_key = mallory.identity_key();

    assert_eq!(
        alice.process_peer_bundle(&bob_id, bundle),
        Err(Error::InvalidSignature)
    );
    assert!(matches!(
        alice.encrypt(&bob_id, b"hi"),
        Err(Error::SessionEstablishment(_))
    ));
    assert!(!alice.has_session(&bob_id).unwrap());
}

#[test]
fn test_signed_prekey_only_establishment() {
    let (alice_id, alice) = manager("alice", SessionConfig::default());
    let (bob_id, bob) = manager(
        "bob",
        SessionConfig::default().with_initial_one_time_prekeys(0),
    );
    introduce(&alice, &bob_id, &bob);

    let envelope = alice.encrypt(&bob_id, b"no one-time key").unwrap();
    assert_eq!(
        bob.decrypt(&alice_id, &envelope).unwrap(),
        b"no one-time key"
    );

    let reply = bob.encrypt(&alice_id, b"still works").unwrap();
    assert_eq!(alice.decrypt(&bob_id, &reply).unwrap(), b"still works");
}

#[test]
fn test_rotated_keys_are_usable() {
    let (alice_id, alice) = manager("alice", SessionConfig::default());
    let (bob_id, bob) = manager("bob", SessionConfig::default());

    let signed = bob.rotate_signed_pre_key().unwrap();
    let one_time = bob.rotate_pre_key().unwrap();

    let bundle = bob
        .export_public_bundle()
        .unwrap()
        .pre_key_bundle(Some(one_time.id))
        .unwrap();
    assert_eq!(bundle.signed_pre_key, signed);
    alice.process_peer_bundle(&bob_id, bundle).unwrap();

    let envelope = alice.encrypt(&bob_id, b"fresh keys").unwrap();
    assert_eq!(bob.decrypt(&alice_id, &envelope).unwrap(), b"fresh keys");
    assert_eq!(bob.one_time_prekey_count().unwrap(), 1);
}

#[test]
fn test_simultaneous_initiation_converges() {
    let (alice_id, alice) = manager("alice", SessionConfig::default());
    let (bob_id, bob) = manager("bob", SessionConfig::default());
    introduce(&alice, &bob_id, &bob);
    introduce(&bob, &alice_id, &alice);

    let from_alice = alice.encrypt(&bob_id, b"hi bob").unwrap();
    let from_bob = bob.encrypt(&alice_id, b"hi alice").unwrap();

    assert_eq!(alice.decrypt(&bob_id, &from_bob).unwrap(), b"hi alice");
    assert_eq!(bob.decrypt(&alice_id, &from_alice).unwrap(), b"hi bob");

    let envelope = alice.encrypt(&bob_id, b"settled?").unwrap();
    assert_eq!(bob.decrypt(&alice_id, &envelope).unwrap(), b"settled?");
    let envelope = bob.encrypt(&alice_id, b"settled").unwrap();
    assert_eq!(alice.decrypt(&bob_id, &envelope).unwrap(), b"settled");
}

#[test]
fn test_simultaneous_initiation_with_follow_ups_in_flight() {
    let (alice_id, alice) = manager("alice", SessionConfig::default());
    let (bob_id, bob) = manager("bob", SessionConfig::default());
    introduce(&alice, &bob_id, &bob);
    introduce(&bob, &alice_id, &alice);

    let alice_first = alice.encrypt(&bob_id, b"a1").unwrap();
    let alice_second = alice.encrypt(&bob_id, b"a2").unwrap();
    let bob_first = bob.encrypt(&alice_id, b"b1").unwrap();
    let bob_second = bob.encrypt(&alice_id, b"b2").unwrap();

    assert_eq!(bob.decrypt(&alice_id, &alice_first).unwrap(), b"a1");
    assert_eq!(alice.decrypt(&bob_id, &bob_first).unwrap(), b"b1");
    assert_eq!(alice.decrypt(&bob_id, &bob_second).unwrap(), b"b2");
    assert_eq!(bob.decrypt(&alice_id, &alice_second).unwrap(), b"a2");

    for round in 0..3 {
        let text = format!("round {round}");
        let envelope = bob.encrypt(&alice_id, text.as_bytes()).unwrap();
        assert_eq!(alice.decrypt(&bob_id, &envelope).unwrap(), text.as_bytes());
        let envelope = alice.encrypt(&bob_id, text.as_bytes()).unwrap();
        assert_eq!(bob.decrypt(&alice_id, &envelope).unwrap(), text.as_bytes());
    }
}

#[test]
fn test_prekey_message_under_other_identity_is_rejected() {
    let (alice_id, alice, bob_id, bob) = connected(SessionConfig::default());
    let first = alice.encrypt(&bob_id, b"first").unwrap();
    bob.decrypt(&alice_id, &first).unwrap();
    let reply = bob.encrypt(&alice_id, b"reply").unwrap();
    alice.decrypt(&bob_id, &reply).unwrap();

    // A different identity claiming Alice's id, using Bob's published keys.
    let (_, impostor) = manager("alice", SessionConfig::default());
    let bundle = bob
        .export_public_bundle()
        .unwrap()
        .pre_key_bundle(None)
        .unwrap();
    impostor.process_peer_bundle(&bob_id, bundle).unwrap();
    let forged = impostor.encrypt(&bob_id, b"it's me").unwrap();

    assert_eq!(
        bob.decrypt(&alice_id, &forged),
        Err(Error::SessionEstablishment("remote identity changed"))
    );

    let next = alice.encrypt(&bob_id, b"still here").unwrap();
    assert_eq!(bob.decrypt(&alice_id, &next).unwrap(), b"still here");
    let reply = bob.encrypt(&alice_id, b"hello again").unwrap();
    assert_eq!(alice.decrypt(&bob_id, &reply).unwrap(), b"hello again");
}

#[test]
fn test_new_identity_accepted_after_remove_peer() {
    let (alice_id, alice, bob_id, bob) = connected(SessionConfig::default());
    let first = alice.encrypt(&bob_id, b"first").unwrap();
    bob.decrypt(&alice_id, &first).unwrap();

    let (_, reinstalled) = manager("alice", SessionConfig::default());
    let bundle = bob
        .export_public_bundle()
        .unwrap()
        .pre_key_bundle(None)
        .unwrap();
    reinstalled.process_peer_bundle(&bob_id, bundle).unwrap();
    let envelope = reinstalled.encrypt(&bob_id, b"new device").unwrap();
    assert!(bob.decrypt(&alice_id, &envelope).is_err());

    assert!(bob.remove_peer(&alice_id).unwrap());
    assert_eq!(bob.decrypt(&alice_id, &envelope).unwrap(), b"new device");
}

#[test]
fn test_garbage_input() {
    let (alice_id, _, _, bob) = connected(SessionConfig::default());

    assert!(matches!(
        bob.decrypt(&alice_id, "%%%"),
        Err(Error::InvalidEnvelope(_))
    ));
    assert!(matches!(
        bob.decrypt(&alice_id, "AAAA"),
        Err(Error::InvalidEnvelope(_))
    ));
}
