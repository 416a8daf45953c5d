//! End-to-end walk through two session managers
//!
//! Bob publishes prekeys, Alice establishes a session from his bundle, and the two
//! exchange messages including an out-of-order delivery and a rejected replay.

use secure_session::{Error, PeerId, Result, SessionConfig, SessionManager};

fn main() -> Result<()> {
    println!("=== Secure Session Complete Example ===\n");

    println!("1. Creating session managers...");
    let alice_id = PeerId::new("alice")?;
    let bob_id = PeerId::new("bob")?;
    let alice = SessionManager::new(alice_id.clone(), SessionConfig::default())?;
    let bob = SessionManager::new(
        bob_id.clone(),
        SessionConfig::default().with_initial_one_time_prekeys(4),
    )?;
    println!("   ✓ Alice and Bob have identities and prekeys\n");

    println!("2. Bob publishes his prekey bundle...");
    let published = bob.export_public_bundle()?;
    println!("   - Identity key: {:?}", published.identity_key);
    println!("   - Signed prekeys: {}", published.signed_pre_keys.len());
    println!("   - One-time prekeys: {}\n", published.one_time_pre_keys.len());

    println!("3. Alice receives one bundle from the directory...");
    let bundle = published.first_pre_key_bundle()?;
    alice.process_peer_bundle(&bob_id, bundle)?;
    println!("   ✓ Signature verified\n");

    println!("4. Alice sends the first message...");
    let envelope = alice.encrypt(&bob_id, b"Hello Bob!")?;
    println!("   - Envelope: {} base64 characters", envelope.len());
    let plaintext = bob.decrypt(&alice_id, &envelope)?;
    println!("   ✓ Bob read: {}", String::from_utf8_lossy(&plaintext));
    println!(
        "   - Bob's remaining one-time prekeys: {}\n",
        bob.one_time_prekey_count()?
    );

    println!("5. Bob replies...");
    let reply = bob.encrypt(&alice_id, b"Hi Alice!")?;
    let plaintext = alice.decrypt(&bob_id, &reply)?;
    println!("   ✓ Alice read: {}\n", String::from_utf8_lossy(&plaintext));

    println!("6. Out-of-order delivery...");
    let first = alice.encrypt(&bob_id, b"first")?;
    let second = alice.encrypt(&bob_id, b"second")?;
    let third = alice.encrypt(&bob_id, b"third")?;
    for envelope in [&third, &first, &second] {
        let plaintext = bob.decrypt(&alice_id, envelope)?;
        println!("   ✓ Bob read: {}", String::from_utf8_lossy(&plaintext));
    }
    println!();

    println!("7. Replaying an envelope...");
    match bob.decrypt(&alice_id, &first) {
        Err(Error::DuplicateMessage) => println!("   ✓ Replay rejected\n"),
        other => println!("   ✗ Unexpected result: {other:?}\n"),
    }

    println!("8. Bob rotates his prekeys...");
    let signed = bob.rotate_signed_pre_key()?;
    let one_time = bob.rotate_pre_key()?;
    println!("   - New signed prekey id: {}", signed.id);
    println!("   - New one-time prekey id: {}\n", one_time.id);

    println!("=== Session established and verified ===");
    Ok(())
}
