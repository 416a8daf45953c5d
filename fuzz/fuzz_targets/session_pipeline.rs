//! Fuzz target for a two-party session driven by arbitrary operations
//!
//! # Invariants
//!
//! - Every envelope delivered unmodified for the first time decrypts to its plaintext
//! - Replays, corruptions and reorderings fail with an error, never a panic
//! - A failed decrypt leaves both sessions usable

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use secure_session::{CiphertextEnvelope, PeerId, SessionConfig, SessionManager};

#[derive(Debug, Arbitrary)]
enum Op {
    Send { from_alice: bool, plaintext: Vec<u8> },
    Deliver { index: u8 },
    Corrupt { index: u8, bit: u16 },
    Replay { index: u8 },
    Raw { to_alice: bool, text: String },
}

struct InFlight {
    to_alice: bool,
    plaintext: Vec<u8>,
    envelope: String,
    delivered: bool,
}

fuzz_target!(|ops: Vec<Op>| {
    let alice_id = PeerId::new("alice").unwrap();
    let bob_id = PeerId::new("bob").unwrap();
    let alice = SessionManager::new(alice_id.clone(), SessionConfig::default()).unwrap();
    let bob = SessionManager::new(bob_id.clone(), SessionConfig::default()).unwrap();
    let bundle = bob
        .export_public_bundle()
        .unwrap()
        .first_pre_key_bundle()
        .unwrap();
    alice.process_peer_bundle(&bob_id, bundle).unwrap();

    let mut in_flight: Vec<InFlight> = Vec::new();

    for op in ops.into_iter().take(64) {
        match op {
            Op::Send {
                from_alice,
                plaintext,
            } => {
                let sent = if from_alice {
                    alice.encrypt(&bob_id, &plaintext)
                } else {
                    bob.encrypt(&alice_id, &plaintext)
                };
                // Bob cannot speak before hearing from Alice.
                if let Ok(envelope) = sent {
                    in_flight.push(InFlight {
                        to_alice: !from_alice,
                        plaintext,
                        envelope,
                        delivered: false,
                    });
                }
            }
            Op::Deliver { index } => {
                let Some(message) = pick(&mut in_flight, index) else {
                    continue;
                };
                let result = if message.to_alice {
                    alice.decrypt(&bob_id, &message.envelope)
                } else {
                    bob.decrypt(&alice_id, &message.envelope)
                };
                if let Ok(plaintext) = result {
                    assert!(!message.delivered, "replayed envelope decrypted twice");
                    assert_eq!(plaintext, message.plaintext);
                    message.delivered = true;
                }
            }
            Op::Corrupt { index, bit } => {
                let Some(message) = pick(&mut in_flight, index) else {
                    continue;
                };
                let Ok(mut envelope) = CiphertextEnvelope::decode(&message.envelope) else {
                    continue;
                };
                let bits = envelope.ciphertext.len() * 8;
                let bit = usize::from(bit) % bits;
                envelope.ciphertext[bit / 8] ^= 1 << (bit % 8);
                let result = if message.to_alice {
                    alice.decrypt(&bob_id, &envelope.encode())
                } else {
                    bob.decrypt(&alice_id, &envelope.encode())
                };
                assert!(result.is_err(), "corrupted envelope accepted");
            }
            Op::Replay { index } => {
                let Some(message) = pick(&mut in_flight, index) else {
                    continue;
                };
                if message.delivered {
                    let result = if message.to_alice {
                        alice.decrypt(&bob_id, &message.envelope)
                    } else {
                        bob.decrypt(&alice_id, &message.envelope)
                    };
                    assert!(result.is_err(), "replay accepted");
                }
            }
            Op::Raw { to_alice, text } => {
                let result = if to_alice {
                    alice.decrypt(&bob_id, &text)
                } else {
                    bob.decrypt(&alice_id, &text)
                };
                let _ = result;
            }
        }
    }
});

fn pick(in_flight: &mut [InFlight], index: u8) -> Option<&mut InFlight> {
    if in_flight.is_empty() {
        return None;
    }
    let len = in_flight.len();
    in_flight.get_mut(usize::from(index) % len)
}
