//! Fuzz target for prekey bundle verification
//!
//! Feeds arbitrary identity keys, prekeys and signatures through bundle
//! verification and XEdDSA. Forged input must fail with an error, never panic.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use secure_session::xeddsa::{self, Signature, SIGNATURE_LENGTH};
use secure_session::{PreKeyBundle, PreKeyPublic, PublicKey, SignedPreKeyPublic};

#[derive(Debug, Arbitrary)]
struct Input {
    identity_key: [u8; 32],
    signed_pre_key: [u8; 32],
    signed_pre_key_id: u32,
    signature: [u8; SIGNATURE_LENGTH],
    one_time_pre_key: Option<(u32, [u8; 32])>,
    message: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let identity_key = PublicKey::from_bytes(input.identity_key);
    let signature = Signature::from_bytes(input.signature);

    let bundle = PreKeyBundle {
        identity_key,
        signed_pre_key: SignedPreKeyPublic {
            id: input.signed_pre_key_id,
            public_key: PublicKey::from_bytes(input.signed_pre_key),
            signature,
        },
        one_time_pre_key: input.one_time_pre_key.map(|(id, bytes)| PreKeyPublic {
            id,
            public_key: PublicKey::from_bytes(bytes),
        }),
    };
    let _ = bundle.verify();

    let _ = xeddsa::verify(&identity_key, &input.message, &signature);
});
