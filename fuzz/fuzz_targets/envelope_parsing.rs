//! Fuzz target for envelope decoding
//!
//! Arbitrary bytes and arbitrary base64 text must be rejected with
//! `Error::InvalidEnvelope` or parse into an envelope that re-encodes to the
//! same bytes. Never panics.

#![no_main]

use libfuzzer_sys::fuzz_target;
use secure_session::{CiphertextEnvelope, Error};

fuzz_target!(|data: &[u8]| {
    match CiphertextEnvelope::from_bytes(data) {
        Ok(envelope) => {
            assert_eq!(envelope.to_bytes(), data);
            let header = envelope.header_bytes();
            assert!(header.len() <= data.len());
        }
        Err(err) => assert!(matches!(err, Error::InvalidEnvelope(_))),
    }

    if let Ok(text) = std::str::from_utf8(data) {
        if let Err(err) = CiphertextEnvelope::decode(text) {
            assert!(matches!(err, Error::InvalidEnvelope(_)));
        }
    }
});
