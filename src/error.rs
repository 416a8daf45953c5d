//! Error types for session establishment and ratchet operations.

use thiserror::Error;

use crate::key_material::KeyKind;

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while managing sessions
///
/// Every error is returned to the immediate caller. Nothing in this crate retries a
/// cryptographic failure on its own.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Randomness source unavailable while generating key material
    #[error("key generation failed")]
    KeyGeneration,

    /// Producing a signature over a signed prekey failed
    #[error("signing failed")]
    Signing,

    /// Signature on a published bundle does not verify
    #[error("invalid signature")]
    InvalidSignature,

    /// Invalid public key encoding
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Prekey or signed prekey absent, or already consumed
    #[error("{kind} key {id} not found")]
    KeyNotFound { kind: KeyKind, id: u32 },

    /// Session could not be established
    #[error("session establishment failed: {0}")]
    SessionEstablishment(&'static str),

    /// Authentication tag did not verify
    #[error("authentication failed")]
    Authentication,

    /// Message key slot was already consumed
    #[error("duplicate message")]
    DuplicateMessage,

    /// Message key was evicted from the skipped-key cache
    #[error("message key evicted")]
    MessageKeyEvicted,

    /// Envelope skips further ahead than the configured limit
    #[error("too many skipped messages")]
    TooManySkippedMessages,

    /// AEAD encryption failed
    #[error("encryption failed")]
    Encryption,

    /// Ciphertext is structurally unusable
    #[error("decryption failed")]
    Decryption,

    /// HKDF or HMAC rejected its input
    #[error("key derivation failed")]
    KeyDerivation,

    /// Envelope bytes are malformed
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(&'static str),

    /// Peer identifier is empty or too long to be framed
    #[error("invalid peer id")]
    InvalidPeerId,

    /// Envelope names a different sender than the one it was received from
    #[error("envelope sender does not match peer")]
    SenderMismatch,

    /// A thread panicked while holding the manager lock
    #[error("session state lock poisoned")]
    LockPoisoned,
}

impl From<base64::DecodeError> for Error {
    fn from(_: base64::DecodeError) -> Self {
        Error::InvalidEnvelope("invalid base64")
    }
}
