//! Generation and representation of identity keys, one-time prekeys and signed
//! prekeys.
//!
//! Key material forms a closed set of kinds ([`KeyKind`]). Prekey records carry their
//! secret half and never leave the local stores; the `*Public` counterparts are what
//! gets published to a directory.

use crate::error::{Error, Result};
use crate::keys::{IdentityKeyPair, PublicKey, SecretKey};
use crate::xeddsa::{self, Signature};
use rand_core::CryptoRngCore;
use tracing::trace;

/// Kind of key material
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum KeyKind {
    Identity,
    OneTime,
    Signed,
}

impl std::fmt::Display for KeyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            KeyKind::Identity => "identity",
            KeyKind::OneTime => "one-time prekey",
            KeyKind::Signed => "signed prekey",
        })
    }
}

/// Common view over stored prekey records.
pub trait KeyRecord {
    /// Which kind of key this record holds
    const KIND: KeyKind;

    fn id(&self) -> u32;

    fn public_key(&self) -> PublicKey;
}

/// Single-use prekey
#[derive(Clone, Debug)]
pub struct PreKeyRecord {
    id: u32,
    secret: SecretKey,
}

impl PreKeyRecord {
    #[must_use]
    pub fn secret_key(&self) -> &SecretKey {
        &self.secret
    }

    /// Public half, suitable for publishing
    #[must_use]
    pub fn to_public(&self) -> PreKeyPublic {
        PreKeyPublic {
            id: self.id,
            public_key: self.secret.public_key(),
        }
    }
}

impl KeyRecord for PreKeyRecord {
    const KIND: KeyKind = KeyKind::OneTime;

    fn id(&self) -> u32 {
        self.id
    }

    fn public_key(&self) -> PublicKey {
        self.secret.public_key()
    }
}

/// Reusable prekey signed by the identity key
#[derive(Clone, Debug)]
pub struct SignedPreKeyRecord {
    id: u32,
    secret: SecretKey,
    signature: Signature,
}

impl SignedPreKeyRecord {
    #[must_use]
    pub fn secret_key(&self) -> &SecretKey {
        &self.secret
    }

    #[must_use]
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    #[must_use]
    pub fn to_public(&self) -> SignedPreKeyPublic {
        SignedPreKeyPublic {
            id: self.id,
            public_key: self.secret.public_key(),
            signature: self.signature,
        }
    }
}

impl KeyRecord for SignedPreKeyRecord {
    const KIND: KeyKind = KeyKind::Signed;

    fn id(&self) -> u32 {
        self.id
    }

    fn public_key(&self) -> PublicKey {
        self.secret.public_key()
    }
}

/// Published form of a one-time prekey
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PreKeyPublic {
    pub id: u32,
    pub public_key: PublicKey,
}

/// Published form of a signed prekey
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SignedPreKeyPublic {
    pub id: u32,
    pub public_key: PublicKey,
    pub signature: Signature,
}

impl SignedPreKeyPublic {
    /// Checks the signature against the publishing identity.
    pub fn verify(&self, identity_key: &PublicKey) -> Result<()> {
        verify_signed_prekey(identity_key, &self.public_key, &self.signature)
    }
}

/// Message covered by a signed prekey signature: `IK || SPK`.
///
/// Binding the identity key into the message means neither half of a bundle can be
/// swapped without invalidating the signature.
fn signed_prekey_message(identity_key: &PublicKey, prekey: &PublicKey) -> [u8; 64] {
    let mut message = [0u8; 64];
    message[..32].copy_from_slice(identity_key.as_bytes());
    message[32..].copy_from_slice(prekey.as_bytes());
    message
}

pub(crate) fn verify_signed_prekey(
    identity_key: &PublicKey,
    prekey: &PublicKey,
    signature: &Signature,
) -> Result<()> {
    xeddsa::verify(
        identity_key,
        &signed_prekey_message(identity_key, prekey),
        signature,
    )
    .map_err(|_| Error::InvalidSignature)
}

/// Generates a new long-term identity.
///
/// # Errors
/// `Error::KeyGeneration` if the randomness source is unavailable.
pub fn generate_identity<R: CryptoRngCore>(rng: &mut R) -> Result<IdentityKeyPair> {
    IdentityKeyPair::generate(rng)
}

/// Generates a one-time prekey with the caller-allocated `id`.
pub fn generate_pre_key<R: CryptoRngCore>(rng: &mut R, id: u32) -> Result<PreKeyRecord> {
    let secret = SecretKey::generate(rng)?;
    trace!(target: "secure_session::key_material", id, "generated one-time prekey");
    Ok(PreKeyRecord { id, secret })
}

/// Generates a signed prekey and signs it with `identity`.
///
/// # Errors
/// - `Error::KeyGeneration` if the key pair cannot be generated
/// - `Error::Signing` if producing the signature fails
pub fn generate_signed_pre_key<R: CryptoRngCore>(
    rng: &mut R,
    identity: &IdentityKeyPair,
    id: u32,
) -> Result<SignedPreKeyRecord> {
    let secret = SecretKey::generate(rng)?;
    let message = signed_prekey_message(identity.public_key(), &secret.public_key());
    let signature = xeddsa::sign(rng, identity.secret_key(), &message)?;

    trace!(target: "secure_session::key_material", id, "generated signed prekey");
    Ok(SignedPreKeyRecord {
        id,
        secret,
        signature,
    })
}
