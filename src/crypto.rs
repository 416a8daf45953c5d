//! Cryptographic primitives for key agreement and ratcheting.
//!
//! Provides the X3DH key derivation, the root and chain KDFs of the Double Ratchet,
//! AEAD encryption/decryption and nonce construction. All intermediate buffers are
//! zeroized before returning.

use crate::error::{Error, Result};
use crate::keys::DhOutput;

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

const AGREEMENT_INFO: &[u8] = b"SecureSession_X3DH_v1";
const ROOT_INFO: &[u8] = b"SecureSession_Ratchet_Root";

const MESSAGE_KEY_SEED: u8 = 0x01;
const CHAIN_KEY_SEED: u8 = 0x02;

pub const KEY_SIZE_32: usize = 32;
pub const KEY_SIZE_64: usize = 64;
pub const TAG_SIZE: usize = 16;
pub const NONCE_SIZE: usize = 12;

type HmacSha256 = Hmac<Sha256>;

/// 256-bit symmetric key with automatic zeroization on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
#[cfg_attr(test, derive(PartialEq, Eq))]
pub struct SymmetricKey([u8; KEY_SIZE_32]);

impl SymmetricKey {
    /// Creates a symmetric key from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_SIZE_32]) -> Self {
        Self(bytes)
    }

    /// Returns the key as a byte array reference.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE_32] {
        &self.0
    }

    fn split(output: &[u8; KEY_SIZE_64]) -> (Self, Self) {
        let mut first = [0u8; KEY_SIZE_32];
        let mut second = [0u8; KEY_SIZE_32];
        first.copy_from_slice(&output[..KEY_SIZE_32]);
        second.copy_from_slice(&output[KEY_SIZE_32..]);
        (Self(first), Self(second))
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SymmetricKey([REDACTED])")
    }
}

/// X3DH key derivation.
///
/// Computes `SK = HKDF(F || DH1 || DH2 || DH3 || [DH4])` where:
/// - `F = 0xFF^32` (domain separation constant for X25519)
/// - `salt = 0x00^32`
/// - output length is 32 bytes
///
/// The optional fourth DH output is present when a one-time prekey was used.
pub fn kdf_agreement(
    dh1: &DhOutput,
    dh2: &DhOutput,
    dh3: &DhOutput,
    dh4: Option<&DhOutput>,
) -> Result<SymmetricKey> {
    const F: [u8; KEY_SIZE_32] = [0xFF; KEY_SIZE_32];

    let mut ikm = [0u8; KEY_SIZE_32 * 5];
    let mut len = 0;

    for part in [&F, dh1.as_bytes(), dh2.as_bytes(), dh3.as_bytes()]
        .into_iter()
        .chain(dh4.map(DhOutput::as_bytes))
    {
        ikm[len..len + KEY_SIZE_32].copy_from_slice(part);
        len += KEY_SIZE_32;
    }

    let salt = [0u8; KEY_SIZE_32];
    let hkdf = Hkdf::<Sha256>::new(Some(&salt), &ikm[..len]);

    let mut output = [0u8; KEY_SIZE_32];
    let expanded = hkdf.expand(AGREEMENT_INFO, &mut output);
    ikm.zeroize();
    expanded.map_err(|_| Error::KeyDerivation)?;

    Ok(SymmetricKey(output))
}

/// Root KDF for the DH ratchet step.
///
/// Computes `(RK', CK) = HKDF(salt = RK, ikm = DH_out)`, returning the new root key
/// and the first chain key of the new chain.
pub fn kdf_root(
    root_key: &SymmetricKey,
    dh_output: &DhOutput,
) -> Result<(SymmetricKey, SymmetricKey)> {
    let hkdf = Hkdf::<Sha256>::new(Some(root_key.as_bytes()), dh_output.as_bytes());

    let mut output = [0u8; KEY_SIZE_64];
    hkdf.expand(ROOT_INFO, &mut output)
        .map_err(|_| Error::KeyDerivation)?;

    let keys = SymmetricKey::split(&output);
    output.zeroize();
    Ok(keys)
}

/// Chain KDF for the symmetric ratchet step.
///
/// Computes `(CK', MK) = KDF_CK(CK)` where:
/// - `MK = HMAC(CK, 0x01)` is the message key
/// - `CK' = HMAC(CK, 0x02)` is the next chain key
///
/// HMAC is one-way, so holding `CK'` reveals nothing about `CK` or `MK`.
pub fn kdf_chain(chain_key: &SymmetricKey) -> Result<(SymmetricKey, SymmetricKey)> {
    let message_key = hmac_seed(chain_key, MESSAGE_KEY_SEED)?;
    let next_chain_key = hmac_seed(chain_key, CHAIN_KEY_SEED)?;
    Ok((next_chain_key, message_key))
}

fn hmac_seed(key: &SymmetricKey, seed: u8) -> Result<SymmetricKey> {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes()).map_err(|_| Error::KeyDerivation)?;
    mac.update(&[seed]);
    Ok(SymmetricKey(mac.finalize().into_bytes().into()))
}

/// Encrypts a message using ChaCha20-Poly1305.
///
/// Returns ciphertext with the 16-byte authentication tag appended. Associated data
/// is authenticated but not encrypted.
pub fn encrypt(
    key: &SymmetricKey,
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
    associated_data: &[u8],
) -> Result<Vec<u8>> {
    use chacha20poly1305::{
        aead::{Aead, Payload},
        ChaCha20Poly1305, Key, KeyInit, Nonce,
    };

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let payload = Payload {
        msg: plaintext,
        aad: associated_data,
    };

    cipher
        .encrypt(Nonce::from_slice(nonce), payload)
        .map_err(|_| Error::Encryption)
}

/// Decrypts a message using ChaCha20-Poly1305.
///
/// The tag is verified in constant time before any plaintext is released.
///
/// # Errors
/// - `Error::Decryption` if the input is too short to hold a tag
/// - `Error::Authentication` on a wrong key, corrupted data or mismatched AAD
pub fn decrypt(
    key: &SymmetricKey,
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
    associated_data: &[u8],
) -> Result<Vec<u8>> {
    use chacha20poly1305::{
        aead::{Aead, Payload},
        ChaCha20Poly1305, Key, KeyInit, Nonce,
    };

    if ciphertext.len() < TAG_SIZE {
        return Err(Error::Decryption);
    }

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let payload = Payload {
        msg: ciphertext,
        aad: associated_data,
    };

    cipher
        .decrypt(Nonce::from_slice(nonce), payload)
        .map_err(|_| Error::Authentication)
}

/// Builds the nonce from the chain counter and the chain's ratchet key.
///
/// Format: `counter (4 bytes, LE) || ratchet_key[0..8]`
///
/// Every message key is used exactly once, so the nonce only needs to be unique per
/// key; binding it to the chain keeps it unique across the whole session as well.
#[must_use]
pub fn generate_nonce(counter: u32, ratchet_key: &[u8; KEY_SIZE_32]) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..4].copy_from_slice(&counter.to_le_bytes());
    nonce[4..].copy_from_slice(&ratchet_key[..8]);
    nonce
}
