//! XEdDSA signatures over X25519 identity keys.
//!
//! Lets the identity key that takes part in key agreement also sign prekeys, so a
//! bundle carries a single identity key. Follows "The XEdDSA and VXEdDSA Signature
//! Schemes" (Perrin, revision 1).

use crate::error::{Error, Result};
use crate::keys::{PublicKey, SecretKey};
use curve25519_dalek::{
    constants::ED25519_BASEPOINT_TABLE,
    edwards::{CompressedEdwardsY, EdwardsPoint},
    montgomery::MontgomeryPoint,
    scalar::Scalar,
};
use rand_core::CryptoRngCore;
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Signature length: R (32) || s (32)
pub const SIGNATURE_LENGTH: usize = 64;

/// XEdDSA signature bytes
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; SIGNATURE_LENGTH]);

impl Signature {
    #[must_use]
    pub fn from_bytes(bytes: [u8; SIGNATURE_LENGTH]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; SIGNATURE_LENGTH] {
        self.0
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LENGTH] {
        &self.0
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Signature {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for Signature {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes: Vec<u8> = serde::Deserialize::deserialize(deserializer)?;
        let bytes: [u8; SIGNATURE_LENGTH] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("signature must be 64 bytes"))?;
        Ok(Self(bytes))
    }
}

/// Edwards form of an X25519 private key
#[derive(Zeroize, ZeroizeOnDrop)]
struct EdwardsSigner {
    a: Scalar,
    #[zeroize(skip)]
    public: CompressedEdwardsY,
}

impl EdwardsSigner {
    fn from_secret(secret: &SecretKey) -> Result<Self> {
        // Same clamping X25519 applies before scalar multiplication.
        let mut k = *secret.as_bytes();
        k[0] &= 248;
        k[31] &= 127;
        k[31] |= 64;

        let k_scalar = Scalar::from_bytes_mod_order(k);
        k.zeroize();

        // A = kB must have sign bit 0; negate k when it does not.
        let sign_bit = (&k_scalar * ED25519_BASEPOINT_TABLE).compress().as_bytes()[31] >> 7;
        let a = if sign_bit == 1 { -k_scalar } else { k_scalar };

        let public = edwards_public(&secret.public_key()).map_err(|_| Error::Signing)?;
        Ok(Self { a, public })
    }

    fn sign(&self, message: &[u8], random: &[u8; 64]) -> Signature {
        // r = hash1(a || M || Z) mod q
        let mut hasher = Sha512::new();
        hasher.update([0xFE]);
        hasher.update([0xFF; 31]);
        hasher.update(self.a.as_bytes());
        hasher.update(message);
        hasher.update(random);
        let r = Scalar::from_bytes_mod_order_wide(&hasher.finalize().into());

        let r_point = (&r * ED25519_BASEPOINT_TABLE).compress();
        let h = challenge(&r_point, &self.public, message);
        let s = r + h * self.a;

        let mut signature = [0u8; SIGNATURE_LENGTH];
        signature[..32].copy_from_slice(r_point.as_bytes());
        signature[32..].copy_from_slice(s.as_bytes());
        Signature(signature)
    }
}

/// Birational map from a Montgomery u-coordinate to an Edwards point with sign 0.
fn edwards_public(public_key: &PublicKey) -> Result<CompressedEdwardsY> {
    let mut u = *public_key.as_bytes();
    u[31] &= 0x7F;

    let edwards = MontgomeryPoint(u)
        .to_edwards(0)
        .ok_or(Error::InvalidPublicKey)?;

    let mut bytes = *edwards.compress().as_bytes();
    bytes[31] &= 0x7F;
    Ok(CompressedEdwardsY(bytes))
}

/// h = hash(R || A || M) mod q
fn challenge(r_point: &CompressedEdwardsY, public: &CompressedEdwardsY, message: &[u8]) -> Scalar {
    let mut hasher = Sha512::new();
    hasher.update(r_point.as_bytes());
    hasher.update(public.as_bytes());
    hasher.update(message);
    Scalar::from_bytes_mod_order_wide(&hasher.finalize().into())
}

/// Signs `message` with an X25519 secret key.
///
/// # Errors
/// `Error::Signing` if the randomness source fails or the key cannot be mapped to
/// Edwards form.
pub fn sign<R: CryptoRngCore>(rng: &mut R, secret: &SecretKey, message: &[u8]) -> Result<Signature> {
    let mut random = [0u8; 64];
    rng.try_fill_bytes(&mut random)
        .map_err(|_| Error::Signing)?;

    let signer = EdwardsSigner::from_secret(secret)?;
    let signature = signer.sign(message, &random);
    random.zeroize();
    Ok(signature)
}

/// Verifies an XEdDSA signature against an X25519 public key.
pub fn verify(public_key: &PublicKey, message: &[u8], signature: &Signature) -> Result<()> {
    let public = edwards_public(public_key)?;

    let mut r_bytes = [0u8; 32];
    let mut s_bytes = [0u8; 32];
    r_bytes.copy_from_slice(&signature.0[..32]);
    s_bytes.copy_from_slice(&signature.0[32..]);

    let r_compressed = CompressedEdwardsY(r_bytes);
    r_compressed.decompress().ok_or(Error::InvalidSignature)?;

    // s must be below 2^253
    if s_bytes[31] & 0xE0 != 0 {
        return Err(Error::InvalidSignature);
    }
    let s = Scalar::from_bytes_mod_order(s_bytes);

    let a_point = public.decompress().ok_or(Error::InvalidPublicKey)?;
    if !a_point.is_torsion_free() {
        return Err(Error::InvalidPublicKey);
    }

    let h = challenge(&r_compressed, &public, message);

    // R' = sB - hA
    let r_check = EdwardsPoint::vartime_double_scalar_mul_basepoint(&h, &-a_point, &s);

    if r_check.compress().as_bytes()[..].ct_eq(&r_bytes[..]).into() {
        Ok(())
    } else {
        Err(Error::InvalidSignature)
    }
}
