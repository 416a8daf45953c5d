//! Published prekey bundles.
//!
//! [`PublicBundle`] is what a local identity exports for a directory service.
//! [`PreKeyBundle`] is the per-establishment view a directory hands to an initiator:
//! one signed prekey plus at most one one-time prekey.

use crate::error::{Error, Result};
use crate::key_material::{KeyKind, PreKeyPublic, SignedPreKeyPublic};
use crate::keys::PublicKey;

/// Keys an initiator needs to establish a session with a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PreKeyBundle {
    /// Long-term identity key of the bundle owner
    pub identity_key: PublicKey,

    /// Signed prekey, with its id and signature by `identity_key`
    pub signed_pre_key: SignedPreKeyPublic,

    /// One-time prekey, if the directory still had one. Without it the session is
    /// established from the signed prekey only.
    pub one_time_pre_key: Option<PreKeyPublic>,
}

impl PreKeyBundle {
    /// Checks the signed prekey signature against the bundle's identity key.
    ///
    /// # Errors
    /// `Error::InvalidSignature` if the signature does not verify.
    pub fn verify(&self) -> Result<()> {
        self.signed_pre_key.verify(&self.identity_key)
    }
}

/// Everything a local identity publishes to a directory
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PublicBundle {
    pub identity_key: PublicKey,
    pub signed_pre_keys: Vec<SignedPreKeyPublic>,
    pub one_time_pre_keys: Vec<PreKeyPublic>,
}

impl PublicBundle {
    /// Builds a [`PreKeyBundle`] from the newest signed prekey and the one-time prekey
    /// with the given id, or from the signed prekey alone when `one_time_id` is `None`.
    ///
    /// # Errors
    /// - `Error::SessionEstablishment` if no signed prekey is published
    /// - `Error::KeyNotFound` if `one_time_id` is not part of the bundle
    pub fn pre_key_bundle(&self, one_time_id: Option<u32>) -> Result<PreKeyBundle> {
        let signed_pre_key = self
            .signed_pre_keys
            .iter()
            .max_by_key(|key| key.id)
            .copied()
            .ok_or(Error::SessionEstablishment("bundle has no signed prekey"))?;

        let one_time_pre_key = match one_time_id {
            Some(id) => Some(
                self.one_time_pre_keys
                    .iter()
                    .find(|key| key.id == id)
                    .copied()
                    .ok_or(Error::KeyNotFound {
                        kind: KeyKind::OneTime,
                        id,
                    })?,
            ),
            None => None,
        };

        Ok(PreKeyBundle {
            identity_key: self.identity_key,
            signed_pre_key,
            one_time_pre_key,
        })
    }

    /// Bundle using the lowest-numbered one-time prekey, if any remain.
    pub fn first_pre_key_bundle(&self) -> Result<PreKeyBundle> {
        let first = self.one_time_pre_keys.iter().map(|key| key.id).min();
        self.pre_key_bundle(first)
    }
}
