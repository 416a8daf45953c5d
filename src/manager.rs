//! Public entry point: owns the identity, the key stores and the session store.
//!
//! All mutable state sits behind one [`Mutex`], so concurrent encrypt, decrypt and
//! rotate calls are serialized and a one-time prekey can never be consumed twice nor a
//! chain forked. The identity key pair is immutable and shared outside the lock.

use crate::bundle::{PreKeyBundle, PublicBundle};
use crate::config::SessionConfig;
use crate::envelope::{CiphertextEnvelope, InitialMessage};
use crate::error::{Error, Result};
use crate::key_material::{
    generate_identity, generate_pre_key, generate_signed_pre_key, KeyRecord, PreKeyPublic,
    PreKeyRecord, SignedPreKeyPublic, SignedPreKeyRecord,
};
use crate::key_store::KeyStore;
use crate::keys::{IdentityKeyPair, PublicKey};
use crate::ratchet::{RatchetEngine, RatchetSession};
use crate::session_store::{PeerId, SessionEntry, SessionRecord, SessionStore};
use rand_core::OsRng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Signed prekeys kept after a rotation: the new one plus one grace key for
/// initiators still holding the previous bundle.
const RETAINED_SIGNED_PRE_KEYS: usize = 2;

/// State guarded by the manager lock
#[derive(Debug)]
struct Inner {
    pre_keys: KeyStore<PreKeyRecord>,
    signed_pre_keys: KeyStore<SignedPreKeyRecord>,
    sessions: SessionStore,
    /// Peer bundles handed over by the directory, keyed by peer
    directory: HashMap<PeerId, PreKeyBundle>,
}

/// Per-peer secure session manager.
///
/// # Example
/// ```
/// use secure_session::{PeerId, SessionConfig, SessionManager};
///
/// let alice_id = PeerId::new("alice")?;
/// let bob_id = PeerId::new("bob")?;
/// let alice = SessionManager::new(alice_id.clone(), SessionConfig::default())?;
/// let bob = SessionManager::new(bob_id.clone(), SessionConfig::default())?;
///
/// let bundle = bob.export_public_bundle()?.first_pre_key_bundle()?;
/// alice.process_peer_bundle(&bob_id, bundle)?;
///
/// let envelope = alice.encrypt(&bob_id, b"hello")?;
/// assert_eq!(bob.decrypt(&alice_id, &envelope)?, b"hello");
/// # Ok::<(), secure_session::Error>(())
/// ```
#[derive(Debug)]
pub struct SessionManager {
    local_id: PeerId,
    engine: RatchetEngine,
    inner: Mutex<Inner>,
}

impl SessionManager {
    /// Creates a fresh identity together with one signed prekey and
    /// `config.initial_one_time_prekeys` one-time prekeys.
    ///
    /// # Errors
    /// `Error::KeyGeneration` or `Error::Signing` if key material cannot be produced.
    pub fn new(local_id: PeerId, config: SessionConfig) -> Result<Self> {
        let identity = generate_identity(&mut OsRng)?;
        Self::with_identity(local_id, identity, config)
    }

    /// Builds a manager around an existing identity key pair.
    pub fn with_identity(
        local_id: PeerId,
        identity: IdentityKeyPair,
        config: SessionConfig,
    ) -> Result<Self> {
        let mut signed_pre_keys = KeyStore::new();
        let id = signed_pre_keys.next_id()?;
        signed_pre_keys.put(id, generate_signed_pre_key(&mut OsRng, &identity, id)?);

        let mut pre_keys = KeyStore::new();
        for _ in 0..config.initial_one_time_prekeys {
            let id = pre_keys.next_id()?;
            pre_keys.put(id, generate_pre_key(&mut OsRng, id)?);
        }

        info!(
            target: "secure_session::manager",
            local_id = %local_id,
            one_time_prekeys = pre_keys.len(),
            "initialized identity"
        );

        Ok(Self {
            local_id,
            engine: RatchetEngine::new(Arc::new(identity), config),
            inner: Mutex::new(Inner {
                pre_keys,
                signed_pre_keys,
                sessions: SessionStore::new(),
                directory: HashMap::new(),
            }),
        })
    }

    #[must_use]
    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Public identity key. Read without taking the lock.
    #[must_use]
    pub fn identity_key(&self) -> PublicKey {
        *self.engine.identity().public_key()
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        self.engine.config()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| Error::LockPoisoned)
    }

    /// Verifies a peer's bundle and remembers it for establishing a session on the
    /// next [`SessionManager::encrypt`] to that peer.
    ///
    /// # Errors
    /// `Error::InvalidSignature` if the signed prekey does not verify; nothing is
    /// recorded in that case.
    pub fn process_peer_bundle(&self, peer: &PeerId, bundle: PreKeyBundle) -> Result<()> {
        if let Err(err) = bundle.verify() {
            warn!(target: "secure_session::manager", peer = %peer, "rejected peer bundle");
            return Err(err);
        }

        self.lock()?.directory.insert(peer.clone(), bundle);
        debug!(target: "secure_session::manager", peer = %peer, "stored peer bundle");
        Ok(())
    }

    /// Encrypts `plaintext` for `peer` and returns the base64 envelope.
    ///
    /// Establishes a session from the peer's processed bundle if none exists yet.
    ///
    /// # Errors
    /// - `Error::SessionEstablishment` if there is no session and no bundle for `peer`
    /// - `Error::Encryption` on cipher failure
    pub fn encrypt(&self, peer: &PeerId, plaintext: &[u8]) -> Result<String> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;

        let envelope = match inner.sessions.get_or_create(peer) {
            SessionEntry::Occupied(record) => {
                self.engine
                    .ratchet_encrypt(record.current_mut(), &self.local_id, plaintext)?
            }
            SessionEntry::Vacant(vacant) => {
                let bundle = inner
                    .directory
                    .get_mut(peer)
                    .ok_or(Error::SessionEstablishment("no bundle for peer"))?;

                let mut session = self.engine.establish_as_initiator(&mut OsRng, bundle)?;
                let envelope = self
                    .engine
                    .ratchet_encrypt(&mut session, &self.local_id, plaintext)?;

                // A one-time prekey is good for a single establishment.
                bundle.one_time_pre_key = None;
                vacant.establish(session);
                envelope
            }
        };

        Ok(envelope.encode())
    }

    /// Decrypts a base64 envelope received from `peer`.
    ///
    /// Establishes a session as responder when the envelope carries a prekey message
    /// for a key agreement we do not hold yet. The referenced one-time prekey is
    /// consumed only once the message has decrypted. A prekey message under a
    /// different identity key than the existing session's is rejected without
    /// touching any state; call [`SessionManager::remove_peer`] first to accept a
    /// peer's new identity.
    ///
    /// # Errors
    /// - `Error::InvalidEnvelope` if the envelope cannot be parsed
    /// - `Error::SenderMismatch` if the envelope was produced by someone else
    /// - `Error::KeyNotFound` if the referenced prekey is absent or already consumed
    /// - `Error::SessionEstablishment` if there is no session and no prekey message,
    ///   or if a prekey message carries a different identity than the session
    /// - any ratchet error from [`RatchetEngine::ratchet_decrypt`]
    pub fn decrypt(&self, peer: &PeerId, encoded: &str) -> Result<Vec<u8>> {
        let envelope = CiphertextEnvelope::decode(encoded)?;
        if envelope.sender_id != *peer {
            warn!(
                target: "secure_session::manager",
                peer = %peer,
                sender = %envelope.sender_id,
                "envelope sender does not match peer"
            );
            return Err(Error::SenderMismatch);
        }

        let mut guard = self.lock()?;
        let inner = &mut *guard;

        let max_previous = self.engine.config().max_previous_sessions;
        match inner.sessions.get_or_create(peer) {
            SessionEntry::Occupied(record) => {
                let Some(initial) = &envelope.initial_message else {
                    return self.decrypt_with_record(peer, record, &envelope);
                };
                if initial.identity_key != *record.current().remote_identity() {
                    warn!(
                        target: "secure_session::manager",
                        peer = %peer,
                        "prekey message under a different identity key"
                    );
                    return Err(Error::SessionEstablishment("remote identity changed"));
                }
                if let Some(session) = record.find_mut(&initial.base_key) {
                    return self.engine.ratchet_decrypt(&mut OsRng, session, &envelope);
                }

                let (session, plaintext) = self.respond(
                    peer,
                    &envelope,
                    initial,
                    &mut inner.pre_keys,
                    &inner.signed_pre_keys,
                )?;
                if record.current().should_yield_to(initial) {
                    debug!(target: "secure_session::manager", peer = %peer, "replaced session");
                    record.promote(session, max_previous);
                } else {
                    debug!(target: "secure_session::manager", peer = %peer, "kept current session");
                    record.archive(session, max_previous);
                }
                Ok(plaintext)
            }
            SessionEntry::Vacant(vacant) => {
                let initial = envelope
                    .initial_message
                    .as_ref()
                    .ok_or(Error::SessionEstablishment("no session and no prekey message"))?;
                let (session, plaintext) = self.respond(
                    peer,
                    &envelope,
                    initial,
                    &mut inner.pre_keys,
                    &inner.signed_pre_keys,
                )?;
                vacant.establish(session);
                Ok(plaintext)
            }
        }
    }

    /// Decrypts a follow-up message with the current session, falling back to the
    /// previous ones for messages still in flight on a superseded session.
    fn decrypt_with_record(
        &self,
        peer: &PeerId,
        record: &mut SessionRecord,
        envelope: &CiphertextEnvelope,
    ) -> Result<Vec<u8>> {
        let err = match self
            .engine
            .ratchet_decrypt(&mut OsRng, record.current_mut(), envelope)
        {
            Ok(plaintext) => return Ok(plaintext),
            Err(err) => err,
        };

        for session in record.previous_mut() {
            if let Ok(plaintext) = self.engine.ratchet_decrypt(&mut OsRng, session, envelope) {
                debug!(
                    target: "secure_session::manager",
                    peer = %peer,
                    "decrypted with previous session"
                );
                return Ok(plaintext);
            }
        }
        Err(err)
    }

    /// Establishes a responder session and decrypts the first message with it.
    /// Nothing is consumed unless both succeed.
    fn respond(
        &self,
        peer: &PeerId,
        envelope: &CiphertextEnvelope,
        initial: &InitialMessage,
        pre_keys: &mut KeyStore<PreKeyRecord>,
        signed_pre_keys: &KeyStore<SignedPreKeyRecord>,
    ) -> Result<(RatchetSession, Vec<u8>)> {
        let mut session =
            self.engine
                .establish_as_responder(peer, initial, pre_keys, signed_pre_keys)?;
        let plaintext = self
            .engine
            .ratchet_decrypt(&mut OsRng, &mut session, envelope)?;

        if let Some(id) = initial.one_time_pre_key_id {
            pre_keys.take(id)?;
            debug!(target: "secure_session::manager", id, "consumed one-time prekey");
        }
        Ok((session, plaintext))
    }

    /// Generates a one-time prekey under the next free id and stores it.
    ///
    /// Returns the public part for publishing to a directory.
    pub fn rotate_pre_key(&self) -> Result<PreKeyPublic> {
        let mut inner = self.lock()?;
        let id = inner.pre_keys.next_id()?;
        let record = generate_pre_key(&mut OsRng, id)?;
        let public = record.to_public();
        inner.pre_keys.put(id, record);

        debug!(target: "secure_session::manager", id, "rotated one-time prekey");
        Ok(public)
    }

    /// Generates and signs a new signed prekey.
    ///
    /// The signed prekey it replaces stays available for initiators that fetched the
    /// previous bundle; anything older is deleted, so prekey messages built on it fail
    /// with `Error::KeyNotFound`.
    pub fn rotate_signed_pre_key(&self) -> Result<SignedPreKeyPublic> {
        let mut inner = self.lock()?;
        let id = inner.signed_pre_keys.next_id()?;
        let record = generate_signed_pre_key(&mut OsRng, self.engine.identity(), id)?;
        let public = record.to_public();
        inner.signed_pre_keys.put(id, record);
        let retired = inner.signed_pre_keys.retain_latest(RETAINED_SIGNED_PRE_KEYS);

        debug!(target: "secure_session::manager", id, ?retired, "rotated signed prekey");
        Ok(public)
    }

    /// Public halves of every live prekey, for a directory service.
    pub fn export_public_bundle(&self) -> Result<PublicBundle> {
        let inner = self.lock()?;
        Ok(PublicBundle {
            identity_key: self.identity_key(),
            signed_pre_keys: inner
                .signed_pre_keys
                .records()
                .map(SignedPreKeyRecord::to_public)
                .collect(),
            one_time_pre_keys: inner
                .pre_keys
                .records()
                .map(PreKeyRecord::to_public)
                .collect(),
        })
    }

    /// Drops the sessions with `peer`. Returns whether one existed.
    ///
    /// The peer's cached bundle is kept, so the next [`SessionManager::encrypt`]
    /// establishes a fresh session. Use [`SessionManager::remove_peer`] to forget
    /// the peer entirely.
    pub fn reset_session(&self, peer: &PeerId) -> Result<bool> {
        let removed = self.lock()?.sessions.remove(peer);
        if removed {
            info!(target: "secure_session::manager", peer = %peer, "reset session");
        }
        Ok(removed)
    }

    /// Ends the relationship with `peer`: drops its sessions and its cached bundle.
    /// Returns whether anything was held for the peer.
    pub fn remove_peer(&self, peer: &PeerId) -> Result<bool> {
        let mut inner = self.lock()?;
        let had_session = inner.sessions.remove(peer);
        let had_bundle = inner.directory.remove(peer).is_some();

        if had_session || had_bundle {
            info!(target: "secure_session::manager", peer = %peer, "removed peer");
        }
        Ok(had_session || had_bundle)
    }

    pub fn has_session(&self, peer: &PeerId) -> Result<bool> {
        Ok(self.lock()?.sessions.has_session(peer))
    }

    /// Number of one-time prekeys not yet consumed
    pub fn one_time_prekey_count(&self) -> Result<usize> {
        Ok(self.lock()?.pre_keys.len())
    }

    /// Id of the newest signed prekey
    pub fn current_signed_pre_key_id(&self) -> Result<Option<u32>> {
        Ok(self.lock()?.signed_pre_keys.latest().map(KeyRecord::id))
    }
}
