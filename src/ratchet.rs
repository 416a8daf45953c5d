//! Session establishment and the Double Ratchet state machine.
//!
//! ## Establishment
//!
//! The initiator runs X3DH against a peer's [`PreKeyBundle`]:
//!
//! - DH1 = `DH(IK_A, SPK_B)`
//! - DH2 = `DH(EK_A, IK_B)`
//! - DH3 = `DH(EK_A, SPK_B)`
//! - DH4 = `DH(EK_A, OPK_B)` if a one-time prekey was offered
//! - SK = KDF(DH1 || DH2 || DH3 || [DH4])
//!
//! and immediately performs the first DH ratchet step against `SPK_B`, which doubles
//! as the responder's initial ratchet key. The responder mirrors the derivation from
//! the [`InitialMessage`] attached to the initiator's envelopes and starts out with
//! `SK` as root key and `SPK_B` as its sending ratchet key.
//!
//! ## Decryption
//!
//! Decryption is split into a plan and a commit. The plan derives the message key,
//! any skipped keys and, on a new ratchet key, the next root and chain keys, without
//! touching the session. Only after the authentication tag verifies is the plan
//! committed, so tampered or replayed envelopes never change ratchet state.

use crate::bundle::PreKeyBundle;
use crate::config::SessionConfig;
use crate::crypto::{self, generate_nonce, kdf_agreement, kdf_chain, kdf_root, SymmetricKey};
use crate::envelope::{CiphertextEnvelope, InitialMessage};
use crate::error::{Error, Result};
use crate::key_material::{PreKeyRecord, SignedPreKeyRecord};
use crate::key_store::KeyStore;
use crate::keys::{IdentityKeyPair, PublicKey, SecretKey};
use crate::session_store::PeerId;
use crate::skipped::{SkippedKeys, Slot};
use rand_core::CryptoRngCore;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace, warn};
use zeroize::Zeroize;

/// Chain key together with the counter of the next message it will produce
#[derive(Clone)]
struct Chain {
    key: SymmetricKey,
    counter: u32,
}

impl Chain {
    fn new(key: SymmetricKey) -> Self {
        Self { key, counter: 0 }
    }

    /// Derives the message key for `self.counter` and the chain that follows it.
    fn step(&self) -> Result<(Chain, SymmetricKey)> {
        let counter = self.counter.checked_add(1).ok_or(Error::Decryption)?;
        let (key, message_key) = kdf_chain(&self.key)?;
        Ok((Chain { key, counter }, message_key))
    }
}

/// Per-peer ratchet state
pub struct RatchetSession {
    root_key: SymmetricKey,

    /// Our current ratchet key pair
    dh_send: SecretKey,

    /// `None` until the first DH ratchet step on the responder side
    sending: Option<Chain>,

    previous_sending_length: u32,

    /// Receiving chains keyed by the peer's ratchet key, oldest first
    receiving: VecDeque<(PublicKey, Chain)>,

    /// Ratchet keys of receiving chains dropped past the chain limit, oldest first
    retired: VecDeque<PublicKey>,

    skipped: SkippedKeys,

    /// `IK_initiator || IK_responder`
    associated_data: [u8; 64],

    /// Initiator's base key, identifying the key agreement this session came from
    base_key: PublicKey,

    /// Attached to outgoing envelopes until the peer is heard from
    pending_pre_key: Option<InitialMessage>,

    remote_identity: PublicKey,
}

impl RatchetSession {
    #[must_use]
    pub fn base_key(&self) -> &PublicKey {
        &self.base_key
    }

    #[must_use]
    pub fn remote_identity(&self) -> &PublicKey {
        &self.remote_identity
    }

    /// Whether this side initiated and has not yet heard back from the peer
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending_pre_key.is_some()
    }

    /// Counter of the next outgoing message, `None` before the first DH step
    #[must_use]
    pub fn sending_counter(&self) -> Option<u32> {
        self.sending.as_ref().map(|chain| chain.counter)
    }

    /// Counter expected next on the newest receiving chain
    #[must_use]
    pub fn receiving_counter(&self) -> Option<u32> {
        self.receiving.back().map(|(_, chain)| chain.counter)
    }

    #[must_use]
    pub fn receiving_chain_count(&self) -> usize {
        self.receiving.len()
    }

    #[must_use]
    pub fn skipped_key_count(&self) -> usize {
        self.skipped.len()
    }

    /// Whether a session established from an incoming prekey message for a different
    /// key agreement should become current in place of this one.
    ///
    /// A session we already heard back on always gives way: the peer started over.
    /// When both sides initiated concurrently the larger base key wins, so both sides
    /// settle on the same session. The other one stays reachable as a previous session.
    pub(crate) fn should_yield_to(&self, initial: &InitialMessage) -> bool {
        if initial.base_key == self.base_key {
            return false;
        }
        !self.is_pending() || initial.base_key > self.base_key
    }

    fn receiving_chain(&self, ratchet_key: &PublicKey) -> Option<&Chain> {
        self.receiving
            .iter()
            .find(|(key, _)| key == ratchet_key)
            .map(|(_, chain)| chain)
    }

    fn set_receiving_chain(&mut self, ratchet_key: PublicKey, chain: Chain, max_chains: usize) {
        if let Some(entry) = self
            .receiving
            .iter_mut()
            .find(|(key, _)| *key == ratchet_key)
        {
            entry.1 = chain;
            return;
        }

        self.receiving.push_back((ratchet_key, chain));
        while self.receiving.len() > max_chains.max(1) {
            let Some((dropped, _)) = self.receiving.pop_front() else {
                break;
            };
            self.retired.push_back(dropped);
        }
        while self.retired.len() > max_chains.max(1) {
            self.retired.pop_front();
        }
    }

    fn commit(&mut self, plan: DecryptPlan, max_chains: usize) {
        if let Some(slot) = plan.consumed {
            self.skipped.remove(&slot);
        }
        for (slot, key) in plan.skipped {
            self.skipped.insert(slot, key);
        }
        for (ratchet_key, chain) in plan.chains {
            self.set_receiving_chain(ratchet_key, chain, max_chains);
        }
        if let Some(step) = plan.step {
            self.root_key = step.root_key;
            self.dh_send = step.dh_send;
            self.sending = Some(step.sending);
            self.previous_sending_length = step.previous_sending_length;
        }
        self.pending_pre_key = None;
    }
}

impl std::fmt::Debug for RatchetSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatchetSession")
            .field("remote_identity", &self.remote_identity)
            .field("sending_counter", &self.sending_counter())
            .field("receiving_chains", &self.receiving.len())
            .field("skipped_keys", &self.skipped.len())
            .field("pending", &self.is_pending())
            .finish()
    }
}

impl Zeroize for RatchetSession {
    fn zeroize(&mut self) {
        self.root_key.zeroize();
        self.sending = None;
        self.receiving.clear();
        self.retired.clear();
        self.skipped.clear();
        self.associated_data.zeroize();
    }
}

impl Drop for RatchetSession {
    fn drop(&mut self) {
        self.zeroize();
    }
}

/// New root, sending chain and ratchet key produced by a DH ratchet step
struct DhStep {
    root_key: SymmetricKey,
    dh_send: SecretKey,
    sending: Chain,
    previous_sending_length: u32,
}

/// Everything a successful decryption changes, computed up front
struct DecryptPlan {
    ratchet_key: PublicKey,
    message_key: SymmetricKey,
    /// Cached key used for this message
    consumed: Option<Slot>,
    /// Keys derived past, to be cached
    skipped: Vec<(Slot, SymmetricKey)>,
    /// Receiving chains to create or advance
    chains: Vec<(PublicKey, Chain)>,
    step: Option<DhStep>,
}

/// Runs key agreement and the ratchet for one local identity.
#[derive(Debug, Clone)]
pub struct RatchetEngine {
    identity: Arc<IdentityKeyPair>,
    config: SessionConfig,
}

impl RatchetEngine {
    #[must_use]
    pub fn new(identity: Arc<IdentityKeyPair>, config: SessionConfig) -> Self {
        Self { identity, config }
    }

    #[must_use]
    pub fn identity(&self) -> &IdentityKeyPair {
        &self.identity
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Establishes a session from a peer's bundle (initiator side).
    ///
    /// # Errors
    /// - `Error::InvalidSignature` if the signed prekey does not verify; no session is
    ///   created in that case
    /// - `Error::KeyGeneration` if ephemeral keys cannot be generated
    pub fn establish_as_initiator<R: CryptoRngCore>(
        &self,
        rng: &mut R,
        bundle: &PreKeyBundle,
    ) -> Result<RatchetSession> {
        if let Err(err) = bundle.verify() {
            warn!(
                target: "secure_session::ratchet",
                identity = ?bundle.identity_key,
                "rejecting bundle with invalid signed prekey signature"
            );
            return Err(err);
        }

        let base = SecretKey::generate(rng)?;
        let signed_pre_key = bundle.signed_pre_key.public_key;

        let dh1 = self.identity.secret_key().diffie_hellman(&signed_pre_key);
        let dh2 = base.diffie_hellman(&bundle.identity_key);
        let dh3 = base.diffie_hellman(&signed_pre_key);
        let dh4 = bundle
            .one_time_pre_key
            .map(|one_time| base.diffie_hellman(&one_time.public_key));
        let shared_secret = kdf_agreement(&dh1, &dh2, &dh3, dh4.as_ref())?;

        // The responder's signed prekey is its first ratchet key.
        let dh_send = SecretKey::generate(rng)?;
        let (root_key, sending_key) =
            kdf_root(&shared_secret, &dh_send.diffie_hellman(&signed_pre_key))?;

        let local_identity = *self.identity.public_key();
        let initial = InitialMessage {
            identity_key: local_identity,
            base_key: base.public_key(),
            signed_pre_key_id: bundle.signed_pre_key.id,
            one_time_pre_key_id: bundle.one_time_pre_key.map(|one_time| one_time.id),
        };

        debug!(
            target: "secure_session::ratchet",
            signed_pre_key_id = initial.signed_pre_key_id,
            one_time_pre_key_id = ?initial.one_time_pre_key_id,
            "established session as initiator"
        );

        Ok(RatchetSession {
            root_key,
            dh_send,
            sending: Some(Chain::new(sending_key)),
            previous_sending_length: 0,
            receiving: VecDeque::new(),
            retired: VecDeque::new(),
            skipped: SkippedKeys::new(self.config.max_skipped_keys),
            associated_data: associated_identities(&local_identity, &bundle.identity_key),
            base_key: initial.base_key,
            pending_pre_key: Some(initial),
            remote_identity: bundle.identity_key,
        })
    }

    /// Establishes a session from an initiator's prekey message (responder side).
    ///
    /// One-time prekeys are only looked up here. The caller consumes the referenced
    /// one-time prekey once the first message has decrypted, so a failed attempt
    /// leaves the key store untouched.
    ///
    /// # Errors
    /// `Error::KeyNotFound` if the referenced signed or one-time prekey is absent.
    pub fn establish_as_responder(
        &self,
        sender: &PeerId,
        initial: &InitialMessage,
        pre_keys: &KeyStore<PreKeyRecord>,
        signed_pre_keys: &KeyStore<SignedPreKeyRecord>,
    ) -> Result<RatchetSession> {
        let signed_pre_key = signed_pre_keys.get(initial.signed_pre_key_id)?;
        let one_time_pre_key = initial
            .one_time_pre_key_id
            .map(|id| pre_keys.get(id))
            .transpose()?;

        let dh1 = signed_pre_key
            .secret_key()
            .diffie_hellman(&initial.identity_key);
        let dh2 = self
            .identity
            .secret_key()
            .diffie_hellman(&initial.base_key);
        let dh3 = signed_pre_key.secret_key().diffie_hellman(&initial.base_key);
        let dh4 = one_time_pre_key.map(|record| record.secret_key().diffie_hellman(&initial.base_key));
        let shared_secret = kdf_agreement(&dh1, &dh2, &dh3, dh4.as_ref())?;

        debug!(
            target: "secure_session::ratchet",
            peer = %sender,
            signed_pre_key_id = initial.signed_pre_key_id,
            one_time_pre_key_id = ?initial.one_time_pre_key_id,
            "established session as responder"
        );

        Ok(RatchetSession {
            root_key: shared_secret,
            dh_send: signed_pre_key.secret_key().clone(),
            sending: None,
            previous_sending_length: 0,
            receiving: VecDeque::new(),
            retired: VecDeque::new(),
            skipped: SkippedKeys::new(self.config.max_skipped_keys),
            associated_data: associated_identities(
                &initial.identity_key,
                self.identity.public_key(),
            ),
            base_key: initial.base_key,
            pending_pre_key: None,
            remote_identity: initial.identity_key,
        })
    }

    /// Encrypts `plaintext` with the next key of the sending chain.
    ///
    /// # Errors
    /// `Error::Encryption` if the session has no sending chain yet or the cipher fails.
    pub fn ratchet_encrypt(
        &self,
        session: &mut RatchetSession,
        sender: &PeerId,
        plaintext: &[u8],
    ) -> Result<CiphertextEnvelope> {
        let Some(chain) = session.sending.as_mut() else {
            return Err(Error::Encryption);
        };
        let (next, message_key) = chain.step().map_err(|_| Error::Encryption)?;

        let ratchet_key = session.dh_send.public_key();
        let mut envelope = CiphertextEnvelope {
            sender_id: sender.clone(),
            ratchet_key,
            previous_chain_length: session.previous_sending_length,
            counter: chain.counter,
            initial_message: session.pending_pre_key,
            ciphertext: Vec::new(),
        };

        let nonce = generate_nonce(chain.counter, ratchet_key.as_bytes());
        let ad = associated_data(&session.associated_data, &envelope.header_bytes());
        envelope.ciphertext = crypto::encrypt(&message_key, &nonce, plaintext, &ad)?;

        *chain = next;
        trace!(
            target: "secure_session::ratchet",
            counter = envelope.counter,
            prekey = envelope.initial_message.is_some(),
            "encrypted message"
        );
        Ok(envelope)
    }

    /// Decrypts an envelope, advancing the ratchet only if authentication succeeds.
    ///
    /// # Errors
    /// - `Error::Authentication` if the tag does not verify; the session is unchanged
    /// - `Error::DuplicateMessage` if the message key was already used
    /// - `Error::MessageKeyEvicted` if the key was dropped from the skipped-key cache
    /// - `Error::TooManySkippedMessages` if the envelope skips past the configured limit
    pub fn ratchet_decrypt<R: CryptoRngCore>(
        &self,
        rng: &mut R,
        session: &mut RatchetSession,
        envelope: &CiphertextEnvelope,
    ) -> Result<Vec<u8>> {
        let plan = self.plan_decrypt(rng, session, envelope)?;

        let nonce = generate_nonce(envelope.counter, plan.ratchet_key.as_bytes());
        let ad = associated_data(&session.associated_data, &envelope.header_bytes());
        let plaintext = match crypto::decrypt(&plan.message_key, &nonce, &envelope.ciphertext, &ad)
        {
            Ok(plaintext) => plaintext,
            Err(err) => {
                warn!(
                    target: "secure_session::ratchet",
                    sender = %envelope.sender_id,
                    counter = envelope.counter,
                    "message failed authentication"
                );
                return Err(err);
            }
        };

        if plan.step.is_some() {
            debug!(
                target: "secure_session::ratchet",
                sender = %envelope.sender_id,
                previous_chain_length = envelope.previous_chain_length,
                "performed DH ratchet step"
            );
        }
        session.commit(plan, self.config.max_receiving_chains);
        Ok(plaintext)
    }

    fn plan_decrypt<R: CryptoRngCore>(
        &self,
        rng: &mut R,
        session: &RatchetSession,
        envelope: &CiphertextEnvelope,
    ) -> Result<DecryptPlan> {
        let ratchet_key = envelope.ratchet_key;
        let counter = envelope.counter;
        let slot = (ratchet_key, counter);

        if let Some(message_key) = session.skipped.get(&slot) {
            return Ok(DecryptPlan {
                ratchet_key,
                message_key: message_key.clone(),
                consumed: Some(slot),
                skipped: Vec::new(),
                chains: Vec::new(),
                step: None,
            });
        }

        let mut budget = self.config.max_skip_per_message;
        let mut skipped = Vec::new();

        if let Some(chain) = session.receiving_chain(&ratchet_key) {
            if counter < chain.counter {
                return Err(if session.skipped.is_evicted(&slot) {
                    debug!(target: "secure_session::ratchet", counter, "message key was evicted");
                    Error::MessageKeyEvicted
                } else {
                    debug!(target: "secure_session::ratchet", counter, "duplicate message");
                    Error::DuplicateMessage
                });
            }

            let chain = skip_to(&ratchet_key, chain.clone(), counter, &mut skipped, &mut budget)?;
            let (chain, message_key) = chain.step()?;
            return Ok(DecryptPlan {
                ratchet_key,
                message_key,
                consumed: None,
                skipped,
                chains: vec![(ratchet_key, chain)],
                step: None,
            });
        }

        if session.retired.contains(&ratchet_key) {
            debug!(target: "secure_session::ratchet", counter, "receiving chain was dropped");
            return Err(Error::MessageKeyEvicted);
        }

        // Unknown ratchet key: close the current receiving chain and ratchet.
        let mut chains = Vec::new();
        if let Some((current_key, current)) = session.receiving.back() {
            if envelope.previous_chain_length > current.counter {
                let closed = skip_to(
                    current_key,
                    current.clone(),
                    envelope.previous_chain_length,
                    &mut skipped,
                    &mut budget,
                )?;
                chains.push((*current_key, closed));
            }
        }

        let (root_key, receiving_key) = kdf_root(
            &session.root_key,
            &session.dh_send.diffie_hellman(&ratchet_key),
        )?;
        let receiving = skip_to(
            &ratchet_key,
            Chain::new(receiving_key),
            counter,
            &mut skipped,
            &mut budget,
        )?;
        let (receiving, message_key) = receiving.step()?;
        chains.push((ratchet_key, receiving));

        let dh_send = SecretKey::generate(rng)?;
        let (root_key, sending_key) = kdf_root(&root_key, &dh_send.diffie_hellman(&ratchet_key))?;

        Ok(DecryptPlan {
            ratchet_key,
            message_key,
            consumed: None,
            skipped,
            chains,
            step: Some(DhStep {
                root_key,
                dh_send,
                sending: Chain::new(sending_key),
                previous_sending_length: session.sending_counter().unwrap_or(0),
            }),
        })
    }
}

/// Advances `chain` to `until`, collecting the message keys passed over.
fn skip_to(
    ratchet_key: &PublicKey,
    mut chain: Chain,
    until: u32,
    skipped: &mut Vec<(Slot, SymmetricKey)>,
    budget: &mut u32,
) -> Result<Chain> {
    let gap = until.saturating_sub(chain.counter);
    if gap > *budget {
        return Err(Error::TooManySkippedMessages);
    }
    *budget -= gap;

    while chain.counter < until {
        let (next, message_key) = chain.step()?;
        skipped.push(((*ratchet_key, chain.counter), message_key));
        chain = next;
    }
    Ok(chain)
}

fn associated_identities(initiator: &PublicKey, responder: &PublicKey) -> [u8; 64] {
    let mut ad = [0u8; 64];
    ad[..32].copy_from_slice(initiator.as_bytes());
    ad[32..].copy_from_slice(responder.as_bytes());
    ad
}

fn associated_data(identities: &[u8; 64], header: &[u8]) -> Vec<u8> {
    let mut ad = Vec::with_capacity(identities.len() + header.len());
    ad.extend_from_slice(identities);
    ad.extend_from_slice(header);
    ad
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::key_material::{
        generate_identity, generate_pre_key, generate_signed_pre_key, KeyKind,
    };
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    struct Party {
        id: PeerId,
        engine: RatchetEngine,
        pre_keys: KeyStore<PreKeyRecord>,
        signed_pre_keys: KeyStore<SignedPreKeyRecord>,
    }

    impl Party {
        fn new(rng: &mut StdRng, name: &str, config: SessionConfig) -> Self {
            let identity = generate_identity(rng).unwrap();
            let mut pre_keys = KeyStore::new();
            let mut signed_pre_keys = KeyStore::new();
            pre_keys.put(1, generate_pre_key(rng, 1).unwrap());
            signed_pre_keys.put(1, generate_signed_pre_key(rng, &identity, 1).unwrap());

            Self {
                id: PeerId::new(name).unwrap(),
                engine: RatchetEngine::new(Arc::new(identity), config),
                pre_keys,
                signed_pre_keys,
            }
        }

        fn bundle(&self, with_one_time: bool) -> PreKeyBundle {
            PreKeyBundle {
                identity_key: *self.engine.identity().public_key(),
                signed_pre_key: self.signed_pre_keys.get(1).unwrap().to_public(),
                one_time_pre_key: with_one_time.then(|| self.pre_keys.get(1).unwrap().to_public()),
            }
        }
    }

    struct Fixture {
        rng: StdRng,
        alice: Party,
        bob: Party,
        alice_session: RatchetSession,
        bob_session: RatchetSession,
    }

    impl Fixture {
        fn new(config: SessionConfig) -> Self {
            Self::with_seed(config, 7)
        }

        fn with_seed(config: SessionConfig, seed: u64) -> Self {
            let mut rng = StdRng::seed_from_u64(seed);
            let alice = Party::new(&mut rng, "alice", config);
            let bob = Party::new(&mut rng, "bob", config);

            let alice_session = alice
                .engine
                .establish_as_initiator(&mut rng, &bob.bundle(true))
                .unwrap();
            let initial = alice_session.pending_pre_key.unwrap();
            let bob_session = bob
                .engine
                .establish_as_responder(&alice.id, &initial, &bob.pre_keys, &bob.signed_pre_keys)
                .unwrap();

            Self {
                rng,
                alice,
                bob,
                alice_session,
                bob_session,
            }
        }

        fn alice_sends(&mut self, plaintext: &[u8]) -> CiphertextEnvelope {
            self.alice
                .engine
                .ratchet_encrypt(&mut self.alice_session, &self.alice.id, plaintext)
                .unwrap()
        }

        fn bob_sends(&mut self, plaintext: &[u8]) -> CiphertextEnvelope {
            self.bob
                .engine
                .ratchet_encrypt(&mut self.bob_session, &self.bob.id, plaintext)
                .unwrap()
        }

        fn bob_receives(&mut self, envelope: &CiphertextEnvelope) -> Result<Vec<u8>> {
            self.bob
                .engine
                .ratchet_decrypt(&mut self.rng, &mut self.bob_session, envelope)
        }

        fn alice_receives(&mut self, envelope: &CiphertextEnvelope) -> Result<Vec<u8>> {
            self.alice
                .engine
                .ratchet_decrypt(&mut self.rng, &mut self.alice_session, envelope)
        }
    }

    /// Initiator and responder sessions for the same key agreement.
    pub(crate) fn session_pair() -> (RatchetSession, RatchetSession) {
        session_pair_with_seed(7)
    }

    pub(crate) fn session_pair_with_seed(seed: u64) -> (RatchetSession, RatchetSession) {
        let fixture = Fixture::with_seed(SessionConfig::default(), seed);
        (fixture.alice_session, fixture.bob_session)
    }

    #[test]
    fn test_basic_exchange() {
        let mut fx = Fixture::new(SessionConfig::default());

        let first = fx.alice_sends(b"Hello Bob!");
        assert!(first.initial_message.is_some());
        assert_eq!(fx.bob_receives(&first).unwrap(), b"Hello Bob!");

        let reply = fx.bob_sends(b"Hello Alice!");
        assert!(reply.initial_message.is_none());
        assert_eq!(fx.alice_receives(&reply).unwrap(), b"Hello Alice!");

        assert!(!fx.alice_session.is_pending());
        let next = fx.alice_sends(b"again");
        assert!(next.initial_message.is_none());
        assert_eq!(fx.bob_receives(&next).unwrap(), b"again");
    }

    #[test]
    fn test_prekey_section_repeats_until_reply() {
        let mut fx = Fixture::new(SessionConfig::default());
        let first = fx.alice_sends(b"one");
        let second = fx.alice_sends(b"two");

        assert_eq!(first.initial_message, second.initial_message);
        assert_eq!(first.ratchet_key, second.ratchet_key);
        assert_eq!(second.counter, 1);
    }

    #[test]
    fn test_out_of_order_delivery() {
        let mut fx = Fixture::new(SessionConfig::default());
        let m1 = fx.alice_sends(b"M1");
        let m2 = fx.alice_sends(b"M2");
        let m3 = fx.alice_sends(b"M3");

        assert_eq!(fx.bob_receives(&m3).unwrap(), b"M3");
        assert_eq!(fx.bob_session.skipped_key_count(), 2);
        assert_eq!(fx.bob_receives(&m1).unwrap(), b"M1");
        assert_eq!(fx.bob_receives(&m2).unwrap(), b"M2");
        assert_eq!(fx.bob_session.skipped_key_count(), 0);

        for message in [&m1, &m2, &m3] {
            assert_eq!(fx.bob_receives(message), Err(Error::DuplicateMessage));
        }
    }

    #[test]
    fn test_replay_is_rejected() {
        let mut fx = Fixture::new(SessionConfig::default());
        let m1 = fx.alice_sends(b"once");

        assert_eq!(fx.bob_receives(&m1).unwrap(), b"once");
        assert_eq!(fx.bob_receives(&m1), Err(Error::DuplicateMessage));
    }

    #[test]
    fn test_tampering_leaves_state_unchanged() {
        let mut fx = Fixture::new(SessionConfig::default());
        let m1 = fx.alice_sends(b"first");
        fx.bob_receives(&m1).unwrap();

        let m2 = fx.alice_sends(b"second");
        let m3 = fx.alice_sends(b"third");
        let counter_before = fx.bob_session.receiving_counter();
        let skipped_before = fx.bob_session.skipped_key_count();

        for bit in [0, 7, m3.ciphertext.len() * 8 - 1] {
            let mut tampered = m3.clone();
            tampered.ciphertext[bit / 8] ^= 1 << (bit % 8);
            assert_eq!(fx.bob_receives(&tampered), Err(Error::Authentication));
        }

        let mut tampered = m3.clone();
        tampered.previous_chain_length ^= 1;
        assert_eq!(fx.bob_receives(&tampered), Err(Error::Authentication));

        assert_eq!(fx.bob_session.receiving_counter(), counter_before);
        assert_eq!(fx.bob_session.skipped_key_count(), skipped_before);
        assert_eq!(fx.bob_receives(&m2).unwrap(), b"second");
        assert_eq!(fx.bob_receives(&m3).unwrap(), b"third");
    }

    #[test]
    fn test_tampered_first_message_creates_nothing() {
        let mut fx = Fixture::new(SessionConfig::default());
        let mut m1 = fx.alice_sends(b"hello");
        m1.ciphertext[0] ^= 0x01;

        assert_eq!(fx.bob_receives(&m1), Err(Error::Authentication));
        assert_eq!(fx.bob_session.sending_counter(), None);
        assert_eq!(fx.bob_session.receiving_chain_count(), 0);
    }

    #[test]
    fn test_evicted_key_is_reported() {
        let config = SessionConfig::default().with_max_skipped_keys(2);
        let mut fx = Fixture::new(config);
        let messages: Vec<_> = (0..4u8).map(|i| fx.alice_sends(&[i])).collect();

        assert_eq!(fx.bob_receives(&messages[3]).unwrap(), vec![3]);
        assert_eq!(fx.bob_receives(&messages[0]), Err(Error::MessageKeyEvicted));
        assert_eq!(fx.bob_receives(&messages[1]).unwrap(), vec![1]);
        assert_eq!(fx.bob_receives(&messages[2]).unwrap(), vec![2]);
    }

    #[test]
    fn test_skip_limit() {
        let config = SessionConfig::default().with_max_skip_per_message(3);
        let mut fx = Fixture::new(config);
        let messages: Vec<_> = (0..5u8).map(|i| fx.alice_sends(&[i])).collect();

        assert_eq!(
            fx.bob_receives(&messages[4]),
            Err(Error::TooManySkippedMessages)
        );
        assert_eq!(fx.bob_receives(&messages[3]).unwrap(), vec![3]);
    }

    #[test]
    fn test_late_message_from_previous_chain() {
        let mut fx = Fixture::new(SessionConfig::default());
        let a0 = fx.alice_sends(b"a0");
        let a1 = fx.alice_sends(b"a1");
        fx.bob_receives(&a0).unwrap();

        let b0 = fx.bob_sends(b"b0");
        fx.alice_receives(&b0).unwrap();

        // New chain on Alice's side; a1 is still in flight.
        let a2 = fx.alice_sends(b"a2");
        assert_eq!(a2.previous_chain_length, 2);
        assert_ne!(a2.ratchet_key, a1.ratchet_key);

        assert_eq!(fx.bob_receives(&a2).unwrap(), b"a2");
        assert_eq!(fx.bob_receives(&a1).unwrap(), b"a1");
        assert_eq!(fx.bob_receives(&a1), Err(Error::DuplicateMessage));
    }

    #[test]
    fn test_receiving_chains_are_bounded() {
        let config = SessionConfig::default().with_max_receiving_chains(2);
        let mut fx = Fixture::new(config);

        for round in 0..6u8 {
            let ping = fx.alice_sends(&[round]);
            fx.bob_receives(&ping).unwrap();
            let pong = fx.bob_sends(&[round]);
            fx.alice_receives(&pong).unwrap();
        }

        assert_eq!(fx.alice_session.receiving_chain_count(), 2);
        assert_eq!(fx.bob_session.receiving_chain_count(), 2);
    }

    #[test]
    fn test_message_on_dropped_chain_is_evicted() {
        let config = SessionConfig::default()
            .with_max_receiving_chains(1)
            .with_max_skipped_keys(1);
        let mut fx = Fixture::new(config);
        let a0 = fx.alice_sends(b"a0");
        let a1 = fx.alice_sends(b"a1");
        let a2 = fx.alice_sends(b"a2");
        fx.bob_receives(&a0).unwrap();

        let b0 = fx.bob_sends(b"b0");
        fx.alice_receives(&b0).unwrap();
        let c0 = fx.alice_sends(b"c0");
        assert_eq!(fx.bob_receives(&c0).unwrap(), b"c0");
        assert_eq!(fx.bob_session.receiving_chain_count(), 1);

        assert_eq!(fx.bob_receives(&a1), Err(Error::MessageKeyEvicted));
        assert_eq!(fx.bob_receives(&a2).unwrap(), b"a2");
    }

    #[test]
    fn test_eviction_reported_after_tombstone_expires() {
        let config = SessionConfig::default().with_max_skipped_keys(1);
        let mut fx = Fixture::new(config);
        let messages: Vec<_> = (0..5u8).map(|i| fx.alice_sends(&[i])).collect();

        assert_eq!(fx.bob_receives(&messages[4]).unwrap(), vec![4]);
        for message in &messages[..3] {
            assert_eq!(fx.bob_receives(message), Err(Error::MessageKeyEvicted));
        }
        assert_eq!(fx.bob_receives(&messages[3]).unwrap(), vec![3]);
        assert_eq!(fx.bob_receives(&messages[4]), Err(Error::DuplicateMessage));
    }

    #[test]
    fn test_responder_cannot_send_first() {
        let mut fx = Fixture::new(SessionConfig::default());
        assert_eq!(
            fx.bob.engine.ratchet_encrypt(&mut fx.bob_session, &fx.bob.id, b"early"),
            Err(Error::Encryption)
        );
    }

    #[test]
    fn test_invalid_bundle_signature() {
        let mut fx = Fixture::new(SessionConfig::default());
        let mut bundle = fx.bob.bundle(true);
        bundle.signed_pre_key.public_key = *fx.alice.engine.identity().public_key();

        assert!(matches!(
            fx.alice.engine.establish_as_initiator(&mut fx.rng, &bundle),
            Err(Error::InvalidSignature)
        ));
    }

    #[test]
    fn test_signed_pre_key_only() {
        let mut rng = StdRng::seed_from_u64(11);
        let alice = Party::new(&mut rng, "alice", SessionConfig::default());
        let bob = Party::new(&mut rng, "bob", SessionConfig::default());

        let mut alice_session = alice
            .engine
            .establish_as_initiator(&mut rng, &bob.bundle(false))
            .unwrap();
        let envelope = alice
            .engine
            .ratchet_encrypt(&mut alice_session, &alice.id, b"no one-time key")
            .unwrap();
        let initial = envelope.initial_message.unwrap();
        assert_eq!(initial.one_time_pre_key_id, None);

        let mut bob_session = bob
            .engine
            .establish_as_responder(&alice.id, &initial, &bob.pre_keys, &bob.signed_pre_keys)
            .unwrap();
        assert_eq!(
            bob.engine
                .ratchet_decrypt(&mut rng, &mut bob_session, &envelope)
                .unwrap(),
            b"no one-time key"
        );
    }

    #[test]
    fn test_unknown_pre_keys() {
        let fx = Fixture::new(SessionConfig::default());
        let mut initial = fx.alice_session.pending_pre_key.unwrap();

        initial.signed_pre_key_id = 9;
        assert_eq!(
            fx.bob
                .engine
                .establish_as_responder(&fx.alice.id, &initial, &fx.bob.pre_keys, &fx.bob.signed_pre_keys)
                .unwrap_err(),
            Error::KeyNotFound {
                kind: KeyKind::Signed,
                id: 9
            }
        );

        initial.signed_pre_key_id = 1;
        initial.one_time_pre_key_id = Some(5);
        assert_eq!(
            fx.bob
                .engine
                .establish_as_responder(&fx.alice.id, &initial, &fx.bob.pre_keys, &fx.bob.signed_pre_keys)
                .unwrap_err(),
            Error::KeyNotFound {
                kind: KeyKind::OneTime,
                id: 5
            }
        );
    }

    #[test]
    fn test_yield_rule() {
        let (alice_session, bob_session) = session_pair();
        let mut other = *alice_session.pending_pre_key.as_ref().unwrap();

        other.base_key = alice_session.base_key;
        assert!(!alice_session.should_yield_to(&other));
        assert!(!bob_session.should_yield_to(&other));

        other.base_key = PublicKey::from_bytes([0xFF; 32]);
        assert!(alice_session.should_yield_to(&other));
        other.base_key = PublicKey::from_bytes([0x00; 32]);
        assert!(!alice_session.should_yield_to(&other));
        assert!(bob_session.should_yield_to(&other));
    }
}
