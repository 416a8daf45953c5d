//! Per-peer end-to-end encrypted sessions built on X3DH and the Double Ratchet.
//!
//! A [`SessionManager`] owns one local identity, its prekeys and one ratchet session
//! per remote peer. Sessions are established asynchronously from a peer's published
//! [`PreKeyBundle`] and then advanced on every message.
//!
//! # Security Properties
//!
//! ## Forward Secrecy
//! Every message key is derived by a one-way chain step and discarded after use.
//! Holding a chain key reveals nothing about earlier message keys.
//!
//! ## Post-Compromise Security
//! Each reply carries a fresh ratchet key, so a new DH ratchet step restores secrecy
//! after a state compromise once an honest exchange has taken place.
//!
//! ## Tamper Resistance
//! Envelopes are authenticated with ChaCha20-Poly1305 over the payload, the header
//! and both identity keys. A rejected envelope never advances ratchet state.
//!
//! ## Out-of-Order Delivery
//! Keys for skipped messages are cached in a bounded cache. The oldest key is
//! evicted first and a message whose key was evicted fails with
//! [`Error::MessageKeyEvicted`].
//!
//! # Protocol Flow
//!
//! ```rust
//! use secure_session::{PeerId, SessionConfig, SessionManager};
//!
//! let alice_id = PeerId::new("alice")?;
//! let bob_id = PeerId::new("bob")?;
//! let alice = SessionManager::new(alice_id.clone(), SessionConfig::default())?;
//! let bob = SessionManager::new(bob_id.clone(), SessionConfig::default())?;
//!
//! // Bob publishes, a directory hands one bundle to Alice.
//! let bundle = bob.export_public_bundle()?.first_pre_key_bundle()?;
//! alice.process_peer_bundle(&bob_id, bundle)?;
//!
//! // Alice's first envelope carries what Bob needs to establish his side.
//! let envelope = alice.encrypt(&bob_id, b"Hello Bob!")?;
//! assert_eq!(bob.decrypt(&alice_id, &envelope)?, b"Hello Bob!");
//!
//! let reply = bob.encrypt(&alice_id, b"Hello Alice!")?;
//! assert_eq!(alice.decrypt(&bob_id, &reply)?, b"Hello Alice!");
//! # Ok::<(), secure_session::Error>(())
//! ```
//!
//! # Modules
//!
//! - [`manager`]: Public orchestrator owning identity, stores and sessions
//! - [`ratchet`]: Session establishment and the Double Ratchet state machine
//! - [`key_material`]: Identity, one-time and signed prekey generation
//! - [`key_store`]: Id-indexed prekey storage with single-use consumption
//! - [`session_store`]: Per-peer session storage
//! - [`envelope`]: Ciphertext envelope and its wire encoding
//! - [`bundle`]: Published prekey bundles
//! - [`crypto`]: KDFs, AEAD and nonce construction
//! - [`keys`]: Key types with automatic zeroization
//! - [`xeddsa`]: XEdDSA signatures over X25519 keys
//! - [`config`]: Tunable limits
//! - [`error`]: Error types

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unreachable_pub)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![warn(clippy::all, clippy::pedantic, clippy::cargo)]
#![allow(
    missing_docs,
    clippy::missing_errors_doc,
    clippy::missing_fields_in_debug
)]

pub mod bundle;
pub mod config;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod key_material;
pub mod key_store;
pub mod keys;
pub mod manager;
pub mod ratchet;
pub mod session_store;
mod skipped;
pub mod xeddsa;

// Re-export main types
pub use bundle::{PreKeyBundle, PublicBundle};
pub use config::SessionConfig;
pub use envelope::{CiphertextEnvelope, InitialMessage};
pub use error::{Error, Result};
pub use key_material::{
    KeyKind, KeyRecord, PreKeyPublic, PreKeyRecord, SignedPreKeyPublic, SignedPreKeyRecord,
};
pub use key_store::KeyStore;
pub use keys::{IdentityKeyPair, PublicKey, SecretKey};
pub use manager::SessionManager;
pub use ratchet::{RatchetEngine, RatchetSession};
pub use session_store::{PeerId, SessionEntry, SessionRecord, SessionState, SessionStore};
