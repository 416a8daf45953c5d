//! Per-peer ratchet session storage.
//!
//! Sessions are owned by the store and handed out as mutable borrows for the
//! duration of a single operation. A peer without a session is reached through
//! [`SessionEntry::Vacant`]; the session only becomes visible once
//! [`VacantSession::establish`] is called, so an establishment that fails half-way
//! leaves nothing behind.
//!
//! Each peer has one current session, used for sending, and a short list of
//! previous sessions that can still decrypt messages already in flight when the
//! current one took over.

use crate::error::{Error, Result};
use crate::keys::PublicKey;
use crate::ratchet::RatchetSession;
use std::collections::hash_map::{self, HashMap};
use std::collections::VecDeque;
use std::fmt;

/// Longest peer identifier accepted on the wire
pub const MAX_PEER_ID_LEN: usize = 255;

/// Identifier of a remote (or the local) party
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeerId(String);

impl PeerId {
    /// Wraps an identifier, rejecting empty ones and ones longer than
    /// [`MAX_PEER_ID_LEN`] bytes.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() || id.len() > MAX_PEER_ID_LEN {
            return Err(Error::InvalidPeerId);
        }
        Ok(Self(id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a peer's session as seen from the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session recorded for the peer
    Uninitialized,
    /// Session established and usable for encrypt/decrypt
    Active,
}

/// A peer's current session plus the sessions it superseded, newest first
pub struct SessionRecord {
    current: RatchetSession,
    previous: VecDeque<RatchetSession>,
}

impl SessionRecord {
    #[must_use]
    pub fn new(current: RatchetSession) -> Self {
        Self {
            current,
            previous: VecDeque::new(),
        }
    }

    /// Session used for sending
    #[must_use]
    pub fn current(&self) -> &RatchetSession {
        &self.current
    }

    pub fn current_mut(&mut self) -> &mut RatchetSession {
        &mut self.current
    }

    #[must_use]
    pub fn previous_count(&self) -> usize {
        self.previous.len()
    }

    pub(crate) fn previous_mut(&mut self) -> impl Iterator<Item = &mut RatchetSession> {
        self.previous.iter_mut()
    }

    /// The current or a previous session coming from the key agreement with
    /// `base_key`.
    pub fn find_mut(&mut self, base_key: &PublicKey) -> Option<&mut RatchetSession> {
        if self.current.base_key() == base_key {
            return Some(&mut self.current);
        }
        self.previous
            .iter_mut()
            .find(|session| session.base_key() == base_key)
    }

    /// Makes `session` current. The old current session becomes the newest previous
    /// one; at most `max_previous` are kept.
    pub fn promote(&mut self, session: RatchetSession, max_previous: usize) {
        let superseded = std::mem::replace(&mut self.current, session);
        self.archive(superseded, max_previous);
    }

    /// Keeps `session` for decryption only, without making it current.
    pub fn archive(&mut self, session: RatchetSession, max_previous: usize) {
        self.previous.push_front(session);
        self.previous.truncate(max_previous);
    }
}

impl fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRecord")
            .field("current", &self.current)
            .field("previous", &self.previous.len())
            .finish()
    }
}

/// Result of [`SessionStore::get_or_create`]
pub enum SessionEntry<'a> {
    /// The peer already has an active session
    Occupied(&'a mut SessionRecord),
    /// The peer needs a session to be established first
    Vacant(VacantSession<'a>),
}

/// Marker for a session being established.
///
/// Holding one means the caller is in the establishing state for that peer.
/// Dropping it without calling [`VacantSession::establish`] records nothing.
pub struct VacantSession<'a> {
    entry: hash_map::VacantEntry<'a, PeerId, SessionRecord>,
}

impl<'a> VacantSession<'a> {
    #[must_use]
    pub fn peer(&self) -> &PeerId {
        self.entry.key()
    }

    /// Records the established session and returns the peer's new record.
    pub fn establish(self, session: RatchetSession) -> &'a mut SessionRecord {
        self.entry.insert(SessionRecord::new(session))
    }
}

/// Mapping from peer identifier to ratchet session
#[derive(Default)]
pub struct SessionStore {
    sessions: HashMap<PeerId, SessionRecord>,
}

impl SessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the peer's session, or a vacant marker that must be filled through
    /// establishment.
    pub fn get_or_create(&mut self, peer: &PeerId) -> SessionEntry<'_> {
        match self.sessions.entry(peer.clone()) {
            hash_map::Entry::Occupied(entry) => SessionEntry::Occupied(entry.into_mut()),
            hash_map::Entry::Vacant(entry) => SessionEntry::Vacant(VacantSession { entry }),
        }
    }

    pub fn get_mut(&mut self, peer: &PeerId) -> Option<&mut SessionRecord> {
        self.sessions.get_mut(peer)
    }

    /// Stores `session` for `peer`, replacing any previous record.
    pub fn insert(&mut self, peer: PeerId, session: RatchetSession) {
        self.sessions.insert(peer, SessionRecord::new(session));
    }

    #[must_use]
    pub fn has_session(&self, peer: &PeerId) -> bool {
        self.sessions.contains_key(peer)
    }

    #[must_use]
    pub fn state(&self, peer: &PeerId) -> SessionState {
        if self.has_session(peer) {
            SessionState::Active
        } else {
            SessionState::Uninitialized
        }
    }

    /// Drops the peer's current and previous sessions. Returns whether any existed.
    pub fn remove(&mut self, peer: &PeerId) -> bool {
        self.sessions.remove(peer).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStore")
            .field("peers", &self.sessions.keys().collect::<Vec<_>>())
            .finish()
    }
}
