//! In-memory store for prekey and signed-prekey records.
//!
//! Records are indexed by their 32-bit id. One-time prekeys leave the store through
//! [`KeyStore::take`], which removes them so that an id can never be consumed twice.
//! The store itself is not synchronized; [`SessionManager`](crate::SessionManager)
//! serializes every access under its lock.

use crate::error::{Error, Result};
use crate::key_material::KeyRecord;
use std::collections::BTreeMap;

/// Mapping from key id to record, with monotonic id allocation.
#[derive(Debug, Clone)]
pub struct KeyStore<T> {
    records: BTreeMap<u32, T>,
    next_id: u32,
}

impl<T: KeyRecord> KeyStore<T> {
    /// Creates an empty store whose first allocated id is 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Inserts or overwrites the record stored under `id`.
    ///
    /// Inserting an id at or above the allocation cursor moves the cursor past it, so
    /// [`KeyStore::next_id`] never hands out an id that was inserted externally.
    pub fn put(&mut self, id: u32, record: T) {
        if id >= self.next_id {
            self.next_id = id.wrapping_add(1);
        }
        self.records.insert(id, record);
    }

    /// Removes and returns the record stored under `id`.
    ///
    /// # Errors
    /// `Error::KeyNotFound` if the id is unknown or was already consumed.
    pub fn take(&mut self, id: u32) -> Result<T> {
        self.records
            .remove(&id)
            .ok_or(Error::KeyNotFound { kind: T::KIND, id })
    }

    /// Returns the record stored under `id` without consuming it.
    pub fn get(&self, id: u32) -> Result<&T> {
        self.records
            .get(&id)
            .ok_or(Error::KeyNotFound { kind: T::KIND, id })
    }

    /// Allocates an id that is not currently in use.
    ///
    /// Ids are handed out monotonically and are never reissued while the cursor has not
    /// wrapped, so an id consumed earlier is not recycled for a new record.
    pub fn next_id(&mut self) -> Result<u32> {
        if self.records.len() >= u32::MAX as usize {
            return Err(Error::KeyGeneration);
        }

        let mut candidate = self.next_id;
        // Zero is reserved so the cursor's starting point stays distinguishable.
        while candidate == 0 || self.records.contains_key(&candidate) {
            candidate = candidate.wrapping_add(1);
        }
        self.next_id = candidate.wrapping_add(1);
        Ok(candidate)
    }

    #[must_use]
    pub fn contains(&self, id: u32) -> bool {
        self.records.contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Ids of all live records in ascending order
    #[must_use]
    pub fn ids(&self) -> Vec<u32> {
        self.records.keys().copied().collect()
    }

    /// Live records in ascending id order
    pub fn records(&self) -> impl Iterator<Item = &T> {
        self.records.values()
    }

    /// The record with the highest id, i.e. the most recently allocated one.
    #[must_use]
    pub fn latest(&self) -> Option<&T> {
        self.records.values().next_back()
    }

    /// Removes all but the `keep` highest-id records and returns the removed ids.
    pub fn retain_latest(&mut self, keep: usize) -> Vec<u32> {
        let excess = self.records.len().saturating_sub(keep);
        let retired: Vec<u32> = self.records.keys().take(excess).copied().collect();
        for id in &retired {
            self.records.remove(id);
        }
        retired
    }
}

impl<T: KeyRecord> Default for KeyStore<T> {
    fn default() -> Self {
        Self::new()
    }
}
