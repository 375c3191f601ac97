//! In-memory identity store.
//!
//! Readers take an immutable [`Arc`] snapshot of the whole gallery; writers
//! copy-on-write under the lock. A matcher holding a snapshot never observes
//! a half-written identity, and registrations never block behind a long scan.

use crate::types::Identity;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Registered identities ordered by key.
pub type Gallery = BTreeMap<String, Identity>;

#[derive(Debug, Default)]
pub struct IdentityStore {
    gallery: RwLock<Arc<Gallery>>,
}

impl IdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_identities(identities: impl IntoIterator<Item = Identity>) -> Self {
        let gallery: Gallery = identities
            .into_iter()
            .map(|identity| (identity.key().to_string(), identity))
            .collect();
        Self {
            gallery: RwLock::new(Arc::new(gallery)),
        }
    }

    /// Current gallery. Later registrations are not visible through it.
    pub fn snapshot(&self) -> Arc<Gallery> {
        self.gallery
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn contains(&self, reg_no: &str) -> bool {
        self.snapshot().contains_key(reg_no)
    }

    pub fn get(&self, reg_no: &str) -> Option<Identity> {
        self.snapshot().get(reg_no).cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or replace an identity. Returns the previous entry for the key.
    ///
    /// Only the registrar calls this, after the persistent table accepted the
    /// same identity.
    pub(crate) fn put(&self, identity: Identity) -> Option<Identity> {
        let mut guard = self.gallery.write().unwrap_or_else(PoisonError::into_inner);
        Arc::make_mut(&mut guard).insert(identity.key().to_string(), identity)
    }
}
