use std::{
    collections::{BTreeSet, HashMap, hash_map::Entry},
    sync::{Mutex, MutexGuard, PoisonError},
};

use thiserror::Error;

use crate::peer::{ConnectionId, PeerHandle};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("username '{0}' is already taken")]
    AlreadyTaken(String),
}

/// Usernames of admitted sessions mapped to their connection handles.
///
/// Every operation runs inside one short critical section; nothing awaits while
/// the lock is held.
#[derive(Debug, Default)]
pub struct Registry {
    entries: Mutex<HashMap<String, PeerHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, PeerHandle>> {
        // A panic elsewhere cannot leave the map half-updated, so keep serving.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, username: &str, handle: PeerHandle) -> Result<(), RegisterError> {
        match self.entries().entry(username.to_string()) {
            Entry::Occupied(_) => Err(RegisterError::AlreadyTaken(username.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(handle);
                Ok(())
            }
        }
    }

    /// Removes `username` whichever connection holds it. Absent names are ignored.
    pub fn unregister(&self, username: &str) -> Option<PeerHandle> {
        self.entries().remove(username)
    }

    /// Removes `username` only while it still belongs to connection `id`, so a
    /// late cleanup never evicts a newer session that re-claimed the name.
    pub fn unregister_connection(&self, username: &str, id: ConnectionId) -> bool {
        let mut entries = self.entries();
        if entries.get(username).is_some_and(|handle| handle.id() == id) {
            entries.remove(username);
            true
        } else {
            false
        }
    }

    pub fn lookup(&self, username: &str) -> Option<PeerHandle> {
        self.entries().get(username).cloned()
    }

    pub fn snapshot_usernames(&self) -> BTreeSet<String> {
        self.entries().keys().cloned().collect()
    }

    pub fn snapshot(&self) -> Vec<(String, PeerHandle)> {
        self.entries()
            .iter()
            .map(|(username, handle)| (username.clone(), handle.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}
