//! Session resumption storage
//!
//! Session data holds resumption secrets. Every entry keeps its data in a
//! zeroizing buffer and is wiped when it is replaced, removed, or when the
//! cache itself goes away.
//!
//! [`SessionCache`] is single-owner. [`SharedSessionCache`] wraps it in a
//! mutex for use as the rustls session store.

use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rustls::server::StoresServerSessions;
use tracing::{debug, trace};
use zeroize::{Zeroize, Zeroizing};

/// One stored session
pub struct SessionCacheEntry {
    session_id: Vec<u8>,
    session_data: Zeroizing<Vec<u8>>,
    session_data_size: usize,
}

impl SessionCacheEntry {
    fn new(session_id: Vec<u8>, session_data: Vec<u8>) -> Self {
        let session_data_size = session_data.len();
        Self {
            session_id,
            session_data: Zeroizing::new(session_data),
            session_data_size,
        }
    }

    pub fn session_id(&self) -> &[u8] {
        &self.session_id
    }

    pub fn session_data(&self) -> &[u8] {
        &self.session_data[..self.session_data_size]
    }

    pub const fn session_data_size(&self) -> usize {
        self.session_data_size
    }

    fn erase(&mut self) {
        if self.session_data_size != 0 {
            self.session_data.zeroize();
            self.session_data_size = 0;
        }
    }
}

impl Drop for SessionCacheEntry {
    fn drop(&mut self) {
        self.erase();
    }
}

impl fmt::Debug for SessionCacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCacheEntry")
            .field("session_id", &hex::encode(&self.session_id))
            .field("session_data_size", &self.session_data_size)
            .finish_non_exhaustive()
    }
}

/// Map from session id to resumption state.
///
/// Not synchronized; see [`SharedSessionCache`] for a thread-safe handle.
#[derive(Default)]
pub struct SessionCache {
    entries: HashMap<Vec<u8>, SessionCacheEntry>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `session_data` under `session_id`.
    ///
    /// An existing entry for the same id is erased and replaced. Returns
    /// whether a previous entry was replaced.
    pub fn insert(&mut self, session_id: Vec<u8>, session_data: Vec<u8>) -> bool {
        let entry = SessionCacheEntry::new(session_id.clone(), session_data);
        // the displaced entry is wiped as it drops
        let replaced = self.entries.insert(session_id, entry).is_some();
        trace!(entries = self.entries.len(), replaced, "session stored");
        replaced
    }

    pub fn get(&self, session_id: &[u8]) -> Option<&[u8]> {
        self.entries
            .get(session_id)
            .map(SessionCacheEntry::session_data)
    }

    pub fn entry(&self, session_id: &[u8]) -> Option<&SessionCacheEntry> {
        self.entries.get(session_id)
    }

    /// Erase and drop the entry for `session_id`.
    pub fn remove(&mut self, session_id: &[u8]) -> bool {
        self.entries.remove(session_id).is_some()
    }

    /// Remove the entry for `session_id`, handing its data to the caller.
    ///
    /// The data moves out without being copied; the returned buffer is wiped
    /// when the caller drops it.
    pub fn take(&mut self, session_id: &[u8]) -> Option<Zeroizing<Vec<u8>>> {
        let mut entry = self.entries.remove(session_id)?;
        let mut data = mem::take(&mut *entry.session_data);
        data.truncate(entry.session_data_size);
        entry.session_data_size = 0;
        Some(Zeroizing::new(data))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Erase every entry and release the cache.
    pub fn destroy(mut self) {
        let erased = self.erase_all();
        debug!(erased, "session cache destroyed");
    }

    fn erase_all(&mut self) -> usize {
        let count = self.entries.len();
        for (_, mut entry) in self.entries.drain() {
            entry.erase();
        }
        self.entries.shrink_to_fit();
        count
    }
}

impl Drop for SessionCache {
    fn drop(&mut self) {
        self.erase_all();
    }
}

impl fmt::Debug for SessionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCache")
            .field("entries", &self.entries.len())
            .finish()
    }
}

/// Thread-safe session cache handle used as the rustls session store
#[derive(Debug, Clone, Default)]
pub struct SharedSessionCache {
    inner: Arc<Mutex<SessionCache>>,
    max_entries: Option<usize>,
}

impl SharedSessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse new sessions once `max_entries` are stored.
    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            inner: Arc::default(),
            max_entries: Some(max_entries),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionCache> {
        // a panic while holding the lock cannot leave an entry half-erased
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, session_id: &[u8]) -> bool {
        self.lock().entry(session_id).is_some()
    }

    /// Erase every stored session.
    pub fn clear(&self) {
        let erased = self.lock().erase_all();
        debug!(erased, "session cache cleared");
    }

    fn has_room_for(&self, cache: &SessionCache, session_id: &[u8]) -> bool {
        self.max_entries
            .is_none_or(|max| cache.len() < max || cache.entry(session_id).is_some())
    }
}

impl StoresServerSessions for SharedSessionCache {
    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> bool {
        let mut cache = self.lock();
        if !self.has_room_for(&cache, &key) {
            // dropping `value` here would leave the secret behind
            drop(Zeroizing::new(value));
            trace!("session cache full, not storing");
            return false;
        }
        cache.insert(key, value);
        true
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.lock().get(key).map(<[u8]>::to_vec)
    }

    fn take(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.lock()
            .take(key)
            .map(|mut data| mem::take(&mut *data))
    }

    fn can_cache(&self) -> bool {
        self.max_entries.is_none_or(|max| self.len() < max)
    }
}
