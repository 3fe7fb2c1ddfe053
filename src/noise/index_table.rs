use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rand::rngs::{OsRng, StdRng};
use rand::{RngCore, SeedableRng};

/// A table of unique receiver indices shared by all peers of a device.
///
/// Incoming handshake responses and data messages carry one of these 32-bit
/// indices; the table resolves it back to the session `S` it was reserved
/// for. Indices are random so the total number of peers is not observable.
pub struct IndexTable<S> {
    inner: Arc<Mutex<Inner<S>>>,
}

struct Inner<S> {
    rng: StdRng,
    sessions: HashMap<u32, S>,
}

impl<S> Clone for IndexTable<S> {
    fn clone(&self) -> Self {
        IndexTable {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Clone> IndexTable<S> {
    pub fn new() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        IndexTable {
            inner: Arc::new(Mutex::new(Inner {
                rng: StdRng::from_seed(seed),
                sessions: HashMap::new(),
            })),
        }
    }

    /// Reserve a fresh index for `session`.
    ///
    /// Free indices are found by guessing; even a table with 2^31 entries
    /// usually needs only 1-2 attempts.
    pub fn insert(&self, session: S) -> u32 {
        let mut guard = self.inner.lock().unwrap();
        loop {
            let index = guard.rng.next_u32();
            if let std::collections::hash_map::Entry::Vacant(entry) = guard.sessions.entry(index) {
                entry.insert(session);
                return index;
            }
        }
    }

    /// Swap the session stored under an existing `index`.
    pub fn replace(&self, index: u32, session: S) {
        let mut guard = self.inner.lock().unwrap();
        guard.sessions.insert(index, session);
    }

    pub fn get(&self, index: u32) -> Option<S> {
        self.inner.lock().unwrap().sessions.get(&index).cloned()
    }

    /// Remove an index, making it available for reuse.
    pub fn remove(&self, index: u32) -> Option<S> {
        self.inner.lock().unwrap().sessions.remove(&index)
    }

    /// Remove every index whose session fails `keep`.
    pub fn retain(&self, keep: impl FnMut(&u32, &mut S) -> bool) {
        self.inner.lock().unwrap().sessions.retain(keep);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<S: Clone> Default for IndexTable<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::IndexTable;

    #[test]
    fn insert_get_remove() {
        let table = IndexTable::new();
        let a = table.insert("a");
        let b = table.insert("b");
        assert_ne!(a, b);

        assert_eq!(table.get(a), Some("a"));
        assert_eq!(table.remove(a), Some("a"));
        assert_eq!(table.get(a), None);
        assert_eq!(table.get(b), Some("b"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn replace_keeps_index() {
        let table = IndexTable::new();
        let idx = table.insert(1);
        table.replace(idx, 2);
        assert_eq!(table.get(idx), Some(2));
        assert_eq!(table.len(), 1);
    }
}
