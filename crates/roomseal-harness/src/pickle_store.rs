//! In-memory pickle persistence.

#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use roomseal_core::{PickleStore, TransportError};

/// Pickle store backed by a `HashMap`, with one injectable write failure.
///
/// Clones share storage.
#[derive(Clone, Default)]
pub struct MemoryPickleStore {
    inner: Arc<Mutex<MemoryPickleStoreInner>>,
}

#[derive(Default)]
struct MemoryPickleStoreInner {
    pickles: HashMap<String, Vec<u8>>,
    fail_next_write: Option<TransportError>,
}

impl MemoryPickleStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `persist_pickle` with `error`.
    pub fn fail_next_write(&self, error: TransportError) {
        self.inner.lock().expect("Mutex poisoned").fail_next_write = Some(error);
    }

    /// Raw stored bytes, for tamper tests.
    pub fn raw(&self, identity_id: &str) -> Option<Vec<u8>> {
        self.inner.lock().expect("Mutex poisoned").pickles.get(identity_id).cloned()
    }

    /// Overwrite stored bytes, bypassing the engine.
    pub fn set_raw(&self, identity_id: &str, pickle: Vec<u8>) {
        self.inner.lock().expect("Mutex poisoned").pickles.insert(identity_id.to_string(), pickle);
    }

    /// Number of stored pickles.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("Mutex poisoned").pickles.len()
    }

    /// True if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PickleStore for MemoryPickleStore {
    fn persist_pickle(&self, identity_id: &str, pickle: &[u8]) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");
        if let Some(error) = inner.fail_next_write.take() {
            return Err(error);
        }
        inner.pickles.insert(identity_id.to_string(), pickle.to_vec());
        Ok(())
    }

    fn load_pickle(&self, identity_id: &str) -> Result<Option<Vec<u8>>, TransportError> {
        Ok(self.inner.lock().expect("Mutex poisoned").pickles.get(identity_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_failure_is_one_shot() {
        let store = MemoryPickleStore::new();
        store.fail_next_write(TransportError::Timeout);

        assert_eq!(store.persist_pickle("id", b"x"), Err(TransportError::Timeout));
        assert!(store.is_empty());

        store.persist_pickle("id", b"x").unwrap();
        assert_eq!(store.load_pickle("id").unwrap(), Some(b"x".to_vec()));
    }
}
