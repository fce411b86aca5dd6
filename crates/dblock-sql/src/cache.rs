use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Read-mostly cache of prepared statements.
///
/// Lookups take the read lock only. On a miss the statement is prepared with
/// no lock held, then inserted under the write lock after a second lookup; if
/// another caller prepared the same key in the meantime, the freshly prepared
/// copy is dropped and the cached one is returned.
#[derive(Debug)]
pub struct StatementCache<K, V> {
    entries: RwLock<HashMap<K, Arc<V>>>,
}

impl<K, V> Default for StatementCache<K, V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone, V> StatementCache<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.read().get(key).cloned()
    }

    /// Return the cached statement for `key`, preparing it on a miss.
    ///
    /// A failed `prepare` caches nothing.
    pub fn get_or_prepare<E>(
        &self,
        key: &K,
        prepare: impl FnOnce(&K) -> Result<V, E>,
    ) -> Result<Arc<V>, E> {
        if let Some(stmt) = self.get(key) {
            return Ok(stmt);
        }

        let prepared = Arc::new(prepare(key)?);

        let mut entries = self.write();
        if let Some(existing) = entries.get(key) {
            return Ok(existing.clone());
        }
        entries.insert(key.clone(), prepared.clone());
        Ok(prepared)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Evict every statement, returning how many were cached.
    ///
    /// Statements still referenced by callers stay alive until those
    /// references are dropped.
    pub fn clear(&self) -> usize {
        let mut entries = self.write();
        let evicted = entries.len();
        entries.clear();
        evicted
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<K, Arc<V>>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<K, Arc<V>>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}
