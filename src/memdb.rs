//! In-memory ordered key-value store.
//!
//! [MemDb] is the reference parent store: committed state as of the start of a block.
//! Iterators materialize their range when created, so writes issued while an iterator
//! is open are never observed by it and never invalidate it.

use crate::error::Error;
use crate::types::{Key, KeyRange, KvIterator, Store, Value};
use parking_lot::RwLock;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct MemDb {
    data: RwLock<BTreeMap<Key, Value>>,
}

impl MemDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Copy of the full contents, in key order.
    pub fn snapshot(&self) -> BTreeMap<Key, Value> {
        self.data.read().clone()
    }
}

impl<K, V> FromIterator<(K, V)> for MemDb
where
    K: Into<Key>,
    V: Into<Value>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let data = iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self {
            data: RwLock::new(data),
        }
    }
}

impl Store for MemDb {
    fn get(&self, key: &[u8]) -> Result<Option<Value>, Error> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        Ok(self.data.read().get(key).cloned())
    }

    fn set(&self, key: Key, value: Value) -> Result<(), Error> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        self.data.write().insert(key, value);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), Error> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        self.data.write().remove(key);
        Ok(())
    }

    fn iterator(&self, range: &KeyRange, ascending: bool) -> Result<KvIterator<'_>, Error> {
        let data = self.data.read();
        let mut items: Vec<(Key, Value)> = data
            .range(range.bounds())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        drop(data);

        if !ascending {
            items.reverse();
        }
        Ok(Box::new(items.into_iter().map(Ok)))
    }
}
