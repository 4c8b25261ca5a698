use crate::error::Error;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::ops::Bound;

/// Position of a transaction within the block.
pub type TxnIndex = usize;

/// Execution attempt of a transaction. Monotonically increasing per [TxnIndex].
pub type Incarnation = usize;

pub type Key = Bytes;
pub type Value = Bytes;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Version {
    pub index: TxnIndex,
    pub incarnation: Incarnation,
}

impl Version {
    pub fn new(index: TxnIndex, incarnation: Incarnation) -> Self {
        Self { index, incarnation }
    }
}

/// Raised when a read hits an estimate: the value written by `dependent` is
/// being recomputed, so the reader cannot make progress until it finishes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Abort {
    pub dependent: TxnIndex,
}

/// Half-open key range `[start, end)`. `None` leaves that side unbounded.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyRange {
    pub start: Option<Key>,
    pub end: Option<Key>,
}

impl KeyRange {
    pub fn new(start: Option<Key>, end: Option<Key>) -> Self {
        Self { start, end }
    }

    pub fn full() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        if let Some(start) = &self.start {
            if key < start.as_ref() {
                return false;
            }
        }
        if let Some(end) = &self.end {
            if key >= end.as_ref() {
                return false;
            }
        }
        true
    }

    /// Bounds usable with [BTreeMap::range]. An inverted range maps to an empty one.
    pub fn bounds(&self) -> (Bound<Key>, Bound<Key>) {
        match (&self.start, &self.end) {
            (Some(start), Some(end)) if start >= end => {
                (Bound::Included(start.clone()), Bound::Excluded(start.clone()))
            }
            _ => (
                self.start.clone().map_or(Bound::Unbounded, Bound::Included),
                self.end.clone().map_or(Bound::Unbounded, Bound::Excluded),
            ),
        }
    }
}

/// Where a read was served from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReadSource {
    /// The parent store, no lower transaction wrote the key.
    Storage,
    /// The version written by the transaction at this index.
    Transaction(TxnIndex),
}

impl ReadSource {
    pub fn index(&self) -> Option<TxnIndex> {
        match self {
            ReadSource::Storage => None,
            ReadSource::Transaction(index) => Some(*index),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadDescriptor {
    pub source: ReadSource,
    /// `None` when the key was absent or deleted.
    pub value: Option<Value>,
    /// Set when the same key was read twice with different results.
    pub inconsistent: bool,
}

pub type ReadSet = BTreeMap<Key, ReadDescriptor>;

/// Pending writes of an incarnation. `None` marks a deletion.
pub type WriteSet = BTreeMap<Key, Option<Value>>;

/// One iterator opened by an incarnation and what it observed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IterationRecord {
    pub range: KeyRange,
    pub ascending: bool,
    /// In-range own writes at the time the iterator was created.
    pub writeset: WriteSet,
    /// Keys yielded, in order.
    pub keys: Vec<Key>,
    /// Last key yielded before the iterator was closed without being exhausted.
    pub early_stop: Option<Key>,
}

pub type IterateSet = Vec<IterationRecord>;

/// Boxed iterator returned by [Store::iterator].
pub type KvIterator<'a> = Box<dyn Iterator<Item = Result<(Key, Value), Error>> + Send + 'a>;

/// Ordered key-value store used as the parent (committed) state of a block.
///
/// All methods take `&self`; implementations synchronize internally so the same
/// store can be read by many workers while an external collaborator writes to it.
pub trait Store: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Value>, Error>;

    fn has(&self, key: &[u8]) -> Result<bool, Error> {
        Ok(self.get(key)?.is_some())
    }

    fn set(&self, key: Key, value: Value) -> Result<(), Error>;

    fn delete(&self, key: &[u8]) -> Result<(), Error>;

    /// Iterate over `range` in ascending or descending key order.
    ///
    /// The returned iterator must remain usable while the store is written to.
    fn iterator(&self, range: &KeyRange, ascending: bool) -> Result<KvIterator<'_>, Error>;
}

/// Transaction logic run against a per-incarnation view.
pub trait Vm<S: Store>: Sync {
    type Output: Send;

    /// Execute the transaction at `index`. Any [Error::Estimate] returned by the
    /// view should be propagated; the executor also observes it out-of-band.
    fn execute(
        &self,
        index: TxnIndex,
        store: &crate::vistore::VersionIndexedStore<S>,
    ) -> Result<Self::Output, Error>;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TaskKind {
    Execution,
    Validation,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Task {
    pub kind: TaskKind,
    pub version: Version,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_range_contains() {
        let range = KeyRange::new(Some(Bytes::from("b")), Some(Bytes::from("d")));
        assert!(!range.contains(b"a"));
        assert!(range.contains(b"b"));
        assert!(range.contains(b"c"));
        assert!(range.contains(b"cz"));
        assert!(!range.contains(b"d"));

        let full = KeyRange::full();
        assert!(full.contains(b""));
        assert!(full.contains(b"zzz"));
    }

    #[test]
    fn test_inverted_range_is_empty() {
        let range = KeyRange::new(Some(Bytes::from("d")), Some(Bytes::from("b")));
        let map: BTreeMap<Key, ()> = [("a", ()), ("c", ()), ("e", ())]
            .into_iter()
            .map(|(k, v)| (Bytes::from(k), v))
            .collect();
        assert_eq!(map.range(range.bounds()).count(), 0);
    }
}
