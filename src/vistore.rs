//! Isolated view of the block state for a single incarnation.
//!
//! A [VersionIndexedStore] buffers writes locally and resolves reads against its own
//! writes first, then the highest version below its index, then the parent store. It
//! records everything it observed so the incarnation can later be validated with
//! [MultiVersionStore::validate_transaction_state].
//!
//! Reading an estimate returns [Error::Estimate] and latches the [Abort] in the view, so
//! the executor learns about it even if transaction logic swallowed the error. Every
//! later read fails the same way. Dropping the view discards all of its state: nothing
//! reaches the shared store before [VersionIndexedStore::write_to_multiversion_store].

use crate::error::Error;
use crate::iterator::{self, MergeIterator};
use crate::mvstore::MultiVersionStore;
use crate::mvvalue::Status;
use crate::types::{
    Abort, Incarnation, IterateSet, IterationRecord, Key, KeyRange, ReadDescriptor, ReadSet,
    ReadSource, Store, TxnIndex, Value, Version, WriteSet,
};
use bytes::Bytes;
use std::cell::{Cell, RefCell};
use std::collections::btree_map::Entry::{Occupied, Vacant};
use std::sync::Arc;
use tracing::trace;

pub struct VersionIndexedStore<S: Store> {
    mvs: Arc<MultiVersionStore<S>>,
    version: Version,
    readset: RefCell<ReadSet>,
    writeset: RefCell<WriteSet>,
    iterateset: RefCell<IterateSet>,
    abort: Cell<Option<Abort>>,
}

impl<S: Store> VersionIndexedStore<S> {
    pub fn new(mvs: Arc<MultiVersionStore<S>>, version: Version) -> Self {
        Self {
            mvs,
            version,
            readset: Default::default(),
            writeset: Default::default(),
            iterateset: Default::default(),
            abort: Cell::new(None),
        }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn index(&self) -> TxnIndex {
        self.version.index
    }

    pub fn incarnation(&self) -> Incarnation {
        self.version.incarnation
    }

    /// The first estimate this incarnation ran into, if any.
    pub fn abort(&self) -> Option<Abort> {
        self.abort.get()
    }

    pub fn readset(&self) -> ReadSet {
        self.readset.borrow().clone()
    }

    pub fn writeset(&self) -> WriteSet {
        self.writeset.borrow().clone()
    }

    pub fn iterateset(&self) -> IterateSet {
        self.iterateset.borrow().clone()
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Value>, Error> {
        self.check(key)?;
        if let Some(value) = self.writeset.borrow().get(key) {
            return Ok(value.clone());
        }

        let (source, value) = match self.mvs.get_latest_before(self.version.index, key) {
            Some(item) => match item.status {
                Status::Estimate => return Err(self.signal_abort(item.index)),
                Status::Deleted => (ReadSource::Transaction(item.index), None),
                Status::Written(value) => (ReadSource::Transaction(item.index), Some(value)),
            },
            None => (ReadSource::Storage, self.mvs.parent().get(key)?),
        };
        self.record_read(key, source, value.clone());
        Ok(value)
    }

    pub fn has(&self, key: &[u8]) -> Result<bool, Error> {
        Ok(self.get(key)?.is_some())
    }

    pub fn set(&self, key: Key, value: Value) -> Result<(), Error> {
        self.check(&key)?;
        self.writeset.borrow_mut().insert(key, Some(value));
        Ok(())
    }

    pub fn delete(&self, key: &[u8]) -> Result<(), Error> {
        self.check(key)?;
        self.writeset
            .borrow_mut()
            .insert(Bytes::copy_from_slice(key), None);
        Ok(())
    }

    pub fn iterator(&self, range: KeyRange) -> Result<TrackedIterator<'_, S>, Error> {
        self.iterate(range, true)
    }

    pub fn reverse_iterator(&self, range: KeyRange) -> Result<TrackedIterator<'_, S>, Error> {
        self.iterate(range, false)
    }

    /// Publish the read, iterate and write sets at this view's version.
    ///
    /// Publishing the same incarnation twice leaves the shared store unchanged. Returns
    /// whether a key this index did not write before was written.
    ///
    /// # Panics
    ///
    /// Panics if the incarnation was aborted.
    pub fn write_to_multiversion_store(&self) -> bool {
        assert!(
            self.abort.get().is_none(),
            "aborted incarnation {:?} must not be published",
            self.version
        );
        let index = self.version.index;
        self.mvs.set_readset(index, self.readset.borrow().clone());
        self.mvs.set_iterateset(index, self.iterateset.borrow().clone());
        self.mvs.set_writeset(self.version, &self.writeset.borrow())
    }

    fn check(&self, key: &[u8]) -> Result<(), Error> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        match self.abort.get() {
            Some(abort) => Err(Error::Estimate(abort)),
            None => Ok(()),
        }
    }

    fn iterate(&self, range: KeyRange, ascending: bool) -> Result<TrackedIterator<'_, S>, Error> {
        if let Some(abort) = self.abort.get() {
            return Err(Error::Estimate(abort));
        }

        let versions = self.mvs.collect_iterator_items(self.version.index, &range);
        let writeset: WriteSet = self
            .writeset
            .borrow()
            .range(range.bounds())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let entries = iterator::overlay(versions, &writeset, ascending);
        let parent = self.mvs.parent().iterator(&range, ascending)?;

        Ok(TrackedIterator {
            store: self,
            inner: MergeIterator::new(parent, entries, ascending),
            record: Some(IterationRecord {
                range,
                ascending,
                writeset,
                keys: Vec::new(),
                early_stop: None,
            }),
            exhausted: false,
        })
    }

    fn record_read(&self, key: &[u8], source: ReadSource, value: Option<Value>) {
        let mut readset = self.readset.borrow_mut();
        match readset.entry(Bytes::copy_from_slice(key)) {
            Vacant(v) => {
                v.insert(ReadDescriptor {
                    source,
                    value,
                    inconsistent: false,
                });
            }
            Occupied(o) => {
                let o = o.into_mut();
                if o.source != source || o.value != value {
                    o.inconsistent = true;
                }
            }
        }
    }

    fn signal_abort(&self, dependent: TxnIndex) -> Error {
        let abort = Abort { dependent };
        if self.abort.get().is_none() {
            trace!(
                index = self.version.index,
                incarnation = self.version.incarnation,
                dependent,
                "read estimate"
            );
            self.abort.set(Some(abort));
        }
        Error::Estimate(abort)
    }
}

/// Iterator over a [VersionIndexedStore] that records the keys it yields.
///
/// Every value yielded from a lower transaction or the parent is also added to the
/// view's read set, so a later change to it fails validation.
///
/// The record is added to the view's iterate set when the iterator is closed or
/// dropped. If it was not exhausted, the last yielded key is kept as the early-stop
/// point. An iterator dropped before yielding anything observed nothing and leaves no
/// record.
///
/// The multi-version range and the parent range are materialized on creation, so the
/// shared store and the parent may be written while the iterator is open. Those writes
/// are not reflected; validation replays the iteration against the current state.
pub struct TrackedIterator<'a, S: Store> {
    store: &'a VersionIndexedStore<S>,
    inner: MergeIterator<'a>,
    record: Option<IterationRecord>,
    exhausted: bool,
}

impl<S: Store> TrackedIterator<'_, S> {
    pub fn close(self) {}
}

impl<S: Store> Iterator for TrackedIterator<'_, S> {
    type Item = Result<(Key, Value), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        match self.inner.next_read() {
            Some(Ok((key, value, source))) => {
                // Yielded values are validated like point reads
                if let Some(source) = source {
                    self.store.record_read(&key, source, Some(value.clone()));
                }
                if let Some(record) = self.record.as_mut() {
                    record.keys.push(key.clone());
                }
                Some(Ok((key, value)))
            }
            Some(Err(err)) => {
                if let Some(abort) = err.abort() {
                    self.store.signal_abort(abort.dependent);
                }
                self.exhausted = true;
                Some(Err(err))
            }
            None => {
                self.exhausted = true;
                None
            }
        }
    }
}

impl<S: Store> Drop for TrackedIterator<'_, S> {
    fn drop(&mut self) {
        let Some(mut record) = self.record.take() else {
            return;
        };
        if !self.exhausted {
            if record.keys.is_empty() {
                return;
            }
            record.early_stop = record.keys.last().cloned();
        }
        self.store.iterateset.borrow_mut().push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memdb::MemDb;

    fn mvs(items: &[(&'static str, &'static str)]) -> Arc<MultiVersionStore<MemDb>> {
        Arc::new(MultiVersionStore::new(Arc::new(items.iter().copied().collect())))
    }

    fn publish(
        mvs: &Arc<MultiVersionStore<MemDb>>,
        index: TxnIndex,
        items: &[(&'static str, Option<&'static str>)],
    ) {
        let store = mvs.versioned_indexed_store(Version::new(index, 0));
        for (key, value) in items {
            match value {
                Some(value) => store.set(Bytes::from(*key), Bytes::from(*value)).unwrap(),
                None => store.delete(key.as_bytes()).unwrap(),
            }
        }
        store.write_to_multiversion_store();
    }

    fn keys(iter: TrackedIterator<'_, MemDb>) -> Vec<Key> {
        iter.map(|item| item.unwrap().0).collect()
    }

    #[test]
    fn test_read_falls_back_to_parent() {
        let mvs = mvs(&[("a", "base")]);
        let store = mvs.versioned_indexed_store(Version::new(3, 0));
        assert_eq!(store.get(b"a").unwrap(), Some(Bytes::from("base")));
        assert_eq!(store.get(b"b").unwrap(), None);

        let readset = store.readset();
        assert_eq!(readset[&Bytes::from("a")].source, ReadSource::Storage);
        assert_eq!(readset[&Bytes::from("b")].value, None);
    }

    #[test]
    fn test_read_isolation() {
        let mvs = mvs(&[("x", "base")]);
        publish(&mvs, 2, &[("x", Some("two"))]);
        publish(&mvs, 5, &[("x", Some("five"))]);

        for (index, expected) in [(0, "base"), (2, "base"), (3, "two"), (5, "two"), (6, "five")] {
            let store = mvs.versioned_indexed_store(Version::new(index, 0));
            assert_eq!(store.get(b"x").unwrap(), Some(Bytes::from(expected)), "index {index}");
        }
    }

    #[test]
    fn test_own_write_visibility() {
        let mvs = mvs(&[("x", "base")]);
        publish(&mvs, 1, &[("x", Some("one"))]);

        let store = mvs.versioned_indexed_store(Version::new(4, 0));
        store.set(Bytes::from("x"), Bytes::from("mine")).unwrap();
        assert_eq!(store.get(b"x").unwrap(), Some(Bytes::from("mine")));
        store.delete(b"x").unwrap();
        assert_eq!(store.get(b"x").unwrap(), None);
        assert!(!store.has(b"x").unwrap());

        // Reads served by the writeset are not recorded
        assert!(store.readset().is_empty());
        // Nothing reached the shared store
        assert_eq!(mvs.get_latest_before(5, b"x").unwrap().index, 1);
    }

    #[test]
    fn test_deleted_version_hides_parent() {
        let mvs = mvs(&[("x", "base")]);
        publish(&mvs, 1, &[("x", None)]);
        let store = mvs.versioned_indexed_store(Version::new(2, 0));
        assert_eq!(store.get(b"x").unwrap(), None);
        assert_eq!(store.readset()[&Bytes::from("x")].source, ReadSource::Transaction(1));
    }

    #[test]
    fn test_estimate_aborts() {
        let mvs = mvs(&[]);
        publish(&mvs, 3, &[("x", Some("1"))]);
        mvs.invalidate(3);

        let store = mvs.versioned_indexed_store(Version::new(7, 0));
        let err = store.get(b"x").unwrap_err();
        assert_eq!(err, Error::Estimate(Abort { dependent: 3 }));
        assert_eq!(store.abort(), Some(Abort { dependent: 3 }));

        // Later operations on the aborted view fail with the same abort
        assert_eq!(store.get(b"y"), Err(Error::Estimate(Abort { dependent: 3 })));
        assert!(store.iterator(KeyRange::full()).is_err());
    }

    #[test]
    fn test_empty_key() {
        let mvs = mvs(&[]);
        let store = mvs.versioned_indexed_store(Version::new(0, 0));
        assert_eq!(store.get(b""), Err(Error::EmptyKey));
        assert_eq!(store.set(Bytes::new(), Bytes::from("v")), Err(Error::EmptyKey));
        assert_eq!(store.delete(b""), Err(Error::EmptyKey));
    }

    #[test]
    fn test_inconsistent_repeated_read() {
        let mvs = mvs(&[]);
        let store = mvs.versioned_indexed_store(Version::new(5, 0));
        assert_eq!(store.get(b"x").unwrap(), None);
        publish(&mvs, 2, &[("x", Some("1"))]);
        assert_eq!(store.get(b"x").unwrap(), Some(Bytes::from("1")));
        assert!(store.readset()[&Bytes::from("x")].inconsistent);
    }

    #[test]
    fn test_iterator_merges_layers() {
        let mvs = mvs(&[("a", "p"), ("b", "p"), ("c", "p"), ("f", "p")]);
        publish(&mvs, 1, &[("b", None), ("d", Some("mv"))]);
        publish(&mvs, 9, &[("e", Some("later"))]);

        let store = mvs.versioned_indexed_store(Version::new(4, 0));
        store.set(Bytes::from("c"), Bytes::from("own")).unwrap();
        store.delete(b"f").unwrap();

        let items: Vec<(Key, Value)> = store
            .iterator(KeyRange::full())
            .unwrap()
            .map(|item| item.unwrap())
            .collect();
        assert_eq!(
            items,
            vec![
                (Bytes::from("a"), Bytes::from("p")),
                (Bytes::from("c"), Bytes::from("own")),
                (Bytes::from("d"), Bytes::from("mv")),
            ]
        );

        let reversed = keys(store.reverse_iterator(KeyRange::full()).unwrap());
        assert_eq!(reversed, vec!["d", "c", "a"]);

        let iterateset = store.iterateset();
        assert_eq!(iterateset.len(), 2);
        assert!(iterateset[0].ascending);
        assert!(!iterateset[1].ascending);
        assert_eq!(iterateset[0].early_stop, None);
        assert_eq!(iterateset[0].writeset.len(), 2);
    }

    #[test]
    fn test_iterator_records_yielded_reads() {
        let mvs = mvs(&[("a", "p"), ("b", "p")]);
        publish(&mvs, 1, &[("d", Some("mv"))]);

        let store = mvs.versioned_indexed_store(Version::new(4, 0));
        store.set(Bytes::from("b"), Bytes::from("own")).unwrap();
        assert_eq!(keys(store.iterator(KeyRange::full()).unwrap()), vec!["a", "b", "d"]);

        let readset = store.readset();
        assert_eq!(readset.len(), 2);
        assert_eq!(readset[&Bytes::from("a")].source, ReadSource::Storage);
        assert_eq!(readset[&Bytes::from("a")].value, Some(Bytes::from("p")));
        assert_eq!(readset[&Bytes::from("d")].source, ReadSource::Transaction(1));
        assert_eq!(readset[&Bytes::from("d")].value, Some(Bytes::from("mv")));
    }

    #[test]
    fn test_iterator_early_stop() {
        let mvs = mvs(&[("a", "1"), ("b", "2"), ("c", "3")]);
        let store = mvs.versioned_indexed_store(Version::new(0, 0));

        let mut iter = store.iterator(KeyRange::full()).unwrap();
        assert_eq!(iter.next().unwrap().unwrap().0, "a");
        assert_eq!(iter.next().unwrap().unwrap().0, "b");
        iter.close();

        // Never advanced: nothing observed
        let iter = store.iterator(KeyRange::full()).unwrap();
        drop(iter);

        let iterateset = store.iterateset();
        assert_eq!(iterateset.len(), 1);
        assert_eq!(iterateset[0].keys, vec!["a", "b"]);
        assert_eq!(iterateset[0].early_stop, Some(Bytes::from("b")));
    }

    #[test]
    fn test_empty_iteration_is_recorded() {
        let mvs = mvs(&[("a", "1")]);
        let store = mvs.versioned_indexed_store(Version::new(0, 0));
        let range = KeyRange::new(Some(Bytes::from("m")), Some(Bytes::from("z")));
        assert!(keys(store.iterator(range).unwrap()).is_empty());

        let iterateset = store.iterateset();
        assert_eq!(iterateset.len(), 1);
        assert!(iterateset[0].keys.is_empty());
        assert_eq!(iterateset[0].early_stop, None);
    }

    #[test]
    fn test_iterator_hits_estimate() {
        let mvs = mvs(&[("a", "1"), ("c", "3")]);
        publish(&mvs, 1, &[("b", Some("2"))]);
        mvs.invalidate(1);

        let store = mvs.versioned_indexed_store(Version::new(2, 0));
        let mut iter = store.iterator(KeyRange::full()).unwrap();
        assert_eq!(iter.next().unwrap().unwrap().0, "a");
        assert_eq!(
            iter.next().unwrap(),
            Err(Error::Estimate(Abort { dependent: 1 }))
        );
        assert!(iter.next().is_none());
        drop(iter);
        assert_eq!(store.abort(), Some(Abort { dependent: 1 }));
    }

    #[test]
    fn test_writes_during_iteration() {
        let mvs = mvs(&[("a", "1"), ("c", "3")]);
        let store = mvs.versioned_indexed_store(Version::new(5, 0));
        let mut iter = store.iterator(KeyRange::full()).unwrap();
        assert_eq!(iter.next().unwrap().unwrap().0, "a");

        // Own writes, shared store writes and parent writes while the iterator is open
        store.set(Bytes::from("b"), Bytes::from("own")).unwrap();
        publish(&mvs, 1, &[("bb", Some("mv")), ("c", None)]);
        mvs.parent().set(Bytes::from("ab"), Bytes::from("p")).unwrap();

        let rest: Vec<Key> = iter.map(|item| item.unwrap().0).collect();
        assert_eq!(rest, vec!["c"]);

        // A new iterator sees everything
        assert_eq!(keys(store.iterator(KeyRange::full()).unwrap()), vec!["a", "ab", "b", "bb"]);
    }

    #[test]
    fn test_own_writes_after_iteration_do_not_conflict() {
        let mvs = mvs(&[("a", "1")]);
        let store = mvs.versioned_indexed_store(Version::new(1, 0));
        assert_eq!(keys(store.iterator(KeyRange::full()).unwrap()), vec!["a"]);
        store.set(Bytes::from("b"), Bytes::from("2")).unwrap();
        store.write_to_multiversion_store();

        assert!(mvs.validate_transaction_state(1).valid);
    }

    #[test]
    fn test_publish_idempotent() {
        let mvs = mvs(&[]);
        let store = mvs.versioned_indexed_store(Version::new(2, 0));
        store.set(Bytes::from("x"), Bytes::from("1")).unwrap();
        assert!(store.write_to_multiversion_store());
        assert!(!store.write_to_multiversion_store());
        assert_eq!(mvs.get_latest(b"x").unwrap().value(), Some(&Bytes::from("1")));
    }

    #[test]
    #[should_panic(expected = "must not be published")]
    fn test_publish_aborted_panics() {
        let mvs = mvs(&[]);
        publish(&mvs, 0, &[("x", Some("1"))]);
        mvs.invalidate(0);
        let store = mvs.versioned_indexed_store(Version::new(1, 0));
        let _ = store.get(b"x");
        store.write_to_multiversion_store();
    }
}
