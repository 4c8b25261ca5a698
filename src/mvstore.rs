//! Multi-version store shared by every transaction of a block.
//!
//! Each key maps to a [MultiVersionValue] holding at most one version per transaction
//! index. Transactions publish their write set at `(index, incarnation)`, and readers at
//! index `i` observe the highest version strictly below `i`, falling back to the parent
//! store. After a transaction publishes, its recorded reads and iterations can be
//! replayed against the current versions to decide whether its execution is still
//! consistent with the block order.
//!
//! # Determinism
//!
//! Validation is a single sequential pass over the read set and the iterate set. An
//! estimate met while replaying an iteration is detected inline and invalidates the
//! transaction immediately; there is no concurrent helper whose signal could arrive
//! after a successful result. Given the same versions and the same recorded sets, two
//! validations always return the same [Validation].

use crate::error::Error;
use crate::iterator::{self, MergeIterator};
use crate::mvvalue::{MultiVersionValue, Status, ValueItem};
use crate::types::{
    Incarnation, IterateSet, IterationRecord, Key, KeyRange, ReadDescriptor, ReadSet, ReadSource,
    Store, TxnIndex, Version, WriteSet,
};
use crate::vistore::VersionIndexedStore;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Outcome of [MultiVersionStore::validate_transaction_state].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Validation {
    pub valid: bool,
    /// Lower transactions whose versions explain the mismatch.
    pub conflicts: BTreeSet<TxnIndex>,
}

pub struct MultiVersionStore<S: Store> {
    data: RwLock<BTreeMap<Key, Arc<MultiVersionValue>>>,
    /// Keys last published (or estimated) by each index, sorted.
    writesets: DashMap<TxnIndex, (Incarnation, Vec<Key>)>,
    readsets: DashMap<TxnIndex, ReadSet>,
    iteratesets: DashMap<TxnIndex, IterateSet>,
    parent: Arc<S>,
}

impl<S: Store> MultiVersionStore<S> {
    pub fn new(parent: Arc<S>) -> Self {
        Self {
            data: Default::default(),
            writesets: DashMap::new(),
            readsets: DashMap::new(),
            iteratesets: DashMap::new(),
            parent,
        }
    }

    pub fn parent(&self) -> &Arc<S> {
        &self.parent
    }

    /// Create the isolated view for one incarnation.
    pub fn versioned_indexed_store(self: &Arc<Self>, version: Version) -> VersionIndexedStore<S> {
        VersionIndexedStore::new(self.clone(), version)
    }

    pub fn get_latest(&self, key: &[u8]) -> Option<ValueItem> {
        self.chain(key)?.get_latest()
    }

    /// The version of `key` visible to the transaction at `index`.
    pub fn get_latest_before(&self, index: TxnIndex, key: &[u8]) -> Option<ValueItem> {
        self.chain(key)?.get_latest_before(index)
    }

    /// Whether any transaction below `index` wrote `key`.
    pub fn has(&self, index: TxnIndex, key: &[u8]) -> bool {
        self.get_latest_before(index, key).is_some()
    }

    /// Publish the write set of `version`, replacing what the same index published
    /// before. Keys written by an earlier incarnation but not by this one are removed.
    ///
    /// Returns whether a key not previously written by this index was written.
    pub fn set_writeset(&self, version: Version, writeset: &WriteSet) -> bool {
        for (key, value) in writeset {
            let chain = self.chain_or_create(key);
            match value {
                Some(value) => chain.set(version.index, version.incarnation, value.clone()),
                None => chain.delete(version.index, version.incarnation),
            }
        }

        let keys: Vec<Key> = writeset.keys().cloned().collect();
        let previous = self
            .writesets
            .insert(version.index, (version.incarnation, keys));
        let wrote_new_location = match previous {
            Some((_, previous)) => {
                for key in &previous {
                    if !writeset.contains_key(key) {
                        self.chain(key)
                            .expect("previously written key must have versions")
                            .remove(version.index);
                    }
                }
                writeset
                    .keys()
                    .any(|key| previous.binary_search(key).is_err())
            }
            None => !writeset.is_empty(),
        };

        debug!(
            index = version.index,
            incarnation = version.incarnation,
            keys = writeset.len(),
            wrote_new_location,
            "published writeset"
        );
        wrote_new_location
    }

    /// Mark keys expected to be written by `version` as estimates before it runs, so
    /// higher transactions wait for it instead of reading stale values.
    pub fn set_estimated_writeset(&self, version: Version, keys: impl IntoIterator<Item = Key>) {
        let keys: BTreeSet<Key> = keys.into_iter().collect();
        for key in &keys {
            self.chain_or_create(key)
                .set_estimate(version.index, version.incarnation);
        }
        let keys: Vec<Key> = keys.into_iter().collect();
        if let Some((_, previous)) = self
            .writesets
            .insert(version.index, (version.incarnation, keys.clone()))
        {
            for key in previous {
                if keys.binary_search(&key).is_err() {
                    if let Some(chain) = self.chain(&key) {
                        chain.remove(version.index);
                    }
                }
            }
        }
    }

    /// Turn every version published by `version` into an estimate.
    pub fn invalidate_writeset(&self, version: Version) {
        let keys = match self.writesets.get(&version.index) {
            Some(entry) => entry.1.clone(),
            None => return,
        };
        for key in &keys {
            self.chain(key)
                .unwrap_or_else(|| panic!("written key {key:?} has no versions"))
                .set_estimate(version.index, version.incarnation);
        }
        debug!(
            index = version.index,
            incarnation = version.incarnation,
            keys = keys.len(),
            "invalidated writeset"
        );
    }

    /// Invalidate the last published write set of `index`, if any.
    pub fn invalidate(&self, index: TxnIndex) {
        let incarnation = match self.writesets.get(&index) {
            Some(entry) => entry.0,
            None => return,
        };
        self.invalidate_writeset(Version::new(index, incarnation));
    }

    /// Keys last published by every index.
    pub fn get_all_writeset_keys(&self) -> BTreeMap<TxnIndex, Vec<Key>> {
        self.writesets
            .iter()
            .map(|entry| (*entry.key(), entry.value().1.clone()))
            .collect()
    }

    pub fn set_readset(&self, index: TxnIndex, readset: ReadSet) {
        self.readsets.insert(index, readset);
    }

    pub fn get_readset(&self, index: TxnIndex) -> Option<ReadSet> {
        self.readsets.get(&index).map(|entry| entry.value().clone())
    }

    pub fn clear_readset(&self, index: TxnIndex) {
        self.readsets.remove(&index);
    }

    pub fn set_iterateset(&self, index: TxnIndex, iterateset: IterateSet) {
        self.iteratesets.insert(index, iterateset);
    }

    pub fn get_iterateset(&self, index: TxnIndex) -> Option<IterateSet> {
        self.iteratesets.get(&index).map(|entry| entry.value().clone())
    }

    pub fn clear_iterateset(&self, index: TxnIndex) {
        self.iteratesets.remove(&index);
    }

    /// Versions in `range` visible to `index`, in ascending key order.
    ///
    /// The key map lock is held only while the range is materialized.
    pub fn collect_iterator_items(
        &self,
        index: TxnIndex,
        range: &KeyRange,
    ) -> Vec<(Key, ValueItem)> {
        let data = self.data.read();
        data.range(range.bounds())
            .filter_map(|(key, chain)| {
                chain
                    .get_latest_before(index)
                    .map(|item| (key.clone(), item))
            })
            .collect()
    }

    /// Check that what `index` observed during its last published incarnation still
    /// matches the versions below it.
    pub fn validate_transaction_state(&self, index: TxnIndex) -> Validation {
        let mut validation = Validation {
            valid: true,
            conflicts: BTreeSet::new(),
        };

        if let Some(iterateset) = self.get_iterateset(index) {
            for record in &iterateset {
                if !self.validate_iteration(index, record, &mut validation.conflicts) {
                    validation.valid = false;
                }
            }
        }
        if let Some(readset) = self.get_readset(index) {
            for (key, read) in &readset {
                if !self.validate_read(index, key, read, &mut validation.conflicts) {
                    validation.valid = false;
                }
            }
        }

        if !validation.valid {
            trace!(index, conflicts = ?validation.conflicts, "validation failed");
        }
        validation
    }

    /// Flush the latest version of every key into the parent store.
    ///
    /// # Panics
    ///
    /// Panics if an estimate is still present: every aborted transaction must have
    /// been re-executed before the block is finalized.
    pub fn write_latest_to_store(&self) -> Result<(), Error> {
        let data = self.data.read();
        let mut written = 0;
        for (key, chain) in data.iter() {
            let Some(item) = chain.get_latest() else {
                continue;
            };
            match item.status {
                Status::Written(value) => self.parent.set(key.clone(), value)?,
                Status::Deleted => self.parent.delete(key)?,
                Status::Estimate => {
                    panic!("estimate for key {key:?} left by transaction {}", item.index)
                }
            }
            written += 1;
        }
        debug!(keys = written, "wrote latest versions to parent");
        Ok(())
    }

    fn chain(&self, key: &[u8]) -> Option<Arc<MultiVersionValue>> {
        self.data.read().get(key).cloned()
    }

    fn chain_or_create(&self, key: &Key) -> Arc<MultiVersionValue> {
        if let Some(chain) = self.chain(key) {
            return chain;
        }
        self.data.write().entry(key.clone()).or_default().clone()
    }

    fn validate_read(
        &self,
        index: TxnIndex,
        key: &Key,
        read: &ReadDescriptor,
        conflicts: &mut BTreeSet<TxnIndex>,
    ) -> bool {
        if read.inconsistent {
            conflicts.extend(read.source.index());
            return false;
        }

        match self.get_latest_before(index, key) {
            Some(item) if item.is_estimate() => {
                conflicts.insert(item.index);
                false
            }
            Some(item) => {
                if read.source == ReadSource::Transaction(item.index)
                    && read.value.as_ref() == item.value()
                {
                    return true;
                }
                conflicts.insert(item.index);
                conflicts.extend(read.source.index());
                false
            }
            None => match read.source {
                ReadSource::Transaction(previous) => {
                    conflicts.insert(previous);
                    false
                }
                ReadSource::Storage => match self.parent.get(key) {
                    Ok(value) => value == read.value,
                    Err(err) => {
                        warn!(index, ?key, ?err, "parent read failed during validation");
                        false
                    }
                },
            },
        }
    }

    fn validate_iteration(
        &self,
        index: TxnIndex,
        record: &IterationRecord,
        conflicts: &mut BTreeSet<TxnIndex>,
    ) -> bool {
        let versions = self.collect_iterator_items(index, &record.range);
        let entries = iterator::overlay(versions, &record.writeset, record.ascending);
        let parent = match self.parent.iterator(&record.range, record.ascending) {
            Ok(parent) => parent,
            Err(err) => {
                warn!(index, ?err, "parent iterator failed during validation");
                return false;
            }
        };
        let mut replay = MergeIterator::new(parent, entries, record.ascending);

        for expected in &record.keys {
            match replay.next() {
                Some(Ok((key, _))) if &key == expected => {}
                Some(Ok((key, _))) => {
                    self.explain(index, &key, conflicts);
                    self.explain(index, expected, conflicts);
                    return false;
                }
                Some(Err(err)) => return self.replay_failed(index, err, conflicts),
                None => {
                    self.explain(index, expected, conflicts);
                    return false;
                }
            }
        }

        // An iterator closed early observed nothing past its last key
        if record.early_stop.is_some() {
            return true;
        }
        match replay.next() {
            None => true,
            Some(Ok((key, _))) => {
                self.explain(index, &key, conflicts);
                false
            }
            Some(Err(err)) => self.replay_failed(index, err, conflicts),
        }
    }

    fn replay_failed(
        &self,
        index: TxnIndex,
        err: Error,
        conflicts: &mut BTreeSet<TxnIndex>,
    ) -> bool {
        match err.abort() {
            Some(abort) => {
                conflicts.insert(abort.dependent);
            }
            None => warn!(index, ?err, "parent iterator failed during validation"),
        }
        false
    }

    /// Record the writer of the version of `key` visible to `index`, if any.
    fn explain(&self, index: TxnIndex, key: &[u8], conflicts: &mut BTreeSet<TxnIndex>) {
        if let Some(item) = self.get_latest_before(index, key) {
            conflicts.insert(item.index);
        }
    }
}
