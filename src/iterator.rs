//! Merge of a materialized multi-version overlay with a parent store iterator.

use crate::error::Error;
use crate::mvvalue::{Status, ValueItem};
use crate::types::{Abort, Key, KvIterator, ReadSource, TxnIndex, Value, WriteSet};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::iter::Peekable;

/// Resolved state of a key in the overlay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Entry {
    /// Value published by a lower transaction.
    Written(TxnIndex, Value),
    /// Value from the reader's own write set.
    Own(Value),
    Deleted,
    Estimate(TxnIndex),
}

impl From<&ValueItem> for Entry {
    fn from(item: &ValueItem) -> Self {
        match &item.status {
            Status::Written(value) => Entry::Written(item.index, value.clone()),
            Status::Deleted => Entry::Deleted,
            Status::Estimate => Entry::Estimate(item.index),
        }
    }
}

/// Build the overlay for an iterator: versions visible to the reader, with the
/// reader's own writes taking precedence.
pub fn overlay(
    versions: Vec<(Key, ValueItem)>,
    writeset: &WriteSet,
    ascending: bool,
) -> Vec<(Key, Entry)> {
    let mut merged: BTreeMap<Key, Entry> = versions
        .iter()
        .map(|(key, item)| (key.clone(), Entry::from(item)))
        .collect();
    for (key, value) in writeset {
        let entry = match value {
            Some(value) => Entry::Own(value.clone()),
            None => Entry::Deleted,
        };
        merged.insert(key.clone(), entry);
    }

    let mut entries: Vec<(Key, Entry)> = merged.into_iter().collect();
    if !ascending {
        entries.reverse();
    }
    entries
}

/// Yields the union of the overlay and the parent in key order.
///
/// On equal keys the overlay wins. Deleted overlay entries hide the parent key.
/// An estimate yields [Error::Estimate] and fuses the iterator.
pub struct MergeIterator<'a> {
    parent: Peekable<KvIterator<'a>>,
    overlay: Peekable<std::vec::IntoIter<(Key, Entry)>>,
    ascending: bool,
    done: bool,
}

impl<'a> MergeIterator<'a> {
    pub fn new(parent: KvIterator<'a>, overlay: Vec<(Key, Entry)>, ascending: bool) -> Self {
        Self {
            parent: parent.peekable(),
            overlay: overlay.into_iter().peekable(),
            ascending,
            done: false,
        }
    }

    /// Which side holds the next key in iteration order.
    fn next_side(&mut self) -> Option<Ordering> {
        let overlay_key = self.overlay.peek().map(|(key, _)| key);
        let parent_key = match self.parent.peek() {
            Some(Ok((key, _))) => Some(key),
            Some(Err(_)) => return Some(Ordering::Greater),
            None => None,
        };
        match (overlay_key, parent_key) {
            (None, None) => None,
            (Some(_), None) => Some(Ordering::Less),
            (None, Some(_)) => Some(Ordering::Greater),
            (Some(o), Some(p)) => {
                let ord = o.cmp(p);
                Some(if self.ascending { ord } else { ord.reverse() })
            }
        }
    }
}

impl MergeIterator<'_> {
    /// Like [Iterator::next], but also reports where the value came from. The
    /// source is `None` for the reader's own writes.
    pub fn next_read(&mut self) -> Option<Result<(Key, Value, Option<ReadSource>), Error>> {
        if self.done {
            return None;
        }
        loop {
            let (key, entry) = match self.next_side() {
                None => {
                    self.done = true;
                    return None;
                }
                Some(Ordering::Greater) => {
                    return match self.parent.next()? {
                        Ok((key, value)) => Some(Ok((key, value, Some(ReadSource::Storage)))),
                        Err(err) => {
                            self.done = true;
                            Some(Err(err))
                        }
                    };
                }
                Some(Ordering::Equal) => {
                    // Shadowed by the overlay
                    self.parent.next();
                    self.overlay.next()?
                }
                Some(Ordering::Less) => self.overlay.next()?,
            };
            match entry {
                Entry::Written(writer, value) => {
                    return Some(Ok((key, value, Some(ReadSource::Transaction(writer)))));
                }
                Entry::Own(value) => return Some(Ok((key, value, None))),
                Entry::Deleted => continue,
                Entry::Estimate(dependent) => {
                    self.done = true;
                    return Some(Err(Error::Estimate(Abort { dependent })));
                }
            }
        }
    }
}

impl Iterator for MergeIterator<'_> {
    type Item = Result<(Key, Value), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_read()
            .map(|item| item.map(|(key, value, _)| (key, value)))
    }
}
