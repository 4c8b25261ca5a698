//! Version chain of a single key.

use crate::types::{Incarnation, TxnIndex, Value};
use parking_lot::RwLock;
use std::collections::btree_map::Entry::{Occupied, Vacant};
use std::collections::BTreeMap;

/// State of one version slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Status {
    Written(Value),
    Deleted,
    /// The writer is being re-executed and its eventual value is unknown.
    Estimate,
}

/// Snapshot of the slot at `index`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValueItem {
    pub index: TxnIndex,
    pub incarnation: Incarnation,
    pub status: Status,
}

impl ValueItem {
    pub fn is_estimate(&self) -> bool {
        matches!(self.status, Status::Estimate)
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self.status, Status::Deleted)
    }

    /// The written value, `None` for deletions and estimates.
    pub fn value(&self) -> Option<&Value> {
        match &self.status {
            Status::Written(value) => Some(value),
            _ => None,
        }
    }
}

struct Cell {
    incarnation: Incarnation,
    status: Status,
}

/// Versions written to one key, at most one per transaction index.
///
/// All accessors take the chain lock, so readers never observe a slot whose
/// status and incarnation disagree.
#[derive(Default)]
pub struct MultiVersionValue {
    cells: RwLock<BTreeMap<TxnIndex, Cell>>,
}

impl MultiVersionValue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, index: TxnIndex, incarnation: Incarnation, value: Value) {
        self.write_cell(index, incarnation, Status::Written(value));
    }

    pub fn delete(&self, index: TxnIndex, incarnation: Incarnation) {
        self.write_cell(index, incarnation, Status::Deleted);
    }

    pub fn set_estimate(&self, index: TxnIndex, incarnation: Incarnation) {
        self.write_cell(index, incarnation, Status::Estimate);
    }

    /// Drop the slot at `index` entirely, exposing the next lower version.
    pub fn remove(&self, index: TxnIndex) {
        self.cells.write().remove(&index);
    }

    /// The version with the greatest index strictly below `index`.
    pub fn get_latest_before(&self, index: TxnIndex) -> Option<ValueItem> {
        let cells = self.cells.read();
        cells
            .range(..index)
            .next_back()
            .map(|(index, cell)| Self::item(*index, cell))
    }

    pub fn get_latest(&self) -> Option<ValueItem> {
        let cells = self.cells.read();
        cells
            .iter()
            .next_back()
            .map(|(index, cell)| Self::item(*index, cell))
    }

    /// The highest version that is not an estimate.
    pub fn get_latest_non_estimate(&self) -> Option<ValueItem> {
        let cells = self.cells.read();
        cells
            .iter()
            .rev()
            .find(|(_, cell)| cell.status != Status::Estimate)
            .map(|(index, cell)| Self::item(*index, cell))
    }

    pub fn is_empty(&self) -> bool {
        self.cells.read().is_empty()
    }

    fn item(index: TxnIndex, cell: &Cell) -> ValueItem {
        ValueItem {
            index,
            incarnation: cell.incarnation,
            status: cell.status.clone(),
        }
    }

    fn write_cell(&self, index: TxnIndex, incarnation: Incarnation, status: Status) {
        let mut cells = self.cells.write();
        match cells.entry(index) {
            Occupied(o) => {
                let o = o.into_mut();
                assert!(
                    o.incarnation <= incarnation,
                    "existing version has higher incarnation: index={}, existing={}, new={}",
                    index,
                    o.incarnation,
                    incarnation
                );
                o.incarnation = incarnation;
                o.status = status;
            }
            Vacant(v) => {
                v.insert(Cell {
                    incarnation,
                    status,
                });
            }
        }
    }
}
