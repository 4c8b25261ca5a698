//! Collaborative scheduler for optimistic parallel execution.
//!
//! Workers repeatedly ask [Scheduler::next_task] for work. Two monotone-ish cursors
//! walk the block: `execution_index` hands out incarnations to run and
//! `validation_index` hands out published incarnations to validate. Both cursors are
//! only ever lowered explicitly (after an abort or a write to a new key) to force
//! re-execution or re-validation of a suffix of the block.
//!
//! Each transaction moves through `ReadyToExecute -> Executing -> Executed`, and back to
//! `ReadyToExecute` with a higher incarnation via `Aborting` when its validation fails
//! or it reads an estimate of a transaction that has not finished yet.

use crate::types::{Incarnation, Task, TaskKind, TxnIndex, Version};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use tracing::trace;

pub struct Scheduler {
    done_marker: AtomicBool,
    validation_index: AtomicUsize,
    execution_index: AtomicUsize,
    num_active_tasks: AtomicI64,
    decrease_count: AtomicUsize,
    all_txn_state: Vec<TxnState>,
    block_size: usize,
}

#[derive(Default)]
struct TxnState(Mutex<TxnStateInner>);

#[derive(Default)]
struct TxnStateInner {
    status: TxnStatus,
    incarnation: Incarnation,
    /// Transactions waiting for this one to finish executing.
    dependencies: Vec<TxnIndex>,
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
enum TxnStatus {
    #[default]
    ReadyToExecute,
    Executing,
    Executed,
    Aborting,
}

impl Scheduler {
    pub fn new(block_size: usize) -> Scheduler {
        let all_txn_state = (0..block_size).map(|_| TxnState::default()).collect();
        Scheduler {
            done_marker: AtomicBool::new(block_size == 0),
            validation_index: AtomicUsize::new(0),
            execution_index: AtomicUsize::new(0),
            num_active_tasks: AtomicI64::new(0),
            decrease_count: AtomicUsize::new(0),
            all_txn_state,
            block_size,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn done(&self) -> bool {
        self.done_marker.load(Ordering::Acquire)
    }

    /// Stop handing out work, e.g. after an unrecoverable error.
    pub fn halt(&self) {
        self.done_marker.store(true, Ordering::Release);
    }

    /// Current incarnation of `index`.
    pub fn incarnation(&self, index: TxnIndex) -> Incarnation {
        self.all_txn_state[index].0.lock().incarnation
    }

    pub fn next_task(&self) -> Option<Task> {
        if self.done() {
            return None;
        }
        if self.validation_index.load(Ordering::Acquire)
            < self.execution_index.load(Ordering::Acquire)
        {
            self.next_version_to_validate().map(|version| Task {
                kind: TaskKind::Validation,
                version,
            })
        } else {
            self.next_version_to_execute().map(|version| Task {
                kind: TaskKind::Execution,
                version,
            })
        }
    }

    /// Park `index` until `blocking_index` finishes executing.
    ///
    /// Returns false if `blocking_index` already finished, in which case the caller
    /// should re-execute `index` immediately.
    pub fn add_dependency(&self, index: TxnIndex, blocking_index: TxnIndex) -> bool {
        assert!(
            blocking_index < index,
            "transaction {index} cannot depend on {blocking_index}"
        );
        let mut blocking = self.all_txn_state[blocking_index].0.lock();
        if blocking.status == TxnStatus::Executed {
            return false;
        }

        let mut blocked = self.all_txn_state[index].0.lock();
        blocked.status = TxnStatus::Aborting;
        blocking.dependencies.push(index);
        drop(blocked);
        drop(blocking);

        trace!(index, blocking_index, "added dependency");
        self.num_active_tasks.fetch_sub(1, Ordering::AcqRel);
        true
    }

    /// Mark `version` executed. May return a validation task for the same version.
    pub fn finish_execution(&self, version: Version, wrote_new_location: bool) -> Option<Task> {
        let mut state = self.all_txn_state[version.index].0.lock();
        assert_eq!(
            state.status,
            TxnStatus::Executing,
            "transaction {} finished without executing",
            version.index
        );
        state.status = TxnStatus::Executed;
        let dependencies = std::mem::take(&mut state.dependencies);
        drop(state);
        self.resume_dependencies(dependencies);

        if self.validation_index.load(Ordering::Acquire) > version.index {
            if wrote_new_location {
                // Revalidate this transaction and every higher one
                self.decrease_validation_index(version.index);
            } else {
                return Some(Task {
                    kind: TaskKind::Validation,
                    version,
                });
            }
        }

        self.num_active_tasks.fetch_sub(1, Ordering::AcqRel);
        None
    }

    /// Claim the right to abort `version` after a failed validation. Only the first
    /// failed validation of an incarnation succeeds.
    pub fn try_validation_abort(&self, version: Version) -> bool {
        let mut state = self.all_txn_state[version.index].0.lock();
        if state.incarnation == version.incarnation && state.status == TxnStatus::Executed {
            state.status = TxnStatus::Aborting;
            return true;
        }
        false
    }

    /// Complete a validation task. After an abort, may return the re-execution task.
    pub fn finish_validation(&self, index: TxnIndex, aborted: bool) -> Option<Task> {
        if aborted {
            self.set_ready_status(index);
            // Higher transactions may have read the aborted writes
            self.decrease_validation_index(index + 1);

            if self.execution_index.load(Ordering::Acquire) > index {
                if let Some(version) = self.try_incarnation(index) {
                    return Some(Task {
                        kind: TaskKind::Execution,
                        version,
                    });
                }
            }
        }

        self.num_active_tasks.fetch_sub(1, Ordering::AcqRel);
        None
    }

    fn resume_dependencies(&self, dependencies: Vec<TxnIndex>) {
        let Some(min_index) = dependencies.iter().min().copied() else {
            return;
        };
        for index in dependencies {
            self.set_ready_status(index);
        }
        // Dependents get picked up again by the execution cursor
        self.decrease_execution_index(min_index);
    }

    fn set_ready_status(&self, index: TxnIndex) {
        let mut state = self.all_txn_state[index].0.lock();
        Self::set_ready_status_locked(&mut state);
    }

    fn set_ready_status_locked(state: &mut MutexGuard<'_, TxnStateInner>) {
        state.incarnation += 1;
        state.status = TxnStatus::ReadyToExecute;
    }

    fn next_version_to_validate(&self) -> Option<Version> {
        if self.validation_index.load(Ordering::Acquire) >= self.block_size {
            self.check_done();
            return None;
        }

        self.num_active_tasks.fetch_add(1, Ordering::AcqRel);
        let index = self.validation_index.fetch_add(1, Ordering::AcqRel);
        if index < self.block_size {
            let state = self.all_txn_state[index].0.lock();
            if state.status == TxnStatus::Executed {
                return Some(Version::new(index, state.incarnation));
            }
        }

        self.num_active_tasks.fetch_sub(1, Ordering::AcqRel);
        None
    }

    fn next_version_to_execute(&self) -> Option<Version> {
        if self.execution_index.load(Ordering::Acquire) >= self.block_size {
            self.check_done();
            return None;
        }

        self.num_active_tasks.fetch_add(1, Ordering::AcqRel);
        let index = self.execution_index.fetch_add(1, Ordering::AcqRel);
        let version = self.try_incarnation(index);
        if version.is_none() {
            self.num_active_tasks.fetch_sub(1, Ordering::AcqRel);
        }
        version
    }

    fn try_incarnation(&self, index: TxnIndex) -> Option<Version> {
        if index >= self.block_size {
            return None;
        }
        let mut state = self.all_txn_state[index].0.lock();
        if state.status == TxnStatus::ReadyToExecute {
            state.status = TxnStatus::Executing;
            return Some(Version::new(index, state.incarnation));
        }
        None
    }

    fn check_done(&self) {
        let observed_count = self.decrease_count.load(Ordering::Acquire);
        if self.execution_index.load(Ordering::Acquire) >= self.block_size
            && self.validation_index.load(Ordering::Acquire) >= self.block_size
            && self.num_active_tasks.load(Ordering::Acquire) == 0
            && observed_count == self.decrease_count.load(Ordering::Acquire)
        {
            self.done_marker.store(true, Ordering::Release);
        }
    }

    fn decrease_execution_index(&self, target: TxnIndex) {
        self.execution_index.fetch_min(target, Ordering::AcqRel);
        self.decrease_count.fetch_add(1, Ordering::AcqRel);
    }

    fn decrease_validation_index(&self, target: TxnIndex) {
        self.validation_index.fetch_min(target, Ordering::AcqRel);
        self.decrease_count.fetch_add(1, Ordering::AcqRel);
    }
}
