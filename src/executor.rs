//! Parallel execution of a block of transactions.
//!
//! The [Executor] runs `concurrency` workers that pull tasks from a shared [Scheduler].
//! Execution tasks run one incarnation against a fresh [VersionIndexedStore]: if it
//! reads an estimate, the transaction is parked until the writer finishes, otherwise
//! its sets are published to the [MultiVersionStore]. Validation tasks replay what the
//! incarnation observed and, on mismatch, turn its writes into estimates before the
//! transaction is re-executed. Once every transaction is executed and validated, the
//! final versions are flushed into the parent store.
//!
//! The outcome is the same as executing the block sequentially in index order.
//!
//! [VersionIndexedStore]: crate::vistore::VersionIndexedStore

use crate::error::Error;
use crate::mvstore::MultiVersionStore;
use crate::scheduler::Scheduler;
use crate::types::{Store, Task, TaskKind, Version, Vm};
use parking_lot::Mutex;
use rayon::ThreadPoolBuilder;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Configuration for [Executor].
#[derive(Clone, Debug)]
pub struct Config {
    /// Number of workers executing and validating transactions.
    pub concurrency: NonZeroUsize,
}

pub struct Executor<S, V>
where
    S: Store,
    V: Vm<S>,
{
    cfg: Config,
    vm: V,
    scheduler: Scheduler,
    mvs: Arc<MultiVersionStore<S>>,
    outputs: Vec<Mutex<Option<V::Output>>>,
    error: Mutex<Option<Error>>,
}

impl<S, V> Executor<S, V>
where
    S: Store,
    V: Vm<S>,
{
    pub fn new(cfg: Config, vm: V, parent: Arc<S>, block_size: usize) -> Self {
        Self {
            cfg,
            vm,
            scheduler: Scheduler::new(block_size),
            mvs: Arc::new(MultiVersionStore::new(parent)),
            outputs: (0..block_size).map(|_| Mutex::new(None)).collect(),
            error: Mutex::new(None),
        }
    }

    pub fn multiversion_store(&self) -> &Arc<MultiVersionStore<S>> {
        &self.mvs
    }

    /// Execute the block on a dedicated pool of `concurrency` threads and write the
    /// result into the parent store.
    ///
    /// Returns the output of every transaction, in block order.
    pub fn run(self) -> Result<Vec<V::Output>, Error> {
        debug!(
            concurrency = self.cfg.concurrency.get(),
            block_size = self.scheduler.block_size(),
            "executing block"
        );
        // Workers spin until the block is done, so each needs its own thread
        let pool = ThreadPoolBuilder::new()
            .num_threads(self.cfg.concurrency.get())
            .thread_name(|i| format!("mvs-worker-{i}"))
            .build()
            .map_err(|err| Error::ThreadPool(err.to_string()))?;
        pool.scope(|scope| {
            for _ in 0..self.cfg.concurrency.get() {
                scope.spawn(|_| self.run_inner());
            }
        });
        self.finish()
    }

    /// Execute the block one transaction at a time, in index order.
    pub fn run_sequential(self) -> Result<Vec<V::Output>, Error> {
        for index in 0..self.scheduler.block_size() {
            let store = self.mvs.versioned_indexed_store(Version::new(index, 0));
            let output = self.vm.execute(index, &store)?;
            store.write_to_multiversion_store();
            *self.outputs[index].lock() = Some(output);
        }
        self.finish()
    }

    fn finish(self) -> Result<Vec<V::Output>, Error> {
        if let Some(err) = self.error.into_inner() {
            return Err(err);
        }
        self.mvs.write_latest_to_store()?;
        Ok(self
            .outputs
            .into_iter()
            .enumerate()
            .map(|(index, output)| {
                output
                    .into_inner()
                    .unwrap_or_else(|| panic!("transaction {index} has no output"))
            })
            .collect())
    }

    fn run_inner(&self) {
        let mut task: Option<Task> = None;
        loop {
            if let Some(t) = task {
                task = match t.kind {
                    TaskKind::Execution => self.try_execute(t.version),
                    TaskKind::Validation => self.try_validate(t.version),
                };
            }
            if task.is_none() {
                task = self.scheduler.next_task();
            }

            if task.is_none() {
                if self.scheduler.done() {
                    break;
                }
                std::hint::spin_loop();
            }
        }
    }

    fn try_execute(&self, version: Version) -> Option<Task> {
        loop {
            let store = self.mvs.versioned_indexed_store(version);
            let result = self.vm.execute(version.index, &store);

            // The view latches estimates even if the transaction swallowed the error
            if let Some(abort) = store.abort() {
                if self
                    .scheduler
                    .add_dependency(version.index, abort.dependent)
                {
                    return None;
                }
                // The dependency finished in the meantime
                continue;
            }

            return match result {
                Ok(output) => {
                    let wrote_new_location = store.write_to_multiversion_store();
                    *self.outputs[version.index].lock() = Some(output);
                    self.scheduler.finish_execution(version, wrote_new_location)
                }
                Err(err) => {
                    warn!(index = version.index, ?err, "execution failed");
                    self.fail(err);
                    None
                }
            };
        }
    }

    fn try_validate(&self, version: Version) -> Option<Task> {
        let validation = self.mvs.validate_transaction_state(version.index);
        let aborted = !validation.valid && self.scheduler.try_validation_abort(version);
        if aborted {
            debug!(
                index = version.index,
                incarnation = version.incarnation,
                conflicts = ?validation.conflicts,
                "aborting incarnation"
            );
            self.mvs.invalidate_writeset(version);
        }

        self.scheduler.finish_validation(version.index, aborted)
    }

    fn fail(&self, err: Error) {
        self.error.lock().get_or_insert(err);
        self.scheduler.halt();
    }
}
