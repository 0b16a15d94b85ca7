use super::{ExecError, Executor, Stage, workers::Workers};
use crate::{
    behavior::Connection,
    config::Config,
    ops,
    task::{Item, Outcome, Payload, Task, TaskFailure, TaskKind, Work},
    types::HashMap,
    utils::partition_columns,
};
use core::{num::NonZeroUsize, ops::Range};
use derive_more::Debug;
use ndarray::Array2;
use std::{io, sync::Arc, time::Duration};

/// Task dispatcher that splits dense propagation into column partitions.
///
/// Within the gather stage, a connection exposing a [dense
/// view](crate::behavior::Connection::dense) is broken into up to
/// `partitions` tasks, each computing a disjoint range of output columns.
/// The connection itself stays on the dispatching thread. Once the stage has
/// drained, the partial results are reassembled by their column tag, so the
/// order in which workers finish never matters.
///
/// ```text
///             ┌─ cols 0..k ─┐
/// propagate ──┼─ cols k..m ─┼── assemble by tag ── contribution
///             └─ cols m..n ─┘
/// ```
#[derive(Debug)]
pub struct Dispatcher<C: Config> {
    #[debug(skip)]
    workers: Workers<C>,
    partitions: NonZeroUsize,
    min_partition_columns: usize,
    stage_timeout: Option<Duration>,
}

impl<C: Config> Dispatcher<C> {
    /// # Errors
    /// If a worker thread cannot be spawned.
    pub fn spawn(n_threads: NonZeroUsize, partitions: NonZeroUsize) -> io::Result<Self> {
        Ok(Self {
            workers: Workers::spawn(n_threads, "csn-dispatch")?,
            partitions,
            min_partition_columns: 1,
            stage_timeout: None,
        })
    }

    /// Never create partitions narrower than `columns` output columns.
    pub fn with_min_partition_columns(mut self, columns: usize) -> Self {
        self.min_partition_columns = columns.max(1);
        self
    }

    /// Bound the wait for a stage to drain. `None` waits indefinitely.
    pub fn with_stage_timeout(mut self, stage_timeout: Option<Duration>) -> Self {
        self.stage_timeout = stage_timeout;
        self
    }

    pub fn n_threads(&self) -> usize {
        self.workers.n_threads()
    }

    pub fn partitions(&self) -> NonZeroUsize {
        self.partitions
    }

    fn split(&self, task: Task<C>) -> Split<C> {
        let slot = task.slot;
        let (connection, source) = match task.work {
            Work::Propagate { connection, source } => (connection, source),
            work => return Split::Whole(Task { slot, work }),
        };
        let Some(view) = connection.dense() else {
            return Split::Whole(Task::propagate(slot, connection, source));
        };
        let n_out = view.n_out();
        let columns = partition_columns(0..n_out, self.partitions.get(), self.min_partition_columns);
        if columns.len() < 2 {
            return Split::Whole(Task::propagate(slot, connection, source));
        }
        let flat = match view.flatten_source(&source) {
            Ok(flat) => Arc::new(flat),
            Err(error) => {
                return Split::Rejected(Outcome {
                    slot,
                    kind: TaskKind::Propagate,
                    item: Item::Connection(connection),
                    result: Err(TaskFailure::Error(error)),
                });
            }
        };
        let parts = columns
            .into_iter()
            .map(|columns| Task::compute_partition(slot, columns, Arc::clone(&flat), view.clone()))
            .collect();
        Split::Partitioned {
            slot,
            held: Held {
                connection,
                batch: flat.nrows(),
                n_out,
                pieces: Vec::new(),
                failure: None,
            },
            parts,
        }
    }
}

enum Split<C: Config> {
    Whole(Task<C>),
    Partitioned {
        slot: usize,
        held: Held<C>,
        parts: Vec<Task<C>>,
    },
    Rejected(Outcome<C>),
}

/// Connection kept on the dispatching thread while its partitions run.
struct Held<C: Config> {
    connection: C::Connection,
    batch: usize,
    n_out: usize,
    pieces: Vec<(Range<usize>, Array2<f32>)>,
    failure: Option<TaskFailure>,
}

impl<C: Config> Held<C> {
    fn finish(self, slot: usize) -> Outcome<C> {
        let result = match self.failure {
            Some(failure) => Err(failure),
            None => ops::assemble_columns(self.pieces, self.batch, self.n_out)
                .map(|contribution| Payload::Contribution(contribution.into_dyn()))
                .map_err(|error| TaskFailure::Error(Box::new(error))),
        };
        Outcome {
            slot,
            kind: TaskKind::Propagate,
            item: Item::Connection(self.connection),
            result,
        }
    }
}

impl<C: Config> Executor<C> for Dispatcher<C> {
    fn strategy(&self) -> &'static str {
        "dispatcher"
    }

    fn run_stage(&mut self, stage: Stage, tasks: Vec<Task<C>>) -> Result<Vec<Outcome<C>>, ExecError> {
        let mut outcomes = Vec::with_capacity(tasks.len());
        let mut held: HashMap<usize, Held<C>> = HashMap::default();
        let mut submitted = 0;
        for task in tasks {
            match self.split(task) {
                Split::Whole(task) => {
                    self.workers.submit(stage, task)?;
                    submitted += 1;
                }
                Split::Partitioned {
                    slot,
                    held: connection,
                    parts,
                } => {
                    tracing::trace!(slot, parts = parts.len(), "partitioned propagation");
                    held.insert(slot, connection);
                    for part in parts {
                        self.workers.submit(stage, part)?;
                        submitted += 1;
                    }
                }
                Split::Rejected(outcome) => outcomes.push(outcome),
            }
        }

        // Barrier: every submitted task has posted its outcome once the
        // in-flight counter drops to zero.
        self.workers.wait_drained(stage, self.stage_timeout)?;

        let mut received = 0;
        for outcome in self.workers.drain() {
            received += 1;
            if outcome.kind != TaskKind::ComputePartition {
                outcomes.push(outcome);
                continue;
            }
            let Some(entry) = held.get_mut(&outcome.slot) else {
                return Err(ExecError::CompletionMismatch {
                    stage,
                    expected: submitted,
                    actual: received,
                });
            };
            match outcome.result {
                Ok(Payload::Columns(columns, values)) => entry.pieces.push((columns, values)),
                Ok(_) => {
                    entry
                        .failure
                        .get_or_insert_with(|| TaskFailure::Error("partition produced no columns".into()));
                }
                Err(failure) => {
                    entry.failure.get_or_insert(failure);
                }
            }
        }
        if received != submitted {
            return Err(ExecError::CompletionMismatch {
                stage,
                expected: submitted,
                actual: received,
            });
        }
        outcomes.extend(held.into_iter().map(|(slot, entry)| entry.finish(slot)));
        Ok(outcomes)
    }
}
