mod dispatcher;
mod pool;
mod sequential;
mod thread_per_task;
mod workers;

pub use crate::sync::InFlight;
pub use dispatcher::Dispatcher;
pub use pool::WorkerPool;
pub use sequential::Sequential;
pub use thread_per_task::ThreadPerTask;

use crate::{
    config::Config,
    task::{Outcome, Task, TaskKind},
    types::BehaviorError,
};
use derive_more::Display;
use std::{io, time::Duration};
use thiserror::Error;

/// Pipeline stage a batch of tasks belongs to.
///
/// Stages run in the order `InputGather → Forward → EdgeUpdate → Record` once
/// per timestep, followed by a single terminal `Normalize`.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    #[display("input_gather")]
    InputGather,
    #[display("forward")]
    Forward,
    #[display("edge_update")]
    EdgeUpdate,
    #[display("record")]
    Record,
    #[display("normalize")]
    Normalize,
}

/// Runtime failure of a stage.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExecError {
    /// A behavior returned an error.
    #[error("{kind} task for {label} failed during {stage}")]
    Task {
        stage: Stage,
        kind: TaskKind,
        label: String,
        #[source]
        cause: BehaviorError,
    },
    /// A behavior panicked. The panic was contained in the task.
    #[error("{kind} task for {label} panicked during {stage}: {message}")]
    Panicked {
        stage: Stage,
        kind: TaskKind,
        label: String,
        message: String,
    },
    #[error("{stage} stage timed out after {timeout:?} with {outstanding} task(s) outstanding")]
    StageTimeout {
        stage: Stage,
        timeout: Duration,
        outstanding: usize,
    },
    #[error("executor workers disconnected during {stage}")]
    WorkersDisconnected { stage: Stage },
    #[error("a worker thread died during {stage}")]
    WorkerLost { stage: Stage },
    #[error("failed to spawn a worker thread during {stage}")]
    Spawn {
        stage: Stage,
        #[source]
        cause: io::Error,
    },
    #[error("{stage} stage produced {actual} outcome(s) for {expected} task(s)")]
    CompletionMismatch {
        stage: Stage,
        expected: usize,
        actual: usize,
    },
}

impl ExecError {
    /// Whether tasks of the failed stage may not have handed their objects
    /// back. Task-level failures always do; executor-level failures may not.
    pub fn loses_tasks(&self) -> bool {
        !matches!(self, Self::Task { .. } | Self::Panicked { .. })
    }
}

/// Concurrency strategy that runs one stage's tasks to completion.
///
/// Implementations only decide *where* tasks run. Stage ordering and the
/// meaning of each task live in the shared pipeline, so every strategy
/// produces the same results for deterministic behaviors.
pub trait Executor<C: Config>: Send {
    /// Short name of the strategy, used in logs.
    fn strategy(&self) -> &'static str;

    /// Run every task of one stage and return one outcome per task, in any
    /// order, once all of them have completed.
    ///
    /// # Errors
    /// If the executor itself failed (timeout, lost or unspawnable worker).
    /// Failures of the tasks are reported inside their outcomes.
    fn run_stage(&mut self, stage: Stage, tasks: Vec<Task<C>>) -> Result<Vec<Outcome<C>>, ExecError>;
}

impl<C: Config, E: Executor<C> + ?Sized> Executor<C> for Box<E> {
    fn strategy(&self) -> &'static str {
        (**self).strategy()
    }

    fn run_stage(&mut self, stage: Stage, tasks: Vec<Task<C>>) -> Result<Vec<Outcome<C>>, ExecError> {
        (**self).run_stage(stage, tasks)
    }
}
