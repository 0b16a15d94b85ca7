use super::{ExecError, Executor, Stage, workers::Workers};
use crate::{
    config::Config,
    task::{Outcome, Task},
};
use core::num::NonZeroUsize;
use derive_more::Debug;
use std::{io, time::Duration};

/// Fixed set of long-lived workers fed through a channel.
///
/// A stage submits all of its tasks, then counts completions until every one
/// of them has reported back.
#[derive(Debug)]
pub struct WorkerPool<C: Config> {
    #[debug(skip)]
    workers: Workers<C>,
    stage_timeout: Option<Duration>,
}

impl<C: Config> WorkerPool<C> {
    /// # Errors
    /// If a worker thread cannot be spawned.
    pub fn spawn(n_threads: NonZeroUsize) -> io::Result<Self> {
        Ok(Self {
            workers: Workers::spawn(n_threads, "csn-pool")?,
            stage_timeout: None,
        })
    }

    /// Bound the wait for each completion. `None` waits indefinitely.
    pub fn with_stage_timeout(mut self, stage_timeout: Option<Duration>) -> Self {
        self.stage_timeout = stage_timeout;
        self
    }

    pub fn n_threads(&self) -> usize {
        self.workers.n_threads()
    }
}

impl<C: Config> Executor<C> for WorkerPool<C> {
    fn strategy(&self) -> &'static str {
        "worker_pool"
    }

    fn run_stage(&mut self, stage: Stage, tasks: Vec<Task<C>>) -> Result<Vec<Outcome<C>>, ExecError> {
        let submitted = tasks.len();
        for task in tasks {
            self.workers.submit(stage, task)?;
        }
        let mut outcomes = Vec::with_capacity(submitted);
        while outcomes.len() < submitted {
            outcomes.push(self.workers.recv(stage, self.stage_timeout)?);
        }
        Ok(outcomes)
    }
}
