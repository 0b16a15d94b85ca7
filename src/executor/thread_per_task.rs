use super::{ExecError, Executor, Stage};
use crate::{
    config::Config,
    task::{Outcome, Task},
};
use core::num::NonZeroUsize;
use std::{
    collections::VecDeque,
    thread::{self, JoinHandle},
};

/// Spawns one thread per task, never more than `n_threads` at a time, and
/// joins all of them before the stage returns.
#[derive(Debug, Clone, Copy)]
pub struct ThreadPerTask {
    n_threads: NonZeroUsize,
}

impl ThreadPerTask {
    pub fn new(n_threads: NonZeroUsize) -> Self {
        Self { n_threads }
    }

    pub fn n_threads(&self) -> NonZeroUsize {
        self.n_threads
    }
}

impl<C: Config> Executor<C> for ThreadPerTask {
    fn strategy(&self) -> &'static str {
        "thread_per_task"
    }

    fn run_stage(&mut self, stage: Stage, tasks: Vec<Task<C>>) -> Result<Vec<Outcome<C>>, ExecError> {
        let ceiling = self.n_threads.get();
        let mut in_flight: VecDeque<JoinHandle<Outcome<C>>> = VecDeque::with_capacity(ceiling);
        let mut outcomes = Vec::with_capacity(tasks.len());
        let mut failure = None;

        'spawn: for task in tasks {
            // Wait for the oldest worker whenever the ceiling is reached.
            while in_flight.len() >= ceiling {
                let handle = in_flight.pop_front().expect("ThreadPerTask::run_stage: [1]");
                match join(stage, handle) {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(error) => {
                        failure = Some(error);
                        break 'spawn;
                    }
                }
            }
            let name = format!("{stage}-{}-{}", task.kind(), task.slot());
            match thread::Builder::new().name(name).spawn(move || task.execute()) {
                Ok(handle) => in_flight.push_back(handle),
                Err(cause) => {
                    failure = Some(ExecError::Spawn { stage, cause });
                    break;
                }
            }
        }

        // Barrier: every worker of this stage is joined before returning.
        for handle in in_flight {
            match join(stage, handle) {
                Ok(outcome) => outcomes.push(outcome),
                Err(error) => {
                    failure.get_or_insert(error);
                }
            }
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(outcomes),
        }
    }
}

fn join<C: Config>(stage: Stage, handle: JoinHandle<Outcome<C>>) -> Result<Outcome<C>, ExecError> {
    handle.join().map_err(|_| ExecError::WorkerLost { stage })
}
