use super::{ExecError, Executor, Stage};
use crate::{
    config::Config,
    task::{Outcome, Task},
};

/// Runs every task inline, in submission order. Reference semantics for the
/// parallel strategies.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sequential;

impl<C: Config> Executor<C> for Sequential {
    fn strategy(&self) -> &'static str {
        "sequential"
    }

    fn run_stage(&mut self, _stage: Stage, tasks: Vec<Task<C>>) -> Result<Vec<Outcome<C>>, ExecError> {
        Ok(tasks.into_iter().map(Task::execute).collect())
    }
}
