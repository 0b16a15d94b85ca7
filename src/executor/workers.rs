use super::{ExecError, Stage};
use crate::{
    config::Config,
    sync::InFlight,
    task::{Outcome, Task},
};
use core::num::NonZeroUsize;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::{
    io,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

/// Long-lived worker threads sharing one job channel and one outcome channel.
///
/// Both channels belong to this instance only, so independent executors never
/// see each other's tasks.
pub(super) struct Workers<C: Config> {
    jobs: Option<Sender<Task<C>>>,
    outcomes: Receiver<Outcome<C>>,
    in_flight: Arc<InFlight>,
    handles: Vec<JoinHandle<()>>,
}

impl<C: Config> Workers<C> {
    pub(super) fn spawn(n_threads: NonZeroUsize, name: &str) -> io::Result<Self> {
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<Task<C>>();
        let (outcome_tx, outcome_rx) = crossbeam_channel::unbounded::<Outcome<C>>();
        let in_flight = Arc::new(InFlight::new());
        let handles = (0..n_threads.get())
            .map(|index| {
                let jobs = job_rx.clone();
                let outcomes = outcome_tx.clone();
                let in_flight = Arc::clone(&in_flight);
                thread::Builder::new()
                    .name(format!("{name}-{index}"))
                    .spawn(move || work(&jobs, &outcomes, &in_flight))
            })
            .collect::<io::Result<Vec<_>>>()?;
        tracing::debug!(n_threads = n_threads.get(), name, "spawned executor workers");
        Ok(Self {
            jobs: Some(job_tx),
            outcomes: outcome_rx,
            in_flight,
            handles,
        })
    }

    pub(super) fn n_threads(&self) -> usize {
        self.handles.len()
    }

    /// Hand a task to the next free worker.
    pub(super) fn submit(&self, stage: Stage, task: Task<C>) -> Result<(), ExecError> {
        let jobs = self.jobs.as_ref().expect("Workers::submit: [1]");
        self.in_flight.add(1);
        jobs.send(task).map_err(|_| {
            self.in_flight.done();
            ExecError::WorkersDisconnected { stage }
        })
    }

    /// Block until the next outcome is posted.
    pub(super) fn recv(&self, stage: Stage, timeout: Option<Duration>) -> Result<Outcome<C>, ExecError> {
        let Some(timeout) = timeout else {
            return self
                .outcomes
                .recv()
                .map_err(|_| ExecError::WorkersDisconnected { stage });
        };
        self.outcomes.recv_timeout(timeout).map_err(|error| match error {
            RecvTimeoutError::Timeout => ExecError::StageTimeout {
                stage,
                timeout,
                outstanding: self.in_flight.pending(),
            },
            RecvTimeoutError::Disconnected => ExecError::WorkersDisconnected { stage },
        })
    }

    /// Block until every submitted task has posted its outcome.
    pub(super) fn wait_drained(&self, stage: Stage, timeout: Option<Duration>) -> Result<(), ExecError> {
        if self.in_flight.wait_idle(timeout) {
            Ok(())
        } else {
            Err(ExecError::StageTimeout {
                stage,
                timeout: timeout.unwrap_or_default(),
                outstanding: self.in_flight.pending(),
            })
        }
    }

    /// Outcomes already posted, without blocking.
    pub(super) fn drain(&self) -> impl Iterator<Item = Outcome<C>> + '_ {
        self.outcomes.try_iter()
    }
}

impl<C: Config> Drop for Workers<C> {
    fn drop(&mut self) {
        // Closing the job channel ends every idle worker's loop.
        drop(self.jobs.take());
        let stuck = self.in_flight.pending();
        if stuck > 0 {
            // A worker still runs a task abandoned after a timeout; joining it
            // could block forever.
            tracing::warn!(stuck, "detaching executor workers with unfinished tasks");
            return;
        }
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::warn!("executor worker exited with a panic");
            }
        }
    }
}

fn work<C: Config>(jobs: &Receiver<Task<C>>, outcomes: &Sender<Outcome<C>>, in_flight: &InFlight) {
    for task in jobs {
        let slot = task.slot();
        let kind = task.kind();
        tracing::trace!(slot, %kind, "worker picked up task");
        let outcome = task.execute();
        // The outcome must be visible before the task counts as done, so that
        // a drained barrier always finds every outcome in the channel.
        let posted = outcomes.send(outcome).is_ok();
        in_flight.done();
        if !posted {
            break;
        }
    }
}
