#[cfg(feature = "loom")]
mod imp {
    pub(crate) use loom::sync::{Condvar, Mutex, MutexGuard};
}

#[cfg(not(feature = "loom"))]
mod imp {
    pub(crate) use std::sync::{Condvar, Mutex, MutexGuard};
}

pub(crate) use imp::*;
use std::{sync::PoisonError, time::Duration};

/// Counter of submitted-but-unfinished jobs.
///
/// Producers call [`InFlight::add`] before handing a job to a worker; the
/// worker calls [`InFlight::done`] once the job's outcome has been posted.
/// [`InFlight::wait_idle`] is the stage barrier: it returns once every
/// submitted job is done.
#[derive(Debug)]
pub struct InFlight {
    pending: Mutex<usize>,
    drained: Condvar,
}

impl Default for InFlight {
    fn default() -> Self {
        Self::new()
    }
}

impl InFlight {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(0),
            drained: Condvar::new(),
        }
    }

    pub fn add(&self, jobs: usize) {
        *self.lock() += jobs;
    }

    /// # Panics
    /// If called more often than jobs were added.
    pub fn done(&self) {
        let mut pending = self.lock();
        *pending = pending.checked_sub(1).expect("InFlight::done: [1]");
        if *pending == 0 {
            self.drained.notify_all();
        }
    }

    pub fn pending(&self) -> usize {
        *self.lock()
    }

    /// Block until no job is pending. Returns `false` if `timeout` elapsed
    /// first.
    pub fn wait_idle(&self, timeout: Option<Duration>) -> bool {
        let pending = self.lock();
        match timeout {
            Some(timeout) => self.wait_idle_for(pending, timeout),
            None => {
                let mut pending = pending;
                while *pending > 0 {
                    pending = self
                        .drained
                        .wait(pending)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                true
            }
        }
    }

    #[cfg(not(feature = "loom"))]
    fn wait_idle_for(&self, pending: MutexGuard<'_, usize>, timeout: Duration) -> bool {
        let (pending, _) = self
            .drained
            .wait_timeout_while(pending, timeout, |pending| *pending > 0)
            .unwrap_or_else(PoisonError::into_inner);
        *pending == 0
    }

    // Loom has no notion of wall-clock time; model the timed wait as an
    // unbounded one.
    #[cfg(feature = "loom")]
    fn wait_idle_for(&self, mut pending: MutexGuard<'_, usize>, _timeout: Duration) -> bool {
        while *pending > 0 {
            pending = self
                .drained
                .wait(pending)
                .unwrap_or_else(PoisonError::into_inner);
        }
        true
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
