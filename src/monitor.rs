use crate::{
    behavior::{Monitor, Observed, Sample},
    types::{BehaviorResult, EdgeKey, IndexMap, Tensor},
};
use ndarray::{Axis, ShapeError};
use std::collections::VecDeque;
use thiserror::Error;

/// Reading a [`StateMonitor`] recording failed.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum RecordingError {
    #[error("state variable `{0}` is not tracked")]
    UnknownVar(String),
    #[error("nothing recorded for `{0}`")]
    Empty(String),
    #[error("recorded values of `{var}` cannot be stacked")]
    Shape {
        var: String,
        #[source]
        cause: ShapeError,
    },
}

/// Monitor keeping every sample in memory, optionally only the most recent
/// `time` ones.
#[derive(Debug, Clone)]
pub struct StateMonitor {
    target: Observed,
    state_vars: Vec<String>,
    time: Option<usize>,
    recording: IndexMap<String, VecDeque<Tensor>>,
}

impl StateMonitor {
    pub fn new<S: Into<String>>(target: Observed, state_vars: impl IntoIterator<Item = S>) -> Self {
        let state_vars: Vec<String> = state_vars.into_iter().map(Into::into).collect();
        let recording = state_vars.iter().map(|var| (var.clone(), VecDeque::new())).collect();
        Self {
            target,
            state_vars,
            time: None,
            recording,
        }
    }

    /// Monitor of a layer.
    pub fn layer<S: Into<String>>(name: impl Into<String>, state_vars: impl IntoIterator<Item = S>) -> Self {
        Self::new(Observed::Layer(name.into()), state_vars)
    }

    /// Monitor of the connection from `source` to `target`.
    pub fn connection<S: Into<String>>(
        source: impl Into<String>,
        target: impl Into<String>,
        state_vars: impl IntoIterator<Item = S>,
    ) -> Self {
        Self::new(Observed::Connection(EdgeKey::new(source, target)), state_vars)
    }

    /// Keep only the `time` most recent samples.
    pub fn with_time(mut self, time: usize) -> Self {
        self.time = Some(time);
        self
    }

    /// Recorded values of `var`, oldest first.
    pub fn get(&self, var: &str) -> Option<&VecDeque<Tensor>> {
        self.recording.get(var)
    }

    /// Recorded values of `var` stacked along a new leading time axis.
    ///
    /// # Errors
    /// If `var` is not tracked, nothing was recorded, or the recorded shapes
    /// differ.
    pub fn stacked(&self, var: &str) -> Result<Tensor, RecordingError> {
        let values = self
            .recording
            .get(var)
            .ok_or_else(|| RecordingError::UnknownVar(var.to_owned()))?;
        if values.is_empty() {
            return Err(RecordingError::Empty(var.to_owned()));
        }
        let views: Vec<_> = values.iter().map(Tensor::view).collect();
        ndarray::stack(Axis(0), &views).map_err(|cause| RecordingError::Shape {
            var: var.to_owned(),
            cause,
        })
    }

    /// Number of samples currently held.
    pub fn len(&self) -> usize {
        self.recording.values().next().map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Monitor for StateMonitor {
    fn target(&self) -> &Observed {
        &self.target
    }

    fn state_vars(&self) -> &[String] {
        &self.state_vars
    }

    fn record(&mut self, sample: Sample) -> BehaviorResult {
        for (var, value) in sample {
            let values = self
                .recording
                .get_mut(&var)
                .ok_or_else(|| format!("sample carries untracked state variable `{var}`"))?;
            values.push_back(value);
            if let Some(time) = self.time {
                while values.len() > time {
                    values.pop_front();
                }
            }
        }
        Ok(())
    }

    fn reset_state_variables(&mut self) {
        self.recording.values_mut().for_each(VecDeque::clear);
    }
}
