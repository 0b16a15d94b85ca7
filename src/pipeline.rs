//! The per-timestep stage pipeline shared by every executor.
//!
//! ```text
//! validate ─► ┌ reward ─► gather ─► forward + effects ─► update ─► record ┐ ─► normalize
//!             └──────────────────── once per timestep ◄────────────────────┘
//! ```
//!
//! Every arrow between stages is a barrier: the executor returns only after
//! every task of the stage has completed and handed back the object it
//! owned.

use crate::{
    behavior::{Layer, RewardContext, RewardFn, UpdateContext},
    config::Config,
    executor::{ExecError, Stage},
    network::Network,
    ops,
    task::{Item, Outcome, Payload, SideEffects, Task, TaskFailure, TaskKind},
    types::{BehaviorError, EdgeKey, HashMap, IndexMap, Mask, Reward, Tensor},
};
use ndarray::{Axis, IxDyn};
use std::sync::Arc;
use thiserror::Error;

/// External stimulus per layer name, shaped `[time, batch, *shape]`.
///
/// `[features]` and `[time, features]` are accepted as shorthands with a
/// batch of one.
pub type Inputs = IndexMap<String, Tensor>;

/// Per-run options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Recompute each layer's input right before that layer's update, so
    /// layers registered later see this timestep's spikes of earlier ones.
    pub one_step: bool,
    /// Units forced to spike after the forward pass.
    pub clamp: HashMap<String, Mask>,
    /// Units forced to stay silent after the forward pass.
    pub unclamp: HashMap<String, Mask>,
    /// Values added to the membrane potential after the forward pass.
    pub injects_v: HashMap<String, Tensor>,
    /// Weight masks handed to connection updates.
    pub masks: HashMap<EdgeKey, Mask>,
    pub reward: Option<Reward>,
}

impl RunOptions {
    pub fn one_step(mut self, one_step: bool) -> Self {
        self.one_step = one_step;
        self
    }

    pub fn clamp(mut self, layer: impl Into<String>, mask: Mask) -> Self {
        self.clamp.insert(layer.into(), mask);
        self
    }

    pub fn unclamp(mut self, layer: impl Into<String>, mask: Mask) -> Self {
        self.unclamp.insert(layer.into(), mask);
        self
    }

    pub fn inject_v(mut self, layer: impl Into<String>, values: Tensor) -> Self {
        self.injects_v.insert(layer.into(), values);
        self
    }

    pub fn mask(mut self, source: impl Into<String>, target: impl Into<String>, mask: Mask) -> Self {
        self.masks.insert(EdgeKey::new(source, target), mask);
        self
    }

    pub fn reward(mut self, reward: impl Into<Reward>) -> Self {
        self.reward = Some(reward.into());
        self
    }
}

/// Failure of [`Network::run`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunError {
    #[error("network is poisoned: a previous run lost in-flight tasks")]
    Poisoned,
    #[error("simulation time must be finite and non-negative, got {0}")]
    InvalidTime(f32),
    #[error("{role} refers to unregistered layer `{name}`")]
    UnknownLayer { role: &'static str, name: String },
    #[error("mask refers to unregistered connection {0}")]
    UnknownConnection(EdgeKey),
    #[error("input for layer `{layer}` has shape {actual:?}, layer shape is {expected:?}")]
    InputShape {
        layer: String,
        actual: Vec<usize>,
        expected: Vec<usize>,
    },
    #[error("input for layer `{layer}` covers {steps} timestep(s), the run needs {timesteps}")]
    InputTooShort {
        layer: String,
        steps: usize,
        timesteps: usize,
    },
    #[error("inputs disagree on batch size: `{first}` has {first_batch}, `{layer}` has {batch}")]
    InconsistentBatch {
        first: String,
        first_batch: usize,
        layer: String,
        batch: usize,
    },
    #[error("{role} for layer `{layer}` has shape {actual:?}, expected [{units}] or [{timesteps}+, {units}]")]
    OptionShape {
        role: &'static str,
        layer: String,
        actual: Vec<usize>,
        units: usize,
        timesteps: usize,
    },
    #[error("voltage injection into layer `{0}`, which has no membrane potential")]
    NoVoltage(String),
    #[error("reward computation failed at timestep {timestep}")]
    Reward {
        timestep: usize,
        #[source]
        cause: BehaviorError,
    },
    #[error("monitor `{monitor}` tracks `{var}`, which is no longer exposed")]
    MissingStateVar { monitor: String, var: String },
    #[error("connection {edge} contributed shape {actual:?}, target expects {expected:?}")]
    ContributionShape {
        edge: EdgeKey,
        actual: Vec<usize>,
        expected: Vec<usize>,
    },
    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Validated run inputs, indexed by registration slot.
struct Plan {
    timesteps: usize,
    /// Batch dimension shared by all inputs, if any were supplied.
    batch: Option<usize>,
    inputs: Vec<Option<Tensor>>,
    effects: Vec<SideEffects>,
    masks: Vec<Option<Arc<Mask>>>,
}

impl<C: Config> Network<C> {
    /// Simulate the network for `time` units of simulated time, that is
    /// `time / dt` timesteps.
    ///
    /// All inputs and options are validated before the first stage runs. If
    /// the inputs carry a batch size different from the current one, it is
    /// adopted first: every layer is resized and every monitor cleared.
    ///
    /// # Errors
    /// See [`RunError`]. After a task failure the run stops at the end of the
    /// failing stage and the network stays usable. After an executor failure
    /// the network is poisoned.
    pub fn run(&mut self, inputs: &Inputs, time: f32, options: &RunOptions) -> Result<(), RunError> {
        let plan = self.plan(inputs, time, options)?;
        if let Some(batch) = plan.batch.filter(|&batch| batch != self.batch_size) {
            self.adopt_batch_size(batch);
        }
        tracing::debug!(
            timesteps = plan.timesteps,
            batch_size = self.batch_size,
            strategy = self.executor.strategy(),
            one_step = options.one_step,
            "run started"
        );

        for timestep in 0..plan.timesteps {
            let reward = self.reward(timestep, options.reward.as_ref())?;
            if options.one_step {
                for layer in 0..self.registry.layers.len() {
                    let inputs = self.gather(&plan, timestep, Some(layer))?;
                    self.forward(&plan, timestep, inputs)?;
                }
            } else {
                let inputs = self.gather(&plan, timestep, None)?;
                self.forward(&plan, timestep, inputs)?;
            }
            self.update(&plan, timestep, reward)?;
            self.record()?;
        }

        let tasks = self
            .registry
            .connections
            .values_mut()
            .enumerate()
            .map(|(slot, edge)| Task::normalize(slot, edge.slot.vacate()))
            .collect();
        self.dispatch(Stage::Normalize, tasks)?;
        tracing::debug!("run finished");
        Ok(())
    }

    fn plan(&mut self, inputs: &Inputs, time: f32, options: &RunOptions) -> Result<Plan, RunError> {
        if self.poisoned {
            return Err(RunError::Poisoned);
        }
        if !(time.is_finite() && time >= 0.0) {
            return Err(RunError::InvalidTime(time));
        }
        let timesteps = (time / self.dt) as usize;

        let layers = &mut self.registry.layers;
        let mut plan = Plan {
            timesteps,
            batch: None,
            inputs: vec![None; layers.len()],
            effects: vec![SideEffects::default(); layers.len()],
            masks: vec![None; self.registry.connections.len()],
        };

        let mut first: Option<(&str, usize)> = None;
        for (name, input) in inputs {
            let (index, _, slot) = layers.get_full(name).ok_or_else(|| RunError::UnknownLayer {
                role: "input",
                name: name.clone(),
            })?;
            let input = normalize_input(name, input, slot.get().shape(), timesteps)?;
            let batch = input.len_of(Axis(1));
            match first {
                Some((first, first_batch)) if first_batch != batch => {
                    return Err(RunError::InconsistentBatch {
                        first: first.to_owned(),
                        first_batch,
                        layer: name.clone(),
                        batch,
                    });
                }
                Some(_) => {}
                None => first = Some((name.as_str(), batch)),
            }
            plan.inputs[index] = Some(input);
        }
        plan.batch = first.map(|(_, batch)| batch);

        for (role, masks) in [("clamp", &options.clamp), ("unclamp", &options.unclamp)] {
            for (name, mask) in masks {
                let (index, _, slot) = layers
                    .get_full(name)
                    .ok_or_else(|| RunError::UnknownLayer {
                        role,
                        name: name.clone(),
                    })?;
                check_option(role, name, mask.shape(), slot.get().units(), timesteps)?;
                let mask = Some(Arc::new(mask.clone()));
                match role {
                    "clamp" => plan.effects[index].clamp = mask,
                    _ => plan.effects[index].unclamp = mask,
                }
            }
        }
        for (name, values) in &options.injects_v {
            let (index, _, slot) = layers
                .get_full_mut(name)
                .ok_or_else(|| RunError::UnknownLayer {
                    role: "voltage injection",
                    name: name.clone(),
                })?;
            let layer = slot.get_mut();
            check_option("voltage injection", name, values.shape(), layer.units(), timesteps)?;
            if layer.voltage_mut().is_none() {
                return Err(RunError::NoVoltage(name.clone()));
            }
            plan.effects[index].inject_v = Some(Arc::new(values.clone()));
        }
        for (edge, mask) in &options.masks {
            let index = self
                .registry
                .connections
                .get_index_of(edge)
                .ok_or_else(|| RunError::UnknownConnection(edge.clone()))?;
            plan.masks[index] = Some(Arc::new(mask.clone()));
        }
        Ok(plan)
    }

    fn reward(&mut self, timestep: usize, supplied: Option<&Reward>) -> Result<Option<Reward>, RunError> {
        let Some(reward_fn) = self.reward_fn.as_mut() else {
            return Ok(supplied.cloned());
        };
        let context = RewardContext { timestep, supplied };
        reward_fn
            .compute(&context)
            .map(Some)
            .map_err(|cause| RunError::Reward { timestep, cause })
    }

    /// Summed input of every layer selected by `only` (all layers when
    /// `None`), indexed by layer slot.
    fn gather(&mut self, plan: &Plan, timestep: usize, only: Option<usize>) -> Result<Vec<Option<Tensor>>, RunError> {
        let selected = |layer: usize| only.is_none_or(|only| only == layer);
        let layers = &self.registry.layers;

        let mut snapshots: HashMap<usize, Arc<Tensor>> = HashMap::default();
        let mut tasks = Vec::new();
        for (slot, edge) in self.registry.connections.values_mut().enumerate() {
            if !selected(edge.target) {
                continue;
            }
            let source = snapshots
                .entry(edge.source)
                .or_insert_with(|| Arc::new(layers[edge.source].get().spikes().clone()));
            tasks.push(Task::propagate(slot, edge.slot.vacate(), Arc::clone(source)));
        }
        let contributions = self.dispatch(Stage::InputGather, tasks)?;

        let batch = self.batch_size;
        let mut inputs: Vec<Option<Tensor>> = self
            .registry
            .layers
            .values()
            .enumerate()
            .map(|(index, slot)| {
                selected(index).then(|| {
                    let shape: Vec<usize> = [batch].iter().chain(slot.get().shape()).copied().collect();
                    Tensor::zeros(IxDyn(&shape))
                })
            })
            .collect();

        // Contributions arrive sorted by slot, so the summation order is the
        // registration order of the connections.
        for (slot, payload) in contributions {
            let Payload::Contribution(contribution) = payload else {
                unreachable!("Network::gather: [1]");
            };
            let (edge, entry) = self
                .registry
                .connections
                .get_index(slot)
                .expect("Network::gather: [2]");
            let accumulator = inputs[entry.target].as_mut().expect("Network::gather: [3]");
            let actual = contribution.shape().to_vec();
            let contribution =
                ops::conform(contribution, accumulator.shape()).ok_or_else(|| RunError::ContributionShape {
                    edge: edge.clone(),
                    actual,
                    expected: accumulator.shape().to_vec(),
                })?;
            *accumulator += &contribution;
        }

        for (index, accumulator) in inputs.iter_mut().enumerate() {
            let (Some(accumulator), Some(input)) = (accumulator.as_mut(), &plan.inputs[index]) else {
                continue;
            };
            let step = if input.len_of(Axis(0)) == 1 { 0 } else { timestep };
            *accumulator += &input.index_axis(Axis(0), step);
        }
        Ok(inputs)
    }

    fn forward(&mut self, plan: &Plan, timestep: usize, inputs: Vec<Option<Tensor>>) -> Result<(), RunError> {
        let layers = &mut self.registry.layers;
        let tasks = inputs
            .into_iter()
            .enumerate()
            .filter_map(|(slot, input)| {
                let input = input?;
                let effects = SideEffects {
                    timestep,
                    ..plan.effects[slot].clone()
                };
                Some(Task::forward(slot, layers[slot].vacate(), input, effects))
            })
            .collect();
        self.dispatch(Stage::Forward, tasks)?;
        Ok(())
    }

    fn update(&mut self, plan: &Plan, timestep: usize, reward: Option<Reward>) -> Result<(), RunError> {
        if self.registry.connections.is_empty() {
            return Ok(());
        }
        let spikes: Vec<Arc<Tensor>> = self
            .registry
            .layers
            .values()
            .map(|slot| Arc::new(slot.get().spikes().clone()))
            .collect();
        let learning = self.learning;
        let tasks = self
            .registry
            .connections
            .values_mut()
            .enumerate()
            .map(|(slot, edge)| {
                let context = UpdateContext {
                    timestep,
                    learning,
                    mask: plan.masks[slot].clone(),
                    reward: reward.clone(),
                    source_spikes: Arc::clone(&spikes[edge.source]),
                    target_spikes: Arc::clone(&spikes[edge.target]),
                };
                Task::connection_update(slot, edge.slot.vacate(), context)
            })
            .collect();
        self.dispatch(Stage::EdgeUpdate, tasks)?;
        Ok(())
    }

    fn record(&mut self) -> Result<(), RunError> {
        let registry = &self.registry;
        let samples = registry
            .monitors
            .iter()
            .map(|(name, slot)| {
                registry.sample(slot.get()).map_err(|var| RunError::MissingStateVar {
                    monitor: name.clone(),
                    var,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let tasks = self
            .registry
            .monitors
            .values_mut()
            .zip(samples)
            .enumerate()
            .map(|(slot, (monitor, sample))| Task::record(slot, monitor.vacate(), sample))
            .collect();
        self.dispatch(Stage::Record, tasks)?;
        Ok(())
    }

    /// Run one stage, hand every returned object back to the registry and
    /// turn the first failure (by slot) into an error.
    ///
    /// Successful payloads are returned sorted by slot.
    fn dispatch(&mut self, stage: Stage, tasks: Vec<Task<C>>) -> Result<Vec<(usize, Payload)>, RunError> {
        let expected = tasks.len();
        if expected == 0 {
            return Ok(Vec::new());
        }
        tracing::debug!(%stage, tasks = expected, "stage started");
        let outcomes = self
            .executor
            .run_stage(stage, tasks)
            .and_then(|outcomes| {
                if outcomes.len() == expected {
                    Ok(outcomes)
                } else {
                    Err(ExecError::CompletionMismatch {
                        stage,
                        expected,
                        actual: outcomes.len(),
                    })
                }
            })
            .inspect_err(|error| {
                if error.loses_tasks() {
                    tracing::warn!(%stage, %error, "executor failed, network poisoned");
                    self.poisoned = true;
                }
            })?;

        let mut payloads = Vec::with_capacity(expected);
        let mut failure: Option<(usize, TaskKind, TaskFailure)> = None;
        for Outcome {
            slot,
            kind,
            item,
            result,
        } in outcomes
        {
            self.restore(slot, item);
            match result {
                Ok(payload) => payloads.push((slot, payload)),
                Err(error) if failure.as_ref().is_none_or(|(first, ..)| slot < *first) => {
                    failure = Some((slot, kind, error));
                }
                Err(_) => {}
            }
        }

        if let Some((slot, kind, failure)) = failure {
            let label = self.label(kind, slot);
            let error = match failure {
                TaskFailure::Error(cause) => ExecError::Task {
                    stage,
                    kind,
                    label,
                    cause,
                },
                TaskFailure::Panic(message) => ExecError::Panicked {
                    stage,
                    kind,
                    label,
                    message,
                },
            };
            tracing::warn!(%stage, %error, "task failed");
            return Err(error.into());
        }
        payloads.sort_unstable_by_key(|(slot, _)| *slot);
        tracing::debug!(%stage, "stage finished");
        Ok(payloads)
    }

    fn restore(&mut self, slot: usize, item: Item<C>) {
        let registry = &mut self.registry;
        match item {
            Item::Layer(layer) => registry.layers[slot].restore(layer),
            Item::Connection(connection) => registry.connections[slot].slot.restore(connection),
            Item::Monitor(monitor) => registry.monitors[slot].restore(monitor),
            Item::Nothing => {}
        }
    }

    fn label(&self, kind: TaskKind, slot: usize) -> String {
        let registry = &self.registry;
        let label = match kind {
            TaskKind::Forward => registry
                .layers
                .get_index(slot)
                .map(|(name, _)| format!("layer `{name}`")),
            TaskKind::Record => registry
                .monitors
                .get_index(slot)
                .map(|(name, _)| format!("monitor `{name}`")),
            TaskKind::Propagate | TaskKind::ComputePartition | TaskKind::ConnectionUpdate | TaskKind::Normalize => {
                registry
                    .connections
                    .get_index(slot)
                    .map(|(edge, _)| format!("connection {edge}"))
            }
        };
        label.unwrap_or_else(|| format!("slot {slot}"))
    }
}

/// Bring an input to `[time, batch, *shape]` and check it covers the run.
fn normalize_input(layer: &str, input: &Tensor, shape: &[usize], timesteps: usize) -> Result<Tensor, RunError> {
    let invalid = || RunError::InputShape {
        layer: layer.to_owned(),
        actual: input.shape().to_vec(),
        expected: shape.to_vec(),
    };
    let lead = match *input.shape() {
        [] => return Err(invalid()),
        [_] => [1, 1],
        [steps, _] => [steps, 1],
        [steps, batch, ..] => [steps, batch],
    };
    if lead.contains(&0) {
        return Err(invalid());
    }
    let expected: Vec<usize> = lead.iter().chain(shape).copied().collect();
    let input = ops::conform(input.clone(), &expected).ok_or_else(invalid)?;
    let steps = lead[0];
    if steps != 1 && steps < timesteps {
        return Err(RunError::InputTooShort {
            layer: layer.to_owned(),
            steps,
            timesteps,
        });
    }
    Ok(input)
}

/// Per-unit `[units]` or per-timestep `[time, units]` with `time` covering
/// the run.
fn check_option(
    role: &'static str,
    layer: &str,
    actual: &[usize],
    units: usize,
    timesteps: usize,
) -> Result<(), RunError> {
    let valid = match *actual {
        [width] => width == units,
        [steps, width] => width == units && steps >= timesteps,
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(RunError::OptionShape {
            role,
            layer: layer.to_owned(),
            actual: actual.to_vec(),
            units,
            timesteps,
        })
    }
}
