use crate::{
    ops::DenseView,
    types::{BehaviorResult, EdgeKey, IndexMap, Mask, Reward, Tensor},
};
use derive_more::Display;
use std::sync::Arc;

/// A population of units whose state is advanced once per timestep.
///
/// The network owns every layer exclusively. While a forward task is in
/// flight the layer is moved into the task, so implementations never have to
/// synchronize internally.
pub trait Layer: Send + 'static {
    /// Declared unit shape, without the batch dimension.
    fn shape(&self) -> &[usize];

    /// Number of units (product of [`Layer::shape`]).
    fn units(&self) -> usize {
        self.shape().iter().product()
    }

    /// Spike state shaped `[batch, *shape]`.
    fn spikes(&self) -> &Tensor;

    fn spikes_mut(&mut self) -> &mut Tensor;

    /// Membrane potential shaped `[batch, *shape]`, if the layer has one.
    fn voltage_mut(&mut self) -> Option<&mut Tensor> {
        None
    }

    /// Named state variable exposed to monitors. `"s"` maps to the spikes.
    fn state_var(&self, name: &str) -> Option<&Tensor> {
        (name == "s").then(|| self.spikes())
    }

    /// Advance the layer by one timestep given its summed input.
    fn forward(&mut self, input: &Tensor) -> BehaviorResult;

    fn reset_state_variables(&mut self);

    fn set_batch_size(&mut self, batch_size: usize);

    fn compute_decays(&mut self, _dt: f32) {}

    fn set_training_mode(&mut self, _training: bool) {}
}

/// Read-only context of one connection update.
#[derive(Debug, Clone)]
pub struct UpdateContext {
    pub timestep: usize,
    /// Network-wide learning flag.
    pub learning: bool,
    /// Weight mask for this connection, if the caller supplied one.
    pub mask: Option<Arc<Mask>>,
    pub reward: Option<Reward>,
    /// Source spikes after this timestep's forward stage.
    pub source_spikes: Arc<Tensor>,
    /// Target spikes after this timestep's forward stage.
    pub target_spikes: Arc<Tensor>,
}

/// A directed, weighted relation between two layers.
pub trait Connection: Send + 'static {
    /// Contribution of the source spikes to the target, shaped
    /// `[batch, *target_shape]` (or any shape with the same element count).
    fn compute(&self, source_spikes: &Tensor) -> BehaviorResult<Tensor>;

    /// Dense projection equivalent to [`Connection::compute`].
    ///
    /// Executors that partition propagation across workers use this view
    /// instead of calling `compute`, so it must describe exactly what
    /// `compute` does.
    fn dense(&self) -> Option<DenseView> {
        None
    }

    fn update(&mut self, context: &UpdateContext) -> BehaviorResult;

    /// Post-run weight renormalization.
    fn normalize(&mut self) -> BehaviorResult {
        Ok(())
    }

    fn reset_state_variables(&mut self) {}

    fn set_dt(&mut self, _dt: f32) {}

    fn set_training_mode(&mut self, _training: bool) {}

    fn state_var(&self, _name: &str) -> Option<&Tensor> {
        None
    }
}

/// Object a monitor observes.
#[derive(Debug, Display, Clone, PartialEq, Eq, Hash)]
pub enum Observed {
    #[display("layer `{_0}`")]
    Layer(String),
    #[display("connection `{_0}`")]
    Connection(EdgeKey),
}

/// Values of the tracked state variables at one timestep, in the order the
/// monitor declared them.
pub type Sample = IndexMap<String, Tensor>;

/// Passive recorder of a layer's or connection's state over time.
pub trait Monitor: Send + 'static {
    fn target(&self) -> &Observed;

    /// Names of the state variables to sample every timestep.
    fn state_vars(&self) -> &[String];

    fn record(&mut self, sample: Sample) -> BehaviorResult;

    /// Clear the recording buffer.
    fn reset_state_variables(&mut self);
}

/// Inputs available to a reward function.
#[derive(Debug, Clone, Copy)]
pub struct RewardContext<'a> {
    pub timestep: usize,
    /// Reward passed in the run options, if any.
    pub supplied: Option<&'a Reward>,
}

/// Computes the reward handed to connection updates, once per timestep.
pub trait RewardFn: Send + 'static {
    fn compute(&mut self, context: &RewardContext<'_>) -> BehaviorResult<Reward>;
}

impl<T: Layer + ?Sized> Layer for Box<T> {
    fn shape(&self) -> &[usize] {
        (**self).shape()
    }
    fn units(&self) -> usize {
        (**self).units()
    }
    fn spikes(&self) -> &Tensor {
        (**self).spikes()
    }
    fn spikes_mut(&mut self) -> &mut Tensor {
        (**self).spikes_mut()
    }
    fn voltage_mut(&mut self) -> Option<&mut Tensor> {
        (**self).voltage_mut()
    }
    fn state_var(&self, name: &str) -> Option<&Tensor> {
        (**self).state_var(name)
    }
    fn forward(&mut self, input: &Tensor) -> BehaviorResult {
        (**self).forward(input)
    }
    fn reset_state_variables(&mut self) {
        (**self).reset_state_variables();
    }
    fn set_batch_size(&mut self, batch_size: usize) {
        (**self).set_batch_size(batch_size);
    }
    fn compute_decays(&mut self, dt: f32) {
        (**self).compute_decays(dt);
    }
    fn set_training_mode(&mut self, training: bool) {
        (**self).set_training_mode(training);
    }
}

impl<T: Connection + ?Sized> Connection for Box<T> {
    fn compute(&self, source_spikes: &Tensor) -> BehaviorResult<Tensor> {
        (**self).compute(source_spikes)
    }
    fn dense(&self) -> Option<DenseView> {
        (**self).dense()
    }
    fn update(&mut self, context: &UpdateContext) -> BehaviorResult {
        (**self).update(context)
    }
    fn normalize(&mut self) -> BehaviorResult {
        (**self).normalize()
    }
    fn reset_state_variables(&mut self) {
        (**self).reset_state_variables();
    }
    fn set_dt(&mut self, dt: f32) {
        (**self).set_dt(dt);
    }
    fn set_training_mode(&mut self, training: bool) {
        (**self).set_training_mode(training);
    }
    fn state_var(&self, name: &str) -> Option<&Tensor> {
        (**self).state_var(name)
    }
}

impl<T: Monitor + ?Sized> Monitor for Box<T> {
    fn target(&self) -> &Observed {
        (**self).target()
    }
    fn state_vars(&self) -> &[String] {
        (**self).state_vars()
    }
    fn record(&mut self, sample: Sample) -> BehaviorResult {
        (**self).record(sample)
    }
    fn reset_state_variables(&mut self) {
        (**self).reset_state_variables();
    }
}

impl<T: RewardFn + ?Sized> RewardFn for Box<T> {
    fn compute(&mut self, context: &RewardContext<'_>) -> BehaviorResult<Reward> {
        (**self).compute(context)
    }
}
