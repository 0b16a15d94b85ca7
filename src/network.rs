use crate::{
    behavior::{Connection, Layer, Monitor, RewardFn},
    config::{Config, ConfigError, DynConfig, NetworkConfig},
    executor::Executor,
    registry::{Registry, RegistryError},
    types::EdgeKey,
};
use core::fmt;
use rayon::iter::ParallelIterator;

/// A simulated network: registered layers, connections and monitors plus the
/// executor that runs the stage pipeline over them.
///
/// ```text
/// add_layer / add_connection / add_monitor ──► registry
/// run ──► per timestep: gather → forward → edge update → record
///     └─► after the last timestep: normalize
/// ```
pub struct Network<C: Config = DynConfig> {
    pub(crate) registry: Registry<C>,
    pub(crate) executor: Box<dyn Executor<C>>,
    pub(crate) reward_fn: Option<Box<dyn RewardFn>>,
    pub(crate) dt: f32,
    pub(crate) batch_size: usize,
    pub(crate) learning: bool,
    /// Set when an executor failure lost in-flight tasks and thereby some of
    /// the registered objects.
    pub(crate) poisoned: bool,
}

impl<C: Config> fmt::Debug for Network<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Network")
            .field("executor", &self.executor.strategy())
            .field("dt", &self.dt)
            .field("batch_size", &self.batch_size)
            .field("learning", &self.learning)
            .field("poisoned", &self.poisoned)
            .field("layers", &self.registry.layers.keys().collect::<Vec<_>>())
            .field("connections", &self.registry.connections.keys().collect::<Vec<_>>())
            .field("monitors", &self.registry.monitors.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl<C: Config> Network<C> {
    /// # Errors
    /// If the configuration is invalid or the executor's workers cannot be
    /// spawned.
    pub fn new(config: NetworkConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let executor = config.executor.build::<C>()?;
        tracing::debug!(
            strategy = executor.strategy(),
            dt = config.dt,
            batch_size = config.batch_size,
            "network created"
        );
        Ok(Self {
            registry: Registry::default(),
            executor,
            reward_fn: None,
            dt: config.dt,
            batch_size: config.batch_size,
            learning: config.learning,
            poisoned: false,
        })
    }

    /// Replace the executor built from the configuration.
    pub fn with_executor(mut self, executor: impl Executor<C> + 'static) -> Self {
        self.executor = Box::new(executor);
        self
    }

    /// Install the collaborator computing the reward at every timestep.
    pub fn set_reward_fn(&mut self, reward_fn: impl RewardFn) {
        self.reward_fn = Some(Box::new(reward_fn));
    }

    /// Register a layer under `name`.
    ///
    /// The layer adopts the network's training flag, step size and batch
    /// size.
    ///
    /// # Errors
    /// If `name` is already taken.
    pub fn add_layer(&mut self, name: impl Into<String>, mut layer: C::Layer) -> Result<(), RegistryError> {
        let name = name.into();
        layer.set_training_mode(self.learning);
        layer.compute_decays(self.dt);
        layer.set_batch_size(self.batch_size);
        let index = self.registry.insert_layer(name, layer)?;
        tracing::trace!(index, "layer registered");
        Ok(())
    }

    /// Register a connection from layer `source` to layer `target`.
    ///
    /// # Errors
    /// If either endpoint is not registered or the pair is already connected.
    pub fn add_connection(
        &mut self,
        source: impl Into<String>,
        target: impl Into<String>,
        mut connection: C::Connection,
    ) -> Result<(), RegistryError> {
        let edge = EdgeKey::new(source, target);
        connection.set_dt(self.dt);
        connection.set_training_mode(self.learning);
        let index = self.registry.insert_connection(edge, connection)?;
        tracing::trace!(index, "connection registered");
        Ok(())
    }

    /// Register a monitor under `name`.
    ///
    /// # Errors
    /// If `name` is already taken, or the observed object is not registered
    /// or does not expose one of the tracked state variables.
    pub fn add_monitor(&mut self, name: impl Into<String>, monitor: C::Monitor) -> Result<(), RegistryError> {
        let index = self.registry.insert_monitor(name.into(), monitor)?;
        tracing::trace!(index, "monitor registered");
        Ok(())
    }

    pub fn layer(&self, name: &str) -> Option<&C::Layer> {
        self.registry.layers.get(name)?.as_ref()
    }

    pub fn layer_mut(&mut self, name: &str) -> Option<&mut C::Layer> {
        self.registry.layers.get_mut(name)?.as_mut()
    }

    pub fn connection(&self, source: &str, target: &str) -> Option<&C::Connection> {
        self.registry
            .connections
            .get(&EdgeKey::new(source, target))?
            .slot
            .as_ref()
    }

    pub fn connection_mut(&mut self, source: &str, target: &str) -> Option<&mut C::Connection> {
        self.registry
            .connections
            .get_mut(&EdgeKey::new(source, target))?
            .slot
            .as_mut()
    }

    pub fn monitor(&self, name: &str) -> Option<&C::Monitor> {
        self.registry.monitors.get(name)?.as_ref()
    }

    pub fn monitor_mut(&mut self, name: &str) -> Option<&mut C::Monitor> {
        self.registry.monitors.get_mut(name)?.as_mut()
    }

    /// Layer names in registration order.
    pub fn layer_names(&self) -> impl Iterator<Item = &str> {
        self.registry.layers.keys().map(String::as_str)
    }

    /// Connection keys in registration order.
    pub fn connection_keys(&self) -> impl Iterator<Item = &EdgeKey> {
        self.registry.connections.keys()
    }

    /// Monitor names in registration order.
    pub fn monitor_names(&self) -> impl Iterator<Item = &str> {
        self.registry.monitors.keys().map(String::as_str)
    }

    pub fn dt(&self) -> f32 {
        self.dt
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn learning(&self) -> bool {
        self.learning
    }

    /// Name of the executor strategy in use.
    pub fn strategy(&self) -> &'static str {
        self.executor.strategy()
    }

    /// Whether a previous run lost in-flight tasks. A poisoned network
    /// refuses to run.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Reset the state of every layer, connection and monitor.
    pub fn reset_state_variables(&mut self) {
        let registry = &mut self.registry;
        registry.layers.par_values_mut().for_each(|slot| {
            if let Some(layer) = slot.as_mut() {
                layer.reset_state_variables();
            }
        });
        registry.connections.par_values_mut().for_each(|edge| {
            if let Some(connection) = edge.slot.as_mut() {
                connection.reset_state_variables();
            }
        });
        registry.monitors.par_values_mut().for_each(|slot| {
            if let Some(monitor) = slot.as_mut() {
                monitor.reset_state_variables();
            }
        });
    }

    /// Switch training on or off for every layer and connection.
    pub fn train(&mut self, mode: bool) {
        self.learning = mode;
        let registry = &mut self.registry;
        registry.layers.par_values_mut().for_each(|slot| {
            if let Some(layer) = slot.as_mut() {
                layer.set_training_mode(mode);
            }
        });
        registry.connections.par_values_mut().for_each(|edge| {
            if let Some(connection) = edge.slot.as_mut() {
                connection.set_training_mode(mode);
            }
        });
    }

    /// Adopt a new batch size: resize every layer and clear every monitor.
    pub(crate) fn adopt_batch_size(&mut self, batch_size: usize) {
        tracing::info!(from = self.batch_size, to = batch_size, "batch size changed");
        self.batch_size = batch_size;
        let registry = &mut self.registry;
        registry.layers.par_values_mut().for_each(|slot| {
            if let Some(layer) = slot.as_mut() {
                layer.set_batch_size(batch_size);
            }
        });
        registry.monitors.par_values_mut().for_each(|slot| {
            if let Some(monitor) = slot.as_mut() {
                monitor.reset_state_variables();
            }
        });
    }
}
