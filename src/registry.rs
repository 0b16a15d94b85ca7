use crate::{
    behavior::{Connection, Layer, Monitor, Observed, Sample},
    config::Config,
    types::{EdgeKey, IndexMap, Tensor},
};
use derive_more::{Deref, DerefMut};
use thiserror::Error;

/// Wiring error raised while a network is assembled.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RegistryError {
    #[error("layer `{0}` is already registered")]
    DuplicateLayer(String),
    #[error("connection {0} is already registered")]
    DuplicateConnection(EdgeKey),
    #[error("monitor `{0}` is already registered")]
    DuplicateMonitor(String),
    #[error("connection {edge} refers to unregistered layer `{layer}`")]
    UnknownEndpoint { edge: EdgeKey, layer: String },
    #[error("monitor `{monitor}` observes unregistered {target}")]
    UnknownTarget { monitor: String, target: Observed },
    #[error("monitor `{monitor}` tracks `{var}`, which {target} does not expose")]
    UnknownStateVar {
        monitor: String,
        target: Observed,
        var: String,
    },
}

/// Storage cell of a registered object.
///
/// The cell is empty only while the object travels inside a task, or after
/// the task carrying it was lost.
#[derive(Debug, Deref, DerefMut)]
pub(crate) struct Slot<T>(Option<T>);

impl<T> Slot<T> {
    fn new(value: T) -> Self {
        Self(Some(value))
    }

    /// Take the object out to hand it to a task.
    ///
    /// # Panics
    /// If the object is already out.
    pub(crate) fn vacate(&mut self) -> T {
        self.0.take().expect("Slot::vacate: [1]")
    }

    pub(crate) fn restore(&mut self, value: T) {
        debug_assert!(self.0.is_none(), "Slot::restore: [1]");
        self.0 = Some(value);
    }

    /// # Panics
    /// If the object is out.
    pub(crate) fn get(&self) -> &T {
        self.0.as_ref().expect("Slot::get: [1]")
    }

    /// # Panics
    /// If the object is out.
    pub(crate) fn get_mut(&mut self) -> &mut T {
        self.0.as_mut().expect("Slot::get_mut: [1]")
    }
}

/// A registered connection together with the registration indices of its
/// endpoints.
#[derive(Debug)]
pub(crate) struct Edge<T> {
    pub(crate) source: usize,
    pub(crate) target: usize,
    pub(crate) slot: Slot<T>,
}

/// Named layers, connections and monitors, each kept in registration order.
///
/// Registration order is the iteration order of every stage, which makes the
/// summation order of contributions deterministic.
pub(crate) struct Registry<C: Config> {
    pub(crate) layers: IndexMap<String, Slot<C::Layer>>,
    pub(crate) connections: IndexMap<EdgeKey, Edge<C::Connection>>,
    pub(crate) monitors: IndexMap<String, Slot<C::Monitor>>,
}

impl<C: Config> Default for Registry<C> {
    fn default() -> Self {
        Self {
            layers: IndexMap::default(),
            connections: IndexMap::default(),
            monitors: IndexMap::default(),
        }
    }
}

impl<C: Config> Registry<C> {
    pub(crate) fn insert_layer(&mut self, name: String, layer: C::Layer) -> Result<usize, RegistryError> {
        if self.layers.contains_key(&name) {
            return Err(RegistryError::DuplicateLayer(name));
        }
        Ok(self.layers.insert_full(name, Slot::new(layer)).0)
    }

    pub(crate) fn insert_connection(
        &mut self,
        edge: EdgeKey,
        connection: C::Connection,
    ) -> Result<usize, RegistryError> {
        if self.connections.contains_key(&edge) {
            return Err(RegistryError::DuplicateConnection(edge));
        }
        let endpoint = |name: &String| {
            self.layers
                .get_index_of(name)
                .ok_or_else(|| RegistryError::UnknownEndpoint {
                    edge: edge.clone(),
                    layer: name.clone(),
                })
        };
        let source = endpoint(&edge.source)?;
        let target = endpoint(&edge.target)?;
        let entry = Edge {
            source,
            target,
            slot: Slot::new(connection),
        };
        Ok(self.connections.insert_full(edge, entry).0)
    }

    pub(crate) fn insert_monitor(&mut self, name: String, monitor: C::Monitor) -> Result<usize, RegistryError> {
        if self.monitors.contains_key(&name) {
            return Err(RegistryError::DuplicateMonitor(name));
        }
        let target = monitor.target();
        if !self.observes(target) {
            return Err(RegistryError::UnknownTarget {
                monitor: name,
                target: target.clone(),
            });
        }
        if let Some(var) = monitor
            .state_vars()
            .iter()
            .find(|var| self.state_var(target, var).is_none())
        {
            return Err(RegistryError::UnknownStateVar {
                monitor: name,
                target: target.clone(),
                var: var.clone(),
            });
        }
        Ok(self.monitors.insert_full(name, Slot::new(monitor)).0)
    }

    fn observes(&self, target: &Observed) -> bool {
        match target {
            Observed::Layer(name) => self.layers.contains_key(name),
            Observed::Connection(edge) => self.connections.contains_key(edge),
        }
    }

    fn state_var(&self, target: &Observed, var: &str) -> Option<&Tensor> {
        match target {
            Observed::Layer(name) => self.layers.get(name)?.as_ref()?.state_var(var),
            Observed::Connection(edge) => self.connections.get(edge)?.slot.as_ref()?.state_var(var),
        }
    }

    /// Current values of the state variables `monitor` tracks.
    ///
    /// # Errors
    /// With the name of the first variable the observed object does not
    /// expose.
    pub(crate) fn sample(&self, monitor: &C::Monitor) -> Result<Sample, String> {
        let target = monitor.target();
        monitor
            .state_vars()
            .iter()
            .map(|var| match self.state_var(target, var) {
                Some(value) => Ok((var.clone(), value.clone())),
                None => Err(var.clone()),
            })
            .collect()
    }
}
