use derive_more::Display;
use indexmap::IndexMap as _IndexMap;
use ndarray::ArrayD;
use rustc_hash::FxBuildHasher;
use std::{collections::HashMap as _HashMap, error::Error, sync::Arc};

/// Dense state tensor. Layer state is shaped `[batch, *layer_shape]`.
pub type Tensor = ArrayD<f32>;
/// Boolean unit mask used by clamps and connection weight masks.
pub type Mask = ArrayD<bool>;

/// Error produced by an externally supplied behavior (layer, connection,
/// monitor or reward function).
pub type BehaviorError = Box<dyn Error + Send + Sync + 'static>;
/// Result returned by externally supplied behaviors.
pub type BehaviorResult<T = ()> = Result<T, BehaviorError>;

/// `HashMap` type with fast hasher.
pub type HashMap<K, V> = _HashMap<K, V, FxBuildHasher>;
/// `IndexMap` type with fast hasher.
pub type IndexMap<K, V> = _IndexMap<K, V, FxBuildHasher>;

/// Identity of a connection: the ordered pair of layer names it joins.
#[derive(Debug, Display, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("{source}->{target}")]
pub struct EdgeKey {
    /// Name of the layer whose spikes feed the connection.
    pub source: String,
    /// Name of the layer receiving the connection's contribution.
    pub target: String,
}

impl EdgeKey {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

/// Reward signal handed read-only to every connection update of a timestep.
#[derive(Debug, Clone, PartialEq)]
pub enum Reward {
    Scalar(f32),
    Tensor(Arc<Tensor>),
}

impl From<f32> for Reward {
    fn from(value: f32) -> Self {
        Self::Scalar(value)
    }
}

impl From<Tensor> for Reward {
    fn from(value: Tensor) -> Self {
        Self::Tensor(Arc::new(value))
    }
}
