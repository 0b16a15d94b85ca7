use crate::{
    behavior::{Connection, Layer, Monitor},
    executor::{Dispatcher, Executor, Sequential, ThreadPerTask, WorkerPool},
};
use core::num::NonZeroUsize;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Binds the concrete layer, connection and monitor types a network holds.
pub trait Config: Sized + 'static {
    type Layer: Layer;
    type Connection: Connection;
    type Monitor: Monitor;
}

/// `Config` for heterogeneous networks built from boxed trait objects.
#[derive(Debug, Clone, Copy, Default)]
pub struct DynConfig;

impl Config for DynConfig {
    type Layer = Box<dyn Layer>;
    type Connection = Box<dyn Connection>;
    type Monitor = Box<dyn Monitor>;
}

/// Invalid network or executor configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("simulation step must be positive and finite, got {0}")]
    InvalidDt(f32),
    #[error("batch size must be at least 1")]
    ZeroBatchSize,
    #[error("failed to spawn executor workers")]
    Spawn(#[from] std::io::Error),
}

/// Network-wide simulation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    /// Simulation step size.
    pub dt: f32,
    pub batch_size: usize,
    /// Whether connection updates are allowed to learn.
    pub learning: bool,
    pub executor: ExecutorConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            dt: 1.0,
            batch_size: 1,
            learning: true,
            executor: ExecutorConfig::Sequential,
        }
    }
}

impl NetworkConfig {
    pub fn with_executor(mut self, executor: ExecutorConfig) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_dt(mut self, dt: f32) -> Self {
        self.dt = dt;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_learning(mut self, learning: bool) -> Self {
        self.learning = learning;
        self
    }

    /// # Errors
    /// If `dt` is not a positive finite number or the batch size is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.dt.is_finite() && self.dt > 0.0) {
            return Err(ConfigError::InvalidDt(self.dt));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        Ok(())
    }
}

/// Concurrency strategy used to run the stage pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ExecutorConfig {
    /// Every task runs inline on the calling thread.
    #[default]
    Sequential,
    /// One short-lived thread per task, at most `n_threads` at a time.
    ThreadPerTask { n_threads: NonZeroUsize },
    /// `n_threads` long-lived workers fed through a job channel.
    WorkerPool {
        n_threads: NonZeroUsize,
        #[serde(default)]
        stage_timeout_ms: Option<u64>,
    },
    /// Long-lived workers that also split dense propagation into column
    /// partitions.
    Dispatcher {
        n_threads: NonZeroUsize,
        /// Upper bound on partitions per connection.
        partitions: NonZeroUsize,
        /// Connections narrower than twice this many output columns are not
        /// split.
        #[serde(default = "default_min_partition_columns")]
        min_partition_columns: usize,
        #[serde(default)]
        stage_timeout_ms: Option<u64>,
    },
}

fn default_min_partition_columns() -> usize {
    1
}

impl ExecutorConfig {
    /// Instantiate the executor. Pooled strategies spawn their workers here.
    ///
    /// # Errors
    /// If a worker thread cannot be spawned.
    pub fn build<C: Config>(&self) -> Result<Box<dyn Executor<C>>, ConfigError> {
        let timeout = |ms: Option<u64>| ms.map(Duration::from_millis);
        Ok(match *self {
            Self::Sequential => Box::new(Sequential),
            Self::ThreadPerTask { n_threads } => Box::new(ThreadPerTask::new(n_threads)),
            Self::WorkerPool {
                n_threads,
                stage_timeout_ms,
            } => Box::new(WorkerPool::spawn(n_threads)?.with_stage_timeout(timeout(stage_timeout_ms))),
            Self::Dispatcher {
                n_threads,
                partitions,
                min_partition_columns,
                stage_timeout_ms,
            } => Box::new(
                Dispatcher::spawn(n_threads, partitions)?
                    .with_min_partition_columns(min_partition_columns)
                    .with_stage_timeout(timeout(stage_timeout_ms)),
            ),
        })
    }
}
