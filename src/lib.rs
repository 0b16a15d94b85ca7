//! Discrete-time spiking network simulator with interchangeable concurrency
//! strategies.
//!
//! A [`Network`] holds named layers (nodes with mutable state), connections
//! between ordered pairs of layers, and monitors recording state over time.
//! Every timestep runs a fixed pipeline of stages:
//! - gather: each connection projects its source spikes, contributions are
//!   summed per target layer in registration order;
//! - forward: each layer advances given its summed input, then clamps and
//!   voltage injections are applied;
//! - edge update: each connection adapts its weights, seeing the spikes
//!   produced by this timestep's forward stage;
//! - record: each monitor samples the state it tracks.
//!
//! After the last timestep every connection is normalized once.
//!
//! Within a stage tasks run concurrently; between stages there is a hard
//! barrier. A task owns the layer, connection or monitor it mutates while in
//! flight and hands it back when done, so no state is ever aliased across
//! threads and no locking of layer state is needed.
//!
//! Key modules:
//! - `behavior`: the `Layer`, `Connection`, `Monitor` and `RewardFn` contracts
//!   implemented by users.
//! - `config`: binds concrete behavior types via the `Config` trait and holds
//!   the serializable `NetworkConfig` / `ExecutorConfig`.
//! - `executor`: the `Executor` trait and its four strategies (sequential,
//!   thread-per-task, worker pool, partitioning dispatcher).
//! - `pipeline`: `Network::run` and the stage pipeline shared by all
//!   executors.
//!
//! Quick start:
//! 1. Implement `Layer` and `Connection` (and optionally `Monitor`, or use
//!    [`StateMonitor`]).
//! 2. Create a `Network` from a `NetworkConfig` choosing the executor.
//! 3. Register layers, connections and monitors, then call `Network::run`.
//!
//! All executors produce identical results for deterministic behaviors; the
//! sequential one is the reference.

/// Contracts of the externally supplied behaviors.
///
/// Layers, connections, monitors and the reward function are specified only
/// through the operations the pipeline calls on them.
pub mod behavior;
/// Type binding and serializable configuration.
pub mod config;
/// Concurrency strategies running one stage at a time.
///
/// Contains the `Executor` trait, its error type and the sequential,
/// thread-per-task, worker-pool and partitioning dispatcher strategies.
pub mod executor;
/// In-memory recording monitor.
pub mod monitor;
/// The network: registration, accessors and network-wide state changes.
pub mod network;
/// Dense projection helpers and column-partition reassembly.
pub mod ops;
pub mod pipeline;
/// Registration errors and the registry backing a network.
pub mod registry;
mod sync;
/// Dispatchable units of work and their completion records.
pub mod task;
/// Tensor, map and identifier types used across the crate.
pub mod types;
mod utils;

pub use config::{DynConfig, ExecutorConfig, NetworkConfig};
pub use monitor::StateMonitor;
pub use network::Network;
pub use pipeline::{Inputs, RunError, RunOptions};
