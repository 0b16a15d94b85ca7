#![allow(dead_code)]

use core::num::NonZeroUsize;
use csn::{
    ExecutorConfig, Network, NetworkConfig,
    behavior::{Connection, Layer, UpdateContext},
    config::Config,
    monitor::StateMonitor,
    ops::DenseView,
    types::{BehaviorResult, Reward, Tensor},
};
use ndarray::{Array1, Array2, ArrayD, Ix2, IxDyn, Zip};
use std::{sync::Arc, thread, time::Duration};

pub struct TestConfig;

impl Config for TestConfig {
    type Layer = TestLayer;
    type Connection = TestConnection;
    type Monitor = StateMonitor;
}

/// Misbehavior injected on the n-th call (0-based) of `forward` or `update`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Fault {
    Fail(usize),
    Panic(usize),
    Stall(usize, Duration),
}

fn trigger(fault: Option<Fault>, call: usize) -> BehaviorResult {
    match fault {
        Some(Fault::Fail(at)) if at == call => Err(format!("injected failure at call {call}").into()),
        Some(Fault::Panic(at)) if at == call => panic!("injected panic at call {call}"),
        Some(Fault::Stall(at, pause)) if at == call => {
            thread::sleep(pause);
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Leaky threshold unit: `v = decay * v + input`, spike when `v >= threshold`,
/// reset to zero after a spike.
#[derive(Debug, Clone, PartialEq)]
pub struct TestLayer {
    shape: Vec<usize>,
    pub spikes: Tensor,
    pub voltage: Option<Tensor>,
    pub threshold: f32,
    pub decay: f32,
    pub dt: Option<f32>,
    pub training: bool,
    /// Every input handed to `forward`, in call order.
    pub received: Vec<Tensor>,
    pub resizes: usize,
    pub resets: usize,
    pub fault: Option<Fault>,
}

impl TestLayer {
    pub fn new(shape: &[usize]) -> Self {
        let state = zeros(1, shape);
        Self {
            shape: shape.to_vec(),
            spikes: state.clone(),
            voltage: Some(state),
            threshold: 0.5,
            decay: 0.5,
            dt: None,
            training: false,
            received: Vec::new(),
            resizes: 0,
            resets: 0,
            fault: None,
        }
    }

    pub fn without_voltage(mut self) -> Self {
        self.voltage = None;
        self
    }

    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.fault = Some(fault);
        self
    }
}

impl Layer for TestLayer {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn spikes(&self) -> &Tensor {
        &self.spikes
    }

    fn spikes_mut(&mut self) -> &mut Tensor {
        &mut self.spikes
    }

    fn voltage_mut(&mut self) -> Option<&mut Tensor> {
        self.voltage.as_mut()
    }

    fn state_var(&self, name: &str) -> Option<&Tensor> {
        match name {
            "s" => Some(&self.spikes),
            "v" => self.voltage.as_ref(),
            _ => None,
        }
    }

    fn forward(&mut self, input: &Tensor) -> BehaviorResult {
        trigger(self.fault, self.received.len())?;
        self.received.push(input.clone());
        let threshold = self.threshold;
        let potential = match &mut self.voltage {
            Some(voltage) => {
                let decay = self.decay;
                voltage.mapv_inplace(|v| v * decay);
                *voltage += input;
                voltage.clone()
            }
            None => input.clone(),
        };
        self.spikes = potential.mapv(|v| if v >= threshold { 1.0 } else { 0.0 });
        if let Some(voltage) = &mut self.voltage {
            Zip::from(voltage).and(&self.spikes).for_each(|v, &s| {
                if s > 0.0 {
                    *v = 0.0;
                }
            });
        }
        Ok(())
    }

    fn reset_state_variables(&mut self) {
        self.resets += 1;
        self.spikes.fill(0.0);
        if let Some(voltage) = &mut self.voltage {
            voltage.fill(0.0);
        }
    }

    fn set_batch_size(&mut self, batch_size: usize) {
        self.resizes += 1;
        self.spikes = zeros(batch_size, &self.shape);
        if self.voltage.is_some() {
            self.voltage = Some(zeros(batch_size, &self.shape));
        }
    }

    fn compute_decays(&mut self, dt: f32) {
        self.dt = Some(dt);
    }

    fn set_training_mode(&mut self, training: bool) {
        self.training = training;
    }
}

/// What a connection saw in one `update` call.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateRecord {
    pub timestep: usize,
    pub learning: bool,
    pub masked: bool,
    pub reward: Option<Reward>,
    pub source: Tensor,
    pub target: Tensor,
}

/// Dense connection with a Hebbian update `w += rate * pre^T post`.
#[derive(Debug, Clone, PartialEq)]
pub struct TestConnection {
    pub weights: Arc<Array2<f32>>,
    pub bias: Option<Arc<Array1<f32>>>,
    /// Whether the dense view is exposed for partitioning.
    pub dense: bool,
    pub rate: f32,
    pub activity: Tensor,
    pub updates: Vec<UpdateRecord>,
    pub normalizations: usize,
    pub resets: usize,
    pub dt: Option<f32>,
    pub training: bool,
    pub fault: Option<Fault>,
}

impl TestConnection {
    pub fn new(weights: Array2<f32>) -> Self {
        Self {
            weights: Arc::new(weights),
            bias: None,
            dense: true,
            rate: 0.0,
            activity: ArrayD::zeros(IxDyn(&[1])),
            updates: Vec::new(),
            normalizations: 0,
            resets: 0,
            dt: None,
            training: false,
            fault: None,
        }
    }

    /// Deterministic mixed-sign weights.
    pub fn patterned(n_in: usize, n_out: usize) -> Self {
        let weights = Array2::from_shape_fn((n_in, n_out), |(i, j)| ((i * 7 + j * 3) % 5) as f32 * 0.25 - 0.4);
        Self::new(weights)
    }

    pub fn with_bias(mut self, bias: Array1<f32>) -> Self {
        self.bias = Some(Arc::new(bias));
        self
    }

    /// Hide the dense view, so the connection is never partitioned.
    pub fn opaque(mut self) -> Self {
        self.dense = false;
        self
    }

    pub fn learning_rate(mut self, rate: f32) -> Self {
        self.rate = rate;
        self
    }

    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.fault = Some(fault);
        self
    }

    fn view(&self) -> DenseView {
        DenseView::new(Arc::clone(&self.weights), self.bias.clone())
    }
}

impl Connection for TestConnection {
    fn compute(&self, source_spikes: &Tensor) -> BehaviorResult<Tensor> {
        self.view().compute(source_spikes)
    }

    fn dense(&self) -> Option<DenseView> {
        self.dense.then(|| self.view())
    }

    fn update(&mut self, context: &UpdateContext) -> BehaviorResult {
        trigger(self.fault, self.updates.len())?;
        self.updates.push(UpdateRecord {
            timestep: context.timestep,
            learning: context.learning,
            masked: context.mask.is_some(),
            reward: context.reward.clone(),
            source: (*context.source_spikes).clone(),
            target: (*context.target_spikes).clone(),
        });
        self.activity = (*context.target_spikes).clone();
        if !(context.learning && self.training) || self.rate == 0.0 {
            return Ok(());
        }
        let (n_in, n_out) = self.weights.dim();
        let batch = context.source_spikes.shape()[0];
        let pre = context.source_spikes.to_shape((batch, n_in))?;
        let post = context.target_spikes.to_shape((batch, n_out))?;
        let rate = self.rate;
        let weights = Arc::make_mut(&mut self.weights);
        for b in 0..batch {
            for i in 0..n_in {
                for j in 0..n_out {
                    weights[[i, j]] += rate * pre[[b, i]] * post[[b, j]];
                }
            }
        }
        if let Some(mask) = &context.mask {
            let mask = mask.view().into_dimensionality::<Ix2>()?;
            Zip::from(weights).and(&mask).for_each(|w, &keep| {
                if !keep {
                    *w = 0.0;
                }
            });
        }
        Ok(())
    }

    fn normalize(&mut self) -> BehaviorResult {
        self.normalizations += 1;
        Ok(())
    }

    fn reset_state_variables(&mut self) {
        self.resets += 1;
        self.activity.fill(0.0);
    }

    fn set_dt(&mut self, dt: f32) {
        self.dt = Some(dt);
    }

    fn set_training_mode(&mut self, training: bool) {
        self.training = training;
    }

    fn state_var(&self, name: &str) -> Option<&Tensor> {
        (name == "activity").then_some(&self.activity)
    }
}

pub fn zeros(batch: usize, shape: &[usize]) -> Tensor {
    let dims: Vec<usize> = [batch].iter().chain(shape).copied().collect();
    ArrayD::zeros(IxDyn(&dims))
}

fn threads(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap()
}

/// One configuration per strategy.
pub fn executors() -> Vec<ExecutorConfig> {
    vec![
        ExecutorConfig::Sequential,
        ExecutorConfig::ThreadPerTask { n_threads: threads(2) },
        ExecutorConfig::WorkerPool {
            n_threads: threads(3),
            stage_timeout_ms: Some(30_000),
        },
        ExecutorConfig::Dispatcher {
            n_threads: threads(3),
            partitions: threads(4),
            min_partition_columns: 1,
            stage_timeout_ms: Some(30_000),
        },
    ]
}

pub fn network(executor: ExecutorConfig) -> Network<TestConfig> {
    Network::new(NetworkConfig::default().with_executor(executor)).unwrap()
}
