use crate::{
    behavior::{Connection, Layer, Monitor, Sample, UpdateContext},
    config::Config,
    ops::{self, DenseView},
    types::{BehaviorError, BehaviorResult, Mask, Tensor},
};
use core::ops::Range;
use derive_more::{Debug, Display};
use ndarray::{Array2, Ix1, Zip};
use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

/// Kind tag of a dispatchable unit of work.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    #[display("propagate")]
    Propagate,
    #[display("compute_partition")]
    ComputePartition,
    #[display("forward")]
    Forward,
    #[display("connection_update")]
    ConnectionUpdate,
    #[display("record")]
    Record,
    #[display("normalize")]
    Normalize,
}

/// A unit of work consumed exactly once by exactly one worker.
///
/// A task owns the layer, connection or monitor it operates on for as long as
/// it is in flight, and returns it through its [`Outcome`]. No state is ever
/// shared mutably between concurrently running tasks.
#[derive(Debug)]
pub struct Task<C: Config> {
    /// Registration index of the object the task operates on.
    pub(crate) slot: usize,
    pub(crate) work: Work<C>,
}

#[derive(Debug)]
pub(crate) enum Work<C: Config> {
    Propagate {
        #[debug(skip)]
        connection: C::Connection,
        source: Arc<Tensor>,
    },
    ComputePartition {
        columns: Range<usize>,
        source: Arc<Array2<f32>>,
        view: DenseView,
    },
    Forward {
        #[debug(skip)]
        layer: C::Layer,
        input: Tensor,
        effects: SideEffects,
    },
    ConnectionUpdate {
        #[debug(skip)]
        connection: C::Connection,
        context: UpdateContext,
    },
    Record {
        #[debug(skip)]
        monitor: C::Monitor,
        sample: Sample,
    },
    Normalize {
        #[debug(skip)]
        connection: C::Connection,
    },
}

/// Object handed back by a finished task.
#[derive(Debug)]
pub(crate) enum Item<C: Config> {
    Layer(#[debug(skip)] C::Layer),
    Connection(#[debug(skip)] C::Connection),
    Monitor(#[debug(skip)] C::Monitor),
    Nothing,
}

/// Value produced by a successful task.
#[derive(Debug)]
pub(crate) enum Payload {
    Unit,
    Contribution(Tensor),
    Columns(Range<usize>, Array2<f32>),
}

/// Why a task did not complete.
#[derive(Debug)]
pub enum TaskFailure {
    /// The behavior returned an error.
    Error(BehaviorError),
    /// The behavior panicked; the panic was caught in the worker.
    Panic(String),
}

/// Completion record posted by a worker for every task it consumed.
#[derive(Debug)]
pub struct Outcome<C: Config> {
    pub(crate) slot: usize,
    pub(crate) kind: TaskKind,
    pub(crate) item: Item<C>,
    pub(crate) result: Result<Payload, TaskFailure>,
}

impl<C: Config> Outcome<C> {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Clamp and injection values applied to a layer right after its forward
/// pass.
#[derive(Debug, Clone, Default)]
pub(crate) struct SideEffects {
    pub(crate) timestep: usize,
    pub(crate) clamp: Option<Arc<Mask>>,
    pub(crate) unclamp: Option<Arc<Mask>>,
    pub(crate) inject_v: Option<Arc<Tensor>>,
}

impl SideEffects {
    pub(crate) fn is_empty(&self) -> bool {
        self.clamp.is_none() && self.unclamp.is_none() && self.inject_v.is_none()
    }

    fn apply<L: Layer>(&self, layer: &mut L) -> BehaviorResult {
        if let Some(mask) = &self.clamp {
            force_spikes(layer.spikes_mut(), mask, self.timestep, 1.0)?;
        }
        if let Some(mask) = &self.unclamp {
            force_spikes(layer.spikes_mut(), mask, self.timestep, 0.0)?;
        }
        if let Some(inject) = &self.inject_v {
            let voltage = layer
                .voltage_mut()
                .ok_or("voltage injection into a layer without a membrane potential")?;
            let inject = ops::at_timestep(inject, self.timestep).into_dimensionality::<Ix1>()?;
            let mut rows = ops::rows_mut(voltage)?;
            if rows.ncols() != inject.len() {
                return Err(format!(
                    "voltage injection has {} units, layer has {}",
                    inject.len(),
                    rows.ncols()
                )
                .into());
            }
            rows += &inject;
        }
        Ok(())
    }
}

fn force_spikes(spikes: &mut Tensor, mask: &Mask, timestep: usize, value: f32) -> BehaviorResult {
    let mask = ops::at_timestep(mask, timestep).into_dimensionality::<Ix1>()?;
    let mut rows = ops::rows_mut(spikes)?;
    if rows.ncols() != mask.len() {
        return Err(format!("mask has {} units, layer has {}", mask.len(), rows.ncols()).into());
    }
    for mut row in rows.rows_mut() {
        Zip::from(&mut row).and(&mask).for_each(|spike, &selected| {
            if selected {
                *spike = value;
            }
        });
    }
    Ok(())
}

impl<C: Config> Task<C> {
    pub(crate) fn propagate(slot: usize, connection: C::Connection, source: Arc<Tensor>) -> Self {
        Self {
            slot,
            work: Work::Propagate { connection, source },
        }
    }

    pub(crate) fn compute_partition(
        slot: usize,
        columns: Range<usize>,
        source: Arc<Array2<f32>>,
        view: DenseView,
    ) -> Self {
        Self {
            slot,
            work: Work::ComputePartition {
                columns,
                source,
                view,
            },
        }
    }

    pub(crate) fn forward(slot: usize, layer: C::Layer, input: Tensor, effects: SideEffects) -> Self {
        Self {
            slot,
            work: Work::Forward {
                layer,
                input,
                effects,
            },
        }
    }

    pub(crate) fn connection_update(slot: usize, connection: C::Connection, context: UpdateContext) -> Self {
        Self {
            slot,
            work: Work::ConnectionUpdate { connection, context },
        }
    }

    pub(crate) fn record(slot: usize, monitor: C::Monitor, sample: Sample) -> Self {
        Self {
            slot,
            work: Work::Record { monitor, sample },
        }
    }

    pub(crate) fn normalize(slot: usize, connection: C::Connection) -> Self {
        Self {
            slot,
            work: Work::Normalize { connection },
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn kind(&self) -> TaskKind {
        match &self.work {
            Work::Propagate { .. } => TaskKind::Propagate,
            Work::ComputePartition { .. } => TaskKind::ComputePartition,
            Work::Forward { .. } => TaskKind::Forward,
            Work::ConnectionUpdate { .. } => TaskKind::ConnectionUpdate,
            Work::Record { .. } => TaskKind::Record,
            Work::Normalize { .. } => TaskKind::Normalize,
        }
    }

    /// Run the task on the current thread.
    ///
    /// Errors and panics raised by the behavior are captured in the outcome;
    /// the owned object is always handed back.
    pub fn execute(self) -> Outcome<C> {
        let kind = self.kind();
        let Self { slot, work } = self;
        let (item, result) = match work {
            Work::Propagate { connection, source } => {
                let result = guarded(|| connection.compute(&source).map(Payload::Contribution));
                (Item::Connection(connection), result)
            }
            Work::ComputePartition {
                columns,
                source,
                view,
            } => {
                let result = guarded(|| {
                    let values = view.project_columns(source.view(), columns.clone());
                    Ok(Payload::Columns(columns, values))
                });
                (Item::Nothing, result)
            }
            Work::Forward {
                mut layer,
                input,
                effects,
            } => {
                let result = guarded(|| {
                    layer.forward(&input)?;
                    effects.apply(&mut layer)?;
                    Ok(Payload::Unit)
                });
                (Item::Layer(layer), result)
            }
            Work::ConnectionUpdate {
                mut connection,
                context,
            } => {
                let result = guarded(|| connection.update(&context).map(|()| Payload::Unit));
                (Item::Connection(connection), result)
            }
            Work::Record { mut monitor, sample } => {
                let result = guarded(|| monitor.record(sample).map(|()| Payload::Unit));
                (Item::Monitor(monitor), result)
            }
            Work::Normalize { mut connection } => {
                let result = guarded(|| connection.normalize().map(|()| Payload::Unit));
                (Item::Connection(connection), result)
            }
        };
        if let Err(failure) = &result {
            tracing::trace!(slot, %kind, ?failure, "task failed");
        }
        Outcome {
            slot,
            kind,
            item,
            result,
        }
    }
}

fn guarded(f: impl FnOnce() -> BehaviorResult<Payload>) -> Result<Payload, TaskFailure> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(payload)) => Ok(payload),
        Ok(Err(error)) => Err(TaskFailure::Error(error)),
        Err(panic) => Err(TaskFailure::Panic(panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn, array};

    #[test]
    fn force_spikes_uses_per_unit_mask_every_timestep() {
        let mut spikes = ArrayD::<f32>::zeros(IxDyn(&[2, 3]));
        let mask = array![true, false, true].into_dyn();
        force_spikes(&mut spikes, &mask, 7, 1.0).unwrap();
        assert_eq!(spikes, array![[1.0f32, 0.0, 1.0], [1.0, 0.0, 1.0]].into_dyn());
    }

    #[test]
    fn force_spikes_indexes_time_major_mask() {
        let mut spikes = ArrayD::<f32>::ones(IxDyn(&[1, 2]));
        let mask = array![[true, false], [false, true]].into_dyn();
        force_spikes(&mut spikes, &mask, 1, 0.0).unwrap();
        assert_eq!(spikes, array![[1.0f32, 0.0]].into_dyn());
    }

    #[test]
    fn force_spikes_rejects_wrong_width() {
        let mut spikes = ArrayD::<f32>::zeros(IxDyn(&[1, 2]));
        let mask = array![true, false, true].into_dyn();
        assert!(force_spikes(&mut spikes, &mask, 0, 1.0).is_err());
    }

    #[test]
    fn panic_payloads_are_rendered() {
        let failure = guarded(|| panic!("boom {}", 7)).unwrap_err();
        assert!(matches!(failure, TaskFailure::Panic(message) if message == "boom 7"));
        let failure = guarded(|| Err("nope".into())).unwrap_err();
        assert!(matches!(failure, TaskFailure::Error(error) if error.to_string() == "nope"));
    }
}
