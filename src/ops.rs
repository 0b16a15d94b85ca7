use crate::types::{BehaviorResult, Tensor};
use core::ops::Range;
use ndarray::{Array1, Array2, ArrayView2, ArrayViewMut2, Axis, s};
use std::sync::Arc;
use thiserror::Error;

/// Dense projection `source @ weights + bias`.
///
/// Weights are shaped `[n_in, n_out]` and shared through `Arc` so that column
/// partitions can be computed by workers without copying the matrix.
#[derive(Debug, Clone)]
pub struct DenseView {
    pub weights: Arc<Array2<f32>>,
    pub bias: Option<Arc<Array1<f32>>>,
}

impl DenseView {
    pub fn new(weights: Arc<Array2<f32>>, bias: Option<Arc<Array1<f32>>>) -> Self {
        Self { weights, bias }
    }

    pub fn n_in(&self) -> usize {
        self.weights.nrows()
    }

    pub fn n_out(&self) -> usize {
        self.weights.ncols()
    }

    /// Flatten spikes shaped `[batch, *shape]` into `[batch, n_in]`.
    pub fn flatten_source(&self, source: &Tensor) -> BehaviorResult<Array2<f32>> {
        let batch = source.shape().first().copied().unwrap_or(0);
        if batch == 0 || source.len() != batch * self.n_in() {
            return Err(format!(
                "source of shape {:?} does not match {} input units",
                source.shape(),
                self.n_in()
            )
            .into());
        }
        let flat = source
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((batch, self.n_in()))?;
        Ok(flat)
    }

    /// Full projection, shaped `[batch, n_out]`.
    pub fn compute(&self, source: &Tensor) -> BehaviorResult<Tensor> {
        let flat = self.flatten_source(source)?;
        Ok(self.project_columns(flat.view(), 0..self.n_out()).into_dyn())
    }

    /// Projection restricted to output columns `columns`.
    ///
    /// Every output element is accumulated over the input units in index
    /// order, so any column split reproduces the full projection bit for bit.
    pub fn project_columns(&self, source: ArrayView2<'_, f32>, columns: Range<usize>) -> Array2<f32> {
        let weights = self.weights.slice(s![.., columns.clone()]);
        let bias = self.bias.as_ref().map(|b| b.slice(s![columns.clone()]));
        let mut out = Array2::zeros((source.nrows(), columns.len()));
        for (j, (mut column, w)) in out.columns_mut().into_iter().zip(weights.columns()).enumerate() {
            let b = bias.as_ref().map_or(0.0, |b| b[j]);
            for (o, row) in column.iter_mut().zip(source.rows()) {
                *o = row.iter().zip(w.iter()).fold(0.0, |acc, (&x, &weight)| acc + x * weight) + b;
            }
        }
        out
    }
}

/// Partition reconstruction failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PartitionError {
    /// No partition covered these output columns.
    #[error("columns {}..{} were not computed by any partition", .0.start, .0.end)]
    Missing(Range<usize>),
    /// Two partitions both claimed these output columns.
    #[error("partitions {}..{} and {}..{} overlap", .0.start, .0.end, .1.start, .1.end)]
    Overlap(Range<usize>, Range<usize>),
    /// A partition reaches past the projection's output width.
    #[error("partition {}..{} exceeds {n_out} output columns", .columns.start, .columns.end)]
    OutOfRange { columns: Range<usize>, n_out: usize },
    /// A partition result does not have the shape its tag announces.
    #[error("partition {}..{} has shape {actual:?}, expected {expected:?}", .columns.start, .columns.end)]
    Shape {
        columns: Range<usize>,
        expected: [usize; 2],
        actual: [usize; 2],
    },
}

/// Reassemble tagged column partitions into one `[batch, n_out]` matrix.
///
/// Pieces may come in any order; they are placed by their column tag. The
/// tags must cover `0..n_out` exactly once.
pub fn assemble_columns(
    mut pieces: Vec<(Range<usize>, Array2<f32>)>,
    batch: usize,
    n_out: usize,
) -> Result<Array2<f32>, PartitionError> {
    pieces.sort_by_key(|(columns, _)| (columns.start, columns.end));
    let mut covered = 0;
    let mut previous: Option<Range<usize>> = None;
    for (columns, values) in &pieces {
        if columns.end > n_out {
            return Err(PartitionError::OutOfRange {
                columns: columns.clone(),
                n_out,
            });
        }
        let expected = [batch, columns.len()];
        let actual = [values.nrows(), values.ncols()];
        if expected != actual {
            return Err(PartitionError::Shape {
                columns: columns.clone(),
                expected,
                actual,
            });
        }
        if columns.start < covered {
            let previous = previous.clone().unwrap_or(0..covered);
            return Err(PartitionError::Overlap(previous, columns.clone()));
        }
        if columns.start > covered {
            return Err(PartitionError::Missing(covered..columns.start));
        }
        covered = columns.end;
        previous = Some(columns.clone());
    }
    if covered < n_out {
        return Err(PartitionError::Missing(covered..n_out));
    }
    let mut out = Array2::zeros((batch, n_out));
    for (columns, values) in pieces {
        out.slice_mut(s![.., columns]).assign(&values);
    }
    Ok(out)
}

/// Reshape a contribution into `shape` when the element counts agree.
pub(crate) fn conform(tensor: Tensor, shape: &[usize]) -> Option<Tensor> {
    if tensor.shape() == shape {
        return Some(tensor);
    }
    if tensor.len() != shape.iter().product::<usize>() {
        return None;
    }
    tensor
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order(shape.to_vec())
        .ok()
}

/// View the `[batch, *shape]` tensor as `[batch, units]`.
pub(crate) fn rows_mut(tensor: &mut Tensor) -> BehaviorResult<ArrayViewMut2<'_, f32>> {
    let batch = tensor.shape().first().copied().unwrap_or(0);
    let units = if batch == 0 { 0 } else { tensor.len() / batch };
    Ok(tensor.view_mut().into_shape_with_order((batch, units))?)
}

/// Select the row of a per-timestep `[time, units]` tensor, or the tensor
/// itself when it is a per-unit vector.
pub(crate) fn at_timestep<A>(tensor: &ndarray::ArrayD<A>, timestep: usize) -> ndarray::ArrayViewD<'_, A> {
    if tensor.ndim() == 1 {
        tensor.view()
    } else {
        tensor.index_axis(Axis(0), timestep)
    }
}
