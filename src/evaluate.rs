use std::sync::atomic::{AtomicUsize, Ordering};

use rayon::prelude::*;

use crate::error::{NnError, Result};
use crate::network::Network;
use crate::tensor::{Shape, Tensor, TensorView};

/// One `(X, Y)` batch: inputs and targets with matching row counts.
#[derive(Debug, Clone)]
pub struct SamplesBatch {
    pub x: Tensor,
    pub y: Tensor,
}

impl SamplesBatch {
    pub fn new(x: Tensor, y: Tensor) -> Result<Self> {
        if x.entities() != y.entities() {
            return Err(NnError::ShapeMismatch {
                expected: x.entities(),
                got: y.entities(),
            });
        }
        Ok(Self { x, y })
    }

    pub fn entities(&self) -> usize {
        self.x.entities()
    }
}

/// A dataset pre-split into fixed-size batches plus an optional remainder.
#[derive(Debug, Clone)]
pub struct BatchesCollection {
    batches: Vec<SamplesBatch>,
}

impl BatchesCollection {
    /// Splits `(x, y)` into `count / batch_size` full batches and one
    /// remainder batch of `count % batch_size` rows (skipped when zero).
    pub fn from_dataset(x: TensorView, y: TensorView, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(NnError::InvalidConfiguration { field: "batch_size" });
        }
        if x.entities() != y.entities() {
            return Err(NnError::ShapeMismatch {
                expected: x.entities(),
                got: y.entities(),
            });
        }
        let mut batches = Vec::new();
        for (bx, by) in batch_views(x, y, batch_size)? {
            batches.push(SamplesBatch::new(bx.to_owned(), by.to_owned())?);
        }
        Ok(Self { batches })
    }

    pub fn batches(&self) -> &[SamplesBatch] {
        &self.batches
    }

    pub fn entities(&self) -> usize {
        self.batches.iter().map(SamplesBatch::entities).sum()
    }
}

/// Aggregate result of an evaluation run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluationOutcome {
    pub cost: f32,
    pub classified: usize,
    pub total: usize,
    pub accuracy: f32,
}

/// Borrowed batch views over a dataset buffer; no sample is copied.
fn batch_views<'a>(
    x: TensorView<'a>,
    y: TensorView<'a>,
    batch_size: usize,
) -> Result<Vec<(TensorView<'a>, TensorView<'a>)>> {
    let total = x.entities();
    let x_len = x.info().len();
    let y_len = y.info().len();
    let mut views = Vec::new();
    let mut start = 0;
    while start < total {
        let rows = batch_size.min(total - start);
        let bx = TensorView::reshape(
            &x.data()[start * x_len..(start + rows) * x_len],
            Shape::new(rows, x.info())?,
        )?;
        let by = TensorView::reshape(
            &y.data()[start * y_len..(start + rows) * y_len],
            Shape::new(rows, y.info())?,
        )?;
        views.push((bx, by));
        start += rows;
    }
    Ok(views)
}

fn arg_max(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = i;
        }
    }
    best
}

/// Counts samples whose output arg-max matches the target arg-max.
/// Per-sample checks run in parallel; the counter is commutative, so
/// relaxed ordering suffices.
fn classify(a: &Tensor, y: TensorView) -> usize {
    let matches = AtomicUsize::new(0);
    (0..a.entities()).into_par_iter().for_each(|e| {
        if arg_max(a.sample(e)) == arg_max(y.sample(e)) {
            matches.fetch_add(1, Ordering::Relaxed);
        }
    });
    matches.load(Ordering::Relaxed)
}

fn evaluate_batch(
    net: &mut Network,
    x: TensorView,
    y: TensorView,
    outcome: &mut (f64, usize),
) -> Result<()> {
    let a = net.forward(x)?;
    outcome.0 += net.cost_function().cost(a.view(), y)? as f64;
    outcome.1 += classify(&a, y);
    Ok(())
}

fn finish(cost: f64, classified: usize, total: usize) -> EvaluationOutcome {
    let accuracy = classified as f32 / total as f32 * 100.0;
    log::debug!("evaluation: {classified}/{total} classified, cost {cost:.4}");
    EvaluationOutcome {
        cost: cost as f32,
        classified,
        total,
        accuracy,
    }
}

/// Evaluates the network over `(x, y)`, processed in batches of
/// `batch_size` rows; batch inputs are borrowed views over the dataset.
pub fn evaluate(
    net: &mut Network,
    x: TensorView,
    y: TensorView,
    batch_size: usize,
) -> Result<EvaluationOutcome> {
    if batch_size == 0 {
        return Err(NnError::InvalidConfiguration { field: "batch_size" });
    }
    if x.entities() != y.entities() {
        return Err(NnError::ShapeMismatch {
            expected: x.entities(),
            got: y.entities(),
        });
    }
    let mut outcome = (0.0f64, 0usize);
    for (i, (bx, by)) in batch_views(x, y, batch_size)?.into_iter().enumerate() {
        log::trace!("batch {i}: {} rows", bx.entities());
        evaluate_batch(net, bx, by, &mut outcome)?;
    }
    Ok(finish(outcome.0, outcome.1, x.entities()))
}

/// Evaluates the network over a pre-batched collection.
pub fn evaluate_batches(
    net: &mut Network,
    batches: &BatchesCollection,
) -> Result<EvaluationOutcome> {
    let mut outcome = (0.0f64, 0usize);
    for batch in batches.batches() {
        evaluate_batch(net, batch.x.view(), batch.y.view(), &mut outcome)?;
    }
    Ok(finish(outcome.0, outcome.1, batches.entities()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::TensorInfo;

    #[test]
    fn arg_max_picks_first_maximum() {
        assert_eq!(arg_max(&[0.1, 0.9, 0.9, 0.2]), 1);
        assert_eq!(arg_max(&[3.0]), 0);
    }

    #[test]
    fn batch_views_split_with_remainder() {
        let x = Tensor::new(Shape::matrix(10, 4).unwrap());
        let y = Tensor::new(Shape::matrix(10, 2).unwrap());
        let views = batch_views(x.view(), y.view(), 4).unwrap();
        let rows: Vec<usize> = views.iter().map(|(bx, _)| bx.entities()).collect();
        assert_eq!(rows, [4, 4, 2]);
    }

    #[test]
    fn batch_views_skip_empty_remainder() {
        let x = Tensor::new(Shape::matrix(8, 4).unwrap());
        let y = Tensor::new(Shape::matrix(8, 2).unwrap());
        assert_eq!(batch_views(x.view(), y.view(), 4).unwrap().len(), 2);
    }

    #[test]
    fn collection_rejects_mismatched_row_counts() {
        let x = Tensor::new(Shape::matrix(6, 4).unwrap());
        let y = Tensor::new(Shape::matrix(5, 2).unwrap());
        assert!(BatchesCollection::from_dataset(x.view(), y.view(), 2).is_err());
        assert!(BatchesCollection::from_dataset(x.view(), x.view(), 0).is_err());
    }

    #[test]
    fn collection_preserves_total_entities() {
        let info = TensorInfo::linear(3).unwrap();
        let x = Tensor::new(Shape::new(7, info).unwrap());
        let y = Tensor::new(Shape::matrix(7, 2).unwrap());
        let collection = BatchesCollection::from_dataset(x.view(), y.view(), 3).unwrap();
        assert_eq!(collection.batches().len(), 3);
        assert_eq!(collection.entities(), 7);
    }

    #[test]
    fn classification_counts_argmax_matches() {
        let a = Tensor::from_vec(
            Shape::matrix(3, 2).unwrap(),
            vec![0.9, 0.1, 0.2, 0.8, 0.6, 0.4],
        )
        .unwrap();
        let y = Tensor::from_vec(
            Shape::matrix(3, 2).unwrap(),
            vec![1.0, 0.0, 1.0, 0.0, 1.0, 0.0],
        )
        .unwrap();
        assert_eq!(classify(&a, y.view()), 2);
    }
}
