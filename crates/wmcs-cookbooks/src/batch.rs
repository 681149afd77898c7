//! Partitioning of a target list into batches, and a runner that applies an
//! operation batch by batch, waiting for the system to settle in between.

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum BatchError<E: std::error::Error + 'static> {
    #[error("batch {batch}/{total} failed: {source}")]
    Apply {
        batch: usize,
        total: usize,
        #[source]
        source: E,
    },
    #[error("batch {batch}/{total} did not stabilize: {source}")]
    Stabilize {
        batch: usize,
        total: usize,
        #[source]
        source: E,
    },
}

impl<E: std::error::Error + 'static> BatchError<E> {
    pub fn into_inner(self) -> E {
        match self {
            BatchError::Apply { source, .. } | BatchError::Stabilize { source, .. } => source,
        }
    }
}

/// An ordered partition of a target list.
///
/// Batch sizes differ by at most one, the larger batches come first, and the
/// targets keep their input order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPlan<T> {
    batches: Vec<Vec<T>>,
}

impl<T> BatchPlan<T> {
    /// Splits `targets` into `count` batches (at most one per target).
    pub fn with_batch_count(targets: Vec<T>, count: usize) -> Self {
        let total = targets.len();
        if total == 0 {
            return Self { batches: Vec::new() };
        }
        let count = count.clamp(1, total);
        let base = total / count;
        let remainder = total % count;

        let mut batches = Vec::with_capacity(count);
        let mut iter = targets.into_iter();
        for index in 0..count {
            let size = if index < remainder { base + 1 } else { base };
            batches.push(iter.by_ref().take(size).collect());
        }
        Self { batches }
    }

    /// Splits `targets` into batches of roughly `size` targets.
    ///
    /// The leftover targets are spread over the first batches instead of
    /// forming a short trailing batch: 10 targets with size 3 gives
    /// `[4, 3, 3]`. A size of 0 puts everything in one batch.
    pub fn with_batch_size(targets: Vec<T>, size: usize) -> Self {
        let count = if size == 0 {
            1
        } else {
            (targets.len() / size).max(1)
        };
        Self::with_batch_count(targets, count)
    }

    pub fn batches(&self) -> &[Vec<T>] {
        &self.batches
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn sizes(&self) -> Vec<usize> {
        self.batches.iter().map(Vec::len).collect()
    }

    pub fn into_batches(self) -> Vec<Vec<T>> {
        self.batches
    }
}

/// Work applied to one batch at a time.
#[async_trait]
pub trait BatchOperation<T: Send + Sync>: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Acts on the batch, returning whether anything changed.
    async fn apply(&self, batch: &[T]) -> Result<bool, Self::Error>;

    /// Blocks until the system is stable again after `apply`.
    async fn stabilize(&self, batch: &[T], changed: bool) -> Result<(), Self::Error>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub batches: usize,
    pub changed_batches: usize,
    pub targets: usize,
}

pub struct BatchRunner {
    label: String,
}

impl BatchRunner {
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into() }
    }

    pub async fn run<T, O>(
        &self,
        plan: &BatchPlan<T>,
        operation: &O,
    ) -> Result<BatchSummary, BatchError<O::Error>>
    where
        T: Send + Sync,
        O: BatchOperation<T> + ?Sized,
    {
        let total = plan.len();
        let mut summary = BatchSummary::default();

        for (index, batch) in plan.batches().iter().enumerate() {
            let current = index + 1;
            info!("[{}/{}] {}: {} targets", current, total, self.label, batch.len());

            let changed = operation
                .apply(batch)
                .await
                .map_err(|source| BatchError::Apply {
                    batch: current,
                    total,
                    source,
                })?;
            operation
                .stabilize(batch, changed)
                .await
                .map_err(|source| BatchError::Stabilize {
                    batch: current,
                    total,
                    source,
                })?;

            summary.batches += 1;
            summary.targets += batch.len();
            if changed {
                summary.changed_batches += 1;
            }
        }

        info!(
            "{}: finished {} batches ({} changed)",
            self.label, summary.batches, summary.changed_batches
        );
        Ok(summary)
    }
}
