// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Work distribution for the update pipeline.
//!
//! The manager runs its stages strictly in sequence. Inside a stage, independent work is
//! handed to an [`Executor`], which may split it into batches and run them concurrently.
//! Executors never reorder results: each batch writes only into its own items.

use core::fmt::Debug;

/// Runs batches of independent work.
pub trait Executor: Sync + Debug {
    /// Call `f(offset, batch)` over disjoint batches covering `items`.
    ///
    /// `offset` is the index of the batch's first item in `items`. Implementations split
    /// into at most `max_tasks` batches of at least `min_batch` items and may run them on
    /// several threads.
    fn for_each_batch<T, F>(&self, items: &mut [T], min_batch: usize, max_tasks: usize, f: F)
    where
        T: Send,
        F: Fn(usize, &mut [T]) + Sync + Send;

    /// Run two closures, possibly in parallel, and return both results.
    fn join<A, B, RA, RB>(&self, a: A, b: B) -> (RA, RB)
    where
        A: FnOnce() -> RA + Send,
        B: FnOnce() -> RB + Send,
        RA: Send,
        RB: Send;
}

/// Runs everything on the calling thread.
#[derive(Copy, Clone, Debug, Default)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn for_each_batch<T, F>(&self, items: &mut [T], _min_batch: usize, _max_tasks: usize, f: F)
    where
        T: Send,
        F: Fn(usize, &mut [T]) + Sync + Send,
    {
        if !items.is_empty() {
            f(0, items);
        }
    }

    fn join<A, B, RA, RB>(&self, a: A, b: B) -> (RA, RB)
    where
        A: FnOnce() -> RA + Send,
        B: FnOnce() -> RB + Send,
        RA: Send,
        RB: Send,
    {
        (a(), b())
    }
}

/// Splits batches across the global rayon pool.
#[cfg(feature = "parallel")]
#[derive(Copy, Clone, Debug, Default)]
pub struct RayonExecutor;

/// Size of each batch, or `None` when the work should run inline.
pub(crate) fn batch_size(len: usize, min_batch: usize, max_tasks: usize) -> Option<usize> {
    let min_batch = min_batch.max(1);
    if max_tasks <= 1 || len < 2 * min_batch {
        return None;
    }
    let tasks = (len / min_batch).clamp(1, max_tasks);
    Some(len.div_ceil(tasks))
}

#[cfg(feature = "parallel")]
impl Executor for RayonExecutor {
    fn for_each_batch<T, F>(&self, items: &mut [T], min_batch: usize, max_tasks: usize, f: F)
    where
        T: Send,
        F: Fn(usize, &mut [T]) + Sync + Send,
    {
        use rayon::iter::{IndexedParallelIterator, ParallelIterator};
        use rayon::slice::ParallelSliceMut;

        if items.is_empty() {
            return;
        }
        match batch_size(items.len(), min_batch, max_tasks) {
            None => f(0, items),
            Some(chunk) => items
                .par_chunks_mut(chunk)
                .enumerate()
                .for_each(|(i, batch)| f(i * chunk, batch)),
        }
    }

    fn join<A, B, RA, RB>(&self, a: A, b: B) -> (RA, RB)
    where
        A: FnOnce() -> RA + Send,
        B: FnOnce() -> RB + Send,
        RA: Send,
        RB: Send,
    {
        rayon::join(a, b)
    }
}

/// The executor used by [`AabbManager`][crate::AabbManager].
#[cfg(feature = "parallel")]
pub type DefaultExecutor = RayonExecutor;

/// The executor used by [`AabbManager`][crate::AabbManager].
#[cfg(not(feature = "parallel"))]
pub type DefaultExecutor = InlineExecutor;

/// Pipeline stages, in execution order.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Stage {
    ComputeUpdateLists,
    UpdateActorBounds,
    UpdateShapeBounds,
    UpdateAggregateBounds,
    RunBroadphase,
    ProcessBpResults,
    UpdateDirtyAggregateShapes,
    AggregateOverlaps,
    Finish,
}

impl Stage {
    pub(crate) const fn name(self) -> &'static str {
        match self {
            Self::ComputeUpdateLists => "compute_update_lists",
            Self::UpdateActorBounds => "update_actor_bounds",
            Self::UpdateShapeBounds => "update_shape_bounds",
            Self::UpdateAggregateBounds => "update_aggregate_bounds",
            Self::RunBroadphase => "run_broadphase",
            Self::ProcessBpResults => "process_bp_results",
            Self::UpdateDirtyAggregateShapes => "update_dirty_aggregate_shapes",
            Self::AggregateOverlaps => "aggregate_overlaps",
            Self::Finish => "finish",
        }
    }

    /// Run `f` inside this stage's trace span.
    pub(crate) fn run<R>(self, f: impl FnOnce() -> R) -> R {
        let span = tracing::trace_span!("broadphase_stage", stage = self.name());
        let _guard = span.enter();
        tracing::trace!(stage = self.name(), "stage start");
        f()
    }
}
