// Copyright 2022 Lucas Javaudin
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// https://creativecommons.org/licenses/by-nc-nd/4.0/legalcode

//! Execution context of the parallel workers.
//!
//! The decision inputs are split into batches. Each batch owns a [BatchSlot] with one calculator
//! per model and its own observation writer, so that the workers never share mutable state.
use anyhow::Result;
use choice::{CalculatorStats, ChoiceProbabilityCalculator, EstimationSummary, ObservationSink};
use hashbrown::HashMap;
use rayon::prelude::*;
use thiserror::Error;

use crate::context::RunContext;

/// Invalid use of the [ExecutionContext].
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("Worker {0} is already registered")]
    WorkerAlreadyRegistered(usize),
    #[error("Batch {batch} does not exist (there are {nb_batches} batches)")]
    BatchOutOfRange { batch: usize, nb_batches: usize },
    #[error("Batch {batch} is already bound to worker {worker}")]
    BatchOccupied { batch: usize, worker: usize },
    #[error("Batch {0} has no observation writer")]
    MissingObservationSink(usize),
}

/// Identifier of a worker.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct WorkerHandle(usize);

impl WorkerHandle {
    pub const fn new(id: usize) -> Self {
        WorkerHandle(id)
    }

    pub const fn id(self) -> usize {
        self.0
    }
}

/// Boxed observation writer of a batch.
pub type BoxedSink = Box<dyn ObservationSink + Send>;

/// Working state of one batch.
pub struct BatchSlot<P> {
    index: usize,
    worker: Option<WorkerHandle>,
    calculators: Vec<ChoiceProbabilityCalculator<P>>,
    sink: Option<BoxedSink>,
}

impl<P> BatchSlot<P> {
    /// Returns the index of the batch.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns the worker bound to the batch, if any.
    pub fn worker(&self) -> Option<WorkerHandle> {
        self.worker
    }
}

/// Access of a worker to its batch.
pub struct BatchContext<'a, P> {
    worker: WorkerHandle,
    slot: &'a mut BatchSlot<P>,
}

impl<P> BatchContext<'_, P> {
    /// Returns the index of the batch of the worker.
    pub fn current_batch_index(&self) -> usize {
        self.slot.index
    }

    /// Returns the worker.
    pub fn worker(&self) -> WorkerHandle {
        self.worker
    }

    /// Returns the calculator of the given model for this batch.
    pub fn calculator(&mut self, model: usize) -> &mut ChoiceProbabilityCalculator<P> {
        &mut self.slot.calculators[model]
    }

    /// Returns the calculator of the given model and the observation writer of the batch.
    pub fn calculator_and_sink(
        &mut self,
        model: usize,
    ) -> Result<(&mut ChoiceProbabilityCalculator<P>, &mut BoxedSink), ExecutionError> {
        let slot = &mut *self.slot;
        let sink = slot
            .sink
            .as_mut()
            .ok_or(ExecutionError::MissingObservationSink(slot.index))?;
        Ok((&mut slot.calculators[model], sink))
    }
}

/// Set of batch slots of a run.
pub struct ExecutionContext<P> {
    slots: Vec<BatchSlot<P>>,
    workers: HashMap<WorkerHandle, usize>,
}

impl<P> ExecutionContext<P> {
    /// Creates `nb_batches` slots with one calculator per model of the context.
    ///
    /// When the run writes estimation observations, `make_sink` is called once per batch to
    /// create its writer.
    pub fn new<F>(context: &RunContext, nb_batches: usize, mut make_sink: F) -> Result<Self>
    where
        F: FnMut(usize) -> Result<BoxedSink>,
    {
        let slots = (0..nb_batches.max(1))
            .map(|index| {
                let calculators = context
                    .models()
                    .iter()
                    .map(|m| {
                        ChoiceProbabilityCalculator::new(m.coefficients.clone(), m.is_estimated)
                    })
                    .collect();
                let sink = if context.parameters().is_estimation() {
                    Some(make_sink(index)?)
                } else {
                    None
                };
                Ok(BatchSlot {
                    index,
                    worker: None,
                    calculators,
                    sink,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ExecutionContext {
            slots,
            workers: HashMap::new(),
        })
    }

    /// Returns the number of batches.
    pub fn nb_batches(&self) -> usize {
        self.slots.len()
    }

    /// Returns the slots of the batches.
    pub fn slots(&self) -> &[BatchSlot<P>] {
        &self.slots
    }

    /// Binds a worker to a batch, for the lifetime of the context.
    pub fn register(&mut self, worker: WorkerHandle, batch: usize) -> Result<(), ExecutionError> {
        if self.workers.contains_key(&worker) {
            return Err(ExecutionError::WorkerAlreadyRegistered(worker.id()));
        }
        let nb_batches = self.slots.len();
        let slot = self
            .slots
            .get_mut(batch)
            .ok_or(ExecutionError::BatchOutOfRange { batch, nb_batches })?;
        if let Some(other) = slot.worker {
            return Err(ExecutionError::BatchOccupied {
                batch,
                worker: other.id(),
            });
        }
        slot.worker = Some(worker);
        self.workers.insert(worker, batch);
        Ok(())
    }

    /// Returns the batch of a registered worker.
    pub fn batch_of(&self, worker: WorkerHandle) -> Option<usize> {
        self.workers.get(&worker).copied()
    }

    /// Binds a new worker to each batch without worker.
    fn bind_free_slots(&mut self) {
        let mut next_id = self.workers.keys().map(|w| w.id() + 1).max().unwrap_or(0);
        for slot in self.slots.iter_mut().filter(|s| s.worker.is_none()) {
            let worker = WorkerHandle::new(next_id);
            next_id += 1;
            slot.worker = Some(worker);
            self.workers.insert(worker, slot.index);
        }
    }

    /// Runs `task` for each batch, in parallel on the given thread pool, and returns the results
    /// by batch index.
    pub fn run<T, F>(&mut self, pool: &rayon::ThreadPool, task: F) -> Result<Vec<T>>
    where
        P: Send,
        T: Send,
        F: Fn(&mut BatchContext<P>) -> Result<T> + Sync,
    {
        self.bind_free_slots();
        pool.install(|| {
            self.slots
                .par_iter_mut()
                .panic_fuse()
                .map(|slot| {
                    let worker = slot.worker.unwrap_or(WorkerHandle::new(slot.index));
                    task(&mut BatchContext { worker, slot })
                })
                .collect::<Result<Vec<_>>>()
        })
    }

    /// Flushes the observation writers of all the batches.
    pub fn finish(&mut self) -> Result<()> {
        for sink in self.slots.iter_mut().filter_map(|s| s.sink.as_mut()) {
            sink.finish()?;
        }
        Ok(())
    }

    /// Returns the counters of the calculators of a model, over all the batches.
    pub fn stats(&self, model: usize) -> CalculatorStats {
        let mut stats = CalculatorStats::default();
        for slot in &self.slots {
            stats.merge(slot.calculators[model].stats());
        }
        stats
    }

    /// Returns the estimation summary of a model, over all the batches.
    pub fn estimation_summary(&self, model: usize) -> EstimationSummary {
        let mut summary = EstimationSummary::default();
        for slot in &self.slots {
            summary.merge(slot.calculators[model].estimation_summary());
        }
        summary
    }
}
