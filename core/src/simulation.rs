// Copyright 2022 Lucas Javaudin
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// https://creativecommons.org/licenses/by-nc-nd/4.0/legalcode

//! Runs the registered models over a set of decision inputs.
use std::path::Path;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use choice::{
    AlternativeId, CalculatorStats, ChoiceOutcome, EstimationSummary, ObservationStatus,
    RandomStream, SeedKey,
};
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};

use crate::context::RunContext;
use crate::io::json::write_json;
use crate::model::ModelRegistry;
use crate::observation::{write_estimation_summary, CsvObservationWriter};
use crate::parallel::{BatchContext, BoxedSink, ExecutionContext};
use crate::progress_bar::DecisionProgressBar;

/// An entity (person, household, tour, ...) making decisions.
pub trait DecisionInput: Sync {
    /// Returns the stable identifiers of the entity, used to seed its random streams.
    fn seed_key(&self) -> SeedKey;

    /// Returns a description of the entity, used in diagnostics.
    fn describe(&self) -> String;

    /// Returns the alternative actually chosen by the entity for the given model, if known.
    fn observed_choice(&self, _model: &str) -> Option<AlternativeId> {
        None
    }

    /// Returns `false` if the entity does not make the decision of the given model.
    fn applies_to(&self, _model: &str) -> bool {
        true
    }
}

/// Outcome of one decision.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub enum DecisionOutcome<P> {
    /// Simulated choice (application mode).
    Simulated(ChoiceOutcome<P>),
    /// Status of the estimation observation (estimation mode).
    Observation(ObservationStatus),
}

/// Result of one model for one decision input.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct DecisionResult<P> {
    /// Index of the decision input.
    pub input: usize,
    /// Name of the model.
    pub model: String,
    /// Outcome of the decision.
    pub outcome: DecisionOutcome<P>,
}

/// Statistics of one model over a run.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct ModelStatistics {
    /// Name of the model.
    pub name: String,
    /// Counters of the calculators, over all batches.
    pub calculator: CalculatorStats,
    /// Summary of the observations, for the estimated model.
    pub estimation: Option<EstimationSummary>,
}

/// Results of a run.
#[derive(Clone, Debug)]
pub struct RunResults<P> {
    /// Results by increasing input index (and in model order for the same input).
    pub decisions: Vec<DecisionResult<P>>,
    /// Statistics of each model that was run.
    pub models: Vec<ModelStatistics>,
    /// Number of batches used.
    pub nb_batches: usize,
}

impl<P> RunResults<P> {
    /// Returns the number of simulated decisions without any available alternative.
    pub fn nb_no_alternative(&self) -> usize {
        self.decisions
            .iter()
            .filter(|d| {
                matches!(
                    d.outcome,
                    DecisionOutcome::Simulated(ChoiceOutcome::NoAlternative)
                )
            })
            .count()
    }
}

impl<P: Serialize> RunResults<P> {
    /// Writes the results to the output directory: `decisions.json`, `statistics.json` and the
    /// estimation summary of the estimated model.
    pub fn save(&self, output_dir: &Path) -> Result<()> {
        write_json(&self.decisions, output_dir, "decisions")
            .context("Failed to write the decisions")?;
        write_json(&self.models, output_dir, "statistics")
            .context("Failed to write the statistics")?;
        for model in &self.models {
            if let Some(summary) = &model.estimation {
                write_estimation_summary(summary, output_dir, &model.name)?;
            }
        }
        Ok(())
    }
}

/// Runs the models of a [ModelRegistry] with the coefficients of a [RunContext].
pub struct DecisionRunner<'a, D, P> {
    context: &'a RunContext,
    registry: &'a ModelRegistry<D, P>,
    /// `(registry index, context index)` of the models to run.
    models: Vec<(usize, usize)>,
}

impl<'a, D: DecisionInput, P: Clone + Send> DecisionRunner<'a, D, P> {
    /// Creates a runner.
    ///
    /// Returns an error if a registered model has no coefficients in the context. In estimation
    /// mode, only the estimated model is run.
    pub fn new(context: &'a RunContext, registry: &'a ModelRegistry<D, P>) -> Result<Self> {
        let mut models = Vec::with_capacity(registry.len());
        for (i, metadata) in registry.iter().enumerate() {
            let position = context
                .models()
                .iter()
                .position(|m| m.name == metadata.name)
                .ok_or_else(|| {
                    anyhow!("Model `{}` has no coefficients in the parameters", metadata.name)
                })?;
            if !context.parameters().is_estimation() || context.models()[position].is_estimated {
                models.push((i, position));
            }
        }
        for model in context.models() {
            if registry.index_of(&model.name).is_none() {
                warn!("Model `{}` is in the parameters but not registered", model.name);
            }
        }
        if context.parameters().is_estimation() && models.is_empty() {
            bail!(
                "The estimated model `{}` is not registered",
                context.parameters().estimated_model.as_deref().unwrap_or_default()
            );
        }
        Ok(DecisionRunner {
            context,
            registry,
            models,
        })
    }

    /// Runs the models on all the inputs.
    ///
    /// In estimation mode, the observations of each batch are written to a CSV file in the output
    /// directory.
    pub fn run(&self, inputs: &[D]) -> Result<RunResults<P>> {
        let output_dir = self.context.parameters().output_directory().to_path_buf();
        let model = self
            .context
            .parameters()
            .estimated_model
            .clone()
            .unwrap_or_default();
        self.run_with_sinks(inputs, |batch| {
            Ok(Box::new(CsvObservationWriter::create(&output_dir, &model, batch)?) as BoxedSink)
        })
    }

    /// Runs the models on all the inputs, with the given function creating the observation writer
    /// of each batch.
    ///
    /// Inputs are assigned to batches by index (input `i` goes to batch `i % nb_batches`) and each
    /// decision uses a random stream seeded from the identifiers of the input, so the results do
    /// not depend on the number of batches.
    pub fn run_with_sinks<F>(&self, inputs: &[D], make_sink: F) -> Result<RunResults<P>>
    where
        F: FnMut(usize) -> Result<BoxedSink>,
    {
        let parameters = self.context.parameters();
        let nb_threads = parameters.nb_threads();
        let nb_batches = nb_threads.min(inputs.len()).max(1);
        info!(
            "Running {} model(s) on {} decision inputs ({} batches)",
            self.models.len(),
            inputs.len(),
            nb_batches
        );
        let now = Instant::now();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(nb_threads)
            .build()
            .context("Failed to build the thread pool")?;
        let mut execution = ExecutionContext::new(self.context, nb_batches, make_sink)?;
        let bp = DecisionProgressBar::new(inputs.len());
        bp.set_message("Decisions");
        let batch_results = execution.run(&pool, |batch| {
            let mut results = Vec::new();
            for index in (batch.current_batch_index()..inputs.len()).step_by(nb_batches) {
                bp.inc();
                for &(model, slot) in &self.models {
                    if let Some(result) = self.decide(batch, model, slot, index, &inputs[index])? {
                        results.push(result);
                    }
                }
            }
            Ok(results)
        })?;
        bp.finish();
        execution.finish()?;

        // Each input belongs to one batch, where its results are in model order.
        let mut decisions: Vec<DecisionResult<P>> = batch_results.into_iter().flatten().collect();
        decisions.sort_by_key(|d| d.input);

        let models: Vec<ModelStatistics> = self
            .models
            .iter()
            .map(|&(model, slot)| ModelStatistics {
                name: self.registry.metadata(model).name.clone(),
                calculator: execution.stats(slot),
                estimation: self.context.models()[slot]
                    .is_estimated
                    .then(|| execution.estimation_summary(slot)),
            })
            .collect();
        for stats in &models {
            info!(
                "Model `{}`: {} decisions, {} without alternative",
                stats.name, stats.calculator.instances, stats.calculator.no_alternative
            );
            if let Some(summary) = &stats.estimation {
                info!(
                    "Model `{}`: {} observations written, {} rejected",
                    stats.name,
                    summary.accepted,
                    summary.nb_rejected()
                );
            }
        }
        debug!("Running time: {:?}", now.elapsed());
        Ok(RunResults {
            decisions,
            models,
            nb_batches,
        })
    }

    /// Builds and resolves the decision of one model for one input.
    fn decide(
        &self,
        batch: &mut BatchContext<P>,
        model: usize,
        slot: usize,
        index: usize,
        input: &D,
    ) -> Result<Option<DecisionResult<P>>> {
        let metadata = self.registry.metadata(model);
        if !input.applies_to(&metadata.name) {
            return Ok(None);
        }
        let loaded = &self.context.models()[slot];
        let key = input.seed_key().with_salt(loaded.salt);
        let mut stream = RandomStream::new(&key, self.context.parameters().random_seed);
        let builder = self.registry.builder(model);
        let failure = || format!("Model `{}` failed for {}", metadata.name, input.describe());
        let outcome = if loaded.is_estimated {
            let (calculator, sink) = batch.calculator_and_sink(slot)?;
            calculator.reset(index as u64);
            builder(calculator, input, &mut stream).with_context(failure)?;
            let status = calculator.write_observation(sink).with_context(failure)?;
            DecisionOutcome::Observation(status)
        } else {
            let calculator = batch.calculator(slot);
            calculator.reset(index as u64);
            builder(calculator, input, &mut stream).with_context(failure)?;
            let outcome = calculator
                .simulate_choice_with_observed(&mut stream, input.observed_choice(&metadata.name))
                .with_context(failure)?;
            if outcome.is_no_alternative() {
                if self.context.parameters().strict_availability {
                    bail!(
                        "No alternative available for model `{}` and {}",
                        metadata.name,
                        input.describe()
                    );
                }
                warn!(
                    "No alternative available for model `{}` and {}",
                    metadata.name,
                    input.describe()
                );
            } else {
                trace!(
                    "Model `{}` for {}: alternative {:?}",
                    metadata.name,
                    input.describe(),
                    outcome.chosen_id()
                );
            }
            DecisionOutcome::Simulated(outcome)
        };
        Ok(Some(DecisionResult {
            input: index,
            model: metadata.name.clone(),
            outcome,
        }))
    }
}
