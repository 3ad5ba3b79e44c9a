// Copyright 2022 Lucas Javaudin
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// https://creativecommons.org/licenses/by-nc-nd/4.0/legalcode

use std::path::PathBuf;

use anyhow::Result;
use choice::{
    AlternativeId, AlternativeSampler, Candidate, ChoiceOutcome, Coefficient, CoefficientStore,
    SampleRequest, SeedKey,
};
use microsim_core::context::RunContext;
use microsim_core::model::{ModelMetadata, ModelRegistry};
use microsim_core::parameters::{ModelParameters, Parameters};
use microsim_core::simulation::{DecisionInput, DecisionOutcome, DecisionRunner, RunResults};

/// A person choosing a mode and a work location.
struct Person {
    id: u64,
    income: f64,
    works: bool,
}

impl DecisionInput for Person {
    fn seed_key(&self) -> SeedKey {
        SeedKey::household(self.id)
    }

    fn describe(&self) -> String {
        format!("person {}", self.id)
    }

    fn applies_to(&self, model: &str) -> bool {
        model != "work_location" || self.works
    }
}

fn persons(n: u64) -> Vec<Person> {
    (0..n)
        .map(|id| Person {
            id,
            income: (id % 7) as f64 / 3.0,
            works: id % 4 != 0,
        })
        .collect()
}

fn model(name: &str) -> ModelParameters {
    ModelParameters {
        name: name.to_owned(),
        coefficients: PathBuf::from(format!("{name}.f12")),
        salt: None,
    }
}

fn context(nb_threads: usize, strict_availability: bool) -> RunContext {
    let mut parameters = Parameters::new("output", vec![model("mode"), model("work_location")]);
    parameters.nb_threads = nb_threads;
    parameters.random_seed = 42;
    parameters.sample_size = 20;
    parameters.strict_availability = strict_availability;
    let mode = CoefficientStore::new(
        "mode",
        vec![
            Coefficient::new(1, "asc_car", 0.5, false),
            Coefficient::new(2, "income_car", 0.3, false),
            Coefficient::new(3, "asc_transit", -0.2, false),
        ],
    )
    .unwrap();
    let work_location = CoefficientStore::new(
        "work_location",
        vec![
            Coefficient::new(1, "distance", -0.1, false),
            Coefficient::new(2, "samplecorr", 1.0, true),
        ],
    )
    .unwrap();
    RunContext::from_parts(parameters, vec![mode, work_location]).unwrap()
}

fn registry() -> ModelRegistry<Person, AlternativeId> {
    let mut registry = ModelRegistry::new();
    registry
        .register(
            ModelMetadata::new("mode", "car / transit / walk"),
            |calc, person: &Person, _| {
                let car = calc.alternative(1, true, false);
                calc.add_utility_term(car, 1, 1.0)?;
                calc.add_utility_term(car, 2, person.income)?;
                calc.set_payload(car, 1)?;
                // Transit is not available to every 5th person.
                let transit = calc.alternative(2, person.id % 5 != 0, false);
                calc.add_utility_term(transit, 3, 1.0)?;
                calc.set_payload(transit, 2)?;
                let walk = calc.alternative(3, true, false);
                calc.set_payload(walk, 3)?;
                Ok(())
            },
        )
        .unwrap();
    registry
        .register(
            ModelMetadata::new("work_location", "sampled work location"),
            |calc, person: &Person, stream| {
                let universe: Vec<Candidate> = (1..=500)
                    .map(|zone| Candidate::new(zone, ((zone * 13) % 17) as f64))
                    .collect();
                let request = SampleRequest::new(&universe, 20).with_origin(person.id % 500 + 1);
                for item in AlternativeSampler::new().sample(&request, stream)? {
                    let alt = calc.alternative(item.entity_id, item.is_available, false);
                    let distance = (item.entity_id as f64 - (person.id % 500) as f64).abs();
                    calc.add_utility_term(alt, 1, distance / 10.0)?;
                    calc.add_utility_term(alt, 2, item.utility_correction())?;
                    calc.set_payload(alt, item.entity_id)?;
                }
                Ok(())
            },
        )
        .unwrap();
    registry
}

fn run(
    nb_threads: usize,
    inputs: &[Person],
    strict_availability: bool,
) -> Result<RunResults<AlternativeId>> {
    let context = context(nb_threads, strict_availability);
    let registry = registry();
    let runner = DecisionRunner::new(&context, &registry)?;
    runner.run_with_sinks(inputs, |_| unreachable!())
}

#[test]
fn batch_independence_test() {
    let inputs = persons(400);
    let one = run(1, &inputs, false).unwrap();
    assert_eq!(one.nb_batches, 1);
    // 400 mode decisions and 300 work location decisions.
    assert_eq!(one.decisions.len(), 700);
    assert!(one
        .decisions
        .windows(2)
        .all(|w| w[0].input <= w[1].input));
    for nb_threads in [2, 3, 8] {
        let many = run(nb_threads, &inputs, false).unwrap();
        assert_eq!(many.nb_batches, nb_threads);
        assert_eq!(many.decisions, one.decisions);
        assert_eq!(many.models, one.models);
    }
    let mode = &one.models[0];
    assert_eq!(mode.name, "mode");
    assert_eq!(mode.calculator.instances, 400);
    assert_eq!(mode.calculator.simulated, 400);
    assert!(mode.estimation.is_none());
    assert_eq!(one.models[1].calculator.instances, 300);
}

#[test]
fn more_batches_than_inputs_test() {
    let inputs = persons(3);
    let results = run(8, &inputs, false).unwrap();
    assert_eq!(results.nb_batches, 3);
    assert_eq!(results.decisions, run(1, &inputs, false).unwrap().decisions);
}

#[test]
fn model_order_test() {
    let inputs = persons(8);
    let results = run(2, &inputs, false).unwrap();
    let models: Vec<(usize, &str)> = results
        .decisions
        .iter()
        .map(|d| (d.input, d.model.as_str()))
        .collect();
    assert_eq!(
        &models[..5],
        &[
            (0, "mode"),
            (1, "mode"),
            (1, "work_location"),
            (2, "mode"),
            (2, "work_location")
        ]
    );
    for decision in &results.decisions {
        let DecisionOutcome::Simulated(ChoiceOutcome::Chosen(chosen)) = &decision.outcome else {
            panic!("Unexpected outcome: {:?}", decision.outcome);
        };
        assert_eq!(chosen.payload, Some(chosen.id));
        if decision.model == "work_location" {
            // The origin is never sampled.
            assert_ne!(chosen.id, inputs[decision.input].id % 500 + 1);
        }
    }
}

#[test]
fn simulated_shares_test() {
    // Shares of the simulated mode choices converge to the mean probabilities.
    let inputs: Vec<Person> = (0..21_000)
        .map(|id| Person {
            id,
            income: 0.0,
            works: false,
        })
        .collect();
    let results = run(4, &inputs, false).unwrap();
    let mut counts = [0usize; 3];
    for decision in &results.decisions {
        if let DecisionOutcome::Simulated(outcome) = &decision.outcome {
            counts[outcome.chosen_id().unwrap() as usize - 1] += 1;
        }
    }
    // With transit: exp(0.5), exp(-0.2), exp(0). Without transit (1 in 5): exp(0.5), exp(0).
    let with = [0.5f64.exp(), (-0.2f64).exp(), 1.0];
    let without = [0.5f64.exp(), 0.0, 1.0];
    let sum_with: f64 = with.iter().sum();
    let sum_without: f64 = without.iter().sum();
    for i in 0..3 {
        let expected = 0.8 * with[i] / sum_with + 0.2 * without[i] / sum_without;
        let share = counts[i] as f64 / inputs.len() as f64;
        assert!(
            (share - expected).abs() < 0.015,
            "Alternative {}: share {share}, expected {expected}",
            i + 1
        );
    }
}

#[test]
fn no_alternative_test() {
    let mut registry: ModelRegistry<Person, AlternativeId> = ModelRegistry::new();
    registry
        .register(ModelMetadata::new("mode", "unavailable"), |calc, p, _| {
            calc.alternative(1, p.id % 2 == 0, false);
            calc.alternative(2, false, false);
            Ok(())
        })
        .unwrap();
    let inputs = persons(10);

    let lenient = context(2, false);
    let results = DecisionRunner::new(&lenient, &registry)
        .unwrap()
        .run_with_sinks(&inputs, |_| unreachable!())
        .unwrap();
    assert_eq!(results.nb_no_alternative(), 5);
    assert_eq!(results.models.len(), 1);
    assert_eq!(results.models[0].calculator.no_alternative, 5);

    let strict = context(2, true);
    let runner = DecisionRunner::new(&strict, &registry).unwrap();
    assert!(runner.run_with_sinks(&inputs, |_| unreachable!()).is_err());
}

#[test]
fn unknown_model_test() {
    let context = context(1, false);
    let mut registry: ModelRegistry<Person, AlternativeId> = ModelRegistry::new();
    registry
        .register(ModelMetadata::new("unknown", "not in the parameters"), |_, _, _| Ok(()))
        .unwrap();
    assert!(DecisionRunner::new(&context, &registry).is_err());
}

#[test]
fn failing_model_test() {
    let context = context(2, false);
    let mut registry: ModelRegistry<Person, AlternativeId> = ModelRegistry::new();
    registry
        .register(ModelMetadata::new("mode", "non-finite"), |calc, p, _| {
            let alt = calc.alternative(1, true, false);
            calc.add_utility_term(alt, 1, if p.id == 3 { f64::NAN } else { 1.0 })?;
            Ok(())
        })
        .unwrap();
    let runner = DecisionRunner::new(&context, &registry).unwrap();
    let error = runner
        .run_with_sinks(&persons(6), |_| unreachable!())
        .unwrap_err();
    assert!(format!("{error:#}").contains("person 3"));
}
