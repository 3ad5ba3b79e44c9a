// Copyright 2022 Lucas Javaudin
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// https://creativecommons.org/licenses/by-nc-nd/4.0/legalcode

use std::fs::File;
use std::io::Write;
use std::path::Path;

use choice::{
    ChoiceOutcome, ChoiceProbabilityCalculator, ObservationStatus, RandomStream, RejectionReason,
};
use microsim_core::context::RunContext;
use microsim_core::io::{read_decisions, read_parameters};
use microsim_core::parameters::{Parameters, RunMode};
use microsim_core::record::{
    build_choice_set, record_registry, AlternativeRecord, CandidateRecord, ChoiceSet,
    DecisionRecord, NestRecord, SamplingRecord,
};
use microsim_core::simulation::{DecisionOutcome, DecisionRunner};

const MODE_COEFFICIENTS: &str = "\
Mode choice
END
    1   asc_car       F    0.4
    2   asc_transit   F   -0.3
    3   Nest_transit  T    0.6
-1
";

const DESTINATION_COEFFICIENTS: &str = "\
Destination choice
END
    1   dist        F   -0.35
    2   samplecorr  T    1.0
    5   Gamm_empl   T    0.0
    6   Gamm_hh     F   -1.2
    9   LSM_size    T    0.85
-1
";

fn weight(id: u64) -> f64 {
    ((id * 37) % 101) as f64
}

fn home(household: u64) -> u64 {
    household * 7
}

fn mode_choice_set() -> ChoiceSet {
    ChoiceSet {
        alternatives: vec![
            AlternativeRecord {
                terms: vec![(1, 1.0)],
                ..alternative(1)
            },
            AlternativeRecord {
                terms: vec![(2, 1.0)],
                nest: Some(20),
                ..alternative(2)
            },
            AlternativeRecord {
                nest: Some(20),
                ..alternative(3)
            },
        ],
        nests: vec![NestRecord {
            id: 20,
            position: 0,
            theta_coefficient: 3,
            parent: None,
        }],
        ..Default::default()
    }
}

fn alternative(id: u64) -> AlternativeRecord {
    AlternativeRecord {
        id,
        ..Default::default()
    }
}

fn destination_choice_set(household: u64, observed: Option<u64>) -> ChoiceSet {
    let origin = home(household);
    let candidates = (1..=300)
        .map(|id| CandidateRecord {
            id,
            weight: weight(id),
            second_weight: None,
            terms: vec![
                (1, (id as f64 - origin as f64).abs() / 100.0),
                (5, weight(id)),
                (6, 0.5 * weight(id)),
            ],
        })
        .collect();
    ChoiceSet {
        observed,
        sampling: Some(SamplingRecord {
            candidates,
            origin: Some(origin),
            correction_coefficient: 2,
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Writes the coefficient files, the decision records and the parameters to the directory and
/// returns the parameters read back from the file.
fn write_inputs(dir: &Path, records: &[DecisionRecord], estimation: bool) -> Parameters {
    for (name, content) in [
        ("mode.f12", MODE_COEFFICIENTS),
        ("destination.f12", DESTINATION_COEFFICIENTS),
    ] {
        File::create(dir.join(name))
            .unwrap()
            .write_all(content.as_bytes())
            .unwrap();
    }
    let decisions = dir.join("decisions.json");
    File::create(&decisions)
        .unwrap()
        .write_all(&serde_json::to_vec(records).unwrap())
        .unwrap();
    let mut parameters = serde_json::json!({
        "input_files": {"decisions": decisions},
        "output_directory": dir.join("output"),
        "nb_threads": 3,
        "random_seed": 7,
        "sample_size": 25,
        "models": [
            {"name": "mode", "coefficients": dir.join("mode.f12")},
            {"name": "destination", "coefficients": dir.join("destination.f12")}
        ]
    });
    if estimation {
        parameters["mode"] = "Estimation".into();
        parameters["estimated_model"] = "destination".into();
    }
    let filename = dir.join("parameters.json");
    File::create(&filename)
        .unwrap()
        .write_all(&serde_json::to_vec_pretty(&parameters).unwrap())
        .unwrap();
    std::fs::create_dir_all(dir.join("output")).unwrap();
    read_parameters(&filename).unwrap()
}

fn records(observed: bool) -> Vec<DecisionRecord> {
    (1..=40)
        .map(|household| {
            let mut choices = vec![("mode".to_owned(), mode_choice_set())];
            if household % 2 == 0 {
                // Parcel 101 has a zero weight.
                let observed = observed.then_some(if household == 2 { 101 } else { household + 3 });
                choices.push((
                    "destination".to_owned(),
                    destination_choice_set(household, observed),
                ));
            }
            DecisionRecord {
                household,
                person: 1,
                choices: choices.into_iter().collect(),
                ..Default::default()
            }
        })
        .collect()
}

#[test]
fn nested_mode_probabilities_test() {
    let dir = tempfile::tempdir().unwrap();
    let parameters = write_inputs(dir.path(), &records(false), false);
    let context = RunContext::new(parameters).unwrap();
    let model = context.model("mode").unwrap();
    let mut calculator = ChoiceProbabilityCalculator::new(model.coefficients.clone(), false);
    calculator.reset(0);
    let mut stream = RandomStream::from_seed(0);
    build_choice_set(&mut calculator, &mode_choice_set(), 25, &mut stream).unwrap();
    let probabilities = calculator.probabilities().unwrap().unwrap();

    let theta = 0.6f64;
    let nest_logsum = theta * ((-0.3f64 / theta).exp() + 1.0).ln();
    let car = 0.4f64.exp() / (0.4f64.exp() + nest_logsum.exp());
    let transit = (1.0 - car) * (-0.3f64 / theta).exp() / ((-0.3f64 / theta).exp() + 1.0);
    assert!((probabilities.get(1).unwrap() - car).abs() < 1e-9);
    assert!((probabilities.get(2).unwrap() - transit).abs() < 1e-9);
    assert!((probabilities.get(3).unwrap() - (1.0 - car - transit)).abs() < 1e-9);
}

#[test]
fn application_test() {
    let dir = tempfile::tempdir().unwrap();
    let parameters = write_inputs(dir.path(), &records(false), false);
    let records = read_decisions(parameters.input_files.decisions.as_ref().unwrap()).unwrap();
    assert_eq!(records.len(), 40);
    let context = RunContext::new(parameters).unwrap();
    let registry = record_registry(context.parameters()).unwrap();
    let runner = DecisionRunner::new(&context, &registry).unwrap();
    let results = runner.run(&records).unwrap();
    assert_eq!(results.nb_batches, 3);
    assert_eq!(results.decisions.len(), 60);
    assert_eq!(results.nb_no_alternative(), 0);
    for decision in &results.decisions {
        let DecisionOutcome::Simulated(ChoiceOutcome::Chosen(chosen)) = &decision.outcome else {
            panic!("Unexpected outcome: {:?}", decision.outcome);
        };
        assert_eq!(chosen.payload, Some(chosen.id));
        assert!(chosen.probability > 0.0);
        if decision.model == "mode" {
            assert!((1..=3).contains(&chosen.id));
        } else {
            let household = records[decision.input].household;
            assert_ne!(chosen.id, home(household));
            assert!(weight(chosen.id) > 0.0);
        }
    }
    let destination = results
        .models
        .iter()
        .find(|m| m.name == "destination")
        .unwrap();
    assert_eq!(destination.calculator.instances, 20);

    // Same results with a single batch.
    let mut parameters = context.parameters().clone();
    parameters.nb_threads = 1;
    let context = RunContext::new(parameters).unwrap();
    let runner = DecisionRunner::new(&context, &registry).unwrap();
    assert_eq!(runner.run(&records).unwrap().decisions, results.decisions);
}

#[test]
fn estimation_test() {
    let dir = tempfile::tempdir().unwrap();
    let parameters = write_inputs(dir.path(), &records(true), true);
    assert_eq!(parameters.mode, RunMode::Estimation);
    let records = read_decisions(parameters.input_files.decisions.as_ref().unwrap()).unwrap();
    let context = RunContext::new(parameters).unwrap();
    let registry = record_registry(context.parameters()).unwrap();
    let runner = DecisionRunner::new(&context, &registry).unwrap();
    let results = runner.run(&records).unwrap();

    // Only the destination model is run.
    assert_eq!(results.decisions.len(), 20);
    assert!(results.decisions.iter().all(|d| d.model == "destination"));
    let rejected = DecisionOutcome::Observation(ObservationStatus::Rejected(
        RejectionReason::ChosenAlternativeWithoutSize,
    ));
    assert_eq!(results.decisions[0].outcome, rejected);
    assert!(results.decisions[1..]
        .iter()
        .all(|d| d.outcome == DecisionOutcome::Observation(ObservationStatus::Accepted)));
    let summary = results.models[0].estimation.as_ref().unwrap();
    assert_eq!(summary.accepted, 19);
    assert_eq!(summary.rejected["ChosenAlternativeWithoutSize"], 1);
    // The correction term is recorded for every sampled alternative.
    assert!(summary.coefficients[&2].non_zero > 19 * 20);

    let output = dir.path().join("output");
    let nb_rows: usize = (0..results.nb_batches)
        .map(|batch| {
            let filename = output.join(format!("observations-destination-batch{batch}.csv"));
            csv::Reader::from_path(filename).unwrap().records().count()
        })
        .sum();
    assert!(nb_rows > 19 * 25);
}
