// Copyright 2022 Lucas Javaudin
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// https://creativecommons.org/licenses/by-nc-nd/4.0/legalcode

//! Data-driven decision inputs.
//!
//! A [DecisionRecord] describes, for each model, the choice set of one entity: alternatives with
//! their utility terms, shared components, nests and, optionally, a universe of candidates from
//! which the alternatives are sampled.
use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Result};
use choice::{
    AlternativeHandle, AlternativeId, AlternativeSampler, Candidate, ChoiceProbabilityCalculator,
    RandomStream, SampleItem, SampleRequest, SeedKey, StopCandidate, StopSampleRequest,
};
use hashbrown::HashMap;
use log::debug;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::model::{ModelMetadata, ModelRegistry};
use crate::parameters::Parameters;
use crate::simulation::DecisionInput;

const fn default_available() -> bool {
    true
}

/// A utility term, as `[coefficient index, value]`.
pub type TermRecord = (usize, f64);

/// Decisions of one entity (person, household, tour, ...).
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct DecisionRecord {
    /// Identifier of the household.
    pub household: u64,
    /// Identifier of the person in the household.
    #[serde(default)]
    pub person: u64,
    /// Simulated day.
    #[serde(default)]
    pub day: u64,
    /// Sequence number of the decision for the entity.
    #[serde(default)]
    pub sequence: u64,
    /// Choice set of the entity for each model it is concerned by, keyed by model name.
    pub choices: BTreeMap<String, ChoiceSet>,
}

/// Choice set of one entity for one model.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct ChoiceSet {
    /// Alternative actually chosen, if known.
    #[serde(default)]
    pub observed: Option<AlternativeId>,
    /// Alternatives, always part of the choice set.
    #[serde(default)]
    pub alternatives: Vec<AlternativeRecord>,
    /// Utility components shared by the alternatives.
    #[serde(default)]
    pub components: Vec<ComponentRecord>,
    /// Size components shared by the alternatives.
    #[serde(default)]
    pub size_components: Vec<ComponentRecord>,
    /// Nests of the alternatives.
    #[serde(default)]
    pub nests: Vec<NestRecord>,
    /// Universe of candidates from which additional alternatives are sampled.
    #[serde(default)]
    pub sampling: Option<SamplingRecord>,
}

/// An alternative of a [ChoiceSet].
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct AlternativeRecord {
    /// Identifier of the alternative.
    pub id: AlternativeId,
    #[serde(default = "default_available")]
    pub available: bool,
    /// Utility and size terms, routed by the kind of their coefficient.
    #[serde(default)]
    pub terms: Vec<TermRecord>,
    /// Keys of the utility components of the alternative.
    #[serde(default)]
    pub components: Vec<usize>,
    /// Keys of the size components of the alternative.
    #[serde(default)]
    pub size_components: Vec<usize>,
    /// Identifier of the nest of the alternative.
    #[serde(default)]
    pub nest: Option<usize>,
}

impl Default for AlternativeRecord {
    fn default() -> Self {
        AlternativeRecord {
            id: 0,
            available: default_available(),
            terms: Vec::new(),
            components: Vec::new(),
            size_components: Vec::new(),
            nest: None,
        }
    }
}

/// A (size) component of a [ChoiceSet].
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct ComponentRecord {
    pub key: usize,
    #[serde(default)]
    pub terms: Vec<TermRecord>,
}

/// A nest of a [ChoiceSet].
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct NestRecord {
    pub id: usize,
    #[serde(default)]
    pub position: usize,
    /// Index of the coefficient giving the theta of the nest.
    pub theta_coefficient: usize,
    /// Identifier of the parent nest (the implicit root if not specified).
    #[serde(default)]
    pub parent: Option<usize>,
}

/// Universe of candidates of a sampled choice set.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct SamplingRecord {
    pub candidates: Vec<CandidateRecord>,
    /// Origin of the tour, which can never be sampled.
    #[serde(default)]
    pub origin: Option<u64>,
    /// Origin of the trip, for intermediate stops.
    ///
    /// When specified, half of the sample is drawn with the weights seen from each origin.
    #[serde(default)]
    pub second_origin: Option<u64>,
    /// Usual location of the person, always part of the sample.
    #[serde(default)]
    pub usual: Option<u64>,
    /// Index of the coefficient of the sampling correction term.
    pub correction_coefficient: usize,
}

/// A candidate of a [SamplingRecord].
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct CandidateRecord {
    pub id: AlternativeId,
    /// Sampling weight (e.g., size of the location).
    pub weight: f64,
    /// Sampling weight seen from the second origin (same as `weight` if not specified).
    #[serde(default)]
    pub second_weight: Option<f64>,
    /// Utility and size terms of the alternative, if sampled.
    #[serde(default)]
    pub terms: Vec<TermRecord>,
}

impl DecisionInput for DecisionRecord {
    fn seed_key(&self) -> SeedKey {
        SeedKey {
            household: self.household,
            person: self.person,
            day: self.day,
            sequence: self.sequence,
            salt: 0,
        }
    }

    fn describe(&self) -> String {
        format!(
            "household {} (person {}, day {}, sequence {})",
            self.household, self.person, self.day, self.sequence
        )
    }

    fn observed_choice(&self, model: &str) -> Option<AlternativeId> {
        self.choices.get(model).and_then(|set| set.observed)
    }

    fn applies_to(&self, model: &str) -> bool {
        self.choices.contains_key(model)
    }
}

fn add_terms(
    calculator: &mut ChoiceProbabilityCalculator<AlternativeId>,
    id: AlternativeId,
    available: bool,
    chosen: bool,
    terms: &[TermRecord],
) -> Result<AlternativeHandle> {
    let handle = calculator.alternative(id, available, chosen);
    calculator.set_payload(handle, id)?;
    for &(coefficient, value) in terms {
        calculator.add_utility_term(handle, coefficient, value)?;
    }
    Ok(handle)
}

/// Declares the decision instance of a [ChoiceSet] in the calculator.
///
/// Sampled alternatives receive a correction term `-ln(π)` on the correction coefficient. The
/// observed choice is forced into the sample only in estimation mode.
pub fn build_choice_set(
    calculator: &mut ChoiceProbabilityCalculator<AlternativeId>,
    set: &ChoiceSet,
    sample_size: usize,
    stream: &mut RandomStream,
) -> Result<()> {
    for record in &set.components {
        let handle = calculator.create_utility_component(record.key);
        for &(coefficient, value) in &record.terms {
            calculator.add_component_term(handle, coefficient, value)?;
        }
    }
    for record in &set.size_components {
        let handle = calculator.create_size_component(record.key);
        for &(coefficient, value) in &record.terms {
            calculator.add_size_component_term(handle, coefficient, value)?;
        }
    }

    let nests: HashMap<usize, &NestRecord> = set.nests.iter().map(|n| (n.id, n)).collect();
    let nest = |id: usize| {
        nests
            .get(&id)
            .copied()
            .ok_or_else(|| anyhow!("Nest {id} is not defined"))
    };

    for record in &set.alternatives {
        let chosen = set.observed == Some(record.id);
        let handle = add_terms(calculator, record.id, record.available, chosen, &record.terms)?;
        for &key in &record.components {
            let component = calculator.utility_component(key)?;
            calculator.add_utility_component(handle, component)?;
        }
        for &key in &record.size_components {
            let component = calculator.size_component(key)?;
            calculator.add_size_component(handle, component)?;
        }
        if let Some(id) = record.nest {
            let parent = nest(id)?;
            calculator.add_nested_alternative(
                handle,
                parent.id,
                parent.position,
                parent.theta_coefficient,
            )?;
        }
    }

    if let Some(sampling) = &set.sampling {
        let chosen = set.observed.filter(|_| calculator.is_estimation_mode());
        let items = sample(sampling, sample_size, chosen, stream)?;
        let candidates: HashMap<AlternativeId, &CandidateRecord> =
            sampling.candidates.iter().map(|c| (c.id, c)).collect();
        for item in items {
            let candidate = candidates
                .get(&item.entity_id)
                .ok_or_else(|| anyhow!("Unknown sampled candidate {}", item.entity_id))?;
            if calculator.find_alternative(item.entity_id).is_some() {
                bail!(
                    "Sampled candidate {} is also an explicit alternative",
                    item.entity_id
                );
            }
            let chosen = item.is_chosen || set.observed == Some(item.entity_id);
            let handle = add_terms(
                calculator,
                item.entity_id,
                item.is_available,
                chosen,
                &candidate.terms,
            )?;
            calculator.add_utility_term(
                handle,
                sampling.correction_coefficient,
                item.utility_correction(),
            )?;
        }
    }

    // A nest only exists once something is attached to it, so the links between nests are added
    // from the bottom of the tree.
    let mut pending: Vec<&NestRecord> = set.nests.iter().filter(|n| n.parent.is_some()).collect();
    loop {
        let before = pending.len();
        let mut remaining = Vec::with_capacity(before);
        for record in pending {
            match (calculator.find_nest(record.id), record.parent) {
                (Some(handle), Some(parent_id)) => {
                    let parent = nest(parent_id)?;
                    calculator.add_nested_alternative(
                        handle,
                        parent.id,
                        parent.position,
                        parent.theta_coefficient,
                    )?;
                }
                _ => remaining.push(record),
            }
        }
        pending = remaining;
        if pending.is_empty() || pending.len() == before {
            break;
        }
    }
    for record in pending {
        debug!("Nest {} has no child and is ignored", record.id);
    }
    Ok(())
}

/// Draws the sampled alternatives of a [SamplingRecord].
fn sample(
    sampling: &SamplingRecord,
    sample_size: usize,
    chosen: Option<AlternativeId>,
    stream: &mut RandomStream,
) -> Result<Vec<SampleItem>> {
    let sampler = AlternativeSampler::new();
    let items = if let Some(second_origin) = sampling.second_origin {
        if sampling.usual.is_some() {
            bail!("A usual location cannot be forced in a sample of intermediate stops");
        }
        let candidates: Vec<StopCandidate> = sampling
            .candidates
            .iter()
            .map(|c| StopCandidate {
                entity_id: c.id,
                first_weight: c.weight,
                second_weight: c.second_weight.unwrap_or(c.weight),
            })
            .collect();
        let excluded: Vec<u64> = sampling
            .origin
            .into_iter()
            .chain(std::iter::once(second_origin))
            .collect();
        let request = StopSampleRequest {
            candidates: &candidates,
            sample_size,
            excluded: &excluded,
            chosen,
        };
        sampler.sample_two_origins(&request, stream)?
    } else {
        let universe: Vec<Candidate> = sampling
            .candidates
            .iter()
            .map(|c| Candidate::new(c.id, c.weight))
            .collect();
        let mut request = SampleRequest::new(&universe, sample_size);
        request.origin = sampling.origin;
        request.chosen = chosen;
        request.usual = sampling.usual;
        sampler.sample(&request, stream)?
    };
    Ok(items)
}

/// Returns a registry with one model per model of the parameters, each building its decision
/// instances from the choice sets of the [DecisionRecord]s.
pub fn record_registry(
    parameters: &Parameters,
) -> Result<ModelRegistry<DecisionRecord, AlternativeId>> {
    let mut registry = ModelRegistry::new();
    for model in &parameters.models {
        let name = model.name.clone();
        let sample_size = parameters.sample_size;
        registry.register(
            ModelMetadata::new(&model.name, format!("choice sets `{}`", model.name)),
            move |calculator, record: &DecisionRecord, stream| match record.choices.get(&name) {
                Some(set) => build_choice_set(calculator, set, sample_size, stream),
                None => Ok(()),
            },
        )?;
    }
    Ok(registry)
}
