// Copyright 2022 Lucas Javaudin
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// https://creativecommons.org/licenses/by-nc-nd/4.0/legalcode

//! Choice probability calculator: builds one decision instance at a time, computes its nested
//! logit probabilities and either draws a simulated choice or writes an estimation observation.
use std::sync::Arc;

use anyhow::Result;
use hashbrown::HashMap;
use log::trace;
use serde::{Deserialize, Serialize};

use crate::alternative::{Alternative, AlternativeHandle, AlternativeId};
use crate::coefficients::{CoefficientStore, EPSILON};
use crate::component::{
    Component, ComponentHandle, Contribution, SizeComponentHandle, UtilityTerm,
};
use crate::logit::{draw_index, logit_level, LogitLevel};
use crate::nest::{NestHandle, NestNode, NestTree, NodeRef};
use crate::observation::{
    EstimationSummary, Observation, ObservationSink, ObservationStatus, ObservedAlternative,
    ObservedTerm, TermSource,
};
use crate::random::RandomUtility;
use crate::ChoiceError;

/// Alternative selected by a simulated choice.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ChosenAlternative<P> {
    /// Identifier of the alternative.
    pub id: AlternativeId,
    /// Probability that the alternative was chosen.
    pub probability: f64,
    /// Payload of the alternative.
    pub payload: Option<P>,
}

/// Outcome of a simulated choice.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub enum ChoiceOutcome<P> {
    /// An alternative was chosen.
    Chosen(ChosenAlternative<P>),
    /// No alternative is available.
    ///
    /// This is a normal outcome: the caller decides what to do with the entity.
    NoAlternative,
}

impl<P> ChoiceOutcome<P> {
    /// Returns the id of the chosen alternative, if any.
    pub fn chosen_id(&self) -> Option<AlternativeId> {
        match self {
            Self::Chosen(chosen) => Some(chosen.id),
            Self::NoAlternative => None,
        }
    }

    /// Returns `true` if no alternative was available.
    pub fn is_no_alternative(&self) -> bool {
        matches!(self, Self::NoAlternative)
    }
}

/// Choice probabilities of the available alternatives of a decision instance.
#[derive(Clone, Debug, PartialEq)]
pub struct Probabilities {
    /// `(id, probability)` pairs, by increasing id.
    entries: Vec<(AlternativeId, f64)>,
    logsum: f64,
}

impl Probabilities {
    /// Returns the probability of the alternative with the given id (`None` if the alternative
    /// does not exist or is not available).
    pub fn get(&self, id: AlternativeId) -> Option<f64> {
        self.entries
            .binary_search_by_key(&id, |&(i, _)| i)
            .ok()
            .map(|k| self.entries[k].1)
    }

    /// Iterates over the `(id, probability)` pairs of the available alternatives, by increasing
    /// id.
    pub fn iter(&self) -> impl Iterator<Item = (AlternativeId, f64)> + '_ {
        self.entries.iter().copied()
    }

    /// Returns the number of available alternatives.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if there is no available alternative.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the log-sum of the root of the choice.
    pub fn logsum(&self) -> f64 {
        self.logsum
    }
}

/// Counters of a calculator, cumulated over all decision instances.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct CalculatorStats {
    /// Number of decision instances started.
    pub instances: u64,
    /// Number of simulated choices.
    pub simulated: u64,
    /// Number of simulated choices with no available alternative.
    pub no_alternative: u64,
    /// Number of evaluations of a utility or size component.
    pub component_evaluations: u64,
    /// Number of simulated choices with an observed alternative which was available.
    pub observed_available: u64,
    /// Number of simulated choices where the simulated alternative is the observed one.
    pub observed_predicted: u64,
}

impl CalculatorStats {
    /// Adds the counters of another calculator (e.g., from another batch).
    pub fn merge(&mut self, other: &CalculatorStats) {
        self.instances += other.instances;
        self.simulated += other.simulated;
        self.no_alternative += other.no_alternative;
        self.component_evaluations += other.component_evaluations;
        self.observed_available += other.observed_available;
        self.observed_predicted += other.observed_predicted;
    }
}

/// A child of a nest (or of the root) in the evaluated tree.
#[derive(Copy, Clone, Debug)]
enum Child {
    Alternative(usize),
    Nest(usize),
}

/// Result of the evaluation of the current decision instance.
#[derive(Clone, Debug, Default)]
struct Evaluation {
    /// Indices of the available alternatives, by increasing id.
    available: Vec<usize>,
    /// Total utility of each alternative (`None` for unavailable alternatives).
    utilities: Vec<Option<f64>>,
    /// Unconditional probability of each alternative.
    probabilities: Vec<f64>,
    /// Log-sum of the root, `None` if no alternative is available.
    logsum: Option<f64>,
}

/// Calculator of the choice probabilities of one model.
///
/// A calculator is reused for all the decision instances of a model in a batch: each instance
/// starts with [ChoiceProbabilityCalculator::reset].
///
/// # Example
///
/// ```
/// use std::sync::Arc;
///
/// use choice::{ChoiceProbabilityCalculator, Coefficient, CoefficientStore, RandomStream};
///
/// let coefficients = CoefficientStore::new(
///     "mode choice",
///     vec![Coefficient::new(1, "asc", 1.0, false)],
/// )
/// .unwrap();
/// let mut calculator: ChoiceProbabilityCalculator<&str> =
///     ChoiceProbabilityCalculator::new(Arc::new(coefficients), false);
/// calculator.reset(1);
/// let car = calculator.alternative(1, true, false);
/// calculator.set_payload(car, "car").unwrap();
/// calculator.add_utility_term(car, 1, 1.0).unwrap();
/// let walk = calculator.alternative(2, true, false);
/// calculator.set_payload(walk, "walk").unwrap();
/// let probabilities = calculator.probabilities().unwrap().unwrap();
/// // e / (1 + e)
/// assert!((probabilities.get(1).unwrap() - 0.7311).abs() < 1e-4);
/// let outcome = calculator
///     .simulate_choice(&mut RandomStream::from_seed(13))
///     .unwrap();
/// assert!(outcome.chosen_id().is_some());
/// ```
#[derive(Clone, Debug)]
pub struct ChoiceProbabilityCalculator<P> {
    coefficients: Arc<CoefficientStore>,
    estimation_mode: bool,
    key: u64,
    instance: u64,
    alternatives: Vec<Alternative<P>>,
    alternative_ids: HashMap<AlternativeId, usize>,
    components: Vec<Component>,
    component_keys: HashMap<usize, usize>,
    size_components: Vec<Component>,
    size_component_keys: HashMap<usize, usize>,
    nests: NestTree,
    evaluation: Option<Evaluation>,
    stats: CalculatorStats,
    summary: EstimationSummary,
}

impl<P> ChoiceProbabilityCalculator<P> {
    /// Creates a calculator for the model with the given coefficients.
    ///
    /// In estimation mode, the calculator writes observations instead of simulating choices.
    pub fn new(coefficients: Arc<CoefficientStore>, estimation_mode: bool) -> Self {
        ChoiceProbabilityCalculator {
            coefficients,
            estimation_mode,
            key: 0,
            instance: 0,
            alternatives: Vec::new(),
            alternative_ids: HashMap::new(),
            components: Vec::new(),
            component_keys: HashMap::new(),
            size_components: Vec::new(),
            size_component_keys: HashMap::new(),
            nests: NestTree::default(),
            evaluation: None,
            stats: CalculatorStats::default(),
            summary: EstimationSummary::default(),
        }
    }

    /// Returns the title of the model.
    pub fn title(&self) -> &str {
        self.coefficients.title()
    }

    /// Returns the coefficients of the model.
    pub fn coefficients(&self) -> &CoefficientStore {
        &self.coefficients
    }

    /// Returns `true` if the calculator writes estimation observations.
    pub fn is_estimation_mode(&self) -> bool {
        self.estimation_mode
    }

    /// Returns the key of the current decision instance.
    pub fn key(&self) -> u64 {
        self.key
    }

    /// Returns the counters of the calculator.
    pub fn stats(&self) -> &CalculatorStats {
        &self.stats
    }

    /// Returns the summary of the observations written so far.
    pub fn estimation_summary(&self) -> &EstimationSummary {
        &self.summary
    }

    /// Starts a new decision instance identified by `key`.
    ///
    /// All alternatives, components and nests of the previous instance are dropped and their
    /// handles become invalid.
    pub fn reset(&mut self, key: u64) {
        self.key = key;
        self.instance += 1;
        self.alternatives.clear();
        self.alternative_ids.clear();
        self.components.clear();
        self.component_keys.clear();
        self.size_components.clear();
        self.size_component_keys.clear();
        self.nests.clear();
        self.evaluation = None;
        self.stats.instances += 1;
    }

    /// Returns the alternative with the given id, creating it if needed.
    ///
    /// Calling the function again with the same id returns the same alternative, with the
    /// availability and chosen flags of the last call; the terms already added are kept.
    pub fn alternative(
        &mut self,
        id: AlternativeId,
        available: bool,
        chosen: bool,
    ) -> AlternativeHandle {
        self.evaluation = None;
        let index = match self.alternative_ids.get(&id) {
            Some(&index) => {
                let alternative = &mut self.alternatives[index];
                alternative.available = available;
                alternative.chosen = chosen;
                index
            }
            None => {
                let index = self.alternatives.len();
                self.alternatives
                    .push(Alternative::new(id, available, chosen));
                self.alternative_ids.insert(id, index);
                index
            }
        };
        AlternativeHandle {
            index,
            instance: self.instance,
        }
    }

    /// Returns the handle of the alternative with the given id, if it exists.
    pub fn find_alternative(&self, id: AlternativeId) -> Option<AlternativeHandle> {
        self.alternative_ids.get(&id).map(|&index| AlternativeHandle {
            index,
            instance: self.instance,
        })
    }

    /// Returns the alternative of a handle.
    pub fn get_alternative(
        &self,
        handle: AlternativeHandle,
    ) -> Result<&Alternative<P>, ChoiceError> {
        let index = self.alternative_index(handle)?;
        Ok(&self.alternatives[index])
    }

    /// Returns the number of alternatives of the current decision instance.
    pub fn nb_alternatives(&self) -> usize {
        self.alternatives.len()
    }

    /// Returns the nests of the current decision instance.
    pub fn nests(&self) -> impl Iterator<Item = &NestNode> {
        self.nests.iter()
    }

    /// Sets the payload identifying what the alternative represents.
    pub fn set_payload(
        &mut self,
        handle: AlternativeHandle,
        payload: P,
    ) -> Result<(), ChoiceError> {
        let index = self.alternative_index(handle)?;
        self.alternatives[index].payload = Some(payload);
        Ok(())
    }

    /// Adds the term `coefficient * value` to the alternative.
    ///
    /// Returns an error if the value is not finite or if the coefficient does not exist.
    pub fn add_utility_term(
        &mut self,
        handle: AlternativeHandle,
        coefficient: usize,
        value: f64,
    ) -> Result<(), ChoiceError> {
        let index = self.alternative_index(handle)?;
        self.coefficients.check(coefficient)?;
        let alternative = &mut self.alternatives[index];
        if !value.is_finite() {
            return Err(ChoiceError::NonFiniteValue {
                alternative: alternative.id,
                coefficient,
                value,
            });
        }
        alternative.terms.push(UtilityTerm::new(coefficient, value));
        self.evaluation = None;
        Ok(())
    }

    /// Creates the utility component with the given key and returns its handle.
    ///
    /// If a component with the same key already exists in the decision instance, its terms are
    /// cleared and the same handle is returned: creating a component twice and adding the same
    /// terms gives the same utility as creating it once.
    pub fn create_utility_component(&mut self, key: usize) -> ComponentHandle {
        let slot = create_component(&mut self.components, &mut self.component_keys, key);
        self.evaluation = None;
        ComponentHandle {
            slot,
            instance: self.instance,
        }
    }

    /// Returns the handle of a utility component created earlier in the decision instance.
    pub fn utility_component(&self, key: usize) -> Result<ComponentHandle, ChoiceError> {
        self.component_keys
            .get(&key)
            .map(|&slot| ComponentHandle {
                slot,
                instance: self.instance,
            })
            .ok_or(ChoiceError::UnregisteredComponent { key })
    }

    /// Adds the term `coefficient * value` to a utility component.
    pub fn add_component_term(
        &mut self,
        handle: ComponentHandle,
        coefficient: usize,
        value: f64,
    ) -> Result<(), ChoiceError> {
        let slot = self.component_slot(handle)?;
        self.components[slot].push(UtilityTerm::new(coefficient, value), &self.coefficients)?;
        self.evaluation = None;
        Ok(())
    }

    /// Attaches a utility component to an alternative.
    ///
    /// Attaching the same component twice to an alternative has no effect.
    pub fn add_utility_component(
        &mut self,
        alternative: AlternativeHandle,
        component: ComponentHandle,
    ) -> Result<(), ChoiceError> {
        let index = self.alternative_index(alternative)?;
        let slot = self.component_slot(component)?;
        let components = &mut self.alternatives[index].components;
        if !components.contains(&slot) {
            components.push(slot);
        }
        self.evaluation = None;
        Ok(())
    }

    /// Creates the size component with the given key and returns its handle.
    ///
    /// Same semantic as [ChoiceProbabilityCalculator::create_utility_component].
    pub fn create_size_component(&mut self, key: usize) -> SizeComponentHandle {
        let slot = create_component(
            &mut self.size_components,
            &mut self.size_component_keys,
            key,
        );
        self.evaluation = None;
        SizeComponentHandle {
            slot,
            instance: self.instance,
        }
    }

    /// Returns the handle of a size component created earlier in the decision instance.
    pub fn size_component(&self, key: usize) -> Result<SizeComponentHandle, ChoiceError> {
        self.size_component_keys
            .get(&key)
            .map(|&slot| SizeComponentHandle {
                slot,
                instance: self.instance,
            })
            .ok_or(ChoiceError::UnregisteredSizeComponent { key })
    }

    /// Adds the term `coefficient * value` to a size component.
    ///
    /// Terms with a size-variable coefficient contribute to the size of the alternatives, other
    /// terms (e.g., the sampling correction) contribute to their utility.
    pub fn add_size_component_term(
        &mut self,
        handle: SizeComponentHandle,
        coefficient: usize,
        value: f64,
    ) -> Result<(), ChoiceError> {
        let slot = self.size_component_slot(handle)?;
        self.size_components[slot]
            .push(UtilityTerm::new(coefficient, value), &self.coefficients)?;
        self.evaluation = None;
        Ok(())
    }

    /// Attaches a size component to an alternative.
    pub fn add_size_component(
        &mut self,
        alternative: AlternativeHandle,
        component: SizeComponentHandle,
    ) -> Result<(), ChoiceError> {
        let index = self.alternative_index(alternative)?;
        let slot = self.size_component_slot(component)?;
        let components = &mut self.alternatives[index].size_components;
        if !components.contains(&slot) {
            components.push(slot);
        }
        self.evaluation = None;
        Ok(())
    }

    /// Attaches an alternative or a nest under the nest `parent_id`.
    ///
    /// The parent nest is created on first use, with the theta given by the coefficient
    /// `theta_coefficient`; `position` orders the nests. Returns the handle of the parent nest,
    /// which can itself be attached to a higher-level nest.
    pub fn add_nested_alternative(
        &mut self,
        child: impl Into<NodeRef>,
        parent_id: usize,
        position: usize,
        theta_coefficient: usize,
    ) -> Result<NestHandle, ChoiceError> {
        let child = child.into();
        // Validate the child before creating the parent.
        match child {
            NodeRef::Alternative(handle) => {
                self.alternative_index(handle)?;
            }
            NodeRef::Nest(handle) => {
                self.nest_index(handle)?;
            }
        }
        let parent = self.nests.get_or_create(
            parent_id,
            position,
            theta_coefficient,
            &self.coefficients,
            self.estimation_mode,
        )?;
        match child {
            NodeRef::Alternative(handle) => {
                let alternative = &mut self.alternatives[handle.index];
                match alternative.nest {
                    Some(previous) if previous != parent => {
                        return Err(ChoiceError::NestParentConflict {
                            node: format!("Alternative {}", alternative.id),
                            previous: self.nests.get(previous).id(),
                            given: parent_id,
                        });
                    }
                    _ => alternative.nest = Some(parent),
                }
            }
            NodeRef::Nest(handle) => self.nests.link(handle.index, parent)?,
        }
        self.evaluation = None;
        Ok(NestHandle {
            index: parent,
            instance: self.instance,
        })
    }

    /// Returns the handle of the nest with the given id, if it exists.
    pub fn find_nest(&self, id: usize) -> Option<NestHandle> {
        self.nests
            .iter()
            .position(|n| n.id() == id)
            .map(|index| NestHandle {
                index,
                instance: self.instance,
            })
    }

    /// Returns the utility of an alternative, including the size term (`None` if the alternative
    /// is not available).
    pub fn utility(&mut self, handle: AlternativeHandle) -> Result<Option<f64>, ChoiceError> {
        let index = self.alternative_index(handle)?;
        Ok(self.evaluate()?.utilities[index])
    }

    /// Returns the choice probabilities of the available alternatives, or `None` if no
    /// alternative is available.
    pub fn probabilities(&mut self) -> Result<Option<Probabilities>, ChoiceError> {
        self.evaluate()?;
        let alternatives = &self.alternatives;
        let Some(evaluation) = self.evaluation.as_ref() else {
            return Ok(None);
        };
        let Some(logsum) = evaluation.logsum else {
            return Ok(None);
        };
        let entries = evaluation
            .available
            .iter()
            .map(|&i| (alternatives[i].id, evaluation.probabilities[i]))
            .collect();
        Ok(Some(Probabilities { entries, logsum }))
    }

    /// Returns the log-sum of the decision instance, or `None` if no alternative is available.
    ///
    /// The log-sum is the composite utility of the choice, used by upstream models.
    pub fn logsum(&mut self) -> Result<Option<f64>, ChoiceError> {
        Ok(self.evaluate()?.logsum)
    }

    /// Draws the chosen alternative.
    ///
    /// One uniform random number is drawn and the available alternatives, ordered by id, are
    /// scanned until the cumulative probability exceeds the draw.
    pub fn simulate_choice<R: RandomUtility + ?Sized>(
        &mut self,
        random: &mut R,
    ) -> Result<ChoiceOutcome<P>, ChoiceError>
    where
        P: Clone,
    {
        self.simulate_choice_with_observed(random, None)
    }

    /// Draws the chosen alternative and compares it with the observed alternative, if any.
    ///
    /// The probability of the observed alternative is logged at trace level and the comparison is
    /// counted in the [CalculatorStats].
    pub fn simulate_choice_with_observed<R: RandomUtility + ?Sized>(
        &mut self,
        random: &mut R,
        observed: Option<AlternativeId>,
    ) -> Result<ChoiceOutcome<P>, ChoiceError>
    where
        P: Clone,
    {
        let u = random.uniform01();
        self.evaluate()?;
        self.stats.simulated += 1;
        let Some(evaluation) = self.evaluation.as_ref() else {
            return Ok(ChoiceOutcome::NoAlternative);
        };
        let probabilities: Vec<f64> = evaluation
            .available
            .iter()
            .map(|&i| evaluation.probabilities[i])
            .collect();
        let Some(k) = draw_index(&probabilities, u) else {
            self.stats.no_alternative += 1;
            trace!(
                "> Key {} no alternative available for model {}",
                self.key,
                self.title()
            );
            return Ok(ChoiceOutcome::NoAlternative);
        };
        let index = evaluation.available[k];
        let alternative = &self.alternatives[index];
        trace!(
            "> Key {} Alternative {} chosen for model {}",
            self.key,
            alternative.id,
            self.title()
        );
        if let Some(observed) = observed {
            if let Some(&j) = self.alternative_ids.get(&observed) {
                if self.alternatives[j].available {
                    self.stats.observed_available += 1;
                    trace!(
                        "> Key {} observed alternative {} has probability {}",
                        self.key,
                        observed,
                        evaluation.probabilities[j]
                    );
                }
            }
            if observed == alternative.id {
                self.stats.observed_predicted += 1;
            }
        }
        Ok(ChoiceOutcome::Chosen(ChosenAlternative {
            id: alternative.id,
            probability: probabilities[k],
            payload: alternative.payload.clone(),
        }))
    }

    /// Returns the observation of the current decision instance: for each alternative (by
    /// increasing id), its availability, its chosen flag and all its terms.
    pub fn observation(&self) -> Observation {
        let mut order: Vec<usize> = (0..self.alternatives.len()).collect();
        order.sort_by_key(|&i| self.alternatives[i].id);
        let alternatives = order
            .into_iter()
            .map(|i| {
                let alternative = &self.alternatives[i];
                let mut terms = Vec::new();
                self.push_observed_terms(&mut terms, &alternative.terms, TermSource::Direct);
                for &slot in &alternative.components {
                    let component = &self.components[slot];
                    self.push_observed_terms(
                        &mut terms,
                        component.terms(),
                        TermSource::Component(component.key()),
                    );
                }
                for &slot in &alternative.size_components {
                    let component = &self.size_components[slot];
                    self.push_observed_terms(
                        &mut terms,
                        component.terms(),
                        TermSource::SizeComponent(component.key()),
                    );
                }
                ObservedAlternative {
                    id: alternative.id,
                    available: alternative.available,
                    chosen: alternative.chosen,
                    terms,
                }
            })
            .collect();
        Observation {
            key: self.key,
            alternatives,
        }
    }

    /// Writes the observation of the current decision instance to the sink.
    ///
    /// Observations without exactly one chosen alternative (or whose chosen alternative has no
    /// size) are not written: they are counted in the [EstimationSummary] as rejected.
    ///
    /// Returns an error if the calculator is not in estimation mode.
    pub fn write_observation<S: ObservationSink + ?Sized>(
        &mut self,
        sink: &mut S,
    ) -> Result<ObservationStatus> {
        if !self.estimation_mode {
            return Err(ChoiceError::NotInEstimationMode(self.title().to_owned()).into());
        }
        let observation = self.observation();
        if let Some(reason) = observation.rejection_reason() {
            trace!(
                "> Key {} observation rejected for model {}: {reason:?}",
                self.key,
                self.title()
            );
            self.summary.reject(reason);
            return Ok(ObservationStatus::Rejected(reason));
        }
        sink.write(&observation)?;
        self.summary.record(&observation);
        Ok(ObservationStatus::Accepted)
    }

    fn push_observed_terms(
        &self,
        output: &mut Vec<ObservedTerm>,
        terms: &[UtilityTerm],
        source: TermSource,
    ) {
        output.extend(terms.iter().map(|t| ObservedTerm {
            source,
            coefficient: t.coefficient,
            value: t.value,
            is_size: self
                .coefficients
                .get(t.coefficient)
                .is_some_and(|c| c.kind.is_size()),
        }));
    }

    fn alternative_index(&self, handle: AlternativeHandle) -> Result<usize, ChoiceError> {
        if handle.instance == self.instance && handle.index < self.alternatives.len() {
            Ok(handle.index)
        } else {
            Err(ChoiceError::UnknownAlternative(handle.index))
        }
    }

    fn nest_index(&self, handle: NestHandle) -> Result<usize, ChoiceError> {
        if handle.instance == self.instance && handle.index < self.nests.len() {
            Ok(handle.index)
        } else {
            Err(ChoiceError::UnknownNest(handle.index))
        }
    }

    fn component_slot(&self, handle: ComponentHandle) -> Result<usize, ChoiceError> {
        match self.components.get(handle.slot) {
            Some(_) if handle.instance == self.instance => Ok(handle.slot),
            Some(component) => Err(ChoiceError::UnregisteredComponent {
                key: component.key(),
            }),
            None => Err(ChoiceError::UnregisteredComponent { key: handle.slot }),
        }
    }

    fn size_component_slot(&self, handle: SizeComponentHandle) -> Result<usize, ChoiceError> {
        match self.size_components.get(handle.slot) {
            Some(_) if handle.instance == self.instance => Ok(handle.slot),
            Some(component) => Err(ChoiceError::UnregisteredSizeComponent {
                key: component.key(),
            }),
            None => Err(ChoiceError::UnregisteredSizeComponent { key: handle.slot }),
        }
    }

    /// Evaluates the decision instance, if it was modified since the last evaluation.
    fn evaluate(&mut self) -> Result<&Evaluation, ChoiceError> {
        let evaluation = match self.evaluation.take() {
            Some(evaluation) => evaluation,
            None => self.compute()?,
        };
        Ok(self.evaluation.insert(evaluation))
    }

    fn compute(&mut self) -> Result<Evaluation, ChoiceError> {
        let coefficients = &*self.coefficients;
        // Shared components are evaluated once for all the alternatives.
        let component_values: Vec<Contribution> = self
            .components
            .iter()
            .map(|c| Contribution::from_terms(c.terms(), coefficients))
            .collect();
        let size_component_values: Vec<Contribution> = self
            .size_components
            .iter()
            .map(|c| Contribution::from_terms(c.terms(), coefficients))
            .collect();
        self.stats.component_evaluations +=
            (component_values.len() + size_component_values.len()) as u64;
        let size_multiplier = coefficients.size_multiplier_value();

        let mut available: Vec<usize> = (0..self.alternatives.len())
            .filter(|&i| self.alternatives[i].available)
            .collect();
        available.sort_by_key(|&i| self.alternatives[i].id);

        let mut utilities = vec![None; self.alternatives.len()];
        for &i in &available {
            let alternative = &self.alternatives[i];
            let mut contribution = Contribution::from_terms(&alternative.terms, coefficients);
            for &slot in &alternative.components {
                contribution.merge(&component_values[slot]);
            }
            for &slot in &alternative.size_components {
                contribution.merge(&size_component_values[slot]);
            }
            let mut utility = contribution.utility;
            if contribution.size >= EPSILON {
                utility += contribution.size.ln() * size_multiplier;
            }
            if !utility.is_finite() {
                return Err(ChoiceError::NonFiniteUtility {
                    alternative: alternative.id,
                    value: utility,
                });
            }
            utilities[i] = Some(utility);
        }

        // Children of each nest; the last entry is the implicit root.
        let nb_nests = self.nests.len();
        let root = nb_nests;
        let mut children: Vec<Vec<Child>> = vec![Vec::new(); nb_nests + 1];
        for &i in &available {
            let parent = self.alternatives[i].nest.unwrap_or(root);
            children[parent].push(Child::Alternative(i));
        }
        let order = self.nests.bottom_up_order();
        for &j in &order {
            let parent = self.nests.get(j).parent.unwrap_or(root);
            children[parent].push(Child::Nest(j));
        }

        // Bottom-up: log-sum of each nest, over its children with at least one available
        // alternative.
        let mut nest_values: Vec<Option<f64>> = vec![None; nb_nests];
        let mut levels: Vec<Option<(Vec<Child>, LogitLevel)>> = vec![None; nb_nests + 1];
        for node in order.iter().copied().chain(std::iter::once(root)) {
            let theta = if node == root {
                1.0
            } else {
                self.nests.get(node).theta()
            };
            let (included, values): (Vec<Child>, Vec<f64>) = children[node]
                .iter()
                .filter_map(|&child| {
                    let value = match child {
                        Child::Alternative(i) => utilities[i],
                        Child::Nest(j) => nest_values[j],
                    };
                    value.map(|v| (child, v))
                })
                .unzip();
            if let Some(level) = logit_level(&values, theta) {
                if node != root {
                    nest_values[node] = Some(level.logsum);
                }
                levels[node] = Some((included, level));
            }
        }

        // Top-down: multiply the conditional probabilities along the paths.
        let mut probabilities = vec![0.0; self.alternatives.len()];
        let mut nest_probabilities = vec![0.0; nb_nests];
        let logsum = levels[root].as_ref().map(|(_, level)| level.logsum);
        for node in std::iter::once(root).chain(order.iter().rev().copied()) {
            let Some((included, level)) = levels[node].as_ref() else {
                continue;
            };
            let parent_probability = if node == root {
                1.0
            } else {
                nest_probabilities[node]
            };
            for (child, p) in included.iter().zip(level.probabilities.iter()) {
                match *child {
                    Child::Alternative(i) => probabilities[i] = parent_probability * p,
                    Child::Nest(j) => nest_probabilities[j] = parent_probability * p,
                }
            }
        }

        Ok(Evaluation {
            available,
            utilities,
            probabilities,
            logsum,
        })
    }
}

fn create_component(
    components: &mut Vec<Component>,
    keys: &mut HashMap<usize, usize>,
    key: usize,
) -> usize {
    match keys.get(&key) {
        Some(&slot) => {
            components[slot].clear();
            slot
        }
        None => {
            let slot = components.len();
            components.push(Component::new(key));
            keys.insert(key, slot);
            slot
        }
    }
}
