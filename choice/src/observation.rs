// Copyright 2022 Lucas Javaudin
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// https://creativecommons.org/licenses/by-nc-nd/4.0/legalcode

//! Estimation observations: the data of a decision instance consumed by estimation software.
use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::AlternativeId;

/// Values closer to zero than this are counted as zero in the summaries.
const ZERO_TOLERANCE: f64 = 1e-40;

/// Origin of a term in an observation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum TermSource {
    /// Term attached directly to the alternative.
    Direct,
    /// Term of the utility component with the given key.
    Component(usize),
    /// Term of the size component with the given key.
    SizeComponent(usize),
}

/// A `(coefficient, value)` pair contributed to an alternative.
#[derive(Copy, Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ObservedTerm {
    pub source: TermSource,
    pub coefficient: usize,
    pub value: f64,
    /// `true` if the coefficient is a size variable.
    pub is_size: bool,
}

/// Data of one alternative in an observation.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ObservedAlternative {
    pub id: AlternativeId,
    pub available: bool,
    pub chosen: bool,
    pub terms: Vec<ObservedTerm>,
}

impl ObservedAlternative {
    /// Returns `true` if the alternative has at least one size term.
    pub fn has_size_terms(&self) -> bool {
        self.terms.iter().any(|t| t.is_size)
    }

    /// Returns `true` if the alternative has at least one non-zero size term.
    pub fn has_non_zero_size(&self) -> bool {
        self.terms
            .iter()
            .any(|t| t.is_size && t.value.abs() >= ZERO_TOLERANCE)
    }
}

/// All the data of one decision instance.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Observation {
    /// Key of the decision instance.
    pub key: u64,
    /// Alternatives, by increasing id.
    pub alternatives: Vec<ObservedAlternative>,
}

impl Observation {
    /// Returns the reason why the observation cannot be used for estimation, if any.
    ///
    /// An observation is valid if exactly one alternative is chosen and, when this alternative
    /// uses size variables, at least one of its size terms is non-zero.
    pub fn rejection_reason(&self) -> Option<RejectionReason> {
        let mut chosen = self.alternatives.iter().filter(|a| a.chosen);
        let Some(alternative) = chosen.next() else {
            return Some(RejectionReason::NoChosenAlternative);
        };
        if chosen.next().is_some() {
            return Some(RejectionReason::MultipleChosenAlternatives);
        }
        if alternative.has_size_terms() && !alternative.has_non_zero_size() {
            return Some(RejectionReason::ChosenAlternativeWithoutSize);
        }
        None
    }

    /// Returns `true` if the model uses size variables.
    pub fn uses_size_variables(&self) -> bool {
        self.alternatives.iter().any(|a| a.has_size_terms())
    }
}

/// Reason why an observation is not written.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum RejectionReason {
    NoChosenAlternative,
    MultipleChosenAlternatives,
    ChosenAlternativeWithoutSize,
}

/// Result of writing an observation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum ObservationStatus {
    Accepted,
    Rejected(RejectionReason),
}

/// Target where the observations are written.
pub trait ObservationSink {
    /// Writes one observation.
    fn write(&mut self, observation: &Observation) -> Result<()>;

    /// Flushes the observations written so far.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

impl ObservationSink for Vec<Observation> {
    fn write(&mut self, observation: &Observation) -> Result<()> {
        self.push(observation.clone());
        Ok(())
    }
}

impl<S: ObservationSink + ?Sized> ObservationSink for Box<S> {
    fn write(&mut self, observation: &Observation) -> Result<()> {
        (**self).write(observation)
    }

    fn finish(&mut self) -> Result<()> {
        (**self).finish()
    }
}

/// Totals of one alternative over the accepted observations.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct AlternativeTotals {
    /// Number of observations where the alternative is chosen.
    pub chosen: u64,
    /// Number of observations where the alternative is available.
    pub available: u64,
}

/// Totals of one coefficient over the accepted observations.
#[derive(Copy, Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct CoefficientTotals {
    /// Sum of the values of the terms.
    pub total_value: f64,
    /// Number of terms with a non-zero value.
    pub non_zero: u64,
}

impl CoefficientTotals {
    /// Returns the mean of the non-zero values.
    pub fn mean_non_zero(&self) -> f64 {
        if self.non_zero == 0 {
            0.0
        } else {
            self.total_value / self.non_zero as f64
        }
    }
}

/// Summary of the observations of one estimated model.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct EstimationSummary {
    /// Number of observations written.
    pub accepted: u64,
    /// Number of observations rejected, by reason.
    pub rejected: BTreeMap<String, u64>,
    /// Totals by alternative id.
    pub alternatives: BTreeMap<AlternativeId, AlternativeTotals>,
    /// Totals by coefficient index (size terms excluded).
    pub coefficients: BTreeMap<usize, CoefficientTotals>,
}

impl EstimationSummary {
    /// Records an accepted observation.
    pub fn record(&mut self, observation: &Observation) {
        self.accepted += 1;
        let uses_size = observation.uses_size_variables();
        for alternative in &observation.alternatives {
            let totals = self.alternatives.entry(alternative.id).or_default();
            totals.chosen += u64::from(alternative.chosen);
            // With size variables, an alternative without size cannot be chosen.
            let available =
                alternative.available && (!uses_size || alternative.has_non_zero_size());
            totals.available += u64::from(available);
            for term in alternative.terms.iter().filter(|t| !t.is_size) {
                let totals = self.coefficients.entry(term.coefficient).or_default();
                totals.total_value += term.value;
                if term.value.abs() >= ZERO_TOLERANCE {
                    totals.non_zero += 1;
                }
            }
        }
    }

    /// Records a rejected observation.
    pub fn reject(&mut self, reason: RejectionReason) {
        *self.rejected.entry(format!("{reason:?}")).or_default() += 1;
    }

    /// Returns the total number of rejected observations.
    pub fn nb_rejected(&self) -> u64 {
        self.rejected.values().sum()
    }

    /// Adds the totals of another summary (e.g., from another batch).
    pub fn merge(&mut self, other: &EstimationSummary) {
        self.accepted += other.accepted;
        for (reason, count) in &other.rejected {
            *self.rejected.entry(reason.clone()).or_default() += count;
        }
        for (id, totals) in &other.alternatives {
            let entry = self.alternatives.entry(*id).or_default();
            entry.chosen += totals.chosen;
            entry.available += totals.available;
        }
        for (index, totals) in &other.coefficients {
            let entry = self.coefficients.entry(*index).or_default();
            entry.total_value += totals.total_value;
            entry.non_zero += totals.non_zero;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alternative(id: AlternativeId, chosen: bool, size: Option<f64>) -> ObservedAlternative {
        let mut terms = vec![ObservedTerm {
            source: TermSource::Direct,
            coefficient: 1,
            value: id as f64,
            is_size: false,
        }];
        if let Some(value) = size {
            terms.push(ObservedTerm {
                source: TermSource::SizeComponent(0),
                coefficient: 5,
                value,
                is_size: true,
            });
        }
        ObservedAlternative {
            id,
            available: true,
            chosen,
            terms,
        }
    }

    #[test]
    fn observation_validity_test() {
        let obs = Observation {
            key: 1,
            alternatives: vec![alternative(1, false, None), alternative(2, true, None)],
        };
        assert_eq!(obs.rejection_reason(), None);
        let obs = Observation {
            key: 1,
            alternatives: vec![alternative(1, false, None), alternative(2, false, None)],
        };
        assert_eq!(
            obs.rejection_reason(),
            Some(RejectionReason::NoChosenAlternative)
        );
        let obs = Observation {
            key: 1,
            alternatives: vec![alternative(1, true, None), alternative(2, true, None)],
        };
        assert_eq!(
            obs.rejection_reason(),
            Some(RejectionReason::MultipleChosenAlternatives)
        );
        let obs = Observation {
            key: 1,
            alternatives: vec![alternative(1, true, Some(0.0)), alternative(2, false, Some(3.0))],
        };
        assert_eq!(
            obs.rejection_reason(),
            Some(RejectionReason::ChosenAlternativeWithoutSize)
        );
    }

    #[test]
    fn summary_test() {
        let obs = Observation {
            key: 1,
            alternatives: vec![alternative(1, true, Some(2.0)), alternative(2, false, Some(0.0))],
        };
        let mut summary = EstimationSummary::default();
        summary.record(&obs);
        summary.reject(RejectionReason::NoChosenAlternative);
        let mut other = EstimationSummary::default();
        other.record(&obs);
        summary.merge(&other);
        assert_eq!(summary.accepted, 2);
        assert_eq!(summary.nb_rejected(), 1);
        assert_eq!(
            summary.alternatives[&1],
            AlternativeTotals {
                chosen: 2,
                available: 2
            }
        );
        // Alternative 2 has no size: it is not counted as available.
        assert_eq!(summary.alternatives[&2].available, 0);
        let totals = summary.coefficients[&1];
        assert_eq!(totals.non_zero, 4);
        assert_eq!(totals.mean_non_zero(), 1.5);
        // Size terms are not summarized.
        assert!(!summary.coefficients.contains_key(&5));
    }
}
