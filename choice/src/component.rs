// Copyright 2022 Lucas Javaudin
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// https://creativecommons.org/licenses/by-nc-nd/4.0/legalcode

//! Utility terms and reusable components.
use crate::coefficients::{CoefficientKind, CoefficientStore};
use crate::ChoiceError;

/// One `coefficient * value` contribution to the utility (or to the size) of an alternative.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct UtilityTerm {
    /// Index of the coefficient.
    pub coefficient: usize,
    /// Raw value of the attribute.
    pub value: f64,
}

impl UtilityTerm {
    pub fn new(coefficient: usize, value: f64) -> Self {
        UtilityTerm { coefficient, value }
    }
}

/// Utility and size accumulated from a list of terms.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub(crate) struct Contribution {
    pub utility: f64,
    pub size: f64,
    pub has_size_terms: bool,
}

impl Contribution {
    /// Sums the contribution of the terms, routing each term according to the role of its
    /// coefficient.
    pub fn from_terms(terms: &[UtilityTerm], coefficients: &CoefficientStore) -> Self {
        let mut contribution = Contribution::default();
        for term in terms {
            contribution.add(term, coefficients);
        }
        contribution
    }

    fn add(&mut self, term: &UtilityTerm, coefficients: &CoefficientStore) {
        // Terms are validated when added so the coefficient always exists.
        let Some(coefficient) = coefficients.get(term.coefficient) else {
            return;
        };
        match coefficient.kind {
            CoefficientKind::BaseSizeVariable => {
                self.size += term.value;
                self.has_size_terms = true;
            }
            CoefficientKind::SizeVariable => {
                self.size += term.value * coefficient.value.exp();
                self.has_size_terms = true;
            }
            CoefficientKind::SizeFunctionMultiplier => (),
            CoefficientKind::Regular | CoefficientKind::Nest => {
                self.utility += coefficient.value * term.value;
            }
        }
    }

    pub fn merge(&mut self, other: &Contribution) {
        self.utility += other.utility;
        self.size += other.size;
        self.has_size_terms |= other.has_size_terms;
    }
}

/// A bundle of terms computed once per decision instance and shared by several alternatives.
#[derive(Clone, Debug, Default)]
pub struct Component {
    key: usize,
    terms: Vec<UtilityTerm>,
}

impl Component {
    pub(crate) fn new(key: usize) -> Self {
        Component {
            key,
            terms: Vec::new(),
        }
    }

    /// Returns the key the component was created with.
    pub fn key(&self) -> usize {
        self.key
    }

    /// Returns the terms of the component.
    pub fn terms(&self) -> &[UtilityTerm] {
        &self.terms
    }

    pub(crate) fn clear(&mut self) {
        self.terms.clear();
    }

    pub(crate) fn push(
        &mut self,
        term: UtilityTerm,
        coefficients: &CoefficientStore,
    ) -> Result<(), ChoiceError> {
        coefficients.check(term.coefficient)?;
        if !term.value.is_finite() {
            return Err(ChoiceError::NonFiniteComponentValue {
                key: self.key,
                coefficient: term.coefficient,
                value: term.value,
            });
        }
        self.terms.push(term);
        Ok(())
    }
}

/// Handle to a utility component, returned when the component is created.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ComponentHandle {
    pub(crate) slot: usize,
    pub(crate) instance: u64,
}

/// Handle to a size component, returned when the component is created.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SizeComponentHandle {
    pub(crate) slot: usize,
    pub(crate) instance: u64,
}
