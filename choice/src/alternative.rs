// Copyright 2022 Lucas Javaudin
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// https://creativecommons.org/licenses/by-nc-nd/4.0/legalcode

//! Alternatives of a decision instance.
use crate::component::UtilityTerm;

/// Identifier of an alternative (or of a sampled entity).
pub type AlternativeId = u64;

/// Handle to an alternative of the current decision instance.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct AlternativeHandle {
    pub(crate) index: usize,
    pub(crate) instance: u64,
}

/// One leaf of the choice set.
#[derive(Clone, Debug)]
pub struct Alternative<P> {
    pub(crate) id: AlternativeId,
    pub(crate) available: bool,
    pub(crate) chosen: bool,
    pub(crate) payload: Option<P>,
    pub(crate) terms: Vec<UtilityTerm>,
    pub(crate) components: Vec<usize>,
    pub(crate) size_components: Vec<usize>,
    pub(crate) nest: Option<usize>,
}

impl<P> Alternative<P> {
    pub(crate) fn new(id: AlternativeId, available: bool, chosen: bool) -> Self {
        Alternative {
            id,
            available,
            chosen,
            payload: None,
            terms: Vec::new(),
            components: Vec::new(),
            size_components: Vec::new(),
            nest: None,
        }
    }

    /// Returns the identifier of the alternative.
    pub fn id(&self) -> AlternativeId {
        self.id
    }

    /// Returns `true` if the alternative can be chosen.
    pub fn is_available(&self) -> bool {
        self.available
    }

    /// Returns `true` if the alternative is the observed choice (estimation mode).
    pub fn is_chosen(&self) -> bool {
        self.chosen
    }

    /// Returns the payload identifying what the alternative represents.
    pub fn payload(&self) -> Option<&P> {
        self.payload.as_ref()
    }

    /// Returns the terms directly attached to the alternative.
    pub fn terms(&self) -> &[UtilityTerm] {
        &self.terms
    }
}
