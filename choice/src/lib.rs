// Copyright 2022 Lucas Javaudin
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// https://creativecommons.org/licenses/by-nc-nd/4.0/legalcode

//! Discrete choice probability engine.
//!
//! A [ChoiceProbabilityCalculator] receives, for one decision instance at a time, a set of
//! alternatives with their utility terms, shared utility and size components and an optional
//! nesting structure. It computes the nested logit probabilities and then either draws a simulated
//! choice from a per-entity [RandomStream] or writes an [Observation] for estimation.
//!
//! The [AlternativeSampler] draws weighted samples of alternatives from large universes, with the
//! corrections that keep the choice probabilities consistent.
mod alternative;
mod calculator;
mod coefficients;
mod component;
mod error;
pub mod logit;
mod nest;
mod observation;
mod random;
pub mod sampling;

pub use self::alternative::{Alternative, AlternativeHandle, AlternativeId};
pub use self::calculator::{
    CalculatorStats, ChoiceOutcome, ChoiceProbabilityCalculator, ChosenAlternative, Probabilities,
};
pub use self::coefficients::{Coefficient, CoefficientKind, CoefficientStore, EPSILON};
pub use self::component::{Component, ComponentHandle, SizeComponentHandle, UtilityTerm};
pub use self::error::ChoiceError;
pub use self::nest::{NestHandle, NestNode, NodeRef};
pub use self::observation::{
    AlternativeTotals, CoefficientTotals, EstimationSummary, Observation, ObservationSink,
    ObservationStatus, ObservedAlternative, ObservedTerm, RejectionReason, TermSource,
};
pub use self::random::{salt_from_name, RandomStream, RandomUtility, SeedKey};
pub use self::sampling::{
    AlternativeSampler, Candidate, SampleItem, SampleRequest, StopCandidate, StopSampleRequest,
};
