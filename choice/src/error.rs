// Copyright 2022 Lucas Javaudin
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// https://creativecommons.org/licenses/by-nc-nd/4.0/legalcode

//! Errors raised by the choice engine.
//!
//! Every variant is a defect in the way a model declares its decision instance: the engine never
//! replaces an invalid input by a default value.
use thiserror::Error;

use crate::AlternativeId;

/// Invalid use of the choice engine.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum ChoiceError {
    /// A term value of an alternative is NaN or infinite.
    #[error("Non-finite value {value} for coefficient {coefficient} of alternative {alternative}")]
    NonFiniteValue {
        alternative: AlternativeId,
        coefficient: usize,
        value: f64,
    },
    /// A term value of a component is NaN or infinite.
    #[error("Non-finite value {value} for coefficient {coefficient} of component {key}")]
    NonFiniteComponentValue {
        key: usize,
        coefficient: usize,
        value: f64,
    },
    /// The total utility of an alternative is NaN or infinite.
    #[error("Non-finite utility {value} for alternative {alternative}")]
    NonFiniteUtility { alternative: AlternativeId, value: f64 },
    /// A term references a coefficient outside of the index space of the coefficient file.
    #[error("Coefficient {coefficient} is not defined (`{title}` has {len} indices)")]
    UnknownCoefficient {
        coefficient: usize,
        title: String,
        len: usize,
    },
    /// A handle does not refer to an alternative of the current decision instance.
    #[error("Alternative handle {0:?} does not belong to the current decision instance")]
    UnknownAlternative(usize),
    /// A component is used before it was created in the current decision instance.
    #[error("Component {key} was not created in the current decision instance")]
    UnregisteredComponent { key: usize },
    /// A size component is used before it was created in the current decision instance.
    #[error("Size component {key} was not created in the current decision instance")]
    UnregisteredSizeComponent { key: usize },
    /// A nest handle does not refer to a nest of the current decision instance.
    #[error("Nest handle {0} does not belong to the current decision instance")]
    UnknownNest(usize),
    /// Linking a nest under one of its descendants.
    #[error("Attaching nest {child} under nest {parent} would create a cycle")]
    NestCycle { child: usize, parent: usize },
    /// A nest is reused with another theta coefficient.
    #[error("Nest {nest} uses theta coefficient {previous}, not coefficient {given}")]
    NestThetaMismatch {
        nest: usize,
        previous: usize,
        given: usize,
    },
    /// A node is attached to two different parents.
    #[error("{node} is already attached to nest {previous}, cannot attach it to nest {given}")]
    NestParentConflict {
        node: String,
        previous: usize,
        given: usize,
    },
    /// The theta of a nest is not a positive finite number.
    #[error("Invalid theta {value} (coefficient {coefficient}) for nest {nest}")]
    InvalidTheta {
        nest: usize,
        coefficient: usize,
        value: f64,
    },
    /// An observation is written by a calculator running in application mode.
    #[error("Observations can only be written in estimation mode (model `{0}`)")]
    NotInEstimationMode(String),
    /// A sampling weight is negative or not finite.
    #[error("Invalid sampling weight {weight} for entity {entity}")]
    InvalidWeight { entity: u64, weight: f64 },
    /// An entity to force in the sample is not part of the universe.
    #[error("Entity {0} is not part of the sampling universe")]
    UnknownEntity(u64),
    /// A sample size of zero was requested.
    #[error("The sample size must be positive")]
    InvalidSampleSize,
}
