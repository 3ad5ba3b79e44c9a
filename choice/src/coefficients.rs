// Copyright 2022 Lucas Javaudin
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// https://creativecommons.org/licenses/by-nc-nd/4.0/legalcode

//! Coefficients of a choice model, read from a coefficient file.
//!
//! A coefficient file starts with free text lines, the first one being the title of the model,
//! terminated by a line `END`. Then, each line defines one coefficient with four
//! whitespace-separated fields `index label constraint value`, until a line `-1`.
//!
//! ```text
//! Work location model
//! END
//!    1  adjustment   T   1.0
//!    2  distance     F  -0.35
//!    5  Gamm_empl    T   0.0
//!    6  LSM_size     T   1.0
//! -1
//! ```
//!
//! The role of a coefficient is given by the prefix of its label:
//!
//! - `Gamm`: size variable, its term contributes to the size of the alternative instead of its
//!   utility;
//! - `LSM_`: multiplier of the log of the size;
//! - `Nest`: structural parameter of a nest.
//!
//! The first constrained size variable with a value of zero is the base size variable (its terms
//! enter the size with a weight of one).
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use hashbrown::HashMap;

use crate::ChoiceError;

/// Two values closer than this are considered equal.
pub const EPSILON: f64 = 1e-40;

/// Largest index accepted for a coefficient (indices are stored densely).
pub const MAX_COEFFICIENT_INDEX: usize = 1_000_000;

/// Role of a coefficient in the utility function.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum CoefficientKind {
    /// Standard coefficient multiplying an attribute.
    #[default]
    Regular,
    /// Size variable: the term adds `value * exp(coefficient)` to the size.
    SizeVariable,
    /// Base size variable: the term adds `value` to the size.
    BaseSizeVariable,
    /// Multiplier of `ln(size)` in the utility.
    SizeFunctionMultiplier,
    /// Structural parameter of a nest.
    Nest,
}

impl CoefficientKind {
    fn from_label(label: &str) -> Self {
        if label.starts_with("Gamm") {
            Self::SizeVariable
        } else if label.starts_with("LSM_") {
            Self::SizeFunctionMultiplier
        } else if label.starts_with("Nest") {
            Self::Nest
        } else {
            Self::Regular
        }
    }

    /// Returns `true` if terms with this coefficient contribute to the size of an alternative.
    pub fn is_size(self) -> bool {
        matches!(self, Self::SizeVariable | Self::BaseSizeVariable)
    }
}

/// A coefficient of a choice model.
#[derive(Clone, Debug, PartialEq)]
pub struct Coefficient {
    /// Index of the coefficient, referenced by the utility terms.
    pub index: usize,
    /// Label of the coefficient.
    pub label: String,
    /// Value of the coefficient.
    pub value: f64,
    /// `true` if the coefficient is fixed during estimation.
    pub is_constrained: bool,
    /// Role of the coefficient.
    pub kind: CoefficientKind,
}

impl Coefficient {
    /// Creates a new [Coefficient], deducing its role from its label.
    pub fn new(index: usize, label: impl Into<String>, value: f64, is_constrained: bool) -> Self {
        let label = label.into();
        let kind = CoefficientKind::from_label(&label);
        Coefficient {
            index,
            label,
            value,
            is_constrained,
            kind,
        }
    }
}

/// Read-only set of coefficients of one choice model, indexed by coefficient index.
///
/// Indices are sparse: an index lower than [CoefficientStore::len] which is not defined in the
/// file has a value of zero.
#[derive(Clone, Debug, Default)]
pub struct CoefficientStore {
    title: String,
    coefficients: Vec<Option<Coefficient>>,
    size_function_multiplier: Option<usize>,
    nest_coefficient: Option<usize>,
}

impl CoefficientStore {
    /// Reads a [CoefficientStore] from a coefficient file.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Unable to open coefficient file `{path:?}`"))?;
        Self::from_reader(BufReader::new(file))
            .with_context(|| format!("Invalid coefficient file `{path:?}`"))
    }

    /// Reads a [CoefficientStore] from any buffered reader with the coefficient file format.
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self> {
        let mut lines = reader.lines().enumerate();
        let mut title = None;
        let mut found_end = false;
        for (_, line) in lines.by_ref() {
            let line = line?;
            if line.trim() == "END" {
                found_end = true;
                break;
            }
            if title.is_none() && !line.trim().is_empty() {
                title = Some(line.trim().to_owned());
            }
        }
        if !found_end {
            bail!("Missing `END` line after the title");
        }
        let mut coefficients = Vec::new();
        for (i, line) in lines {
            let line = line?;
            let line_nb = i + 1;
            if line.trim() == "-1" {
                break;
            }
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.is_empty() {
                continue;
            }
            if tokens.len() < 4 {
                bail!("Line {line_nb}: expected `index label constraint value`, got `{line}`");
            }
            let index: usize = tokens[0]
                .parse()
                .with_context(|| format!("Line {line_nb}: invalid index `{}`", tokens[0]))?;
            if index > MAX_COEFFICIENT_INDEX {
                bail!("Line {line_nb}: index {index} is larger than {MAX_COEFFICIENT_INDEX}");
            }
            let value: f64 = tokens[3]
                .parse()
                .with_context(|| format!("Line {line_nb}: invalid value `{}`", tokens[3]))?;
            if !value.is_finite() {
                bail!("Line {line_nb}: the value of coefficient {index} is not finite");
            }
            let is_constrained = matches!(tokens[2].to_lowercase().as_str(), "t" | "c");
            coefficients.push(Coefficient::new(index, tokens[1], value, is_constrained));
        }
        Self::new(title.unwrap_or_default(), coefficients)
    }

    /// Creates a [CoefficientStore] from a title and a list of coefficients.
    ///
    /// Returns an error if two coefficients share the same index.
    pub fn new(title: impl Into<String>, coefficients: Vec<Coefficient>) -> Result<Self> {
        if let Some(c) = coefficients.iter().find(|c| c.index > MAX_COEFFICIENT_INDEX) {
            bail!(
                "Coefficient `{}` has index {}, larger than {MAX_COEFFICIENT_INDEX}",
                c.label,
                c.index
            );
        }
        let len = coefficients.iter().map(|c| c.index + 1).max().unwrap_or(0);
        let mut store = CoefficientStore {
            title: title.into(),
            coefficients: vec![None; len],
            size_function_multiplier: None,
            nest_coefficient: None,
        };
        let mut labels: HashMap<usize, String> = HashMap::with_capacity(coefficients.len());
        let mut base_found = false;
        for mut coefficient in coefficients {
            if let Some(label) = labels.insert(coefficient.index, coefficient.label.clone()) {
                return Err(anyhow!(
                    "Coefficient index {} is used by both `{}` and `{}`",
                    coefficient.index,
                    label,
                    coefficient.label
                ));
            }
            match coefficient.kind {
                CoefficientKind::SizeFunctionMultiplier => {
                    store.size_function_multiplier = Some(coefficient.index);
                }
                CoefficientKind::Nest => store.nest_coefficient = Some(coefficient.index),
                CoefficientKind::SizeVariable
                    if !base_found
                        && coefficient.is_constrained
                        && coefficient.value.abs() < EPSILON =>
                {
                    base_found = true;
                    coefficient.kind = CoefficientKind::BaseSizeVariable;
                }
                _ => (),
            }
            let index = coefficient.index;
            store.coefficients[index] = Some(coefficient);
        }
        Ok(store)
    }

    /// Returns the title of the model.
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Returns the size of the index space (largest index plus one).
    pub fn len(&self) -> usize {
        self.coefficients.len()
    }

    /// Returns `true` if the store has no coefficient.
    pub fn is_empty(&self) -> bool {
        self.coefficients.is_empty()
    }

    /// Returns the coefficient with the given index, if it is defined.
    pub fn get(&self, index: usize) -> Option<&Coefficient> {
        self.coefficients.get(index).and_then(|c| c.as_ref())
    }

    /// Returns the value of the coefficient with the given index.
    ///
    /// Undefined indices lower than [CoefficientStore::len] have a value of zero.
    pub fn value(&self, index: usize) -> Result<f64, ChoiceError> {
        self.check(index)?;
        Ok(self.get(index).map_or(0.0, |c| c.value))
    }

    /// Returns the role of the coefficient with the given index.
    pub fn kind(&self, index: usize) -> Result<CoefficientKind, ChoiceError> {
        self.check(index)?;
        Ok(self.get(index).map(|c| c.kind).unwrap_or_default())
    }

    /// Returns an error if the index is outside of the index space.
    pub fn check(&self, index: usize) -> Result<(), ChoiceError> {
        if index < self.coefficients.len() {
            Ok(())
        } else {
            Err(ChoiceError::UnknownCoefficient {
                coefficient: index,
                title: self.title.clone(),
                len: self.coefficients.len(),
            })
        }
    }

    /// Returns the size-function multiplier coefficient, if any.
    pub fn size_function_multiplier(&self) -> Option<&Coefficient> {
        self.size_function_multiplier.and_then(|i| self.get(i))
    }

    /// Returns the value multiplying `ln(size)` in the utility (1.0 when the model has no
    /// size-function multiplier).
    pub fn size_multiplier_value(&self) -> f64 {
        self.size_function_multiplier().map_or(1.0, |c| c.value)
    }

    /// Returns the last nest coefficient of the file, if any.
    pub fn nest_coefficient(&self) -> Option<&Coefficient> {
        self.nest_coefficient.and_then(|i| self.get(i))
    }

    /// Iterates over the defined coefficients, by increasing index.
    pub fn iter(&self) -> impl Iterator<Item = &Coefficient> {
        self.coefficients.iter().flatten()
    }
}
