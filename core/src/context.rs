// Copyright 2022 Lucas Javaudin
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// https://creativecommons.org/licenses/by-nc-nd/4.0/legalcode

//! Read-only data shared by all the batches of a run.
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use choice::CoefficientStore;
use log::info;

use crate::parameters::Parameters;

/// A model of the run, with its coefficients.
#[derive(Clone, Debug)]
pub struct LoadedModel {
    /// Name of the model.
    pub name: String,
    /// Salt of the random streams of the model.
    pub salt: u64,
    /// `true` if the model writes estimation observations.
    pub is_estimated: bool,
    /// Coefficients of the model.
    pub coefficients: Arc<CoefficientStore>,
}

/// Parameters and coefficient stores of a run.
///
/// The context is built once at startup and passed by reference to everything that runs the
/// models.
#[derive(Clone, Debug)]
pub struct RunContext {
    parameters: Parameters,
    models: Vec<LoadedModel>,
}

impl RunContext {
    /// Checks the parameters and reads the coefficient file of each model.
    pub fn new(parameters: Parameters) -> Result<Self> {
        parameters.check_validity()?;
        let stores = parameters
            .models
            .iter()
            .map(|model| {
                info!(
                    "Reading coefficients of model `{}` from `{:?}`",
                    model.name, model.coefficients
                );
                CoefficientStore::load(&model.coefficients).with_context(|| {
                    format!("Failed to read the coefficients of model `{}`", model.name)
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Self::from_parts(parameters, stores)
    }

    /// Creates a context from parameters and already loaded coefficient stores, given in the
    /// same order as the models of the parameters.
    pub fn from_parts(parameters: Parameters, stores: Vec<CoefficientStore>) -> Result<Self> {
        parameters.check_validity()?;
        if stores.len() != parameters.models.len() {
            bail!(
                "Got {} coefficient stores for {} models",
                stores.len(),
                parameters.models.len()
            );
        }
        let models = parameters
            .models
            .iter()
            .zip(stores)
            .map(|(model, store)| LoadedModel {
                name: model.name.clone(),
                salt: model.salt(),
                is_estimated: parameters.is_estimated(&model.name),
                coefficients: Arc::new(store),
            })
            .collect();
        Ok(RunContext { parameters, models })
    }

    /// Returns the parameters of the run.
    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    /// Returns the models of the run.
    pub fn models(&self) -> &[LoadedModel] {
        &self.models
    }

    /// Returns the model with the given name.
    pub fn model(&self, name: &str) -> Result<&LoadedModel> {
        self.models
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| anyhow!("Model `{name}` is not specified in the parameters"))
    }
}
