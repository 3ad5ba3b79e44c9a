// Copyright 2022 Lucas Javaudin
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// https://creativecommons.org/licenses/by-nc-nd/4.0/legalcode

//! Registry of the choice models of a run.
use anyhow::{bail, Result};
use choice::{ChoiceProbabilityCalculator, RandomStream};

/// Function declaring the decision instance of a model for one decision input.
///
/// The function receives a calculator that was already reset for the decision, the input and
/// the random stream of the decision (e.g., to sample alternatives).
pub type UtilityBuilder<D, P> = Box<
    dyn Fn(&mut ChoiceProbabilityCalculator<P>, &D, &mut RandomStream) -> Result<()> + Send + Sync,
>;

/// Description of a registered model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelMetadata {
    /// Name of the model, matching the name in the parameters.
    pub name: String,
    /// Short description of the choice, used in the logs.
    pub description: String,
}

impl ModelMetadata {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        ModelMetadata {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// Ordered set of models, each with the function building its decision instances.
///
/// Models are run in registration order for each decision input.
pub struct ModelRegistry<D, P> {
    models: Vec<(ModelMetadata, UtilityBuilder<D, P>)>,
}

impl<D, P> Default for ModelRegistry<D, P> {
    fn default() -> Self {
        ModelRegistry { models: Vec::new() }
    }
}

impl<D, P> std::fmt::Debug for ModelRegistry<D, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.models.iter().map(|(metadata, _)| metadata))
            .finish()
    }
}

impl<D, P> ModelRegistry<D, P> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a model and returns its index.
    ///
    /// Returns an error if a model with the same name is already registered.
    pub fn register<F>(&mut self, metadata: ModelMetadata, builder: F) -> Result<usize>
    where
        F: Fn(&mut ChoiceProbabilityCalculator<P>, &D, &mut RandomStream) -> Result<()>
            + Send
            + Sync
            + 'static,
    {
        if self.index_of(&metadata.name).is_some() {
            bail!("Model `{}` is registered twice", metadata.name);
        }
        self.models.push((metadata, Box::new(builder)));
        Ok(self.models.len() - 1)
    }

    /// Returns the number of registered models.
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Returns `true` if no model is registered.
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Returns the index of the model with the given name.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.models.iter().position(|(m, _)| m.name == name)
    }

    /// Returns the metadata of the model with the given index.
    pub fn metadata(&self, index: usize) -> &ModelMetadata {
        &self.models[index].0
    }

    /// Returns the builder of the model with the given index.
    pub fn builder(&self, index: usize) -> &UtilityBuilder<D, P> {
        &self.models[index].1
    }

    /// Iterates over the metadata of the registered models.
    pub fn iter(&self) -> impl Iterator<Item = &ModelMetadata> {
        self.models.iter().map(|(m, _)| m)
    }
}
