// Copyright 2022 Lucas Javaudin
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// https://creativecommons.org/licenses/by-nc-nd/4.0/legalcode

//! Parameters of a run.
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use choice::salt_from_name;
use hashbrown::HashSet;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

const fn default_sample_size() -> usize {
    30
}

/// What the run produces.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum RunMode {
    /// Simulate the choices of all the decision inputs.
    #[default]
    Application,
    /// Write the estimation observations of one model.
    Estimation,
}

/// Input files of a run.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct InputFiles {
    /// Path to the JSON file (optionally zstd-compressed) with the decision records.
    #[serde(default)]
    pub decisions: Option<PathBuf>,
}

/// Parameters of one choice model.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct ModelParameters {
    /// Name of the model.
    pub name: String,
    /// Path to the coefficient file of the model.
    pub coefficients: PathBuf,
    /// Salt of the random streams of the model.
    ///
    /// If not specified, the salt is derived from the name of the model.
    #[serde(default)]
    pub salt: Option<u64>,
}

impl ModelParameters {
    /// Returns the salt of the random streams of the model.
    pub fn salt(&self) -> u64 {
        self.salt.unwrap_or_else(|| salt_from_name(&self.name))
    }
}

/// Set of parameters used to control how a run behaves.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[schemars(title = "Parameters")]
#[schemars(description = "Set of parameters used to control how a run behaves.")]
pub struct Parameters {
    /// Paths to the input files.
    #[serde(default)]
    pub input_files: InputFiles,
    /// Directory where the output files are stored.
    pub output_directory: PathBuf,
    /// Application (simulated choices) or estimation (observations) run.
    #[serde(default)]
    pub mode: RunMode,
    /// Name of the model whose observations are written, in estimation mode.
    #[serde(default)]
    pub estimated_model: Option<String>,
    /// Number of alternatives drawn by the models with sampled choice sets.
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
    /// Number of threads (and batches) used to run the models.
    ///
    /// If `0`, all the available threads are used.
    #[serde(default)]
    pub nb_threads: usize,
    /// Global random seed of the run.
    #[serde(default)]
    pub random_seed: u64,
    /// If `true`, a decision without any available alternative aborts the run.
    ///
    /// Otherwise, a warning is logged and the decision is skipped.
    #[serde(default)]
    pub strict_availability: bool,
    /// If `true`, the log file also records the simulated choice of each decision (trace level).
    #[serde(default)]
    pub trace_choices: bool,
    /// Choice models of the run.
    pub models: Vec<ModelParameters>,
}

impl Parameters {
    /// Creates application parameters for the given models, with default values for all other
    /// parameters.
    pub fn new(output_directory: impl Into<PathBuf>, models: Vec<ModelParameters>) -> Self {
        Parameters {
            input_files: InputFiles::default(),
            output_directory: output_directory.into(),
            mode: RunMode::Application,
            estimated_model: None,
            sample_size: default_sample_size(),
            nb_threads: 0,
            random_seed: 0,
            strict_availability: false,
            trace_choices: false,
            models,
        }
    }

    /// Returns an error if the parameters are not consistent.
    pub fn check_validity(&self) -> Result<()> {
        if self.models.is_empty() {
            bail!("At least one model must be specified");
        }
        let mut names = HashSet::with_capacity(self.models.len());
        for model in &self.models {
            if !names.insert(model.name.as_str()) {
                bail!("Model `{}` is specified more than once", model.name);
            }
        }
        if self.sample_size == 0 {
            bail!("The sample size must be positive");
        }
        match (self.mode, self.estimated_model.as_deref()) {
            (RunMode::Estimation, None) => {
                bail!("The estimated model must be specified in estimation mode")
            }
            (RunMode::Estimation, Some(name)) if self.model(name).is_none() => {
                bail!("The estimated model `{name}` is not one of the models")
            }
            _ => Ok(()),
        }
    }

    /// Returns `true` if the run writes estimation observations.
    pub fn is_estimation(&self) -> bool {
        self.mode == RunMode::Estimation
    }

    /// Returns `true` if the model with the given name is the estimated model of an estimation
    /// run.
    pub fn is_estimated(&self, model: &str) -> bool {
        self.is_estimation() && self.estimated_model.as_deref() == Some(model)
    }

    /// Returns the parameters of the model with the given name.
    pub fn model(&self, name: &str) -> Option<&ModelParameters> {
        self.models.iter().find(|m| m.name == name)
    }

    /// Returns the number of threads to use.
    pub fn nb_threads(&self) -> usize {
        if self.nb_threads == 0 {
            std::thread::available_parallelism().map_or(1, |n| n.get())
        } else {
            self.nb_threads
        }
    }

    /// Returns the output directory.
    pub fn output_directory(&self) -> &Path {
        &self.output_directory
    }
}
