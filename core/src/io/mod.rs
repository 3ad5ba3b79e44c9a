// Copyright 2022 Lucas Javaudin
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// https://creativecommons.org/licenses/by-nc-nd/4.0/legalcode

//! Everything related to import / export of run data.
pub mod json;

use std::path::Path;

use anyhow::{Context, Result};
use log::info;

use crate::parameters::Parameters;
use crate::record::DecisionRecord;

/// Reads the [Parameters] of a run from a JSON file.
pub fn read_parameters(path: &Path) -> Result<Parameters> {
    json::read_json(path).context("Failed to read parameters")
}

/// Reads the decision records of a run.
pub fn read_decisions(path: &Path) -> Result<Vec<DecisionRecord>> {
    info!("Reading decision records from `{path:?}`");
    json::read_json(path).context("Failed to read decision records")
}
