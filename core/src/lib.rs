// Copyright 2022 Lucas Javaudin
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// https://creativecommons.org/licenses/by-nc-nd/4.0/legalcode

//! Run layer of the activity-based microsimulation.
//!
//! The choice models of a run are evaluated by the engine of the `choice` crate. This crate
//! loads their parameters and coefficients, splits the decision inputs into batches run in
//! parallel, and writes the simulated choices or the estimation observations.

pub mod context;
pub mod io;
pub mod logging;
pub mod model;
pub mod observation;
pub mod parallel;
pub mod parameters;
pub mod progress_bar;
pub mod record;
pub mod simulation;

use std::env;
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::info;

use crate::context::RunContext;
use crate::progress_bar::Spinner;
use crate::simulation::DecisionRunner;

// Dependencies only used in the bins.
use clap as _;

/// Reads the parameters and the decision records, runs the models and stores the results to the
/// output directory.
///
/// This function takes as argument the path to the `parameters.json` file.
pub fn run(path: &Path) -> Result<()> {
    run_imp(path, None::<std::io::Empty>)
}

/// Reads the parameters and the decision records, runs the models and stores the results to the
/// output directory.
///
/// This function takes as argument the path to the `parameters.json` file and a writer for the
/// logs.
pub fn run_with_writer<W: std::io::Write + Send + 'static>(path: &Path, writer: W) -> Result<()> {
    run_imp(path, Some(writer))
}

fn run_imp<W: std::io::Write + Send + 'static>(path: &Path, writer: Option<W>) -> Result<()> {
    // Read parameters.
    let parameters = io::read_parameters(path)?;

    // Set the working directory to the directory of the `parameters.json` file so that the input
    // paths can be interpreted as being relative to this file.
    if let Some(parent_dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        env::set_current_dir(parent_dir)
            .with_context(|| format!("Failed to set working directory to `{parent_dir:?}`"))?;
    }

    // Create output directory if it does not exists yet.
    std::fs::create_dir_all(&parameters.output_directory).with_context(|| {
        format!(
            "Failed to create output directory `{:?}`",
            parameters.output_directory
        )
    })?;

    logging::initialize_logging(&parameters.output_directory, writer, parameters.trace_choices)?;

    let Some(decisions_path) = parameters.input_files.decisions.clone() else {
        bail!("No decision file specified in the input files");
    };
    let context = RunContext::new(parameters)?;

    let mut spinner = Spinner::new("Reading decision records");
    let records = io::read_decisions(&decisions_path)?;
    spinner.finish();
    info!("Read {} decision records", records.len());

    let registry = record::record_registry(context.parameters())?;
    let runner = DecisionRunner::new(&context, &registry)?;
    let results = runner.run(&records)?;
    results.save(context.parameters().output_directory())?;
    info!("Done");
    Ok(())
}
