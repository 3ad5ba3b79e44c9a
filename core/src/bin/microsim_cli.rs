// Copyright 2022 Lucas Javaudin
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// https://creativecommons.org/licenses/by-nc-nd/4.0/legalcode

//! Binary to run the choice models of a microsimulation from a set of input files.
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

/// Activity-based microsimulation: simulated choices and estimation observations.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path to the JSON file with the parameters
    #[arg(required = true)]
    parameters: PathBuf,
}

fn main() -> Result<()> {
    let args = Args::parse();
    microsim_core::run(&args.parameters)
}
