// Copyright 2022 Lucas Javaudin
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// https://creativecommons.org/licenses/by-nc-nd/4.0/legalcode

//! Everything related to logging.
use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use log::LevelFilter;
use simplelog::{
    ColorChoice, CombinedLogger, Config, ConfigBuilder, SharedLogger, TermLogger, TerminalMode,
    WriteLogger,
};

/// Initializes logging to a file and terminal.
///
/// The file `log.txt` of the output directory receives the debug-level logs; the choices of each
/// decision are logged at trace level with the `trace` argument.
pub fn initialize_logging<W: std::io::Write + Send + 'static>(
    output: &Path,
    maybe_writer: Option<W>,
    trace: bool,
) -> Result<()> {
    let log_filename = output.join("log.txt");
    let log_file = File::create(&log_filename)
        .with_context(|| format!("Failed to create log file `{log_filename:?}`"))?;
    let file_level = if trace {
        LevelFilter::Trace
    } else {
        LevelFilter::Debug
    };
    // Only the logs of the workspace crates go to the file.
    let file_config = ConfigBuilder::new()
        .add_filter_allow_str("choice")
        .add_filter_allow_str("microsim_core")
        .build();
    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![
        TermLogger::new(
            LevelFilter::Info,
            Config::default(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ),
        WriteLogger::new(file_level, file_config, log_file),
    ];
    if let Some(writer) = maybe_writer {
        loggers.push(WriteLogger::new(
            LevelFilter::Info,
            Config::default(),
            writer,
        ));
    }
    CombinedLogger::init(loggers).context("Failed to initialize logging")
}
