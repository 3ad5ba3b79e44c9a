// Copyright 2022 Lucas Javaudin
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// https://creativecommons.org/licenses/by-nc-nd/4.0/legalcode

//! Writers for the estimation observations.
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use choice::{EstimationSummary, Observation, ObservationSink, TermSource};
use serde::Serialize;

use crate::io::json::write_json;

/// One row of the observation file.
#[derive(Debug, Serialize)]
struct ObservationRow {
    key: u64,
    alternative: u64,
    available: bool,
    chosen: bool,
    source: &'static str,
    coefficient: Option<usize>,
    value: Option<f64>,
}

/// Returns the path to the observation file of a batch.
pub fn observation_filename(output_dir: &Path, model: &str, batch: usize) -> PathBuf {
    output_dir.join(format!("observations-{model}-batch{batch}.csv"))
}

/// Writer of observations in CSV format, with one row per alternative (`availability` row) and
/// one row per term contributed to an alternative.
///
/// The `source` column tells how the term was contributed: `direct`, `size` (size term attached
/// directly), `component` or `size_component`.
#[derive(Debug)]
pub struct CsvObservationWriter<W: io::Write> {
    writer: csv::Writer<W>,
    nb_observations: u64,
}

impl CsvObservationWriter<File> {
    /// Creates the observation file of a batch in the output directory.
    pub fn create(output_dir: &Path, model: &str, batch: usize) -> Result<Self> {
        let filename = observation_filename(output_dir, model, batch);
        let writer = csv::Writer::from_path(&filename)
            .with_context(|| format!("Failed to create observation file `{filename:?}`"))?;
        Ok(CsvObservationWriter {
            writer,
            nb_observations: 0,
        })
    }
}

impl<W: io::Write> CsvObservationWriter<W> {
    /// Creates a writer of observations to any [io::Write].
    pub fn from_writer(writer: W) -> Self {
        CsvObservationWriter {
            writer: csv::Writer::from_writer(writer),
            nb_observations: 0,
        }
    }

    /// Returns the number of observations written.
    pub fn nb_observations(&self) -> u64 {
        self.nb_observations
    }

    /// Flushes and returns the underlying writer.
    pub fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|e| anyhow::anyhow!("Failed to flush observations: {}", e.error()))
    }
}

impl<W: io::Write> ObservationSink for CsvObservationWriter<W> {
    fn write(&mut self, observation: &Observation) -> Result<()> {
        for alternative in &observation.alternatives {
            let row = |source, coefficient, value| ObservationRow {
                key: observation.key,
                alternative: alternative.id,
                available: alternative.available,
                chosen: alternative.chosen,
                source,
                coefficient,
                value,
            };
            self.writer.serialize(row("availability", None, None))?;
            for term in &alternative.terms {
                let source = match (term.source, term.is_size) {
                    (TermSource::Direct, false) => "direct",
                    (TermSource::Direct, true) => "size",
                    (TermSource::Component(_), _) => "component",
                    (TermSource::SizeComponent(_), _) => "size_component",
                };
                self.writer
                    .serialize(row(source, Some(term.coefficient), Some(term.value)))?;
            }
        }
        self.nb_observations += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.flush().context("Failed to flush observations")
    }
}

/// Writes the estimation summary of a model in the output directory, as
/// `estimation-summary-{model}.json`.
pub fn write_estimation_summary(
    summary: &EstimationSummary,
    output_dir: &Path,
    model: &str,
) -> Result<()> {
    write_json(summary, output_dir, &format!("estimation-summary-{model}"))
        .with_context(|| format!("Failed to write the estimation summary of model `{model}`"))
}

#[cfg(test)]
mod tests {
    use choice::{ObservedAlternative, ObservedTerm};

    use super::*;

    #[test]
    fn csv_observation_test() {
        let observation = Observation {
            key: 4,
            alternatives: vec![
                ObservedAlternative {
                    id: 1,
                    available: true,
                    chosen: true,
                    terms: vec![
                        ObservedTerm {
                            source: TermSource::Direct,
                            coefficient: 2,
                            value: 1.5,
                            is_size: false,
                        },
                        ObservedTerm {
                            source: TermSource::Component(0),
                            coefficient: 3,
                            value: -2.0,
                            is_size: false,
                        },
                        ObservedTerm {
                            source: TermSource::Direct,
                            coefficient: 5,
                            value: 10.0,
                            is_size: true,
                        },
                    ],
                },
                ObservedAlternative {
                    id: 2,
                    available: false,
                    chosen: false,
                    terms: Vec::new(),
                },
            ],
        };
        let mut writer = CsvObservationWriter::from_writer(Vec::new());
        writer.write(&observation).unwrap();
        writer.finish().unwrap();
        assert_eq!(writer.nb_observations(), 1);
        let output = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(
            lines,
            vec![
                "key,alternative,available,chosen,source,coefficient,value",
                "4,1,true,true,availability,,",
                "4,1,true,true,direct,2,1.5",
                "4,1,true,true,component,3,-2.0",
                "4,1,true,true,size,5,10.0",
                "4,2,false,false,availability,,",
            ]
        );
    }
}
