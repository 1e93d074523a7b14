//! # Observation Loading
//!
//! Observations arrive as a comma-separated file with a strict schema: one
//! header row naming every field, one observation per row. Column names are
//! not configurable. Off-axis geometry columns carry the prefix `off_`,
//! central geometry columns the prefix `ctr_`.
//!
//! ```text
//! run_index,sensor_z,occupancy_ratio,occupancy_ratio_error,pmt_variability,valid,
//! off_inner_path,off_outer_shell_path,off_outer_fluid_path,off_solid_angle,
//! off_transmission,off_cos_incident,off_source_cos_theta,off_source_phi,
//! off_intensity_norm,ctr_inner_path,...,ctr_intensity_norm
//! ```
//!
//! Every numeric value must be finite. A negative `pmt_variability` means the
//! variability was not computed.

use crate::observation::{Observation, ObservationFit, RunGeometry};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Malformed observation file: {0}")]
    CsvError(#[from] csv::Error),
    #[error(
        "Non-finite value (NaN or Infinity) in column '{column}' of data row {row}. Every observation value must be finite."
    )]
    NonFiniteValue { row: usize, column: &'static str },
    #[error("The observation file contains no data rows.")]
    Empty,
    #[error("Got {fits} fit annotations for {observations} observations.")]
    LengthMismatch { observations: usize, fits: usize },
}

/// One CSV row, flattened.
#[derive(Debug, Clone, Deserialize)]
struct ObservationRecord {
    run_index: usize,
    sensor_z: f64,
    occupancy_ratio: f64,
    occupancy_ratio_error: f64,
    pmt_variability: f64,
    valid: bool,
    off_inner_path: f64,
    off_outer_shell_path: f64,
    off_outer_fluid_path: f64,
    off_solid_angle: f64,
    off_transmission: f64,
    off_cos_incident: f64,
    off_source_cos_theta: f64,
    off_source_phi: f64,
    off_intensity_norm: f64,
    ctr_inner_path: f64,
    ctr_outer_shell_path: f64,
    ctr_outer_fluid_path: f64,
    ctr_solid_angle: f64,
    ctr_transmission: f64,
    ctr_cos_incident: f64,
    ctr_source_cos_theta: f64,
    ctr_source_phi: f64,
    ctr_intensity_norm: f64,
}

impl ObservationRecord {
    fn numeric_fields(&self) -> [(&'static str, f64); 22] {
        [
            ("sensor_z", self.sensor_z),
            ("occupancy_ratio", self.occupancy_ratio),
            ("occupancy_ratio_error", self.occupancy_ratio_error),
            ("pmt_variability", self.pmt_variability),
            ("off_inner_path", self.off_inner_path),
            ("off_outer_shell_path", self.off_outer_shell_path),
            ("off_outer_fluid_path", self.off_outer_fluid_path),
            ("off_solid_angle", self.off_solid_angle),
            ("off_transmission", self.off_transmission),
            ("off_cos_incident", self.off_cos_incident),
            ("off_source_cos_theta", self.off_source_cos_theta),
            ("off_source_phi", self.off_source_phi),
            ("off_intensity_norm", self.off_intensity_norm),
            ("ctr_inner_path", self.ctr_inner_path),
            ("ctr_outer_shell_path", self.ctr_outer_shell_path),
            ("ctr_outer_fluid_path", self.ctr_outer_fluid_path),
            ("ctr_solid_angle", self.ctr_solid_angle),
            ("ctr_transmission", self.ctr_transmission),
            ("ctr_cos_incident", self.ctr_cos_incident),
            ("ctr_source_cos_theta", self.ctr_source_cos_theta),
            ("ctr_source_phi", self.ctr_source_phi),
            ("ctr_intensity_norm", self.ctr_intensity_norm),
        ]
    }

    fn into_observation(self) -> Observation {
        Observation {
            run_index: self.run_index,
            sensor_z: self.sensor_z,
            occupancy_ratio: self.occupancy_ratio,
            occupancy_ratio_error: self.occupancy_ratio_error,
            pmt_variability: self.pmt_variability,
            off_axis: RunGeometry {
                inner_path: self.off_inner_path,
                outer_shell_path: self.off_outer_shell_path,
                outer_fluid_path: self.off_outer_fluid_path,
                solid_angle: self.off_solid_angle,
                transmission: self.off_transmission,
                cos_incident: self.off_cos_incident,
                source_cos_theta: self.off_source_cos_theta,
                source_phi: self.off_source_phi,
                intensity_norm: self.off_intensity_norm,
            },
            central: RunGeometry {
                inner_path: self.ctr_inner_path,
                outer_shell_path: self.ctr_outer_shell_path,
                outer_fluid_path: self.ctr_outer_fluid_path,
                solid_angle: self.ctr_solid_angle,
                transmission: self.ctr_transmission,
                cos_incident: self.ctr_cos_incident,
                source_cos_theta: self.ctr_source_cos_theta,
                source_phi: self.ctr_source_phi,
                intensity_norm: self.ctr_intensity_norm,
            },
            valid: self.valid,
        }
    }
}

/// Loads and validates every observation in a CSV file.
pub fn load_observations(path: impl AsRef<Path>) -> Result<Vec<Observation>, DataError> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let observations = read_observations(BufReader::new(file))?;
    log::info!(
        "Loaded {} observations ({} valid) from {}",
        observations.len(),
        observations.iter().filter(|obs| obs.valid).count(),
        path.display()
    );
    Ok(observations)
}

pub fn read_observations<R: Read>(reader: R) -> Result<Vec<Observation>, DataError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);
    let mut observations = Vec::new();
    for (row, record) in csv_reader.deserialize::<ObservationRecord>().enumerate() {
        let record = record?;
        if let Some((column, _)) = record
            .numeric_fields()
            .into_iter()
            .find(|(_, value)| !value.is_finite())
        {
            return Err(DataError::NonFiniteValue {
                row: row + 1,
                column,
            });
        }
        observations.push(record.into_observation());
    }
    if observations.is_empty() {
        return Err(DataError::Empty);
    }
    Ok(observations)
}

/// Per-observation fit annotations, one row per observation in input order.
#[derive(Debug, Serialize)]
struct FitRecord {
    row: usize,
    run_index: usize,
    valid: bool,
    occupancy_ratio: f64,
    prediction: f64,
    residual: f64,
    pull: f64,
    chi_square: f64,
    predicted_occupancy: f64,
}

/// Writes observations next to their fit annotations as CSV.
pub fn write_observation_fits<W: Write>(
    writer: W,
    observations: &[Observation],
    fits: &[ObservationFit],
) -> Result<(), DataError> {
    if observations.len() != fits.len() {
        return Err(DataError::LengthMismatch {
            observations: observations.len(),
            fits: fits.len(),
        });
    }
    let mut csv_writer = csv::Writer::from_writer(writer);
    for (row, (obs, fit)) in observations.iter().zip(fits).enumerate() {
        csv_writer.serialize(FitRecord {
            row: row + 1,
            run_index: obs.run_index,
            valid: obs.valid,
            occupancy_ratio: obs.occupancy_ratio,
            prediction: fit.prediction,
            residual: fit.residual,
            pull: fit.pull,
            chi_square: fit.chi_square,
            predicted_occupancy: fit.predicted_occupancy,
        })?;
    }
    csv_writer.flush()?;
    Ok(())
}
