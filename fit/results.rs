//! # Fit Results
//!
//! A finished fit is saved as a human-readable TOML document holding every
//! parameter (name, final value, error, vary flag and bounds), the expanded
//! covariance matrix and the fit report.

use crate::estimate::{FitReport, FittedOptics};
use crate::parameters::Parameter;
use crate::systematic::Systematic;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResultsError {
    #[error("Failed to read or write result file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML result file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize result to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    pub systematic: Systematic,
    pub report: FitReport,
    pub parameters: Vec<Parameter>,
    /// Indexed by global parameter index; row and column 0 are unused.
    pub covariance: Array2<f64>,
}

impl From<&FittedOptics> for FitResult {
    fn from(fitted: &FittedOptics) -> Self {
        Self {
            systematic: fitted.model.systematic(),
            report: fitted.report.clone(),
            parameters: fitted.store.parameters().to_vec(),
            covariance: fitted.covariance.clone(),
        }
    }
}

impl FitResult {
    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Correlation coefficient of two parameters, by global index. NaN when
    /// either parameter has no positive variance.
    pub fn correlation(&self, a: usize, b: usize) -> f64 {
        let (va, vb) = (self.covariance[[a, a]], self.covariance[[b, b]]);
        if va > 0.0 && vb > 0.0 {
            self.covariance[[a, b]] / (va * vb).sqrt()
        } else {
            f64::NAN
        }
    }

    /// Saves the result to a file in a human-readable TOML format.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ResultsError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ResultsError> {
        let toml_string = fs::read_to_string(path)?;
        let result = toml::from_str(&toml_string)?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chisquare::ResidualSummary;
    use crate::estimate::CensusSummary;
    use crate::layout::ParameterGroup;
    use crate::linalg::SolveStatus;
    use crate::marquardt::FitStatus;
    use ndarray::array;
    use tempfile::tempdir;

    fn result() -> FitResult {
        let parameter = |index: usize, name: &str, value: f64, error: Option<f64>| Parameter {
            name: name.to_string(),
            index,
            group: ParameterGroup::Extinction,
            group_size: 3,
            initial_value: 1.0e-3,
            bounds: (1.0e-9, 1.0),
            vary: error.is_some(),
            final_value: Some(value),
            final_error: error,
        };
        FitResult {
            systematic: Systematic::SourceRadius { offset: 5.0 },
            report: FitReport {
                chi_square: 812.5,
                n_observations: 800,
                n_varying: 2,
                reduced_chi_square: 812.5 / 798.0,
                iterations: 7,
                lambda: 1.0e-7,
                status: FitStatus::Converged,
                covariance_status: SolveStatus::Ok,
                census: CensusSummary {
                    angular_bins_fixed: 12,
                    distribution_bins_fixed: 3,
                },
                residuals: ResidualSummary {
                    mean: 0.01,
                    std_dev: 1.02,
                    finite: 800,
                    total: 802,
                },
            },
            parameters: vec![
                parameter(1, "inner_extinction", 2.1e-3, Some(4.0e-5)),
                parameter(2, "outer_shell_extinction", 1.0e-4, Some(2.0e-5)),
                parameter(3, "outer_fluid_extinction", 1.0e-5, None),
            ],
            covariance: array![
                [0.0, 0.0, 0.0, 0.0],
                [0.0, 1.6e-9, -2.0e-10, 0.0],
                [0.0, -2.0e-10, 4.0e-10, 0.0],
                [0.0, 0.0, 0.0, 0.0]
            ],
        }
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fit.toml");
        let original = result();
        original.save(&path).unwrap();
        let loaded = FitResult::load(&path).unwrap();
        assert_eq!(loaded, original);
        assert_eq!(loaded.parameter("outer_fluid_extinction").unwrap().final_error, None);
    }

    #[test]
    fn correlation_uses_the_covariance_diagonal() {
        let result = result();
        assert!((result.correlation(1, 2) - (-0.25)).abs() < 1e-12);
        assert!(result.correlation(1, 3).is_nan());
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            FitResult::load(dir.path().join("absent.toml")),
            Err(ResultsError::IoError(_))
        ));
    }
}
