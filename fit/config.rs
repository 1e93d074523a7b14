//! # Fit Configuration
//!
//! A fit is described by a single TOML document. Every section has defaults
//! except `[distribution]`, whose `kind` must be chosen explicitly, and
//! `[run_normalization]`, which lists the runs entering the fit.
//!
//! ```toml
//! [fit]
//! max_iterations = 100
//! tolerance = 1.0
//! systematic = { name = "nominal" }
//!
//! [angular_response]
//! bins = 90
//! min_bin_entries = 25
//!
//! [distribution]
//! kind = "binned"
//! cos_theta_bins = 12
//! phi_bins = 36
//!
//! [run_normalization]
//! run_ids = [250000, 250001, 250002]
//! ```

use crate::layout::ParameterGroup;
use crate::systematic::Systematic;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Inconsistent size for the {group:?} parameter group: {reason}")]
    InvalidGroup {
        group: ParameterGroup,
        reason: String,
    },
    #[error("The source intensity distribution type is unset. Choose kind = \"binned\" or \"sinusoidal\".")]
    DistributionTypeUnset,
    #[error("Unknown systematic '{0}'.")]
    UnknownSystematic(String),
    #[error("Systematic '{0}' requires a finite numeric value.")]
    MissingSystematicValue(String),
    #[error("Invalid fit setting '{name}': {reason}")]
    InvalidSetting { name: &'static str, reason: String },
}

/// The complete description of one fit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitConfig {
    #[serde(default)]
    pub fit: FitSettings,
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub extinction: ExtinctionConfig,
    #[serde(default)]
    pub mask: MaskConfig,
    #[serde(default)]
    pub angular_response: AngularResponseConfig,
    #[serde(default)]
    pub distribution: DistributionConfig,
    #[serde(default)]
    pub run_normalization: RunNormalizationConfig,
}

/// Convergence controls for the damped least-squares loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitSettings {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Chi-square change below which an iteration counts as "small".
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    /// Consecutive small-change iterations required before stopping.
    #[serde(default = "default_min_good_iterations")]
    pub min_good_iterations: usize,
    #[serde(default)]
    pub systematic: Systematic,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelSettings {
    /// One extinction coefficient governs both the inner medium and the
    /// outer fluid (e.g. a detector filled with the same liquid throughout).
    #[serde(default)]
    pub shared_medium: bool,
}

/// Initial value and vary flag of a single scalar parameter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScalarSetup {
    pub initial: f64,
    #[serde(default = "default_true")]
    pub vary: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtinctionConfig {
    #[serde(default = "default_inner_extinction")]
    pub inner: ScalarSetup,
    #[serde(default = "default_outer_shell_extinction")]
    pub outer_shell: ScalarSetup,
    #[serde(default = "default_outer_fluid_extinction")]
    pub outer_fluid: ScalarSetup,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaskConfig {
    /// Number of polynomial coefficients, including the anchored constant term.
    #[serde(default = "default_mask_coefficients")]
    pub coefficients: usize,
    /// Optional starting values for coefficients 1.. (coefficient 0 is always 1.0).
    #[serde(default)]
    pub initial: Vec<f64>,
    #[serde(default = "default_true")]
    pub vary: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AngularResponseConfig {
    #[serde(default = "default_angular_bins")]
    pub bins: usize,
    /// Independent response tables: 1, or 2 split at `split_z`.
    #[serde(default = "default_angular_tables")]
    pub tables: usize,
    #[serde(default)]
    pub split_z: f64,
    /// Steepness of the raised-cosine interpolation between neighbouring bins.
    #[serde(default = "default_interpolation_slope")]
    pub slope: f64,
    #[serde(default = "default_true")]
    pub vary: bool,
    #[serde(default = "default_min_angular_entries")]
    pub min_bin_entries: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionKind {
    Binned,
    Sinusoidal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionConfig {
    #[serde(default)]
    pub kind: Option<DistributionKind>,
    #[serde(default = "default_cos_theta_bins")]
    pub cos_theta_bins: usize,
    #[serde(default = "default_phi_bins")]
    pub phi_bins: usize,
    #[serde(default = "default_sinusoid_slices")]
    pub slices: usize,
    #[serde(default = "default_true")]
    pub vary: bool,
    #[serde(default = "default_min_distribution_entries")]
    pub min_bin_entries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunNormalizationConfig {
    /// Identifiers of the calibration runs, in run-index order.
    #[serde(default)]
    pub run_ids: Vec<u32>,
    #[serde(default = "default_true")]
    pub vary: bool,
}

fn default_true() -> bool {
    true
}
fn default_max_iterations() -> usize {
    100
}
fn default_tolerance() -> f64 {
    1.0
}
fn default_min_good_iterations() -> usize {
    4
}
fn default_inner_extinction() -> ScalarSetup {
    ScalarSetup {
        initial: 2.0e-5,
        vary: true,
    }
}
fn default_outer_shell_extinction() -> ScalarSetup {
    ScalarSetup {
        initial: 1.0e-4,
        vary: true,
    }
}
fn default_outer_fluid_extinction() -> ScalarSetup {
    ScalarSetup {
        initial: 1.0e-5,
        vary: true,
    }
}
fn default_mask_coefficients() -> usize {
    5
}
fn default_angular_bins() -> usize {
    90
}
fn default_angular_tables() -> usize {
    1
}
fn default_interpolation_slope() -> f64 {
    2.0
}
fn default_min_angular_entries() -> usize {
    25
}
fn default_cos_theta_bins() -> usize {
    12
}
fn default_phi_bins() -> usize {
    36
}
fn default_sinusoid_slices() -> usize {
    12
}
fn default_min_distribution_entries() -> usize {
    10
}

impl Default for FitSettings {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            tolerance: default_tolerance(),
            min_good_iterations: default_min_good_iterations(),
            systematic: Systematic::default(),
        }
    }
}

impl Default for ExtinctionConfig {
    fn default() -> Self {
        Self {
            inner: default_inner_extinction(),
            outer_shell: default_outer_shell_extinction(),
            outer_fluid: default_outer_fluid_extinction(),
        }
    }
}

impl Default for MaskConfig {
    fn default() -> Self {
        Self {
            coefficients: default_mask_coefficients(),
            initial: Vec::new(),
            vary: true,
        }
    }
}

impl Default for AngularResponseConfig {
    fn default() -> Self {
        Self {
            bins: default_angular_bins(),
            tables: default_angular_tables(),
            split_z: 0.0,
            slope: default_interpolation_slope(),
            vary: true,
            min_bin_entries: default_min_angular_entries(),
        }
    }
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            kind: None,
            cos_theta_bins: default_cos_theta_bins(),
            phi_bins: default_phi_bins(),
            slices: default_sinusoid_slices(),
            vary: true,
            min_bin_entries: default_min_distribution_entries(),
        }
    }
}

impl Default for RunNormalizationConfig {
    fn default() -> Self {
        Self {
            run_ids: Vec::new(),
            vary: true,
        }
    }
}

impl FitConfig {
    /// Loads a fit configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        Self::from_toml_str(&toml_string)
    }

    pub fn from_toml_str(toml_string: &str) -> Result<Self, ConfigError> {
        let config: FitConfig = toml::from_str(toml_string)?;
        config.validate_settings()?;
        Ok(config)
    }

    /// Checks the scalar fit settings. Group sizes are checked when the
    /// parameter layout is derived.
    pub fn validate_settings(&self) -> Result<(), ConfigError> {
        if !(self.fit.tolerance.is_finite() && self.fit.tolerance >= 0.0) {
            return Err(ConfigError::InvalidSetting {
                name: "fit.tolerance",
                reason: format!("must be finite and non-negative, got {}", self.fit.tolerance),
            });
        }
        if !(self.angular_response.slope.is_finite() && self.angular_response.slope > 0.0) {
            return Err(ConfigError::InvalidSetting {
                name: "angular_response.slope",
                reason: format!("must be positive, got {}", self.angular_response.slope),
            });
        }
        if !self.angular_response.split_z.is_finite() {
            return Err(ConfigError::InvalidSetting {
                name: "angular_response.split_z",
                reason: "must be finite".to_string(),
            });
        }
        if let Systematic::SourceRadius { offset } = self.fit.systematic {
            if !offset.is_finite() {
                return Err(ConfigError::MissingSystematicValue(
                    self.fit.systematic.name().to_string(),
                ));
            }
        }
        Ok(())
    }
}
