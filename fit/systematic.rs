//! # Systematic Variations
//!
//! A fit is run either nominally or with exactly one systematic variation of
//! the optical model switched on. The variation is a closed enum so that
//! "one active systematic" holds by construction.

use crate::config::ConfigError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum Systematic {
    /// No modification of the model.
    #[default]
    Nominal,
    /// The source intensity distribution enters the model squared.
    DistributionSquared,
    /// The mask polynomial is replaced by the constant 1.0 and its
    /// coefficients are held fixed.
    FlatMask,
    /// A fixed offset is removed from every inner-medium path length,
    /// correcting for light leaving the surface of a source of finite radius.
    SourceRadius { offset: f64 },
}

impl Systematic {
    /// Resolves a systematic from its configuration name. `SourceRadius`
    /// requires an offset.
    pub fn from_name(name: &str, offset: Option<f64>) -> Result<Self, ConfigError> {
        match name {
            "nominal" => Ok(Systematic::Nominal),
            "distribution_squared" => Ok(Systematic::DistributionSquared),
            "flat_mask" => Ok(Systematic::FlatMask),
            "source_radius" => match offset {
                Some(offset) if offset.is_finite() => Ok(Systematic::SourceRadius { offset }),
                _ => Err(ConfigError::MissingSystematicValue(name.to_string())),
            },
            other => Err(ConfigError::UnknownSystematic(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Systematic::Nominal => "nominal",
            Systematic::DistributionSquared => "distribution_squared",
            Systematic::FlatMask => "flat_mask",
            Systematic::SourceRadius { .. } => "source_radius",
        }
    }

    /// Inner-medium path length after the source-radius correction. Path
    /// lengths never go negative.
    pub fn inner_path(&self, path: f64) -> f64 {
        match self {
            Systematic::SourceRadius { offset } => (path - offset).max(0.0),
            _ => path,
        }
    }
}
