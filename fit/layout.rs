//! # Parameter Layout
//!
//! Parameters live in one flat, 1-based index space, grouped in a fixed order:
//! extinction, mask, angular response, source distribution and run
//! normalisation. Offsets are derived from the sizes of the preceding groups,
//! so any configuration change shifts every later group consistently.
//!
//! Containers indexed by global parameter index are ordinary 0-based vectors of
//! length `parameter_count() + PARAMETER_INDEX_BASE`. Position 0 is a real
//! element that never belongs to any group.

use crate::config::{ConfigError, DistributionKind, FitConfig};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Offset between a 0-based container position and the first global index.
pub const PARAMETER_INDEX_BASE: usize = 1;

/// Extinction coefficients, in layout order: inner medium, outer shell, outer fluid.
pub const EXTINCTION_COEFFICIENTS: usize = 3;

/// Each sinusoidal slice carries an amplitude and a phase.
pub const PARAMETERS_PER_SLICE: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterGroup {
    Extinction,
    Mask,
    AngularResponse,
    Distribution,
    RunNormalization,
}

impl ParameterGroup {
    pub const ALL: [ParameterGroup; 5] = [
        ParameterGroup::Extinction,
        ParameterGroup::Mask,
        ParameterGroup::AngularResponse,
        ParameterGroup::Distribution,
        ParameterGroup::RunNormalization,
    ];
}

/// Shape of the source intensity distribution parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DistributionShape {
    /// Nearest-bin lookup in a `cos_theta_bins x phi_bins` grid.
    Binned {
        cos_theta_bins: usize,
        phi_bins: usize,
    },
    /// `1 + amp * sin(phi + phase)` per polar slice.
    Sinusoidal { slices: usize },
}

impl DistributionShape {
    /// Number of occupancy bins (grid cells, or slices).
    pub fn bin_count(&self) -> usize {
        match *self {
            DistributionShape::Binned {
                cos_theta_bins,
                phi_bins,
            } => cos_theta_bins * phi_bins,
            DistributionShape::Sinusoidal { slices } => slices,
        }
    }

    pub fn parameter_count(&self) -> usize {
        match *self {
            DistributionShape::Binned { .. } => self.bin_count(),
            DistributionShape::Sinusoidal { slices } => slices * PARAMETERS_PER_SLICE,
        }
    }

    /// Group-relative parameter indices owned by one occupancy bin.
    pub fn parameters_of_bin(&self, bin: usize) -> Range<usize> {
        match *self {
            DistributionShape::Binned { .. } => bin..bin + 1,
            DistributionShape::Sinusoidal { .. } => {
                bin * PARAMETERS_PER_SLICE..(bin + 1) * PARAMETERS_PER_SLICE
            }
        }
    }
}

/// Raw group sizes as read from configuration, before any validation.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupSizes {
    pub mask_coefficients: usize,
    pub angular_bins: usize,
    pub angular_tables: usize,
    pub distribution: Option<DistributionShape>,
    pub runs: usize,
}

impl GroupSizes {
    pub fn from_config(config: &FitConfig) -> Self {
        let distribution = config.distribution.kind.map(|kind| match kind {
            DistributionKind::Binned => DistributionShape::Binned {
                cos_theta_bins: config.distribution.cos_theta_bins,
                phi_bins: config.distribution.phi_bins,
            },
            DistributionKind::Sinusoidal => DistributionShape::Sinusoidal {
                slices: config.distribution.slices,
            },
        });
        Self {
            mask_coefficients: config.mask.coefficients,
            angular_bins: config.angular_response.bins,
            angular_tables: config.angular_response.tables,
            distribution,
            runs: config.run_normalization.run_ids.len(),
        }
    }

    /// Number of parameters in `group`, or why the configured size is unusable.
    pub fn group_size(&self, group: ParameterGroup) -> Result<usize, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidGroup {
            group,
            reason: reason.to_string(),
        };
        match group {
            ParameterGroup::Extinction => Ok(EXTINCTION_COEFFICIENTS),
            ParameterGroup::Mask => {
                if self.mask_coefficients == 0 {
                    return Err(invalid("at least the constant coefficient is required"));
                }
                Ok(self.mask_coefficients)
            }
            ParameterGroup::AngularResponse => {
                if self.angular_bins == 0 {
                    return Err(invalid("at least one angular bin is required"));
                }
                if !(1..=2).contains(&self.angular_tables) {
                    return Err(invalid("the number of response tables must be 1 or 2"));
                }
                Ok(self.angular_bins * self.angular_tables)
            }
            ParameterGroup::Distribution => {
                let shape = self.distribution.ok_or(ConfigError::DistributionTypeUnset)?;
                if shape.bin_count() == 0 {
                    return Err(invalid("every distribution dimension needs at least one bin"));
                }
                Ok(shape.parameter_count())
            }
            ParameterGroup::RunNormalization => Ok(self.runs),
        }
    }

    /// 1-based global index of the first parameter of `group`.
    pub fn group_offset(&self, group: ParameterGroup) -> Result<usize, ConfigError> {
        let mut offset = PARAMETER_INDEX_BASE;
        for preceding in ParameterGroup::ALL {
            if preceding == group {
                // The group itself must be well formed even if it is last.
                self.group_size(group)?;
                return Ok(offset);
            }
            offset += self.group_size(preceding)?;
        }
        Ok(offset)
    }
}

/// Validated, derived layout of every parameter group.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterLayout {
    extinction: Range<usize>,
    mask: Range<usize>,
    angular_response: Range<usize>,
    distribution: Range<usize>,
    run_normalization: Range<usize>,
    angular_bins: usize,
    angular_tables: usize,
    distribution_shape: DistributionShape,
}

impl ParameterLayout {
    pub fn new(sizes: &GroupSizes) -> Result<Self, ConfigError> {
        let range_of = |group: ParameterGroup| -> Result<Range<usize>, ConfigError> {
            let start = sizes.group_offset(group)?;
            Ok(start..start + sizes.group_size(group)?)
        };
        let distribution_shape = sizes.distribution.ok_or(ConfigError::DistributionTypeUnset)?;
        let layout = Self {
            extinction: range_of(ParameterGroup::Extinction)?,
            mask: range_of(ParameterGroup::Mask)?,
            angular_response: range_of(ParameterGroup::AngularResponse)?,
            distribution: range_of(ParameterGroup::Distribution)?,
            run_normalization: range_of(ParameterGroup::RunNormalization)?,
            angular_bins: sizes.angular_bins,
            angular_tables: sizes.angular_tables,
            distribution_shape,
        };
        log::debug!(
            "Parameter layout: {} parameters (mask {:?}, angular {:?}, distribution {:?}, runs {:?})",
            layout.parameter_count(),
            layout.mask,
            layout.angular_response,
            layout.distribution,
            layout.run_normalization
        );
        Ok(layout)
    }

    pub fn from_config(config: &FitConfig) -> Result<Self, ConfigError> {
        Self::new(&GroupSizes::from_config(config))
    }

    pub fn range(&self, group: ParameterGroup) -> Range<usize> {
        match group {
            ParameterGroup::Extinction => self.extinction.clone(),
            ParameterGroup::Mask => self.mask.clone(),
            ParameterGroup::AngularResponse => self.angular_response.clone(),
            ParameterGroup::Distribution => self.distribution.clone(),
            ParameterGroup::RunNormalization => self.run_normalization.clone(),
        }
    }

    pub fn group_offset(&self, group: ParameterGroup) -> usize {
        self.range(group).start
    }

    pub fn group_of(&self, index: usize) -> Option<ParameterGroup> {
        ParameterGroup::ALL
            .into_iter()
            .find(|&group| self.range(group).contains(&index))
    }

    /// Number of real parameters (excluding the unused slot 0).
    pub fn parameter_count(&self) -> usize {
        self.run_normalization.end - PARAMETER_INDEX_BASE
    }

    /// Length of containers indexed by global parameter index.
    pub fn storage_len(&self) -> usize {
        self.parameter_count() + PARAMETER_INDEX_BASE
    }

    pub fn inner_extinction(&self) -> usize {
        self.extinction.start
    }

    pub fn outer_shell_extinction(&self) -> usize {
        self.extinction.start + 1
    }

    pub fn outer_fluid_extinction(&self) -> usize {
        self.extinction.start + 2
    }

    pub fn mask_coefficients(&self) -> usize {
        self.mask.len()
    }

    pub fn mask_coefficient(&self, k: usize) -> usize {
        self.mask.start + k
    }

    pub fn angular_bins(&self) -> usize {
        self.angular_bins
    }

    pub fn angular_tables(&self) -> usize {
        self.angular_tables
    }

    pub fn angular_bin(&self, table: usize, bin: usize) -> usize {
        self.angular_response.start + table * self.angular_bins + bin
    }

    pub fn distribution_shape(&self) -> DistributionShape {
        self.distribution_shape
    }

    pub fn distribution_parameter(&self, k: usize) -> usize {
        self.distribution.start + k
    }

    /// Global indices of the parameters owned by one distribution bin.
    pub fn distribution_bin_parameters(&self, bin: usize) -> Range<usize> {
        let relative = self.distribution_shape.parameters_of_bin(bin);
        self.distribution.start + relative.start..self.distribution.start + relative.end
    }

    pub fn run_count(&self) -> usize {
        self.run_normalization.len()
    }

    pub fn run_normalization(&self, run: usize) -> Option<usize> {
        (run < self.run_count()).then(|| self.run_normalization.start + run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes() -> GroupSizes {
        GroupSizes {
            mask_coefficients: 4,
            angular_bins: 10,
            angular_tables: 2,
            distribution: Some(DistributionShape::Binned {
                cos_theta_bins: 3,
                phi_bins: 4,
            }),
            runs: 5,
        }
    }

    #[test]
    fn offsets_follow_group_order() {
        let sizes = sizes();
        assert_eq!(sizes.group_offset(ParameterGroup::Extinction).unwrap(), 1);
        assert_eq!(sizes.group_offset(ParameterGroup::Mask).unwrap(), 4);
        assert_eq!(sizes.group_offset(ParameterGroup::AngularResponse).unwrap(), 8);
        assert_eq!(sizes.group_offset(ParameterGroup::Distribution).unwrap(), 28);
        assert_eq!(sizes.group_offset(ParameterGroup::RunNormalization).unwrap(), 40);

        let layout = ParameterLayout::new(&sizes).unwrap();
        assert_eq!(layout.parameter_count(), 44);
        assert_eq!(layout.storage_len(), 45);
        assert_eq!(layout.angular_bin(1, 0), 18);
        assert_eq!(layout.run_normalization(4), Some(44));
        assert_eq!(layout.run_normalization(5), None);
        assert_eq!(layout.group_of(0), None);
        assert_eq!(layout.group_of(7), Some(ParameterGroup::Mask));
        assert_eq!(layout.group_of(44), Some(ParameterGroup::RunNormalization));
        assert_eq!(layout.group_of(45), None);
    }

    #[test]
    fn resizing_a_group_shifts_later_offsets() {
        let mut sizes = sizes();
        let before = sizes.group_offset(ParameterGroup::RunNormalization).unwrap();
        sizes.angular_bins += 3;
        let after = sizes.group_offset(ParameterGroup::RunNormalization).unwrap();
        assert_eq!(after, before + 6);
    }

    #[test]
    fn sinusoidal_slices_own_two_parameters() {
        let mut sizes = sizes();
        sizes.distribution = Some(DistributionShape::Sinusoidal { slices: 6 });
        let layout = ParameterLayout::new(&sizes).unwrap();
        assert_eq!(layout.range(ParameterGroup::Distribution).len(), 12);
        assert_eq!(layout.distribution_bin_parameters(2), 32..34);
    }

    #[test]
    fn unset_distribution_is_a_configuration_error() {
        let mut sizes = sizes();
        sizes.distribution = None;
        assert!(matches!(
            sizes.group_offset(ParameterGroup::RunNormalization),
            Err(ConfigError::DistributionTypeUnset)
        ));
        // Groups before the distribution are still addressable.
        assert_eq!(sizes.group_offset(ParameterGroup::AngularResponse).unwrap(), 8);
        assert!(ParameterLayout::new(&sizes).is_err());
    }

    #[test]
    fn rejects_inconsistent_sizes() {
        let mut sizes = sizes();
        sizes.angular_tables = 3;
        assert!(matches!(
            ParameterLayout::new(&sizes),
            Err(ConfigError::InvalidGroup {
                group: ParameterGroup::AngularResponse,
                ..
            })
        ));

        let mut sizes = self::sizes();
        sizes.mask_coefficients = 0;
        assert!(matches!(
            sizes.group_offset(ParameterGroup::Mask),
            Err(ConfigError::InvalidGroup {
                group: ParameterGroup::Mask,
                ..
            })
        ));
    }
}
