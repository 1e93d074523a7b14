//! # Observations
//!
//! One observation is a single photomultiplier seen in two runs: an off-axis
//! source position and the reference ("central") position. All geometry is
//! computed upstream; the fit only reads these records.

use serde::{Deserialize, Serialize};

/// Per-run geometric quantities for one photomultiplier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunGeometry {
    /// Path length through the inner medium.
    pub inner_path: f64,
    /// Path length through the outer shell (e.g. the acrylic vessel).
    pub outer_shell_path: f64,
    /// Path length through the outer fluid.
    pub outer_fluid_path: f64,
    pub solid_angle: f64,
    pub transmission: f64,
    /// Cosine of the light's incident angle at the photomultiplier.
    pub cos_incident: f64,
    /// Polar angle cosine of the emission direction in the source frame.
    pub source_cos_theta: f64,
    /// Azimuth of the emission direction in the source frame, in radians.
    pub source_phi: f64,
    /// Baseline source intensity of the run.
    pub intensity_norm: f64,
}

impl Default for RunGeometry {
    fn default() -> Self {
        Self {
            inner_path: 0.0,
            outer_shell_path: 0.0,
            outer_fluid_path: 0.0,
            solid_angle: 1.0,
            transmission: 1.0,
            cos_incident: 1.0,
            source_cos_theta: 0.0,
            source_phi: 0.0,
            intensity_norm: 1.0,
        }
    }
}

impl RunGeometry {
    /// Incident angle in degrees, from the stored cosine.
    pub fn incident_angle_degrees(&self) -> f64 {
        self.cos_incident.clamp(-1.0, 1.0).acos().to_degrees()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Index of the off-axis run in the configured run list.
    pub run_index: usize,
    /// Photomultiplier z coordinate, used to pick the angular-response table.
    pub sensor_z: f64,
    /// Measured off-axis to central occupancy ratio.
    pub occupancy_ratio: f64,
    pub occupancy_ratio_error: f64,
    /// Photomultiplier variability error. Negative when it was not computed.
    pub pmt_variability: f64,
    pub off_axis: RunGeometry,
    pub central: RunGeometry,
    pub valid: bool,
}

impl Observation {
    /// Statistical and variability errors combined in quadrature.
    pub fn total_variance(&self) -> f64 {
        let variability = self.pmt_variability.max(0.0);
        self.occupancy_ratio_error * self.occupancy_ratio_error + variability * variability
    }
}

/// Model annotations for one observation after a fit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObservationFit {
    pub prediction: f64,
    /// `data - prediction`.
    pub residual: f64,
    /// Residual in units of the total error.
    pub pull: f64,
    pub chi_square: f64,
    /// Absolute off-axis occupancy predicted at the fitted parameters.
    pub predicted_occupancy: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn negative_variability_counts_as_absent() {
        let mut obs = Observation {
            run_index: 0,
            sensor_z: 0.0,
            occupancy_ratio: 1.0,
            occupancy_ratio_error: 0.03,
            pmt_variability: -1.0,
            off_axis: RunGeometry::default(),
            central: RunGeometry::default(),
            valid: true,
        };
        assert_abs_diff_eq!(obs.total_variance(), 9.0e-4, epsilon = 1e-15);
        obs.pmt_variability = 0.04;
        assert_abs_diff_eq!(obs.total_variance(), 2.5e-3, epsilon = 1e-15);
    }

    #[test]
    fn incident_angle_clamps_rounding_noise() {
        let geometry = RunGeometry {
            cos_incident: 1.0 + 1e-12,
            ..RunGeometry::default()
        };
        assert_eq!(geometry.incident_angle_degrees(), 0.0);
        let geometry = RunGeometry {
            cos_incident: 0.5,
            ..RunGeometry::default()
        };
        assert_abs_diff_eq!(geometry.incident_angle_degrees(), 60.0, epsilon = 1e-10);
    }
}
