//! # Optics Model
//!
//! Predicts the off-axis to central occupancy ratio of one photomultiplier:
//!
//! ```text
//! ratio = (N_off / N_ctr) * (A_off / A_ctr) * (I_off * M_off) / (I_ctr * M_ctr)
//!         * exp(-(dd_inner * mu_inner + dd_shell * mu_shell + dd_fluid * mu_fluid))
//! ```
//!
//! `A` is the binned angular response, `I` the source intensity distribution,
//! `M` the mask polynomial and `dd_X` the off-axis minus central path length
//! through medium `X`. Derivatives are taken of `ln(ratio)` term by term and
//! multiplied by `ratio` at the end.

use crate::config::{ConfigError, FitConfig};
use crate::layout::{DistributionShape, ParameterLayout};
use crate::observation::{Observation, RunGeometry};
use crate::parameters::{ParameterView, StoreError};
use crate::systematic::Systematic;
use std::f64::consts::{PI, TAU};

/// `(1 - cos(pi * x)) / 2`, rising smoothly from 0 at `x = 0` to 1 at `x = 1`.
pub fn raised_cosine(x: f64) -> f64 {
    0.5 * (1.0 - (PI * x).cos())
}

/// Wraps an azimuth into `[-pi, pi)`.
pub fn wrap_phi(phi: f64) -> f64 {
    (phi + PI).rem_euclid(TAU) - PI
}

fn bin_of(fraction: f64, count: usize) -> usize {
    // NaN saturates to 0 in the cast.
    ((fraction * count as f64).floor().max(0.0) as usize).min(count - 1)
}

/// Occupancy bin of a source emission direction.
pub fn distribution_bin(shape: DistributionShape, cos_theta: f64, phi: f64) -> usize {
    let polar = 0.5 * (1.0 + cos_theta.clamp(-1.0, 1.0));
    match shape {
        DistributionShape::Binned {
            cos_theta_bins,
            phi_bins,
        } => {
            let azimuthal = (wrap_phi(phi) + PI) / TAU;
            bin_of(polar, cos_theta_bins) * phi_bins + bin_of(azimuthal, phi_bins)
        }
        DistributionShape::Sinusoidal { slices } => bin_of(polar, slices),
    }
}

/// Angular-response lookup for one run of an observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AngularSelection {
    pub table: usize,
    pub bin: usize,
    /// `bin + 1` when the response is interpolated towards it.
    pub partner: Option<usize>,
    pub fraction: f64,
}

/// Every bin one evaluation touched. The parameter store turns this into the
/// observation's active parameter subset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BinSelection {
    pub off_axis_angular: AngularSelection,
    pub central_angular: AngularSelection,
    pub off_axis_distribution: usize,
    pub central_distribution: usize,
    pub run: usize,
}

impl BinSelection {
    /// `(table, bin)` pairs of every angular-response parameter used.
    pub fn angular_bins(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        [self.off_axis_angular, self.central_angular]
            .into_iter()
            .flat_map(|sel| {
                std::iter::once((sel.table, sel.bin))
                    .chain(sel.partner.map(|partner| (sel.table, partner)))
            })
    }

    pub fn distribution_bins(&self) -> [usize; 2] {
        [self.off_axis_distribution, self.central_distribution]
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub ratio: f64,
    pub bins: BinSelection,
}

/// Dense derivative storage indexed by global parameter index. Only touched
/// entries are reset between evaluations.
#[derive(Debug, Clone)]
pub struct DerivativeBuffer {
    values: Vec<f64>,
    marked: Vec<bool>,
    touched: Vec<usize>,
}

impl DerivativeBuffer {
    pub fn new(storage_len: usize) -> Self {
        Self {
            values: vec![0.0; storage_len],
            marked: vec![false; storage_len],
            touched: Vec::with_capacity(32),
        }
    }

    pub fn get(&self, index: usize) -> f64 {
        self.values[index]
    }

    /// Indices written by the last evaluation.
    pub fn touched(&self) -> &[usize] {
        &self.touched
    }

    fn add(&mut self, index: usize, amount: f64) {
        if !self.marked[index] {
            self.marked[index] = true;
            self.touched.push(index);
        }
        self.values[index] += amount;
    }

    fn scale(&mut self, factor: f64) {
        for &index in &self.touched {
            self.values[index] *= factor;
        }
    }

    fn clear(&mut self) {
        for &index in &self.touched {
            self.values[index] = 0.0;
            self.marked[index] = false;
        }
        self.touched.clear();
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpticsModel {
    systematic: Systematic,
    shared_medium: bool,
    split_z: f64,
    slope: f64,
}

impl OpticsModel {
    pub fn new(systematic: Systematic, shared_medium: bool, split_z: f64, slope: f64) -> Self {
        Self {
            systematic,
            shared_medium,
            split_z,
            slope,
        }
    }

    pub fn from_config(config: &FitConfig) -> Result<Self, ConfigError> {
        config.validate_settings()?;
        ParameterLayout::from_config(config)?;
        Ok(Self::new(
            config.fit.systematic,
            config.model.shared_medium,
            config.angular_response.split_z,
            config.angular_response.slope,
        ))
    }

    pub fn systematic(&self) -> Systematic {
        self.systematic
    }

    /// Binning of one observation. Depends only on the observation and the
    /// vary flags, never on parameter values.
    pub fn bin_selection(&self, params: &ParameterView, obs: &Observation) -> BinSelection {
        let layout = params.layout();
        let table = if layout.angular_tables() > 1 && obs.sensor_z > self.split_z {
            1
        } else {
            0
        };
        let shape = layout.distribution_shape();
        BinSelection {
            off_axis_angular: self.angular_response(
                params,
                table,
                obs.off_axis.incident_angle_degrees(),
            ),
            central_angular: self.angular_response(
                params,
                table,
                obs.central.incident_angle_degrees(),
            ),
            off_axis_distribution: distribution_bin(
                shape,
                obs.off_axis.source_cos_theta,
                obs.off_axis.source_phi,
            ),
            central_distribution: distribution_bin(
                shape,
                obs.central.source_cos_theta,
                obs.central.source_phi,
            ),
            run: obs.run_index,
        }
    }

    /// Picks the angular-response bin for an incident angle in degrees and the
    /// raised-cosine weight towards the next bin. Interpolation only happens
    /// when both bins vary; angles at or below the bin centre use the bin
    /// alone.
    pub fn angular_response(
        &self,
        params: &ParameterView,
        table: usize,
        angle_degrees: f64,
    ) -> AngularSelection {
        let layout = params.layout();
        let bins = layout.angular_bins();
        let width = 90.0 / bins as f64;
        let bin = bin_of(angle_degrees / 90.0, bins);
        let alone = AngularSelection {
            table,
            bin,
            partner: None,
            fraction: 0.0,
        };

        let next = bin + 1;
        if next >= bins
            || !params.is_varying(layout.angular_bin(table, bin))
            || !params.is_varying(layout.angular_bin(table, next))
        {
            return alone;
        }

        let centre = (bin as f64 + 0.5) * width;
        let x = ((angle_degrees - centre) * self.slope / width).clamp(0.0, 1.0);
        let fraction = raised_cosine(x);
        if fraction > 0.0 {
            AngularSelection {
                partner: Some(next),
                fraction,
                ..alone
            }
        } else {
            alone
        }
    }

    fn angular_value(&self, params: &ParameterView, sel: &AngularSelection) -> f64 {
        let layout = params.layout();
        let own = params.value(layout.angular_bin(sel.table, sel.bin));
        match sel.partner {
            Some(partner) => {
                (1.0 - sel.fraction) * own
                    + sel.fraction * params.value(layout.angular_bin(sel.table, partner))
            }
            None => own,
        }
    }

    /// Source intensity before any systematic is applied.
    fn raw_intensity(&self, params: &ParameterView, geometry: &RunGeometry, bin: usize) -> f64 {
        let layout = params.layout();
        match layout.distribution_shape() {
            DistributionShape::Binned { .. } => params.value(layout.distribution_parameter(bin)),
            DistributionShape::Sinusoidal { .. } => {
                let parameters = layout.distribution_bin_parameters(bin);
                let amplitude = params.value(parameters.start);
                let phase = params.value(parameters.start + 1);
                1.0 + amplitude * (wrap_phi(geometry.source_phi) + phase).sin()
            }
        }
    }

    fn intensity_power(&self) -> f64 {
        match self.systematic {
            Systematic::DistributionSquared => 2.0,
            _ => 1.0,
        }
    }

    fn mask_value(&self, params: &ParameterView, cos_theta: f64) -> f64 {
        if let Systematic::FlatMask = self.systematic {
            return 1.0;
        }
        let layout = params.layout();
        let x = 1.0 + cos_theta;
        // Horner's rule from the highest coefficient down.
        (0..layout.mask_coefficients())
            .rev()
            .fold(0.0, |acc, k| acc * x + params.value(layout.mask_coefficient(k)))
    }

    /// Path length differences (inner, shell, fluid), off-axis minus central.
    fn path_differences(&self, obs: &Observation) -> [f64; 3] {
        [
            self.systematic.inner_path(obs.off_axis.inner_path)
                - self.systematic.inner_path(obs.central.inner_path),
            obs.off_axis.outer_shell_path - obs.central.outer_shell_path,
            obs.off_axis.outer_fluid_path - obs.central.outer_fluid_path,
        ]
    }

    /// Effective coefficients (inner, shell, fluid); the inner coefficient
    /// stands in for the fluid under a shared medium.
    fn extinctions(&self, params: &ParameterView) -> [f64; 3] {
        let layout = params.layout();
        let inner = params.value(layout.inner_extinction());
        let fluid = if self.shared_medium {
            inner
        } else {
            params.value(layout.outer_fluid_extinction())
        };
        [inner, params.value(layout.outer_shell_extinction()), fluid]
    }

    /// Predicted occupancy ratio, with `d ratio / d p` written into
    /// `derivatives` when requested. Derivatives are written for every
    /// parameter the observation depends on, fixed or not; callers intersect
    /// with the active subset.
    pub fn evaluate(
        &self,
        params: &ParameterView,
        obs: &Observation,
        derivatives: Option<&mut DerivativeBuffer>,
    ) -> Result<Evaluation, StoreError> {
        let layout = params.layout();
        let bins = self.bin_selection(params, obs);

        let run_index =
            layout
                .run_normalization(obs.run_index)
                .ok_or(StoreError::RunIndexOutOfRange {
                    run: obs.run_index,
                    available: layout.run_count(),
                })?;
        let norm_off = params.value(run_index);
        let norm_ctr = obs.central.intensity_norm;

        let angular_off = self.angular_value(params, &bins.off_axis_angular);
        let angular_ctr = self.angular_value(params, &bins.central_angular);

        let power = self.intensity_power();
        let raw_off = self.raw_intensity(params, &obs.off_axis, bins.off_axis_distribution);
        let raw_ctr = self.raw_intensity(params, &obs.central, bins.central_distribution);

        let mask_off = self.mask_value(params, obs.off_axis.source_cos_theta);
        let mask_ctr = self.mask_value(params, obs.central.source_cos_theta);

        let dd = self.path_differences(obs);
        let mu = self.extinctions(params);
        let attenuation = (-(dd[0] * mu[0] + dd[1] * mu[1] + dd[2] * mu[2])).exp();

        let ratio = (norm_off / norm_ctr)
            * (angular_off / angular_ctr)
            * (raw_off.powf(power) * mask_off)
            / (raw_ctr.powf(power) * mask_ctr)
            * attenuation;

        if let Some(buffer) = derivatives {
            buffer.clear();

            // --- Extinction ---
            if self.shared_medium {
                buffer.add(layout.inner_extinction(), -(dd[0] + dd[2]));
            } else {
                buffer.add(layout.inner_extinction(), -dd[0]);
                buffer.add(layout.outer_fluid_extinction(), -dd[2]);
            }
            buffer.add(layout.outer_shell_extinction(), -dd[1]);

            // --- Angular response ---
            for (sel, value, sign) in [
                (&bins.off_axis_angular, angular_off, 1.0),
                (&bins.central_angular, angular_ctr, -1.0),
            ] {
                buffer.add(
                    layout.angular_bin(sel.table, sel.bin),
                    sign * (1.0 - sel.fraction) / value,
                );
                if let Some(partner) = sel.partner {
                    buffer.add(
                        layout.angular_bin(sel.table, partner),
                        sign * sel.fraction / value,
                    );
                }
            }

            // --- Source distribution ---
            for (geometry, bin, raw, sign) in [
                (&obs.off_axis, bins.off_axis_distribution, raw_off, power),
                (&obs.central, bins.central_distribution, raw_ctr, -power),
            ] {
                match layout.distribution_shape() {
                    DistributionShape::Binned { .. } => {
                        buffer.add(layout.distribution_parameter(bin), sign / raw);
                    }
                    DistributionShape::Sinusoidal { .. } => {
                        let parameters = layout.distribution_bin_parameters(bin);
                        let amplitude = params.value(parameters.start);
                        let angle = wrap_phi(geometry.source_phi) + params.value(parameters.start + 1);
                        buffer.add(parameters.start, sign * angle.sin() / raw);
                        buffer.add(parameters.start + 1, sign * amplitude * angle.cos() / raw);
                    }
                }
            }

            // --- Mask ---
            if !matches!(self.systematic, Systematic::FlatMask) {
                let x_off = 1.0 + obs.off_axis.source_cos_theta;
                let x_ctr = 1.0 + obs.central.source_cos_theta;
                let (mut pow_off, mut pow_ctr) = (1.0, 1.0);
                for k in 0..layout.mask_coefficients() {
                    buffer.add(
                        layout.mask_coefficient(k),
                        pow_off / mask_off - pow_ctr / mask_ctr,
                    );
                    pow_off *= x_off;
                    pow_ctr *= x_ctr;
                }
            }

            // --- Run normalisation ---
            buffer.add(run_index, 1.0 / norm_off);

            buffer.scale(ratio);
        }

        Ok(Evaluation { ratio, bins })
    }

    /// Absolute off-axis occupancy predicted for one observation:
    /// `N * A * I * M * solid_angle * transmission * exp(-sum(d * mu))`.
    pub fn predict_occupancy(
        &self,
        params: &ParameterView,
        obs: &Observation,
    ) -> Result<f64, StoreError> {
        let layout = params.layout();
        let bins = self.bin_selection(params, obs);
        let run_index =
            layout
                .run_normalization(obs.run_index)
                .ok_or(StoreError::RunIndexOutOfRange {
                    run: obs.run_index,
                    available: layout.run_count(),
                })?;
        let geometry = &obs.off_axis;
        let mu = self.extinctions(params);
        let exponent = self.systematic.inner_path(geometry.inner_path) * mu[0]
            + geometry.outer_shell_path * mu[1]
            + geometry.outer_fluid_path * mu[2];
        let intensity = self
            .raw_intensity(params, geometry, bins.off_axis_distribution)
            .powf(self.intensity_power());
        Ok(params.value(run_index)
            * self.angular_value(params, &bins.off_axis_angular)
            * intensity
            * self.mask_value(params, geometry.source_cos_theta)
            * geometry.solid_angle
            * geometry.transmission
            * (-exponent).exp())
    }
}
