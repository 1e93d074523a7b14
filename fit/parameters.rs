//! # Parameter Store
//!
//! Owns every scalar of the optical model: current values, vary flags,
//! informational bounds and the post-fit values and errors. The store also
//! answers the question the accumulation pass asks for every observation:
//! which of the globally varying parameters does this observation touch?
//!
//! Values are held in containers of length `parameter_count() + 1`, indexed by
//! 1-based global parameter index (see [`PARAMETER_INDEX_BASE`]).

use crate::config::{ConfigError, FitConfig};
use crate::layout::{DistributionShape, PARAMETER_INDEX_BASE, ParameterGroup, ParameterLayout};
use crate::observation::Observation;
use crate::optics::{BinSelection, OpticsModel};
use crate::systematic::Systematic;
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Angular bins with centres below this angle start above unity.
const ANGULAR_RISE_LIMIT_DEGREES: f64 = 36.0;
const ANGULAR_RISE_PER_DEGREE: f64 = 0.002222;

const EXTINCTION_BOUNDS: (f64, f64) = (1.0e-9, 1.0);
const MASK_BOUNDS: (f64, f64) = (-100.0, 100.0);
const ANGULAR_BOUNDS: (f64, f64) = (1.0, 1.25);
const DISTRIBUTION_BOUNDS: (f64, f64) = (0.0, 2.0);
const RUN_NORMALIZATION_BOUNDS: (f64, f64) = (-100.0, 100.0);

const SINUSOID_AMPLITUDE_START: f64 = 0.01;
const SINUSOID_PHASE_START: f64 = 1.0;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error(
        "The active parameter subset was requested before the globally varying parameters were identified."
    )]
    NotInitialized,
    #[error("Observation refers to run index {run}, but only {available} runs are configured.")]
    RunIndexOutOfRange { run: usize, available: usize },
    #[error("Covariance matrix has shape {found:?}, expected ({expected}, {expected}).")]
    CovarianceShape {
        found: (usize, usize),
        expected: usize,
    },
    #[error("Parameters have already been finalized.")]
    AlreadyFinalized,
}

/// One named scalar of the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    /// Stable 1-based global index.
    pub index: usize,
    pub group: ParameterGroup,
    /// Number of parameters in the group this one belongs to.
    pub group_size: usize,
    pub initial_value: f64,
    /// Informational only. The solver never enforces them.
    pub bounds: (f64, f64),
    pub vary: bool,
    pub final_value: Option<f64>,
    pub final_error: Option<f64>,
}

/// Read-only view of parameter values and vary flags used while evaluating the
/// model. Trial points share the layout and flags but carry their own values.
#[derive(Debug, Clone, Copy)]
pub struct ParameterView<'a> {
    layout: &'a ParameterLayout,
    values: ArrayView1<'a, f64>,
    vary: &'a [bool],
}

impl<'a> ParameterView<'a> {
    pub fn layout(&self) -> &'a ParameterLayout {
        self.layout
    }

    pub fn value(&self, index: usize) -> f64 {
        self.values[index]
    }

    pub fn is_varying(&self, index: usize) -> bool {
        self.vary[index]
    }

    pub fn with_values(self, values: ArrayView1<'a, f64>) -> Self {
        Self { values, ..self }
    }
}

/// Maps globally varying parameters to their compacted curvature-matrix
/// positions. Built fresh at the start of every accumulation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactIndex {
    position: Vec<Option<usize>>,
    globals: Vec<usize>,
}

impl CompactIndex {
    pub fn len(&self) -> usize {
        self.globals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.globals.is_empty()
    }

    pub fn position(&self, global: usize) -> Option<usize> {
        self.position.get(global).copied().flatten()
    }

    /// Global indices in compacted order.
    pub fn globals(&self) -> &[usize] {
        &self.globals
    }

    pub fn storage_len(&self) -> usize {
        self.position.len()
    }
}

/// A varying parameter touched by one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveEntry {
    pub global: usize,
    pub local: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActiveSubset {
    entries: Vec<ActiveEntry>,
}

impl ActiveSubset {
    pub fn entries(&self) -> &[ActiveEntry] {
        &self.entries
    }

    pub fn contains(&self, global: usize) -> bool {
        self.entries.iter().any(|e| e.global == global)
    }

    fn push_unique(&mut self, global: usize, compact: &CompactIndex) {
        if let Some(local) = compact.position(global) {
            if !self.contains(global) {
                self.entries.push(ActiveEntry { global, local });
            }
        }
    }
}

/// Bins fixed by an occupancy census.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CensusReport {
    pub observations: usize,
    pub angular_bins_fixed: usize,
    pub distribution_bins_fixed: usize,
}

#[derive(Debug, Clone)]
pub struct ParameterStore {
    layout: ParameterLayout,
    parameters: Vec<Parameter>,
    values: Array1<f64>,
    vary: Vec<bool>,
    shared_medium: bool,
    base_varying: Option<Vec<usize>>,
    finalized: bool,
}

impl ParameterStore {
    /// Creates every parameter from configuration, applies the configured
    /// systematic and the anchor invariants.
    pub fn from_config(config: &FitConfig) -> Result<Self, ConfigError> {
        let layout = ParameterLayout::from_config(config)?;
        let mut parameters = Vec::with_capacity(layout.parameter_count());

        let extinction = [
            ("inner_extinction", config.extinction.inner),
            ("outer_shell_extinction", config.extinction.outer_shell),
            ("outer_fluid_extinction", config.extinction.outer_fluid),
        ];
        for (name, setup) in extinction {
            parameters.push(internal::new_parameter(
                &layout,
                parameters.len(),
                name.to_string(),
                setup.initial,
                EXTINCTION_BOUNDS,
                setup.vary,
            ));
        }

        for k in 0..layout.mask_coefficients() {
            let initial = if k == 0 {
                1.0
            } else {
                config.mask.initial.get(k - 1).copied().unwrap_or(0.0)
            };
            parameters.push(internal::new_parameter(
                &layout,
                parameters.len(),
                format!("mask_{k}"),
                initial,
                MASK_BOUNDS,
                config.mask.vary,
            ));
        }

        let bins = layout.angular_bins();
        let bin_width = 90.0 / bins as f64;
        for table in 0..layout.angular_tables() {
            for bin in 0..bins {
                let centre = (bin as f64 + 0.5) * bin_width;
                let initial = if bin > 0 && centre < ANGULAR_RISE_LIMIT_DEGREES {
                    1.0 + ANGULAR_RISE_PER_DEGREE * centre
                } else {
                    1.0
                };
                parameters.push(internal::new_parameter(
                    &layout,
                    parameters.len(),
                    format!("angular_response_t{table}_{bin}"),
                    initial,
                    ANGULAR_BOUNDS,
                    config.angular_response.vary,
                ));
            }
        }

        let shape = layout.distribution_shape();
        for bin in 0..shape.bin_count() {
            for relative in shape.parameters_of_bin(bin) {
                let (name, initial) = match shape {
                    DistributionShape::Binned { .. } => {
                        (format!("distribution_{bin}"), 1.0)
                    }
                    DistributionShape::Sinusoidal { .. } => {
                        if relative % 2 == 0 {
                            (format!("distribution_amp_{bin}"), SINUSOID_AMPLITUDE_START)
                        } else {
                            (format!("distribution_phase_{bin}"), SINUSOID_PHASE_START)
                        }
                    }
                };
                parameters.push(internal::new_parameter(
                    &layout,
                    parameters.len(),
                    name,
                    initial,
                    DISTRIBUTION_BOUNDS,
                    config.distribution.vary,
                ));
            }
        }

        for (run, run_id) in config.run_normalization.run_ids.iter().enumerate() {
            parameters.push(internal::new_parameter(
                &layout,
                parameters.len(),
                format!("run_normalization_{run}_run_{run_id}"),
                1.0,
                RUN_NORMALIZATION_BOUNDS,
                config.run_normalization.vary,
            ));
        }

        let mut values = Array1::zeros(layout.storage_len());
        let mut vary = vec![false; layout.storage_len()];
        for parameter in &parameters {
            values[parameter.index] = parameter.initial_value;
            vary[parameter.index] = parameter.vary;
        }

        let mut store = Self {
            layout,
            parameters,
            values,
            vary,
            shared_medium: config.model.shared_medium,
            base_varying: None,
            finalized: false,
        };
        if store.shared_medium {
            store.fix(store.layout.outer_fluid_extinction(), None);
        }
        store.apply_systematic(&config.fit.systematic);
        store.enforce_anchors();
        Ok(store)
    }

    /// Adjusts parameter setup for systematics that change the model's
    /// degrees of freedom.
    fn apply_systematic(&mut self, systematic: &Systematic) {
        if let Systematic::FlatMask = systematic {
            for k in 0..self.layout.mask_coefficients() {
                let value = if k == 0 { 1.0 } else { 0.0 };
                self.fix(self.layout.mask_coefficient(k), Some(value));
            }
        }
    }

    /// Anchors that never vary: the unused slot 0, mask coefficient 0 at 1.0,
    /// bin 0 of every angular table at 1.0 and distribution bin 0.
    fn enforce_anchors(&mut self) {
        self.values[0] = 0.0;
        self.vary[0] = false;
        self.fix(self.layout.mask_coefficient(0), Some(1.0));
        for table in 0..self.layout.angular_tables() {
            self.fix(self.layout.angular_bin(table, 0), Some(1.0));
        }
        for index in self.layout.distribution_bin_parameters(0) {
            self.fix(index, None);
        }
    }

    fn fix(&mut self, index: usize, value: Option<f64>) {
        self.vary[index] = false;
        if let Some(value) = value {
            self.values[index] = value;
        }
        if let Some(parameter) = self.parameters.get_mut(index - PARAMETER_INDEX_BASE) {
            parameter.vary = false;
        }
    }

    pub fn layout(&self) -> &ParameterLayout {
        &self.layout
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    pub fn parameter(&self, index: usize) -> Option<&Parameter> {
        index
            .checked_sub(PARAMETER_INDEX_BASE)
            .and_then(|position| self.parameters.get(position))
    }

    pub fn values(&self) -> ArrayView1<'_, f64> {
        self.values.view()
    }

    pub fn value(&self, index: usize) -> f64 {
        self.values[index]
    }

    pub fn is_varying(&self, index: usize) -> bool {
        self.vary[index]
    }

    pub fn vary_mask(&self) -> &[bool] {
        &self.vary
    }

    pub fn varying_count(&self) -> usize {
        self.vary.iter().filter(|&&v| v).count()
    }

    pub fn view(&self) -> ParameterView<'_> {
        ParameterView {
            layout: &self.layout,
            values: self.values.view(),
            vary: &self.vary,
        }
    }

    /// Overwrites the current value vector, e.g. after an accepted step.
    pub fn assign_values(&mut self, values: ArrayView1<f64>) {
        self.values.assign(&values);
        self.values[0] = 0.0;
    }

    /// Compacted positions of the currently varying parameters.
    pub fn compact_index(&self) -> CompactIndex {
        let mut position = vec![None; self.vary.len()];
        let mut globals = Vec::new();
        for (global, &varies) in self.vary.iter().enumerate() {
            if varies {
                position[global] = Some(globals.len());
                globals.push(global);
            }
        }
        CompactIndex { position, globals }
    }

    /// Fails if any valid observation refers to a run without a normalisation.
    pub fn check_observations(&self, observations: &[Observation]) -> Result<(), StoreError> {
        let available = self.layout.run_count();
        match observations
            .iter()
            .find(|obs| obs.valid && obs.run_index >= available)
        {
            Some(obs) => Err(StoreError::RunIndexOutOfRange {
                run: obs.run_index,
                available,
            }),
            None => Ok(()),
        }
    }

    /// Counts how many valid observations touch each angular-response and
    /// distribution bin, then fixes every bin that is empty, below its
    /// minimum, or the anchor bin 0. Fixed angular bins return to 1.0;
    /// distribution bins keep their value. Run normalisations are untouched
    /// and no fixed parameter is ever released.
    pub fn census_and_fix(
        &mut self,
        model: &OpticsModel,
        observations: &[Observation],
        min_angular_entries: usize,
        min_distribution_entries: usize,
    ) -> CensusReport {
        let bins = self.layout.angular_bins();
        let mut angular_counts = vec![0usize; bins * self.layout.angular_tables()];
        let mut distribution_counts = vec![0usize; self.layout.distribution_shape().bin_count()];
        let mut report = CensusReport::default();

        for obs in observations.iter().filter(|obs| obs.valid) {
            let selection = model.bin_selection(&self.view(), obs);
            report.observations += 1;

            let off = &selection.off_axis_angular;
            let ctr = &selection.central_angular;
            angular_counts[off.table * bins + off.bin] += 1;
            if (ctr.table, ctr.bin) != (off.table, off.bin) {
                angular_counts[ctr.table * bins + ctr.bin] += 1;
            }

            distribution_counts[selection.off_axis_distribution] += 1;
            if selection.central_distribution != selection.off_axis_distribution {
                distribution_counts[selection.central_distribution] += 1;
            }
        }

        let too_few = |count: usize, minimum: usize| count == 0 || count < minimum;

        for (slot, &count) in angular_counts.iter().enumerate() {
            let (table, bin) = (slot / bins, slot % bins);
            if bin == 0 || too_few(count, min_angular_entries) {
                let index = self.layout.angular_bin(table, bin);
                if self.vary[index] {
                    report.angular_bins_fixed += 1;
                }
                self.fix(index, Some(1.0));
            }
        }

        for (bin, &count) in distribution_counts.iter().enumerate() {
            if bin == 0 || too_few(count, min_distribution_entries) {
                let mut newly_fixed = false;
                for index in self.layout.distribution_bin_parameters(bin) {
                    newly_fixed |= self.vary[index];
                    self.fix(index, None);
                }
                if newly_fixed {
                    report.distribution_bins_fixed += 1;
                }
            }
        }

        self.enforce_anchors();
        log::info!(
            "Bin census over {} observations: fixed {} angular-response bins (minimum {}) and {} distribution bins (minimum {})",
            report.observations,
            report.angular_bins_fixed,
            min_angular_entries,
            report.distribution_bins_fixed,
            min_distribution_entries
        );
        report
    }

    /// Sets the normalisation of every run seen in the data to the off-axis
    /// baseline intensity carried by its first valid observation. Vary flags
    /// stay as configured and unseen runs are left alone.
    pub fn initialize_run_normalizations(
        &mut self,
        observations: &[Observation],
    ) -> Result<usize, StoreError> {
        self.check_observations(observations)?;
        let mut seen = vec![false; self.layout.run_count()];
        for obs in observations.iter().filter(|obs| obs.valid) {
            if seen[obs.run_index] {
                continue;
            }
            seen[obs.run_index] = true;
            if let Some(index) = self.layout.run_normalization(obs.run_index) {
                self.values[index] = obs.off_axis.intensity_norm;
            }
        }
        let initialised = seen.iter().filter(|&&s| s).count();
        log::debug!(
            "Initialised {initialised} of {} run normalisations",
            seen.len()
        );
        Ok(initialised)
    }

    /// Records the extinction and mask parameters that vary for every
    /// observation.
    pub fn identify_globally_varying_parameters(&mut self) -> &[usize] {
        let base: Vec<usize> = self
            .layout
            .range(ParameterGroup::Extinction)
            .chain(self.layout.range(ParameterGroup::Mask))
            .filter(|&index| self.vary[index])
            .collect();
        log::debug!("{} base parameters vary for every observation", base.len());
        self.base_varying.insert(base)
    }

    /// The varying parameters touched by one observation, given the bins its
    /// evaluation selected.
    pub fn active_subset_for(
        &self,
        selection: &BinSelection,
        compact: &CompactIndex,
    ) -> Result<ActiveSubset, StoreError> {
        let mut subset = ActiveSubset::default();
        self.fill_active_subset(selection, compact, &mut subset)?;
        Ok(subset)
    }

    /// Allocation-free form of [`Self::active_subset_for`] for the hot loop.
    pub fn fill_active_subset(
        &self,
        selection: &BinSelection,
        compact: &CompactIndex,
        subset: &mut ActiveSubset,
    ) -> Result<(), StoreError> {
        let base = self.base_varying.as_ref().ok_or(StoreError::NotInitialized)?;
        subset.entries.clear();
        for &global in base {
            subset.push_unique(global, compact);
        }
        for (table, bin) in selection.angular_bins() {
            subset.push_unique(self.layout.angular_bin(table, bin), compact);
        }
        for bin in selection.distribution_bins() {
            for global in self.layout.distribution_bin_parameters(bin) {
                subset.push_unique(global, compact);
            }
        }
        if let Some(global) = self.layout.run_normalization(selection.run) {
            subset.push_unique(global, compact);
        }
        Ok(())
    }

    /// Writes the final values and the square roots of the covariance
    /// diagonal back into every parameter. The covariance must be expanded
    /// to the full `(n + 1) x (n + 1)` parameter space.
    pub fn finalize(&mut self, covariance: &Array2<f64>) -> Result<(), StoreError> {
        if self.finalized {
            return Err(StoreError::AlreadyFinalized);
        }
        let expected = self.layout.storage_len();
        if covariance.dim() != (expected, expected) {
            return Err(StoreError::CovarianceShape {
                found: covariance.dim(),
                expected,
            });
        }
        for parameter in &mut self.parameters {
            let index = parameter.index;
            let variance = covariance[[index, index]];
            parameter.vary = self.vary[index];
            parameter.final_value = Some(self.values[index]);
            parameter.final_error = Some(if variance > 0.0 { variance.sqrt() } else { 0.0 });
        }
        self.finalized = true;
        Ok(())
    }
}

mod internal {
    use super::*;

    pub(super) fn new_parameter(
        layout: &ParameterLayout,
        position: usize,
        name: String,
        initial_value: f64,
        bounds: (f64, f64),
        vary: bool,
    ) -> Parameter {
        let index = position + PARAMETER_INDEX_BASE;
        let group = layout
            .group_of(index)
            .unwrap_or(ParameterGroup::RunNormalization);
        Parameter {
            name,
            index,
            group,
            group_size: layout.range(group).len(),
            initial_value,
            bounds,
            vary,
            final_value: None,
            final_error: None,
        }
    }
}
