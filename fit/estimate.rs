//! # Fit Orchestration
//!
//! Drives a complete fit from a configuration and a set of observations:
//!
//! 1.  Build the parameter store and the optics model from configuration.
//! 2.  Fix sparsely populated bins (census) and seed the run normalisations.
//! 3.  Identify the parameters that vary for every observation.
//! 4.  Run the damped least-squares loop to convergence and finalise.
//! 5.  Write final values and errors into the store, annotate every
//!     observation with its prediction and summarise the residuals.

use crate::chisquare::{ResidualSummary, annotate, residual_summary};
use crate::config::{ConfigError, FitConfig};
use crate::layout::ParameterGroup;
use crate::linalg::{LinalgError, SolveStatus};
use crate::marquardt::{FitEngine, FitStatus, IterationRecord};
use crate::observation::{Observation, ObservationFit};
use crate::optics::OpticsModel;
use crate::parameters::{CensusReport, ParameterStore, StoreError};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FitError {
    #[error("Parameter store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Linear algebra error: {0}")]
    Linalg(#[from] LinalgError),

    #[error("The fit has already been finalized; no further iterations are possible.")]
    AlreadyFinalized,

    #[error(
        "No parameter is free to vary after the bin census over {observations} valid observations. Check the vary flags and the minimum bin entries."
    )]
    NoVaryingParameters { observations: usize },
}

/// Summary of a finished fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitReport {
    pub chi_square: f64,
    /// Valid observations.
    pub n_observations: usize,
    pub n_varying: usize,
    /// `chi_square / (n_observations - n_varying)`, NaN without degrees of freedom.
    pub reduced_chi_square: f64,
    pub iterations: usize,
    pub lambda: f64,
    pub status: FitStatus,
    pub covariance_status: SolveStatus,
    pub census: CensusSummary,
    pub residuals: ResidualSummary,
}

/// Serialisable copy of a [`CensusReport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CensusSummary {
    pub angular_bins_fixed: usize,
    pub distribution_bins_fixed: usize,
}

impl From<CensusReport> for CensusSummary {
    fn from(report: CensusReport) -> Self {
        Self {
            angular_bins_fixed: report.angular_bins_fixed,
            distribution_bins_fixed: report.distribution_bins_fixed,
        }
    }
}

/// Everything a finished fit produces.
#[derive(Debug, Clone)]
pub struct FittedOptics {
    /// Finalized store: every parameter carries its final value and error.
    pub store: ParameterStore,
    pub model: OpticsModel,
    /// Expanded covariance, indexed by global parameter index.
    pub covariance: Array2<f64>,
    pub report: FitReport,
    /// One entry per input observation, in input order.
    pub annotations: Vec<ObservationFit>,
}

pub fn fit_optics_model(
    config: &FitConfig,
    observations: &[Observation],
) -> Result<FittedOptics, FitError> {
    fit_optics_model_with_progress(config, observations, |_| {})
}

/// [`fit_optics_model`] with a callback invoked after every iteration.
pub fn fit_optics_model_with_progress<F>(
    config: &FitConfig,
    observations: &[Observation],
    progress: F,
) -> Result<FittedOptics, FitError>
where
    F: FnMut(&IterationRecord),
{
    let n_observations = observations.iter().filter(|obs| obs.valid).count();
    log::info!(
        "Starting optics fit ({} systematic): {} observations, {} valid.",
        config.fit.systematic.name(),
        observations.len(),
        n_observations
    );

    // 1. Parameters and model from configuration.
    let mut store = ParameterStore::from_config(config)?;
    let model = OpticsModel::from_config(config)?;
    store.check_observations(observations)?;
    log_layout_info(&store);

    // 2. Census and run normalisations.
    let census = store.census_and_fix(
        &model,
        observations,
        config.angular_response.min_bin_entries,
        config.distribution.min_bin_entries,
    );
    store.initialize_run_normalizations(observations)?;

    // 3. Base parameters.
    store.identify_globally_varying_parameters();
    let n_varying = store.varying_count();
    if n_varying == 0 {
        return Err(FitError::NoVaryingParameters {
            observations: census.observations,
        });
    }

    // 4. Minimise and finalise.
    let mut engine = FitEngine::initialize(&store, &model, observations)?;
    let outcome = engine.run_with_progress(
        &mut store,
        config.fit.max_iterations,
        config.fit.tolerance,
        config.fit.min_good_iterations,
        progress,
    )?;

    // 5. Final values, annotations and report.
    store.finalize(&outcome.covariance)?;
    let annotations = annotate(&model, &store, observations)?;
    let residuals = residual_summary(&annotations);

    let dof = n_observations as f64 - n_varying as f64;
    let report = FitReport {
        chi_square: outcome.chi_square,
        n_observations,
        n_varying,
        reduced_chi_square: if dof > 0.0 {
            outcome.chi_square / dof
        } else {
            f64::NAN
        },
        iterations: outcome.iterations,
        lambda: outcome.lambda,
        status: outcome.status,
        covariance_status: outcome.covariance_status,
        census: census.into(),
        residuals,
    };
    log::info!(
        "Fit finished with status {:?} after {} iterations: chi-square {:.4}, reduced {:.4}, pull mean {:.3} and spread {:.3}.",
        report.status,
        report.iterations,
        report.chi_square,
        report.reduced_chi_square,
        residuals.mean,
        residuals.std_dev
    );

    Ok(FittedOptics {
        store,
        model,
        covariance: outcome.covariance,
        report,
        annotations,
    })
}

fn log_layout_info(store: &ParameterStore) {
    let layout = store.layout();
    for group in ParameterGroup::ALL {
        let range = layout.range(group);
        let varying = range.clone().filter(|&i| store.is_varying(i)).count();
        log::debug!(
            "  {:?}: indices {:?}, {} of {} varying",
            group,
            range,
            varying,
            range.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation::RunGeometry;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::{Distribution, Normal};

    const TRUE_INNER_EXTINCTION: f64 = 2.0e-3;

    fn config() -> FitConfig {
        FitConfig::from_toml_str(
            r#"
            [fit]
            tolerance = 1.0e-3

            [extinction]
            inner = { initial = 1.0e-3 }
            outer_shell = { initial = 0.0, vary = false }
            outer_fluid = { initial = 0.0, vary = false }

            [mask]
            coefficients = 1

            [angular_response]
            bins = 3
            vary = false

            [distribution]
            kind = "binned"
            cos_theta_bins = 1
            phi_bins = 1

            [run_normalization]
            run_ids = [1, 2]
            "#,
        )
        .unwrap()
    }

    /// Observations generated from a known inner extinction and run
    /// normalisations of 1.2 and 0.8.
    fn observations(n: usize, seed: u64) -> Vec<Observation> {
        let mut rng = StdRng::seed_from_u64(seed);
        let noise = Normal::new(0.0, 1.0).unwrap();
        let norms = [1.2, 0.8];
        (0..n)
            .map(|i| {
                let run_index = i % 2;
                let off_path: f64 = rng.gen_range(100.0..900.0);
                let ctr_path: f64 = rng.gen_range(400.0..600.0);
                let truth = norms[run_index] * (-(off_path - ctr_path) * TRUE_INNER_EXTINCTION).exp();
                let sigma = 0.005;
                Observation {
                    run_index,
                    sensor_z: 0.0,
                    occupancy_ratio: truth + sigma * noise.sample(&mut rng),
                    occupancy_ratio_error: sigma,
                    pmt_variability: -1.0,
                    off_axis: RunGeometry {
                        inner_path: off_path,
                        cos_incident: 1.0,
                        intensity_norm: 1.0,
                        ..RunGeometry::default()
                    },
                    central: RunGeometry {
                        inner_path: ctr_path,
                        ..RunGeometry::default()
                    },
                    valid: true,
                }
            })
            .collect()
    }

    #[test]
    fn recovers_extinction_and_normalisations() {
        let observations = observations(400, 21);
        let fitted = fit_optics_model(&config(), &observations).unwrap();
        let layout = fitted.store.layout();

        assert_eq!(fitted.report.status, FitStatus::Converged);
        assert_eq!(fitted.report.n_observations, 400);
        assert_eq!(fitted.report.n_varying, 3);
        assert_eq!(fitted.report.covariance_status, SolveStatus::Ok);

        let inner = fitted.store.parameter(layout.inner_extinction()).unwrap();
        let error = inner.final_error.unwrap();
        assert!(error > 0.0);
        assert!((inner.final_value.unwrap() - TRUE_INNER_EXTINCTION).abs() < 5.0 * error);
        for (run, norm) in [(0, 1.2), (1, 0.8)] {
            let value = fitted.store.value(layout.run_normalization(run).unwrap());
            assert_abs_diff_eq!(value, norm, epsilon = 0.01);
        }

        // About one unit of chi-square per degree of freedom.
        assert!((fitted.report.reduced_chi_square - 1.0).abs() < 0.25);
        assert!(fitted.report.residuals.mean.abs() < 0.2);
        assert_eq!(fitted.annotations.len(), observations.len());
    }

    #[test]
    fn invalid_observations_are_annotated_but_ignored() {
        let mut observations = observations(200, 22);
        observations[3].valid = false;
        observations[3].occupancy_ratio = 1.0e6;
        let fitted = fit_optics_model(&config(), &observations).unwrap();
        assert_eq!(fitted.report.n_observations, 199);
        assert!(fitted.annotations[3].prediction.is_nan());
        assert_eq!(fitted.report.residuals.finite, 199);
        assert_eq!(fitted.report.residuals.total, 200);
    }

    #[test]
    fn nothing_to_fit_is_an_error() {
        let mut config = config();
        config.extinction.inner.vary = false;
        config.run_normalization.vary = false;
        let result = fit_optics_model(&config, &observations(10, 23));
        assert!(matches!(
            result,
            Err(FitError::NoVaryingParameters { observations: 10 })
        ));
    }

    #[test]
    fn out_of_range_run_is_rejected_up_front() {
        let mut observations = observations(10, 24);
        observations[4].run_index = 7;
        assert!(matches!(
            fit_optics_model(&config(), &observations),
            Err(FitError::Store(StoreError::RunIndexOutOfRange { run: 7, .. }))
        ));
    }

    #[test]
    fn progress_sees_every_iteration() {
        let observations = observations(100, 25);
        let mut records = Vec::new();
        let fitted =
            fit_optics_model_with_progress(&config(), &observations, |r| records.push(*r)).unwrap();
        assert_eq!(records.len(), fitted.report.iterations);
        assert!(records.windows(2).all(|w| w[1].iteration == w[0].iteration + 1));
    }
}
