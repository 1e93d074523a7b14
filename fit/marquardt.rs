//! # Fit Engine
//!
//! Levenberg-Marquardt minimisation of the weighted chi-square, run as a small
//! state machine:
//!
//! - `Init` records the baseline chi-square and curvature at the starting
//!   parameters and sets the damping to 0.001. No step is taken.
//! - `Iterate` solves the damped normal equations, evaluates the trial point
//!   and either accepts it (damping /10) or rejects it (damping x10).
//! - `Finalized` sets the damping to 0, accumulates once more at the best
//!   parameters and inverts the curvature into the covariance matrix.
//!
//! The engine keeps its own copy of the best-known values and writes them back
//! into the [`ParameterStore`] whenever a step is accepted.

use crate::chisquare::{Accumulation, accumulate};
use crate::estimate::FitError;
use crate::linalg::{SolveStatus, covariance_expand, solve_curvature};
use crate::observation::Observation;
use crate::optics::OpticsModel;
use crate::parameters::ParameterStore;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

/// Damping applied after INIT.
pub const INITIAL_LAMBDA: f64 = 0.001;
const LAMBDA_DECREASE: f64 = 0.1;
const LAMBDA_INCREASE: f64 = 10.0;

/// INIT happens inside [`FitEngine::initialize`], so a constructed engine is
/// always ready to iterate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Iterate,
    Finalized,
}

/// Terminal status of a complete fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitStatus {
    Converged,
    MaxIterations,
    SingularExactZero,
    SingularNegative,
}

impl FitStatus {
    fn from_solve(status: SolveStatus, converged: bool) -> Self {
        match status {
            SolveStatus::SingularExactZero => FitStatus::SingularExactZero,
            SolveStatus::SingularNegative => FitStatus::SingularNegative,
            SolveStatus::Ok if converged => FitStatus::Converged,
            SolveStatus::Ok => FitStatus::MaxIterations,
        }
    }
}

/// One ITERATE step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterationRecord {
    pub iteration: usize,
    /// Damping used to build the step.
    pub lambda: f64,
    /// Best chi-square before the step.
    pub chi_square: f64,
    /// NaN when the solve failed and no trial point was evaluated.
    pub trial_chi_square: f64,
    pub accepted: bool,
    pub status: SolveStatus,
}

/// Output of FINALIZE.
#[derive(Debug, Clone)]
pub struct Finalization {
    pub chi_square: f64,
    /// Covariance expanded to the full `(n + 1) x (n + 1)` parameter space.
    /// All zeros when the curvature matrix could not be inverted.
    pub covariance: Array2<f64>,
    pub status: SolveStatus,
}

#[derive(Debug, Clone)]
pub struct FitOutcome {
    pub chi_square: f64,
    pub status: FitStatus,
    /// Status of the covariance inversion in FINALIZE.
    pub covariance_status: SolveStatus,
    pub iterations: usize,
    /// Damping left by the last ITERATE step, before FINALIZE clears it.
    pub lambda: f64,
    pub covariance: Array2<f64>,
}

pub struct FitEngine<'a> {
    model: &'a OpticsModel,
    observations: &'a [Observation],
    best: Array1<f64>,
    current: Accumulation,
    lambda: f64,
    state: EngineState,
    history: Vec<IterationRecord>,
}

impl<'a> FitEngine<'a> {
    /// INIT: one accumulation pass at the store's current values.
    pub fn initialize(
        store: &ParameterStore,
        model: &'a OpticsModel,
        observations: &'a [Observation],
    ) -> Result<Self, FitError> {
        let best = store.values().to_owned();
        let current = accumulate(model, store, best.view(), observations)?;
        log::info!(
            "Fit initialised: {} varying parameters, {} observations used, baseline chi-square {:.6}",
            current.compact.len(),
            current.used,
            current.chi_square
        );
        Ok(Self {
            model,
            observations,
            best,
            current,
            lambda: INITIAL_LAMBDA,
            state: EngineState::Iterate,
            history: Vec::new(),
        })
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    /// Chi-square at the best-known parameters.
    pub fn chi_square(&self) -> f64 {
        self.current.chi_square
    }

    pub fn best_values(&self) -> &Array1<f64> {
        &self.best
    }

    pub fn history(&self) -> &[IterationRecord] {
        &self.history
    }

    /// ITERATE: one damped step. Singular systems leave the parameters and the
    /// damping untouched and are reported through the returned status.
    pub fn iterate(&mut self, store: &mut ParameterStore) -> Result<SolveStatus, FitError> {
        if self.state == EngineState::Finalized {
            return Err(FitError::AlreadyFinalized);
        }

        let mut damped = self.current.curvature.clone();
        damped.diag_mut().mapv_inplace(|d| d * (1.0 + self.lambda));
        let mut step = self.current.gradient.clone();

        let mut record = IterationRecord {
            iteration: self.history.len() + 1,
            lambda: self.lambda,
            chi_square: self.current.chi_square,
            trial_chi_square: f64::NAN,
            accepted: false,
            status: solve_curvature(&mut damped, &mut step),
        };
        if record.status != SolveStatus::Ok {
            log_singular(record.status, "iterate");
            self.history.push(record);
            return Ok(record.status);
        }

        let mut trial = self.best.clone();
        for (local, &global) in self.current.compact.globals().iter().enumerate() {
            trial[global] += step[local];
        }
        let trial_pass = accumulate(self.model, store, trial.view(), self.observations)?;
        record.trial_chi_square = trial_pass.chi_square;

        if improves(&trial_pass, &self.current) {
            record.accepted = true;
            self.lambda *= LAMBDA_DECREASE;
            self.best = trial;
            self.current = trial_pass;
            store.assign_values(self.best.view());
        } else {
            self.lambda *= LAMBDA_INCREASE;
        }

        log::debug!(
            "Iteration {}: lambda {:.3e}, chi-square {:.6}, trial {:.6} ({})",
            record.iteration,
            record.lambda,
            record.chi_square,
            record.trial_chi_square,
            if record.accepted { "accepted" } else { "rejected" }
        );
        self.history.push(record);
        Ok(SolveStatus::Ok)
    }

    /// FINALIZE: undamped pass at the best parameters and covariance by
    /// inversion. Repeated calls give identical results.
    pub fn finalize(&mut self, store: &ParameterStore) -> Result<Finalization, FitError> {
        self.lambda = 0.0;
        self.state = EngineState::Finalized;

        let pass = accumulate(self.model, store, self.best.view(), self.observations)?;
        let mut inverse = pass.curvature.clone();
        let mut rhs = pass.gradient.clone();
        let status = solve_curvature(&mut inverse, &mut rhs);

        let covariance = if status == SolveStatus::Ok {
            covariance_expand(&inverse, &pass.compact)?
        } else {
            log_singular(status, "finalize");
            let n = pass.compact.storage_len();
            Array2::zeros((n, n))
        };

        log::info!(
            "Fit finalised: chi-square {:.6} over {} observations, covariance {:?}",
            pass.chi_square,
            pass.used,
            status
        );
        let chi_square = pass.chi_square;
        self.current = pass;
        Ok(Finalization {
            chi_square,
            covariance,
            status,
        })
    }

    /// The outer convergence loop followed by a single FINALIZE.
    pub fn run(
        &mut self,
        store: &mut ParameterStore,
        max_iterations: usize,
        tolerance: f64,
        min_good_iterations: usize,
    ) -> Result<FitOutcome, FitError> {
        self.run_with_progress(store, max_iterations, tolerance, min_good_iterations, |_| {})
    }

    /// [`Self::run`], reporting every ITERATE step to `progress`.
    pub fn run_with_progress<F>(
        &mut self,
        store: &mut ParameterStore,
        max_iterations: usize,
        tolerance: f64,
        min_good_iterations: usize,
        mut progress: F,
    ) -> Result<FitOutcome, FitError>
    where
        F: FnMut(&IterationRecord),
    {
        let mut status = SolveStatus::Ok;
        let mut delta = f64::INFINITY;
        let mut good = 0usize;
        let mut iterations = 0usize;

        while (delta.abs() > tolerance || good < min_good_iterations)
            && iterations < max_iterations
            && status == SolveStatus::Ok
            && self.lambda != 0.0
        {
            let previous = self.current.chi_square;
            status = self.iterate(store)?;
            iterations += 1;
            if status == SolveStatus::Ok {
                delta = previous - self.current.chi_square;
                if delta.abs() <= tolerance {
                    good += 1;
                } else {
                    good = 0;
                }
            }
            if let Some(record) = self.history.last() {
                progress(record);
            }
        }

        let converged = delta.abs() <= tolerance && good >= min_good_iterations;
        let fit_status = FitStatus::from_solve(status, converged);
        if fit_status == FitStatus::MaxIterations {
            log::warn!(
                "Fit stopped after {iterations} iterations without {min_good_iterations} consecutive chi-square changes below {tolerance}"
            );
        }

        let lambda = self.lambda;
        let finalization = self.finalize(store)?;
        Ok(FitOutcome {
            chi_square: finalization.chi_square,
            status: fit_status,
            covariance_status: finalization.status,
            iterations,
            lambda,
            covariance: finalization.covariance,
        })
    }
}

/// A trial point must explain at least as many observations as the best
/// point. Observations lost to non-finite predictions never lower the
/// chi-square.
fn improves(trial: &Accumulation, best: &Accumulation) -> bool {
    if trial.used < best.used {
        log::debug!(
            "Trial point leaves {} of {} observations unusable",
            best.used - trial.used,
            best.used
        );
        return false;
    }
    trial.chi_square < best.chi_square
}

fn log_singular(status: SolveStatus, during: &str) {
    match status {
        SolveStatus::SingularExactZero => log::warn!(
            "Singular curvature matrix during {during}: exact zero pivot. A parameter marked varying is probably not constrained by any observation."
        ),
        SolveStatus::SingularNegative => log::warn!(
            "Singular curvature matrix during {during}: negative diagonal element. There are probably too few observations for the number of varying parameters."
        ),
        SolveStatus::Ok => {}
    }
}
