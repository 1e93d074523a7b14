//! # Chi-Square Accumulation
//!
//! One accumulation pass evaluates the model with derivatives for every
//! valid observation and builds the weighted curvature matrix, gradient and
//! chi-square over the compacted set of varying parameters.
//!
//! Observations are split into a fixed number of contiguous chunks that are
//! accumulated in parallel into private partial sums. The partials are then
//! added in chunk order, so a pass over the same inputs always produces the
//! same bits regardless of thread scheduling.

use crate::observation::{Observation, ObservationFit};
use crate::optics::{DerivativeBuffer, OpticsModel};
use crate::parameters::{ActiveSubset, CompactIndex, ParameterStore, StoreError};
use ndarray::{Array1, Array2, ArrayView1};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Upper bound on the number of partial accumulators per pass.
const MAX_PARTIALS: usize = 16;
/// Smallest chunk worth handing to a separate worker.
const MIN_CHUNK: usize = 256;

/// Result of one accumulation pass.
#[derive(Debug, Clone)]
pub struct Accumulation {
    /// Symmetric `m x m` curvature matrix over the compacted varying parameters.
    pub curvature: Array2<f64>,
    pub gradient: Array1<f64>,
    pub chi_square: f64,
    /// Observations that contributed.
    pub used: usize,
    /// Valid observations skipped for a non-positive error or a non-finite
    /// prediction or derivative.
    pub skipped: usize,
    pub compact: CompactIndex,
}

struct Partial {
    curvature: Array2<f64>,
    gradient: Array1<f64>,
    chi_square: f64,
    used: usize,
    skipped: usize,
}

impl Partial {
    fn zeros(m: usize) -> Self {
        Self {
            curvature: Array2::zeros((m, m)),
            gradient: Array1::zeros(m),
            chi_square: 0.0,
            used: 0,
            skipped: 0,
        }
    }

    fn merge(&mut self, other: &Partial) {
        self.curvature += &other.curvature;
        self.gradient += &other.gradient;
        self.chi_square += other.chi_square;
        self.used += other.used;
        self.skipped += other.skipped;
    }
}

/// Runs one accumulation pass with the parameter values `values`, which share
/// the store's layout and vary flags.
pub fn accumulate<'a>(
    model: &OpticsModel,
    store: &'a ParameterStore,
    values: ArrayView1<'a, f64>,
    observations: &[Observation],
) -> Result<Accumulation, StoreError> {
    let compact = store.compact_index();
    let m = compact.len();
    let view = store.view().with_values(values);

    let chunk_size = observations
        .len()
        .div_ceil(MAX_PARTIALS)
        .max(MIN_CHUNK);

    let partials = observations
        .par_chunks(chunk_size)
        .map(|chunk| -> Result<Partial, StoreError> {
            let mut partial = Partial::zeros(m);
            let mut derivatives = DerivativeBuffer::new(compact.storage_len());
            let mut subset = ActiveSubset::default();

            for obs in chunk.iter().filter(|obs| obs.valid) {
                let evaluation = model.evaluate(&view, obs, Some(&mut derivatives))?;
                store.fill_active_subset(&evaluation.bins, &compact, &mut subset)?;

                let variance = obs.total_variance();
                let entries = subset.entries();
                let finite = evaluation.ratio.is_finite()
                    && entries.iter().all(|e| derivatives.get(e.global).is_finite());
                if !(variance > 0.0 && variance.is_finite()) || !finite {
                    partial.skipped += 1;
                    continue;
                }

                let weight = 1.0 / variance;
                let delta = obs.occupancy_ratio - evaluation.ratio;

                // Upper triangle only; mirrored once after the pass.
                for (a, ea) in entries.iter().enumerate() {
                    let weighted = weight * derivatives.get(ea.global);
                    partial.gradient[ea.local] += weighted * delta;
                    for eb in &entries[..=a] {
                        let (row, col) = if ea.local <= eb.local {
                            (ea.local, eb.local)
                        } else {
                            (eb.local, ea.local)
                        };
                        partial.curvature[[row, col]] += weighted * derivatives.get(eb.global);
                    }
                }
                partial.chi_square += weight * delta * delta;
                partial.used += 1;
            }
            Ok(partial)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut total = Partial::zeros(m);
    for partial in &partials {
        total.merge(partial);
    }
    mirror_upper_triangle(&mut total.curvature);

    if total.skipped > 0 {
        log::debug!(
            "Accumulation skipped {} observations with unusable errors or non-finite predictions",
            total.skipped
        );
    }

    Ok(Accumulation {
        curvature: total.curvature,
        gradient: total.gradient,
        chi_square: total.chi_square,
        used: total.used,
        skipped: total.skipped,
        compact,
    })
}

/// Copies the upper triangle onto the lower triangle.
pub fn mirror_upper_triangle(matrix: &mut Array2<f64>) {
    let n = matrix.nrows();
    for row in 0..n {
        for col in row + 1..n {
            matrix[[col, row]] = matrix[[row, col]];
        }
    }
}

/// Model prediction and residual of every observation at the store's current
/// values. Invalid observations are annotated with NaN.
pub fn annotate(
    model: &OpticsModel,
    store: &ParameterStore,
    observations: &[Observation],
) -> Result<Vec<ObservationFit>, StoreError> {
    let view = store.view();
    observations
        .par_iter()
        .map(|obs| {
            if !obs.valid {
                return Ok(ObservationFit {
                    prediction: f64::NAN,
                    residual: f64::NAN,
                    pull: f64::NAN,
                    chi_square: f64::NAN,
                    predicted_occupancy: f64::NAN,
                });
            }
            let prediction = model.evaluate(&view, obs, None)?.ratio;
            let residual = obs.occupancy_ratio - prediction;
            let pull = residual / obs.total_variance().sqrt();
            Ok(ObservationFit {
                prediction,
                residual,
                pull,
                chi_square: pull * pull,
                predicted_occupancy: model.predict_occupancy(&view, obs)?,
            })
        })
        .collect()
}

/// Mean and spread of the pulls, ignoring NaN and infinite values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResidualSummary {
    pub mean: f64,
    pub std_dev: f64,
    /// Pulls that entered the statistics.
    pub finite: usize,
    pub total: usize,
}

pub fn residual_summary(fits: &[ObservationFit]) -> ResidualSummary {
    let pulls: Vec<f64> = fits
        .iter()
        .map(|fit| fit.pull)
        .filter(|pull| pull.is_finite())
        .collect();
    let finite = pulls.len();
    if finite == 0 {
        return ResidualSummary {
            mean: f64::NAN,
            std_dev: f64::NAN,
            finite,
            total: fits.len(),
        };
    }
    let mean = pulls.iter().sum::<f64>() / finite as f64;
    let variance = pulls.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / finite as f64;
    ResidualSummary {
        mean,
        std_dev: variance.sqrt(),
        finite,
        total: fits.len(),
    }
}
