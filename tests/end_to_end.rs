use approx::assert_abs_diff_eq;
use ocafit::config::FitConfig;
use ocafit::data::load_observations;
use ocafit::estimate::fit_optics_model;
use ocafit::linalg::SolveStatus;
use ocafit::marquardt::{FitEngine, FitStatus};
use ocafit::observation::{Observation, RunGeometry};
use ocafit::optics::OpticsModel;
use ocafit::parameters::ParameterStore;
use ocafit::results::FitResult;
use ocafit::systematic::Systematic;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use std::io::Write;
use tempfile::{NamedTempFile, tempdir};

const RESPONSE: [(f64, f64); 3] = [(30.0, 1.05), (50.0, 1.10), (70.0, 1.15)];

fn angular_config() -> FitConfig {
    FitConfig::from_toml_str(
        r#"
        [fit]
        tolerance = 1.0e-8

        [extinction]
        inner = { initial = 0.0, vary = false }
        outer_shell = { initial = 0.0, vary = false }
        outer_fluid = { initial = 0.0, vary = false }

        [mask]
        coefficients = 3
        initial = [0.0, 0.0]
        vary = false

        [angular_response]
        bins = 4
        min_bin_entries = 1

        [distribution]
        kind = "binned"
        cos_theta_bins = 1
        phi_bins = 1
        vary = false

        [run_normalization]
        run_ids = [100]
        vary = false
        "#,
    )
    .unwrap()
}

/// One observation per free angular bin, with data at `k * N_off / N_ctr`.
fn angular_observations() -> Vec<Observation> {
    RESPONSE
        .iter()
        .map(|&(angle, k)| Observation {
            run_index: 0,
            sensor_z: 0.0,
            occupancy_ratio: k * 2.0 / 1.0,
            occupancy_ratio_error: 0.01,
            pmt_variability: -1.0,
            off_axis: RunGeometry {
                cos_incident: f64::to_radians(angle).cos(),
                intensity_norm: 2.0,
                ..RunGeometry::default()
            },
            central: RunGeometry {
                cos_incident: 1.0,
                intensity_norm: 1.0,
                ..RunGeometry::default()
            },
            valid: true,
        })
        .collect()
}

#[test]
fn census_keeps_every_observed_bin_free() {
    let config = angular_config();
    let observations = angular_observations();
    let mut store = ParameterStore::from_config(&config).unwrap();
    let model = OpticsModel::from_config(&config).unwrap();
    store.census_and_fix(&model, &observations, 1, 1);
    let layout = store.layout();
    assert!(!store.is_varying(layout.angular_bin(0, 0)));
    for bin in 1..4 {
        assert!(store.is_varying(layout.angular_bin(0, bin)), "bin {bin} was fixed");
    }
}

#[test]
fn first_iteration_lowers_chi_square() {
    let config = angular_config();
    let observations = angular_observations();
    let mut store = ParameterStore::from_config(&config).unwrap();
    let model = OpticsModel::from_config(&config).unwrap();
    store.census_and_fix(&model, &observations, 1, 1);
    store.initialize_run_normalizations(&observations).unwrap();
    store.identify_globally_varying_parameters();

    let mut engine = FitEngine::initialize(&store, &model, &observations).unwrap();
    let baseline = engine.chi_square();
    assert_eq!(engine.lambda(), 0.001);
    assert_eq!(engine.iterate(&mut store).unwrap(), SolveStatus::Ok);
    assert!(engine.chi_square() < baseline);
}

#[test]
fn full_fit_recovers_the_angular_response() {
    let observations = angular_observations();
    let fitted = fit_optics_model(&angular_config(), &observations).unwrap();
    let layout = fitted.store.layout();

    assert_eq!(fitted.report.status, FitStatus::Converged);
    assert_eq!(fitted.report.n_varying, 3);
    // Three observations for three parameters leave no degrees of freedom.
    assert!(fitted.report.reduced_chi_square.is_nan());
    for (bin, (_, k)) in RESPONSE.iter().enumerate() {
        let parameter = fitted
            .store
            .parameter(layout.angular_bin(0, bin + 1))
            .unwrap();
        assert_abs_diff_eq!(parameter.final_value.unwrap(), *k, epsilon = 1e-6);
        assert_abs_diff_eq!(parameter.final_error.unwrap(), 0.005, epsilon = 1e-6);
    }
    for fit in &fitted.annotations {
        assert_abs_diff_eq!(fit.residual, 0.0, epsilon = 1e-6);
    }
}

#[test]
fn finalize_twice_gives_identical_chi_square() {
    let config = angular_config();
    let observations = angular_observations();
    let mut store = ParameterStore::from_config(&config).unwrap();
    let model = OpticsModel::from_config(&config).unwrap();
    store.census_and_fix(&model, &observations, 1, 1);
    store.initialize_run_normalizations(&observations).unwrap();
    store.identify_globally_varying_parameters();

    let mut engine = FitEngine::initialize(&store, &model, &observations).unwrap();
    for _ in 0..3 {
        engine.iterate(&mut store).unwrap();
    }
    let first = engine.finalize(&store).unwrap();
    let second = engine.finalize(&store).unwrap();
    assert_eq!(first.chi_square, second.chi_square);
    assert_eq!(engine.lambda(), 0.0);
}

#[test]
fn unseen_run_normalisation_is_left_as_configured() {
    let mut config = angular_config();
    config.run_normalization.run_ids = vec![100, 101, 102];
    config.run_normalization.vary = true;
    let mut observations = angular_observations();
    observations[2].run_index = 2;

    let mut store = ParameterStore::from_config(&config).unwrap();
    let model = OpticsModel::from_config(&config).unwrap();
    let unseen = store.layout().run_normalization(1).unwrap();
    let before = (store.value(unseen), store.is_varying(unseen));

    store.census_and_fix(&model, &observations, 1, 1);
    store.initialize_run_normalizations(&observations).unwrap();
    assert_eq!((store.value(unseen), store.is_varying(unseen)), before);
    assert_eq!(store.value(store.layout().run_normalization(2).unwrap()), 2.0);
}

fn csv_row(obs: &Observation) -> String {
    let geometry = |g: &RunGeometry| {
        format!(
            "{},{},{},{},{},{},{},{},{}",
            g.inner_path,
            g.outer_shell_path,
            g.outer_fluid_path,
            g.solid_angle,
            g.transmission,
            g.cos_incident,
            g.source_cos_theta,
            g.source_phi,
            g.intensity_norm
        )
    };
    format!(
        "{},{},{},{},{},{},{},{}",
        obs.run_index,
        obs.sensor_z,
        obs.occupancy_ratio,
        obs.occupancy_ratio_error,
        obs.pmt_variability,
        obs.valid,
        geometry(&obs.off_axis),
        geometry(&obs.central)
    )
}

#[test]
fn fit_from_csv_and_persist_the_result() {
    const TRUE_INNER: f64 = 1.5e-3;
    const TRUE_SHELL: f64 = 8.0e-3;
    let config = FitConfig::from_toml_str(
        r#"
        [fit]
        tolerance = 1.0e-3
        systematic = { name = "source_radius", offset = 10.0 }

        [extinction]
        inner = { initial = 1.0e-3 }
        outer_shell = { initial = 1.0e-2 }
        outer_fluid = { initial = 0.0, vary = false }

        [mask]
        coefficients = 2
        vary = false

        [angular_response]
        bins = 2
        vary = false

        [distribution]
        kind = "sinusoidal"
        slices = 2
        vary = false

        [run_normalization]
        run_ids = [7, 8, 9]
        "#,
    )
    .unwrap();

    let mut rng = StdRng::seed_from_u64(99);
    let noise = Normal::new(0.0, 1.0).unwrap();
    let norms = [1.0, 1.3, 0.7];
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        "run_index,sensor_z,occupancy_ratio,occupancy_ratio_error,pmt_variability,valid,\
off_inner_path,off_outer_shell_path,off_outer_fluid_path,off_solid_angle,off_transmission,\
off_cos_incident,off_source_cos_theta,off_source_phi,off_intensity_norm,\
ctr_inner_path,ctr_outer_shell_path,ctr_outer_fluid_path,ctr_solid_angle,ctr_transmission,\
ctr_cos_incident,ctr_source_cos_theta,ctr_source_phi,ctr_intensity_norm"
    )
    .unwrap();
    for i in 0..600 {
        let run_index = i % 3;
        let off_inner: f64 = rng.gen_range(50.0..1000.0);
        let ctr_inner: f64 = rng.gen_range(300.0..700.0);
        let off_shell: f64 = rng.gen_range(1.0..60.0);
        let ctr_shell: f64 = rng.gen_range(4.0..6.0);
        let exponent = ((off_inner - 10.0) - (ctr_inner - 10.0)) * TRUE_INNER
            + (off_shell - ctr_shell) * TRUE_SHELL;
        let truth = norms[run_index] * (-exponent).exp();
        let obs = Observation {
            run_index,
            sensor_z: rng.gen_range(-5000.0..5000.0),
            occupancy_ratio: truth + 0.004 * noise.sample(&mut rng),
            occupancy_ratio_error: 0.004,
            pmt_variability: if i % 5 == 0 { 0.001 } else { -1.0 },
            off_axis: RunGeometry {
                inner_path: off_inner,
                outer_shell_path: off_shell,
                intensity_norm: 1.0,
                ..RunGeometry::default()
            },
            central: RunGeometry {
                inner_path: ctr_inner,
                outer_shell_path: ctr_shell,
                ..RunGeometry::default()
            },
            valid: true,
        };
        writeln!(file, "{}", csv_row(&obs)).unwrap();
    }
    file.flush().unwrap();

    let observations = load_observations(file.path()).unwrap();
    assert_eq!(observations.len(), 600);
    let fitted = fit_optics_model(&config, &observations).unwrap();
    assert_eq!(fitted.report.status, FitStatus::Converged);
    assert_eq!(fitted.report.n_varying, 5);

    let layout = fitted.store.layout();
    let inner = fitted.store.parameter(layout.inner_extinction()).unwrap();
    let shell = fitted.store.parameter(layout.outer_shell_extinction()).unwrap();
    assert!((inner.final_value.unwrap() - TRUE_INNER).abs() < 5.0 * inner.final_error.unwrap());
    assert!((shell.final_value.unwrap() - TRUE_SHELL).abs() < 5.0 * shell.final_error.unwrap());

    let dir = tempdir().unwrap();
    let path = dir.path().join("result.toml");
    let result = FitResult::from(&fitted);
    result.save(&path).unwrap();
    let loaded = FitResult::load(&path).unwrap();

    assert_eq!(loaded.systematic, Systematic::SourceRadius { offset: 10.0 });
    assert_eq!(loaded.report.status, FitStatus::Converged);
    assert_eq!(loaded.report.chi_square, result.report.chi_square);
    assert_eq!(loaded.parameters, result.parameters);
    assert_eq!(loaded.covariance, result.covariance);
    let correlation = loaded.correlation(layout.inner_extinction(), layout.outer_shell_extinction());
    assert!(correlation.abs() <= 1.0);
}
