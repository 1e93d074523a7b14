use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use ndarray::{Array1, Array2};
use ocafit::chisquare::accumulate;
use ocafit::config::FitConfig;
use ocafit::linalg::gauss_jordan_solve;
use ocafit::observation::{Observation, RunGeometry};
use ocafit::optics::OpticsModel;
use ocafit::parameters::ParameterStore;
use rand::distributions::Standard;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn bench_config() -> FitConfig {
    FitConfig::from_toml_str(
        r#"
        [angular_response]
        bins = 90

        [distribution]
        kind = "binned"

        [run_normalization]
        run_ids = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19]
        "#,
    )
    .expect("benchmark configuration")
}

fn random_observations(n: usize, runs: usize) -> Vec<Observation> {
    let mut rng = StdRng::seed_from_u64(0x0CA_F17 + n as u64);
    let geometry = |rng: &mut StdRng| RunGeometry {
        inner_path: rng.gen_range(500.0..12000.0),
        outer_shell_path: rng.gen_range(50.0..60.0),
        outer_fluid_path: rng.gen_range(100.0..3000.0),
        cos_incident: rng.gen_range(0.0..1.0),
        source_cos_theta: rng.gen_range(-1.0..1.0),
        source_phi: rng.gen_range(-3.1..3.1),
        ..RunGeometry::default()
    };
    (0..n)
        .map(|i| Observation {
            run_index: i % runs,
            sensor_z: 0.0,
            occupancy_ratio: rng.gen_range(0.8..1.2),
            occupancy_ratio_error: 0.02,
            pmt_variability: -1.0,
            off_axis: geometry(&mut rng),
            central: geometry(&mut rng),
            valid: true,
        })
        .collect()
}

fn benchmark_accumulation(c: &mut Criterion) {
    let config = bench_config();
    let model = OpticsModel::from_config(&config).expect("model");
    let mut store = ParameterStore::from_config(&config).expect("store");
    store.identify_globally_varying_parameters();

    let mut group = c.benchmark_group("accumulation");
    group.sample_size(20);
    for n in [10_000_usize, 100_000] {
        let observations = random_observations(n, config.run_normalization.run_ids.len());
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::new("pass", n), &observations, |b, input| {
            b.iter(|| {
                let acc = accumulate(&model, &store, store.values(), black_box(input))
                    .expect("accumulation");
                black_box(acc.chi_square);
            });
        });
    }
    group.finish();
}

fn benchmark_solve(c: &mut Criterion) {
    let mut group = c.benchmark_group("gauss_jordan");
    for size in [50_usize, 200, 600] {
        let mut rng = StdRng::seed_from_u64(0x5EED_F64 + size as u64);
        let g = Array2::from_shape_fn((size, size), |_| rng.sample::<f64, _>(Standard));
        let spd = g.t().dot(&g) + Array2::<f64>::eye(size);
        let rhs = Array1::<f64>::ones(size);
        group.throughput(Throughput::Elements((size * size) as u64));
        group.bench_with_input(BenchmarkId::new("solve", size), &spd, |b, input| {
            b.iter(|| {
                let mut a = input.clone();
                let mut x = rhs.clone();
                black_box(gauss_jordan_solve(&mut a, &mut x));
            });
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_accumulation, benchmark_solve);
criterion_main!(benches);
