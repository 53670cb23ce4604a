use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use lim_mcmc::{
    Ensemble, Evaluator, ExperimentSettings, Grid, McmcSettings, Model, ObservableKind, PriorSpec,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

fn make_evaluator(n: usize, n_realizations: usize, settings: &McmcSettings) -> Evaluator {
    let grid = Grid::new(&ExperimentSettings {
        sigma_noise: 1.,
        sigma_x: 1.5,
        sigma_y: 1.5,
        ..ExperimentSettings::cube(n, 1.)
    })
    .unwrap();
    let prior = PriorSpec::gaussian(&[[5., 3.]]).unwrap();
    let settings = McmcSettings {
        n_realizations,
        ..settings.clone()
    };
    let mut evaluator = Evaluator::new(grid, Model::WhiteNoise, prior, &settings).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    evaluator.simulate_data(&[8.3], 10, &mut rng).unwrap();
    evaluator
}

fn criterion_benchmark(c: &mut Criterion) {
    let settings = McmcSettings {
        ps_kbins: None,
        vid_tbins: None,
        observables: vec![ObservableKind::PowerSpectrum],
        ..Default::default()
    };

    for n in [16, 32] {
        let mut evaluator = make_evaluator(n, 1, &settings);
        c.bench_function(&format!("evaluate white noise {}^3", n), |b| {
            b.iter_batched(
                || ChaCha8Rng::seed_from_u64(42),
                |mut rng| evaluator.evaluate(black_box(&[8.3]), &mut rng).unwrap(),
                BatchSize::SmallInput,
            )
        });
    }

    let mut evaluator = make_evaluator(16, 10, &settings);
    c.bench_function("evaluate white noise 16^3 x 10 realizations", |b| {
        b.iter_batched(
            || ChaCha8Rng::seed_from_u64(42),
            |mut rng| evaluator.evaluate(black_box(&[8.3]), &mut rng).unwrap(),
            BatchSize::SmallInput,
        )
    });

    let ensemble_settings = McmcSettings {
        n_walkers: 32,
        ..settings.clone()
    };
    let ensemble = Ensemble::new(make_evaluator(16, 1, &ensemble_settings), &ensemble_settings);
    let positions = ensemble.initial_positions().unwrap();
    c.bench_function("ensemble step 32 walkers 16^3", |b| {
        b.iter(|| ensemble.evaluate_step(black_box(0), positions.view()).unwrap())
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
