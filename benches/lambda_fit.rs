use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use treefit::estimator::Estimator;
use treefit::fit_params::FitParams;
use treefit::particle::Particle;
use treefit::toy::{lambda_to_p_pi, random_direction, xi_to_lambda_pi, Resolution};

/// Smeared events with a random momentum between 1 and 5 GeV.
fn make_events<F>(rng: &mut StdRng, samples: usize, generate: F) -> Vec<Particle>
where
    F: Fn(&mut StdRng, Vector3<f64>) -> Particle,
{
    (0..samples)
        .map(|_| {
            let momentum = random_direction(rng) * rng.random_range(1.0..5.0);
            generate(rng, momentum)
        })
        .collect()
}

/// Lambda0 -> p pi- with a mass constraint.
fn bench_lambda(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(0x1A3BDA);
    let samples = 1_000usize;
    let params = FitParams::default();

    c.bench_function("fit/lambda_p_pi_mass_constrained", |b| {
        b.iter_batched(
            || {
                make_events(&mut rng, samples, |rng, momentum| {
                    lambda_to_p_pi(
                        rng,
                        momentum,
                        Vector3::new(0.0, 0.0, 15.0),
                        Some(Resolution::default()),
                    )
                    .unwrap()
                    .head
                    .with_mass_constraint()
                })
            },
            |events| {
                for mut head in events {
                    let mut estimator = Estimator::new(params.clone());
                    black_box(estimator.fit(black_box(&mut head)));
                }
            },
            BatchSize::LargeInput,
        )
    });
}

/// Xi- -> (Lambda0 -> p pi-) pi-, two vertices and a decay length.
fn bench_cascade(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(0xCA5CADE);
    let samples = 1_000usize;
    let params = FitParams::default();

    c.bench_function("fit/xi_lambda_pi", |b| {
        b.iter_batched(
            || {
                make_events(&mut rng, samples, |rng, momentum| {
                    xi_to_lambda_pi(rng, momentum, Vector3::zeros(), Some(Resolution::default()))
                        .unwrap()
                        .head
                })
            },
            |events| {
                for mut head in events {
                    let mut estimator = Estimator::new(params.clone());
                    black_box(estimator.fit(black_box(&mut head)));
                }
            },
            BatchSize::LargeInput,
        )
    });
}

criterion_group!(benches, bench_lambda, bench_cascade);
criterion_main!(benches);
