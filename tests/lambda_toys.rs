mod common;

use approx::assert_relative_eq;
use nalgebra::{Vector3, Vector4};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use treefit::constants::{LAMBDA_MASS, PION_MASS, PROTON_MASS};
use treefit::estimator::{Estimator, FitStatus};
use treefit::fit_params::FitParams;
use treefit::particle::{Particle, ParticleId};
use treefit::toy::{
    exact_track, lambda_to_p_pi, random_direction, track_covariance, two_body_decay,
    xi_to_lambda_pi, Resolution, TRACK_ARC_LENGTH,
};

use crate::common::{assert_vector_close, fitted, vertex_sigma};

const N_TOYS: usize = 300;

#[test]
fn test_lambda_p_values_are_uniform() {
    let mut rng = StdRng::seed_from_u64(42);
    let mut p_values = Vec::with_capacity(N_TOYS);
    let mut within_three_sigma = 0;

    for _ in 0..N_TOYS {
        let momentum = random_direction(&mut rng) * rng.random_range(1.0..4.0);
        let vertex = Vector3::new(
            rng.random_range(-1.0..1.0),
            rng.random_range(-1.0..1.0),
            rng.random_range(5.0..30.0),
        );
        let mut event =
            lambda_to_p_pi(&mut rng, momentum, vertex, Some(Resolution::default())).unwrap();
        event.head = event.head.with_mass_constraint();

        let mut estimator = Estimator::default();
        if estimator.fit(&mut event.head) != FitStatus::Success {
            continue;
        }
        assert_eq!(estimator.ndof(), 2);
        p_values.push(event.head.summary.unwrap().p_value);

        let fit = fitted(&event.head, 0);
        let pull = (fit.vertex.unwrap() - vertex).component_div(&vertex_sigma(fit));
        if pull.amax() < 3.0 {
            within_three_sigma += 1;
        }
        assert_relative_eq!(fit.mass(), LAMBDA_MASS, epsilon = 1e-5);
    }

    let n_success = p_values.len();
    assert!(n_success as f64 > 0.95 * N_TOYS as f64, "{n_success} successful fits");
    let mean = p_values.iter().sum::<f64>() / n_success as f64;
    assert!((0.4..0.6).contains(&mean), "mean p-value {mean}");
    assert!(
        within_three_sigma as f64 > 0.9 * n_success as f64,
        "{within_three_sigma} vertices within 3 sigma"
    );
}

#[test]
fn test_cascade_decay_length_and_lifetime() {
    let mut rng = StdRng::seed_from_u64(7);
    let xi_vertex = Vector3::new(0.3, -0.2, 4.0);
    let mut event =
        xi_to_lambda_pi(&mut rng, Vector3::new(0.2, 0.1, 3.0), xi_vertex, None).unwrap();

    let mut estimator = Estimator::default();
    assert_eq!(estimator.fit(&mut event.head), FitStatus::Success);
    assert!(estimator.chi_square().abs() < 1e-6);

    let truth = &event.truth[&ParticleId(1)];
    let lambda = fitted(&event.head, 1);
    assert_vector_close(&lambda.vertex.unwrap(), &truth.decay_vertex.unwrap(), 1e-5);

    let (length, length_error) = lambda.decay_length.unwrap();
    assert_relative_eq!(length, truth.decay_length.unwrap(), epsilon = 1e-5);
    assert!(length_error > 0.0);

    let (lifetime, lifetime_error) = lambda.lifetime.unwrap();
    assert_relative_eq!(lifetime, truth.lifetime.unwrap(), epsilon = 1e-3);
    assert!(lifetime_error > 0.0);

    // the head decays at its own vertex and carries no flight information
    let xi = fitted(&event.head, 0);
    assert_vector_close(&xi.vertex.unwrap(), &xi_vertex, 1e-5);
    assert!(xi.decay_length.is_none());
    assert!(xi.lifetime.is_none());
    assert_relative_eq!(
        xi.four_momentum,
        event.truth[&ParticleId(0)].four_momentum,
        epsilon = 1e-6
    );
}

#[test]
fn test_cascade_pulls_with_smearing() {
    let mut rng = StdRng::seed_from_u64(99);
    let mut large_pulls = 0;
    let mut n_success = 0;
    for _ in 0..100 {
        let momentum = random_direction(&mut rng) * rng.random_range(2.0..5.0);
        let mut event =
            xi_to_lambda_pi(&mut rng, momentum, Vector3::zeros(), Some(Resolution::default()))
                .unwrap();
        let mut estimator = Estimator::default();
        if estimator.fit(&mut event.head) != FitStatus::Success {
            continue;
        }
        n_success += 1;

        let (length, error) = fitted(&event.head, 1).decay_length.unwrap();
        let truth = event.truth[&ParticleId(1)].decay_length.unwrap();
        if (length - truth).abs() > 3.0 * error {
            large_pulls += 1;
        }
    }
    assert!(n_success > 90, "{n_success} successful fits");
    assert!(large_pulls < 10, "{large_pulls} decay lengths beyond 3 sigma");
}

#[test]
fn test_mass_below_threshold_diverges() {
    let mut rng = StdRng::seed_from_u64(3);
    let parent_momentum: Vector3<f64> = Vector3::new(0.1, 0.2, 2.0);
    let parent = Vector4::new(
        parent_momentum.x,
        parent_momentum.y,
        parent_momentum.z,
        (parent_momentum.norm_squared() + LAMBDA_MASS * LAMBDA_MASS).sqrt(),
    );
    let (proton, pion) = two_body_decay(&mut rng, &parent, PROTON_MASS, PION_MASS).unwrap();
    let vertex = Vector3::new(0.0, 0.0, 10.0);
    let cov = track_covariance(0.001, 0.001);
    // K_S0 hypothesis for a p pi- pair: no momenta put the pair below m_p + m_pi
    let mut head = Particle::composite(
        0,
        "K_S0",
        0.4976,
        vec![
            exact_track(1, "p+", PROTON_MASS, &vertex, &proton.xyz(), TRACK_ARC_LENGTH, cov),
            exact_track(2, "pi-", PION_MASS, &vertex, &pion.xyz(), TRACK_ARC_LENGTH, cov),
        ],
    )
    .with_mass_constraint();

    let params = FitParams::default();
    let mut estimator = Estimator::new(params.clone());
    let status = estimator.fit(&mut head);

    assert!(
        matches!(status, FitStatus::Failed | FitStatus::NonConverged),
        "status {status}, history {:?}",
        estimator.chi_square_history()
    );
    assert!(estimator.iterations() <= params.max_iterations);
    assert!(estimator.chi_square_history().len() <= params.max_iterations);
}
