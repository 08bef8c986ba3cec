#![allow(dead_code)]

use approx::assert_relative_eq;
use nalgebra::{Matrix3, Vector3, Vector4};
use treefit::constants::{KAON_MASS, PION_MASS};
use treefit::particle::{FittedKinematics, Particle, ParticleId};
use treefit::toy::{exact_cluster, exact_track, track_covariance, TRACK_ARC_LENGTH};

pub const D_MASS: f64 = 1.869_66;
pub const PI0_MASS: f64 = 0.134_977;

pub fn assert_vector_close(actual: &Vector3<f64>, expected: &Vector3<f64>, epsilon: f64) {
    assert_relative_eq!(actual.x, expected.x, epsilon = epsilon);
    assert_relative_eq!(actual.y, expected.y, epsilon = epsilon);
    assert_relative_eq!(actual.z, expected.z, epsilon = epsilon);
}

pub fn fitted(head: &Particle, id: u32) -> &FittedKinematics {
    head.find(ParticleId(id))
        .and_then(|particle| particle.fitted.as_ref())
        .unwrap_or_else(|| panic!("particle #{id} has no fitted kinematics"))
}

pub fn vertex_sigma(fit: &FittedKinematics) -> Vector3<f64> {
    Vector3::from_fn(|i, _| fit.covariance[(4 + i, 4 + i)].sqrt())
}

/// Momenta of `D+ -> K- pi+ pi+`.
pub fn d_plus_momenta() -> [Vector3<f64>; 3] {
    [
        Vector3::new(0.35, -0.12, 2.1),
        Vector3::new(-0.18, 0.25, 1.4),
        Vector3::new(0.05, 0.31, 0.9),
    ]
}

/// `D+ -> K- pi+ pi+` decaying at `vertex`, with exact measurements.
pub fn noiseless_d_plus(vertex: &Vector3<f64>) -> Particle {
    let cov = track_covariance(0.005, 0.002);
    let [k, pi1, pi2] = d_plus_momenta();
    Particle::composite(
        0,
        "D+",
        D_MASS,
        vec![
            exact_track(1, "K-", KAON_MASS, vertex, &k, TRACK_ARC_LENGTH, cov),
            exact_track(2, "pi+", PION_MASS, vertex, &pi1, TRACK_ARC_LENGTH, cov),
            exact_track(3, "pi+", PION_MASS, vertex, &pi2, TRACK_ARC_LENGTH, cov),
        ],
    )
}

/// Sum of the true four-momenta of [`noiseless_d_plus`].
pub fn d_plus_four_momentum() -> Vector4<f64> {
    let masses = [KAON_MASS, PION_MASS, PION_MASS];
    d_plus_momenta()
        .iter()
        .zip(masses)
        .map(|(p, m)| Vector4::new(p.x, p.y, p.z, (p.norm_squared() + m * m).sqrt()))
        .sum()
}

/// `pi0 -> gamma gamma` with a mass constraint and the given cluster momenta.
pub fn pi0(gamma1: Vector3<f64>, gamma2: Vector3<f64>) -> Particle {
    let cov = Matrix3::from_diagonal_element(1e-4);
    Particle::resonance(
        0,
        "pi0",
        PI0_MASS,
        vec![
            exact_cluster(1, "gamma", &gamma1, cov),
            exact_cluster(2, "gamma", &gamma2, cov),
        ],
    )
    .with_mass_constraint()
}
