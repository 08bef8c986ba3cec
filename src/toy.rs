//! # Toy Monte Carlo
//!
//! Generators for simple decay topologies with known truth, used to validate the fitter
//! statistically (pulls, p-value flatness) and to benchmark it.
//!
//! Decays are generated isotropically in the rest frame of the mother and boosted to the lab.
//! Measurements are either exact (the reference point lies on the true trajectory) or smeared
//! with a Gaussian drawn from their own covariance, so the fitted chi-square follows its
//! nominal distribution.
//!
//! ## Example
//!
//! ```rust
//! use nalgebra::Vector3;
//! use rand::{rngs::StdRng, SeedableRng};
//! use treefit::estimator::{Estimator, FitStatus};
//! use treefit::toy::{lambda_to_p_pi, Resolution};
//!
//! let mut rng = StdRng::seed_from_u64(42);
//! let mut event = lambda_to_p_pi(
//!     &mut rng,
//!     Vector3::new(0.2, 0.1, 2.0),
//!     Vector3::new(0.0, 0.0, 20.0),
//!     Some(Resolution::default()),
//! )
//! .unwrap();
//!
//! let status = Estimator::default().fit(&mut event.head);
//! assert_ne!(status, FitStatus::BadInput);
//! ```

use std::collections::HashMap;
use std::f64::consts::PI;

use nalgebra::{Cholesky, Matrix3, Matrix6, SVector, Vector3, Vector4, Vector6};
use rand::Rng;
use rand_distr::{Distribution, Exp, StandardNormal};

use crate::constants::{
    Centimeter, GeV, Picosecond, LAMBDA_LIFETIME, LAMBDA_MASS, PION_MASS, PROTON_MASS,
    SPEED_OF_LIGHT, XI_MASS,
};
use crate::particle::{Particle, ParticleId};
use crate::treefit_errors::TreeFitError;

/// Distance (cm) between the decay vertex and the reference point of generated tracks.
pub const TRACK_ARC_LENGTH: Centimeter = 5.0;

/// Gaussian detector resolution of generated measurements.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resolution {
    /// Position resolution per coordinate (cm).
    pub position: Centimeter,
    /// Momentum resolution per component (GeV).
    pub momentum: GeV,
}

impl Default for Resolution {
    fn default() -> Self {
        Resolution {
            position: 0.01,
            momentum: 0.005,
        }
    }
}

/// True kinematics of one generated particle.
#[derive(Debug, Clone, PartialEq)]
pub struct Truth {
    pub four_momentum: Vector4<GeV>,
    pub decay_vertex: Option<Vector3<Centimeter>>,
    pub decay_length: Option<Centimeter>,
    pub lifetime: Option<Picosecond>,
}

/// A generated decay tree and its truth, keyed by particle identity.
#[derive(Debug, Clone)]
pub struct ToyEvent {
    pub head: Particle,
    pub truth: HashMap<ParticleId, Truth>,
}

/// Unit vector drawn uniformly on the sphere.
pub fn random_direction<R: Rng + ?Sized>(rng: &mut R) -> Vector3<f64> {
    let cos_theta: f64 = rng.random_range(-1.0..1.0);
    let phi: f64 = rng.random_range(0.0..2.0 * PI);
    let sin_theta = (1.0 - cos_theta * cos_theta).sqrt();
    Vector3::new(sin_theta * phi.cos(), sin_theta * phi.sin(), cos_theta)
}

/// Lorentz boost of `p4 = (px, py, pz, E)` by the velocity `beta`.
pub fn boost(p4: &Vector4<f64>, beta: &Vector3<f64>) -> Vector4<f64> {
    let beta2 = beta.norm_squared();
    if beta2 == 0.0 {
        return *p4;
    }
    let gamma = 1.0 / (1.0 - beta2).sqrt();
    let p = p4.xyz();
    let bp = beta.dot(&p);
    let boosted = p + beta * ((gamma - 1.0) * bp / beta2 + gamma * p4.w);
    Vector4::new(boosted.x, boosted.y, boosted.z, gamma * (p4.w + bp))
}

/// Isotropic two-body decay of `parent` into masses `m1` and `m2`.
///
/// Arguments
/// -----------------
/// * `rng`: source of the decay direction.
/// * `parent`: four-momentum of the mother in the lab.
/// * `m1`, `m2`: daughter masses.
///
/// Return
/// ----------
/// * The lab four-momenta of both daughters.
/// * `Err(InvalidDecayTree)` if the mother is below threshold.
pub fn two_body_decay<R: Rng + ?Sized>(
    rng: &mut R,
    parent: &Vector4<GeV>,
    m1: GeV,
    m2: GeV,
) -> Result<(Vector4<GeV>, Vector4<GeV>), TreeFitError> {
    let m2_parent = parent.w * parent.w - parent.xyz().norm_squared();
    let mass = m2_parent.max(0.0).sqrt();
    if mass < m1 + m2 {
        return Err(TreeFitError::InvalidDecayTree(format!(
            "mass {mass:.4} below the threshold {:.4}",
            m1 + m2
        )));
    }

    let q = ((mass * mass - (m1 + m2).powi(2)) * (mass * mass - (m1 - m2).powi(2))).sqrt()
        / (2.0 * mass);
    let direction = random_direction(rng) * q;
    let rest1 = Vector4::new(direction.x, direction.y, direction.z, (q * q + m1 * m1).sqrt());
    let rest2 = Vector4::new(-direction.x, -direction.y, -direction.z, (q * q + m2 * m2).sqrt());

    let beta = parent.xyz() / parent.w;
    Ok((boost(&rest1, &beta), boost(&rest2, &beta)))
}

/// Diagonal track covariance of `(x, y, z, px, py, pz)`.
pub fn track_covariance(position_sigma: Centimeter, momentum_sigma: GeV) -> Matrix6<f64> {
    let p2 = position_sigma * position_sigma;
    let m2 = momentum_sigma * momentum_sigma;
    Matrix6::from_diagonal(&Vector6::new(p2, p2, p2, m2, m2, m2))
}

/// Track produced at `vertex`, with its reference point `arc` centimeters downstream.
pub fn exact_track(
    id: u32,
    name: &str,
    mass: GeV,
    vertex: &Vector3<Centimeter>,
    momentum: &Vector3<GeV>,
    arc: Centimeter,
    covariance: Matrix6<f64>,
) -> Particle {
    let position = vertex + momentum.normalize() * arc;
    Particle::track(id, name, mass, position, *momentum, covariance)
}

/// Gaussian sample with covariance `covariance`.
fn correlated_noise<R: Rng + ?Sized, const D: usize>(
    rng: &mut R,
    covariance: nalgebra::SMatrix<f64, D, D>,
) -> Result<SVector<f64, D>, TreeFitError> {
    let cholesky = Cholesky::new(covariance).ok_or_else(|| {
        TreeFitError::NonPositiveCovariance("measurement covariance of a toy particle".into())
    })?;
    let normal = SVector::<f64, D>::from_fn(|_, _| rng.sample(StandardNormal));
    Ok(cholesky.l() * normal)
}

/// [`exact_track`] with position and momentum smeared by `covariance`.
#[allow(clippy::too_many_arguments)]
pub fn smeared_track<R: Rng + ?Sized>(
    rng: &mut R,
    id: u32,
    name: &str,
    mass: GeV,
    vertex: &Vector3<Centimeter>,
    momentum: &Vector3<GeV>,
    arc: Centimeter,
    covariance: Matrix6<f64>,
) -> Result<Particle, TreeFitError> {
    let noise = correlated_noise(rng, covariance)?;
    let position = vertex + momentum.normalize() * arc + noise.fixed_rows::<3>(0);
    let smeared = momentum + noise.fixed_rows::<3>(3);
    Ok(Particle::track(id, name, mass, position, smeared, covariance))
}

pub fn exact_cluster(id: u32, name: &str, momentum: &Vector3<GeV>, covariance: Matrix3<f64>) -> Particle {
    Particle::photon(id, name, *momentum, covariance)
}

pub fn smeared_cluster<R: Rng + ?Sized>(
    rng: &mut R,
    id: u32,
    name: &str,
    momentum: &Vector3<GeV>,
    covariance: Matrix3<f64>,
) -> Result<Particle, TreeFitError> {
    let noise = correlated_noise(rng, covariance)?;
    Ok(Particle::photon(id, name, momentum + noise, covariance))
}

fn four_momentum(momentum: &Vector3<GeV>, mass: GeV) -> Vector4<GeV> {
    Vector4::new(
        momentum.x,
        momentum.y,
        momentum.z,
        (momentum.norm_squared() + mass * mass).sqrt(),
    )
}

fn make_track<R: Rng + ?Sized>(
    rng: &mut R,
    id: u32,
    name: &str,
    mass: GeV,
    vertex: &Vector3<Centimeter>,
    p4: &Vector4<GeV>,
    resolution: Option<Resolution>,
) -> Result<Particle, TreeFitError> {
    let momentum = p4.xyz();
    match resolution {
        Some(res) => smeared_track(
            rng,
            id,
            name,
            mass,
            vertex,
            &momentum,
            TRACK_ARC_LENGTH,
            track_covariance(res.position, res.momentum),
        ),
        None => {
            let res = Resolution::default();
            Ok(exact_track(
                id,
                name,
                mass,
                vertex,
                &momentum,
                TRACK_ARC_LENGTH,
                track_covariance(res.position, res.momentum),
            ))
        }
    }
}

fn final_state_truth(p4: Vector4<GeV>) -> Truth {
    Truth {
        four_momentum: p4,
        decay_vertex: None,
        decay_length: None,
        lifetime: None,
    }
}

/// `Lambda0 -> p pi-` decaying at `decay_vertex`.
///
/// Particle identities: `0` for the Lambda0, `1` for the proton, `2` for the pion. With
/// `resolution == None` the measurements are exact, but still carry the default covariance.
pub fn lambda_to_p_pi<R: Rng + ?Sized>(
    rng: &mut R,
    momentum: Vector3<GeV>,
    decay_vertex: Vector3<Centimeter>,
    resolution: Option<Resolution>,
) -> Result<ToyEvent, TreeFitError> {
    let lambda = four_momentum(&momentum, LAMBDA_MASS);
    let (proton, pion) = two_body_decay(rng, &lambda, PROTON_MASS, PION_MASS)?;

    let head = Particle::composite(
        0,
        "Lambda0",
        LAMBDA_MASS,
        vec![
            make_track(rng, 1, "p+", PROTON_MASS, &decay_vertex, &proton, resolution)?,
            make_track(rng, 2, "pi-", PION_MASS, &decay_vertex, &pion, resolution)?,
        ],
    );

    let mut truth = HashMap::new();
    truth.insert(
        ParticleId(0),
        Truth {
            four_momentum: lambda,
            decay_vertex: Some(decay_vertex),
            decay_length: None,
            lifetime: None,
        },
    );
    truth.insert(ParticleId(1), final_state_truth(proton));
    truth.insert(ParticleId(2), final_state_truth(pion));
    Ok(ToyEvent { head, truth })
}

/// `Xi- -> (Lambda0 -> p pi-) pi-`, the Xi- decaying at `decay_vertex`.
///
/// The Lambda0 flies a distance drawn from its exponential proper-time distribution. Particle
/// identities: `0` Xi-, `1` Lambda0, `2` proton, `3` pion from the Lambda0, `4` bachelor pion.
pub fn xi_to_lambda_pi<R: Rng + ?Sized>(
    rng: &mut R,
    momentum: Vector3<GeV>,
    decay_vertex: Vector3<Centimeter>,
    resolution: Option<Resolution>,
) -> Result<ToyEvent, TreeFitError> {
    let xi = four_momentum(&momentum, XI_MASS);
    let (lambda, bachelor) = two_body_decay(rng, &xi, LAMBDA_MASS, PION_MASS)?;
    let (proton, pion) = two_body_decay(rng, &lambda, PROTON_MASS, PION_MASS)?;

    let decay_time = Exp::new(1.0 / LAMBDA_LIFETIME)
        .map_err(|err| TreeFitError::InvalidDecayTree(format!("lifetime distribution: {err}")))?
        .sample(rng);
    let lambda_momentum = lambda.xyz();
    let flight = decay_time * SPEED_OF_LIGHT * lambda_momentum.norm() / LAMBDA_MASS;
    let lambda_vertex = decay_vertex + lambda_momentum.normalize() * flight;

    let head = Particle::composite(
        0,
        "Xi-",
        XI_MASS,
        vec![
            Particle::composite(
                1,
                "Lambda0",
                LAMBDA_MASS,
                vec![
                    make_track(rng, 2, "p+", PROTON_MASS, &lambda_vertex, &proton, resolution)?,
                    make_track(rng, 3, "pi-", PION_MASS, &lambda_vertex, &pion, resolution)?,
                ],
            ),
            make_track(rng, 4, "pi-", PION_MASS, &decay_vertex, &bachelor, resolution)?,
        ],
    );

    let mut truth = HashMap::new();
    truth.insert(
        ParticleId(0),
        Truth {
            four_momentum: xi,
            decay_vertex: Some(decay_vertex),
            decay_length: None,
            lifetime: None,
        },
    );
    truth.insert(
        ParticleId(1),
        Truth {
            four_momentum: lambda,
            decay_vertex: Some(lambda_vertex),
            decay_length: Some(flight),
            lifetime: Some(decay_time),
        },
    );
    truth.insert(ParticleId(2), final_state_truth(proton));
    truth.insert(ParticleId(3), final_state_truth(pion));
    truth.insert(ParticleId(4), final_state_truth(bachelor));
    Ok(ToyEvent { head, truth })
}

#[cfg(test)]
mod toy_test {
    use super::*;
    use approx::assert_relative_eq;
    use rand::{rngs::StdRng, SeedableRng};

    fn mass(p4: &Vector4<f64>) -> f64 {
        (p4.w * p4.w - p4.xyz().norm_squared()).sqrt()
    }

    #[test]
    fn test_random_direction_is_unit() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..100 {
            assert_relative_eq!(random_direction(&mut rng).norm(), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_boost_preserves_mass() {
        let p4 = Vector4::new(0.1, -0.2, 0.3, 1.0);
        let boosted = boost(&p4, &Vector3::new(0.3, 0.1, 0.5));
        assert_relative_eq!(mass(&boosted), mass(&p4), epsilon = 1e-12);
        assert_eq!(boost(&p4, &Vector3::zeros()), p4);
    }

    #[test]
    fn test_two_body_decay_conserves_four_momentum() {
        let mut rng = StdRng::seed_from_u64(7);
        let parent = four_momentum(&Vector3::new(0.3, 0.1, 2.5), LAMBDA_MASS);
        let (a, b) = two_body_decay(&mut rng, &parent, PROTON_MASS, PION_MASS).unwrap();
        assert_relative_eq!(a + b, parent, epsilon = 1e-12);
        assert_relative_eq!(mass(&a), PROTON_MASS, epsilon = 1e-9);
        assert_relative_eq!(mass(&b), PION_MASS, epsilon = 1e-9);
    }

    #[test]
    fn test_two_body_decay_below_threshold() {
        let mut rng = StdRng::seed_from_u64(7);
        let parent = four_momentum(&Vector3::new(0.0, 0.0, 1.0), 0.5);
        assert!(matches!(
            two_body_decay(&mut rng, &parent, PROTON_MASS, PION_MASS),
            Err(TreeFitError::InvalidDecayTree(_))
        ));
    }

    #[test]
    fn test_exact_track_lies_on_trajectory() {
        let vertex = Vector3::new(1.0, 2.0, 3.0);
        let momentum = Vector3::new(0.0, 3.0, 4.0);
        let track = exact_track(5, "pi+", PION_MASS, &vertex, &momentum, 10.0, Matrix6::identity());
        match track.measurement {
            Some(crate::particle::Measurement::Track { position, .. }) => {
                assert_relative_eq!(position, Vector3::new(1.0, 8.0, 11.0), epsilon = 1e-12);
            }
            _ => panic!("expected a track measurement"),
        }
    }

    #[test]
    fn test_smearing_rejects_singular_covariance() {
        let mut rng = StdRng::seed_from_u64(3);
        let err = smeared_cluster(&mut rng, 1, "gamma", &Vector3::z(), Matrix3::zeros()).unwrap_err();
        assert!(matches!(err, TreeFitError::NonPositiveCovariance(_)));
    }

    #[test]
    fn test_xi_event_truth() {
        let mut rng = StdRng::seed_from_u64(11);
        let event = xi_to_lambda_pi(&mut rng, Vector3::new(0.1, 0.2, 3.0), Vector3::zeros(), None)
            .unwrap();
        assert_eq!(event.head.count(), 5);
        assert_eq!(event.truth.len(), 5);

        let lambda = &event.truth[&ParticleId(1)];
        let flight = lambda.decay_vertex.unwrap().norm();
        assert_relative_eq!(flight, lambda.decay_length.unwrap(), epsilon = 1e-12);
        let p = lambda.four_momentum.xyz().norm();
        assert_relative_eq!(
            lambda.lifetime.unwrap(),
            flight * LAMBDA_MASS / (p * SPEED_OF_LIGHT),
            epsilon = 1e-9
        );
    }
}
