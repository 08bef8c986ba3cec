//! # Caller-facing particle tree
//!
//! A [`Particle`] is the input *and* output representation of the fitter: the caller builds a
//! rooted tree of particles, attaches [`Measurement`]s to the final-state leaves, and hands the
//! head to [`Estimator::fit`](crate::estimator::Estimator::fit). After the fit every particle
//! carries a [`FittedKinematics`] record, and the head additionally carries a [`FitSummary`].
//!
//! ## Particle kinds
//!
//! | Kind        | Measurement       | Fitted parameters                                  |
//! |-------------|-------------------|----------------------------------------------------|
//! | `Track`     | [`Measurement::Track`]   | 3-momentum, energy from the mass hypothesis |
//! | `Photon`    | [`Measurement::Cluster`] | 3-momentum, massless                        |
//! | `Composite` | none              | decay vertex, decay length, four-momentum          |
//! | `Resonance` | none              | four-momentum, decays at its production vertex     |
//!
//! Tracks are straight lines: a reference point on the trajectory and the momentum there, with
//! a full 6×6 covariance ordered as `(x, y, z, px, py, pz)`.

use std::fmt;

use nalgebra::{Matrix3, Matrix6, Vector3, Vector4};
use serde::{Deserialize, Serialize};

use crate::constants::{Centimeter, GeV, Matrix7, Picosecond};
use crate::estimator::FitStatus;

/// Identity of a particle, unique inside one decay tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticleId(pub u32);

impl fmt::Display for ParticleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticleKind {
    /// Charged final-state particle reconstructed as a track.
    Track,
    /// Neutral final-state particle reconstructed as a calorimeter cluster.
    Photon,
    /// Long-lived intermediate particle with its own decay vertex.
    Composite,
    /// Short-lived intermediate particle decaying at its production point.
    Resonance,
}

/// Detector-level information attached to a final-state particle.
#[derive(Debug, Clone, PartialEq)]
pub enum Measurement {
    /// Straight-line track: reference point, momentum, and covariance of `(x, y, z, px, py, pz)`.
    Track {
        position: Vector3<Centimeter>,
        momentum: Vector3<GeV>,
        covariance: Matrix6<f64>,
    },
    /// Calorimeter cluster: momentum and its covariance.
    Cluster {
        momentum: Vector3<GeV>,
        covariance: Matrix3<f64>,
    },
}

impl Measurement {
    pub fn momentum(&self) -> &Vector3<GeV> {
        match self {
            Measurement::Track { momentum, .. } | Measurement::Cluster { momentum, .. } => momentum,
        }
    }
}

/// Fitted quantities written back onto every particle of the tree.
#[derive(Debug, Clone, PartialEq)]
pub struct FittedKinematics {
    /// Four-momentum `(px, py, pz, E)` in GeV.
    pub four_momentum: Vector4<GeV>,
    /// Decay vertex, or the production vertex for particles without one of their own.
    pub vertex: Option<Vector3<Centimeter>>,
    /// Covariance of `(px, py, pz, E, x, y, z)`. Vertex rows are zero when `vertex` is `None`.
    pub covariance: Matrix7,
    /// Decay length and its uncertainty (cm).
    pub decay_length: Option<(Centimeter, Centimeter)>,
    /// Proper lifetime and its uncertainty (ps).
    pub lifetime: Option<(Picosecond, Picosecond)>,
    /// Chi-square contributed by the constraints owned by this particle.
    pub chi_square: f64,
}

impl FittedKinematics {
    pub fn momentum(&self) -> Vector3<GeV> {
        self.four_momentum.xyz()
    }

    /// Invariant mass of the fitted four-momentum, negative for space-like vectors.
    pub fn mass(&self) -> GeV {
        let m2 = self.four_momentum.w.powi(2) - self.momentum().norm_squared();
        m2.signum() * m2.abs().sqrt()
    }
}

/// Global fit information, attached to the head of the tree only.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitSummary {
    pub status: FitStatus,
    pub chi_square: f64,
    pub ndof: i32,
    pub p_value: f64,
    pub iterations: usize,
}

/// One node of the caller's decay tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Particle {
    pub id: ParticleId,
    pub name: String,
    pub kind: ParticleKind,
    /// Nominal (PDG) mass used as mass hypothesis or mass-constraint target.
    pub pdg_mass: GeV,
    pub measurement: Option<Measurement>,
    /// Known decay vertex, used as seed in place of the track intersection.
    pub vertex_hint: Option<Vector3<Centimeter>>,
    /// Constrain the invariant mass to `pdg_mass`.
    pub mass_constraint: bool,
    /// Mean lifetime (ps) used as a soft decay-length constraint.
    pub lifetime_constraint: Option<Picosecond>,
    pub daughters: Vec<Particle>,

    pub fitted: Option<FittedKinematics>,
    pub summary: Option<FitSummary>,
}

impl Particle {
    fn new(id: u32, name: &str, kind: ParticleKind, pdg_mass: GeV) -> Self {
        Particle {
            id: ParticleId(id),
            name: name.to_string(),
            kind,
            pdg_mass,
            measurement: None,
            vertex_hint: None,
            mass_constraint: false,
            lifetime_constraint: None,
            daughters: Vec::new(),
            fitted: None,
            summary: None,
        }
    }

    /// Charged track with mass hypothesis `mass`.
    pub fn track(
        id: u32,
        name: &str,
        mass: GeV,
        position: Vector3<Centimeter>,
        momentum: Vector3<GeV>,
        covariance: Matrix6<f64>,
    ) -> Self {
        let mut particle = Self::new(id, name, ParticleKind::Track, mass);
        particle.measurement = Some(Measurement::Track {
            position,
            momentum,
            covariance,
        });
        particle
    }

    pub fn photon(id: u32, name: &str, momentum: Vector3<GeV>, covariance: Matrix3<f64>) -> Self {
        let mut particle = Self::new(id, name, ParticleKind::Photon, 0.0);
        particle.measurement = Some(Measurement::Cluster {
            momentum,
            covariance,
        });
        particle
    }

    pub fn composite(id: u32, name: &str, mass: GeV, daughters: Vec<Particle>) -> Self {
        let mut particle = Self::new(id, name, ParticleKind::Composite, mass);
        particle.daughters = daughters;
        particle
    }

    pub fn resonance(id: u32, name: &str, mass: GeV, daughters: Vec<Particle>) -> Self {
        let mut particle = Self::new(id, name, ParticleKind::Resonance, mass);
        particle.daughters = daughters;
        particle
    }

    pub fn with_mass_constraint(mut self) -> Self {
        self.mass_constraint = true;
        self
    }

    pub fn with_lifetime_constraint(mut self, lifetime: Picosecond) -> Self {
        self.lifetime_constraint = Some(lifetime);
        self
    }

    pub fn with_vertex_hint(mut self, vertex: Vector3<Centimeter>) -> Self {
        self.vertex_hint = Some(vertex);
        self
    }

    pub fn is_final_state(&self) -> bool {
        matches!(self.kind, ParticleKind::Track | ParticleKind::Photon)
    }

    /// Depth-first search for the particle with identity `id`.
    pub fn find(&self, id: ParticleId) -> Option<&Particle> {
        if self.id == id {
            return Some(self);
        }
        self.daughters.iter().find_map(|d| d.find(id))
    }

    pub fn find_mut(&mut self, id: ParticleId) -> Option<&mut Particle> {
        if self.id == id {
            return Some(self);
        }
        self.daughters.iter_mut().find_map(|d| d.find_mut(id))
    }

    /// Number of particles in the subtree rooted here, this one included.
    pub fn count(&self) -> usize {
        1 + self.daughters.iter().map(Particle::count).sum::<usize>()
    }
}

#[cfg(test)]
mod particle_test {
    use super::*;

    fn lambda() -> Particle {
        let cov = Matrix6::identity() * 1e-4;
        Particle::composite(
            0,
            "Lambda0",
            1.115683,
            vec![
                Particle::track(1, "p+", 0.938, Vector3::zeros(), Vector3::x(), cov),
                Particle::track(2, "pi-", 0.1396, Vector3::zeros(), Vector3::y(), cov),
            ],
        )
        .with_mass_constraint()
    }

    #[test]
    fn test_find_and_count() {
        let mut head = lambda();
        assert_eq!(head.count(), 3);
        assert_eq!(head.find(ParticleId(2)).unwrap().name, "pi-");
        assert!(head.find(ParticleId(9)).is_none());

        head.find_mut(ParticleId(1)).unwrap().name = "proton".into();
        assert_eq!(head.daughters[0].name, "proton");
        assert!(head.mass_constraint);
        assert!(head.daughters[0].is_final_state());
    }

    #[test]
    fn test_fitted_mass() {
        let fitted = FittedKinematics {
            four_momentum: Vector4::new(0.0, 0.0, 3.0, 5.0),
            vertex: None,
            covariance: Matrix7::zeros(),
            decay_length: None,
            lifetime: None,
            chi_square: 0.0,
        };
        assert_eq!(fitted.mass(), 4.0);
        assert_eq!(fitted.momentum(), Vector3::new(0.0, 0.0, 3.0));
    }
}
