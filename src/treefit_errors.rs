use thiserror::Error;

use crate::constraint::ConstraintKind;
use crate::particle::ParticleId;

#[derive(Error, Debug)]
pub enum TreeFitError {
    #[error("Invalid fit parameter: {0}")]
    InvalidFitParameter(String),

    #[error("Invalid decay tree: {0}")]
    InvalidDecayTree(String),

    #[error("Particle {0} appears more than once in the decay tree")]
    DuplicateParticleId(ParticleId),

    #[error("Particle {0} is not part of the decay tree")]
    UnknownParticle(ParticleId),

    #[error("Parameter state cannot shrink from dimension {current} to {requested}")]
    UnsupportedShrink { current: usize, requested: usize },

    #[error("Degenerate vertex seed for {particle}: {reason}")]
    DegenerateSeed { particle: String, reason: String },

    #[error("No vertex information available to seed {0}")]
    InsufficientVertexInfo(String),

    #[error("Singular gain matrix while filtering the {kind} constraint of {particle}")]
    SingularGainMatrix {
        kind: ConstraintKind,
        particle: String,
    },

    #[error("Non finite chi-square while filtering the {kind} constraint of {particle}")]
    NonFiniteChiSquare {
        kind: ConstraintKind,
        particle: String,
    },

    #[error("Vanishing momentum for {0}")]
    DegenerateMomentum(String),

    #[error("Covariance matrix is not positive definite: {0}")]
    NonPositiveCovariance(String),

    #[error("Particle tree does not match the fitted decay tree: {0}")]
    TopologyMismatch(String),

    #[error("No fit has been performed yet")]
    NotFitted,
}

impl PartialEq for TreeFitError {
    fn eq(&self, other: &Self) -> bool {
        use TreeFitError::*;
        match (self, other) {
            (InvalidFitParameter(a), InvalidFitParameter(b)) => a == b,
            (InvalidDecayTree(a), InvalidDecayTree(b)) => a == b,
            (DuplicateParticleId(a), DuplicateParticleId(b)) => a == b,
            (UnknownParticle(a), UnknownParticle(b)) => a == b,
            (
                UnsupportedShrink {
                    current: c1,
                    requested: r1,
                },
                UnsupportedShrink {
                    current: c2,
                    requested: r2,
                },
            ) => c1 == c2 && r1 == r2,
            (
                DegenerateSeed {
                    particle: p1,
                    reason: r1,
                },
                DegenerateSeed {
                    particle: p2,
                    reason: r2,
                },
            ) => p1 == p2 && r1 == r2,
            (InsufficientVertexInfo(a), InsufficientVertexInfo(b)) => a == b,
            (
                SingularGainMatrix {
                    kind: k1,
                    particle: p1,
                },
                SingularGainMatrix {
                    kind: k2,
                    particle: p2,
                },
            ) => k1 == k2 && p1 == p2,
            (
                NonFiniteChiSquare {
                    kind: k1,
                    particle: p1,
                },
                NonFiniteChiSquare {
                    kind: k2,
                    particle: p2,
                },
            ) => k1 == k2 && p1 == p2,
            (DegenerateMomentum(a), DegenerateMomentum(b)) => a == b,
            (NonPositiveCovariance(a), NonPositiveCovariance(b)) => a == b,
            (TopologyMismatch(a), TopologyMismatch(b)) => a == b,

            // Unit variants
            (NotFitted, NotFitted) => true,

            _ => false,
        }
    }
}

impl TreeFitError {
    /// Whether this error describes an input tree the fitter cannot seed.
    ///
    /// These errors are reported as [`FitStatus::BadInput`](crate::estimator::FitStatus::BadInput)
    /// by the estimator, every other error raised while iterating maps to a failed fit.
    pub fn is_bad_input(&self) -> bool {
        use TreeFitError::*;
        matches!(
            self,
            InvalidDecayTree(_)
                | DuplicateParticleId(_)
                | DegenerateSeed { .. }
                | InsufficientVertexInfo(_)
                | DegenerateMomentum(_)
        )
    }
}
