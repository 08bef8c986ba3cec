//! # Constraints and the gain-matrix update
//!
//! A [`Constraint`] ties a few entries of the global parameter vector to a measurement or a
//! physical assumption. Its numerical content is described by a [`Projection`], evaluated by
//! the owning [`DecayNode`](crate::decay_node::DecayNode) at a linearization point:
//!
//! ```text
//! r = h(x) − m        residual
//! H = ∂h/∂x           Jacobian (constraint dimension × state dimension)
//! V                   measurement covariance, zero for exact constraints
//! ```
//!
//! [`Constraint::filter`] then performs one Kalman update of the [`ParameterState`]:
//!
//! ```text
//! R  = H C Hᵀ ± V
//! K  = C Hᵀ R⁻¹
//! x' = x − K r
//! C' = C − K H C
//! χ² += rᵀ R⁻¹ r
//! ```
//!
//! A negative weight removes the information again (downdate), which flips the sign of `V`
//! and makes the chi-square contribution negative.
//!
//! Nonlinear constraints can be re-linearized around the updated parameters while keeping
//! the prior `(x, C)` fixed, which is what the first filter pass does.
//!
//! ## See also
//! * [`DecayTree::filter`](crate::decay_tree::DecayTree::filter) – Applies the sorted list.

use std::cmp::Reverse;
use std::fmt;

use log::trace;
use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::constants::RELINEARIZATION_TOLERANCE;
use crate::decay_node::NodeId;
use crate::parameter_state::ParameterState;
use crate::treefit_errors::TreeFitError;

/// Physical content of a constraint.
///
/// The declaration order is the application order among constraints of the same tree depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConstraintKind {
    /// Final-state track or cluster measurement.
    Measurement,
    /// Soft decay-length constraint from a nominal lifetime.
    Lifetime,
    /// Four-momentum conservation at a decay.
    Momentum,
    /// Daughter vertex lies on the flight line of its mother.
    Vertex,
    /// Invariant mass fixed to the nominal mass.
    Mass,
    /// Head vertex measured by the beam spot.
    InteractionPoint,
}

impl ConstraintKind {
    /// Whether the projection depends on the linearization point.
    pub fn is_nonlinear(self) -> bool {
        !matches!(self, ConstraintKind::InteractionPoint)
    }

    /// Whether the constraint carries a measurement covariance. Exact constraints have `V = 0`.
    pub fn has_variance(self) -> bool {
        matches!(
            self,
            ConstraintKind::Measurement | ConstraintKind::Lifetime | ConstraintKind::InteractionPoint
        )
    }
}

impl fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConstraintKind::Measurement => "measurement",
            ConstraintKind::Lifetime => "lifetime",
            ConstraintKind::Momentum => "momentum",
            ConstraintKind::Vertex => "vertex",
            ConstraintKind::Mass => "mass",
            ConstraintKind::InteractionPoint => "interaction point",
        };
        f.write_str(name)
    }
}

/// Sign with which a constraint enters the fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Weight {
    Normal,
    Downdate,
    Disabled,
}

impl Weight {
    pub fn sign(self) -> f64 {
        match self {
            Weight::Normal => 1.0,
            Weight::Downdate => -1.0,
            Weight::Disabled => 0.0,
        }
    }
}

/// Linearized form of a constraint at one point of parameter space.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub residual: DVector<f64>,
    pub jacobian: DMatrix<f64>,
    pub variance: DMatrix<f64>,
}

impl Projection {
    /// Zero projection of a `dim`-dimensional constraint on a state of dimension `state_dim`.
    pub fn new(dim: usize, state_dim: usize) -> Self {
        Projection {
            residual: DVector::zeros(dim),
            jacobian: DMatrix::zeros(dim, state_dim),
            variance: DMatrix::zeros(dim, dim),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Constraint {
    /// Node emitting the constraint.
    pub node: NodeId,
    /// Nodes whose parameters enter the projection.
    pub touches: SmallVec<[NodeId; 4]>,
    pub kind: ConstraintKind,
    /// Depth of `node` in the tree, the head being at depth 0.
    pub depth: usize,
    pub dim: usize,
    pub weight: Weight,
}

impl Constraint {
    /// Sort key placing deeper constraints first, then following [`ConstraintKind`] order.
    pub fn order_key(&self) -> (Reverse<usize>, ConstraintKind) {
        (Reverse(self.depth), self.kind)
    }

    /// Apply the constraint to `state` with a (re-)linearized Kalman update.
    ///
    /// Arguments
    /// -----------------
    /// * `state`: parameters and covariance, updated in place, chi-square accumulated.
    /// * `columns`: state indices the projection may depend on; other Jacobian columns are zero.
    /// * `max_iterations`: re-linearizations allowed for a nonlinear constraint.
    /// * `particle`: name used in error messages.
    /// * `project`: evaluates the [`Projection`] at a given parameter vector.
    ///
    /// Return
    /// ----------
    /// * The chi-square increment (negative for a downdate), also added to `state`.
    /// * `Err(SingularGainMatrix)` if `H C Hᵀ ± V` cannot be inverted with the expected sign.
    /// * `Err(NonFiniteChiSquare)` if the update produced NaN or infinities.
    pub fn filter<F>(
        &self,
        state: &mut ParameterState,
        columns: &[usize],
        max_iterations: usize,
        particle: &str,
        mut project: F,
    ) -> Result<f64, TreeFitError>
    where
        F: FnMut(&DVector<f64>) -> Result<Projection, TreeFitError>,
    {
        let sign = self.weight.sign();
        if sign == 0.0 {
            return Ok(0.0);
        }

        let prior = state.par().clone();
        let prior_active = prior.select_rows(columns);
        // Rows of C touched by H. C is symmetric so these are also the columns of C Hᵀ.
        let prior_rows = state.cov().select_rows(columns);
        let iterations = if self.kind.is_nonlinear() {
            max_iterations.max(1)
        } else {
            1
        };

        let mut x = prior.clone();
        let mut update = None;
        for _ in 0..iterations {
            let projection = project(&x)?;
            let h = projection.jacobian.select_columns(columns);
            let hc = &h * &prior_rows;
            let residual = &projection.residual + &h * (&prior_active - x.select_rows(columns));

            let r = hc.select_columns(columns) * h.transpose() + &projection.variance * sign;
            let r_inv = self.invert_gain(r, particle)?;

            let gain = hc.transpose() * &r_inv;
            let next = &prior - &gain * &residual;
            let delta_chi_square = residual.dot(&(&r_inv * &residual));

            let step = (&next - &x).amax();
            let scale = 1.0 + next.amax();
            x = next;
            update = Some((gain, hc, delta_chi_square));
            if step < RELINEARIZATION_TOLERANCE * scale {
                break;
            }
        }

        let Some((gain, hc, delta_chi_square)) = update else {
            return Ok(0.0);
        };
        if !delta_chi_square.is_finite() || !x.iter().all(|v| v.is_finite()) {
            return Err(TreeFitError::NonFiniteChiSquare {
                kind: self.kind,
                particle: particle.to_string(),
            });
        }

        *state.par_mut() = x;
        *state.cov_mut() -= gain * hc;
        state.symmetrize();
        state.add_chi_square(delta_chi_square);

        trace!(
            "{} constraint of {particle}: dchi2 = {delta_chi_square:.4}",
            self.kind
        );
        Ok(delta_chi_square)
    }

    /// Invert `R`, requiring it positive definite for an update and negative definite for a
    /// downdate.
    fn invert_gain(&self, r: DMatrix<f64>, particle: &str) -> Result<DMatrix<f64>, TreeFitError> {
        let singular = || TreeFitError::SingularGainMatrix {
            kind: self.kind,
            particle: particle.to_string(),
        };
        match self.weight {
            Weight::Downdate => Cholesky::<f64, Dyn>::new(-r)
                .map(|c| -c.inverse())
                .ok_or_else(singular),
            _ => Cholesky::<f64, Dyn>::new(r)
                .map(|c| c.inverse())
                .ok_or_else(singular),
        }
    }
}
