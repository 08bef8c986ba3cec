//! # Fit configuration
//!
//! This module defines the [`FitParams`] configuration struct and its validating builder,
//! which control how the [`Estimator`](crate::estimator::Estimator) iterates, how the
//! [`DecayTree`](crate::decay_tree::DecayTree) seeds its parameters, and which optional
//! constraints are attached to the decay tree.
//!
//! ## Overview
//!
//! The parameters fall into three groups:
//!
//! 1. **Iteration control**
//!    `convergence_threshold`, `max_iterations` and `max_consecutive_diverging` drive the
//!    convergence/divergence state machine of the estimator. `max_constraint_iterations`
//!    bounds the re-linearization of a single nonlinear constraint: exact constraints on every
//!    pass, measurements on the first pass only.
//!
//! 2. **Seeding and priors**
//!    `max_seed_doca` rejects vertex seeds built from tracks that do not come close to each
//!    other. The `prior_*` values set the broad covariance used for parameters with no direct
//!    measurement, and `prior_scale` inflates the measured covariance of final-state momenta.
//!
//! 3. **Optional constraints**
//!    `use_ip_constraint` attaches the interaction point (`ip_position`, `ip_covariance`) to
//!    the head vertex. `force_p4_sum` enforces exact four-momentum conservation after a
//!    successful fit.
//!
//! ## Example
//!
//! ```rust
//! use treefit::fit_params::FitParams;
//!
//! let params = FitParams::builder()
//!     .convergence_threshold(0.1)
//!     .max_iterations(20)
//!     .use_ip_constraint(true)
//!     .build()
//!     .unwrap();
//!
//! println!("{params:#}");
//! ```
//!
//! ## See also
//! * [`Estimator::new`](crate::estimator::Estimator::new) – Consumes the parameters.
//! * [`DecayTree::new`](crate::decay_tree::DecayTree::new) – Reads the seeding and constraint options.

use std::cmp::Ordering::{Equal, Greater};
use std::fmt;

use nalgebra::{Cholesky, Matrix3, Vector3};

use crate::constants::{Centimeter, GeV};
use crate::treefit_errors::TreeFitError;

/// Configuration of a decay-tree fit.
///
/// Use [`FitParams::builder`] to override individual values with validation, or
/// [`FitParams::default`] for the standard configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct FitParams {
    // --- Iteration control ---
    /// Absolute chi-square change below which the fit is declared converged.
    pub convergence_threshold: f64,
    /// Maximum number of global filter passes.
    pub max_iterations: usize,
    /// Number of consecutive chi-square increases tolerated before giving up.
    pub max_consecutive_diverging: usize,
    /// Maximum re-linearizations of one nonlinear constraint within a filter pass.
    pub max_constraint_iterations: usize,

    // --- Optional constraints ---
    /// Attach the interaction point to the head vertex.
    pub use_ip_constraint: bool,
    /// Interaction point position (cm).
    pub ip_position: Vector3<Centimeter>,
    /// Interaction point covariance (cm²).
    pub ip_covariance: Matrix3<f64>,
    /// Enforce exact four-momentum conservation after a successful fit.
    pub force_p4_sum: bool,

    // --- Seeding / priors ---
    /// Largest distance of closest approach accepted for a vertex seed (cm).
    pub max_seed_doca: Centimeter,
    /// Inflation factor applied to the measured covariance of final-state momenta.
    pub prior_scale: f64,
    /// Prior variance of an unmeasured vertex coordinate (cm²).
    pub prior_vertex_variance: f64,
    /// Prior variance of an unmeasured four-momentum component (GeV²).
    pub prior_momentum_variance: GeV,
    /// Prior variance of an unmeasured decay length (cm²).
    pub prior_decay_length_variance: f64,
}

impl FitParams {
    /// Construct a new [`FitParams`] with default values.
    ///
    /// This is equivalent to calling [`FitParams::default()`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new [`FitParamsBuilder`] to configure custom parameters.
    ///
    /// # See also
    /// * [`FitParamsBuilder::build`] – Validation rules applied to the final configuration.
    pub fn builder() -> FitParamsBuilder {
        FitParamsBuilder::new()
    }
}

impl Default for FitParams {
    fn default() -> Self {
        FitParams {
            convergence_threshold: 1.0,
            max_iterations: 10,
            max_consecutive_diverging: 3,
            max_constraint_iterations: 10,

            use_ip_constraint: false,
            ip_position: Vector3::zeros(),
            ip_covariance: Matrix3::from_diagonal_element(1e-2),
            force_p4_sum: false,

            max_seed_doca: 2.0,
            prior_scale: 1000.0,
            prior_vertex_variance: 100.0,
            prior_momentum_variance: 100.0,
            prior_decay_length_variance: 100.0,
        }
    }
}

/// Builder for [`FitParams`], with validation.
#[derive(Debug, Clone)]
pub struct FitParamsBuilder {
    params: FitParams,
}

impl Default for FitParamsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FitParamsBuilder {
    /// Create a new builder initialized with default values.
    pub fn new() -> Self {
        Self {
            params: FitParams::default(),
        }
    }

    // --- Iteration control ---
    pub fn convergence_threshold(mut self, v: f64) -> Self {
        self.params.convergence_threshold = v;
        self
    }
    pub fn max_iterations(mut self, v: usize) -> Self {
        self.params.max_iterations = v;
        self
    }
    pub fn max_consecutive_diverging(mut self, v: usize) -> Self {
        self.params.max_consecutive_diverging = v;
        self
    }
    pub fn max_constraint_iterations(mut self, v: usize) -> Self {
        self.params.max_constraint_iterations = v;
        self
    }

    // --- Optional constraints ---
    pub fn use_ip_constraint(mut self, v: bool) -> Self {
        self.params.use_ip_constraint = v;
        self
    }
    pub fn ip_position(mut self, v: Vector3<f64>) -> Self {
        self.params.ip_position = v;
        self
    }
    pub fn ip_covariance(mut self, v: Matrix3<f64>) -> Self {
        self.params.ip_covariance = v;
        self
    }
    pub fn force_p4_sum(mut self, v: bool) -> Self {
        self.params.force_p4_sum = v;
        self
    }

    // --- Seeding / priors ---
    pub fn max_seed_doca(mut self, v: f64) -> Self {
        self.params.max_seed_doca = v;
        self
    }
    pub fn prior_scale(mut self, v: f64) -> Self {
        self.params.prior_scale = v;
        self
    }
    pub fn prior_vertex_variance(mut self, v: f64) -> Self {
        self.params.prior_vertex_variance = v;
        self
    }
    pub fn prior_momentum_variance(mut self, v: f64) -> Self {
        self.params.prior_momentum_variance = v;
        self
    }
    pub fn prior_decay_length_variance(mut self, v: f64) -> Self {
        self.params.prior_decay_length_variance = v;
        self
    }

    /// Return true iff x > 0.0 and comparable (i.e., not NaN).
    #[inline]
    fn gt0(x: f64) -> bool {
        x.partial_cmp(&0.0) == Some(Greater)
    }

    /// Return true iff x >= 0.0 and comparable (i.e., not NaN).
    #[inline]
    fn ge0(x: f64) -> bool {
        matches!(x.partial_cmp(&0.0), Some(Greater) | Some(Equal))
    }

    /// Finalize the builder and produce a [`FitParams`] instance.
    ///
    /// Validation rules
    /// -----------------
    /// * `convergence_threshold > 0.0`.
    /// * `max_iterations ≥ 1`, `max_consecutive_diverging ≥ 1`, `max_constraint_iterations ≥ 1`.
    /// * `max_seed_doca > 0.0`.
    /// * `prior_scale ≥ 1.0`, every `prior_*_variance > 0.0`.
    /// * `ip_position` finite, `ip_covariance` symmetric and positive definite.
    ///
    /// Returns
    /// -----------------
    /// * `Ok(FitParams)` if all values are valid.
    /// * `Err(TreeFitError::InvalidFitParameter)` naming the first rule that fails.
    pub fn build(self) -> Result<FitParams, TreeFitError> {
        let p = &self.params;

        if !Self::gt0(p.convergence_threshold) {
            return Err(TreeFitError::InvalidFitParameter(
                "convergence_threshold must be > 0".into(),
            ));
        }

        // --- Iteration counts (>= 1) ---
        if p.max_iterations == 0 {
            return Err(TreeFitError::InvalidFitParameter(
                "max_iterations must be >= 1".into(),
            ));
        }
        if p.max_consecutive_diverging == 0 {
            return Err(TreeFitError::InvalidFitParameter(
                "max_consecutive_diverging must be >= 1".into(),
            ));
        }
        if p.max_constraint_iterations == 0 {
            return Err(TreeFitError::InvalidFitParameter(
                "max_constraint_iterations must be >= 1".into(),
            ));
        }

        // --- Seeding / priors ---
        if !Self::gt0(p.max_seed_doca) {
            return Err(TreeFitError::InvalidFitParameter(
                "max_seed_doca must be > 0".into(),
            ));
        }
        if !Self::ge0(p.prior_scale - 1.0) {
            return Err(TreeFitError::InvalidFitParameter(
                "prior_scale must be >= 1".into(),
            ));
        }
        if !Self::gt0(p.prior_vertex_variance)
            || !Self::gt0(p.prior_momentum_variance)
            || !Self::gt0(p.prior_decay_length_variance)
        {
            return Err(TreeFitError::InvalidFitParameter(
                "prior variances must be > 0".into(),
            ));
        }

        // --- Interaction point ---
        if !p.ip_position.iter().all(|v| v.is_finite()) {
            return Err(TreeFitError::InvalidFitParameter(
                "ip_position must be finite".into(),
            ));
        }
        let symmetric = (p.ip_covariance - p.ip_covariance.transpose()).amax()
            <= 1e-12 * p.ip_covariance.amax();
        if !symmetric || Cholesky::new(p.ip_covariance).is_none() {
            return Err(TreeFitError::InvalidFitParameter(
                "ip_covariance must be symmetric positive definite".into(),
            ));
        }

        Ok(self.params)
    }
}

impl fmt::Display for FitParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            const PARAM_COL: usize = 46;
            writeln!(f, "Decay Tree Fit Parameters")?;
            writeln!(f, "-------------------------")?;

            macro_rules! line {
                ($fmt:expr, $val:expr, $comment:expr) => {{
                    let s = format!($fmt, $val);
                    let pad = if s.len() < PARAM_COL {
                        " ".repeat(PARAM_COL - s.len())
                    } else {
                        " ".to_string()
                    };
                    writeln!(f, "  {}{}# {}", s, pad, $comment)
                }};
            }

            writeln!(f, "[Iteration control]")?;
            line!(
                "convergence_threshold     = {:.3}",
                self.convergence_threshold,
                "Chi-square change declaring convergence"
            )?;
            line!(
                "max_iterations            = {}",
                self.max_iterations,
                "Maximum global filter passes"
            )?;
            line!(
                "max_consecutive_diverging = {}",
                self.max_consecutive_diverging,
                "Tolerated chi-square increases in a row"
            )?;
            line!(
                "max_constraint_iterations = {}",
                self.max_constraint_iterations,
                "Re-linearizations per constraint and pass"
            )?;

            writeln!(f, "\n[Optional constraints]")?;
            line!(
                "use_ip_constraint         = {}",
                self.use_ip_constraint,
                "Constrain the head vertex to the IP"
            )?;
            line!(
                "ip_position               = {:?} cm",
                self.ip_position.as_slice(),
                "Interaction point"
            )?;
            line!(
                "ip_sigma                  = {:?} cm",
                self.ip_covariance.diagonal().map(f64::sqrt).as_slice(),
                "Interaction point resolution"
            )?;
            line!(
                "force_p4_sum              = {}",
                self.force_p4_sum,
                "Exact four-momentum conservation after fit"
            )?;

            writeln!(f, "\n[Seeding / priors]")?;
            line!(
                "max_seed_doca             = {:.3} cm",
                self.max_seed_doca,
                "Largest accepted seed DOCA"
            )?;
            line!(
                "prior_scale               = {:.1}",
                self.prior_scale,
                "Inflation of measured momentum covariance"
            )?;
            line!(
                "prior_vertex_variance     = {:.1} cm²",
                self.prior_vertex_variance,
                "Unmeasured vertex prior"
            )?;
            line!(
                "prior_momentum_variance   = {:.1} GeV²",
                self.prior_momentum_variance,
                "Unmeasured momentum prior"
            )?;
            line!(
                "prior_decay_length_var.   = {:.1} cm²",
                self.prior_decay_length_variance,
                "Unmeasured decay length prior"
            )?;

            Ok(())
        } else {
            write!(
                f,
                "FitParams(threshold={:.2}, max_iterations={}, max_diverging={}, ip={}, force_p4_sum={}, max_seed_doca={:.2}cm)",
                self.convergence_threshold,
                self.max_iterations,
                self.max_consecutive_diverging,
                self.use_ip_constraint,
                self.force_p4_sum,
                self.max_seed_doca,
            )
        }
    }
}
