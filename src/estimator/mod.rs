//! # Iterative decay-tree fit
//!
//! The [`Estimator`] is the entry point of the crate. It owns one [`DecayTree`] and one
//! [`ParameterState`] per fit, iterates [`DecayTree::filter`] until the chi-square settles,
//! and writes the fitted kinematics back onto the caller's [`Particle`] tree.
//!
//! ## Life cycle
//!
//! ```text
//! UnFitted ──fit──► BadInput                          (tree construction or seeding failed)
//!          └──────► Running ──► Success | Failed | NonConverged
//! ```
//!
//! Errors never cross [`Estimator::fit`]: they are turned into a [`FitStatus`] and a
//! [`Termination`] reason, and logged with `warn!`. The follow-up operations
//! ([`Estimator::refit`], [`Estimator::add`], [`Estimator::remove`],
//! [`Estimator::result`]) need a fitted state and return `Result`.
//!
//! ## Example
//!
//! ```rust
//! use nalgebra::{Matrix6, Vector3};
//! use treefit::constants::{LAMBDA_MASS, PION_MASS, PROTON_MASS};
//! use treefit::estimator::{Estimator, FitStatus};
//! use treefit::fit_params::FitParams;
//! use treefit::particle::Particle;
//!
//! let vertex = Vector3::new(0.0, 0.0, 10.0);
//! let p_proton = Vector3::new(0.1, 0.05, 1.5);
//! let p_pion = Vector3::new(-0.05, 0.02, 0.3);
//! let cov = Matrix6::from_diagonal(&nalgebra::Vector6::new(1e-4, 1e-4, 1e-4, 1e-6, 1e-6, 1e-6));
//!
//! let mut lambda = Particle::composite(
//!     0,
//!     "Lambda0",
//!     LAMBDA_MASS,
//!     vec![
//!         Particle::track(1, "p+", PROTON_MASS, vertex + p_proton, p_proton, cov),
//!         Particle::track(2, "pi-", PION_MASS, vertex - p_pion, p_pion, cov),
//!     ],
//! );
//!
//! let mut estimator = Estimator::new(FitParams::default());
//! assert_eq!(estimator.fit(&mut lambda), FitStatus::Success);
//!
//! let fitted = lambda.fitted.as_ref().unwrap();
//! assert!((fitted.vertex.unwrap() - vertex).norm() < 1e-6);
//! ```
//!
//! ## See also
//! * [`run_iterations`] – The convergence/divergence state machine.
//! * [`ResultMapper`] – Write-back of the fitted state.

pub mod convergence;

use std::fmt;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};

pub use convergence::{run_iterations, IterationOutcome, Termination};

use crate::constraint::Weight;
use crate::decay_tree::DecayTree;
use crate::fit_params::FitParams;
use crate::parameter_state::ParameterState;
use crate::particle::{FitSummary, Particle, ParticleId};
use crate::result_mapper::ResultMapper;
use crate::treefit_errors::TreeFitError;

/// Status of a fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FitStatus {
    #[default]
    UnFitted,
    Running,
    BadInput,
    Success,
    Failed,
    NonConverged,
}

impl fmt::Display for FitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FitStatus::UnFitted => "unfitted",
            FitStatus::Running => "running",
            FitStatus::BadInput => "bad input",
            FitStatus::Success => "success",
            FitStatus::Failed => "failed",
            FitStatus::NonConverged => "not converged",
        };
        f.write_str(name)
    }
}

/// Upper-tail probability of `chi_square` for `ndof` degrees of freedom.
///
/// Returns `0.0` when `ndof <= 0` or when the chi-square is not a finite non-negative number.
pub fn chi_square_p_value(chi_square: f64, ndof: i32) -> f64 {
    if ndof <= 0 || !chi_square.is_finite() || chi_square < 0.0 {
        return 0.0;
    }
    ChiSquared::new(ndof as f64)
        .map(|dist| dist.sf(chi_square))
        .unwrap_or(0.0)
}

/// Snapshot of the fit quality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    pub status: FitStatus,
    pub termination: Option<Termination>,
    pub chi_square: f64,
    pub ndof: i32,
    pub p_value: f64,
    pub iterations: usize,
    pub chi_square_history: Vec<f64>,
    /// Residual chi-square of the measurement-like constraints, per particle.
    pub node_chi_square: Vec<(ParticleId, f64)>,
}

impl fmt::Display for FitResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} after {} iterations: chi2/ndof = {:.3}/{} (p = {:.4})",
            self.status, self.iterations, self.chi_square, self.ndof, self.p_value
        )?;
        if f.alternate() {
            for (id, chi_square) in &self.node_chi_square {
                write!(f, "\n  {id:>5}  {chi_square:>10.4}")?;
            }
        }
        Ok(())
    }
}

/// Driver of the iterative fit.
#[derive(Debug, Clone)]
pub struct Estimator {
    params: FitParams,
    tree: Option<DecayTree>,
    state: Option<ParameterState>,
    status: FitStatus,
    termination: Option<Termination>,
    chi_square: f64,
    chi_square_history: Vec<f64>,
    iterations: usize,
}

impl Estimator {
    pub fn new(params: FitParams) -> Self {
        Estimator {
            params,
            tree: None,
            state: None,
            status: FitStatus::UnFitted,
            termination: None,
            chi_square: 0.0,
            chi_square_history: Vec::new(),
            iterations: 0,
        }
    }

    /// Fit the decay tree rooted at `head`.
    ///
    /// Builds the internal tree, seeds the parameters and iterates the filter until
    /// convergence or divergence. Unless the input is rejected, the fitted kinematics are
    /// written back onto every particle of `head`, even for a fit that did not succeed.
    ///
    /// Arguments
    /// -----------------
    /// * `head`: root of the particle tree, a composite or a resonance.
    ///
    /// Return
    /// ----------
    /// * The terminal [`FitStatus`]. [`FitStatus::BadInput`] means nothing was written back.
    ///
    /// See also
    /// ------------
    /// * [`Estimator::termination`] – Reason behind a non-successful status.
    pub fn fit(&mut self, head: &mut Particle) -> FitStatus {
        self.reset();
        self.status = FitStatus::Running;

        let (tree, mut state) = match self.prepare(head) {
            Ok(prepared) => prepared,
            Err(err) => {
                warn!("rejecting decay tree {}: {err}", head.name);
                let termination = if err.is_bad_input() {
                    Termination::BadInput
                } else {
                    Termination::FilterFailure
                };
                self.status = termination.status();
                self.termination = Some(termination);
                return self.status;
            }
        };
        debug!(
            "fitting {} with {} parameters, ndof = {}",
            head.name,
            tree.dim(),
            tree.ndof()
        );

        self.iterate(&tree, &mut state, true);
        if self.status == FitStatus::Success && self.params.force_p4_sum {
            if let Err(err) = tree.force_p4_sum(&mut state) {
                warn!("could not enforce four-momentum conservation: {err}");
            }
        }

        self.tree = Some(tree);
        self.state = Some(state);
        if let Err(err) = self.update_particles(head) {
            warn!("could not write the fit result back onto {}: {err}", head.name);
        }
        self.status
    }

    fn prepare(&self, head: &Particle) -> Result<(DecayTree, ParameterState), TreeFitError> {
        let tree = DecayTree::new(head, &self.params)?;
        let mut state = ParameterState::new(tree.dim());
        tree.init(&mut state)?;
        Ok((tree, state))
    }

    fn iterate(&mut self, tree: &DecayTree, state: &mut ParameterState, from_seed: bool) {
        let outcome = run_iterations(&self.params, state, tree.ndof(), |state, first| {
            tree.filter(state, first && from_seed)
        });
        self.status = outcome.status();
        self.termination = Some(outcome.termination);
        self.iterations = outcome.iterations;
        self.chi_square_history = outcome.chi_square_history;
        self.chi_square = state.chi_square();
        debug!(
            "fit finished: {} ({:?}) after {} iterations, chi2 = {:.4}",
            self.status, outcome.termination, self.iterations, self.chi_square
        );
    }

    fn reset(&mut self) {
        *self = Estimator::new(self.params.clone());
    }

    /// Continue iterating from the current state, without re-seeding.
    ///
    /// Refitting a converged state converges again on the second iteration with the same
    /// parameters. The caller's tree is not updated, see [`Estimator::update_particles`].
    ///
    /// Return
    /// ----------
    /// * The new [`FitStatus`], or `Err(NotFitted)` if no tree has been fitted.
    pub fn refit(&mut self) -> Result<FitStatus, TreeFitError> {
        let (Some(tree), Some(mut state)) = (self.tree.take(), self.state.take()) else {
            return Err(TreeFitError::NotFitted);
        };
        self.iterate(&tree, &mut state, false);
        self.tree = Some(tree);
        self.state = Some(state);
        Ok(self.status)
    }

    /// Re-run the covariance check on the current state, downgrading
    /// [`FitStatus::Success`] to [`FitStatus::Failed`] if a variance became negative.
    pub fn revalidate(&mut self) -> FitStatus {
        if self.status == FitStatus::Success {
            if let Some(state) = &self.state {
                if !state.test_cov() {
                    warn!("negative variance found on revalidation");
                    self.status = FitStatus::Failed;
                    self.termination = Some(Termination::NegativeVariance);
                }
            }
        }
        self.status
    }

    /// Fold the measurement of `particle` into the fitted state once more, without iterating.
    ///
    /// Return
    /// ----------
    /// * The chi-square increment.
    /// * `Err(NotFitted)` before a fit, `Err(UnknownParticle)` if `particle` is not in the tree.
    pub fn add(&mut self, particle: ParticleId) -> Result<f64, TreeFitError> {
        self.filter_particle(particle, Weight::Normal)
    }

    /// Remove the measurement of `particle` from the fitted state, without iterating.
    ///
    /// Return
    /// ----------
    /// * The chi-square decrement, a negative number.
    /// * `Err(SingularGainMatrix)` when the rest of the tree does not constrain the particle.
    pub fn remove(&mut self, particle: ParticleId) -> Result<f64, TreeFitError> {
        self.filter_particle(particle, Weight::Downdate)
    }

    fn filter_particle(&mut self, particle: ParticleId, weight: Weight) -> Result<f64, TreeFitError> {
        let (Some(tree), Some(state)) = (&self.tree, &mut self.state) else {
            return Err(TreeFitError::NotFitted);
        };
        let id = tree
            .locate(particle)
            .ok_or(TreeFitError::UnknownParticle(particle))?;
        let delta = tree.filter_node(state, id, weight)?;
        self.chi_square += delta;
        debug!("{weight:?} of {particle}: dchi2 = {delta:.4}");
        Ok(delta)
    }

    /// Write the current state onto the caller's tree.
    ///
    /// `head` must have the topology of the particle tree given to [`Estimator::fit`].
    pub fn update_particles(&self, head: &mut Particle) -> Result<(), TreeFitError> {
        let (Some(tree), Some(state)) = (&self.tree, &self.state) else {
            return Err(TreeFitError::NotFitted);
        };
        let summary = FitSummary {
            status: self.status,
            chi_square: self.chi_square,
            ndof: tree.ndof(),
            p_value: self.p_value(),
            iterations: self.iterations,
        };
        ResultMapper::new(tree, state).update_tree(head, summary)
    }

    /// Fit quality summary, including the per-particle residual chi-square.
    pub fn result(&self) -> Result<FitResult, TreeFitError> {
        let (Some(tree), Some(state)) = (&self.tree, &self.state) else {
            return Err(TreeFitError::NotFitted);
        };
        let per_node = tree.chi_square_per_node(state)?;
        let node_chi_square = tree
            .nodes()
            .iter()
            .zip(per_node)
            .map(|(node, chi_square)| (node.particle(), chi_square))
            .collect();
        Ok(FitResult {
            status: self.status,
            termination: self.termination,
            chi_square: self.chi_square,
            ndof: self.ndof(),
            p_value: self.p_value(),
            iterations: self.iterations,
            chi_square_history: self.chi_square_history.clone(),
            node_chi_square,
        })
    }

    pub fn params(&self) -> &FitParams {
        &self.params
    }

    pub fn status(&self) -> FitStatus {
        self.status
    }

    pub fn termination(&self) -> Option<Termination> {
        self.termination
    }

    /// Running chi-square of the last filter pass, plus any [`Estimator::add`]/[`Estimator::remove`].
    pub fn chi_square(&self) -> f64 {
        self.chi_square
    }

    /// Degrees of freedom of the fitted tree, `0` before a fit.
    pub fn ndof(&self) -> i32 {
        self.tree.as_ref().map_or(0, DecayTree::ndof)
    }

    pub fn p_value(&self) -> f64 {
        chi_square_p_value(self.chi_square, self.ndof())
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn chi_square_history(&self) -> &[f64] {
        &self.chi_square_history
    }

    pub fn tree(&self) -> Option<&DecayTree> {
        self.tree.as_ref()
    }

    pub fn state(&self) -> Option<&ParameterState> {
        self.state.as_ref()
    }

    /// Mutable access to the fitted state, for diagnostics and tests.
    pub fn state_mut(&mut self) -> Option<&mut ParameterState> {
        self.state.as_mut()
    }
}

impl Default for Estimator {
    fn default() -> Self {
        Estimator::new(FitParams::default())
    }
}
