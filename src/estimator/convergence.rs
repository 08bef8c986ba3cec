//! Convergence and divergence state machine of the iterative fit.
//!
//! [`run_iterations`] repeatedly calls a filter pass and decides after each one whether the
//! fit converged, diverged, or should continue. It only sees the [`ParameterState`] and the
//! chi-square returned by the pass, so it can be driven by a scripted pass in tests.
//!
//! Rollback is asymmetric: on divergence the parameter vector and the running chi-square
//! are restored to their values before the failing pass while the covariance keeps the
//! diverged value. On budget exhaustion nothing is restored.

use log::{debug, warn};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use super::FitStatus;
use crate::fit_params::FitParams;
use crate::parameter_state::ParameterState;
use crate::treefit_errors::TreeFitError;

/// Why the iteration loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    /// Chi-square change below the convergence threshold.
    Converged,
    /// The decay tree could not be built or seeded.
    BadInput,
    /// Chi-square jumped by more than twice the degrees of freedom.
    FastDiverging,
    /// Too many consecutive chi-square increases.
    SlowDiverging,
    /// Iteration cap reached without convergence.
    IterationBudgetExhausted,
    /// Converged, but the covariance has a negative variance.
    NegativeVariance,
    /// A filter pass raised a numerical error.
    FilterFailure,
}

impl Termination {
    /// Terminal status reported for this termination reason.
    pub fn status(self) -> FitStatus {
        match self {
            Termination::Converged => FitStatus::Success,
            Termination::BadInput => FitStatus::BadInput,
            Termination::FastDiverging
            | Termination::NegativeVariance
            | Termination::FilterFailure => FitStatus::Failed,
            Termination::SlowDiverging | Termination::IterationBudgetExhausted => {
                FitStatus::NonConverged
            }
        }
    }
}

/// Result of one run of the iteration loop.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationOutcome {
    pub termination: Termination,
    /// Chi-square returned by every completed pass, in order.
    pub chi_square_history: Vec<f64>,
    /// Number of filter passes started.
    pub iterations: usize,
}

impl IterationOutcome {
    pub fn status(&self) -> FitStatus {
        self.termination.status()
    }
}

/// Iterate `pass` until convergence, divergence or exhaustion of the iteration budget.
///
/// Arguments
/// -----------------
/// * `params`: thresholds and iteration caps.
/// * `state`: parameter state, updated in place by `pass`.
/// * `ndof`: degrees of freedom, the fast-divergence threshold is `2·ndof`.
/// * `pass`: one filter pass, called with `true` on the first iteration.
///
/// Return
/// ----------
/// * An [`IterationOutcome`] with the termination reason and the chi-square history.
///
/// See also
/// ------------
/// * [`Termination`] – Mapping of each stop reason to a [`FitStatus`].
pub fn run_iterations<F>(
    params: &FitParams,
    state: &mut ParameterState,
    ndof: i32,
    mut pass: F,
) -> IterationOutcome
where
    F: FnMut(&mut ParameterState, bool) -> Result<f64, TreeFitError>,
{
    let mut history = Vec::with_capacity(params.max_iterations);
    let mut n_diverging = 0;
    let mut previous: Option<f64> = None;

    let finish = |termination, history, iterations| IterationOutcome {
        termination,
        chi_square_history: history,
        iterations,
    };

    for i in 0..params.max_iterations {
        let before = state.par().clone();
        let before_chi_square = state.chi_square();
        let chi_square = match pass(state, i == 0) {
            Ok(chi_square) => chi_square,
            Err(err) => {
                warn!("filter pass {i} failed: {err}");
                restore(state, &before, before_chi_square);
                return finish(Termination::FilterFailure, history, i + 1);
            }
        };
        history.push(chi_square);
        debug!("iteration {i}: chi2 = {chi_square:.4}");

        if let Some(previous) = previous {
            let delta = chi_square - previous;

            if delta.abs() < params.convergence_threshold {
                if !state.test_cov() {
                    warn!("fit converged with a negative variance");
                    return finish(Termination::NegativeVariance, history, i + 1);
                }
                return finish(Termination::Converged, history, i + 1);
            }
            if i > 1 && delta > 2.0 * ndof as f64 {
                warn!("fit diverging fast: chi2 {previous:.2} -> {chi_square:.2}");
                restore(state, &before, before_chi_square);
                return finish(Termination::FastDiverging, history, i + 1);
            }
            if delta > 0.0 && n_diverging >= params.max_consecutive_diverging {
                warn!("fit diverging slowly: {n_diverging} consecutive chi2 increases");
                restore(state, &before, before_chi_square);
                return finish(Termination::SlowDiverging, history, i + 1);
            }
            if delta > 0.0 {
                n_diverging += 1;
            } else {
                n_diverging = 0;
            }
        }
        previous = Some(chi_square);
    }

    warn!(
        "fit did not converge within {} iterations",
        params.max_iterations
    );
    finish(
        Termination::IterationBudgetExhausted,
        history,
        params.max_iterations,
    )
}

/// Roll back to the parameters and chi-square of the previous pass. The covariance is kept.
fn restore(state: &mut ParameterState, par: &DVector<f64>, chi_square: f64) {
    state.par_mut().copy_from(par);
    state.set_chi_square(chi_square);
}
