//! # Global parameter state
//!
//! [`ParameterState`] holds the flat parameter vector of a decay tree, its covariance matrix,
//! and the running chi-square accumulated by the filter passes.
//!
//! Every node of the tree owns a contiguous slice of the vector (see
//! [`DecayNode`](crate::decay_node::DecayNode)), so the state itself knows nothing about
//! particles: it is plain linear algebra with a few invariants:
//!
//! - the covariance is square, symmetric, and has the dimension of the vector,
//! - existing entries survive a [`resize`](ParameterState::resize) index for index,
//! - after an accepted iteration no active diagonal entry is negative
//!   (checked by [`test_cov`](ParameterState::test_cov)).

use nalgebra::{DMatrix, DVector};

use crate::treefit_errors::TreeFitError;

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterState {
    par: DVector<f64>,
    cov: DMatrix<f64>,
    chi_square: f64,
}

impl ParameterState {
    /// Zero-filled state of dimension `dim`.
    ///
    /// A negative dimension is not representable, so this cannot fail.
    pub fn new(dim: usize) -> Self {
        ParameterState {
            par: DVector::zeros(dim),
            cov: DMatrix::zeros(dim, dim),
            chi_square: 0.0,
        }
    }

    pub fn dim(&self) -> usize {
        self.par.len()
    }

    /// Grow the state to `new_dim`, keeping the existing entries and zero-filling the rest.
    ///
    /// Return
    /// ----------
    /// * `Err(TreeFitError::UnsupportedShrink)` if `new_dim` is smaller than the current dimension.
    pub fn resize(&mut self, new_dim: usize) -> Result<(), TreeFitError> {
        let dim = self.dim();
        if new_dim < dim {
            return Err(TreeFitError::UnsupportedShrink {
                current: dim,
                requested: new_dim,
            });
        }
        if new_dim == dim {
            return Ok(());
        }

        let mut par = DVector::zeros(new_dim);
        par.rows_mut(0, dim).copy_from(&self.par);

        let mut cov = DMatrix::zeros(new_dim, new_dim);
        cov.view_mut((0, 0), (dim, dim)).copy_from(&self.cov);

        self.par = par;
        self.cov = cov;
        Ok(())
    }

    pub fn par(&self) -> &DVector<f64> {
        &self.par
    }

    pub fn par_mut(&mut self) -> &mut DVector<f64> {
        &mut self.par
    }

    pub fn cov(&self) -> &DMatrix<f64> {
        &self.cov
    }

    pub fn cov_mut(&mut self) -> &mut DMatrix<f64> {
        &mut self.cov
    }

    pub fn chi_square(&self) -> f64 {
        self.chi_square
    }

    pub fn add_chi_square(&mut self, delta: f64) {
        self.chi_square += delta;
    }

    pub fn set_chi_square(&mut self, chi_square: f64) {
        self.chi_square = chi_square;
    }

    pub fn reset_chi_square(&mut self) {
        self.chi_square = 0.0;
    }

    /// `false` iff a diagonal covariance entry is negative (or NaN).
    pub fn test_cov(&self) -> bool {
        self.cov.diagonal().iter().all(|v| *v >= 0.0)
    }

    /// Restore the mirror symmetry of the covariance after a numerical update.
    pub fn symmetrize(&mut self) {
        let transposed = self.cov.transpose();
        self.cov += transposed;
        self.cov *= 0.5;
    }

    /// Parameters at `indices`, in the given order.
    ///
    /// # Panics
    /// If an index is outside the state: asking for a parameter the tree never allocated is a
    /// bookkeeping bug, not a recoverable condition.
    pub fn sub_par(&self, indices: &[usize]) -> DVector<f64> {
        self.check_indices(indices);
        DVector::from_iterator(indices.len(), indices.iter().map(|&i| self.par[i]))
    }

    /// Covariance block of the parameters at `indices`.
    ///
    /// # Panics
    /// Same contract as [`ParameterState::sub_par`].
    pub fn sub_cov(&self, indices: &[usize]) -> DMatrix<f64> {
        self.check_indices(indices);
        let n = indices.len();
        DMatrix::from_fn(n, n, |r, c| self.cov[(indices[r], indices[c])])
    }

    fn check_indices(&self, indices: &[usize]) {
        let dim = self.dim();
        if let Some(bad) = indices.iter().find(|&&i| i >= dim) {
            panic!("parameter index {bad} out of range for state of dimension {dim}");
        }
    }
}
