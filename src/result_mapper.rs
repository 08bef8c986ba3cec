//! # Write-back of the fitted state
//!
//! [`ResultMapper`] reads the global [`ParameterState`] through the index bookkeeping of a
//! [`DecayTree`] and produces one [`FittedKinematics`] record per particle.
//!
//! ## Conventions
//!
//! * The exported covariance is always 7×7, ordered `(px, py, pz, E, x, y, z)`.
//! * Particles without a fitted energy get `E = sqrt(|p|² + m²)`, and their energy row is
//!   propagated with `∂E/∂p = p / E`.
//! * The vertex is the particle's own decay vertex, or the vertex it is produced at when it has
//!   none (final-state particles, resonances). Without any vertex in the tree the vertex rows
//!   are zero.
//! * The proper lifetime is `t = L·m / (|p|·c)`, with `L` the fitted decay length and `m` the
//!   nominal mass.

use nalgebra::{DMatrix, DVector, Vector3};

use crate::constants::{Matrix7, EPS, SPEED_OF_LIGHT};
use crate::decay_node::{decay_vertex_index, DecayNode, NodeId};
use crate::decay_tree::DecayTree;
use crate::parameter_state::ParameterState;
use crate::particle::{FitSummary, FittedKinematics, Particle};
use crate::treefit_errors::TreeFitError;

/// Read-only view of a fitted state.
pub struct ResultMapper<'a> {
    tree: &'a DecayTree,
    state: &'a ParameterState,
}

impl<'a> ResultMapper<'a> {
    pub fn new(tree: &'a DecayTree, state: &'a ParameterState) -> Self {
        ResultMapper { tree, state }
    }

    /// State indices of the momentum block and, if any, of the decay vertex of `id`.
    fn indices(&self, id: NodeId) -> (Vec<usize>, Option<usize>) {
        let node = self.tree.node(id);
        let mut indices: Vec<usize> =
            (node.mom_index()..node.mom_index() + node.momentum_dim()).collect();
        let vertex = decay_vertex_index(self.tree.nodes(), id);
        if let Some(pos) = vertex {
            indices.extend(pos..pos + 3);
        }
        (indices, vertex)
    }

    /// Covariance of `(px, py, pz, E, x, y, z)` for node `id`.
    ///
    /// Nodes with a fitted energy are copied directly. For the others the energy row is
    /// obtained with the Jacobian of the mass-shell relation.
    pub fn extract_covariance(&self, id: NodeId) -> Matrix7 {
        let node = self.tree.node(id);
        let (indices, vertex) = self.indices(id);
        let sub_cov = self.state.sub_cov(&indices);

        let mut jacobian = DMatrix::<f64>::zeros(7, indices.len());
        if node.has_energy() {
            jacobian.view_mut((0, 0), (4, 4)).fill_with_identity();
        } else {
            jacobian.view_mut((0, 0), (3, 3)).fill_with_identity();
            let p4 = node.four_momentum(self.state.par());
            if p4.w > EPS {
                for i in 0..3 {
                    jacobian[(3, i)] = p4[i] / p4.w;
                }
            }
        }
        if vertex.is_some() {
            let offset = node.momentum_dim();
            jacobian
                .view_mut((4, offset), (3, 3))
                .fill_with_identity();
        }

        let full = &jacobian * sub_cov * jacobian.transpose();
        Matrix7::from_fn(|r, c| full[(r, c)])
    }

    /// Fitted kinematics of node `id`.
    ///
    /// Arguments
    /// -----------------
    /// * `id`: node of the tree.
    /// * `chi_square`: chi-square contribution to attach to the record.
    ///
    /// Return
    /// ----------
    /// * `Err(DegenerateMomentum)` if a lifetime is requested for a particle at rest.
    pub fn node_kinematics(&self, id: NodeId, chi_square: f64) -> Result<FittedKinematics, TreeFitError> {
        let node = self.tree.node(id);
        let x = self.state.par();

        let vertex = decay_vertex_index(self.tree.nodes(), id)
            .map(|pos| Vector3::new(x[pos], x[pos + 1], x[pos + 2]));
        let (decay_length, lifetime) = match node.tau_index() {
            Some(tau) => {
                let length = (x[tau], self.state.cov()[(tau, tau)].sqrt());
                (Some(length), Some(self.lifetime(node, tau)?))
            }
            None => (None, None),
        };

        Ok(FittedKinematics {
            four_momentum: node.four_momentum(x),
            vertex,
            covariance: self.extract_covariance(id),
            decay_length,
            lifetime,
            chi_square,
        })
    }

    /// Proper lifetime and its uncertainty, propagated from `(L, px, py, pz)`.
    fn lifetime(&self, node: &DecayNode, tau: usize) -> Result<(f64, f64), TreeFitError> {
        let x = self.state.par();
        let p = node.momentum(x);
        let p_norm = p.norm();
        if p_norm < EPS {
            return Err(TreeFitError::DegenerateMomentum(format!(
                "{} has no momentum, its lifetime is undefined",
                node.name()
            )));
        }
        let length = x[tau];
        let scale = node.pdg_mass() / (p_norm * SPEED_OF_LIGHT);
        let value = length * scale;

        let mut indices = vec![tau];
        indices.extend(node.mom_index()..node.mom_index() + 3);
        let mut gradient = DVector::<f64>::zeros(4);
        gradient[0] = scale;
        for i in 0..3 {
            gradient[i + 1] = -value * p[i] / (p_norm * p_norm);
        }
        let variance = gradient.dot(&(self.state.sub_cov(&indices) * &gradient));
        Ok((value, variance.sqrt()))
    }

    /// Write the fitted kinematics onto every particle of `head`, and `summary` onto `head`.
    ///
    /// Every record is computed before the first one is written, so on error `head` is left
    /// untouched.
    ///
    /// Return
    /// ----------
    /// * `Err(TopologyMismatch)` if `head` is not the tree the state was fitted for.
    /// * `Err(DegenerateMomentum)` if a particle with a decay length has no momentum.
    pub fn update_tree(&self, head: &mut Particle, summary: FitSummary) -> Result<(), TreeFitError> {
        let per_node = self.tree.chi_square_per_node(self.state)?;
        let mut records = Vec::with_capacity(self.tree.nodes().len());
        self.collect_node(head, self.tree.head(), &per_node, &mut records)?;

        write_node(head, &mut records.into_iter());
        head.summary = Some(summary);
        Ok(())
    }

    /// Kinematics of `particle` and its daughters, mother first.
    fn collect_node(
        &self,
        particle: &Particle,
        id: NodeId,
        per_node: &[f64],
        records: &mut Vec<FittedKinematics>,
    ) -> Result<(), TreeFitError> {
        let node = self.tree.node(id);
        if particle.id != node.particle() || particle.daughters.len() != node.daughters().len() {
            return Err(TreeFitError::TopologyMismatch(format!(
                "particle {} {} does not match node {} {}",
                particle.name,
                particle.id,
                node.name(),
                node.particle()
            )));
        }
        records.push(self.node_kinematics(id, per_node[id.0])?);
        for (daughter, &daughter_id) in particle.daughters.iter().zip(node.daughters()) {
            self.collect_node(daughter, daughter_id, per_node, records)?;
        }
        Ok(())
    }
}

/// Assign `records` in the order [`ResultMapper::collect_node`] produced them.
fn write_node(particle: &mut Particle, records: &mut impl Iterator<Item = FittedKinematics>) {
    particle.fitted = records.next();
    for daughter in particle.daughters.iter_mut() {
        write_node(daughter, records);
    }
}

#[cfg(test)]
mod result_mapper_test {
    use super::*;
    use crate::estimator::FitStatus;
    use crate::fit_params::FitParams;
    use approx::assert_relative_eq;
    use nalgebra::{Matrix3, Matrix6, Vector3};

    /// Xi- -> (Lambda0 -> p pi-) pi- with exact measurements.
    fn cascade() -> Particle {
        let cov = Matrix6::identity() * 1e-4;
        let xi_vertex = Vector3::new(0.0, 0.0, 2.0);
        // Lambda0 flies along p_proton + p_pion = (0.13, 0.09, 1.45)
        let lambda_vertex = xi_vertex + Vector3::new(0.13, 0.09, 1.45) * 4.0;
        let p_proton = Vector3::new(0.15, 0.05, 1.2);
        let p_pion = Vector3::new(-0.02, 0.04, 0.25);
        let p_bachelor = Vector3::new(0.05, -0.1, 0.4);
        Particle::composite(
            0,
            "Xi-",
            1.32171,
            vec![
                Particle::composite(
                    1,
                    "Lambda0",
                    1.115683,
                    vec![
                        Particle::track(2, "p+", 0.938, lambda_vertex + p_proton, p_proton, cov),
                        Particle::track(3, "pi-", 0.1396, lambda_vertex + p_pion, p_pion, cov),
                    ],
                ),
                Particle::track(4, "pi-", 0.1396, xi_vertex + p_bachelor, p_bachelor, cov),
            ],
        )
    }

    fn fitted() -> (DecayTree, ParameterState, Particle) {
        let head = cascade();
        let tree = DecayTree::new(&head, &FitParams::default()).unwrap();
        let mut state = ParameterState::new(tree.dim());
        tree.init(&mut state).unwrap();
        for i in 0..3 {
            tree.filter(&mut state, i == 0).unwrap();
        }
        (tree, state, head)
    }

    #[test]
    fn test_energy_row_of_final_state() {
        let (tree, state, _) = fitted();
        let mapper = ResultMapper::new(&tree, &state);
        let pion = tree.locate(crate::particle::ParticleId(4)).unwrap();
        let node = tree.node(pion);
        let cov = mapper.extract_covariance(pion);

        let p4 = node.four_momentum(state.par());
        let jac = Vector3::new(p4.x / p4.w, p4.y / p4.w, p4.z / p4.w);
        let p_cov: Matrix3<f64> = cov.fixed_view::<3, 3>(0, 0).into_owned();
        assert_relative_eq!(cov[(3, 3)], (jac.transpose() * p_cov * jac)[0], epsilon = 1e-15);
        assert_relative_eq!(cov, cov.transpose());
        // produced at the Xi vertex
        let head_pos = tree.node(tree.head()).pos_index().unwrap();
        assert_relative_eq!(cov[(4, 4)], state.cov()[(head_pos, head_pos)], epsilon = 1e-15);
    }

    #[test]
    fn test_composite_kinematics() {
        let (tree, state, _) = fitted();
        let mapper = ResultMapper::new(&tree, &state);
        let lambda = tree.locate(crate::particle::ParticleId(1)).unwrap();
        let kin = mapper.node_kinematics(lambda, 0.0).unwrap();

        let vertex = kin.vertex.unwrap();
        assert_relative_eq!(vertex, Vector3::new(0.52, 0.36, 7.8), epsilon = 1e-6);
        let (length, length_error) = kin.decay_length.unwrap();
        assert_relative_eq!(length, (vertex - Vector3::new(0.0, 0.0, 2.0)).norm(), epsilon = 1e-6);
        assert!(length_error > 0.0);

        let (lifetime, lifetime_error) = kin.lifetime.unwrap();
        let p = kin.momentum().norm();
        assert_relative_eq!(lifetime, length * 1.115683 / (p * SPEED_OF_LIGHT), epsilon = 1e-9);
        assert!(lifetime_error > 0.0);

        let tau = tree.node(lambda).tau_index().unwrap();
        assert_eq!(state.par()[tau], length);
    }

    #[test]
    fn test_update_tree() {
        let (tree, state, mut head) = fitted();
        let summary = FitSummary {
            status: FitStatus::Success,
            chi_square: 0.0,
            ndof: tree.ndof(),
            p_value: 1.0,
            iterations: 3,
        };
        ResultMapper::new(&tree, &state)
            .update_tree(&mut head, summary)
            .unwrap();

        assert_eq!(head.summary, Some(summary));
        let head_fit = head.fitted.as_ref().unwrap();
        assert!(head_fit.decay_length.is_none());
        assert_relative_eq!(head_fit.vertex.unwrap(), Vector3::new(0.0, 0.0, 2.0), epsilon = 1e-6);

        let proton = head.find(crate::particle::ParticleId(2)).unwrap();
        let proton_fit = proton.fitted.as_ref().unwrap();
        assert_relative_eq!(proton_fit.mass(), 0.938, epsilon = 1e-9);
        assert!(proton.summary.is_none());
    }

    #[test]
    fn test_update_tree_rejects_other_topology() {
        let (tree, state, _) = fitted();
        let mut other = cascade();
        other.daughters.pop();
        let summary = FitSummary {
            status: FitStatus::Success,
            chi_square: 0.0,
            ndof: 0,
            p_value: 0.0,
            iterations: 0,
        };
        let err = ResultMapper::new(&tree, &state)
            .update_tree(&mut other, summary)
            .unwrap_err();
        assert!(matches!(err, TreeFitError::TopologyMismatch(_)));
    }

    #[test]
    fn test_failed_update_leaves_particles_untouched() {
        let (tree, mut state, mut head) = fitted();
        let lambda = tree.locate(crate::particle::ParticleId(1)).unwrap();
        let mom = tree.node(lambda).mom_index();
        state.par_mut().rows_mut(mom, 3).fill(0.0);

        let summary = FitSummary {
            status: FitStatus::Success,
            chi_square: 0.0,
            ndof: 0,
            p_value: 0.0,
            iterations: 0,
        };
        let err = ResultMapper::new(&tree, &state)
            .update_tree(&mut head, summary)
            .unwrap_err();

        assert!(matches!(err, TreeFitError::DegenerateMomentum(_)));
        assert_eq!(head, cascade());
    }
}
