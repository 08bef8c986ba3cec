//! # Decay tree
//!
//! [`DecayTree`] turns the caller's [`Particle`] tree into the fitter's internal model: an
//! arena of [`DecayNode`]s with global parameter indices, and the flat, ordered list of
//! [`Constraint`]s they emit.
//!
//! ## Responsibilities
//!
//! - **Construction** ([`DecayTree::new`]): validate the input tree, lay out the parameter
//!   vector depth-first, build and sort the constraint list once.
//! - **Seeding** ([`DecayTree::init`]): fill the parameter vector in dependency order.
//! - **Filtering** ([`DecayTree::filter`]): one full Kalman pass over all constraints.
//! - **Diagnostics**: lookup by [`ParticleId`], instantaneous residual chi-square,
//!   degrees of freedom, parameter names.
//!
//! ## See also
//! * [`Estimator`](crate::estimator::Estimator) – Iterates [`DecayTree::filter`] to convergence.

use std::collections::HashMap;

use itertools::Itertools;
use log::{debug, trace, warn};
use nalgebra::{Cholesky, DVector};

use crate::constraint::{Constraint, ConstraintKind, Weight};
use crate::decay_node::{
    self, init_cov, init_par1, init_par2, init_tau, update_index, DecayNode, NodeId, NodeKind,
};
use crate::fit_params::FitParams;
use crate::parameter_state::ParameterState;
use crate::particle::{Measurement, Particle, ParticleId, ParticleKind};
use crate::treefit_errors::TreeFitError;

#[derive(Debug, Clone)]
pub struct DecayTree {
    nodes: Vec<DecayNode>,
    constraints: Vec<Constraint>,
    lookup: HashMap<ParticleId, NodeId>,
    dim: usize,
    params: FitParams,
}

impl DecayTree {
    /// Build the internal tree for `head`.
    ///
    /// Arguments
    /// -----------------
    /// * `head`: root of the caller's particle tree, a composite or a resonance.
    /// * `params`: fit configuration, cloned into the tree.
    ///
    /// Return
    /// ----------
    /// * `Err(InvalidDecayTree)` for a malformed tree: final-state head, final state without
    ///   the matching measurement or with daughters, intermediate particle without daughters,
    ///   negative or non-finite masses and lifetimes.
    /// * `Err(DuplicateParticleId)` if two particles share an identity.
    pub fn new(head: &Particle, params: &FitParams) -> Result<Self, TreeFitError> {
        if head.is_final_state() {
            return Err(TreeFitError::InvalidDecayTree(format!(
                "head {} must be a composite or a resonance",
                head.name
            )));
        }

        let mut tree = DecayTree {
            nodes: Vec::with_capacity(head.count()),
            constraints: Vec::new(),
            lookup: HashMap::new(),
            dim: 0,
            params: params.clone(),
        };
        tree.add_particle(head, None, 0, false)?;
        let head_id = tree.head();
        tree.dim = update_index(&mut tree.nodes, head_id, 0);

        let mut constraints = Vec::new();
        for (i, node) in tree.nodes.iter().enumerate() {
            node.add_to_constraint_list(&tree.nodes, NodeId(i), &mut constraints, Weight::Normal);
        }
        constraints.sort_by_key(Constraint::order_key);
        tree.constraints = constraints;

        debug!(
            "decay tree of {}: {} nodes, dimension {}, {} constraints, ndof {}",
            head.name,
            tree.nodes.len(),
            tree.dim,
            tree.constraints.len(),
            tree.ndof()
        );
        Ok(tree)
    }

    /// Recursively append `particle` and its daughters to the arena, mother first.
    fn add_particle(
        &mut self,
        particle: &Particle,
        mother: Option<NodeId>,
        depth: usize,
        vertex_above: bool,
    ) -> Result<NodeId, TreeFitError> {
        validate(particle)?;
        let id = NodeId(self.nodes.len());
        if self.lookup.insert(particle.id, id).is_some() {
            return Err(TreeFitError::DuplicateParticleId(particle.id));
        }

        let kind = match (mother, particle.kind) {
            (None, kind) => NodeKind::Head {
                has_vertex: kind == ParticleKind::Composite,
            },
            (Some(_), ParticleKind::Track) => NodeKind::FinalStateTrack,
            (Some(_), ParticleKind::Photon) => NodeKind::FinalStatePhoton,
            (Some(_), ParticleKind::Composite) => NodeKind::Composite,
            (Some(_), ParticleKind::Resonance) => NodeKind::Resonance,
        };
        let mut node = DecayNode::new(
            particle.id,
            &particle.name,
            kind,
            mother,
            depth,
            particle.pdg_mass,
            vertex_above,
        );
        node.measurement = particle.measurement.clone();
        node.vertex_hint = particle.vertex_hint;

        if particle.mass_constraint {
            if particle.is_final_state() {
                warn!(
                    "mass constraint ignored for final-state particle {}",
                    particle.name
                );
            } else {
                node.mass_constraint = true;
            }
        }
        if let Some(lifetime) = particle.lifetime_constraint {
            if node.has_tau() {
                node.lifetime = Some(lifetime);
            } else {
                warn!(
                    "lifetime constraint ignored for {}: no production vertex",
                    particle.name
                );
            }
        }
        if mother.is_none() && self.params.use_ip_constraint {
            if particle.kind == ParticleKind::Composite {
                node.ip_constraint = true;
            } else {
                warn!(
                    "interaction point constraint ignored: head {} has no vertex",
                    particle.name
                );
            }
        }

        let owns_vertex = matches!(
            kind,
            NodeKind::Composite | NodeKind::Head { has_vertex: true }
        );
        self.nodes.push(node);

        let mut daughters = Vec::with_capacity(particle.daughters.len());
        for daughter in &particle.daughters {
            daughters.push(self.add_particle(
                daughter,
                Some(id),
                depth + 1,
                vertex_above || owns_vertex,
            )?);
        }
        self.nodes[id.0].daughters = daughters;
        Ok(id)
    }

    pub fn head(&self) -> NodeId {
        NodeId(0)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn nodes(&self) -> &[DecayNode] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> &DecayNode {
        &self.nodes[id.0]
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    pub fn params(&self) -> &FitParams {
        &self.params
    }

    /// Degrees of freedom: total constraint dimension minus the number of parameters.
    pub fn ndof(&self) -> i32 {
        let constrained: usize = self
            .constraints
            .iter()
            .filter(|c| c.weight != Weight::Disabled)
            .map(|c| c.dim)
            .sum();
        constrained as i32 - self.dim as i32
    }

    /// Seed all parameters of `state` in dependency order.
    ///
    /// `state` must have the dimension of the tree. The covariance is left untouched, it is
    /// reset at the start of every [`DecayTree::filter`] pass.
    ///
    /// Return
    /// ----------
    /// * `Err(TopologyMismatch)` if `state` does not have the tree dimension.
    /// * `Err(DegenerateSeed | InsufficientVertexInfo | DegenerateMomentum)` when a vertex or a
    ///   decay length cannot be seeded.
    pub fn init(&self, state: &mut ParameterState) -> Result<(), TreeFitError> {
        if state.dim() != self.dim {
            return Err(TreeFitError::TopologyMismatch(format!(
                "state of dimension {} for a tree of dimension {}",
                state.dim(),
                self.dim
            )));
        }
        state.par_mut().fill(0.0);
        state.reset_chi_square();

        let pre_order: Vec<NodeId> = (0..self.nodes.len()).map(NodeId).collect();
        let post_order = self.post_order(self.head());

        let mut seeded = vec![false; self.nodes.len()];
        for &id in &pre_order {
            seeded[id.0] = init_par1(&self.nodes[id.0], state);
        }
        for &id in &post_order {
            seeded[id.0] = init_par2(&self.nodes, id, state, &seeded, &self.params)?;
        }
        for &id in &pre_order {
            init_tau(&self.nodes, id, state, &mut seeded)?;
        }
        Ok(())
    }

    /// Daughters before mothers.
    fn post_order(&self, id: NodeId) -> Vec<NodeId> {
        let mut order: Vec<NodeId> = self.nodes[id.0]
            .daughters
            .iter()
            .flat_map(|&d| self.post_order(d))
            .collect();
        order.push(id);
        order
    }

    /// One full filter pass over every constraint.
    ///
    /// The covariance is reset to the priors, so each pass linearizes around the current
    /// parameters with fresh uncertainties. Exact nonlinear constraints are re-linearized up
    /// to [`FitParams::max_constraint_iterations`] times on every pass, so they hold at the
    /// end of each pass. Measurements are re-linearized only on the first pass.
    ///
    /// Return
    /// ----------
    /// * The accumulated chi-square of the pass, also stored in `state`.
    /// * The first error raised by a constraint; `state` is then partially updated.
    pub fn filter(&self, state: &mut ParameterState, first_pass: bool) -> Result<f64, TreeFitError> {
        state.cov_mut().fill(0.0);
        for node in &self.nodes {
            init_cov(node, state, &self.params);
        }
        state.reset_chi_square();

        for constraint in &self.constraints {
            let max_iterations = if first_pass || !constraint.kind.has_variance() {
                self.params.max_constraint_iterations
            } else {
                1
            };
            self.apply(constraint, state, max_iterations)?;
        }
        trace!("filter pass: chi2 = {:.4}", state.chi_square());
        Ok(state.chi_square())
    }

    /// Apply the constraints of one node carrying a measurement covariance with `weight`,
    /// on top of the current state.
    ///
    /// Exact constraints are skipped: they cannot be downdated, and adding one twice would
    /// make the gain matrix singular.
    pub fn filter_node(
        &self,
        state: &mut ParameterState,
        id: NodeId,
        weight: Weight,
    ) -> Result<f64, TreeFitError> {
        let mut total = 0.0;
        for constraint in self
            .constraints
            .iter()
            .filter(|c| c.node == id && c.kind.has_variance())
        {
            let weighted = Constraint {
                weight,
                ..constraint.clone()
            };
            total += self.apply(&weighted, state, 1)?;
        }
        Ok(total)
    }

    fn apply(
        &self,
        constraint: &Constraint,
        state: &mut ParameterState,
        max_iterations: usize,
    ) -> Result<f64, TreeFitError> {
        let columns = self.columns(constraint);
        let node = &self.nodes[constraint.node.0];
        constraint.filter(state, &columns, max_iterations, &node.name, |x| {
            decay_node::project(&self.nodes, constraint.node, constraint.kind, x, &self.params)
        })
    }

    /// State indices a constraint depends on.
    fn columns(&self, constraint: &Constraint) -> Vec<usize> {
        constraint
            .touches
            .iter()
            .flat_map(|id| self.nodes[id.0].parameter_indices())
            .sorted_unstable()
            .dedup()
            .collect()
    }

    /// Instantaneous residual chi-square of the constraints carrying a measurement covariance.
    ///
    /// Unlike the running chi-square accumulated by [`DecayTree::filter`], this evaluates
    /// `rᵀ V⁻¹ r` at the current parameters. Exact constraints do not contribute.
    pub fn chi_square(&self, state: &ParameterState) -> Result<f64, TreeFitError> {
        Ok(self.chi_square_per_node(state)?.iter().sum())
    }

    /// Residual chi-square split by the node emitting each constraint, indexed by [`NodeId`].
    pub fn chi_square_per_node(&self, state: &ParameterState) -> Result<Vec<f64>, TreeFitError> {
        let mut per_node = vec![0.0; self.nodes.len()];
        for constraint in self
            .constraints
            .iter()
            .filter(|c| c.kind.has_variance() && c.weight != Weight::Disabled)
        {
            let projection = decay_node::project(
                &self.nodes,
                constraint.node,
                constraint.kind,
                state.par(),
                &self.params,
            )?;
            let node = &self.nodes[constraint.node.0];
            let cholesky = Cholesky::new(projection.variance).ok_or_else(|| {
                TreeFitError::NonPositiveCovariance(format!(
                    "{} constraint of {}",
                    constraint.kind, node.name
                ))
            })?;
            let weighted: DVector<f64> = cholesky.solve(&projection.residual);
            per_node[constraint.node.0] += projection.residual.dot(&weighted);
        }
        Ok(per_node)
    }

    /// Node fitted for the caller's particle `particle`.
    pub fn locate(&self, particle: ParticleId) -> Option<NodeId> {
        self.lookup.get(&particle).copied()
    }

    fn located(&self, particle: ParticleId) -> Result<&DecayNode, TreeFitError> {
        self.locate(particle)
            .map(|id| &self.nodes[id.0])
            .ok_or(TreeFitError::UnknownParticle(particle))
    }

    pub fn mom_index(&self, particle: ParticleId) -> Result<usize, TreeFitError> {
        Ok(self.located(particle)?.mom_index())
    }

    pub fn pos_index(&self, particle: ParticleId) -> Result<Option<usize>, TreeFitError> {
        Ok(self.located(particle)?.pos_index())
    }

    pub fn tau_index(&self, particle: ParticleId) -> Result<Option<usize>, TreeFitError> {
        Ok(self.located(particle)?.tau_index())
    }

    /// Name of the global parameter `index`, e.g. `"Lambda0 px"`.
    pub fn parameter_name(&self, index: usize) -> Option<String> {
        self.nodes.iter().find_map(|node| node.parameter_name(index))
    }

    /// Make every internal four-momentum exactly equal to the sum of its daughters.
    ///
    /// Applied bottom-up so that corrected daughters propagate to their mothers.
    pub fn force_p4_sum(&self, state: &mut ParameterState) -> Result<(), TreeFitError> {
        for id in self.post_order(self.head()) {
            let node = &self.nodes[id.0];
            if node.is_final_state() {
                continue;
            }
            let projection = decay_node::project(
                &self.nodes,
                id,
                ConstraintKind::Momentum,
                state.par(),
                &self.params,
            )?;
            let mut momentum = state.par_mut().rows_mut(node.mom_index(), 4);
            momentum -= projection.residual;
        }
        Ok(())
    }
}

/// Structural checks on one particle of the caller's tree.
fn validate(particle: &Particle) -> Result<(), TreeFitError> {
    let invalid = |reason: &str| {
        Err(TreeFitError::InvalidDecayTree(format!(
            "{} {}: {reason}",
            particle.name, particle.id
        )))
    };

    if !particle.pdg_mass.is_finite() || particle.pdg_mass < 0.0 {
        return invalid("mass must be finite and non-negative");
    }
    match particle.lifetime_constraint {
        Some(lifetime) if !(lifetime > 0.0 && lifetime.is_finite()) => {
            return invalid("nominal lifetime must be positive");
        }
        Some(_) if particle.pdg_mass <= 0.0 => {
            return invalid("lifetime constraint requires a positive mass");
        }
        _ => {}
    }

    match (particle.kind, &particle.measurement) {
        (ParticleKind::Track | ParticleKind::Photon, _) if !particle.daughters.is_empty() => {
            invalid("final-state particles cannot have daughters")
        }
        (ParticleKind::Track, Some(Measurement::Track { .. })) => Ok(()),
        (ParticleKind::Track, _) => invalid("tracks require a track measurement"),
        (ParticleKind::Photon, Some(Measurement::Cluster { .. })) => Ok(()),
        (ParticleKind::Photon, _) => invalid("photons require a cluster measurement"),
        (ParticleKind::Composite | ParticleKind::Resonance, _) if particle.daughters.is_empty() => {
            invalid("intermediate particles need at least one daughter")
        }
        (ParticleKind::Composite | ParticleKind::Resonance, Some(_)) => {
            invalid("intermediate particles cannot carry a measurement")
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod decay_tree_test {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Matrix3, Matrix6, Vector3};

    fn track(id: u32, vertex: Vector3<f64>, p: Vector3<f64>) -> Particle {
        Particle::track(
            id,
            "pi",
            0.13957,
            vertex + p.normalize() * 3.0,
            p,
            Matrix6::identity() * 1e-4,
        )
    }

    fn three_prong(vertex: Vector3<f64>) -> Particle {
        Particle::composite(
            0,
            "D+",
            1.8696,
            vec![
                track(1, vertex, Vector3::new(0.4, 0.1, 1.2)),
                track(2, vertex, Vector3::new(-0.3, 0.35, 0.9)),
                track(3, vertex, Vector3::new(0.05, -0.5, 0.7)),
            ],
        )
    }

    #[test]
    fn test_dimension_bookkeeping() {
        let vertex = Vector3::new(0.1, 0.2, 0.3);
        let mut resonance = three_prong(vertex);
        resonance.kind = ParticleKind::Resonance;

        let open = DecayTree::new(&resonance, &FitParams::default()).unwrap();
        let closed = DecayTree::new(&three_prong(vertex), &FitParams::default()).unwrap();

        assert_eq!(open.dim(), 13);
        assert_eq!(closed.dim(), 16);
        // momentum rows only vs. transverse position + momentum rows per track
        assert_eq!(open.ndof(), 0);
        assert_eq!(closed.ndof(), 3);
    }

    #[test]
    fn test_invalid_trees() {
        let vertex = Vector3::zeros();
        let params = FitParams::default();

        let lone_track = track(1, vertex, Vector3::z());
        assert!(matches!(
            DecayTree::new(&lone_track, &params),
            Err(TreeFitError::InvalidDecayTree(_))
        ));

        let empty = Particle::composite(0, "K0", 0.4976, vec![]);
        assert!(DecayTree::new(&empty, &params).is_err());

        let duplicate = Particle::composite(
            0,
            "K0",
            0.4976,
            vec![track(1, vertex, Vector3::z()), track(1, vertex, Vector3::x())],
        );
        assert_eq!(
            DecayTree::new(&duplicate, &params).unwrap_err(),
            TreeFitError::DuplicateParticleId(ParticleId(1))
        );

        let mut unmeasured = three_prong(vertex);
        unmeasured.daughters[1].measurement = None;
        assert!(DecayTree::new(&unmeasured, &params).is_err());

        let negative = three_prong(vertex).with_lifetime_constraint(-1.0);
        assert!(DecayTree::new(&negative, &params).is_err());
    }

    #[test]
    fn test_init_seeds_vertex_and_momentum() {
        let vertex = Vector3::new(0.1, -0.2, 0.5);
        let tree = DecayTree::new(&three_prong(vertex), &FitParams::default()).unwrap();
        let mut state = ParameterState::new(tree.dim());
        tree.init(&mut state).unwrap();

        let pos = tree.pos_index(ParticleId(0)).unwrap().unwrap();
        assert_relative_eq!(
            state.par().fixed_rows::<3>(pos).into_owned(),
            vertex,
            epsilon = 1e-10
        );
        let mom = tree.mom_index(ParticleId(0)).unwrap();
        assert_relative_eq!(state.par()[mom + 2], 1.2 + 0.9 + 0.7, epsilon = 1e-12);
        assert_eq!(tree.tau_index(ParticleId(0)).unwrap(), None);
        assert_eq!(
            tree.mom_index(ParticleId(42)),
            Err(TreeFitError::UnknownParticle(ParticleId(42)))
        );

        let mut wrong = ParameterState::new(tree.dim() + 1);
        assert!(matches!(
            tree.init(&mut wrong),
            Err(TreeFitError::TopologyMismatch(_))
        ));
    }

    #[test]
    fn test_noiseless_filter_pass() {
        let vertex = Vector3::new(0.1, -0.2, 0.5);
        let tree = DecayTree::new(&three_prong(vertex), &FitParams::default()).unwrap();
        let mut state = ParameterState::new(tree.dim());
        tree.init(&mut state).unwrap();
        let seed = state.par().clone();

        let chi2 = tree.filter(&mut state, true).unwrap();
        assert!(chi2.abs() < 1e-12);
        assert!(tree.chi_square(&state).unwrap() < 1e-12);
        assert!(state.test_cov());
        assert_relative_eq!(state.par().clone(), seed, epsilon = 1e-9);
    }

    fn invariant_mass(tree: &DecayTree, state: &ParameterState) -> f64 {
        let mom = tree.mom_index(ParticleId(0)).unwrap();
        let p4 = state.par().rows(mom, 4);
        (p4[3] * p4[3] - p4[0] * p4[0] - p4[1] * p4[1] - p4[2] * p4[2]).sqrt()
    }

    #[test]
    fn test_mass_constraint_holds_after_every_pass() {
        let vertex = Vector3::new(0.1, -0.2, 0.5);
        let params = FitParams::default();
        let free = DecayTree::new(&three_prong(vertex), &params).unwrap();
        let mut state = ParameterState::new(free.dim());
        free.init(&mut state).unwrap();
        let target = invariant_mass(&free, &state) + 0.01;

        let mut head = three_prong(vertex).with_mass_constraint();
        head.pdg_mass = target;
        let tree = DecayTree::new(&head, &params).unwrap();
        let mut state = ParameterState::new(tree.dim());
        tree.init(&mut state).unwrap();

        for first_pass in [true, false, false] {
            tree.filter(&mut state, first_pass).unwrap();
            assert_relative_eq!(invariant_mass(&tree, &state), target, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_constraint_order_and_names() {
        let vertex = Vector3::new(0.0, 0.0, 1.0);
        let head = Particle::composite(
            0,
            "B0",
            5.2797,
            vec![
                Particle::composite(
                    1,
                    "K0",
                    0.4976,
                    vec![
                        track(2, vertex, Vector3::new(0.3, 0.2, 1.0)),
                        track(3, vertex, Vector3::new(-0.2, 0.1, 0.8)),
                    ],
                )
                .with_mass_constraint(),
                Particle::photon(4, "gamma", Vector3::new(0.5, 0.5, 2.0), Matrix3::identity() * 1e-3),
            ],
        );
        let tree = DecayTree::new(&head, &FitParams::default()).unwrap();

        let depths: Vec<_> = tree.constraints().iter().map(|c| c.depth).collect();
        assert!(depths.windows(2).all(|w| w[0] >= w[1]));
        let k0: Vec<_> = tree
            .constraints()
            .iter()
            .filter(|c| c.depth == 1 && c.node == tree.locate(ParticleId(1)).unwrap())
            .map(|c| c.kind)
            .collect();
        assert_eq!(
            k0,
            vec![
                ConstraintKind::Momentum,
                ConstraintKind::Vertex,
                ConstraintKind::Mass
            ]
        );

        let tau = tree.tau_index(ParticleId(1)).unwrap().unwrap();
        assert_eq!(tree.parameter_name(tau).as_deref(), Some("K0 L"));
        assert_eq!(tree.parameter_name(tree.dim()), None);
    }

    #[test]
    fn test_force_p4_sum() {
        let vertex = Vector3::new(0.1, -0.2, 0.5);
        let tree = DecayTree::new(&three_prong(vertex), &FitParams::default()).unwrap();
        let mut state = ParameterState::new(tree.dim());
        tree.init(&mut state).unwrap();

        let mom = tree.mom_index(ParticleId(0)).unwrap();
        let expected = state.par().rows(mom, 4).into_owned();
        state.par_mut()[mom] += 0.3;
        state.par_mut()[mom + 3] -= 0.1;

        tree.force_p4_sum(&mut state).unwrap();
        assert_relative_eq!(state.par().rows(mom, 4).into_owned(), expected, epsilon = 1e-12);
    }

    #[test]
    fn test_ip_constraint_attached_to_composite_head() {
        let params = FitParams::builder().use_ip_constraint(true).build().unwrap();
        let closed = DecayTree::new(&three_prong(Vector3::zeros()), &params).unwrap();
        assert!(closed
            .constraints()
            .iter()
            .any(|c| c.kind == ConstraintKind::InteractionPoint));
        assert_eq!(closed.ndof(), (3 * 5 + 4 + 3) - 16);

        let mut resonance = three_prong(Vector3::zeros());
        resonance.kind = ParticleKind::Resonance;
        let open = DecayTree::new(&resonance, &params).unwrap();
        assert!(open
            .constraints()
            .iter()
            .all(|c| c.kind != ConstraintKind::InteractionPoint));
    }
}
