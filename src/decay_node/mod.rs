//! # Decay nodes
//!
//! A [`DecayNode`] is the fitter's view of one particle of the caller's tree. Nodes live in an
//! arena (`Vec<DecayNode>`) owned by the [`DecayTree`](crate::decay_tree::DecayTree) and refer
//! to each other through [`NodeId`]s: the mother link is a plain index, used to find the
//! production vertex and to build constraints, never for ownership.
//!
//! ## Parameter layout
//!
//! Each node owns a contiguous block of the global parameter vector, assigned depth-first with
//! daughters before their mother by [`update_index`]:
//!
//! | Variant                        | Parameters                                          |
//! |--------------------------------|-----------------------------------------------------|
//! | [`NodeKind::FinalStateTrack`]  | `px py pz` (energy from the mass hypothesis)        |
//! | [`NodeKind::FinalStatePhoton`] | `px py pz` (massless)                               |
//! | [`NodeKind::Composite`]        | `x y z`, `L` if it has a production vertex, `px py pz E` |
//! | [`NodeKind::Resonance`]        | `px py pz E`                                        |
//! | [`NodeKind::Head`]             | `x y z` if it has a vertex, `px py pz E`            |
//!
//! `L` is the decay length: the distance between the production and decay vertices, measured
//! along the momentum direction.
//!
//! ## Submodules
//!
//! * `seeding` – the three seeding passes and the prior covariance.
//! * `projection` – residuals and Jacobians of every [`ConstraintKind`].

mod projection;
mod seeding;

pub(crate) use projection::project;
pub(crate) use seeding::{init_cov, init_par1, init_par2, init_tau};

use nalgebra::{DVector, Vector3, Vector4};
use smallvec::{smallvec, SmallVec};

use crate::constraint::{Constraint, ConstraintKind, Weight};
use crate::particle::{Measurement, ParticleId};

/// Index of a node in the decay-tree arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    FinalStateTrack,
    FinalStatePhoton,
    Composite,
    Resonance,
    /// Root of the tree. `has_vertex` is false when the root decays strongly.
    Head { has_vertex: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecayNode {
    pub(crate) particle: ParticleId,
    pub(crate) name: String,
    pub(crate) kind: NodeKind,
    pub(crate) mother: Option<NodeId>,
    pub(crate) daughters: Vec<NodeId>,
    pub(crate) depth: usize,

    pub(crate) mom_index: usize,
    pub(crate) pos_index: Option<usize>,
    pub(crate) tau_index: Option<usize>,
    has_pos: bool,
    has_tau: bool,

    pub(crate) pdg_mass: f64,
    pub(crate) has_energy: bool,
    pub(crate) measurement: Option<Measurement>,
    pub(crate) vertex_hint: Option<Vector3<f64>>,
    pub(crate) mass_constraint: bool,
    pub(crate) lifetime: Option<f64>,
    pub(crate) ip_constraint: bool,
}

impl DecayNode {
    /// Create a node with its layout decided but no index assigned yet.
    ///
    /// `vertex_above` tells whether some ancestor owns a vertex, which decides if a composite
    /// gets a decay length.
    pub(crate) fn new(
        particle: ParticleId,
        name: &str,
        kind: NodeKind,
        mother: Option<NodeId>,
        depth: usize,
        pdg_mass: f64,
        vertex_above: bool,
    ) -> Self {
        let (has_pos, has_tau, has_energy) = match kind {
            NodeKind::FinalStateTrack | NodeKind::FinalStatePhoton => (false, false, false),
            NodeKind::Composite => (true, vertex_above, true),
            NodeKind::Resonance => (false, false, true),
            NodeKind::Head { has_vertex } => (has_vertex, false, true),
        };
        DecayNode {
            particle,
            name: name.to_string(),
            kind,
            mother,
            daughters: Vec::new(),
            depth,
            mom_index: 0,
            pos_index: None,
            tau_index: None,
            has_pos,
            has_tau,
            pdg_mass,
            has_energy,
            measurement: None,
            vertex_hint: None,
            mass_constraint: false,
            lifetime: None,
            ip_constraint: false,
        }
    }

    pub fn particle(&self) -> ParticleId {
        self.particle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn mother(&self) -> Option<NodeId> {
        self.mother
    }

    pub fn daughters(&self) -> &[NodeId] {
        &self.daughters
    }

    pub fn mom_index(&self) -> usize {
        self.mom_index
    }

    pub fn pos_index(&self) -> Option<usize> {
        self.pos_index
    }

    pub fn tau_index(&self) -> Option<usize> {
        self.tau_index
    }

    pub fn has_energy(&self) -> bool {
        self.has_energy
    }

    pub fn pdg_mass(&self) -> f64 {
        self.pdg_mass
    }

    pub(crate) fn has_tau(&self) -> bool {
        self.has_tau
    }

    pub fn is_final_state(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::FinalStateTrack | NodeKind::FinalStatePhoton
        )
    }

    /// 4 if the energy is a free parameter, 3 if it follows from the mass shell.
    pub fn momentum_dim(&self) -> usize {
        if self.has_energy {
            4
        } else {
            3
        }
    }

    /// Number of parameters owned by this node.
    pub fn dim(&self) -> usize {
        3 * usize::from(self.has_pos) + usize::from(self.has_tau) + self.momentum_dim()
    }

    /// Global indices of every parameter owned by this node.
    pub fn parameter_indices(&self) -> SmallVec<[usize; 8]> {
        let mut indices = SmallVec::new();
        if let Some(pos) = self.pos_index {
            indices.extend(pos..pos + 3);
        }
        indices.extend(self.tau_index);
        indices.extend(self.mom_index..self.mom_index + self.momentum_dim());
        indices
    }

    pub(crate) fn momentum(&self, x: &DVector<f64>) -> Vector3<f64> {
        x.fixed_rows::<3>(self.mom_index).into_owned()
    }

    /// Four-momentum `(px, py, pz, E)` at `x`, taking `E` from the mass shell when it is not fitted.
    pub(crate) fn four_momentum(&self, x: &DVector<f64>) -> Vector4<f64> {
        let p = self.momentum(x);
        let energy = if self.has_energy {
            x[self.mom_index + 3]
        } else {
            (p.norm_squared() + self.pdg_mass * self.pdg_mass).sqrt()
        };
        Vector4::new(p.x, p.y, p.z, energy)
    }

    /// Human readable name of the global parameter `index`, if this node owns it.
    pub(crate) fn parameter_name(&self, index: usize) -> Option<String> {
        let label = match (self.pos_index, self.tau_index) {
            (Some(pos), _) if (pos..pos + 3).contains(&index) => ["x", "y", "z"][index - pos],
            (_, Some(tau)) if tau == index => "L",
            _ if (self.mom_index..self.mom_index + self.momentum_dim()).contains(&index) => {
                ["px", "py", "pz", "E"][index - self.mom_index]
            }
            _ => return None,
        };
        Some(format!("{} {label}", self.name))
    }

    /// Append the constraints emitted by this node.
    ///
    /// Arguments
    /// -----------------
    /// * `nodes`: the whole arena, needed to find the production vertex and the daughters.
    /// * `id`: index of `self` in `nodes`.
    /// * `list`: receives the constraints.
    /// * `weight`: weight given to every appended constraint.
    ///
    /// Final-state particles emit their measurement, internal nodes four-momentum conservation,
    /// a vertex constraint when they fly, and the optional mass, lifetime and beam-spot
    /// constraints.
    pub(crate) fn add_to_constraint_list(
        &self,
        nodes: &[DecayNode],
        id: NodeId,
        list: &mut Vec<Constraint>,
        weight: Weight,
    ) {
        let production = production_vertex_owner(nodes, id);
        let mut push = |kind: ConstraintKind, dim: usize, touches: SmallVec<[NodeId; 4]>| {
            list.push(Constraint {
                node: id,
                touches,
                kind,
                depth: self.depth,
                dim,
                weight,
            });
        };

        match self.kind {
            NodeKind::FinalStateTrack => {
                let (dim, touches) = match production {
                    Some(vertex) => (5, smallvec![id, vertex]),
                    None => (3, smallvec![id]),
                };
                push(ConstraintKind::Measurement, dim, touches);
            }
            NodeKind::FinalStatePhoton => push(ConstraintKind::Measurement, 3, smallvec![id]),
            NodeKind::Composite | NodeKind::Resonance | NodeKind::Head { .. } => {
                let mut touches: SmallVec<[NodeId; 4]> = smallvec![id];
                touches.extend(self.daughters.iter().copied());
                push(ConstraintKind::Momentum, 4, touches);

                if let (true, Some(vertex)) = (self.has_tau, production) {
                    push(ConstraintKind::Vertex, 3, smallvec![id, vertex]);
                    if self.lifetime.is_some() {
                        push(ConstraintKind::Lifetime, 1, smallvec![id]);
                    }
                }
                if self.mass_constraint {
                    push(ConstraintKind::Mass, 1, smallvec![id]);
                }
                if self.ip_constraint {
                    push(ConstraintKind::InteractionPoint, 3, smallvec![id]);
                }
            }
        }
    }
}

/// Assign global parameter indices to the subtree rooted at `id`, daughters first.
///
/// Return
/// ----------
/// * The running dimension after the subtree, i.e. the offset for the next node.
pub(crate) fn update_index(nodes: &mut [DecayNode], id: NodeId, mut offset: usize) -> usize {
    let daughters = nodes[id.0].daughters.clone();
    for daughter in daughters {
        offset = update_index(nodes, daughter, offset);
    }

    let node = &mut nodes[id.0];
    node.pos_index = None;
    node.tau_index = None;
    if node.has_pos {
        node.pos_index = Some(offset);
        offset += 3;
    }
    if node.has_tau {
        node.tau_index = Some(offset);
        offset += 1;
    }
    node.mom_index = offset;
    offset + node.momentum_dim()
}

/// First node, starting at `id` and walking up, that owns a vertex.
pub(crate) fn vertex_owner(nodes: &[DecayNode], id: NodeId) -> Option<NodeId> {
    let mut current = Some(id);
    while let Some(node) = current {
        if nodes[node.0].has_pos {
            return Some(node);
        }
        current = nodes[node.0].mother;
    }
    None
}

/// Node owning the vertex where `id` is produced.
pub(crate) fn production_vertex_owner(nodes: &[DecayNode], id: NodeId) -> Option<NodeId> {
    nodes[id.0]
        .mother
        .and_then(|mother| vertex_owner(nodes, mother))
}

/// Index of the vertex where `id` decays: its own, or its production vertex if it has none.
pub(crate) fn decay_vertex_index(nodes: &[DecayNode], id: NodeId) -> Option<usize> {
    vertex_owner(nodes, id).and_then(|owner| nodes[owner.0].pos_index)
}

/// Index of the vertex where `id` is produced.
pub(crate) fn production_vertex_index(nodes: &[DecayNode], id: NodeId) -> Option<usize> {
    production_vertex_owner(nodes, id).and_then(|owner| nodes[owner.0].pos_index)
}
