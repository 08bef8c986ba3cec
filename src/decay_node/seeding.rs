//! Seeding of node parameters and of the prior covariance.
//!
//! Seeding runs in three passes over the tree, each with its own traversal order:
//!
//! 1. [`init_par1`], mother before daughters: parameters measured directly (final-state
//!    momenta) and caller-supplied vertices.
//! 2. [`init_par2`], daughters before mother: vertices from the intersection of daughter
//!    trajectories, four-momenta from the sum of the daughters.
//! 3. [`init_tau`], mother before daughters: vertices still unknown fall back to the
//!    production vertex, and decay lengths are projected on the flight direction.

use itertools::Itertools;
use log::debug;
use nalgebra::{Vector3, Vector4};

use super::{production_vertex_owner, DecayNode, NodeId, NodeKind};
use crate::constants::EPS;
use crate::fit_params::FitParams;
use crate::geometry::{closest_approach, Line};
use crate::parameter_state::ParameterState;
use crate::particle::Measurement;
use crate::treefit_errors::TreeFitError;

/// Seed what `node` knows on its own.
///
/// Return
/// ----------
/// * `true` if the node's vertex is now seeded.
pub(crate) fn init_par1(node: &DecayNode, state: &mut ParameterState) -> bool {
    if let Some(measurement) = &node.measurement {
        state
            .par_mut()
            .fixed_rows_mut::<3>(node.mom_index)
            .copy_from(measurement.momentum());
    }

    match (node.pos_index, node.vertex_hint) {
        (Some(pos), Some(hint)) => {
            state.par_mut().fixed_rows_mut::<3>(pos).copy_from(&hint);
            true
        }
        _ => false,
    }
}

/// Seed the vertex and four-momentum of `id` from its already seeded daughters.
///
/// The vertex is the point of closest approach of the two best daughter trajectories: tracks
/// ordered by decreasing transverse momentum, then flying composites. With fewer than two
/// trajectories the vertex is left for [`init_tau`].
///
/// Return
/// ----------
/// * `true` if the node's vertex is seeded after this pass.
/// * `Err(DegenerateSeed)` if the two trajectories are parallel or miss each other by more
///   than [`FitParams::max_seed_doca`].
pub(crate) fn init_par2(
    nodes: &[DecayNode],
    id: NodeId,
    state: &mut ParameterState,
    seeded: &[bool],
    params: &FitParams,
) -> Result<bool, TreeFitError> {
    let node = &nodes[id.0];
    let mut vertex_seeded = seeded[id.0];

    if let (Some(pos), false) = (node.pos_index, vertex_seeded) {
        let lines = seed_lines(nodes, id, state, seeded);
        if let [first, second, ..] = lines.as_slice() {
            let poca = closest_approach(first, second).ok_or_else(|| {
                TreeFitError::DegenerateSeed {
                    particle: node.name.clone(),
                    reason: "daughter trajectories are parallel".into(),
                }
            })?;
            if poca.doca > params.max_seed_doca {
                return Err(TreeFitError::DegenerateSeed {
                    particle: node.name.clone(),
                    reason: format!(
                        "daughter trajectories miss each other by {:.3} cm",
                        poca.doca
                    ),
                });
            }
            debug!(
                "seeded vertex of {} at {:?} (doca {:.2e} cm)",
                node.name,
                poca.point.as_slice(),
                poca.doca
            );
            state.par_mut().fixed_rows_mut::<3>(pos).copy_from(&poca.point);
            vertex_seeded = true;
        }
    }

    if !node.is_final_state() {
        let sum: Vector4<f64> = node
            .daughters
            .iter()
            .map(|d| nodes[d.0].four_momentum(state.par()))
            .sum();
        state
            .par_mut()
            .fixed_rows_mut::<4>(node.mom_index)
            .copy_from(&sum);
    }

    Ok(vertex_seeded)
}

/// Trajectories of the particles emerging from the decay vertex of `id`.
fn seed_lines(nodes: &[DecayNode], id: NodeId, state: &ParameterState, seeded: &[bool]) -> Vec<Line> {
    let mut tracks = Vec::new();
    let mut composites = Vec::new();
    collect_lines(nodes, id, state, seeded, &mut tracks, &mut composites);

    tracks
        .into_iter()
        .sorted_by(|(pt1, _), (pt2, _)| pt2.total_cmp(pt1))
        .map(|(_, line)| line)
        .chain(composites)
        .collect()
}

fn collect_lines(
    nodes: &[DecayNode],
    id: NodeId,
    state: &ParameterState,
    seeded: &[bool],
    tracks: &mut Vec<(f64, Line)>,
    composites: &mut Vec<Line>,
) {
    for &daughter in &nodes[id.0].daughters {
        let node = &nodes[daughter.0];
        match (node.kind, &node.measurement) {
            (
                NodeKind::FinalStateTrack,
                Some(Measurement::Track {
                    position, momentum, ..
                }),
            ) => tracks.push((momentum.xy().norm(), Line::new(*position, *momentum))),
            (NodeKind::Composite, _) => {
                if let (Some(pos), true) = (node.pos_index, seeded[daughter.0]) {
                    let vertex = state.par().fixed_rows::<3>(pos).into_owned();
                    composites.push(Line::new(vertex, node.momentum(state.par())));
                }
            }
            // Resonance daughters decay at the same point
            (NodeKind::Resonance, _) => {
                collect_lines(nodes, daughter, state, seeded, tracks, composites)
            }
            _ => {}
        }
    }
}

/// Complete the vertex and seed the decay length of `id`.
///
/// Return
/// ----------
/// * `Err(InsufficientVertexInfo)` if the vertex could be seeded neither from the daughters
///   nor from the production vertex.
/// * `Err(DegenerateMomentum)` if the flight direction is undefined.
pub(crate) fn init_tau(
    nodes: &[DecayNode],
    id: NodeId,
    state: &mut ParameterState,
    seeded: &mut [bool],
) -> Result<(), TreeFitError> {
    let node = &nodes[id.0];
    let Some(pos) = node.pos_index else {
        return Ok(());
    };
    let production = production_vertex_owner(nodes, id)
        .filter(|owner| seeded[owner.0])
        .and_then(|owner| nodes[owner.0].pos_index)
        .map(|index| state.par().fixed_rows::<3>(index).into_owned());

    if !seeded[id.0] {
        let Some(vertex) = production else {
            return Err(TreeFitError::InsufficientVertexInfo(node.name.clone()));
        };
        debug!("vertex of {} seeded at its production vertex", node.name);
        state.par_mut().fixed_rows_mut::<3>(pos).copy_from(&vertex);
        seeded[id.0] = true;
    }

    if let (Some(tau), Some(origin)) = (node.tau_index, production) {
        let momentum = node.momentum(state.par());
        let norm = momentum.norm();
        if norm < EPS {
            return Err(TreeFitError::DegenerateMomentum(node.name.clone()));
        }
        let flight: Vector3<f64> = state.par().fixed_rows::<3>(pos) - origin;
        state.par_mut()[tau] = flight.dot(&momentum) / norm;
    }
    Ok(())
}

/// Set the prior covariance block of `node`: inflated measurement errors for measured
/// momenta, broad priors elsewhere. Off-diagonal terms are left untouched.
pub(crate) fn init_cov(node: &DecayNode, state: &mut ParameterState, params: &FitParams) {
    let cov = state.cov_mut();
    if let Some(pos) = node.pos_index {
        for i in pos..pos + 3 {
            cov[(i, i)] = params.prior_vertex_variance;
        }
    }
    if let Some(tau) = node.tau_index {
        cov[(tau, tau)] = params.prior_decay_length_variance;
    }

    let mom = node.mom_index;
    match &node.measurement {
        Some(Measurement::Track { covariance, .. }) => {
            for i in 0..3 {
                cov[(mom + i, mom + i)] = params.prior_scale * covariance[(3 + i, 3 + i)];
            }
        }
        Some(Measurement::Cluster { covariance, .. }) => {
            for i in 0..3 {
                cov[(mom + i, mom + i)] = params.prior_scale * covariance[(i, i)];
            }
        }
        None => {
            for i in mom..mom + node.momentum_dim() {
                cov[(i, i)] = params.prior_momentum_variance;
            }
        }
    }
}
