//! Residuals and Jacobians of the constraints emitted by decay nodes.
//!
//! Every function evaluates `r = h(x) − m` and `H = ∂h/∂x` at the linearization point `x`,
//! with `H` spanning the full state so that the caller can restrict it to the touched columns.

use nalgebra::{DVector, Matrix3, Matrix4, Matrix6, SMatrix, Vector3};

use super::{production_vertex_index, DecayNode, NodeId};
use crate::constants::{EPS, SPEED_OF_LIGHT};
use crate::constraint::{ConstraintKind, Projection};
use crate::fit_params::FitParams;
use crate::particle::Measurement;
use crate::treefit_errors::TreeFitError;

/// Evaluate the `kind` constraint emitted by node `id` at `x`.
pub(crate) fn project(
    nodes: &[DecayNode],
    id: NodeId,
    kind: ConstraintKind,
    x: &DVector<f64>,
    params: &FitParams,
) -> Result<Projection, TreeFitError> {
    match kind {
        ConstraintKind::Measurement => project_measurement(nodes, id, x),
        ConstraintKind::Lifetime => project_lifetime(&nodes[id.0], x),
        ConstraintKind::Momentum => project_momentum(nodes, id, x),
        ConstraintKind::Vertex => project_vertex(nodes, id, x),
        ConstraintKind::Mass => Ok(project_mass(&nodes[id.0], x)),
        ConstraintKind::InteractionPoint => project_ip(&nodes[id.0], x, params),
    }
}

fn required(index: Option<usize>, node: &DecayNode, what: &str) -> Result<usize, TreeFitError> {
    index.ok_or_else(|| TreeFitError::InvalidDecayTree(format!("{} has no {what}", node.name)))
}

/// Unit vectors spanning the plane orthogonal to `direction`.
fn transverse_basis(direction: &Vector3<f64>) -> (Vector3<f64>, Vector3<f64>) {
    let helper = if direction.x.abs() < 0.9 {
        Vector3::x()
    } else {
        Vector3::y()
    };
    let u = direction.cross(&helper).normalize();
    let w = direction.cross(&u);
    (u, w)
}

/// Final-state measurement.
///
/// A track attached to a vertex is compared in 5 dimensions: the two transverse coordinates of
/// the fitted trajectory where it crosses the plane through the measured reference point
/// (orthogonal to the measured direction), and the three momentum components. Without any
/// vertex in the tree, and for clusters, only the momentum is compared.
fn project_measurement(
    nodes: &[DecayNode],
    id: NodeId,
    x: &DVector<f64>,
) -> Result<Projection, TreeFitError> {
    let node = &nodes[id.0];
    let mom = node.mom_index;
    let p = node.momentum(x);

    let (measured, covariance3) = match &node.measurement {
        Some(Measurement::Track {
            position,
            momentum,
            covariance,
        }) => {
            if let Some(vertex_index) = production_vertex_index(nodes, id) {
                return project_track(node, vertex_index, x, position, momentum, covariance);
            }
            (momentum, covariance.fixed_view::<3, 3>(3, 3).into_owned())
        }
        Some(Measurement::Cluster {
            momentum,
            covariance,
        }) => (momentum, *covariance),
        None => {
            return Err(TreeFitError::InvalidDecayTree(format!(
                "{} has no measurement",
                node.name
            )))
        }
    };

    let mut proj = Projection::new(3, x.len());
    proj.residual.copy_from(&(p - measured));
    proj.jacobian
        .fixed_view_mut::<3, 3>(0, mom)
        .fill_with_identity();
    proj.variance.copy_from(&covariance3);
    Ok(proj)
}

fn project_track(
    node: &DecayNode,
    vertex_index: usize,
    x: &DVector<f64>,
    position: &Vector3<f64>,
    measured: &Vector3<f64>,
    covariance: &Matrix6<f64>,
) -> Result<Projection, TreeFitError> {
    let mom = node.mom_index;
    let vertex = x.fixed_rows::<3>(vertex_index).into_owned();
    let p = node.momentum(x);

    let direction = measured
        .try_normalize(EPS)
        .ok_or_else(|| TreeFitError::DegenerateMomentum(node.name.clone()))?;
    let along = p.dot(&direction);
    if along.abs() < EPS {
        return Err(TreeFitError::DegenerateMomentum(node.name.clone()));
    }
    let (u, w) = transverse_basis(&direction);

    // Fitted trajectory vertex + t p crosses the measurement plane at q
    let t = (position - vertex).dot(&direction) / along;
    let offset = vertex + p * t - position;
    let dq = Matrix3::identity() - p * direction.transpose() / along;

    let mut proj = Projection::new(5, x.len());
    proj.residual[0] = u.dot(&offset);
    proj.residual[1] = w.dot(&offset);
    proj.residual
        .fixed_rows_mut::<3>(2)
        .copy_from(&(p - measured));

    for (row, axis) in [u, w].iter().enumerate() {
        let projected = axis.transpose() * dq;
        proj.jacobian
            .fixed_view_mut::<1, 3>(row, vertex_index)
            .copy_from(&projected);
        proj.jacobian
            .fixed_view_mut::<1, 3>(row, mom)
            .copy_from(&(projected * t));
    }
    proj.jacobian
        .fixed_view_mut::<3, 3>(2, mom)
        .fill_with_identity();

    // (x, y, z, px, py, pz) -> (u·x, w·x, px, py, pz)
    let mut jac = SMatrix::<f64, 5, 6>::zeros();
    jac.fixed_view_mut::<1, 3>(0, 0).copy_from(&u.transpose());
    jac.fixed_view_mut::<1, 3>(1, 0).copy_from(&w.transpose());
    jac.fixed_view_mut::<3, 3>(2, 3).fill_with_identity();
    proj.variance
        .copy_from(&(jac * covariance * jac.transpose()));

    Ok(proj)
}

/// Four-momentum conservation: `p4(node) − Σ p4(daughters) = 0`.
fn project_momentum(
    nodes: &[DecayNode],
    id: NodeId,
    x: &DVector<f64>,
) -> Result<Projection, TreeFitError> {
    let node = &nodes[id.0];
    let mut proj = Projection::new(4, x.len());
    let mut residual = node.four_momentum(x);
    proj.jacobian
        .fixed_view_mut::<4, 4>(0, node.mom_index)
        .fill_with_identity();

    for &d in &node.daughters {
        let daughter = &nodes[d.0];
        let p4 = daughter.four_momentum(x);
        residual -= p4;

        let mom = daughter.mom_index;
        if daughter.has_energy {
            proj.jacobian
                .fixed_view_mut::<4, 4>(0, mom)
                .copy_from(&(-Matrix4::identity()));
        } else {
            if p4.w < EPS {
                return Err(TreeFitError::DegenerateMomentum(daughter.name.clone()));
            }
            proj.jacobian
                .fixed_view_mut::<3, 3>(0, mom)
                .copy_from(&(-Matrix3::identity()));
            for k in 0..3 {
                proj.jacobian[(3, mom + k)] = -p4[k] / p4.w;
            }
        }
    }

    proj.residual.copy_from(&residual);
    Ok(proj)
}

/// Flight constraint: `x(production) + L p̂ − x(decay) = 0`.
fn project_vertex(
    nodes: &[DecayNode],
    id: NodeId,
    x: &DVector<f64>,
) -> Result<Projection, TreeFitError> {
    let node = &nodes[id.0];
    let pos = required(node.pos_index, node, "decay vertex")?;
    let tau = required(node.tau_index, node, "decay length")?;
    let origin = required(production_vertex_index(nodes, id), node, "production vertex")?;

    let p = node.momentum(x);
    let norm = p.norm();
    if norm < EPS {
        return Err(TreeFitError::DegenerateMomentum(node.name.clone()));
    }
    let direction = p / norm;
    let length = x[tau];

    let mut proj = Projection::new(3, x.len());
    let residual = x.fixed_rows::<3>(origin) + direction * length - x.fixed_rows::<3>(pos);
    proj.residual.copy_from(&residual);

    proj.jacobian
        .fixed_view_mut::<3, 3>(0, origin)
        .fill_with_identity();
    proj.jacobian
        .fixed_view_mut::<3, 3>(0, pos)
        .copy_from(&(-Matrix3::identity()));
    proj.jacobian
        .fixed_view_mut::<3, 1>(0, tau)
        .copy_from(&direction);
    let rotation = (Matrix3::identity() - direction * direction.transpose()) * (length / norm);
    proj.jacobian
        .fixed_view_mut::<3, 3>(0, node.mom_index)
        .copy_from(&rotation);

    Ok(proj)
}

/// Mass shell: `E² − |p|² − m² = 0`.
fn project_mass(node: &DecayNode, x: &DVector<f64>) -> Projection {
    let mom = node.mom_index;
    let p4 = node.four_momentum(x);

    let mut proj = Projection::new(1, x.len());
    proj.residual[0] = p4.w * p4.w - p4.xyz().norm_squared() - node.pdg_mass * node.pdg_mass;
    for k in 0..3 {
        proj.jacobian[(0, mom + k)] = -2.0 * p4[k];
    }
    proj.jacobian[(0, mom + 3)] = 2.0 * p4.w;
    proj
}

/// Decay length compared to its mean `cτ |p| / m`, with the mean as width.
fn project_lifetime(node: &DecayNode, x: &DVector<f64>) -> Result<Projection, TreeFitError> {
    let tau = required(node.tau_index, node, "decay length")?;
    let lifetime = node.lifetime.ok_or_else(|| {
        TreeFitError::InvalidDecayTree(format!("{} has no nominal lifetime", node.name))
    })?;

    let p = node.momentum(x);
    let norm = p.norm();
    if norm < EPS {
        return Err(TreeFitError::DegenerateMomentum(node.name.clone()));
    }
    let scale = SPEED_OF_LIGHT * lifetime / node.pdg_mass;
    let expected = scale * norm;

    let mut proj = Projection::new(1, x.len());
    proj.residual[0] = x[tau] - expected;
    proj.jacobian[(0, tau)] = 1.0;
    for k in 0..3 {
        proj.jacobian[(0, node.mom_index + k)] = -scale * p[k] / norm;
    }
    proj.variance[(0, 0)] = expected * expected;
    Ok(proj)
}

/// Beam spot: the head vertex is measured at the interaction point.
fn project_ip(
    node: &DecayNode,
    x: &DVector<f64>,
    params: &FitParams,
) -> Result<Projection, TreeFitError> {
    let pos = required(node.pos_index, node, "decay vertex")?;

    let mut proj = Projection::new(3, x.len());
    proj.residual
        .copy_from(&(x.fixed_rows::<3>(pos) - params.ip_position));
    proj.jacobian.fixed_view_mut::<3, 3>(0, pos).fill_with_identity();
    proj.variance.copy_from(&params.ip_covariance);
    Ok(proj)
}
