use nalgebra::{DVector, Point3};
use tracing::debug;

use crate::{
    addressing::DOF_PER_NODE,
    datatypes::{DofPartition, FixedSupport, GridBounds, GridResolution, LoadVector},
};

/// Grid nodes within `radius` of `point`, as lattice indices. Falls back to
/// the single nearest node when the ball holds none.
pub fn nodes_near(
    resolution: &GridResolution,
    bounds: &GridBounds,
    point: &Point3<f64>,
    radius: f64,
) -> Vec<(usize, usize, usize)> {
    let [fx, fy, fz] = bounds.world_to_lattice(point);
    let rx = radius / bounds.dx;
    let ry = radius / bounds.dy;
    let rz = radius / bounds.dz;

    let mut nodes = Vec::new();
    if let (Some(xs), Some(ys), Some(zs)) = (
        index_window(fx, rx, resolution.nelx),
        index_window(fy, ry, resolution.nely),
        index_window(fz, rz, resolution.nelz),
    ) {
        for iz in zs.clone() {
            for ix in xs.clone() {
                for iy in ys.clone() {
                    let node = bounds.node_position(ix, iy, iz);
                    if (node - point).norm() <= radius {
                        nodes.push((ix, iy, iz));
                    }
                }
            }
        }
    }

    if nodes.is_empty() {
        nodes.push(bounds.nearest_node(resolution, point));
    }
    nodes
}

/// Candidate index range along one axis, widened by one to absorb rounding
fn index_window(
    center: f64,
    reach: f64,
    max: usize,
) -> Option<std::ops::RangeInclusive<usize>> {
    let lo = (center - reach).floor() - 1.0;
    let hi = (center + reach).ceil() + 1.0;
    if !lo.is_finite() || !hi.is_finite() || hi < 0.0 || lo > max as f64 {
        return None;
    }
    let lo = lo.max(0.0) as usize;
    let hi = (hi as usize).min(max);
    Some(lo..=hi)
}

/// Maps support and load markers onto grid nodes
///
/// # Arguments
/// * `resolution`, `bounds` - The grid
/// * `supports` - Markers whose matched nodes are pinned in x, y and z
/// * `loads` - Markers whose matched nodes each receive `magnitude * direction`
/// * `radius_factor` - Search radius in multiples of the smallest cell size
///
/// # Returns
/// The global force vector and the fixed/free DOF partition
pub fn map_boundary_conditions(
    resolution: &GridResolution,
    bounds: &GridBounds,
    supports: &[FixedSupport],
    loads: &[LoadVector],
    radius_factor: f64,
) -> (DVector<f64>, DofPartition) {
    let ndof = resolution.dof_count();
    let radius = radius_factor * bounds.pitch();

    let mut force = DVector::zeros(ndof);
    for load in loads {
        let nodes = nodes_near(resolution, bounds, &load.position, radius);
        let nodal_force = load.direction * load.magnitude;
        for (ix, iy, iz) in &nodes {
            let dofs = resolution.node_dofs(*ix, *iy, *iz);
            for axis in 0..DOF_PER_NODE {
                force[dofs[axis]] += nodal_force[axis];
            }
        }
        debug!(
            position = ?load.position,
            nodes = nodes.len(),
            "load marker mapped"
        );
    }

    let mut fixed = Vec::new();
    for support in supports {
        let nodes = nodes_near(resolution, bounds, &support.position, radius);
        for (ix, iy, iz) in &nodes {
            fixed.extend(resolution.node_dofs(*ix, *iy, *iz));
        }
        debug!(
            position = ?support.position,
            nodes = nodes.len(),
            "support marker mapped"
        );
    }

    (force, DofPartition::from_fixed(ndof, fixed))
}
