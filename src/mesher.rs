use std::time::Instant;

use nalgebra::{Point3, Vector3};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::{
    boundary::map_boundary_conditions,
    config::SolverSettings,
    containment::{Containment, RayParity},
    datatypes::{
        FixedSupport, GridBounds, GridResolution, LoadVector, PreparedProblem, SurfaceMesh,
        VoxelGrid,
    },
    error::{AbyssError, AbyssResult},
};

/// Centres the mesh bounding box on the origin, scales uniformly so the
/// largest extent equals `target_size`, then lifts the mesh so its lowest
/// y coordinate is zero.
///
/// Marker coordinates are expected in this frame, so any change here moves
/// every boundary condition.
pub fn normalize(mesh: &SurfaceMesh, target_size: f64) -> SurfaceMesh {
    let Some((min, max)) = mesh.bounds() else {
        return mesh.clone();
    };

    let center = nalgebra::center(&min, &max);
    let extent = max - min;
    let largest = extent.max();
    let scale = if largest > 0.0 { target_size / largest } else { 1.0 };

    let mut vertices: Vec<Point3<f64>> = mesh
        .vertices
        .iter()
        .map(|v| Point3::from((v - center) * scale))
        .collect();

    let min_y = vertices
        .iter()
        .map(|v| v.y)
        .fold(f64::INFINITY, f64::min);
    for v in vertices.iter_mut() {
        v.y -= min_y;
    }

    SurfaceMesh::new(vertices, mesh.faces.clone())
}

/// Rejects meshes that cannot bound a solid
fn validate_mesh(mesh: &SurfaceMesh) -> AbyssResult<()> {
    if mesh.is_empty() {
        return Err(AbyssError::Input(
            "Input mesh has no triangles".to_owned(),
        ));
    }

    for (i, face) in mesh.faces.iter().enumerate() {
        if face.iter().any(|v| *v >= mesh.vertices.len()) {
            return Err(AbyssError::Input(format!(
                "Face {i} references a vertex outside the mesh"
            )));
        }
    }

    if mesh
        .vertices
        .iter()
        .any(|v| v.iter().any(|c| !c.is_finite()))
    {
        return Err(AbyssError::Input(
            "Input mesh has non-finite vertex coordinates".to_owned(),
        ));
    }

    Ok(())
}

fn validate_resolution(resolution: &GridResolution) -> AbyssResult<()> {
    if resolution.nelx == 0 || resolution.nely == 0 || resolution.nelz == 0 {
        return Err(AbyssError::Input(format!(
            "Grid resolution must be positive on every axis, got {}x{}x{}",
            resolution.nelx, resolution.nely, resolution.nelz
        )));
    }
    Ok(())
}

/// Derives the element grid from the mesh bounding box and marks every
/// element whose centre lies outside the solid as an obstacle.
///
/// # Arguments
/// * `mesh` - A normalized, closed surface
/// * `resolution` - Element counts per axis
pub fn build_voxel_grid(
    mesh: &SurfaceMesh,
    resolution: &GridResolution,
) -> AbyssResult<VoxelGrid> {
    validate_mesh(mesh)?;
    validate_resolution(resolution)?;

    let (bbox_min, bbox_max) = match mesh.bounds() {
        Some(b) => b,
        None => return Err(AbyssError::Input("Input mesh has no vertices".to_owned())),
    };
    let extent: Vector3<f64> = bbox_max - bbox_min;
    if extent.iter().any(|e| !(*e > 0.0)) {
        return Err(AbyssError::Input(format!(
            "Input mesh is flat: bounding box extent is ({:.3e}, {:.3e}, {:.3e})",
            extent.x, extent.y, extent.z
        )));
    }

    let bounds = GridBounds::from_box(bbox_min, bbox_max, resolution);

    let start = Instant::now();
    let solid = RayParity::new(mesh);
    let obstacle: Vec<bool> = (0..resolution.element_count())
        .into_par_iter()
        .map(|element| {
            let (ex, ey, ez) = resolution.element_coords(element);
            !solid.contains(&bounds.element_center(ex, ey, ez))
        })
        .collect();

    let grid = VoxelGrid {
        resolution: *resolution,
        bounds,
        obstacle,
    };

    debug!(
        elements = resolution.element_count(),
        obstacles = grid.obstacle_count(),
        elapsed = start.elapsed().as_secs_f64(),
        "voxel grid classified"
    );

    Ok(grid)
}

/// Builds the finite-element problem for a mesh and its markers
///
/// # Arguments
/// * `mesh` - The input surface, in its original frame
/// * `supports` - Fixed-support markers, in the normalized frame
/// * `loads` - Load markers, in the normalized frame
/// * `resolution` - Element counts per axis
/// * `settings` - Normalization target and marker search radius
///
/// # Returns
/// The voxel grid, force vector and DOF partition
pub fn prepare(
    mesh: &SurfaceMesh,
    supports: &[FixedSupport],
    loads: &[LoadVector],
    resolution: &GridResolution,
    settings: &SolverSettings,
) -> AbyssResult<PreparedProblem> {
    validate_mesh(mesh)?;
    validate_resolution(resolution)?;

    let normalized = normalize(mesh, settings.target_size);
    let grid = build_voxel_grid(&normalized, resolution)?;

    let stray = supports
        .iter()
        .map(|s| &s.position)
        .chain(loads.iter().map(|l| &l.position))
        .filter(|p| grid.is_void_at(p));
    for position in stray {
        warn!(
            x = position.x,
            y = position.y,
            z = position.z,
            "marker lies in void space; it will act on near-zero stiffness"
        );
    }

    let (force, dofs) = map_boundary_conditions(
        &grid.resolution,
        &grid.bounds,
        supports,
        loads,
        settings.radius_factor,
    );

    info!(
        nelx = resolution.nelx,
        nely = resolution.nely,
        nelz = resolution.nelz,
        design_elements = grid.design_count(),
        fixed_dofs = dofs.fixed.len(),
        free_dofs = dofs.free.len(),
        "problem prepared"
    );

    Ok(PreparedProblem { grid, force, dofs })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::containment::tests::box_mesh;
    use approx::assert_relative_eq;

    #[test]
    fn normalization_centres_scales_and_grounds() {
        let mesh = box_mesh(Point3::new(10.0, 5.0, -3.0), Point3::new(16.0, 7.0, -1.0));
        let normalized = normalize(&mesh, 3.0);
        let (min, max) = normalized.bounds().unwrap();

        assert_relative_eq!(min.x, -1.5, epsilon = 1e-12);
        assert_relative_eq!(max.x, 1.5, epsilon = 1e-12);
        assert_relative_eq!(min.y, 0.0, epsilon = 1e-12);
        assert_relative_eq!(max.y, 1.0, epsilon = 1e-12);
        assert_relative_eq!(min.z, -0.5, epsilon = 1e-12);
        assert_relative_eq!(max.z, 0.5, epsilon = 1e-12);
    }

    #[test]
    fn box_fills_its_own_grid() {
        let mesh = normalize(
            &box_mesh(Point3::origin(), Point3::new(6.0, 2.0, 2.0)),
            3.0,
        );
        let grid = build_voxel_grid(&mesh, &GridResolution::new(12, 4, 4)).unwrap();
        assert_eq!(grid.obstacle_count(), 0);
        assert_relative_eq!(grid.bounds.dx, 0.25, epsilon = 1e-12);
    }

    #[test]
    fn l_shape_marks_the_cut_out_as_obstacle() {
        // two boxes sharing no volume: lower slab plus a tower on the left
        let lower = box_mesh(Point3::new(0.0, 0.0, 0.0), Point3::new(4.0, 1.0, 1.0));
        let upper = box_mesh(Point3::new(0.0, 1.0, 0.0), Point3::new(1.0, 4.0, 1.0));
        let offset = lower.vertices.len();
        let mut vertices = lower.vertices.clone();
        vertices.extend(upper.vertices.iter().copied());
        let mut faces = lower.faces.clone();
        faces.extend(upper.faces.iter().map(|[a, b, c]| [a + offset, b + offset, c + offset]));
        let mesh = SurfaceMesh::new(vertices, faces);

        let resolution = GridResolution::new(4, 4, 1);
        let grid = build_voxel_grid(&mesh, &resolution).unwrap();

        // top-right element is void, bottom-left is solid
        let top_right = resolution.element_index(3, 0, 0);
        let bottom_left = resolution.element_index(0, 3, 0);
        assert!(grid.obstacle[top_right]);
        assert!(!grid.obstacle[bottom_left]);
        assert_eq!(grid.design_count(), 7);

        assert!(grid.is_void_at(&Point3::new(3.5, 3.5, 0.5)));
        assert!(!grid.is_void_at(&Point3::new(0.5, 0.5, 0.5)));
        assert!(!grid.is_void_at(&Point3::new(3.5, 0.5, 0.5)));
    }

    #[test]
    fn prepare_rejects_bad_input() {
        let settings = SolverSettings::default();
        let empty = SurfaceMesh::default();
        assert!(matches!(
            prepare(&empty, &[], &[], &GridResolution::new(4, 4, 4), &settings),
            Err(AbyssError::Input(_))
        ));

        let mesh = box_mesh(Point3::origin(), Point3::new(1.0, 1.0, 1.0));
        assert!(matches!(
            prepare(&mesh, &[], &[], &GridResolution::new(4, 0, 4), &settings),
            Err(AbyssError::Input(_))
        ));

        let flat = SurfaceMesh::new(
            vec![
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(1.0, 0.0, 0.0),
                Point3::new(0.0, 1.0, 0.0),
            ],
            vec![[0, 1, 2]],
        );
        assert!(matches!(
            prepare(&flat, &[], &[], &GridResolution::new(4, 4, 4), &settings),
            Err(AbyssError::Input(_))
        ));

        let dangling = SurfaceMesh::new(vec![Point3::origin()], vec![[0, 1, 2]]);
        assert!(matches!(
            prepare(&dangling, &[], &[], &GridResolution::new(4, 4, 4), &settings),
            Err(AbyssError::Input(_))
        ));
    }

    #[test]
    fn prepare_maps_markers_in_the_normalized_frame() {
        let mesh = box_mesh(Point3::origin(), Point3::new(6.0, 2.0, 2.0));
        let supports = vec![FixedSupport {
            position: Point3::new(-1.5, 0.5, 0.0),
            normal: Vector3::new(-1.0, 0.0, 0.0),
        }];
        let loads = vec![LoadVector {
            position: Point3::new(1.5, 0.5, 0.0),
            direction: Vector3::new(0.0, -1.0, 0.0),
            magnitude: 1.0,
        }];
        let problem = prepare(
            &mesh,
            &supports,
            &loads,
            &GridResolution::new(12, 4, 4),
            &SolverSettings::default(),
        )
        .unwrap();

        assert_eq!(problem.force.len(), problem.grid.resolution.dof_count());
        assert!(problem.force.iter().any(|f| *f < 0.0));
        assert!(!problem.dofs.fixed.is_empty());

        // every pinned node sits on the x = -1.5 end
        let res = problem.grid.resolution;
        for iz in 0..=res.nelz {
            for iy in 0..=res.nely {
                let [dof, _, _] = res.node_dofs(res.nelx, iy, iz);
                assert!(problem.dofs.fixed.binary_search(&dof).is_err());
            }
        }
    }
}
