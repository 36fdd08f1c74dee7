use hashbrown::{HashMap, HashSet};
use nalgebra::{Point3, Vector3};
use tracing::{debug, info, warn};

use crate::{
    config::SolverSettings,
    datatypes::{GridBounds, GridResolution, SurfaceMesh},
    error::{AbyssError, AbyssResult},
    isosurface::{IsosurfaceExtractor, MarchingTetrahedra, ScalarGrid},
    stl::write_stl_binary,
};

/// Embeds an element density field in a sample grid with a one-sample margin
/// of zeros on every side. Sample `(i, j, k)` holds element `(i-1, j-1, k-1)`.
pub fn pad_density(x_phys: &[f64], resolution: &GridResolution) -> AbyssResult<ScalarGrid> {
    if x_phys.len() != resolution.element_count() {
        return Err(AbyssError::Input(format!(
            "Density field has {} entries for {} elements",
            x_phys.len(),
            resolution.element_count()
        )));
    }

    let dims = [
        resolution.nelx + 2,
        resolution.nely + 2,
        resolution.nelz + 2,
    ];
    Ok(ScalarGrid::from_fn(dims, |i, j, k| {
        let interior = (1..=resolution.nelx).contains(&i)
            && (1..=resolution.nely).contains(&j)
            && (1..=resolution.nelz).contains(&k);
        if interior {
            x_phys[resolution.element_index(i - 1, j - 1, k - 1)]
        } else {
            0.0
        }
    }))
}

/// Moves a padded sample-space surface into world coordinates. The inverted
/// y axis mirrors the surface, so every face is rewound.
pub fn samples_to_world(mesh: &SurfaceMesh, bounds: &GridBounds) -> SurfaceMesh {
    let vertices = mesh
        .vertices
        .iter()
        .map(|p| bounds.voxel_to_world(p.x - 1.0, p.y - 1.0, p.z - 1.0))
        .collect();
    let faces = mesh.faces.iter().map(|[a, b, c]| [*a, *c, *b]).collect();
    SurfaceMesh::new(vertices, faces)
}

/// Signed volume enclosed by a closed, outward-wound surface
pub fn enclosed_volume(mesh: &SurfaceMesh) -> f64 {
    mesh.faces
        .iter()
        .map(|[a, b, c]| {
            let (a, b, c) = (
                mesh.vertices[*a].coords,
                mesh.vertices[*b].coords,
                mesh.vertices[*c].coords,
            );
            a.dot(&b.cross(&c))
        })
        .sum::<f64>()
        / 6.0
}

fn vertex_neighbors(mesh: &SurfaceMesh) -> Vec<Vec<usize>> {
    let mut neighbors: Vec<HashSet<usize>> = vec![HashSet::new(); mesh.vertices.len()];
    for [a, b, c] in &mesh.faces {
        for (u, v) in [(*a, *b), (*b, *c), (*c, *a)] {
            neighbors[u].insert(v);
            neighbors[v].insert(u);
        }
    }
    neighbors
        .into_iter()
        .map(|set| {
            let mut list: Vec<usize> = set.into_iter().collect();
            list.sort_unstable();
            list
        })
        .collect()
}

/// Umbrella-operator Laplacian smoothing. After every pass the mesh is scaled
/// about its vertex centroid back to the volume it had before the pass.
pub fn laplacian_smooth(mesh: &mut SurfaceMesh, passes: usize, lambda: f64) {
    if mesh.is_empty() || passes == 0 {
        return;
    }
    let neighbors = vertex_neighbors(mesh);

    for _ in 0..passes {
        let volume_before = enclosed_volume(mesh);

        let moved: Vec<Point3<f64>> = mesh
            .vertices
            .iter()
            .zip(&neighbors)
            .map(|(v, around)| {
                if around.is_empty() {
                    return *v;
                }
                let sum: Vector3<f64> = around.iter().map(|n| mesh.vertices[*n].coords).sum();
                let centroid = sum / around.len() as f64;
                v + (centroid - v.coords) * lambda
            })
            .collect();
        mesh.vertices = moved;

        let volume_after = enclosed_volume(mesh);
        if volume_before > 0.0
            && volume_after > 0.0
            && volume_before.is_finite()
            && volume_after.is_finite()
        {
            let scale = (volume_before / volume_after).cbrt();
            let center = mesh
                .vertices
                .iter()
                .map(|v| v.coords)
                .sum::<Vector3<f64>>()
                / mesh.vertices.len() as f64;
            for v in mesh.vertices.iter_mut() {
                v.coords = center + (v.coords - center) * scale;
            }
        }
    }
}

/// Every directed edge is used once and its reverse is present
pub fn is_watertight(mesh: &SurfaceMesh) -> bool {
    if mesh.faces.is_empty() {
        return false;
    }
    let mut half_edges = HashSet::with_capacity(3 * mesh.faces.len());
    for [a, b, c] in &mesh.faces {
        for edge in [(*a, *b), (*b, *c), (*c, *a)] {
            if !half_edges.insert(edge) {
                return false;
            }
        }
    }
    half_edges.iter().all(|(a, b)| half_edges.contains(&(*b, *a)))
}

/// Welds vertices closer than `tolerance` (per axis, on a quantized lattice)
fn merge_vertices(mesh: &mut SurfaceMesh, tolerance: f64) -> usize {
    let mut lookup: HashMap<[i64; 3], usize> = HashMap::new();
    let mut remap = Vec::with_capacity(mesh.vertices.len());
    let mut vertices = Vec::new();

    for v in &mesh.vertices {
        let key = [
            (v.x / tolerance).round() as i64,
            (v.y / tolerance).round() as i64,
            (v.z / tolerance).round() as i64,
        ];
        let index = *lookup.entry(key).or_insert_with(|| {
            vertices.push(*v);
            vertices.len() - 1
        });
        remap.push(index);
    }

    let merged = mesh.vertices.len() - vertices.len();
    mesh.vertices = vertices;
    for face in mesh.faces.iter_mut() {
        *face = face.map(|v| remap[v]);
    }
    merged
}

/// Drops faces with repeated or collinear corners, and repeated faces
fn drop_bad_faces(mesh: &mut SurfaceMesh) -> usize {
    let before = mesh.faces.len();
    let mut seen: HashSet<[usize; 3]> = HashSet::new();
    let vertices = &mesh.vertices;

    mesh.faces.retain(|face| {
        let [a, b, c] = *face;
        if a == b || b == c || c == a {
            return false;
        }
        let area = (vertices[b] - vertices[a])
            .cross(&(vertices[c] - vertices[a]))
            .norm();
        if !(area > 0.0) {
            return false;
        }
        let mut key = *face;
        key.sort_unstable();
        seen.insert(key)
    });

    before - mesh.faces.len()
}

/// Closed chains of directed edges that have no opposite edge
fn boundary_loops(mesh: &SurfaceMesh) -> Vec<Vec<usize>> {
    let mut half_edges = HashSet::with_capacity(3 * mesh.faces.len());
    for [a, b, c] in &mesh.faces {
        half_edges.extend([(*a, *b), (*b, *c), (*c, *a)]);
    }

    let mut outgoing: HashMap<usize, Vec<usize>> = HashMap::new();
    for (a, b) in &half_edges {
        if !half_edges.contains(&(*b, *a)) {
            outgoing.entry(*a).or_default().push(*b);
        }
    }

    let mut starts: Vec<usize> = outgoing.keys().copied().collect();
    starts.sort_unstable();

    let mut loops = Vec::new();
    for start in starts {
        while let Some(mut next) = outgoing.get_mut(&start).and_then(Vec::pop) {
            let mut chain = vec![start];
            let mut closed = false;
            while chain.len() <= half_edges.len() {
                if next == start {
                    closed = true;
                    break;
                }
                chain.push(next);
                match outgoing.get_mut(&next).and_then(Vec::pop) {
                    Some(n) => next = n,
                    None => break,
                }
            }
            if closed && chain.len() >= 3 {
                loops.push(chain);
            } else {
                debug!(start, length = chain.len(), "open boundary chain left unfilled");
            }
        }
    }
    loops
}

/// Fan-fills boundary loops of at most `max_edges` edges
fn fill_holes(mesh: &mut SurfaceMesh, max_edges: usize) -> usize {
    let mut filled = 0;
    for hole in boundary_loops(mesh) {
        if hole.len() > max_edges {
            warn!(edges = hole.len(), max_edges, "skipping large hole");
            continue;
        }
        let v0 = hole[0];
        for i in 1..hole.len() - 1 {
            mesh.faces.push([v0, hole[i + 1], hole[i]]);
        }
        filled += 1;
    }
    filled
}

fn drop_unreferenced_vertices(mesh: &mut SurfaceMesh) -> usize {
    let mut remap = vec![None; mesh.vertices.len()];
    let mut vertices = Vec::new();
    for face in mesh.faces.iter_mut() {
        for v in face.iter_mut() {
            let index = *remap[*v].get_or_insert_with(|| {
                vertices.push(mesh.vertices[*v]);
                vertices.len() - 1
            });
            *v = index;
        }
    }
    let dropped = mesh.vertices.len() - vertices.len();
    mesh.vertices = vertices;
    dropped
}

/// Best-effort cleanup of a triangle surface. Returns whether the result is
/// watertight.
pub fn repair(mesh: &mut SurfaceMesh, max_hole_edges: usize) -> bool {
    let scale = match mesh.bounds() {
        Some((min, max)) => (max - min).norm().max(f64::MIN_POSITIVE),
        None => return false,
    };

    let merged = merge_vertices(mesh, scale * 1e-9);
    let dropped = drop_bad_faces(mesh);
    let filled = if is_watertight(mesh) {
        0
    } else {
        fill_holes(mesh, max_hole_edges)
    };
    let unreferenced = drop_unreferenced_vertices(mesh);

    let watertight = is_watertight(mesh);
    debug!(merged, dropped, filled, unreferenced, watertight, "mesh repaired");
    if !watertight {
        warn!(
            faces = mesh.faces.len(),
            "extracted surface is not watertight after repair"
        );
    }
    watertight
}

/// Turns a density field into a smoothed, repaired world-space surface
///
/// # Arguments
/// * `x_phys` - Physical densities in element order
/// * `resolution`, `bounds` - The grid the densities live on
/// * `settings` - Iso level, smoothing and repair numerics
pub fn extract_mesh(
    x_phys: &[f64],
    resolution: &GridResolution,
    bounds: &GridBounds,
    settings: &SolverSettings,
) -> AbyssResult<SurfaceMesh> {
    let samples = pad_density(x_phys, resolution)?;
    let raw = MarchingTetrahedra.extract(&samples, settings.iso_level);
    if raw.vertices.is_empty() {
        return Err(AbyssError::Geometry(format!(
            "No density reaches the {} iso level, surface is empty",
            settings.iso_level
        )));
    }

    let mut mesh = samples_to_world(&raw, bounds);
    laplacian_smooth(&mut mesh, settings.smoothing_passes, settings.smoothing_factor);
    repair(&mut mesh, settings.max_hole_edges);

    if mesh.vertices.is_empty() {
        return Err(AbyssError::Geometry(
            "Surface vanished during repair".to_owned(),
        ));
    }

    info!(
        vertices = mesh.vertices.len(),
        faces = mesh.faces.len(),
        volume = enclosed_volume(&mesh),
        "surface extracted"
    );
    Ok(mesh)
}

/// Extracts the surface and serializes it as binary STL
pub fn extract_surface(
    x_phys: &[f64],
    resolution: &GridResolution,
    bounds: &GridBounds,
    settings: &SolverSettings,
) -> AbyssResult<Vec<u8>> {
    let mesh = extract_mesh(x_phys, resolution, bounds, settings)?;
    write_stl_binary(&mesh)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::containment::tests::box_mesh;

    fn grid() -> (GridResolution, GridBounds) {
        let resolution = GridResolution::new(6, 4, 3);
        let bounds = GridBounds::from_box(
            Point3::new(-1.5, 0.0, -0.5),
            Point3::new(1.5, 1.0, 0.5),
            &resolution,
        );
        (resolution, bounds)
    }

    #[test]
    fn padding_adds_a_zero_margin() {
        let (res, _) = grid();
        let x: Vec<f64> = (0..res.element_count()).map(|e| e as f64).collect();
        let samples = pad_density(&x, &res).unwrap();

        assert_eq!(samples.dims(), [8, 6, 5]);
        assert_eq!(samples.value(0, 2, 2), 0.0);
        assert_eq!(samples.value(7, 5, 4), 0.0);
        assert_eq!(samples.value(3, 2, 1), x[res.element_index(2, 1, 0)]);
        assert!(pad_density(&x[1..], &res).is_err());
    }

    #[test]
    fn full_block_extracts_inside_the_grid_bounds() {
        let (res, bounds) = grid();
        let x = vec![1.0; res.element_count()];
        let settings = SolverSettings::default();
        let mesh = extract_mesh(&x, &res, &bounds, &settings).unwrap();

        assert!(is_watertight(&mesh));
        assert!(enclosed_volume(&mesh) > 0.0);

        let (min, max) = mesh.bounds().unwrap();
        let margin = 0.1;
        assert!(min.x >= -1.5 - margin && max.x <= 1.5 + margin);
        assert!(min.y >= -margin && max.y <= 1.0 + margin);
        assert!(min.z >= -0.5 - margin && max.z <= 0.5 + margin);
    }

    #[test]
    fn world_mapping_keeps_the_inverted_axis() {
        let (res, bounds) = grid();
        // only the top layer of elements is solid
        let x: Vec<f64> = (0..res.element_count())
            .map(|e| if res.element_coords(e).1 == 0 { 1.0 } else { 0.0 })
            .collect();
        let settings = SolverSettings {
            smoothing_passes: 0,
            ..SolverSettings::default()
        };
        let mesh = extract_mesh(&x, &res, &bounds, &settings).unwrap();
        let (min, max) = mesh.bounds().unwrap();

        assert!((max.y - 1.0).abs() < 1e-9);
        assert!(min.y > 0.7);
        assert!(enclosed_volume(&mesh) > 0.0);
    }

    #[test]
    fn smoothing_keeps_the_enclosed_volume() {
        let mut mesh = box_mesh(Point3::new(-1.0, -1.0, -1.0), Point3::new(1.0, 1.0, 1.0));
        let before = enclosed_volume(&mesh);
        laplacian_smooth(&mut mesh, 5, 0.5);
        let after = enclosed_volume(&mesh);
        assert!((before - after).abs() < 1e-9 * before);
    }

    #[test]
    fn repair_closes_a_missing_face() {
        let mut mesh = box_mesh(Point3::origin(), Point3::new(1.0, 1.0, 1.0));
        let full_volume = enclosed_volume(&mesh);
        // drop the +z face
        mesh.faces.retain(|f| *f != [4, 5, 6] && *f != [4, 6, 7]);
        assert!(!is_watertight(&mesh));

        assert!(repair(&mut mesh, 64));
        assert_eq!(mesh.faces.len(), 12);
        assert!((enclosed_volume(&mesh) - full_volume).abs() < 1e-12);
    }

    #[test]
    fn repair_welds_split_vertices_and_drops_junk() {
        let mut mesh = box_mesh(Point3::origin(), Point3::new(1.0, 1.0, 1.0));
        // a duplicated corner plus a degenerate sliver
        mesh.vertices.push(Point3::new(1.0, 1.0, 1.0));
        let last = mesh.vertices.len() - 1;
        mesh.faces[2] = [4, 5, last];
        mesh.faces.push([0, 0, 1]);
        mesh.vertices.push(Point3::new(9.0, 9.0, 9.0));

        assert!(repair(&mut mesh, 64));
        assert_eq!(mesh.vertices.len(), 8);
        assert_eq!(mesh.faces.len(), 12);
    }

    #[test]
    fn empty_field_is_a_geometry_error() {
        let (res, bounds) = grid();
        let x = vec![0.0; res.element_count()];
        let result = extract_surface(&x, &res, &bounds, &SolverSettings::default());
        assert!(matches!(result, Err(AbyssError::Geometry(_))));
    }

    #[test]
    fn surface_bytes_are_binary_stl() {
        let (res, bounds) = grid();
        let x = vec![0.8; res.element_count()];
        let bytes = extract_surface(&x, &res, &bounds, &SolverSettings::default()).unwrap();
        let mesh = crate::stl::read_stl(&bytes).unwrap();
        assert!(!mesh.is_empty());
    }
}
