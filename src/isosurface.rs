//! Isosurface extraction by marching tetrahedra.
//!
//! Every cube of the sample lattice is split into six tetrahedra around its
//! main diagonal (corner 0 to corner 7). Neighbouring cubes then split their
//! shared faces along the same diagonal, so the surface closes up without the
//! ambiguous cases of marching cubes.

use hashbrown::HashMap;
use nalgebra::{Point3, Vector3};

use crate::{
    datatypes::SurfaceMesh,
    error::{AbyssError, AbyssResult},
};

/// Corner `b` of a cube sits at offset `(b & 1, (b >> 1) & 1, (b >> 2) & 1)`
const CUBE_TETRAHEDRA: [[usize; 4]; 6] = [
    [0, 1, 3, 7],
    [0, 1, 5, 7],
    [0, 2, 3, 7],
    [0, 2, 6, 7],
    [0, 4, 5, 7],
    [0, 4, 6, 7],
];

/// Scalar samples on a regular lattice, indexed `i + j*nx + k*nx*ny`
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarGrid {
    dims: [usize; 3],
    values: Vec<f64>,
}

impl ScalarGrid {
    pub fn new(dims: [usize; 3], values: Vec<f64>) -> AbyssResult<ScalarGrid> {
        if dims.iter().product::<usize>() != values.len() {
            return Err(AbyssError::Geometry(format!(
                "Sample grid {}x{}x{} does not match {} values",
                dims[0],
                dims[1],
                dims[2],
                values.len()
            )));
        }
        Ok(ScalarGrid { dims, values })
    }

    pub fn from_fn(dims: [usize; 3], f: impl Fn(usize, usize, usize) -> f64) -> ScalarGrid {
        let mut values = Vec::with_capacity(dims.iter().product());
        for k in 0..dims[2] {
            for j in 0..dims[1] {
                for i in 0..dims[0] {
                    values.push(f(i, j, k));
                }
            }
        }
        ScalarGrid { dims, values }
    }

    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    pub fn index(&self, i: usize, j: usize, k: usize) -> usize {
        i + j * self.dims[0] + k * self.dims[0] * self.dims[1]
    }

    pub fn value(&self, i: usize, j: usize, k: usize) -> f64 {
        self.values[self.index(i, j, k)]
    }
}

/// Capability: triangulate the level set of a sampled field
pub trait IsosurfaceExtractor {
    /// Returns a surface in sample-index coordinates, wound so normals point
    /// from values above `level` towards values below it.
    fn extract(&self, grid: &ScalarGrid, level: f64) -> SurfaceMesh;
}

pub struct MarchingTetrahedra;

struct Corner {
    sample: usize,
    position: Point3<f64>,
    value: f64,
}

/// Accumulates the surface; edge vertices are shared through their sample pair
struct SurfaceBuilder {
    level: f64,
    vertices: Vec<Point3<f64>>,
    faces: Vec<[usize; 3]>,
    edge_vertices: HashMap<(usize, usize), usize>,
}

impl SurfaceBuilder {
    fn edge_vertex(&mut self, a: &Corner, b: &Corner) -> usize {
        let (lo, hi) = if a.sample < b.sample { (a, b) } else { (b, a) };
        if let Some(index) = self.edge_vertices.get(&(lo.sample, hi.sample)) {
            return *index;
        }

        let t = (self.level - lo.value) / (hi.value - lo.value);
        let position = lo.position + (hi.position - lo.position) * t;
        let index = self.vertices.len();
        self.vertices.push(position);
        self.edge_vertices.insert((lo.sample, hi.sample), index);
        index
    }

    /// Adds a triangle, flipping it when its normal points into the solid
    fn push_oriented(&mut self, mut face: [usize; 3], outward: &Vector3<f64>) {
        let [a, b, c] = face.map(|v| self.vertices[v]);
        let normal = (b - a).cross(&(c - a));
        if normal.dot(outward) < 0.0 {
            face.swap(1, 2);
        }
        self.faces.push(face);
    }

    fn march(&mut self, tetrahedron: [&Corner; 4]) {
        let (inside, outside): (Vec<&Corner>, Vec<&Corner>) = tetrahedron
            .into_iter()
            .partition(|corner| corner.value > self.level);

        if inside.is_empty() || outside.is_empty() {
            return;
        }

        let centroid = |corners: &[&Corner]| {
            corners.iter().map(|c| c.position.coords).sum::<Vector3<f64>>()
                / corners.len() as f64
        };
        let outward = centroid(&outside) - centroid(&inside);

        match inside.len() {
            1 => {
                let a = inside[0];
                let face = [
                    self.edge_vertex(a, outside[0]),
                    self.edge_vertex(a, outside[1]),
                    self.edge_vertex(a, outside[2]),
                ];
                self.push_oriented(face, &outward);
            }
            3 => {
                let d = outside[0];
                let face = [
                    self.edge_vertex(inside[0], d),
                    self.edge_vertex(inside[1], d),
                    self.edge_vertex(inside[2], d),
                ];
                self.push_oriented(face, &outward);
            }
            _ => {
                let (a, b) = (inside[0], inside[1]);
                let (c, d) = (outside[0], outside[1]);
                let ac = self.edge_vertex(a, c);
                let ad = self.edge_vertex(a, d);
                let bd = self.edge_vertex(b, d);
                let bc = self.edge_vertex(b, c);
                self.push_oriented([ac, ad, bd], &outward);
                self.push_oriented([ac, bd, bc], &outward);
            }
        }
    }
}

impl IsosurfaceExtractor for MarchingTetrahedra {
    fn extract(&self, grid: &ScalarGrid, level: f64) -> SurfaceMesh {
        let [nx, ny, nz] = grid.dims();
        let mut builder = SurfaceBuilder {
            level,
            vertices: Vec::new(),
            faces: Vec::new(),
            edge_vertices: HashMap::new(),
        };

        if nx < 2 || ny < 2 || nz < 2 {
            return SurfaceMesh::default();
        }

        for k in 0..nz - 1 {
            for j in 0..ny - 1 {
                for i in 0..nx - 1 {
                    let corners: [Corner; 8] = std::array::from_fn(|b| {
                        let (ci, cj, ck) = (i + (b & 1), j + ((b >> 1) & 1), k + ((b >> 2) & 1));
                        Corner {
                            sample: grid.index(ci, cj, ck),
                            position: Point3::new(ci as f64, cj as f64, ck as f64),
                            value: grid.value(ci, cj, ck),
                        }
                    });

                    // skip cubes the surface cannot cross
                    let above = corners.iter().filter(|c| c.value > level).count();
                    if above == 0 || above == 8 {
                        continue;
                    }

                    for [a, b, c, d] in CUBE_TETRAHEDRA {
                        builder.march([&corners[a], &corners[b], &corners[c], &corners[d]]);
                    }
                }
            }
        }

        SurfaceMesh::new(builder.vertices, builder.faces)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashbrown::HashSet;

    fn single_voxel() -> ScalarGrid {
        ScalarGrid::from_fn([3, 3, 3], |i, j, k| {
            if (i, j, k) == (1, 1, 1) {
                1.0
            } else {
                0.0
            }
        })
    }

    fn signed_volume(mesh: &SurfaceMesh) -> f64 {
        mesh.faces
            .iter()
            .map(|[a, b, c]| {
                let (a, b, c) = (mesh.vertices[*a], mesh.vertices[*b], mesh.vertices[*c]);
                a.coords.dot(&b.coords.cross(&c.coords)) / 6.0
            })
            .sum()
    }

    fn is_closed(mesh: &SurfaceMesh) -> bool {
        let mut half_edges = HashSet::new();
        for [a, b, c] in &mesh.faces {
            for edge in [(*a, *b), (*b, *c), (*c, *a)] {
                if !half_edges.insert(edge) {
                    return false;
                }
            }
        }
        half_edges.iter().all(|(a, b)| half_edges.contains(&(*b, *a)))
    }

    #[test]
    fn empty_field_has_no_surface() {
        let grid = ScalarGrid::from_fn([4, 4, 4], |_, _, _| 0.0);
        assert!(MarchingTetrahedra.extract(&grid, 0.5).is_empty());
    }

    #[test]
    fn single_sample_gives_closed_outward_surface() {
        let mesh = MarchingTetrahedra.extract(&single_voxel(), 0.5);

        assert!(!mesh.is_empty());
        assert!(is_closed(&mesh));
        assert!(signed_volume(&mesh) > 0.0);

        // vertices sit halfway along edges leaving the centre sample
        for v in &mesh.vertices {
            let d = (v - Point3::new(1.0, 1.0, 1.0)).abs().max();
            assert!((d - 0.5).abs() < 1e-12);
        }
    }

    #[test]
    fn block_surface_is_closed_and_encloses_the_block() {
        let grid = ScalarGrid::from_fn([6, 5, 4], |i, j, k| {
            if (1..5).contains(&i) && (1..4).contains(&j) && (1..3).contains(&k) {
                1.0
            } else {
                0.0
            }
        });
        let mesh = MarchingTetrahedra.extract(&grid, 0.5);
        assert!(is_closed(&mesh));

        // the level set runs halfway between samples: (4 x 3 x 2) cells minus trimmed corners
        let volume = signed_volume(&mesh);
        assert!(volume > 3.0 * 2.0 * 1.0 && volume < 4.0 * 3.0 * 2.0);

        let (min, max) = mesh.bounds().unwrap();
        assert!((min.x - 0.5).abs() < 1e-12 && (max.x - 4.5).abs() < 1e-12);
    }

    #[test]
    fn rejects_mismatched_sample_count() {
        assert!(ScalarGrid::new([2, 2, 2], vec![0.0; 7]).is_err());
        assert!(ScalarGrid::new([2, 2, 2], vec![0.0; 8]).is_ok());
    }
}
