use nalgebra::{DVector, Point3, Vector3};
use serde::{Deserialize, Serialize};

/// Indexed triangle surface. Faces reference `vertices` by position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SurfaceMesh {
    pub vertices: Vec<Point3<f64>>,
    pub faces: Vec<[usize; 3]>,
}

impl SurfaceMesh {
    pub fn new(vertices: Vec<Point3<f64>>, faces: Vec<[usize; 3]>) -> SurfaceMesh {
        SurfaceMesh { vertices, faces }
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty() || self.faces.is_empty()
    }

    /// Axis-aligned bounds as `(min, max)`, or `None` for a mesh without vertices
    pub fn bounds(&self) -> Option<(Point3<f64>, Point3<f64>)> {
        let first = self.vertices.first()?;
        let mut min = *first;
        let mut max = *first;
        for v in &self.vertices[1..] {
            min = min.inf(v);
            max = max.sup(v);
        }
        Some((min, max))
    }

    pub fn triangle(&self, face: usize) -> [Point3<f64>; 3] {
        let [a, b, c] = self.faces[face];
        [self.vertices[a], self.vertices[b], self.vertices[c]]
    }
}

/// A support marker. Every grid node matched by it is pinned in all three
/// directions; `normal` is carried for the caller's benefit only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedSupport {
    pub position: Point3<f64>,
    pub normal: Vector3<f64>,
}

/// A load marker. Each matched node receives `magnitude * direction`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadVector {
    pub position: Point3<f64>,
    pub direction: Vector3<f64>,
    pub magnitude: f64,
}

/// Element counts along x, y (vertical, inverted) and z
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridResolution {
    pub nelx: usize,
    pub nely: usize,
    pub nelz: usize,
}

/// World-space placement of the voxel grid
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridBounds {
    pub bbox_min: Point3<f64>,
    pub bbox_max: Point3<f64>,
    pub dx: f64,
    pub dy: f64,
    pub dz: f64,
}

impl GridBounds {
    pub fn pitch(&self) -> f64 {
        self.dx.min(self.dy).min(self.dz)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VoxelGrid {
    pub resolution: GridResolution,
    pub bounds: GridBounds,
    /// One flag per element in linear element order; `true` marks void
    pub obstacle: Vec<bool>,
}

impl VoxelGrid {
    pub fn obstacle_count(&self) -> usize {
        self.obstacle.iter().filter(|o| **o).count()
    }

    /// Number of elements that take part in the design
    pub fn design_count(&self) -> usize {
        self.obstacle.len() - self.obstacle_count()
    }

    /// Whether the element nearest to `point` lies outside the solid
    pub fn is_void_at(&self, point: &Point3<f64>) -> bool {
        let (ex, ey, ez) = self.bounds.nearest_element(&self.resolution, point);
        let element = self.resolution.element_index(ex, ey, ez);
        self.obstacle.get(element).copied().unwrap_or(false)
    }
}

/// Exact split of the DOF range into constrained and unconstrained sets,
/// both sorted ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DofPartition {
    pub fixed: Vec<usize>,
    pub free: Vec<usize>,
}

impl DofPartition {
    /// Builds the partition from an arbitrary (possibly repeating) list of
    /// fixed DOFs over `0..ndof`.
    pub fn from_fixed(ndof: usize, fixed: impl IntoIterator<Item = usize>) -> DofPartition {
        let mut is_fixed = vec![false; ndof];
        for dof in fixed {
            is_fixed[dof] = true;
        }

        let mut partition = DofPartition {
            fixed: Vec::new(),
            free: Vec::with_capacity(ndof),
        };
        for (dof, pinned) in is_fixed.into_iter().enumerate() {
            if pinned {
                partition.fixed.push(dof);
            } else {
                partition.free.push(dof);
            }
        }

        partition
    }

    pub fn ndof(&self) -> usize {
        self.fixed.len() + self.free.len()
    }

    /// Maps every global DOF to its position in `free`, or `None` when fixed
    pub fn free_index(&self) -> Vec<Option<usize>> {
        let mut index = vec![None; self.ndof()];
        for (local, dof) in self.free.iter().enumerate() {
            index[*dof] = Some(local);
        }
        index
    }
}

/// Everything the optimizer needs, produced once by `prepare`
#[derive(Debug, Clone)]
pub struct PreparedProblem {
    pub grid: VoxelGrid,
    pub force: DVector<f64>,
    pub dofs: DofPartition,
}

impl PreparedProblem {
    pub fn grid_bounds(&self) -> &GridBounds {
        &self.grid.bounds
    }
}
