//! Grid addressing shared by voxelization, boundary mapping, assembly and
//! surface extraction.
//!
//! Conventions:
//! * y is the vertical axis and is indexed top-down: index 0 sits at
//!   `bbox_max.y`, larger indices move towards `bbox_min.y`. x and z are
//!   indexed from their minimum bound upwards.
//! * Elements are numbered fastest over y, then x, then z.
//! * Nodes carry a 1-based id `iz*(nelx+1)*(nely+1) + ix*(nely+1) + (nely+1-iy)`
//!   and own the three DOFs `3*nid-3`, `3*nid-2`, `3*nid-1`.
//!
//! Every conversion between grid indices and world coordinates goes through
//! this module.

use nalgebra::Point3;

use crate::datatypes::{GridBounds, GridResolution};

pub const DOF_PER_NODE: usize = 3;
pub const NODES_PER_ELEMENT: usize = 8;
pub const ELEMENT_DOFS: usize = DOF_PER_NODE * NODES_PER_ELEMENT;

/// Index offsets `(x, y, z)` of an element's corner nodes, in local order.
/// The element stiffness template uses the same order.
pub const CORNER_OFFSETS: [[usize; 3]; NODES_PER_ELEMENT] = [
    [0, 0, 0],
    [1, 0, 0],
    [0, 1, 0],
    [1, 1, 0],
    [0, 0, 1],
    [1, 0, 1],
    [0, 1, 1],
    [1, 1, 1],
];

impl GridResolution {
    pub fn new(nelx: usize, nely: usize, nelz: usize) -> GridResolution {
        GridResolution { nelx, nely, nelz }
    }

    pub fn element_count(&self) -> usize {
        self.nelx * self.nely * self.nelz
    }

    pub fn node_count(&self) -> usize {
        (self.nelx + 1) * (self.nely + 1) * (self.nelz + 1)
    }

    pub fn dof_count(&self) -> usize {
        DOF_PER_NODE * self.node_count()
    }

    pub fn element_index(&self, ex: usize, ey: usize, ez: usize) -> usize {
        ey + ex * self.nely + ez * self.nely * self.nelx
    }

    /// Inverse of [`GridResolution::element_index`], as `(ex, ey, ez)`
    pub fn element_coords(&self, element: usize) -> (usize, usize, usize) {
        let ey = element % self.nely;
        let ex = (element / self.nely) % self.nelx;
        let ez = element / (self.nely * self.nelx);
        (ex, ey, ez)
    }

    /// 1-based node id
    pub fn node_id(&self, ix: usize, iy: usize, iz: usize) -> usize {
        iz * (self.nelx + 1) * (self.nely + 1) + ix * (self.nely + 1) + (self.nely + 1 - iy)
    }

    pub fn node_dofs(&self, ix: usize, iy: usize, iz: usize) -> [usize; DOF_PER_NODE] {
        let nid = self.node_id(ix, iy, iz);
        [3 * nid - 3, 3 * nid - 2, 3 * nid - 1]
    }

    /// Global DOFs of an element, corner by corner in [`CORNER_OFFSETS`] order
    pub fn element_dofs(&self, ex: usize, ey: usize, ez: usize) -> [usize; ELEMENT_DOFS] {
        let mut dofs = [0usize; ELEMENT_DOFS];
        for (corner, [ox, oy, oz]) in CORNER_OFFSETS.iter().enumerate() {
            let node = self.node_dofs(ex + ox, ey + oy, ez + oz);
            dofs[DOF_PER_NODE * corner..DOF_PER_NODE * (corner + 1)].copy_from_slice(&node);
        }
        dofs
    }
}

impl GridBounds {
    /// Derives cell sizes from a bounding box and a resolution
    pub fn from_box(
        bbox_min: Point3<f64>,
        bbox_max: Point3<f64>,
        resolution: &GridResolution,
    ) -> GridBounds {
        GridBounds {
            bbox_min,
            bbox_max,
            dx: (bbox_max.x - bbox_min.x) / resolution.nelx as f64,
            dy: (bbox_max.y - bbox_min.y) / resolution.nely as f64,
            dz: (bbox_max.z - bbox_min.z) / resolution.nelz as f64,
        }
    }

    /// World position of a fractional element-centre coordinate. Integer
    /// arguments land exactly on element centres.
    pub fn voxel_to_world(&self, ex: f64, ey: f64, ez: f64) -> Point3<f64> {
        Point3::new(
            self.bbox_min.x + (ex + 0.5) * self.dx,
            self.bbox_max.y - (ey + 0.5) * self.dy,
            self.bbox_min.z + (ez + 0.5) * self.dz,
        )
    }

    /// Inverse of [`GridBounds::voxel_to_world`]
    pub fn world_to_voxel(&self, point: &Point3<f64>) -> [f64; 3] {
        [
            (point.x - self.bbox_min.x) / self.dx - 0.5,
            (self.bbox_max.y - point.y) / self.dy - 0.5,
            (point.z - self.bbox_min.z) / self.dz - 0.5,
        ]
    }

    pub fn element_center(&self, ex: usize, ey: usize, ez: usize) -> Point3<f64> {
        self.voxel_to_world(ex as f64, ey as f64, ez as f64)
    }

    /// World position of a fractional node coordinate
    pub fn lattice_to_world(&self, ix: f64, iy: f64, iz: f64) -> Point3<f64> {
        Point3::new(
            self.bbox_min.x + ix * self.dx,
            self.bbox_max.y - iy * self.dy,
            self.bbox_min.z + iz * self.dz,
        )
    }

    /// Inverse of [`GridBounds::lattice_to_world`]
    pub fn world_to_lattice(&self, point: &Point3<f64>) -> [f64; 3] {
        [
            (point.x - self.bbox_min.x) / self.dx,
            (self.bbox_max.y - point.y) / self.dy,
            (point.z - self.bbox_min.z) / self.dz,
        ]
    }

    pub fn node_position(&self, ix: usize, iy: usize, iz: usize) -> Point3<f64> {
        self.lattice_to_world(ix as f64, iy as f64, iz as f64)
    }

    /// Node nearest to `point`. On a rectilinear lattice the nearest node is
    /// the per-axis nearest index, clamped to the grid.
    pub fn nearest_node(
        &self,
        resolution: &GridResolution,
        point: &Point3<f64>,
    ) -> (usize, usize, usize) {
        let [fx, fy, fz] = self.world_to_lattice(point);
        (
            clamp_index(fx, resolution.nelx),
            clamp_index(fy, resolution.nely),
            clamp_index(fz, resolution.nelz),
        )
    }

    /// Element whose centre is nearest to `point`
    pub fn nearest_element(
        &self,
        resolution: &GridResolution,
        point: &Point3<f64>,
    ) -> (usize, usize, usize) {
        let [fx, fy, fz] = self.world_to_voxel(point);
        (
            clamp_index(fx, resolution.nelx - 1),
            clamp_index(fy, resolution.nely - 1),
            clamp_index(fz, resolution.nelz - 1),
        )
    }
}

fn clamp_index(value: f64, max: usize) -> usize {
    if value.is_nan() || value <= 0.0 {
        return 0;
    }
    (value.round() as usize).min(max)
}
