//! Point-in-solid queries against a closed triangle surface.
//!
//! The input surface is expected to be watertight. Open or self-intersecting
//! surfaces give noisy answers near the defects; that is not detected here.

use nalgebra::{Point3, Vector3};

use crate::datatypes::SurfaceMesh;

/// Capability: decide whether a point lies inside a closed surface
pub trait Containment: Sync {
    fn contains(&self, point: &Point3<f64>) -> bool;
}

/// Ray-parity containment. Three rays in unrelated, non-axis-aligned
/// directions are cast and the majority answer wins, so a ray that grazes a
/// shared edge or vertex does not flip the result on its own.
pub struct RayParity {
    triangles: Vec<[Point3<f64>; 3]>,
    directions: [Vector3<f64>; 3],
}

impl RayParity {
    pub fn new(mesh: &SurfaceMesh) -> RayParity {
        let triangles = (0..mesh.faces.len()).map(|f| mesh.triangle(f)).collect();

        RayParity {
            triangles,
            directions: [
                Vector3::new(1.0, 0.2371, 0.1193).normalize(),
                Vector3::new(-0.3101, 1.0, 0.4127).normalize(),
                Vector3::new(0.2213, -0.3417, 1.0).normalize(),
            ],
        }
    }

    fn crossings(&self, origin: &Point3<f64>, direction: &Vector3<f64>) -> usize {
        self.triangles
            .iter()
            .filter(|[v0, v1, v2]| ray_triangle_intersect(origin, direction, v0, v1, v2).is_some())
            .count()
    }
}

impl Containment for RayParity {
    fn contains(&self, point: &Point3<f64>) -> bool {
        let votes = self
            .directions
            .iter()
            .filter(|d| self.crossings(point, d) % 2 == 1)
            .count();
        votes >= 2
    }
}

/// Möller–Trumbore ray/triangle test. Returns the ray parameter of a hit in
/// front of the origin.
pub fn ray_triangle_intersect(
    origin: &Point3<f64>,
    direction: &Vector3<f64>,
    v0: &Point3<f64>,
    v1: &Point3<f64>,
    v2: &Point3<f64>,
) -> Option<f64> {
    const EPSILON: f64 = 1e-12;

    let edge1 = v1 - v0;
    let edge2 = v2 - v0;

    let h = direction.cross(&edge2);
    let a = edge1.dot(&h);

    // parallel
    if a.abs() < EPSILON {
        return None;
    }

    let f = 1.0 / a;
    let s = origin - v0;
    let u = f * s.dot(&h);
    if !(0.0..=1.0).contains(&u) {
        return None;
    }

    let q = s.cross(&edge1);
    let v = f * direction.dot(&q);
    if v < 0.0 || u + v > 1.0 {
        return None;
    }

    let t = f * edge2.dot(&q);
    if t > EPSILON {
        Some(t)
    } else {
        None
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Closed, outward-wound axis-aligned box
    pub(crate) fn box_mesh(min: Point3<f64>, max: Point3<f64>) -> SurfaceMesh {
        let vertices = vec![
            Point3::new(min.x, min.y, min.z),
            Point3::new(max.x, min.y, min.z),
            Point3::new(max.x, max.y, min.z),
            Point3::new(min.x, max.y, min.z),
            Point3::new(min.x, min.y, max.z),
            Point3::new(max.x, min.y, max.z),
            Point3::new(max.x, max.y, max.z),
            Point3::new(min.x, max.y, max.z),
        ];
        let faces = vec![
            [0, 2, 1],
            [0, 3, 2],
            [4, 5, 6],
            [4, 6, 7],
            [0, 1, 5],
            [0, 5, 4],
            [3, 7, 6],
            [3, 6, 2],
            [0, 4, 7],
            [0, 7, 3],
            [1, 2, 6],
            [1, 6, 5],
        ];
        SurfaceMesh::new(vertices, faces)
    }

    #[test]
    fn ray_hits_triangle_in_front() {
        let t = ray_triangle_intersect(
            &Point3::new(0.2, 0.2, -1.0),
            &Vector3::new(0.0, 0.0, 1.0),
            &Point3::new(0.0, 0.0, 0.0),
            &Point3::new(1.0, 0.0, 0.0),
            &Point3::new(0.0, 1.0, 0.0),
        );
        assert!((t.unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn ray_misses_triangle_behind() {
        let t = ray_triangle_intersect(
            &Point3::new(0.2, 0.2, 1.0),
            &Vector3::new(0.0, 0.0, 1.0),
            &Point3::new(0.0, 0.0, 0.0),
            &Point3::new(1.0, 0.0, 0.0),
            &Point3::new(0.0, 1.0, 0.0),
        );
        assert!(t.is_none());
    }

    #[test]
    fn box_contains_interior_points() {
        let mesh = box_mesh(Point3::new(-1.5, 0.0, -0.5), Point3::new(1.5, 1.0, 0.5));
        let solid = RayParity::new(&mesh);

        assert!(solid.contains(&Point3::new(0.0, 0.5, 0.0)));
        assert!(solid.contains(&Point3::new(1.45, 0.95, 0.45)));
        // y - z = 0.5 puts an axis-aligned ray on the split of the +x face
        assert!(solid.contains(&Point3::new(0.05, 0.55, 0.05)));
    }

    #[test]
    fn box_rejects_exterior_points() {
        let mesh = box_mesh(Point3::new(-1.5, 0.0, -0.5), Point3::new(1.5, 1.0, 0.5));
        let solid = RayParity::new(&mesh);

        assert!(!solid.contains(&Point3::new(2.0, 0.5, 0.0)));
        assert!(!solid.contains(&Point3::new(0.0, -0.1, 0.0)));
        assert!(!solid.contains(&Point3::new(0.0, 0.5, 0.6)));
    }
}
