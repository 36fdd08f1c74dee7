//! STL input and output.
//!
//! Input may be binary or ASCII; the format is sniffed from the content.
//! Output is always binary: an 80-byte header, a little-endian `u32`
//! triangle count, then per triangle a normal and three vertices as `f32`
//! triples followed by a zero `u16` attribute.

use hashbrown::HashMap;
use nalgebra::{Point3, Vector3};

use crate::{
    datatypes::SurfaceMesh,
    error::{AbyssError, AbyssResult},
};

const HEADER_SIZE: usize = 80;
const TRIANGLE_SIZE: usize = 50;

/// Parses STL bytes into an indexed mesh, merging bit-identical vertices
pub fn read_stl(bytes: &[u8]) -> AbyssResult<SurfaceMesh> {
    let triangles = if looks_like_ascii(bytes) {
        read_ascii_triangles(bytes)?
    } else {
        read_binary_triangles(bytes)?
    };

    if triangles.is_empty() {
        return Err(AbyssError::Input("STL contains no triangles".to_owned()));
    }

    Ok(index_triangles(&triangles))
}

pub fn read_stl_file(path: &str) -> AbyssResult<SurfaceMesh> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(_err) => {
            return Err(AbyssError::Input(format!(
                "Unable to open geometry file {path}"
            )))
        }
    };
    read_stl(&bytes)
}

/// A binary file whose header happens to start with "solid" still has its
/// length fixed by the triangle count.
fn looks_like_ascii(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(HEADER_SIZE)];
    let starts_solid = String::from_utf8_lossy(head).trim_start().starts_with("solid");
    if !starts_solid {
        return false;
    }

    if bytes.len() >= HEADER_SIZE + 4 {
        let count = u32::from_le_bytes([
            bytes[HEADER_SIZE],
            bytes[HEADER_SIZE + 1],
            bytes[HEADER_SIZE + 2],
            bytes[HEADER_SIZE + 3],
        ]) as usize;
        if HEADER_SIZE + 4 + count * TRIANGLE_SIZE == bytes.len() {
            return false;
        }
    }
    true
}

fn read_binary_triangles(bytes: &[u8]) -> AbyssResult<Vec<[Point3<f64>; 3]>> {
    if bytes.len() < HEADER_SIZE + 4 {
        return Err(AbyssError::Input(format!(
            "Binary STL is truncated: {} bytes is shorter than its header",
            bytes.len()
        )));
    }

    let count = u32::from_le_bytes([
        bytes[HEADER_SIZE],
        bytes[HEADER_SIZE + 1],
        bytes[HEADER_SIZE + 2],
        bytes[HEADER_SIZE + 3],
    ]) as usize;

    let body = &bytes[HEADER_SIZE + 4..];
    if body.len() < count * TRIANGLE_SIZE {
        return Err(AbyssError::Input(format!(
            "Binary STL is truncated: header declares {count} triangles, found {}",
            body.len() / TRIANGLE_SIZE
        )));
    }

    let triangles = body
        .chunks_exact(TRIANGLE_SIZE)
        .take(count)
        .map(|record| {
            [
                read_point(&record[12..24]),
                read_point(&record[24..36]),
                read_point(&record[36..48]),
            ]
        })
        .collect();

    Ok(triangles)
}

fn read_point(buf: &[u8]) -> Point3<f64> {
    let component = |offset: usize| {
        f64::from(f32::from_le_bytes([
            buf[offset],
            buf[offset + 1],
            buf[offset + 2],
            buf[offset + 3],
        ]))
    };
    Point3::new(component(0), component(4), component(8))
}

fn read_ascii_triangles(bytes: &[u8]) -> AbyssResult<Vec<[Point3<f64>; 3]>> {
    let text = String::from_utf8_lossy(bytes);
    let mut triangles = Vec::new();
    let mut corners: Vec<Point3<f64>> = Vec::with_capacity(3);

    for (line_number, line) in text.lines().enumerate() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(keyword) = parts.first() else {
            continue;
        };

        match keyword.to_ascii_lowercase().as_str() {
            "outer" => corners.clear(),
            "vertex" => {
                if parts.len() < 4 {
                    return Err(AbyssError::Input(format!(
                        "ASCII STL line {}: vertex needs three coordinates",
                        line_number + 1
                    )));
                }
                let mut xyz = [0.0; 3];
                for (value, part) in xyz.iter_mut().zip(&parts[1..4]) {
                    *value = match part.parse::<f64>() {
                        Ok(v) => v,
                        Err(_) => {
                            return Err(AbyssError::Input(format!(
                                "ASCII STL line {}: bad coordinate '{part}'",
                                line_number + 1
                            )))
                        }
                    };
                }
                corners.push(Point3::new(xyz[0], xyz[1], xyz[2]));
            }
            "endfacet" => {
                if corners.len() != 3 {
                    return Err(AbyssError::Input(format!(
                        "ASCII STL line {}: facet has {} vertices",
                        line_number + 1,
                        corners.len()
                    )));
                }
                triangles.push([corners[0], corners[1], corners[2]]);
                corners.clear();
            }
            "endsolid" => break,
            _ => {}
        }
    }

    Ok(triangles)
}

/// Builds shared vertices from a triangle soup
fn index_triangles(triangles: &[[Point3<f64>; 3]]) -> SurfaceMesh {
    let mut lookup: HashMap<[u64; 3], usize> = HashMap::new();
    let mut vertices = Vec::new();
    let mut faces = Vec::with_capacity(triangles.len());

    for triangle in triangles {
        let face = triangle.map(|p| {
            // +0.0 folds -0.0 onto the same key
            let key = [
                (p.x + 0.0).to_bits(),
                (p.y + 0.0).to_bits(),
                (p.z + 0.0).to_bits(),
            ];
            *lookup.entry(key).or_insert_with(|| {
                vertices.push(p);
                vertices.len() - 1
            })
        });
        faces.push(face);
    }

    SurfaceMesh::new(vertices, faces)
}

/// Serializes a mesh as binary STL
pub fn write_stl_binary(mesh: &SurfaceMesh) -> AbyssResult<Vec<u8>> {
    let count = match u32::try_from(mesh.faces.len()) {
        Ok(c) => c,
        Err(_) => {
            return Err(AbyssError::Geometry(format!(
                "{} triangles do not fit in a binary STL",
                mesh.faces.len()
            )))
        }
    };

    let mut bytes = Vec::with_capacity(HEADER_SIZE + 4 + mesh.faces.len() * TRIANGLE_SIZE);
    let mut header = [0u8; HEADER_SIZE];
    let title = b"abyss optimized topology";
    header[..title.len()].copy_from_slice(title);
    bytes.extend_from_slice(&header);
    bytes.extend_from_slice(&count.to_le_bytes());

    for face in 0..mesh.faces.len() {
        let [a, b, c] = mesh.triangle(face);
        let normal = (b - a)
            .cross(&(c - a))
            .try_normalize(0.0)
            .unwrap_or_else(Vector3::zeros);

        for value in normal.iter().chain(a.iter()).chain(b.iter()).chain(c.iter()) {
            bytes.extend_from_slice(&(*value as f32).to_le_bytes());
        }
        bytes.extend_from_slice(&0u16.to_le_bytes());
    }

    Ok(bytes)
}
