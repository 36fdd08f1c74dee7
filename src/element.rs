use nalgebra::{SMatrix, SVector};

use crate::addressing::{CORNER_OFFSETS, ELEMENT_DOFS, NODES_PER_ELEMENT};

pub type ElementMatrix = SMatrix<f64, ELEMENT_DOFS, ELEMENT_DOFS>;
pub type ElementVector = SVector<f64, ELEMENT_DOFS>;

/// Calculates the 3D isotropic stress-strain matrix
///
/// # Arguments
/// * `poisson_ratio` - The poisson ratio of the material
/// * `youngs_modulus` - The modulus of elasticity of the material
///
/// # Returns
/// A 6x6 stress-strain matrix in Voigt order (xx, yy, zz, xy, yz, zx)
pub fn compute_stress_strain_matrix(poisson_ratio: f64, youngs_modulus: f64) -> SMatrix<f64, 6, 6> {
    let nu = poisson_ratio;
    let shear = (1.0 - 2.0 * nu) / 2.0;

    let mut stress_strain_mat: SMatrix<f64, 6, 6> = SMatrix::zeros();
    for i in 0..3 {
        for j in 0..3 {
            stress_strain_mat[(i, j)] = if i == j { 1.0 - nu } else { nu };
        }
        stress_strain_mat[(i + 3, i + 3)] = shear;
    }

    stress_strain_mat * (youngs_modulus / ((1.0 + nu) * (1.0 - 2.0 * nu)))
}

/// Natural coordinates of an element corner. The y axis of the grid is indexed
/// top-down, so a corner one step along iy sits one cell lower.
fn corner_natural_coords(corner: usize) -> [f64; 3] {
    let [ox, oy, oz] = CORNER_OFFSETS[corner];
    [
        2.0 * ox as f64 - 1.0,
        1.0 - 2.0 * oy as f64,
        2.0 * oz as f64 - 1.0,
    ]
}

/// Calculates the strain-displacement matrix of a unit cube at a point
///
/// # Arguments
/// * `xi`, `eta`, `zeta` - Natural coordinates of the evaluation point in [-1, 1]
///
/// # Returns
/// A 6x24 strain-displacement matrix
pub fn compute_strain_displacement_matrix(
    xi: f64,
    eta: f64,
    zeta: f64,
) -> SMatrix<f64, 6, ELEMENT_DOFS> {
    // unit cube: dx/dxi = 1/2 on every axis
    let jacobian_inv = 2.0;

    let mut strain_displacement_mat: SMatrix<f64, 6, ELEMENT_DOFS> = SMatrix::zeros();
    for corner in 0..NODES_PER_ELEMENT {
        let [xi_i, eta_i, zeta_i] = corner_natural_coords(corner);

        let dn_dx = jacobian_inv * 0.125 * xi_i * (1.0 + eta * eta_i) * (1.0 + zeta * zeta_i);
        let dn_dy = jacobian_inv * 0.125 * eta_i * (1.0 + xi * xi_i) * (1.0 + zeta * zeta_i);
        let dn_dz = jacobian_inv * 0.125 * zeta_i * (1.0 + xi * xi_i) * (1.0 + eta * eta_i);

        let (u, v, w) = (3 * corner, 3 * corner + 1, 3 * corner + 2);

        strain_displacement_mat[(0, u)] = dn_dx;
        strain_displacement_mat[(1, v)] = dn_dy;
        strain_displacement_mat[(2, w)] = dn_dz;

        strain_displacement_mat[(3, u)] = dn_dy;
        strain_displacement_mat[(3, v)] = dn_dx;

        strain_displacement_mat[(4, v)] = dn_dz;
        strain_displacement_mat[(4, w)] = dn_dy;

        strain_displacement_mat[(5, u)] = dn_dz;
        strain_displacement_mat[(5, w)] = dn_dx;
    }

    strain_displacement_mat
}

/// Computes the stiffness matrix of a unit hexahedral element with unit
/// Young's modulus, integrated with 2x2x2 Gauss quadrature
///
/// # Arguments
/// * `poisson_ratio` - The poisson ratio of the material
///
/// # Returns
/// A 24x24 stiffness template, in the local DOF order of the grid addressing
pub fn element_stiffness_template(poisson_ratio: f64) -> ElementMatrix {
    let stress_strain_mat = compute_stress_strain_matrix(poisson_ratio, 1.0);
    let gauss = 1.0 / f64::sqrt(3.0);
    // |J| of the unit cube mapping
    let det_jacobian = 0.125;

    let mut stiffness: ElementMatrix = SMatrix::zeros();
    for xi in [-gauss, gauss] {
        for eta in [-gauss, gauss] {
            for zeta in [-gauss, gauss] {
                let b = compute_strain_displacement_matrix(xi, eta, zeta);
                stiffness += b.transpose() * stress_strain_mat * b * det_jacobian;
            }
        }
    }

    stiffness
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addressing::CORNER_OFFSETS;

    fn corner_position(corner: usize) -> [f64; 3] {
        let [ox, oy, oz] = CORNER_OFFSETS[corner];
        [ox as f64, 1.0 - oy as f64, oz as f64]
    }

    #[test]
    fn template_is_symmetric_with_positive_diagonal() {
        let ke = element_stiffness_template(0.3);
        for i in 0..ELEMENT_DOFS {
            assert!(ke[(i, i)] > 0.0);
            for j in 0..ELEMENT_DOFS {
                assert!((ke[(i, j)] - ke[(j, i)]).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn rigid_translations_produce_no_force() {
        let ke = element_stiffness_template(0.3);
        for axis in 0..3 {
            let mut u = ElementVector::zeros();
            for corner in 0..NODES_PER_ELEMENT {
                u[3 * corner + axis] = 1.0;
            }
            assert!((ke * u).norm() < 1e-12);
        }
    }

    #[test]
    fn rigid_rotation_produces_no_force() {
        let ke = element_stiffness_template(0.3);
        // small rotation about z: u = -y, v = x
        let mut u = ElementVector::zeros();
        for corner in 0..NODES_PER_ELEMENT {
            let [x, y, _] = corner_position(corner);
            u[3 * corner] = -y;
            u[3 * corner + 1] = x;
        }
        assert!((ke * u).norm() < 1e-12);
    }

    #[test]
    fn uniaxial_stretch_stores_strain_energy() {
        let ke = element_stiffness_template(0.0);
        // unit strain in x with nu = 0 stores E/2 per unit volume
        let mut u = ElementVector::zeros();
        for corner in 0..NODES_PER_ELEMENT {
            u[3 * corner] = corner_position(corner)[0];
        }
        let energy = 0.5 * u.dot(&(ke * u));
        assert!((energy - 0.5).abs() < 1e-12);
    }

    #[test]
    fn stress_strain_matrix_matches_lame_parameters() {
        let d = compute_stress_strain_matrix(0.25, 10.0);
        let lambda = 10.0 * 0.25 / (1.25 * 0.5);
        let mu = 10.0 / (2.0 * 1.25);
        assert!((d[(0, 1)] - lambda).abs() < 1e-12);
        assert!((d[(0, 0)] - (lambda + 2.0 * mu)).abs() < 1e-12);
        assert!((d[(3, 3)] - mu).abs() < 1e-12);
    }
}
