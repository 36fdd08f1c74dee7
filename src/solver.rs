use std::time::Instant;

use argmin::{
    core::{Executor, Operator, State},
    solver::conjugategradient::ConjugateGradient,
};
use faer::linalg::solvers::Solve;
use faer::sparse::linalg::solvers::{Llt, SymbolicLlt};
use faer::sparse::{SparseColMat, Triplet};
use faer::Side;
use nalgebra::DVector;
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use tracing::debug;

use crate::{
    addressing::ELEMENT_DOFS,
    datatypes::{DofPartition, GridResolution},
    element::ElementMatrix,
    error::{AbyssError, AbyssResult},
};

/// Which linear solver backs the displacement solve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinearSolverKind {
    /// Sparse LLᵀ factorization
    Cholesky,
    /// Jacobi-scaled conjugate gradient
    ConjugateGradient,
}

/// Capability: solve `A x = b` for a sparse symmetric positive definite `A`
pub trait LinearSolver: Send {
    fn name(&self) -> &'static str;

    fn solve(&mut self, a: &CsrMatrix<f64>, b: &DVector<f64>) -> AbyssResult<DVector<f64>>;
}

/// Builds the requested solver backend
pub fn build_linear_solver(
    kind: LinearSolverKind,
    cg_relative_tolerance: f64,
    cg_max_iterations: u64,
) -> Box<dyn LinearSolver> {
    match kind {
        LinearSolverKind::Cholesky => Box::new(CholeskySolver::new()),
        LinearSolverKind::ConjugateGradient => Box::new(ConjugateGradientSolver::new(
            cg_relative_tolerance,
            cg_max_iterations,
        )),
    }
}

/// Sparse matrix times dense vector
pub fn csr_mul_vec(a: &CsrMatrix<f64>, x: &[f64]) -> Vec<f64> {
    a.row_iter()
        .map(|row| {
            row.col_indices()
                .iter()
                .zip(row.values())
                .map(|(col, value)| value * x[*col])
                .sum()
        })
        .collect()
}

/// Compiles the scaled element template of every element into the global
/// stiffness matrix
///
/// # Arguments
/// * `resolution` - The element grid
/// * `template` - The unit element stiffness matrix
/// * `element_scale` - Stiffness multiplier of each element, in element order
///
/// # Returns
/// The global stiffness matrix over all DOFs
pub fn build_total_stiffness_matrix(
    resolution: &GridResolution,
    template: &ElementMatrix,
    element_scale: &[f64],
) -> CsrMatrix<f64> {
    let ndof = resolution.dof_count();
    let mut coo = CooMatrix::new(ndof, ndof);
    coo.reserve(element_scale.len() * ELEMENT_DOFS * ELEMENT_DOFS);

    for (element, scale) in element_scale.iter().enumerate() {
        let (ex, ey, ez) = resolution.element_coords(element);
        let dofs = resolution.element_dofs(ex, ey, ez);

        for (local_row, global_row) in dofs.iter().enumerate() {
            for (local_col, global_col) in dofs.iter().enumerate() {
                coo.push(
                    *global_row,
                    *global_col,
                    scale * template[(local_row, local_col)],
                );
            }
        }
    }

    CsrMatrix::from(&coo)
}

/// Restricts a global matrix to the rows and columns of the free DOFs
pub fn restrict_to_free(k: &CsrMatrix<f64>, dofs: &DofPartition) -> AbyssResult<CsrMatrix<f64>> {
    let free_index = dofs.free_index();
    let n = dofs.free.len();

    let mut row_offsets = Vec::with_capacity(n + 1);
    let mut col_indices = Vec::new();
    let mut values = Vec::new();
    row_offsets.push(0);

    for global_row in &dofs.free {
        let row = k.row(*global_row);
        for (global_col, value) in row.col_indices().iter().zip(row.values()) {
            if let Some(local_col) = free_index[*global_col] {
                col_indices.push(local_col);
                values.push(*value);
            }
        }
        row_offsets.push(col_indices.len());
    }

    CsrMatrix::try_from_csr_data(n, n, row_offsets, col_indices, values).map_err(|err| {
        AbyssError::Solver(format!("Failed to restrict stiffness matrix: {err}"))
    })
}

/// Rejects systems that cannot be positive definite before solving
fn check_system(a: &CsrMatrix<f64>, b: &DVector<f64>) -> AbyssResult<()> {
    if a.nrows() == 0 {
        return Err(AbyssError::Solver(
            "No free degrees of freedom to solve for".to_owned(),
        ));
    }
    if a.nrows() != a.ncols() || a.nrows() != b.len() {
        return Err(AbyssError::Solver(format!(
            "System shape mismatch: {}x{} matrix with {} right-hand side entries",
            a.nrows(),
            a.ncols(),
            b.len()
        )));
    }

    for (i, row) in a.row_iter().enumerate() {
        let diagonal = row
            .col_indices()
            .iter()
            .zip(row.values())
            .find(|(col, _)| **col == i)
            .map(|(_, value)| *value)
            .unwrap_or(0.0);
        if !(diagonal > 0.0) {
            return Err(AbyssError::Solver(format!(
                "Singular stiffness matrix: non-positive diagonal {diagonal} at free DOF {i}"
            )));
        }
    }

    Ok(())
}

fn check_solution(x: &DVector<f64>) -> AbyssResult<()> {
    if x.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(AbyssError::Solver(
            "Linear solve produced non-finite displacements".to_owned(),
        ))
    }
}

/// Sparse Cholesky solver backed by `faer`. The symbolic analysis is kept
/// while the sparsity pattern stays the same.
pub struct CholeskySolver {
    symbolic: Option<(usize, usize, SymbolicLlt<usize>)>,
}

impl CholeskySolver {
    pub fn new() -> CholeskySolver {
        CholeskySolver { symbolic: None }
    }

    /// Upper triangle of `a` as a faer CSC matrix
    fn to_faer_upper(a: &CsrMatrix<f64>) -> AbyssResult<(SparseColMat<usize, f64>, usize)> {
        let mut triplets: Vec<Triplet<usize, usize, f64>> =
            Vec::with_capacity(a.nnz() / 2 + a.nrows());
        for (row, entries) in a.row_iter().enumerate() {
            for (col, val) in entries.col_indices().iter().zip(entries.values()) {
                if *col >= row {
                    triplets.push(Triplet {
                        row,
                        col: *col,
                        val: *val,
                    });
                }
            }
        }

        let csc = SparseColMat::try_new_from_triplets(a.nrows(), a.ncols(), &triplets)
            .map_err(|e| AbyssError::Solver(format!("Failed to build sparse matrix: {e:?}")))?;
        Ok((csc, triplets.len()))
    }
}

impl Default for CholeskySolver {
    fn default() -> Self {
        Self::new()
    }
}

impl LinearSolver for CholeskySolver {
    fn name(&self) -> &'static str {
        "sparse Cholesky"
    }

    fn solve(&mut self, a: &CsrMatrix<f64>, b: &DVector<f64>) -> AbyssResult<DVector<f64>> {
        check_system(a, b)?;
        if b.iter().all(|v| *v == 0.0) {
            return Ok(DVector::zeros(b.len()));
        }

        let start = Instant::now();
        let (csc, upper_nnz) = Self::to_faer_upper(a)?;

        let reuse = matches!(
            &self.symbolic,
            Some((n, nnz, _)) if *n == a.nrows() && *nnz == upper_nnz
        );
        if !reuse {
            let symbolic = SymbolicLlt::try_new(csc.symbolic().as_ref(), Side::Upper)
                .map_err(|e| AbyssError::Solver(format!("Symbolic analysis failed: {e:?}")))?;
            self.symbolic = Some((a.nrows(), upper_nnz, symbolic));
        }
        let symbolic = match &self.symbolic {
            Some((_, _, symbolic)) => symbolic.clone(),
            None => {
                return Err(AbyssError::Solver(
                    "Symbolic analysis unavailable".to_owned(),
                ))
            }
        };

        let llt = Llt::try_new_with_symbolic(symbolic, csc.as_ref(), Side::Upper).map_err(|e| {
            AbyssError::Solver(format!(
                "Cholesky factorization failed, stiffness matrix is singular or indefinite: {e:?}"
            ))
        })?;

        let rhs: faer::Mat<f64> = faer::Mat::from_fn(b.len(), 1, |i, _| b[i]);
        let sol = llt.solve(&rhs);
        let x = DVector::from_fn(b.len(), |i, _| sol[(i, 0)]);

        debug!(
            dofs = a.nrows(),
            nnz = a.nnz(),
            reused_symbolic = reuse,
            elapsed = start.elapsed().as_secs_f64(),
            "cholesky solve"
        );

        check_solution(&x)?;
        Ok(x)
    }
}

/// Multiplication for the conjugate gradient solver. Applies the
/// Jacobi-scaled operator `D^-1/2 A D^-1/2`.
struct ScaledStiffnessOperator<'a> {
    a: &'a CsrMatrix<f64>,
    scale: &'a [f64],
}

impl<'a> Operator for ScaledStiffnessOperator<'a> {
    type Param = Vec<f64>;
    type Output = Vec<f64>;

    fn apply(&self, x: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
        let scaled: Vec<f64> = x.iter().zip(self.scale).map(|(v, s)| v * s).collect();
        let mut y = csr_mul_vec(self.a, &scaled);
        for (v, s) in y.iter_mut().zip(self.scale) {
            *v *= s;
        }
        Ok(y)
    }
}

/// Conjugate gradient solver via `argmin`, run on the diagonally scaled
/// system so the density contrast does not stall convergence.
pub struct ConjugateGradientSolver {
    relative_tolerance: f64,
    max_iterations: u64,
}

impl ConjugateGradientSolver {
    pub fn new(relative_tolerance: f64, max_iterations: u64) -> ConjugateGradientSolver {
        ConjugateGradientSolver {
            relative_tolerance,
            max_iterations,
        }
    }
}

impl LinearSolver for ConjugateGradientSolver {
    fn name(&self) -> &'static str {
        "conjugate gradient"
    }

    fn solve(&mut self, a: &CsrMatrix<f64>, b: &DVector<f64>) -> AbyssResult<DVector<f64>> {
        check_system(a, b)?;
        if b.iter().all(|v| *v == 0.0) {
            return Ok(DVector::zeros(b.len()));
        }

        let scale: Vec<f64> = a
            .row_iter()
            .enumerate()
            .map(|(i, row)| {
                let diagonal = row
                    .col_indices()
                    .iter()
                    .zip(row.values())
                    .find(|(col, _)| **col == i)
                    .map(|(_, value)| *value)
                    .unwrap_or(1.0);
                1.0 / diagonal.sqrt()
            })
            .collect();

        let b_scaled: Vec<f64> = b.iter().zip(&scale).map(|(v, s)| v * s).collect();
        let target_cost =
            self.relative_tolerance * b_scaled.iter().map(|v| v * v).sum::<f64>().sqrt();

        let start = Instant::now();
        let solver: ConjugateGradient<_, f64> = ConjugateGradient::new(b_scaled);
        let initial_guess: Vec<f64> = vec![0.0; b.len()];
        let operator = ScaledStiffnessOperator { a, scale: &scale };

        let res = Executor::new(operator, solver)
            .configure(|state| {
                state
                    .param(initial_guess)
                    .max_iters(self.max_iterations)
                    .target_cost(target_cost)
            })
            .run()
            .map_err(|err| AbyssError::Solver(format!("Conjugate Gradient error: {err}")))?;

        let state = res.state();
        if !(state.get_best_cost() <= target_cost) {
            return Err(AbyssError::Solver(format!(
                "Conjugate Gradient did not converge in {} iterations (residual {:e}, target {:e})",
                state.get_iter(),
                state.get_best_cost(),
                target_cost
            )));
        }

        let best_param = match &state.best_param {
            Some(vec) => vec,
            None => {
                return Err(AbyssError::Solver(
                    "Conjugate Gradient could not produce best parameter".to_owned(),
                ))
            }
        };

        let x = DVector::from_iterator(
            b.len(),
            best_param.iter().zip(&scale).map(|(v, s)| v * s),
        );

        debug!(
            dofs = a.nrows(),
            iterations = state.get_iter(),
            elapsed = start.elapsed().as_secs_f64(),
            "conjugate gradient solve"
        );

        check_solution(&x)?;
        Ok(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::element_stiffness_template;

    /// 1D Laplacian with a Dirichlet end, SPD
    fn laplacian(n: usize) -> CsrMatrix<f64> {
        let mut coo = CooMatrix::new(n, n);
        for i in 0..n {
            coo.push(i, i, 2.0);
            if i + 1 < n {
                coo.push(i, i + 1, -1.0);
                coo.push(i + 1, i, -1.0);
            }
        }
        CsrMatrix::from(&coo)
    }

    fn residual(a: &CsrMatrix<f64>, x: &DVector<f64>, b: &DVector<f64>) -> f64 {
        let ax = csr_mul_vec(a, x.as_slice());
        ax.iter()
            .zip(b.iter())
            .map(|(l, r)| (l - r).powi(2))
            .sum::<f64>()
            .sqrt()
    }

    #[test]
    fn assembled_matrix_is_symmetric_and_annihilates_translation() {
        let resolution = GridResolution::new(3, 2, 2);
        let ke = element_stiffness_template(0.3);
        let scale = vec![1.0; resolution.element_count()];
        let k = build_total_stiffness_matrix(&resolution, &ke, &scale);

        assert_eq!(k.nrows(), resolution.dof_count());
        for (i, j, v) in k.triplet_iter() {
            let row = k.row(j);
            let mirrored = row
                .col_indices()
                .iter()
                .position(|c| *c == i)
                .map(|p| row.values()[p])
                .unwrap();
            assert!((v - mirrored).abs() < 1e-12);
        }

        let mut translation = vec![0.0; resolution.dof_count()];
        for dof in (1..resolution.dof_count()).step_by(3) {
            translation[dof] = 1.0;
        }
        let force = csr_mul_vec(&k, &translation);
        assert!(force.iter().all(|f| f.abs() < 1e-10));
    }

    #[test]
    fn restriction_keeps_only_free_rows_and_columns() {
        let k = laplacian(5);
        let dofs = DofPartition::from_fixed(5, [0, 3]);
        let k_ff = restrict_to_free(&k, &dofs).unwrap();

        assert_eq!(k_ff.nrows(), 3);
        // free DOFs 1, 2, 4: only 1-2 stay coupled
        let dense: Vec<(usize, usize, f64)> = k_ff.triplet_iter().map(|(i, j, v)| (i, j, *v)).collect();
        assert!(dense.contains(&(0, 1, -1.0)));
        assert!(dense.contains(&(2, 2, 2.0)));
        assert!(!dense.iter().any(|(i, j, _)| (*i == 1 && *j == 2) || (*i == 2 && *j == 1)));
    }

    #[test]
    fn cholesky_solves_spd_system() {
        let a = laplacian(50);
        let b = DVector::from_fn(50, |i, _| (i as f64 * 0.3).sin());
        let mut solver = CholeskySolver::new();
        let x = solver.solve(&a, &b).unwrap();
        assert!(residual(&a, &x, &b) < 1e-9);

        // second solve reuses the symbolic analysis
        let x = solver.solve(&a, &(b.clone() * 2.0)).unwrap();
        assert!(residual(&a, &x, &(b * 2.0)) < 1e-9);
    }

    #[test]
    fn conjugate_gradient_solves_spd_system() {
        let a = laplacian(40);
        let b = DVector::from_fn(40, |i, _| 1.0 + i as f64 * 0.01);
        let mut solver = ConjugateGradientSolver::new(1e-10, 10_000);
        let x = solver.solve(&a, &b).unwrap();
        assert!(residual(&a, &x, &b) < 1e-6);
    }

    #[test]
    fn zero_right_hand_side_gives_zero_solution() {
        let a = laplacian(10);
        let b = DVector::zeros(10);
        let x = CholeskySolver::new().solve(&a, &b).unwrap();
        assert!(x.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn singular_matrix_is_rejected() {
        // a pure Neumann stiffness: rows sum to zero
        let mut coo = CooMatrix::new(3, 3);
        for (i, j, v) in [
            (0, 0, 1.0),
            (0, 1, -1.0),
            (1, 0, -1.0),
            (1, 1, 2.0),
            (1, 2, -1.0),
            (2, 1, -1.0),
            (2, 2, 1.0),
        ] {
            coo.push(i, j, v);
        }
        let a = CsrMatrix::from(&coo);
        let b = DVector::from_vec(vec![1.0, 0.0, 0.0]);
        let result = CholeskySolver::new().solve(&a, &b);
        assert!(matches!(result, Err(AbyssError::Solver(_))));
    }

    #[test]
    fn empty_system_is_rejected() {
        let a = CsrMatrix::<f64>::zeros(0, 0);
        let b = DVector::zeros(0);
        assert!(matches!(
            CholeskySolver::new().solve(&a, &b),
            Err(AbyssError::Solver(_))
        ));
    }

    #[test]
    fn zero_diagonal_is_rejected() {
        let mut coo = CooMatrix::new(2, 2);
        coo.push(0, 0, 1.0);
        coo.push(1, 0, 0.0);
        let a = CsrMatrix::from(&coo);
        let b = DVector::from_vec(vec![1.0, 1.0]);
        assert!(matches!(
            ConjugateGradientSolver::new(1e-8, 100).solve(&a, &b),
            Err(AbyssError::Solver(_))
        ));
    }
}
