use nalgebra_sparse::{CooMatrix, CsrMatrix};

use crate::{datatypes::GridResolution, error::AbyssError, error::AbyssResult, solver::csr_mul_vec};

/// Linear "cone" filter over element centres within `rmin` element pitches.
/// `weights[e1, e2] = rmin - dist(e1, e2)` for every pair closer than `rmin`;
/// `row_sums` normalizes each row.
#[derive(Debug, Clone)]
pub struct FilterMatrix {
    weights: CsrMatrix<f64>,
    row_sums: Vec<f64>,
}

impl FilterMatrix {
    /// Builds the filter for a grid
    ///
    /// # Arguments
    /// * `resolution` - The element grid
    /// * `rmin` - Filter radius in element-pitch units
    pub fn build(resolution: &GridResolution, rmin: f64) -> AbyssResult<FilterMatrix> {
        if !(rmin > 0.0) || !rmin.is_finite() {
            return Err(AbyssError::Input(format!(
                "Filter radius must be positive, got {rmin}"
            )));
        }

        let nele = resolution.element_count();
        // a window wider than the grid adds nothing
        let longest = resolution.nelx.max(resolution.nely).max(resolution.nelz);
        let reach = (rmin.ceil() as usize).saturating_sub(1).min(longest);
        let mut coo = CooMatrix::new(nele, nele);

        for ez in 0..resolution.nelz {
            for ex in 0..resolution.nelx {
                for ey in 0..resolution.nely {
                    let e1 = resolution.element_index(ex, ey, ez);

                    let z_range = ez.saturating_sub(reach)..(ez + reach + 1).min(resolution.nelz);
                    for kz in z_range {
                        let x_range =
                            ex.saturating_sub(reach)..(ex + reach + 1).min(resolution.nelx);
                        for kx in x_range {
                            let y_range =
                                ey.saturating_sub(reach)..(ey + reach + 1).min(resolution.nely);
                            for ky in y_range {
                                let dist = f64::sqrt(
                                    f64::powi(ex as f64 - kx as f64, 2)
                                        + f64::powi(ey as f64 - ky as f64, 2)
                                        + f64::powi(ez as f64 - kz as f64, 2),
                                );
                                let weight = rmin - dist;
                                if weight > 0.0 {
                                    let e2 = resolution.element_index(kx, ky, kz);
                                    coo.push(e1, e2, weight);
                                }
                            }
                        }
                    }
                }
            }
        }

        let weights = CsrMatrix::from(&coo);
        let row_sums = weights
            .row_iter()
            .map(|row| row.values().iter().sum())
            .collect();

        Ok(FilterMatrix { weights, row_sums })
    }

    pub fn nnz(&self) -> usize {
        self.weights.nnz()
    }

    /// Weighted average of a density field: `(H x) / Hs`
    pub fn apply_density(&self, x: &[f64]) -> Vec<f64> {
        let mut filtered = csr_mul_vec(&self.weights, x);
        for (value, sum) in filtered.iter_mut().zip(&self.row_sums) {
            *value /= sum;
        }
        filtered
    }

    /// Chain rule of the density filter for a sensitivity field: `H (d / Hs)`
    pub fn apply_sensitivity(&self, d: &[f64]) -> Vec<f64> {
        let scaled: Vec<f64> = d
            .iter()
            .zip(&self.row_sums)
            .map(|(value, sum)| value / sum)
            .collect();
        csr_mul_vec(&self.weights, &scaled)
    }
}
