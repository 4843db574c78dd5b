use nalgebra::DMatrix;

/// Relative tolerance on the minimum eigenvalue: a matrix passes the PSD
/// check when lambda_min >= -PSD_EPS * max|lambda|.
const PSD_EPS: f64 = 1e-10;

pub(crate) struct PsdCheck {
    pub min_eigenvalue: f64,
    pub is_psd: bool,
}

/// Force exact symmetry: M <- (M + M') / 2.
pub(crate) fn symmetrize(matrix: &mut DMatrix<f64>) {
    let n = matrix.nrows();
    for i in 0..n {
        for j in (i + 1)..n {
            let avg = (matrix[(i, j)] + matrix[(j, i)]) / 2.0;
            matrix[(i, j)] = avg;
            matrix[(j, i)] = avg;
        }
    }
}

/// Eigenvalue-based positive semi-definiteness check on a symmetric matrix.
pub(crate) fn check_psd(matrix: &DMatrix<f64>) -> PsdCheck {
    let eigenvalues = matrix.clone().symmetric_eigen().eigenvalues;
    let min_ev = eigenvalues.iter().copied().fold(f64::INFINITY, f64::min);
    let scale = eigenvalues.iter().fold(0.0_f64, |acc, ev| acc.max(ev.abs()));
    PsdCheck {
        min_eigenvalue: min_ev,
        is_psd: min_ev >= -PSD_EPS * scale,
    }
}

/// Project onto the nearest positive semi-definite matrix in Frobenius norm
/// by clipping negative eigenvalues to zero (Higham, 1988). Symmetry is
/// enforced after reconstruction to remove floating-point asymmetry.
pub(crate) fn nearest_psd(matrix: &DMatrix<f64>) -> (DMatrix<f64>, String) {
    let eigen = matrix.clone().symmetric_eigen();
    let min_ev = eigen.eigenvalues.iter().copied().fold(f64::INFINITY, f64::min);
    let n_clipped = eigen.eigenvalues.iter().filter(|ev| **ev < 0.0).count();

    let clipped = eigen.eigenvalues.map(|ev| ev.max(0.0));
    let mut repaired =
        &eigen.eigenvectors * DMatrix::from_diagonal(&clipped) * eigen.eigenvectors.transpose();
    symmetrize(&mut repaired);

    let note = format!(
        "Clipped {n_clipped} negative eigenvalue(s) to zero (minimum was {min_ev:.6e}). \
         Matrix projected to the nearest positive semi-definite matrix."
    );
    (repaired, note)
}

/// Correlation matrix rho_ij = Sigma_ij / (sigma_i * sigma_j), with the
/// diagonal forced to exactly 1 and off-diagonals clipped to [-1, 1].
pub(crate) fn correlation_from(covariance: &DMatrix<f64>, vols: &[f64]) -> Vec<Vec<f64>> {
    let n = vols.len();
    let mut rho = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..n {
            rho[i][j] = if i == j {
                1.0
            } else {
                (covariance[(i, j)] / (vols[i] * vols[j])).clamp(-1.0, 1.0)
            };
        }
    }
    rho
}
