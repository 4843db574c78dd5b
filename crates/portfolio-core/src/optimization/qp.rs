use nalgebra::{DMatrix, DVector};

/// Tolerance on constraint residuals at the solution.
pub(crate) const CONSTRAINT_TOL: f64 = 1e-8;
/// A step with infinity norm below this is treated as stationary.
const STEP_TOL: f64 = 1e-11;
/// Iteration cap for a single active-set solve.
pub(crate) const MAX_ITER: usize = 200;

/// Strictly convex quadratic program
///
///     min  1/2 x' Q x + c' x
///     s.t. a_e' x  = b_e   for every equality row
///          a_i' x <= b_i   for every inequality row
///
/// Box bounds are expressed as inequality rows (see `bound_rows`). Q must be
/// symmetric positive definite; callers add a ridge when Sigma is only PSD.
pub(crate) struct QpProblem {
    pub q: DMatrix<f64>,
    pub c: DVector<f64>,
    pub equalities: Vec<(DVector<f64>, f64)>,
    pub inequalities: Vec<(DVector<f64>, f64)>,
}

pub(crate) struct QpSolution {
    pub x: DVector<f64>,
    pub iterations: usize,
}

#[derive(Debug)]
pub(crate) enum QpError {
    /// The iteration cap was reached before the step and multipliers settled.
    MaxIterations,
    /// The KKT system became singular (degenerate active constraints).
    Singular,
}

/// Primal active-set method over the exact KKT system.
///
/// `x0` must satisfy the equalities and violate no inequality by more than
/// `CONSTRAINT_TOL`; every iterate stays feasible. Constraint selection is
/// index-ordered, so the solve is deterministic for identical inputs.
pub(crate) fn solve(problem: &QpProblem, x0: DVector<f64>) -> Result<QpSolution, QpError> {
    let mut x = x0;
    let mut active: Vec<usize> = Vec::new();

    for iteration in 0..MAX_ITER {
        let gradient = &problem.q * &x + &problem.c;
        let (step, multipliers) = solve_kkt(problem, &active, &gradient)?;

        if step.amax() <= STEP_TOL {
            // Stationary on the current working set: check the active
            // inequality multipliers for optimality.
            let mut worst: Option<(usize, f64)> = None;
            for (slot, &row) in active.iter().enumerate() {
                let lambda = multipliers[problem.equalities.len() + slot];
                if lambda < -CONSTRAINT_TOL {
                    match worst {
                        Some((_, best)) if lambda >= best => {}
                        _ => worst = Some((slot, lambda)),
                    }
                }
            }
            match worst {
                None => {
                    return Ok(QpSolution {
                        x,
                        iterations: iteration + 1,
                    })
                }
                Some((slot, _)) => {
                    active.remove(slot);
                }
            }
            continue;
        }

        // Ratio test: largest step along `step` that keeps every inactive
        // inequality satisfied.
        let mut alpha = 1.0_f64;
        let mut blocking: Option<usize> = None;
        for (row, (a, b)) in problem.inequalities.iter().enumerate() {
            if active.contains(&row) {
                continue;
            }
            let direction = a.dot(&step);
            if direction > 1e-12 {
                let slack = b - a.dot(&x);
                let limit = (slack / direction).max(0.0);
                if limit < alpha - 1e-15 {
                    alpha = limit;
                    blocking = Some(row);
                }
            }
        }

        x += step * alpha;
        if let Some(row) = blocking {
            active.push(row);
        }
    }

    Err(QpError::MaxIterations)
}

/// Solve the equality-constrained subproblem on the current working set:
///
///     min 1/2 p' Q p + g' p   s.t.  A p = 0
///
/// via the dense KKT system. Returns the step and the stacked multipliers
/// (equalities first, then active inequalities).
fn solve_kkt(
    problem: &QpProblem,
    active: &[usize],
    gradient: &DVector<f64>,
) -> Result<(DVector<f64>, DVector<f64>), QpError> {
    let n = problem.q.nrows();
    let k = problem.equalities.len() + active.len();
    let size = n + k;

    let mut kkt = DMatrix::zeros(size, size);
    kkt.view_mut((0, 0), (n, n)).copy_from(&problem.q);

    let rows: Vec<&DVector<f64>> = problem
        .equalities
        .iter()
        .map(|(a, _)| a)
        .chain(active.iter().map(|&row| &problem.inequalities[row].0))
        .collect();
    for (slot, a) in rows.iter().enumerate() {
        for i in 0..n {
            kkt[(n + slot, i)] = a[i];
            kkt[(i, n + slot)] = a[i];
        }
    }

    let mut rhs = DVector::zeros(size);
    for i in 0..n {
        rhs[i] = -gradient[i];
    }

    let solution = kkt.lu().solve(&rhs).ok_or(QpError::Singular)?;
    let step = DVector::from_fn(n, |i, _| solution[i]);
    let multipliers = DVector::from_fn(k, |i, _| solution[n + i]);
    Ok((step, multipliers))
}

/// Express box bounds lb <= x <= ub as inequality rows. Non-finite bounds
/// are skipped, which leaves that side unconstrained.
pub(crate) fn bound_rows(lb: &[f64], ub: &[f64]) -> Vec<(DVector<f64>, f64)> {
    let n = lb.len();
    let mut rows = Vec::with_capacity(2 * n);
    for i in 0..n {
        if lb[i].is_finite() {
            let mut a = DVector::zeros(n);
            a[i] = -1.0;
            rows.push((a, -lb[i]));
        }
        if ub[i].is_finite() {
            let mut a = DVector::zeros(n);
            a[i] = 1.0;
            rows.push((a, ub[i]));
        }
    }
    rows
}

/// Feasible point for { sum(x) = 1, lb <= x <= ub }: clip equal weights to
/// the box, then spread the residual across the remaining slack in one pass.
/// Returns None when the box is incompatible with full investment.
pub(crate) fn feasible_start_sum_one(lb: &[f64], ub: &[f64]) -> Option<Vec<f64>> {
    let n = lb.len();
    if n == 0 {
        return None;
    }
    let equal = 1.0 / n as f64;
    let mut x: Vec<f64> = (0..n).map(|i| equal.clamp(lb[i], ub[i])).collect();

    let total: f64 = x.iter().sum();
    let diff = 1.0 - total;
    if diff.abs() <= 1e-12 {
        return Some(x);
    }

    if diff > 0.0 {
        let slack: Vec<f64> = (0..n).map(|i| ub[i] - x[i]).collect();
        let total_slack: f64 = slack.iter().sum();
        if total_slack < diff - CONSTRAINT_TOL {
            return None;
        }
        for i in 0..n {
            x[i] += diff * slack[i] / total_slack;
        }
    } else {
        let slack: Vec<f64> = (0..n).map(|i| x[i] - lb[i]).collect();
        let total_slack: f64 = slack.iter().sum();
        if total_slack < -diff - CONSTRAINT_TOL {
            return None;
        }
        for i in 0..n {
            x[i] += diff * slack[i] / total_slack;
        }
    }
    Some(x)
}
