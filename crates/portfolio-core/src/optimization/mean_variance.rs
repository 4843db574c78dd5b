use std::time::Instant;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::PortfolioError;
use crate::estimation::AssumptionSet;
use crate::risk::{self, RiskDecomposition};
use crate::types::{with_metadata, ComputationOutput, OptimizationStatus, RunType};
use crate::PortfolioResult;

use super::constraints::{precheck, OptimizationConstraints, ResolvedBounds};
use super::qp::{self, QpError, QpProblem};

/// Weights with absolute value below this are zeroed during cleanup.
const CLEAN_TOL: f64 = 1e-6;
/// Tolerance on declared-constraint satisfaction after cleanup.
const POST_TOL: f64 = 1e-6;
/// Volatility below this makes ratio statistics undefined.
const VOL_TOL: f64 = 1e-12;
/// Outer iterations for re-linearizing the piecewise-linear caps.
const MAX_CAP_ROUNDS: usize = 15;
/// Golden-section iterations for the constrained tangency search.
const TANGENCY_SEARCH_ITER: usize = 64;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Input to a single optimization run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizeInput {
    pub assumptions: AssumptionSet,
    pub run_type: RunType,
    pub constraints: OptimizationConstraints,
    /// Reference weights for the turnover cap, aligned to the assumption
    /// set's asset keys. When absent the turnover cap is dropped with a
    /// warning; resolving a holdings snapshot is the caller's concern.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_weights: Option<Vec<f64>>,
    /// Required for FRONTIER_POINT runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_return: Option<f64>,
}

/// Input to an efficient-frontier series run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontierInput {
    pub assumptions: AssumptionSet,
    pub constraints: OptimizationConstraints,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_weights: Option<Vec<f64>>,
    /// Number of grid points; defaults to 20.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n_points: Option<usize>,
    /// Caller-supplied identifier stamped on every point of the series.
    pub series_key: String,
}

/// Output from a single optimization call.
///
/// When status is not SUCCESS all numeric fields are None and
/// `infeasibility_reason` carries a plain-language explanation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverResult {
    pub status: OptimizationStatus,
    pub run_type: RunType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weights: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp_return: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdev: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sharpe: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hhi: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effective_n: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_return: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub series_key: Option<String>,
    pub explanation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub infeasibility_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub solver_meta: Option<serde_json::Value>,
}

/// A solver result together with its per-asset risk decomposition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationOutcome {
    pub result: SolverResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_decomposition: Option<RiskDecomposition>,
}

// ---------------------------------------------------------------------------
// Run state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum RunState {
    New,
    Validating,
    Precheck,
    Solving,
    Cleaning,
    Decomposing,
    Done,
    Infeasible,
    Error,
}

impl RunState {
    fn is_terminal(self) -> bool {
        matches!(self, RunState::Done | RunState::Infeasible | RunState::Error)
    }
}

/// Records the path NEW -> VALIDATING -> PRECHECK -> SOLVING -> CLEANING ->
/// DECOMPOSING -> DONE, with INFEASIBLE/ERROR exits. Terminal states are
/// final: further transitions are ignored.
#[derive(Debug, Clone)]
struct RunTrace {
    path: Vec<RunState>,
}

impl RunTrace {
    fn new() -> Self {
        RunTrace {
            path: vec![RunState::New],
        }
    }

    fn advance(&mut self, state: RunState) {
        if !self.path.last().copied().is_some_and(RunState::is_terminal) {
            self.path.push(state);
        }
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.path).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Internal solve plumbing
// ---------------------------------------------------------------------------

enum SolveFailure {
    Infeasible(String),
    Numerical(String),
}

#[derive(Clone, Copy)]
enum SolveKind {
    MinVariance,
    FrontierPoint(f64),
    Tangency,
}

struct CapSet<'a> {
    leverage: Option<f64>,
    turnover: Option<(&'a [f64], f64)>,
}

struct SolveOutcome {
    weights: DVector<f64>,
    iterations: usize,
    method: &'static str,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Solve one MVP, FRONTIER_POINT, or TANGENCY run.
///
/// Domain infeasibility and solver failure are reported through the returned
/// record's status, never as Err; Err is reserved for input validation.
pub fn optimize(input: &OptimizeInput) -> PortfolioResult<ComputationOutput<OptimizationOutcome>> {
    let start = Instant::now();
    let mut warnings: Vec<String> = Vec::new();
    let mut trace = RunTrace::new();

    trace.advance(RunState::Validating);
    if input.run_type == RunType::FrontierSeries {
        return Err(PortfolioError::InvalidInput {
            field: "run_type".into(),
            reason: "Frontier series runs are produced by frontier(), not optimize()".into(),
        });
    }
    validate_run_inputs(input, &mut warnings)?;

    let assumptions = &input.assumptions;
    let bounds = input.constraints.resolve_bounds(&assumptions.asset_keys);
    warnings.extend(bounds.warnings.iter().cloned());
    bounds.validate(&assumptions.asset_keys)?;

    let caps = resolve_caps(
        &input.constraints,
        input.prev_weights.as_deref(),
        &mut warnings,
    );

    let (result, decomposition) = execute_run(
        assumptions,
        &input.constraints,
        &bounds,
        &caps,
        match input.run_type {
            RunType::Mvp => SolveKind::MinVariance,
            RunType::FrontierPoint => SolveKind::FrontierPoint(
                input.target_return.expect("validated above"),
            ),
            RunType::Tangency => SolveKind::Tangency,
            RunType::FrontierSeries => unreachable!("rejected above"),
        },
        input.run_type,
        input.target_return,
        &mut trace,
    );

    let elapsed = start.elapsed().as_micros() as u64;
    Ok(with_metadata(
        "Mean-Variance Portfolio Optimization",
        &serde_json::json!({
            "run_type": input.run_type,
            "n_assets": assumptions.n_assets(),
            "rf_annual": assumptions.rf_annual,
            "constraints": input.constraints.describe(),
            "target_return": input.target_return,
        }),
        warnings,
        elapsed,
        OptimizationOutcome {
            result,
            risk_decomposition: decomposition,
        },
    ))
}

/// Generate the efficient frontier as a series of frontier-point runs.
///
/// Targets are evenly spaced over [min mu, max mu]; infeasible points are
/// included with status INFEASIBLE so callers can identify the boundary.
pub fn frontier(input: &FrontierInput) -> PortfolioResult<ComputationOutput<Vec<SolverResult>>> {
    let start = Instant::now();
    let mut warnings: Vec<String> = Vec::new();

    let assumptions = &input.assumptions;
    validate_assumption_set(assumptions)?;
    input.constraints.validate()?;
    validate_prev_weights(input.prev_weights.as_deref(), assumptions.n_assets())?;

    let n_points = input.n_points.unwrap_or(20);
    if n_points == 0 {
        return Err(PortfolioError::InvalidInput {
            field: "n_points".into(),
            reason: "At least 1 frontier point required".into(),
        });
    }

    let bounds = input.constraints.resolve_bounds(&assumptions.asset_keys);
    warnings.extend(bounds.warnings.iter().cloned());
    bounds.validate(&assumptions.asset_keys)?;

    let caps = resolve_caps(
        &input.constraints,
        input.prev_weights.as_deref(),
        &mut warnings,
    );

    let min_mu = assumptions
        .mu_annual
        .iter()
        .copied()
        .fold(f64::INFINITY, f64::min);
    let max_mu = assumptions
        .mu_annual
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);

    // A degenerate grid (all assets share one expected return) collapses to
    // a single point.
    let targets: Vec<f64> = if max_mu - min_mu < 1e-12 || n_points == 1 {
        vec![min_mu]
    } else {
        let step = (max_mu - min_mu) / (n_points - 1) as f64;
        (0..n_points).map(|k| min_mu + step * k as f64).collect()
    };

    let mut results = Vec::with_capacity(targets.len());
    for target in targets {
        let mut trace = RunTrace::new();
        trace.advance(RunState::Validating);
        let (mut result, _) = execute_run(
            assumptions,
            &input.constraints,
            &bounds,
            &caps,
            SolveKind::FrontierPoint(target),
            RunType::FrontierSeries,
            Some(target),
            &mut trace,
        );
        result.series_key = Some(input.series_key.clone());
        results.push(result);
    }

    let elapsed = start.elapsed().as_micros() as u64;
    Ok(with_metadata(
        "Efficient Frontier Series",
        &serde_json::json!({
            "n_assets": assumptions.n_assets(),
            "n_points": results.len(),
            "series_key": input.series_key,
            "constraints": input.constraints.describe(),
        }),
        warnings,
        elapsed,
        results,
    ))
}

// ---------------------------------------------------------------------------
// Run execution
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
fn execute_run(
    assumptions: &AssumptionSet,
    constraints: &OptimizationConstraints,
    bounds: &ResolvedBounds,
    caps: &CapSet,
    kind: SolveKind,
    run_type: RunType,
    target: Option<f64>,
    trace: &mut RunTrace,
) -> (SolverResult, Option<RiskDecomposition>) {
    let mu = &assumptions.mu_annual;
    let rf = assumptions.rf_annual;
    let sigma = risk::to_dmatrix(&assumptions.sigma_annual);

    trace.advance(RunState::Precheck);
    let precheck_rf = matches!(kind, SolveKind::Tangency).then_some(rf);
    let precheck_target = match kind {
        SolveKind::FrontierPoint(t) => Some(t),
        _ => None,
    };
    if let Some(reason) = precheck(mu, precheck_rf, precheck_target, constraints.long_only, bounds)
    {
        trace.advance(RunState::Infeasible);
        return (
            infeasible_result(reason, run_type, target, trace),
            None,
        );
    }

    trace.advance(RunState::Solving);
    let solved = match kind {
        SolveKind::MinVariance => solve_variance(&sigma, mu, None, bounds, caps),
        SolveKind::FrontierPoint(t) => solve_variance(&sigma, mu, Some(t), bounds, caps),
        SolveKind::Tangency => solve_tangency(&sigma, mu, rf, bounds, caps),
    };
    let outcome = match solved {
        Ok(outcome) => outcome,
        Err(SolveFailure::Infeasible(reason)) => {
            trace.advance(RunState::Infeasible);
            return (
                infeasible_result(reason, run_type, target, trace),
                None,
            );
        }
        Err(SolveFailure::Numerical(message)) => {
            trace.advance(RunState::Error);
            return (error_result(message, run_type, target, trace), None);
        }
    };

    trace.advance(RunState::Cleaning);
    let weights = clean_weights(outcome.weights.as_slice(), constraints.long_only);
    if let Err(message) = verify_cleaned(&weights, bounds, caps) {
        trace.advance(RunState::Error);
        return (error_result(message, run_type, target, trace), None);
    }

    trace.advance(RunState::Decomposing);
    let decomposition = match risk::risk_decomposition(&weights, &assumptions.sigma_annual) {
        Ok(decomposition) => decomposition,
        Err(e) => {
            trace.advance(RunState::Error);
            return (error_result(e.to_string(), run_type, target, trace), None);
        }
    };

    trace.advance(RunState::Done);
    let result = build_success(
        weights,
        assumptions,
        constraints,
        run_type,
        target,
        outcome.iterations,
        outcome.method,
        trace,
    );
    (result, Some(decomposition))
}

// ---------------------------------------------------------------------------
// Variance minimization (MVP and frontier points)
// ---------------------------------------------------------------------------

fn solve_variance(
    sigma: &DMatrix<f64>,
    mu: &[f64],
    target: Option<f64>,
    bounds: &ResolvedBounds,
    caps: &CapSet,
) -> Result<SolveOutcome, SolveFailure> {
    let n = mu.len();
    let q = ridged(sigma);
    let c = DVector::zeros(n);
    solve_capped(&q, &c, mu, target, bounds, caps).map(|(weights, iterations)| SolveOutcome {
        weights,
        iterations,
        method: "active_set_qp",
    })
}

/// Solve min 1/2 w'Qw + c'w over the full constraint set, re-linearizing the
/// piecewise-linear caps between rounds. Full investment is always enforced;
/// `target` adds the w'mu = R* equality (with a phase-1 feasibility solve).
fn solve_capped(
    q: &DMatrix<f64>,
    c: &DVector<f64>,
    mu: &[f64],
    target: Option<f64>,
    bounds: &ResolvedBounds,
    caps: &CapSet,
) -> Result<(DVector<f64>, usize), SolveFailure> {
    let n = mu.len();
    let ones = DVector::from_element(n, 1.0);
    let mut cut_rows: Vec<(DVector<f64>, f64)> = Vec::new();
    let mut seen_patterns: Vec<Vec<i8>> = Vec::new();
    let mut total_iterations = 0usize;

    for _round in 0..MAX_CAP_ROUNDS {
        let mut inequalities = qp::bound_rows(&bounds.lower, &bounds.upper);
        inequalities.extend(cut_rows.iter().cloned());

        let start = build_start(bounds, caps, &inequalities)?;

        // Phase 1 for target-return runs: probe the achievable return range
        // under the current rows, then blend the two probe portfolios to
        // land exactly on the target hyperplane.
        let (start, equalities) = match target {
            None => (start, vec![(ones.clone(), 1.0)]),
            Some(r_star) => {
                let mu_vec = DVector::from_column_slice(mu);
                let (w_lo, it_lo) =
                    probe_return(&mu_vec, 1.0, &ones, &inequalities, start.clone())?;
                let (w_hi, it_hi) =
                    probe_return(&mu_vec, -1.0, &ones, &inequalities, start)?;
                total_iterations += it_lo + it_hi;

                let r_lo = mu_vec.dot(&w_lo);
                let r_hi = mu_vec.dot(&w_hi);
                if r_star < r_lo - 1e-9 || r_star > r_hi + 1e-9 {
                    let closest = if r_star < r_lo { r_lo } else { r_hi };
                    return Err(SolveFailure::Infeasible(format!(
                        "No feasible solution at target return {:.2}% given the active \
                         constraints; closest achievable return is {:.2}%.",
                        r_star * 100.0,
                        closest * 100.0
                    )));
                }

                let theta = if r_hi - r_lo > 1e-14 {
                    ((r_star - r_lo) / (r_hi - r_lo)).clamp(0.0, 1.0)
                } else {
                    0.0
                };
                let blended = &w_lo * (1.0 - theta) + &w_hi * theta;
                (blended, vec![(ones.clone(), 1.0), (mu_vec, r_star)])
            }
        };

        let problem = QpProblem {
            q: q.clone(),
            c: c.clone(),
            equalities,
            inequalities,
        };
        let sol = qp::solve(&problem, start).map_err(map_qp_error)?;
        total_iterations += sol.iterations;

        match violated_cap_cut(&sol.x, caps, &mut seen_patterns) {
            None => return Ok((sol.x, total_iterations)),
            Some(Ok(cut)) => cut_rows.push(cut),
            Some(Err(message)) => return Err(SolveFailure::Numerical(message)),
        }
    }

    Err(SolveFailure::Numerical(format!(
        "Leverage/turnover linearization did not stabilize after {MAX_CAP_ROUNDS} rounds"
    )))
}

/// Extremal achievable return under the current constraint rows, probed
/// with a vanishing quadratic term. `direction` +1 minimizes the return,
/// -1 maximizes it.
fn probe_return(
    mu: &DVector<f64>,
    direction: f64,
    ones: &DVector<f64>,
    inequalities: &[(DVector<f64>, f64)],
    start: DVector<f64>,
) -> Result<(DVector<f64>, usize), SolveFailure> {
    let n = mu.len();
    let mut q = DMatrix::zeros(n, n);
    for i in 0..n {
        q[(i, i)] = 1e-8;
    }
    let problem = QpProblem {
        q,
        c: mu * direction,
        equalities: vec![(ones.clone(), 1.0)],
        inequalities: inequalities.to_vec(),
    };
    let sol = qp::solve(&problem, start).map_err(map_qp_error)?;
    Ok((sol.x, sol.iterations))
}

/// Starting point satisfying full investment, the box, and every current
/// inequality row (cap cuts included).
fn build_start(
    bounds: &ResolvedBounds,
    caps: &CapSet,
    inequalities: &[(DVector<f64>, f64)],
) -> Result<DVector<f64>, SolveFailure> {
    let start = qp::feasible_start_sum_one(&bounds.lower, &bounds.upper).ok_or_else(|| {
        SolveFailure::Infeasible(
            "Asset bounds are incompatible with the full investment constraint.".into(),
        )
    })?;
    let mut start = DVector::from_vec(start);

    if let Some((prev, cap)) = caps.turnover {
        let prev_vec = DVector::from_column_slice(prev);
        let distance: f64 = (&start - &prev_vec).abs().sum();
        if distance > cap {
            let in_bounds = prev
                .iter()
                .enumerate()
                .all(|(i, p)| *p >= bounds.lower[i] - POST_TOL && *p <= bounds.upper[i] + POST_TOL);
            if !in_bounds {
                return Err(SolveFailure::Infeasible(format!(
                    "Turnover cap of {:.2}% is incompatible with the active bounds: \
                     the previous weights lie outside the bounds.",
                    cap * 100.0
                )));
            }
            let beta = (cap * (1.0 - 1e-9) / distance).min(1.0);
            start = &prev_vec + (start - &prev_vec) * beta;
        }
    }

    for (a, b) in inequalities {
        if a.dot(&start) > b + qp::CONSTRAINT_TOL {
            return Err(SolveFailure::Infeasible(
                "No feasible starting point found for the active constraint set.".into(),
            ));
        }
    }
    Ok(start)
}

/// Check the true (piecewise-linear) caps at the solution. Returns None when
/// satisfied, otherwise the next linearized cut, or an error message when the
/// same sign pattern keeps recurring.
fn violated_cap_cut(
    x: &DVector<f64>,
    caps: &CapSet,
    seen_patterns: &mut Vec<Vec<i8>>,
) -> Option<Result<(DVector<f64>, f64), String>> {
    let n = x.len();

    if let Some(cap) = caps.leverage {
        let gross: f64 = x.abs().sum();
        if gross > cap + qp::CONSTRAINT_TOL {
            let pattern: Vec<i8> = (0..n).map(|i| sign_of(x[i])).collect();
            let mut key = vec![0i8; 1];
            key.extend(&pattern);
            if seen_patterns.contains(&key) {
                return Some(Err(format!(
                    "Leverage cap of {cap:.4} could not be enforced (gross exposure {gross:.4})"
                )));
            }
            seen_patterns.push(key);
            let a = DVector::from_fn(n, |i, _| pattern[i] as f64);
            return Some(Ok((a, cap)));
        }
    }

    if let Some((prev, cap)) = caps.turnover {
        let turnover: f64 = (0..n).map(|i| (x[i] - prev[i]).abs()).sum();
        if turnover > cap + qp::CONSTRAINT_TOL {
            let pattern: Vec<i8> = (0..n).map(|i| sign_of(x[i] - prev[i])).collect();
            let mut key = vec![1i8; 1];
            key.extend(&pattern);
            if seen_patterns.contains(&key) {
                return Some(Err(format!(
                    "Turnover cap of {cap:.4} could not be enforced (turnover {turnover:.4})"
                )));
            }
            seen_patterns.push(key);
            let a = DVector::from_fn(n, |i, _| pattern[i] as f64);
            let offset: f64 = (0..n).map(|i| pattern[i] as f64 * prev[i]).sum();
            return Some(Ok((a, cap + offset)));
        }
    }

    None
}

fn sign_of(v: f64) -> i8 {
    if v > 0.0 {
        1
    } else if v < 0.0 {
        -1
    } else {
        0
    }
}

// ---------------------------------------------------------------------------
// Tangency
// ---------------------------------------------------------------------------

/// Maximize the Sharpe ratio.
///
/// Primary path is the convex reformulation min y'Sigma y s.t. (mu-rf)'y = 1
/// with y >= 0 under long-only, mapped back through w = y / sum(y). When the
/// mapped weights violate bundle constraints the reformulation cannot see
/// (upper bounds, caps), the run falls back to a golden-section search of
/// the Sharpe ratio over constrained frontier targets. Both paths are
/// deterministic and free of starting-point choices.
fn solve_tangency(
    sigma: &DMatrix<f64>,
    mu: &[f64],
    rf: f64,
    bounds: &ResolvedBounds,
    caps: &CapSet,
) -> Result<SolveOutcome, SolveFailure> {
    let n = mu.len();
    let long_only = bounds.lower.iter().all(|lb| *lb >= 0.0);

    let excess = DVector::from_fn(n, |i, _| mu[i] - rf);
    let q = ridged(sigma);

    let mut inequalities = Vec::new();
    if long_only {
        for i in 0..n {
            let mut a = DVector::zeros(n);
            a[i] = -1.0;
            inequalities.push((a, 0.0));
        }
    }

    // Start on the hyperplane: all mass on the best excess-return asset.
    let best = (0..n)
        .max_by(|a, b| excess[*a].partial_cmp(&excess[*b]).expect("finite mu"))
        .expect("non-empty mu");
    let mut y0 = DVector::zeros(n);
    y0[best] = 1.0 / excess[best];

    let problem = QpProblem {
        q,
        c: DVector::zeros(n),
        equalities: vec![(excess.clone(), 1.0)],
        inequalities,
    };

    if let Ok(sol) = qp::solve(&problem, y0) {
        let total = sol.x.sum();
        if total > 1e-10 {
            let weights = sol.x / total;
            if satisfies_bundle(&weights, bounds, caps) {
                return Ok(SolveOutcome {
                    weights,
                    iterations: sol.iterations,
                    method: "convex_reformulation",
                });
            }
        }
    }

    tangency_frontier_search(sigma, mu, rf, bounds, caps)
}

/// Golden-section search of the Sharpe ratio over the constrained frontier.
/// The Sharpe ratio is unimodal in the target return above the MVP, so the
/// search converges to the constrained tangency without restarts.
fn tangency_frontier_search(
    sigma: &DMatrix<f64>,
    mu: &[f64],
    rf: f64,
    bounds: &ResolvedBounds,
    caps: &CapSet,
) -> Result<SolveOutcome, SolveFailure> {
    let n = mu.len();
    let mut iterations = 0usize;

    // Lower end of the search interval: the MVP return.
    let (mvp, mvp_iter) = {
        let q = ridged(sigma);
        solve_capped(&q, &DVector::zeros(n), mu, None, bounds, caps)?
    };
    iterations += mvp_iter;
    let r_low = dot(mvp.as_slice(), mu);

    // Upper end: the maximum achievable return under the constraint set,
    // probed with a vanishing quadratic term.
    let (max_ret, max_iter) = {
        let mut q = DMatrix::zeros(n, n);
        for i in 0..n {
            q[(i, i)] = 1e-8;
        }
        let c = DVector::from_fn(n, |i, _| -mu[i]);
        solve_capped(&q, &c, mu, None, bounds, caps)?
    };
    iterations += max_iter;
    let r_high = dot(max_ret.as_slice(), mu);

    let mut evaluate = |target: f64| -> Option<(f64, DVector<f64>)> {
        let q = ridged(sigma);
        match solve_capped(&q, &DVector::zeros(n), mu, Some(target), bounds, caps) {
            Ok((w, iters)) => {
                iterations += iters;
                let sharpe = sharpe_of(w.as_slice(), mu, sigma, rf)?;
                Some((sharpe, w))
            }
            Err(_) => None,
        }
    };

    let mut best: Option<(f64, DVector<f64>)> = None;
    let consider = |candidate: Option<(f64, DVector<f64>)>, best: &mut Option<(f64, DVector<f64>)>| {
        if let Some((sharpe, w)) = candidate {
            if best.as_ref().map(|(s, _)| sharpe > *s).unwrap_or(true) {
                *best = Some((sharpe, w));
            }
        }
    };

    consider(evaluate(r_low), &mut best);
    consider(evaluate(r_high), &mut best);

    let phi = (5.0_f64.sqrt() - 1.0) / 2.0;
    let mut a = r_low;
    let mut b = r_high;
    let mut x1 = b - phi * (b - a);
    let mut x2 = a + phi * (b - a);
    let mut f1 = evaluate(x1);
    let mut f2 = evaluate(x2);

    for _ in 0..TANGENCY_SEARCH_ITER {
        if b - a < 1e-12 {
            break;
        }
        let s1 = f1.as_ref().map(|(s, _)| *s).unwrap_or(f64::NEG_INFINITY);
        let s2 = f2.as_ref().map(|(s, _)| *s).unwrap_or(f64::NEG_INFINITY);
        if s1 < s2 {
            a = x1;
            x1 = x2;
            f1 = f2;
            x2 = a + phi * (b - a);
            f2 = evaluate(x2);
        } else {
            b = x2;
            x2 = x1;
            f2 = f1;
            x1 = b - phi * (b - a);
            f1 = evaluate(x1);
        }
    }
    consider(f1, &mut best);
    consider(f2, &mut best);

    match best {
        Some((_, weights)) => Ok(SolveOutcome {
            weights,
            iterations,
            method: "frontier_search",
        }),
        None => Err(SolveFailure::Infeasible(
            "No feasible portfolio with positive volatility satisfies the active \
             constraint set; tangency search found no candidate."
                .into(),
        )),
    }
}

fn satisfies_bundle(weights: &DVector<f64>, bounds: &ResolvedBounds, caps: &CapSet) -> bool {
    let n = weights.len();
    for i in 0..n {
        if weights[i] < bounds.lower[i] - POST_TOL || weights[i] > bounds.upper[i] + POST_TOL {
            return false;
        }
    }
    if let Some(cap) = caps.leverage {
        if weights.abs().sum() > cap + POST_TOL {
            return false;
        }
    }
    if let Some((prev, cap)) = caps.turnover {
        let turnover: f64 = (0..n).map(|i| (weights[i] - prev[i]).abs()).sum();
        if turnover > cap + POST_TOL {
            return false;
        }
    }
    true
}

// ---------------------------------------------------------------------------
// Cleanup and result assembly
// ---------------------------------------------------------------------------

/// Remove sub-tolerance rounding noise and renormalize to sum = 1.
///
/// Long-only: negative rounding artefacts (e.g. -1e-16) are zeroed.
/// Short-allowed: only values strictly within +/-CLEAN_TOL are zeroed.
fn clean_weights(raw: &[f64], long_only: bool) -> Vec<f64> {
    let mut cleaned: Vec<f64> = raw
        .iter()
        .map(|w| {
            if long_only {
                if *w < CLEAN_TOL {
                    0.0
                } else {
                    *w
                }
            } else if w.abs() < CLEAN_TOL {
                0.0
            } else {
                *w
            }
        })
        .collect();

    let total: f64 = cleaned.iter().sum();
    if total.abs() > CLEAN_TOL {
        for w in &mut cleaned {
            *w /= total;
        }
    }
    cleaned
}

/// Declared constraints must survive cleanup within POST_TOL.
fn verify_cleaned(
    weights: &[f64],
    bounds: &ResolvedBounds,
    caps: &CapSet,
) -> Result<(), String> {
    let total: f64 = weights.iter().sum();
    if (total - 1.0).abs() > 1e-8 {
        return Err(format!(
            "Cleaned weights sum to {total:.10}, violating full investment"
        ));
    }
    for (i, w) in weights.iter().enumerate() {
        if *w < bounds.lower[i] - POST_TOL || *w > bounds.upper[i] + POST_TOL {
            return Err(format!(
                "Cleaned weight {w:.8} at column {i} violates bounds \
                 [{:.4}, {:.4}]",
                bounds.lower[i], bounds.upper[i]
            ));
        }
    }
    if let Some(cap) = caps.leverage {
        let gross: f64 = weights.iter().map(|w| w.abs()).sum();
        if gross > cap + POST_TOL {
            return Err(format!(
                "Cleaned gross exposure {gross:.6} violates leverage cap {cap:.4}"
            ));
        }
    }
    if let Some((prev, cap)) = caps.turnover {
        let turnover: f64 = weights
            .iter()
            .zip(prev.iter())
            .map(|(w, p)| (w - p).abs())
            .sum();
        if turnover > cap + POST_TOL {
            return Err(format!(
                "Cleaned turnover {turnover:.6} violates turnover cap {cap:.4}"
            ));
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn build_success(
    weights: Vec<f64>,
    assumptions: &AssumptionSet,
    constraints: &OptimizationConstraints,
    run_type: RunType,
    target: Option<f64>,
    iterations: usize,
    method: &'static str,
    trace: &RunTrace,
) -> SolverResult {
    let mu = &assumptions.mu_annual;
    let sigma = risk::to_dmatrix(&assumptions.sigma_annual);

    let exp_return = dot(&weights, mu);
    let w = DVector::from_column_slice(&weights);
    let variance = (w.transpose() * &sigma * &w)[(0, 0)].max(0.0);
    let stdev = variance.sqrt();
    let hhi = risk::hhi(&weights);
    let effective_n = risk::effective_n(&weights);
    let sharpe = (stdev > VOL_TOL).then(|| (exp_return - assumptions.rf_annual) / stdev);

    let explanation = generate_explanation(
        &weights,
        assumptions,
        constraints,
        exp_return,
        stdev,
        sharpe,
        hhi,
        effective_n,
    );

    SolverResult {
        status: OptimizationStatus::Success,
        run_type,
        weights: Some(weights),
        exp_return: Some(exp_return),
        variance: Some(variance),
        stdev: Some(stdev),
        sharpe,
        hhi: Some(hhi),
        effective_n: Some(effective_n),
        target_return: target,
        series_key: None,
        explanation,
        infeasibility_reason: None,
        solver_meta: Some(serde_json::json!({
            "method": method,
            "iterations": iterations,
            "state_path": trace.to_json(),
        })),
    }
}

fn infeasible_result(
    reason: String,
    run_type: RunType,
    target: Option<f64>,
    trace: &RunTrace,
) -> SolverResult {
    SolverResult {
        status: OptimizationStatus::Infeasible,
        run_type,
        weights: None,
        exp_return: None,
        variance: None,
        stdev: None,
        sharpe: None,
        hhi: None,
        effective_n: None,
        target_return: target,
        series_key: None,
        explanation: format!("Optimization infeasible: {reason}"),
        infeasibility_reason: Some(reason),
        solver_meta: Some(serde_json::json!({ "state_path": trace.to_json() })),
    }
}

fn error_result(
    message: String,
    run_type: RunType,
    target: Option<f64>,
    trace: &RunTrace,
) -> SolverResult {
    SolverResult {
        status: OptimizationStatus::Error,
        run_type,
        weights: None,
        exp_return: None,
        variance: None,
        stdev: None,
        sharpe: None,
        hhi: None,
        effective_n: None,
        target_return: target,
        series_key: None,
        explanation: format!("Optimization failed: {message}"),
        infeasibility_reason: Some(message),
        solver_meta: Some(serde_json::json!({ "state_path": trace.to_json() })),
    }
}

/// Plain-language explanation with concrete numbers: top holdings, portfolio
/// return and volatility, Sharpe, concentration vs the equal-weight
/// benchmark, and the active constraints.
#[allow(clippy::too_many_arguments)]
fn generate_explanation(
    weights: &[f64],
    assumptions: &AssumptionSet,
    constraints: &OptimizationConstraints,
    exp_return: f64,
    stdev: f64,
    sharpe: Option<f64>,
    hhi: f64,
    effective_n: f64,
) -> String {
    let n = weights.len();
    let mut parts: Vec<String> = Vec::new();

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|a, b| {
        weights[*b]
            .abs()
            .partial_cmp(&weights[*a].abs())
            .expect("finite weights")
            .then(a.cmp(b))
    });
    let labels: Vec<String> = order
        .iter()
        .take(5)
        .filter(|i| weights[**i].abs() > CLEAN_TOL)
        .map(|i| {
            format!(
                "{} {:.1}%",
                assumptions.asset_keys[*i],
                weights[*i] * 100.0
            )
        })
        .collect();
    if !labels.is_empty() {
        parts.push(format!("Top holdings: {}.", labels.join(", ")));
    }

    parts.push(format!(
        "Expected return {:.2}%, volatility {:.2}%.",
        exp_return * 100.0,
        stdev * 100.0
    ));
    if let Some(sharpe) = sharpe {
        parts.push(format!("Sharpe ratio {sharpe:.3}."));
    }
    parts.push(format!(
        "HHI {hhi:.4}, effective N {effective_n:.1} (equal-weight would give N = {n})."
    ));

    let described = constraints.describe();
    if !described.is_empty() {
        parts.push(format!("Constraints applied: {described}."));
    }

    parts.join(" ")
}

// ---------------------------------------------------------------------------
// Validation helpers
// ---------------------------------------------------------------------------

fn validate_run_inputs(input: &OptimizeInput, warnings: &mut Vec<String>) -> PortfolioResult<()> {
    validate_assumption_set(&input.assumptions)?;
    input.constraints.validate()?;
    validate_prev_weights(input.prev_weights.as_deref(), input.assumptions.n_assets())?;

    match input.run_type {
        RunType::FrontierPoint => match input.target_return {
            None => {
                return Err(PortfolioError::InvalidInput {
                    field: "target_return".into(),
                    reason: "FRONTIER_POINT runs require a target return".into(),
                })
            }
            Some(target) if !target.is_finite() => {
                return Err(PortfolioError::InvalidInput {
                    field: "target_return".into(),
                    reason: format!("Target return must be finite, got {target}"),
                })
            }
            Some(_) => {}
        },
        _ => {
            if input.target_return.is_some() {
                warnings.push(format!(
                    "target_return is ignored for {:?} runs",
                    input.run_type
                ));
            }
        }
    }
    Ok(())
}

fn validate_assumption_set(assumptions: &AssumptionSet) -> PortfolioResult<()> {
    let n = assumptions.n_assets();
    if n == 0 {
        return Err(PortfolioError::InvalidInput {
            field: "assumptions.asset_keys".into(),
            reason: "At least one asset required".into(),
        });
    }
    if assumptions.mu_annual.len() != n {
        return Err(PortfolioError::InvalidInput {
            field: "assumptions.mu_annual".into(),
            reason: format!(
                "Expected {} expected returns but got {}",
                n,
                assumptions.mu_annual.len()
            ),
        });
    }
    if assumptions.mu_annual.iter().any(|mu| !mu.is_finite()) {
        return Err(PortfolioError::InvalidInput {
            field: "assumptions.mu_annual".into(),
            reason: "Expected returns contain non-finite values".into(),
        });
    }
    if assumptions.sigma_annual.len() != n {
        return Err(PortfolioError::InvalidInput {
            field: "assumptions.sigma_annual".into(),
            reason: format!(
                "Expected {}x{} matrix but got {} rows",
                n,
                n,
                assumptions.sigma_annual.len()
            ),
        });
    }
    for (i, row) in assumptions.sigma_annual.iter().enumerate() {
        if row.len() != n {
            return Err(PortfolioError::InvalidInput {
                field: "assumptions.sigma_annual".into(),
                reason: format!("Row {} has {} columns, expected {}", i, row.len(), n),
            });
        }
        if row.iter().any(|v| !v.is_finite()) {
            return Err(PortfolioError::InvalidInput {
                field: "assumptions.sigma_annual".into(),
                reason: format!("Row {i} contains non-finite values"),
            });
        }
    }
    if !assumptions.rf_annual.is_finite() {
        return Err(PortfolioError::InvalidInput {
            field: "assumptions.rf_annual".into(),
            reason: format!("Risk-free rate must be finite, got {}", assumptions.rf_annual),
        });
    }
    Ok(())
}

fn validate_prev_weights(prev: Option<&[f64]>, n: usize) -> PortfolioResult<()> {
    let Some(prev) = prev else { return Ok(()) };
    if prev.len() != n {
        return Err(PortfolioError::InvalidInput {
            field: "prev_weights".into(),
            reason: format!("Expected {} weights but got {}", n, prev.len()),
        });
    }
    if prev.iter().any(|w| !w.is_finite()) {
        return Err(PortfolioError::InvalidInput {
            field: "prev_weights".into(),
            reason: "Previous weights contain non-finite values".into(),
        });
    }
    let total: f64 = prev.iter().sum();
    if (total - 1.0).abs() > 1e-6 {
        return Err(PortfolioError::InvalidInput {
            field: "prev_weights".into(),
            reason: format!("Previous weights sum to {total:.8}, expected 1"),
        });
    }
    Ok(())
}

fn resolve_caps<'a>(
    constraints: &OptimizationConstraints,
    prev_weights: Option<&'a [f64]>,
    warnings: &mut Vec<String>,
) -> CapSet<'a> {
    let turnover = match (constraints.turnover_cap, prev_weights) {
        (Some(cap), Some(prev)) => Some((prev, cap)),
        (Some(_), None) => {
            warnings.push(
                "Turnover cap is set but prev_weights were not supplied; \
                 turnover constraint dropped."
                    .into(),
            );
            None
        }
        (None, _) => None,
    };
    CapSet {
        leverage: constraints.leverage_cap,
        turnover,
    }
}

// ---------------------------------------------------------------------------
// Numeric helpers
// ---------------------------------------------------------------------------

/// Sigma plus a vanishing ridge, guaranteeing the strict convexity the
/// active-set KKT solves rely on even when Sigma is only PSD after repair.
fn ridged(sigma: &DMatrix<f64>) -> DMatrix<f64> {
    let n = sigma.nrows();
    let scale = (0..n).map(|i| sigma[(i, i)].abs()).fold(1.0_f64, f64::max);
    let mut q = sigma * 2.0;
    for i in 0..n {
        q[(i, i)] += 1e-12 * scale;
    }
    q
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn sharpe_of(weights: &[f64], mu: &[f64], sigma: &DMatrix<f64>, rf: f64) -> Option<f64> {
    let w = DVector::from_column_slice(weights);
    let variance = (w.transpose() * sigma * &w)[(0, 0)].max(0.0);
    let stdev = variance.sqrt();
    (stdev > VOL_TOL).then(|| (dot(weights, mu) - rf) / stdev)
}

fn map_qp_error(e: QpError) -> SolveFailure {
    match e {
        QpError::MaxIterations => SolveFailure::Numerical(format!(
            "Solver did not converge within {} iterations",
            qp::MAX_ITER
        )),
        QpError::Singular => {
            SolveFailure::Numerical("KKT system became singular during the solve".into())
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
