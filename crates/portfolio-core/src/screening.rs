use std::collections::BTreeMap;
use std::time::Instant;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::PortfolioError;
use crate::estimation::AssumptionSet;
use crate::risk;
use crate::types::{with_metadata, AssetClass, ComputationOutput};
use crate::PortfolioResult;

/// Aggregate class weight at or above this share counts as represented.
const DEFAULT_SECTOR_GAP_THRESHOLD: f64 = 0.02;
/// Number of top-ranked candidates that receive an explanation.
const DEFAULT_TOP_K: usize = 10;
/// Signal ranges narrower than this are degenerate.
const DEGENERATE_SPAN: f64 = 1e-10;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Classification metadata per asset key, supplied by the caller.
/// Sector is None for non-equity assets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetMetadata {
    pub asset_class: AssetClass,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sector: Option<String>,
}

/// Composite signal weights lambda_1..lambda_4; must be non-negative and
/// sum to 1.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SignalWeights {
    pub correlation: f64,
    pub marginal_vol: f64,
    pub sector_gap: f64,
    pub hhi: f64,
}

impl Default for SignalWeights {
    fn default() -> Self {
        SignalWeights {
            correlation: 0.40,
            marginal_vol: 0.30,
            sector_gap: 0.15,
            hhi: 0.15,
        }
    }
}

impl SignalWeights {
    fn validate(&self) -> PortfolioResult<()> {
        let weights = [self.correlation, self.marginal_vol, self.sector_gap, self.hhi];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(PortfolioError::InvalidInput {
                field: "signal_weights".into(),
                reason: "Signal weights must be non-negative and finite".into(),
            });
        }
        let total: f64 = weights.iter().sum();
        if (total - 1.0).abs() > 1e-8 {
            return Err(PortfolioError::InvalidInput {
                field: "signal_weights".into(),
                reason: format!("Signal weights sum to {total:.8}, expected 1"),
            });
        }
        Ok(())
    }
}

/// Input to a screening run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreeningInput {
    pub assumptions: AssumptionSet,
    /// Reference portfolio weights keyed by asset key; must sum to 1.
    /// Seed-universe references are resolved to equal weights by the caller.
    pub reference_weights: BTreeMap<String, f64>,
    pub candidate_keys: Vec<String>,
    /// Class/sector metadata for every reference and candidate asset.
    pub metadata: BTreeMap<String, AssetMetadata>,
    /// Nominal pro-forma add weight delta in (0, 1).
    pub nominal_add_weight: f64,
    pub signal_weights: SignalWeights,
    /// Class-representation threshold theta; defaults to 0.02.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sector_gap_threshold: Option<f64>,
    /// How many top-ranked candidates receive explanations; defaults to 10.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,
}

/// Scored candidate row: raw signals, normalized signals, composite, rank.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreeningScoreRow {
    pub asset_key: String,
    pub avg_correlation: f64,
    pub marginal_vol_reduction: f64,
    pub sector_gap_score: f64,
    pub hhi_reduction: f64,
    pub norm_avg_correlation: f64,
    pub norm_marginal_vol_reduction: f64,
    pub norm_hhi_reduction: f64,
    pub composite_score: f64,
    /// 1 = best; ranks are a dense permutation over the candidate set.
    pub rank: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

/// Reference-portfolio quantities derived once and shared by all signals.
struct ReferenceContext {
    weights_dense: Vec<f64>,
    indices: Vec<usize>,
    sigma_r: f64,
    hhi_r: f64,
    n_eff_r: f64,
}

/// Un-normalized signal values for a single candidate.
struct CandidateRaw {
    asset_key: String,
    avg_correlation: f64,
    marginal_vol_reduction: f64,
    sector_gap_score: f64,
    hhi_reduction: f64,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Score and rank every candidate against the reference portfolio.
///
/// Deterministic: identical inputs yield byte-identical outputs. Ties on the
/// composite score break by candidate key ascending.
pub fn screen(input: &ScreeningInput) -> PortfolioResult<ComputationOutput<Vec<ScreeningScoreRow>>> {
    let start = Instant::now();
    let mut warnings: Vec<String> = Vec::new();

    validate_input(input)?;
    let assumptions = &input.assumptions;
    let delta = input.nominal_add_weight;
    let threshold = input
        .sector_gap_threshold
        .unwrap_or(DEFAULT_SECTOR_GAP_THRESHOLD);
    let top_k = input.top_k.unwrap_or(DEFAULT_TOP_K);

    let ctx = build_reference_context(input)?;
    let sigma = risk::to_dmatrix(&assumptions.sigma_annual);

    // --- Raw signals per candidate ---
    let mut raw: Vec<CandidateRaw> = Vec::with_capacity(input.candidate_keys.len());
    for key in &input.candidate_keys {
        let idx = assumptions
            .asset_index(key)
            .expect("candidate keys validated against the assumption set");
        raw.push(CandidateRaw {
            asset_key: key.clone(),
            avg_correlation: avg_correlation(idx, &ctx.indices, &assumptions.correlation),
            marginal_vol_reduction: marginal_vol_reduction(
                idx,
                &ctx.weights_dense,
                &sigma,
                ctx.sigma_r,
                delta,
            ),
            sector_gap_score: sector_gap_score(key, input, threshold),
            hhi_reduction: hhi_reduction(idx, &ctx.weights_dense, ctx.hhi_r, delta),
        });
    }

    if raw.is_empty() {
        let elapsed = start.elapsed().as_micros() as u64;
        return Ok(with_metadata(
            "Diversification Candidate Screening",
            &serde_json::json!({ "n_candidates": 0 }),
            warnings,
            elapsed,
            Vec::new(),
        ));
    }

    // --- Normalization, once per screening run ---
    let norm_corr = normalize(
        &raw.iter().map(|r| r.avg_correlation).collect::<Vec<_>>(),
        true,
        "avg_correlation",
        &mut warnings,
    );
    let norm_mvr = normalize(
        &raw
            .iter()
            .map(|r| r.marginal_vol_reduction)
            .collect::<Vec<_>>(),
        false,
        "marginal_vol_reduction",
        &mut warnings,
    );
    let norm_hhi = normalize(
        &raw.iter().map(|r| r.hhi_reduction).collect::<Vec<_>>(),
        false,
        "hhi_reduction",
        &mut warnings,
    );

    // --- Composite, rank, explain ---
    let lambda = &input.signal_weights;
    let mut rows: Vec<ScreeningScoreRow> = raw
        .into_iter()
        .enumerate()
        .map(|(i, r)| {
            let composite = lambda.correlation * norm_corr[i]
                + lambda.marginal_vol * norm_mvr[i]
                + lambda.sector_gap * r.sector_gap_score
                + lambda.hhi * norm_hhi[i];
            ScreeningScoreRow {
                asset_key: r.asset_key,
                avg_correlation: r.avg_correlation,
                marginal_vol_reduction: r.marginal_vol_reduction,
                sector_gap_score: r.sector_gap_score,
                hhi_reduction: r.hhi_reduction,
                norm_avg_correlation: norm_corr[i],
                norm_marginal_vol_reduction: norm_mvr[i],
                norm_hhi_reduction: norm_hhi[i],
                composite_score: composite,
                rank: 0,
                explanation: None,
            }
        })
        .collect();

    rows.sort_by(|a, b| {
        b.composite_score
            .partial_cmp(&a.composite_score)
            .expect("finite composite scores")
            .then_with(|| a.asset_key.cmp(&b.asset_key))
    });
    for (position, row) in rows.iter_mut().enumerate() {
        row.rank = (position + 1) as u32;
        if position < top_k {
            row.explanation = Some(explain(row, &ctx, delta));
        }
    }

    let elapsed = start.elapsed().as_micros() as u64;
    Ok(with_metadata(
        "Diversification Candidate Screening",
        &serde_json::json!({
            "n_candidates": rows.len(),
            "n_reference_assets": ctx.indices.len(),
            "nominal_add_weight": delta,
            "sector_gap_threshold": threshold,
            "signal_weights": input.signal_weights,
        }),
        warnings,
        elapsed,
        rows,
    ))
}

// ---------------------------------------------------------------------------
// Signal calculators
// ---------------------------------------------------------------------------

/// Average pairwise correlation of the candidate against all reference
/// assets. Lower is better.
fn avg_correlation(candidate: usize, reference: &[usize], correlation: &[Vec<f64>]) -> f64 {
    let sum: f64 = reference.iter().map(|r| correlation[candidate][*r]).sum();
    sum / reference.len() as f64
}

/// Volatility change from adding the candidate at nominal weight delta:
/// sigma_R minus the pro-forma volatility. Positive means the candidate
/// reduces portfolio volatility.
fn marginal_vol_reduction(
    candidate: usize,
    reference_weights: &[f64],
    sigma: &DMatrix<f64>,
    sigma_r: f64,
    delta: f64,
) -> f64 {
    let pro = pro_forma_weights(candidate, reference_weights, delta);
    let w = DVector::from_vec(pro);
    let variance = (w.transpose() * sigma * &w)[(0, 0)].max(0.0);
    sigma_r - variance.sqrt()
}

/// Sector / asset-class gap score in {1, 0.5, 0}.
///
/// 1 when the candidate's class is absent from the reference at or above the
/// threshold; 0.5 when the class is present but the GICS sector is not;
/// 0 otherwise. Non-equity candidates carry no sector and cannot score 0.5.
fn sector_gap_score(candidate_key: &str, input: &ScreeningInput, threshold: f64) -> f64 {
    let candidate_meta = &input.metadata[candidate_key];

    let mut class_weights: BTreeMap<AssetClass, f64> = BTreeMap::new();
    for (key, weight) in &input.reference_weights {
        let class = input.metadata[key].asset_class;
        *class_weights.entry(class).or_insert(0.0) += weight;
    }

    let represented = class_weights
        .get(&candidate_meta.asset_class)
        .map(|w| *w >= threshold)
        .unwrap_or(false);
    if !represented {
        return 1.0;
    }

    if let Some(sector) = &candidate_meta.sector {
        let sector_present = input
            .reference_weights
            .keys()
            .filter_map(|key| input.metadata[key].sector.as_ref())
            .any(|s| s == sector);
        if !sector_present {
            return 0.5;
        }
    }
    0.0
}

/// HHI concentration reduction from adding the candidate at weight delta.
/// Positive means the candidate lowers concentration.
fn hhi_reduction(candidate: usize, reference_weights: &[f64], hhi_r: f64, delta: f64) -> f64 {
    let pro = pro_forma_weights(candidate, reference_weights, delta);
    hhi_r - risk::hhi(&pro)
}

fn pro_forma_weights(candidate: usize, reference_weights: &[f64], delta: f64) -> Vec<f64> {
    let mut pro: Vec<f64> = reference_weights.iter().map(|w| w * (1.0 - delta)).collect();
    pro[candidate] += delta;
    pro
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Min-max normalize raw signal values to [0, 1], inverted when lower raw
/// values are better. A degenerate range (max = min) assigns the neutral
/// score 0.5 to every candidate and records the event.
fn normalize(values: &[f64], invert: bool, signal: &str, warnings: &mut Vec<String>) -> Vec<f64> {
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let span = max - min;

    if span.abs() < DEGENERATE_SPAN {
        warnings.push(format!(
            "Signal {signal} is degenerate across the candidate set \
             (all values equal {min:.6}); neutral score 0.5 assigned."
        ));
        return vec![0.5; values.len()];
    }

    values
        .iter()
        .map(|v| {
            if invert {
                (max - v) / span
            } else {
                (v - min) / span
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Explanations
// ---------------------------------------------------------------------------

fn explain(row: &ScreeningScoreRow, ctx: &ReferenceContext, delta: f64) -> String {
    let sigma_pro = ctx.sigma_r - row.marginal_vol_reduction;
    let hhi_pro = ctx.hhi_r - row.hhi_reduction;
    let n_eff_pro = if hhi_pro > 0.0 {
        1.0 / hhi_pro
    } else {
        f64::INFINITY
    };
    let direction = if row.marginal_vol_reduction >= 0.0 {
        "reduce"
    } else {
        "increase"
    };

    format!(
        "Rank {}, composite score {:.3}. \
         Average pairwise correlation with the reference portfolio: {:.3}. \
         Adding at a {:.1}% nominal weight would {} portfolio volatility \
         from {:.2}% to {:.2}% annualised. {} \
         HHI changes from {:.4} to {:.4} (effective N: {:.1} → {:.1}).",
        row.rank,
        row.composite_score,
        row.avg_correlation,
        delta * 100.0,
        direction,
        ctx.sigma_r * 100.0,
        sigma_pro * 100.0,
        gap_clause(row.sector_gap_score),
        ctx.hhi_r,
        hhi_pro,
        ctx.n_eff_r,
        n_eff_pro,
    )
}

fn gap_clause(gap_score: f64) -> &'static str {
    if gap_score == 1.0 {
        "Asset class is not currently represented in the reference portfolio \
         (gap score: 1.00)."
    } else if gap_score == 0.5 {
        "Asset class is represented but this GICS sector is absent from the \
         reference portfolio (gap score: 0.50)."
    } else {
        "Asset class and GICS sector are already represented in the reference \
         portfolio (gap score: 0.00)."
    }
}

// ---------------------------------------------------------------------------
// Reference context and validation
// ---------------------------------------------------------------------------

fn build_reference_context(input: &ScreeningInput) -> PortfolioResult<ReferenceContext> {
    let assumptions = &input.assumptions;
    let n = assumptions.n_assets();

    let mut weights_dense = vec![0.0; n];
    let mut indices = Vec::with_capacity(input.reference_weights.len());
    for (key, weight) in &input.reference_weights {
        let idx = assumptions
            .asset_index(key)
            .expect("reference keys validated against the assumption set");
        weights_dense[idx] = *weight;
        indices.push(idx);
    }

    let sigma_r = risk::portfolio_volatility(&weights_dense, &assumptions.sigma_annual)?;
    let hhi_r = risk::hhi(&weights_dense);
    let n_eff_r = risk::effective_n(&weights_dense);

    Ok(ReferenceContext {
        weights_dense,
        indices,
        sigma_r,
        hhi_r,
        n_eff_r,
    })
}

fn validate_input(input: &ScreeningInput) -> PortfolioResult<()> {
    input.signal_weights.validate()?;

    let delta = input.nominal_add_weight;
    if !(delta.is_finite() && delta > 0.0 && delta < 1.0) {
        return Err(PortfolioError::InvalidInput {
            field: "nominal_add_weight".into(),
            reason: format!("Nominal add weight must be in (0, 1), got {delta}"),
        });
    }
    if let Some(threshold) = input.sector_gap_threshold {
        if !(threshold.is_finite() && threshold > 0.0 && threshold < 1.0) {
            return Err(PortfolioError::InvalidInput {
                field: "sector_gap_threshold".into(),
                reason: format!("Sector gap threshold must be in (0, 1), got {threshold}"),
            });
        }
    }

    if input.reference_weights.is_empty() {
        return Err(PortfolioError::InvalidInput {
            field: "reference_weights".into(),
            reason: "Reference portfolio cannot be empty".into(),
        });
    }
    let mut total = 0.0;
    for (key, weight) in &input.reference_weights {
        if !(weight.is_finite() && *weight >= 0.0) {
            return Err(PortfolioError::InvalidInput {
                field: "reference_weights".into(),
                reason: format!("Weight for {key} must be finite and non-negative, got {weight}"),
            });
        }
        if input.assumptions.asset_index(key).is_none() {
            return Err(PortfolioError::InvalidInput {
                field: "reference_weights".into(),
                reason: format!("Reference asset {key} is not covered by the assumption set"),
            });
        }
        if !input.metadata.contains_key(key) {
            return Err(PortfolioError::InvalidInput {
                field: "metadata".into(),
                reason: format!("Missing metadata for reference asset {key}"),
            });
        }
        total += weight;
    }
    if (total - 1.0).abs() > 1e-6 {
        return Err(PortfolioError::InvalidInput {
            field: "reference_weights".into(),
            reason: format!("Reference weights sum to {total:.8}, expected 1"),
        });
    }

    for key in &input.candidate_keys {
        if input.assumptions.asset_index(key).is_none() {
            return Err(PortfolioError::InvalidInput {
                field: "candidate_keys".into(),
                reason: format!("Candidate {key} is not covered by the assumption set"),
            });
        }
        if !input.metadata.contains_key(key) {
            return Err(PortfolioError::InvalidInput {
                field: "metadata".into(),
                reason: format!("Missing metadata for candidate {key}"),
            });
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CovMethod, MuEstimator};

    /// Four-asset universe: A and B form the reference, C is highly
    /// correlated with both, D is uncorrelated with everything.
    fn four_asset_assumptions() -> AssumptionSet {
        let keys = vec!["A".into(), "B".into(), "C".into(), "D".into()];
        let vol = [0.20, 0.18, 0.22, 0.15];
        let corr = [
            [1.0, 0.5, 0.9, 0.0],
            [0.5, 1.0, 0.85, 0.0],
            [0.9, 0.85, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ];
        let sigma: Vec<Vec<f64>> = (0..4)
            .map(|i| (0..4).map(|j| corr[i][j] * vol[i] * vol[j]).collect())
            .collect();
        AssumptionSet {
            asset_keys: keys,
            mu_annual: vec![0.08, 0.07, 0.09, 0.05],
            sigma_annual: sigma,
            vol_annual: vol.to_vec(),
            correlation: corr.iter().map(|row| row.to_vec()).collect(),
            annualization_factor: 252.0,
            rf_annual: 0.02,
            estimator: MuEstimator::Historical,
            cov_method: CovMethod::Sample,
            psd_repair_applied: false,
            psd_repair_note: None,
        }
    }

    fn equity(sector: &str) -> AssetMetadata {
        AssetMetadata {
            asset_class: AssetClass::Equity,
            sector: Some(sector.into()),
        }
    }

    fn base_input() -> ScreeningInput {
        let mut reference_weights = BTreeMap::new();
        reference_weights.insert("A".to_string(), 0.5);
        reference_weights.insert("B".to_string(), 0.5);

        let mut metadata = BTreeMap::new();
        metadata.insert("A".to_string(), equity("Information Technology"));
        metadata.insert("B".to_string(), equity("Financials"));
        metadata.insert("C".to_string(), equity("Information Technology"));
        metadata.insert("D".to_string(), equity("Health Care"));

        ScreeningInput {
            assumptions: four_asset_assumptions(),
            reference_weights,
            candidate_keys: vec!["C".into(), "D".into()],
            metadata,
            nominal_add_weight: 0.05,
            signal_weights: SignalWeights::default(),
            sector_gap_threshold: None,
            top_k: None,
        }
    }

    // ------------------------------------------------------------------
    // 1. Uncorrelated candidate ranks first with extreme normalization
    // ------------------------------------------------------------------
    #[test]
    fn test_uncorrelated_candidate_ranks_first() {
        let out = screen(&base_input()).unwrap();
        let rows = &out.result;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].asset_key, "D");
        assert_eq!(rows[0].rank, 1);
        assert_eq!(rows[1].asset_key, "C");
        assert_eq!(rows[1].rank, 2);

        assert!((rows[0].norm_avg_correlation - 1.0).abs() < 1e-12);
        assert!(rows[1].norm_avg_correlation.abs() < 1e-12);
    }

    // ------------------------------------------------------------------
    // 2. Determinism: identical inputs, identical outputs
    // ------------------------------------------------------------------
    #[test]
    fn test_deterministic() {
        let first = screen(&base_input()).unwrap();
        let second = screen(&base_input()).unwrap();
        let a = serde_json::to_string(&first.result).unwrap();
        let b = serde_json::to_string(&second.result).unwrap();
        assert_eq!(a, b);
    }

    // ------------------------------------------------------------------
    // 3. Normalized extremes: exactly 0 and exactly 1 over the set
    // ------------------------------------------------------------------
    #[test]
    fn test_normalization_extremes() {
        let out = screen(&base_input()).unwrap();
        let mvr: Vec<f64> = out
            .result
            .iter()
            .map(|r| r.norm_marginal_vol_reduction)
            .collect();
        let min = mvr.iter().copied().fold(f64::INFINITY, f64::min);
        let max = mvr.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        assert_eq!(min, 0.0);
        assert_eq!(max, 1.0);
    }

    // ------------------------------------------------------------------
    // 4. Degenerate signal range: neutral 0.5 plus a warning
    // ------------------------------------------------------------------
    #[test]
    fn test_degenerate_signal_neutral() {
        let mut input = base_input();
        // Both candidates are the same asset twice, so every signal range
        // collapses.
        input.candidate_keys = vec!["C".into(), "C".into()];
        let out = screen(&input).unwrap();
        for row in &out.result {
            assert_eq!(row.norm_avg_correlation, 0.5);
            assert_eq!(row.norm_marginal_vol_reduction, 0.5);
            assert_eq!(row.norm_hhi_reduction, 0.5);
        }
        assert!(
            out.warnings.iter().any(|w| w.contains("degenerate")),
            "warnings: {:?}",
            out.warnings
        );
    }

    // ------------------------------------------------------------------
    // 5. Sector gap scoring across the three branches
    // ------------------------------------------------------------------
    #[test]
    fn test_sector_gap_branches() {
        let mut input = base_input();
        input.metadata.insert(
            "D".to_string(),
            AssetMetadata {
                asset_class: AssetClass::Commodity,
                sector: None,
            },
        );
        let out = screen(&input).unwrap();
        let d = out.result.iter().find(|r| r.asset_key == "D").unwrap();
        // Commodity class absent from the all-equity reference.
        assert_eq!(d.sector_gap_score, 1.0);

        let input2 = base_input();
        let out2 = screen(&input2).unwrap();
        let d2 = out2.result.iter().find(|r| r.asset_key == "D").unwrap();
        // Equity present, Health Care sector absent.
        assert_eq!(d2.sector_gap_score, 0.5);
        let c2 = out2.result.iter().find(|r| r.asset_key == "C").unwrap();
        // Equity and Information Technology both present.
        assert_eq!(c2.sector_gap_score, 0.0);
    }

    // ------------------------------------------------------------------
    // 6. Explanations on top-K rows only, quoting concrete numbers
    // ------------------------------------------------------------------
    #[test]
    fn test_explanations_top_k() {
        let mut input = base_input();
        input.top_k = Some(1);
        let out = screen(&input).unwrap();
        let rows = &out.result;
        let top = rows.iter().find(|r| r.rank == 1).unwrap();
        let explanation = top.explanation.as_ref().unwrap();
        assert!(explanation.contains("Rank 1"));
        assert!(explanation.contains("correlation"));
        assert!(explanation.contains("effective N"));
        assert!(rows.iter().find(|r| r.rank == 2).unwrap().explanation.is_none());
    }

    // ------------------------------------------------------------------
    // 7. Tie-break by candidate key ascending
    // ------------------------------------------------------------------
    #[test]
    fn test_tie_break_on_key() {
        let mut input = base_input();
        input.candidate_keys = vec!["D".into(), "D".into()];
        // Duplicate candidates produce identical composites; ordering must
        // still be stable and ranks dense.
        let out = screen(&input).unwrap();
        assert_eq!(out.result[0].rank, 1);
        assert_eq!(out.result[1].rank, 2);
        assert_eq!(out.result[0].composite_score, out.result[1].composite_score);
    }

    // ------------------------------------------------------------------
    // 8. Empty candidate set yields an empty, successful run
    // ------------------------------------------------------------------
    #[test]
    fn test_empty_candidates() {
        let mut input = base_input();
        input.candidate_keys.clear();
        let out = screen(&input).unwrap();
        assert!(out.result.is_empty());
    }

    // ------------------------------------------------------------------
    // 9. Validation failures
    // ------------------------------------------------------------------
    #[test]
    fn test_validation_failures() {
        // Lambdas not summing to one
        let mut input = base_input();
        input.signal_weights = SignalWeights {
            correlation: 0.5,
            marginal_vol: 0.5,
            sector_gap: 0.5,
            hhi: 0.5,
        };
        assert!(screen(&input).is_err());

        // Delta out of range
        let mut input = base_input();
        input.nominal_add_weight = 1.0;
        assert!(screen(&input).is_err());

        // Reference weights not summing to one
        let mut input = base_input();
        input.reference_weights.insert("A".to_string(), 0.9);
        assert!(screen(&input).is_err());

        // Unknown candidate key
        let mut input = base_input();
        input.candidate_keys.push("ZZZ".into());
        assert!(screen(&input).is_err());

        // Missing metadata
        let mut input = base_input();
        input.metadata.remove("C");
        assert!(screen(&input).is_err());
    }

    // ------------------------------------------------------------------
    // 10. MVR favors the uncorrelated, low-vol candidate
    // ------------------------------------------------------------------
    #[test]
    fn test_mvr_sign() {
        let out = screen(&base_input()).unwrap();
        let d = out.result.iter().find(|r| r.asset_key == "D").unwrap();
        let c = out.result.iter().find(|r| r.asset_key == "C").unwrap();
        assert!(
            d.marginal_vol_reduction > c.marginal_vol_reduction,
            "D should reduce volatility more than C: {} vs {}",
            d.marginal_vol_reduction,
            c.marginal_vol_reduction
        );
        assert!(d.marginal_vol_reduction > 0.0);
    }
}
