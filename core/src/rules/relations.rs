//! Relationship rules: checks of one factor against peer factors.

use super::{RuleContext, CORR_BREAK, FX_TRIANGLE, TENOR_ORDER};
use crate::error::{DqError, DqResult};
use crate::finding::Finding;
use crate::series::ChangeMeasure;
use crate::stats::pearson;
use crate::types::{RiskFactorId, SuggestedAction};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

/// The factor is the cross: `self ≈ leg_ab × leg_bc`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FxTriangleConfig {
    pub leg_ab:        RiskFactorId,
    pub leg_bc:        RiskFactorId,
    #[serde(default = "default_rel_tolerance")]
    pub rel_tolerance: f64,
}

fn default_rel_tolerance() -> f64 { 0.002 }

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TenorRelation {
    /// self >= peer
    AtLeast,
    /// self <= peer
    AtMost,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TenorOrderConfig {
    pub peer:      RiskFactorId,
    pub relation:  TenorRelation,
    #[serde(default)]
    pub tolerance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CorrelationBreakConfig {
    pub peer:         RiskFactorId,
    #[serde(default = "default_corr_window")]
    pub window:       usize,
    #[serde(default = "default_min_abs_corr")]
    pub min_abs_corr: f64,
    #[serde(default)]
    pub measure:      ChangeMeasure,
}

fn default_corr_window() -> usize { 60 }
fn default_min_abs_corr() -> f64 { 0.2 }

/// Extra aligned points required beyond one full window.
const CORR_WARMUP: usize = 10;

pub fn fx_triangle(ctx: &RuleContext<'_>, cfg: &FxTriangleConfig) -> DqResult<Vec<Finding>> {
    if !(cfg.rel_tolerance.is_finite() && cfg.rel_tolerance >= 0.0) {
        return Err(ctx.invalid(FX_TRIANGLE, "rel_tolerance must be >= 0"));
    }
    let ab = ctx.peer(FX_TRIANGLE, &cfg.leg_ab)?;
    let bc = ctx.peer(FX_TRIANGLE, &cfg.leg_bc)?;
    for v in [ctx.view, ab, bc] {
        ctx.ensure_finite(FX_TRIANGLE, v)?;
    }

    let mut aligned = 0usize;
    let mut findings = Vec::new();
    for p in &ctx.view.points {
        let (Some(a), Some(b)) = (ab.value_on(p.date), bc.value_on(p.date)) else {
            continue;
        };
        aligned += 1;
        let implied = a * b;
        if implied == 0.0 {
            continue;
        }
        let err = (p.value - implied).abs() / implied.abs();
        if err > cfg.rel_tolerance {
            findings.push(Finding::on(
                ctx.risk_factor_id(),
                FX_TRIANGLE,
                p.date,
                60.0 + 200.0 * err,
                SuggestedAction::SourceSwitch,
                json!({
                    "cross": p.value,
                    "implied": implied,
                    "leg_ab": a,
                    "leg_bc": b,
                    "rel_error": err,
                    "tolerance": cfg.rel_tolerance,
                }),
            ));
        }
    }
    if aligned == 0 {
        return Err(DqError::InsufficientData {
            rule_code: FX_TRIANGLE.to_string(),
            needed: 1,
            available: 0,
        });
    }
    Ok(findings)
}

pub fn tenor_order(ctx: &RuleContext<'_>, cfg: &TenorOrderConfig) -> DqResult<Vec<Finding>> {
    if !(cfg.tolerance.is_finite() && cfg.tolerance >= 0.0) {
        return Err(ctx.invalid(TENOR_ORDER, "tolerance must be >= 0"));
    }
    let peer = ctx.peer(TENOR_ORDER, &cfg.peer)?;
    ctx.ensure_finite(TENOR_ORDER, ctx.view)?;
    ctx.ensure_finite(TENOR_ORDER, peer)?;

    let mut findings = Vec::new();
    for p in &ctx.view.points {
        let Some(other) = peer.value_on(p.date) else {
            continue;
        };
        let violation = match cfg.relation {
            TenorRelation::AtLeast => other - p.value,
            TenorRelation::AtMost  => p.value - other,
        };
        if violation > cfg.tolerance {
            findings.push(Finding::on(
                ctx.risk_factor_id(),
                TENOR_ORDER,
                p.date,
                65.0 + 100.0 * (violation - cfg.tolerance),
                SuggestedAction::Review,
                json!({
                    "value": p.value,
                    "peer": cfg.peer,
                    "peer_value": other,
                    "violation": violation,
                    "tolerance": cfg.tolerance,
                }),
            ));
        }
    }
    Ok(findings)
}

/// Rolling Pearson correlation of daily changes against the peer. Dates
/// where `|corr|` drops below `min_abs_corr` are flagged.
pub fn correlation_break(
    ctx: &RuleContext<'_>,
    cfg: &CorrelationBreakConfig,
) -> DqResult<Vec<Finding>> {
    if cfg.window < 3 {
        return Err(ctx.invalid(CORR_BREAK, format!("window {} must be >= 3", cfg.window)));
    }
    if !(cfg.min_abs_corr > 0.0 && cfg.min_abs_corr <= 1.0) {
        return Err(ctx.invalid(CORR_BREAK, "min_abs_corr must be in (0, 1]"));
    }
    let peer = ctx.peer(CORR_BREAK, &cfg.peer)?;
    ctx.ensure_finite(CORR_BREAK, ctx.view)?;
    ctx.ensure_finite(CORR_BREAK, peer)?;

    let peer_changes: BTreeMap<_, _> = peer.changes(cfg.measure).into_iter().collect();
    let aligned: Vec<_> = ctx
        .view
        .changes(cfg.measure)
        .into_iter()
        .filter_map(|(d, c)| peer_changes.get(&d).map(|pc| (d, c, *pc)))
        .filter(|(_, c, pc)| c.is_finite() && pc.is_finite())
        .collect();

    let needed = cfg.window + CORR_WARMUP;
    if aligned.len() < needed {
        return Err(DqError::InsufficientData {
            rule_code: CORR_BREAK.to_string(),
            needed,
            available: aligned.len(),
        });
    }

    let mut findings = Vec::new();
    for end in cfg.window..=aligned.len() {
        let slice = &aligned[end - cfg.window..end];
        let xs: Vec<f64> = slice.iter().map(|(_, x, _)| *x).collect();
        let ys: Vec<f64> = slice.iter().map(|(_, _, y)| *y).collect();
        let Some(corr) = pearson(&xs, &ys) else {
            continue;
        };
        if corr.abs() < cfg.min_abs_corr {
            let date = slice[slice.len() - 1].0;
            findings.push(Finding::on(
                ctx.risk_factor_id(),
                CORR_BREAK,
                date,
                70.0 + 50.0 * (cfg.min_abs_corr - corr.abs()) / cfg.min_abs_corr,
                SuggestedAction::Review,
                json!({
                    "peer": cfg.peer,
                    "corr": corr,
                    "window": cfg.window,
                    "min_abs_corr": cfg.min_abs_corr,
                }),
            ));
        }
    }
    Ok(findings)
}
