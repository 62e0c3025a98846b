//! Robust z-score spike rule (rolling median / MAD of changes).

use super::{RuleContext, SPIKE};
use crate::error::{DqError, DqResult};
use crate::finding::Finding;
use crate::series::ChangeMeasure;
use crate::stats::{mad, median, MAD_SCALE};
use crate::types::SuggestedAction;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Above this |z| the print is treated as garbage rather than an outlier.
const REMOVE_Z: f64 = 12.0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpikeConfig {
    #[serde(default = "default_window")]
    pub window:      usize,
    #[serde(default = "default_min_history")]
    pub min_history: usize,
    #[serde(default = "default_threshold")]
    pub threshold:   f64,
    #[serde(default)]
    pub measure:     ChangeMeasure,
}

fn default_window() -> usize { 21 }
fn default_min_history() -> usize { 20 }
fn default_threshold() -> f64 { 6.0 }

impl Default for SpikeConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            min_history: default_min_history(),
            threshold: default_threshold(),
            measure: ChangeMeasure::Difference,
        }
    }
}

/// Flags each change whose distance from the trailing median is strictly
/// greater than `threshold` robust sigmas. The trailing window holds up to
/// `window` prior changes and never fewer than `min_history`.
pub fn robust_z(ctx: &RuleContext<'_>, cfg: &SpikeConfig) -> DqResult<Vec<Finding>> {
    if cfg.min_history == 0 || cfg.window < cfg.min_history {
        return Err(ctx.invalid(
            SPIKE,
            format!("window {} must be >= min_history {} > 0", cfg.window, cfg.min_history),
        ));
    }
    if !(cfg.threshold.is_finite() && cfg.threshold > 0.0) {
        return Err(ctx.invalid(SPIKE, format!("threshold {} must be positive", cfg.threshold)));
    }
    ctx.ensure_finite(SPIKE, ctx.view)?;

    let changes = ctx.view.changes(cfg.measure);
    if changes.len() < cfg.min_history + 1 {
        return Err(DqError::InsufficientData {
            rule_code: SPIKE.to_string(),
            needed: cfg.min_history + 1,
            available: changes.len(),
        });
    }
    if let Some((date, _)) = changes.iter().find(|(_, c)| !c.is_finite()) {
        return Err(ctx.invalid(SPIKE, format!("non-finite {:?} change on {date}", cfg.measure)));
    }

    let mut findings = Vec::new();
    for i in cfg.min_history..changes.len() {
        let (date, change) = changes[i];
        let history: Vec<f64> = changes[i.saturating_sub(cfg.window)..i]
            .iter()
            .map(|(_, c)| *c)
            .collect();
        let Some(center) = median(&history) else {
            continue;
        };
        let Some(dev) = mad(&history, center) else {
            continue;
        };
        let scale = MAD_SCALE * dev;
        if scale <= 0.0 {
            continue;
        }
        let distance = (change - center).abs();
        if distance > cfg.threshold * scale {
            let z = (change - center) / scale;
            let action = if z.abs() < REMOVE_Z {
                SuggestedAction::Winsorize
            } else {
                SuggestedAction::Remove
            };
            findings.push(Finding::on(
                ctx.risk_factor_id(),
                SPIKE,
                date,
                40.0 + 10.0 * z.abs(),
                action,
                json!({
                    "value": ctx.view.value_on(date),
                    "change": change,
                    "median": center,
                    "mad": dev,
                    "z": z,
                    "threshold": cfg.threshold,
                    "history": history.len(),
                }),
            ));
        }
    }
    Ok(findings)
}
