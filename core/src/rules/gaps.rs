//! Missing business days and stale prints.

use super::{RuleContext, MISSING_DAYS, STALE};
use crate::error::{DqError, DqResult};
use crate::finding::Finding;
use crate::types::SuggestedAction;
use serde::{Deserialize, Serialize};
use serde_json::json;

const MISSING_SCORE: f64 = 55.0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MissingDaysConfig {
    #[serde(default = "default_min_consecutive")]
    pub min_consecutive: usize,
}

fn default_min_consecutive() -> usize { 1 }

impl Default for MissingDaysConfig {
    fn default() -> Self {
        Self { min_consecutive: default_min_consecutive() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StaleConfig {
    /// The N-th identical consecutive print is the first one flagged.
    #[serde(default = "default_min_repeats")]
    pub min_repeats: usize,
    /// Prints closer than this count as unchanged.
    #[serde(default)]
    pub tolerance:   f64,
}

fn default_min_repeats() -> usize { 3 }

impl Default for StaleConfig {
    fn default() -> Self {
        Self { min_repeats: default_min_repeats(), tolerance: 0.0 }
    }
}

/// Expected business days between the first print (or the view start, if
/// later) and the as-of date that have no print. Each run of at least
/// `min_consecutive` missing days becomes one finding.
pub fn missing_days(ctx: &RuleContext<'_>, cfg: &MissingDaysConfig) -> DqResult<Vec<Finding>> {
    if cfg.min_consecutive == 0 {
        return Err(ctx.invalid(MISSING_DAYS, "min_consecutive must be >= 1"));
    }
    let Some(first) = ctx.view.first_date() else {
        return Err(DqError::InsufficientData {
            rule_code: MISSING_DAYS.to_string(),
            needed: 1,
            available: 0,
        });
    };

    let from = first.max(ctx.view.start);
    let expected = ctx.calendar.business_days(from, ctx.asof);

    let mut findings = Vec::new();
    let mut run = Vec::new();
    // Sentinel `None` closes the final run.
    for day in expected.iter().map(Some).chain(std::iter::once(None)) {
        match day {
            Some(d) if ctx.view.value_on(*d).is_none() => run.push(*d),
            _ => {
                if run.len() >= cfg.min_consecutive {
                    if let (Some(start), Some(end)) = (run.first(), run.last()) {
                        findings.push(Finding::spanning(
                            ctx.risk_factor_id(),
                            MISSING_DAYS,
                            *start,
                            *end,
                            run.len() as u32,
                            MISSING_SCORE,
                            SuggestedAction::Interpolate,
                            json!({
                                "missing_days": run.len(),
                                "calendar": ctx.calendar.as_str(),
                            }),
                        ));
                    }
                }
                run.clear();
            }
        }
    }
    Ok(findings)
}

/// Flags the N-th and every later print of an unchanged streak.
pub fn stale(ctx: &RuleContext<'_>, cfg: &StaleConfig) -> DqResult<Vec<Finding>> {
    if cfg.min_repeats < 2 {
        return Err(ctx.invalid(STALE, format!("min_repeats {} must be >= 2", cfg.min_repeats)));
    }
    if !(cfg.tolerance.is_finite() && cfg.tolerance >= 0.0) {
        return Err(ctx.invalid(STALE, format!("tolerance {} must be >= 0", cfg.tolerance)));
    }
    let points = &ctx.view.points;
    if points.len() < cfg.min_repeats {
        return Err(DqError::InsufficientData {
            rule_code: STALE.to_string(),
            needed: cfg.min_repeats,
            available: points.len(),
        });
    }
    ctx.ensure_finite(STALE, ctx.view)?;

    let mut findings = Vec::new();
    let mut repeats = 1usize;
    for w in points.windows(2) {
        if (w[1].value - w[0].value).abs() <= cfg.tolerance {
            repeats += 1;
        } else {
            repeats = 1;
        }
        if repeats >= cfg.min_repeats {
            findings.push(Finding::on(
                ctx.risk_factor_id(),
                STALE,
                w[1].date,
                30.0 + 12.0 * repeats as f64,
                SuggestedAction::Review,
                json!({
                    "value": w[1].value,
                    "repeats": repeats,
                    "tolerance": cfg.tolerance,
                }),
            ));
        }
    }
    Ok(findings)
}
