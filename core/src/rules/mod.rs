//! Per-risk-factor DQ rules.
//!
//! RULE: Rules are pure. They read a `TimeSeriesView` (plus peer views for
//! relationship rules) and return findings. They never touch the store.
//!
//! Rule kinds form a closed enum, `RuleSpec`, deserialized from config by
//! its `kind` tag. Adding a rule means adding a variant and its module
//! function; there is no registry.

pub mod gaps;
pub mod relations;
pub mod spike;

use crate::calendar::CalendarKind;
use crate::error::{DqError, DqResult};
use crate::finding::{merge_adjacent, Finding};
use crate::series::TimeSeriesView;
use crate::types::RiskFactorId;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use gaps::{MissingDaysConfig, StaleConfig};
pub use relations::{CorrelationBreakConfig, FxTriangleConfig, TenorOrderConfig, TenorRelation};
pub use spike::SpikeConfig;

pub const SPIKE: &str = "spike.robust_z";
pub const MISSING_DAYS: &str = "gaps.missing_days";
pub const STALE: &str = "gaps.stale";
pub const FX_TRIANGLE: &str = "relations.fx_triangle";
pub const TENOR_ORDER: &str = "relations.tenor_order";
pub const CORR_BREAK: &str = "relations.corr_break";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleSpec {
    Spike(SpikeConfig),
    MissingDays(MissingDaysConfig),
    Stale(StaleConfig),
    FxTriangle(FxTriangleConfig),
    TenorOrder(TenorOrderConfig),
    CorrelationBreak(CorrelationBreakConfig),
}

impl RuleSpec {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Spike(_)            => SPIKE,
            Self::MissingDays(_)      => MISSING_DAYS,
            Self::Stale(_)            => STALE,
            Self::FxTriangle(_)       => FX_TRIANGLE,
            Self::TenorOrder(_)       => TENOR_ORDER,
            Self::CorrelationBreak(_) => CORR_BREAK,
        }
    }

    /// Other risk factors whose views this rule reads.
    pub fn peer_ids(&self) -> Vec<RiskFactorId> {
        match self {
            Self::FxTriangle(c)       => vec![c.leg_ab.clone(), c.leg_bc.clone()],
            Self::TenorOrder(c)       => vec![c.peer.clone()],
            Self::CorrelationBreak(c) => vec![c.peer.clone()],
            _ => Vec::new(),
        }
    }

    pub fn evaluate(&self, ctx: &RuleContext<'_>) -> DqResult<Vec<Finding>> {
        match self {
            Self::Spike(c)            => spike::robust_z(ctx, c),
            Self::MissingDays(c)      => gaps::missing_days(ctx, c),
            Self::Stale(c)            => gaps::stale(ctx, c),
            Self::FxTriangle(c)       => relations::fx_triangle(ctx, c),
            Self::TenorOrder(c)       => relations::tenor_order(ctx, c),
            Self::CorrelationBreak(c) => relations::correlation_break(ctx, c),
        }
    }
}

/// Everything a rule may read for one risk factor.
pub struct RuleContext<'a> {
    pub view:     &'a TimeSeriesView,
    pub peers:    &'a BTreeMap<RiskFactorId, TimeSeriesView>,
    pub calendar: CalendarKind,
    pub asof:     NaiveDate,
}

impl<'a> RuleContext<'a> {
    pub fn risk_factor_id(&self) -> &str {
        &self.view.risk_factor_id
    }

    /// Peer view with at least one print, else `InsufficientData`.
    pub fn peer(&self, rule_code: &str, id: &str) -> DqResult<&'a TimeSeriesView> {
        match self.peers.get(id) {
            Some(v) if !v.is_empty() => Ok(v),
            _ => Err(DqError::InsufficientData {
                rule_code: rule_code.to_string(),
                needed: 1,
                available: 0,
            }),
        }
    }

    pub fn invalid(&self, rule_code: &str, reason: impl Into<String>) -> DqError {
        DqError::RuleEvaluation {
            rule_code: rule_code.to_string(),
            risk_factor_id: self.risk_factor_id().to_string(),
            reason: reason.into(),
        }
    }

    /// Reject NaN / infinite prints in `view`.
    pub fn ensure_finite(&self, rule_code: &str, view: &TimeSeriesView) -> DqResult<()> {
        match view.points.iter().find(|p| !p.value.is_finite()) {
            Some(p) => Err(self.invalid(
                rule_code,
                format!("non-finite value in {}/{} on {}", view.risk_factor_id, view.source, p.date),
            )),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SkippedRule {
    pub risk_factor_id: RiskFactorId,
    pub rule_code:      String,
    pub reason:         String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleFailure {
    pub risk_factor_id: RiskFactorId,
    pub rule_code:      String,
    pub reason:         String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EvaluationReport {
    pub findings: Vec<Finding>,
    pub skipped:  Vec<SkippedRule>,
    pub failures: Vec<RuleFailure>,
}

pub struct RuleEngine;

impl RuleEngine {
    /// Run `rules` in order. A rule that lacks data is recorded as skipped; a
    /// rule that errors is recorded as a failure. Neither stops the others.
    /// Findings come back merged per rule over calendar-adjacent dates.
    pub fn evaluate(ctx: &RuleContext<'_>, rules: &[RuleSpec]) -> EvaluationReport {
        let mut report = EvaluationReport::default();
        let mut raw = Vec::new();
        for rule in rules {
            match rule.evaluate(ctx) {
                Ok(found) => raw.extend(found),
                Err(DqError::InsufficientData { rule_code, needed, available }) => {
                    log::debug!(
                        "{}: {rule_code} skipped, needs {needed} has {available}",
                        ctx.risk_factor_id()
                    );
                    report.skipped.push(SkippedRule {
                        risk_factor_id: ctx.risk_factor_id().to_string(),
                        rule_code,
                        reason: format!("insufficient data: needs {needed}, has {available}"),
                    });
                }
                Err(e) => {
                    log::warn!("{}: rule {} failed: {e}", ctx.risk_factor_id(), rule.code());
                    report.failures.push(RuleFailure {
                        risk_factor_id: ctx.risk_factor_id().to_string(),
                        rule_code: rule.code().to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        report.findings = merge_adjacent(raw, ctx.calendar);
        report
    }
}
