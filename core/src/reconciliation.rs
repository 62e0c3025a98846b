//! Cross-source reconciliation of same-day values for one risk factor.
//!
//! RULE: The reference for a date is the first source in priority order
//! that has a value that day. A date on which no source has a value is
//! skipped and counted, never an error.

use crate::calendar::CalendarKind;
use crate::error::{DqError, DqResult};
use crate::finding::{merge_adjacent, Finding};
use crate::series::TimeSeriesView;
use crate::types::{RiskFactorId, SuggestedAction};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

pub const RECONCILE_LEVEL: &str = "reconcile.level";
pub const RECONCILE_RETURN: &str = "reconcile.return";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiffMode {
    Absolute,
    Relative,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReconBasis {
    #[default]
    Level,
    /// Compare each source's own day-over-day simple return.
    Return,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconConfig {
    pub mode:        DiffMode,
    pub threshold:   f64,
    #[serde(default)]
    pub basis:       ReconBasis,
    /// Breaching dates required in a row before anything is flagged.
    #[serde(default = "default_consecutive")]
    pub consecutive: usize,
}

fn default_consecutive() -> usize { 1 }

impl ReconConfig {
    pub fn rule_code(&self) -> &'static str {
        match self.basis {
            ReconBasis::Level  => RECONCILE_LEVEL,
            ReconBasis::Return => RECONCILE_RETURN,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReconReport {
    pub findings:      Vec<Finding>,
    pub skipped_dates: Vec<NaiveDate>,
    /// Dates on which the reference was not the top-priority source.
    pub fallbacks:     usize,
}

pub struct ReconciliationEngine {
    risk_factor_id: RiskFactorId,
    config:         ReconConfig,
    priority:       Vec<String>,
}

struct Reference<'a> {
    source:   &'a str,
    value:    f64,
    fallback: bool,
}

impl ReconciliationEngine {
    pub fn new(risk_factor_id: &str, config: ReconConfig, priority: Vec<String>) -> Self {
        Self {
            risk_factor_id: risk_factor_id.to_string(),
            config,
            priority,
        }
    }

    pub fn rule_code(&self) -> &'static str {
        self.config.rule_code()
    }

    /// Raw disagreement on one date, without the consecutive filter.
    pub fn reconcile(
        &self,
        views: &BTreeMap<String, TimeSeriesView>,
        date: NaiveDate,
    ) -> DqResult<Vec<Finding>> {
        self.validate()?;
        match self.check_date(views, date) {
            Ok(found) => Ok(found.into_iter().collect()),
            Err(DqError::SourceUnavailable { .. }) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Reconcile every date in `dates` (ascending), apply the consecutive
    /// filter and merge adjacent findings.
    pub fn reconcile_window(
        &self,
        views: &BTreeMap<String, TimeSeriesView>,
        dates: &[NaiveDate],
        calendar: CalendarKind,
    ) -> DqResult<ReconReport> {
        self.validate()?;
        let mut report = ReconReport::default();
        let mut raw = Vec::new();
        let mut streak = 0usize;
        for &date in dates {
            if self.reference(views, date).map(|r| r.fallback).unwrap_or(false) {
                report.fallbacks += 1;
            }
            match self.check_date(views, date) {
                Ok(Some(finding)) => {
                    streak += 1;
                    if streak >= self.config.consecutive {
                        raw.push(finding);
                    }
                }
                Ok(None) => streak = 0,
                Err(DqError::SourceUnavailable { .. }) => {
                    log::debug!("{}: no source on {date}, skipped", self.risk_factor_id);
                    report.skipped_dates.push(date);
                    streak = 0;
                }
                Err(e) => return Err(e),
            }
        }
        report.findings = merge_adjacent(raw, calendar);
        Ok(report)
    }

    fn validate(&self) -> DqResult<()> {
        if !(self.config.threshold.is_finite() && self.config.threshold >= 0.0) {
            return Err(self.invalid(format!("threshold {} must be >= 0", self.config.threshold)));
        }
        if self.config.consecutive == 0 {
            return Err(self.invalid("consecutive must be >= 1"));
        }
        Ok(())
    }

    fn invalid(&self, reason: impl Into<String>) -> DqError {
        DqError::RuleEvaluation {
            rule_code: self.rule_code().to_string(),
            risk_factor_id: self.risk_factor_id.clone(),
            reason: reason.into(),
        }
    }

    /// Priority sources first, then any other source present, by name.
    fn ordered_sources<'a>(&'a self, views: &'a BTreeMap<String, TimeSeriesView>) -> Vec<&'a str> {
        let mut out: Vec<&str> = self.priority.iter().map(String::as_str).collect();
        out.extend(
            views
                .keys()
                .map(String::as_str)
                .filter(|s| !self.priority.iter().any(|p| p == s)),
        );
        out
    }

    fn value(&self, view: &TimeSeriesView, date: NaiveDate) -> Option<f64> {
        let today = view.value_on(date).filter(|v| v.is_finite())?;
        match self.config.basis {
            ReconBasis::Level => Some(today),
            ReconBasis::Return => {
                let prev = view.value_before(date)?;
                if prev.value == 0.0 || !prev.value.is_finite() {
                    return None;
                }
                Some(today / prev.value - 1.0)
            }
        }
    }

    fn reference<'a>(
        &'a self,
        views: &'a BTreeMap<String, TimeSeriesView>,
        date: NaiveDate,
    ) -> DqResult<Reference<'a>> {
        let top = self.priority.first().map(String::as_str);
        for source in self.ordered_sources(views) {
            if let Some(value) = views.get(source).and_then(|v| self.value(v, date)) {
                return Ok(Reference {
                    source,
                    value,
                    fallback: top.is_some_and(|t| t != source),
                });
            }
        }
        Err(DqError::SourceUnavailable {
            risk_factor_id: self.risk_factor_id.clone(),
            date,
        })
    }

    fn diff(&self, reference: f64, other: f64) -> f64 {
        let abs = (other - reference).abs();
        match (self.config.basis, self.config.mode) {
            (ReconBasis::Return, _) | (_, DiffMode::Absolute) => abs,
            (ReconBasis::Level, DiffMode::Relative) => {
                if reference == 0.0 {
                    if abs > 0.0 { f64::INFINITY } else { 0.0 }
                } else {
                    abs / reference.abs()
                }
            }
        }
    }

    /// Worst disagreement against the reference on `date`, if any exceeds
    /// the threshold.
    fn check_date(
        &self,
        views: &BTreeMap<String, TimeSeriesView>,
        date: NaiveDate,
    ) -> DqResult<Option<Finding>> {
        let reference = self.reference(views, date)?;
        let threshold = self.config.threshold;

        let mut worst: Option<(&str, f64, f64)> = None;
        for source in self.ordered_sources(views) {
            if source == reference.source {
                continue;
            }
            let Some(value) = views.get(source).and_then(|v| self.value(v, date)) else {
                continue;
            };
            let diff = self.diff(reference.value, value);
            if diff > threshold && worst.map_or(true, |(_, _, d)| diff > d) {
                worst = Some((source, value, diff));
            }
        }

        Ok(worst.map(|(source, value, diff)| {
            let scaled = if threshold > 0.0 {
                (diff / (5.0 * threshold)).min(1.0)
            } else {
                1.0
            };
            Finding::on(
                &self.risk_factor_id,
                self.rule_code(),
                date,
                70.0 + 30.0 * scaled,
                SuggestedAction::SourceSwitch,
                json!({
                    "reference": reference.source,
                    "reference_value": reference.value,
                    "source": source,
                    "value": value,
                    "diff": if diff.is_finite() { json!(diff) } else { json!("inf") },
                    "threshold": threshold,
                    "fallback": reference.fallback,
                }),
            )
        }))
    }
}
