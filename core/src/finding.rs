//! Findings: one defect span detected by a rule or a reconciliation.

use crate::calendar::CalendarKind;
use crate::types::{RiskFactorId, Severity, SuggestedAction};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Finding {
    pub risk_factor_id:   RiskFactorId,
    pub rule_code:        String,
    pub start:            NaiveDate,
    pub end:              NaiveDate,
    /// 1..=100.
    pub score:            u8,
    pub severity:         Severity,
    pub suggested_action: SuggestedAction,
    /// Number of dates merged into this span.
    pub flagged_days:     u32,
    pub metrics:          serde_json::Value,
}

impl Finding {
    /// Single-date finding. The raw score is clamped into 1..=100 and
    /// severity is derived from it.
    pub fn on(
        risk_factor_id: &str,
        rule_code: &str,
        date: NaiveDate,
        raw_score: f64,
        suggested_action: SuggestedAction,
        metrics: serde_json::Value,
    ) -> Self {
        Self::spanning(risk_factor_id, rule_code, date, date, 1, raw_score, suggested_action, metrics)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn spanning(
        risk_factor_id: &str,
        rule_code: &str,
        start: NaiveDate,
        end: NaiveDate,
        flagged_days: u32,
        raw_score: f64,
        suggested_action: SuggestedAction,
        metrics: serde_json::Value,
    ) -> Self {
        let score = clamp_score(raw_score);
        Self {
            risk_factor_id: risk_factor_id.to_string(),
            rule_code: rule_code.to_string(),
            start,
            end,
            score,
            severity: Severity::from_score(score),
            suggested_action,
            flagged_days,
            metrics,
        }
    }
}

pub fn clamp_score(raw: f64) -> u8 {
    if !raw.is_finite() {
        return 100;
    }
    raw.round().clamp(1.0, 100.0) as u8
}

/// Merge findings of the same (risk factor, rule) whose spans overlap or
/// touch on the calendar. The merged span keeps the highest score, its
/// metrics and action, and sums `flagged_days`. Output is sorted by
/// (risk factor, rule, start).
pub fn merge_adjacent(findings: Vec<Finding>, calendar: CalendarKind) -> Vec<Finding> {
    let mut groups: BTreeMap<(RiskFactorId, String), Vec<Finding>> = BTreeMap::new();
    for f in findings {
        groups
            .entry((f.risk_factor_id.clone(), f.rule_code.clone()))
            .or_default()
            .push(f);
    }

    let mut out = Vec::new();
    for (_, mut group) in groups {
        group.sort_by_key(|f| (f.start, f.end));
        let mut iter = group.into_iter();
        let Some(mut current) = iter.next() else {
            continue;
        };
        for next in iter {
            if next.start <= current.end || calendar.adjacent(current.end, next.start) {
                current.end = current.end.max(next.end);
                current.flagged_days += next.flagged_days;
                if next.score > current.score {
                    current.score = next.score;
                    current.severity = next.severity;
                    current.suggested_action = next.suggested_action;
                    current.metrics = next.metrics;
                }
            } else {
                out.push(current);
                current = next;
            }
        }
        out.push(current);
    }
    out
}
