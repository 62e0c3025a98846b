//! Read-only queries feeding the dashboard and the DQ pack renderer.

use crate::audit::{AuditEntry, AuditSubject};
use crate::coordinator::RunScope;
use crate::error::DqResult;
use crate::finding::Finding;
use crate::store::{DqStore, ExceptionFilter, ExceptionRecord, RunRecord};
use crate::types::{ExceptionState, RiskFactorId};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Peak score at or above which an exception counts as high in the pack.
pub const PACK_HIGH_SCORE: u8 = 80;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub run:              RunRecord,
    pub findings_by_rule: BTreeMap<String, usize>,
    pub active_exceptions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PackSummary {
    pub start:          NaiveDate,
    pub end:            NaiveDate,
    pub total:          usize,
    pub high:           usize,
    pub open:           usize,
    pub by_state:       BTreeMap<ExceptionState, usize>,
    pub by_risk_factor: BTreeMap<RiskFactorId, usize>,
}

pub struct Reporting<'a> {
    store: &'a DqStore,
}

impl<'a> Reporting<'a> {
    pub fn new(store: &'a DqStore) -> Self {
        Self { store }
    }

    pub fn run_summary(&self, scope: &RunScope, asof: NaiveDate) -> DqResult<Option<RunSummary>> {
        let Some(run) = self.store.get_run(&scope.key(), asof)? else {
            return Ok(None);
        };
        let mut findings_by_rule = BTreeMap::new();
        for f in self.store.findings_for_run(&run.run_id)? {
            *findings_by_rule.entry(f.rule_code).or_default() += 1;
        }
        let active_exceptions = self
            .store
            .list_exceptions(&ExceptionFilter {
                active_only: true,
                ..ExceptionFilter::default()
            })?
            .len();
        Ok(Some(RunSummary {
            run,
            findings_by_rule,
            active_exceptions,
        }))
    }

    /// Work queue order: highest severity first, then most recent window end.
    pub fn exception_queue(&self, filter: &ExceptionFilter) -> DqResult<Vec<ExceptionRecord>> {
        let mut rows = self.store.list_exceptions(filter)?;
        rows.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then(b.window_end.cmp(&a.window_end))
                .then(a.exception_id.cmp(&b.exception_id))
        });
        Ok(rows)
    }

    pub fn findings(&self, run_id: &str) -> DqResult<Vec<Finding>> {
        self.store.findings_for_run(run_id)
    }

    pub fn history(&self, subject: &AuditSubject) -> DqResult<Vec<AuditEntry>> {
        self.store.audit_history(subject)
    }

    /// Exceptions whose window intersects `[start, end]`.
    pub fn pack_summary(&self, start: NaiveDate, end: NaiveDate) -> DqResult<PackSummary> {
        let rows: Vec<ExceptionRecord> = self
            .store
            .list_exceptions(&ExceptionFilter::default())?
            .into_iter()
            .filter(|e| e.window_start <= end && e.window_end >= start)
            .collect();

        let mut summary = PackSummary {
            start,
            end,
            total: rows.len(),
            high: rows.iter().filter(|e| e.peak_score >= PACK_HIGH_SCORE).count(),
            open: rows.iter().filter(|e| e.state == ExceptionState::Open).count(),
            by_state: BTreeMap::new(),
            by_risk_factor: BTreeMap::new(),
        };
        for e in rows {
            *summary.by_state.entry(e.state).or_default() += 1;
            *summary.by_risk_factor.entry(e.risk_factor_id).or_default() += 1;
        }
        Ok(summary)
    }
}
