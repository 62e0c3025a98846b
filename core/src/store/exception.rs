//! Exception queries with optimistic concurrency.
//!
//! Every update is guarded by `version`; a stale version changes no row and
//! surfaces as `PersistenceConflict`. A second active exception for the same
//! key trips the partial unique index and surfaces the same way.

use super::{conflict_on, DqStore};
use crate::{
    error::{DqError, DqResult},
    types::{ExceptionId, ExceptionState, RiskFactorId, Severity, SuggestedAction},
};
use chrono::NaiveDate;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExceptionRecord {
    pub exception_id:     ExceptionId,
    pub risk_factor_id:   RiskFactorId,
    pub rule_code:        String,
    pub window_start:     NaiveDate,
    pub window_end:       NaiveDate,
    pub state:            ExceptionState,
    pub severity:         Severity,
    pub peak_score:       u8,
    pub suggested_action: SuggestedAction,
    /// As-of of the run that opened it.
    pub first_seen:       NaiveDate,
    /// Latest run as-of that observed the condition.
    pub last_seen:        NaiveDate,
    pub quiet_runs:       u32,
    /// Latest run as-of that evaluated it, recurring or not.
    pub last_run_asof:    NaiveDate,
    pub supersedes:       Option<ExceptionId>,
    pub version:          i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewException {
    pub risk_factor_id:   RiskFactorId,
    pub rule_code:        String,
    pub window_start:     NaiveDate,
    pub window_end:       NaiveDate,
    pub severity:         Severity,
    pub peak_score:       u8,
    pub suggested_action: SuggestedAction,
    pub asof:             NaiveDate,
    pub supersedes:       Option<ExceptionId>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExceptionFilter {
    pub state:          Option<ExceptionState>,
    pub severity:       Option<Severity>,
    pub risk_factor_id: Option<RiskFactorId>,
    pub active_only:    bool,
}

const EXCEPTION_COLUMNS: &str = "exception_id, risk_factor_id, rule_code, window_start,
    window_end, state, severity, peak_score, suggested_action, first_seen, last_seen,
    quiet_runs, last_run_asof, supersedes, version";

fn row_to_exception(r: &rusqlite::Row<'_>) -> rusqlite::Result<ExceptionRecord> {
    Ok(ExceptionRecord {
        exception_id: r.get(0)?,
        risk_factor_id: r.get(1)?,
        rule_code: r.get(2)?,
        window_start: r.get(3)?,
        window_end: r.get(4)?,
        state: r.get(5)?,
        severity: r.get(6)?,
        peak_score: r.get(7)?,
        suggested_action: r.get(8)?,
        first_seen: r.get(9)?,
        last_seen: r.get(10)?,
        quiet_runs: r.get(11)?,
        last_run_asof: r.get(12)?,
        supersedes: r.get(13)?,
        version: r.get(14)?,
    })
}

impl DqStore {
    pub fn insert_exception(&self, new: &NewException) -> DqResult<ExceptionRecord> {
        self.conn
            .execute(
                "INSERT INTO dq_exception
                    (risk_factor_id, rule_code, window_start, window_end, state, severity,
                     peak_score, suggested_action, first_seen, last_seen, quiet_runs,
                     last_run_asof, supersedes, version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9, 0, ?9, ?10, 1)",
                params![
                    new.risk_factor_id,
                    new.rule_code,
                    new.window_start,
                    new.window_end,
                    ExceptionState::Open,
                    new.severity,
                    new.peak_score,
                    new.suggested_action,
                    new.asof,
                    new.supersedes,
                ],
            )
            .map_err(conflict_on(format!("{}/{}", new.risk_factor_id, new.rule_code)))?;
        let id = self.conn.last_insert_rowid();
        self.get_exception(id)?
            .ok_or(DqError::ExceptionNotFound { id })
    }

    /// Write `record` if its `version` is still current. Returns the stored
    /// record with the bumped version.
    pub fn update_exception(&self, record: &ExceptionRecord) -> DqResult<ExceptionRecord> {
        let key = format!("exception {}", record.exception_id);
        let changed = self
            .conn
            .execute(
                "UPDATE dq_exception SET
                    window_start=?3, window_end=?4, state=?5, severity=?6, peak_score=?7,
                    suggested_action=?8, last_seen=?9, quiet_runs=?10, last_run_asof=?11,
                    version=version+1
                 WHERE exception_id=?1 AND version=?2",
                params![
                    record.exception_id,
                    record.version,
                    record.window_start,
                    record.window_end,
                    record.state,
                    record.severity,
                    record.peak_score,
                    record.suggested_action,
                    record.last_seen,
                    record.quiet_runs,
                    record.last_run_asof,
                ],
            )
            .map_err(conflict_on(key.clone()))?;
        if changed == 0 {
            return Err(DqError::PersistenceConflict { key });
        }
        Ok(ExceptionRecord {
            version: record.version + 1,
            ..record.clone()
        })
    }

    pub fn get_exception(&self, exception_id: ExceptionId) -> DqResult<Option<ExceptionRecord>> {
        let sql = format!("SELECT {EXCEPTION_COLUMNS} FROM dq_exception WHERE exception_id=?1");
        Ok(self
            .conn
            .query_row(&sql, params![exception_id], row_to_exception)
            .optional()?)
    }

    /// The OPEN or UNDER_REVIEW exception for a key, if any.
    pub fn active_exception(
        &self,
        risk_factor_id: &str,
        rule_code: &str,
    ) -> DqResult<Option<ExceptionRecord>> {
        let sql = format!(
            "SELECT {EXCEPTION_COLUMNS} FROM dq_exception
             WHERE risk_factor_id=?1 AND rule_code=?2 AND state IN ('open', 'under_review')"
        );
        Ok(self
            .conn
            .query_row(&sql, params![risk_factor_id, rule_code], row_to_exception)
            .optional()?)
    }

    /// The most recently created closed exception for a key.
    pub fn latest_closed_exception(
        &self,
        risk_factor_id: &str,
        rule_code: &str,
    ) -> DqResult<Option<ExceptionRecord>> {
        let sql = format!(
            "SELECT {EXCEPTION_COLUMNS} FROM dq_exception
             WHERE risk_factor_id=?1 AND rule_code=?2
               AND state NOT IN ('open', 'under_review')
             ORDER BY exception_id DESC LIMIT 1"
        );
        Ok(self
            .conn
            .query_row(&sql, params![risk_factor_id, rule_code], row_to_exception)
            .optional()?)
    }

    pub fn active_exceptions_for(&self, risk_factor_id: &str) -> DqResult<Vec<ExceptionRecord>> {
        self.list_exceptions(&ExceptionFilter {
            risk_factor_id: Some(risk_factor_id.to_string()),
            active_only: true,
            ..ExceptionFilter::default()
        })
    }

    /// Exceptions matching `filter`, ordered by id.
    pub fn list_exceptions(&self, filter: &ExceptionFilter) -> DqResult<Vec<ExceptionRecord>> {
        let sql = format!(
            "SELECT {EXCEPTION_COLUMNS} FROM dq_exception
             WHERE (?1 IS NULL OR state=?1)
               AND (?2 IS NULL OR severity=?2)
               AND (?3 IS NULL OR risk_factor_id=?3)
               AND (?4 = 0 OR state IN ('open', 'under_review'))
             ORDER BY exception_id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                filter.state,
                filter.severity,
                filter.risk_factor_id,
                filter.active_only
            ],
            row_to_exception,
        )?;
        let mut result = Vec::new();
        for r in rows {
            result.push(r?);
        }
        Ok(result)
    }
}
