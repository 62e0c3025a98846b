//! Run record queries.

use super::DqStore;
use crate::{
    error::DqResult,
    types::{RunId, RunStatus, Severity},
};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub run_id:            RunId,
    pub scope_key:         String,
    pub asof:              NaiveDate,
    pub attempt:           u32,
    pub started_at:        DateTime<Utc>,
    pub ended_at:          Option<DateTime<Utc>>,
    pub status:            RunStatus,
    /// Findings of the latest attempt by severity.
    pub severity_counts:   BTreeMap<Severity, usize>,
    /// Exception transitions of the latest attempt by kind.
    pub transition_counts: BTreeMap<String, usize>,
    pub finding_count:     usize,
    pub transition_count:  usize,
    pub skipped_rules:     usize,
    pub factors_total:     usize,
    pub factors_committed: usize,
    pub warnings:          Vec<String>,
    pub abort_reason:      Option<String>,
}

const RUN_COLUMNS: &str = "run_id, scope_key, asof, attempt, started_at, ended_at, status,
    severity_counts, transition_counts, finding_count, transition_count, skipped_rules,
    factors_total, factors_committed, warnings, abort_reason";

impl DqStore {
    pub fn get_run(&self, scope_key: &str, asof: NaiveDate) -> DqResult<Option<RunRecord>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM dq_run WHERE scope_key=?1 AND asof=?2");
        let raw = self
            .conn
            .query_row(&sql, params![scope_key, asof], RawRun::from_row)
            .optional()?;
        raw.map(RawRun::decode).transpose()
    }

    pub fn get_run_by_id(&self, run_id: &str) -> DqResult<Option<RunRecord>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM dq_run WHERE run_id=?1");
        let raw = self
            .conn
            .query_row(&sql, params![run_id], RawRun::from_row)
            .optional()?;
        raw.map(RawRun::decode).transpose()
    }

    /// Most recent runs first.
    pub fn list_runs(&self, limit: usize) -> DqResult<Vec<RunRecord>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM dq_run ORDER BY asof DESC, run_id LIMIT ?1");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit as i64], RawRun::from_row)?;
        let mut result = Vec::new();
        for r in rows {
            result.push(r?.decode()?);
        }
        Ok(result)
    }

    /// Create the run row, or bump `attempt` on the existing one and reset it
    /// to RUNNING. Returns the fresh record.
    pub fn begin_run_attempt(
        &self,
        run_id: &str,
        scope_key: &str,
        asof: NaiveDate,
        started_at: DateTime<Utc>,
    ) -> DqResult<RunRecord> {
        self.conn.execute(
            "INSERT INTO dq_run (run_id, scope_key, asof, attempt, started_at, status)
             VALUES (?1, ?2, ?3, 1, ?4, ?5)
             ON CONFLICT(run_id) DO UPDATE SET
                attempt=attempt+1,
                started_at=excluded.started_at,
                ended_at=NULL,
                status=excluded.status,
                severity_counts='{}',
                transition_counts='{}',
                finding_count=0,
                transition_count=0,
                skipped_rules=0,
                factors_total=0,
                factors_committed=0,
                warnings='[]',
                abort_reason=NULL",
            params![run_id, scope_key, asof, started_at, RunStatus::Running],
        )?;
        self.get_run_by_id(run_id)?
            .ok_or_else(|| anyhow::anyhow!("run {run_id} missing after insert").into())
    }

    pub fn finalize_run(&self, run: &RunRecord) -> DqResult<()> {
        self.conn.execute(
            "UPDATE dq_run SET
                ended_at=?2, status=?3, severity_counts=?4, transition_counts=?5,
                finding_count=?6, transition_count=?7, skipped_rules=?8,
                factors_total=?9, factors_committed=?10, warnings=?11, abort_reason=?12
             WHERE run_id=?1",
            params![
                run.run_id,
                run.ended_at,
                run.status,
                serde_json::to_string(&run.severity_counts)?,
                serde_json::to_string(&run.transition_counts)?,
                run.finding_count as i64,
                run.transition_count as i64,
                run.skipped_rules as i64,
                run.factors_total as i64,
                run.factors_committed as i64,
                serde_json::to_string(&run.warnings)?,
                run.abort_reason,
            ],
        )?;
        Ok(())
    }
}

/// Row as stored; JSON columns still encoded.
struct RawRun {
    run_id:            String,
    scope_key:         String,
    asof:              NaiveDate,
    attempt:           i64,
    started_at:        DateTime<Utc>,
    ended_at:          Option<DateTime<Utc>>,
    status:            RunStatus,
    severity_counts:   String,
    transition_counts: String,
    finding_count:     i64,
    transition_count:  i64,
    skipped_rules:     i64,
    factors_total:     i64,
    factors_committed: i64,
    warnings:          String,
    abort_reason:      Option<String>,
}

impl RawRun {
    fn from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: r.get(0)?,
            scope_key: r.get(1)?,
            asof: r.get(2)?,
            attempt: r.get(3)?,
            started_at: r.get(4)?,
            ended_at: r.get(5)?,
            status: r.get(6)?,
            severity_counts: r.get(7)?,
            transition_counts: r.get(8)?,
            finding_count: r.get(9)?,
            transition_count: r.get(10)?,
            skipped_rules: r.get(11)?,
            factors_total: r.get(12)?,
            factors_committed: r.get(13)?,
            warnings: r.get(14)?,
            abort_reason: r.get(15)?,
        })
    }

    fn decode(self) -> DqResult<RunRecord> {
        Ok(RunRecord {
            run_id: self.run_id,
            scope_key: self.scope_key,
            asof: self.asof,
            attempt: self.attempt as u32,
            started_at: self.started_at,
            ended_at: self.ended_at,
            status: self.status,
            severity_counts: serde_json::from_str(&self.severity_counts)?,
            transition_counts: serde_json::from_str(&self.transition_counts)?,
            finding_count: self.finding_count as usize,
            transition_count: self.transition_count as usize,
            skipped_rules: self.skipped_rules as usize,
            factors_total: self.factors_total as usize,
            factors_committed: self.factors_committed as usize,
            warnings: serde_json::from_str(&self.warnings)?,
            abort_reason: self.abort_reason,
        })
    }
}
