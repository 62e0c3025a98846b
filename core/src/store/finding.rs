//! Run-scoped finding persistence.

use super::DqStore;
use crate::{error::DqResult, finding::Finding};
use rusqlite::params;

impl DqStore {
    /// Replace the findings of one risk factor within a run. A rerun of the
    /// same run id overwrites rather than duplicates.
    pub fn replace_findings(
        &self,
        run_id: &str,
        risk_factor_id: &str,
        findings: &[Finding],
    ) -> DqResult<()> {
        self.conn.execute(
            "DELETE FROM finding WHERE run_id=?1 AND risk_factor_id=?2",
            params![run_id, risk_factor_id],
        )?;
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO finding
                (run_id, risk_factor_id, rule_code, start_date, end_date, score,
                 severity, suggested_action, flagged_days, metrics)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )?;
        for f in findings {
            stmt.execute(params![
                run_id,
                f.risk_factor_id,
                f.rule_code,
                f.start,
                f.end,
                f.score,
                f.severity,
                f.suggested_action,
                f.flagged_days,
                serde_json::to_string(&f.metrics)?,
            ])?;
        }
        Ok(())
    }

    /// Findings of a run, ordered by (risk factor, rule, start).
    pub fn findings_for_run(&self, run_id: &str) -> DqResult<Vec<Finding>> {
        let mut stmt = self.conn.prepare(
            "SELECT risk_factor_id, rule_code, start_date, end_date, score, severity,
                    suggested_action, flagged_days, metrics
             FROM finding WHERE run_id=?1
             ORDER BY risk_factor_id, rule_code, start_date",
        )?;
        let rows = stmt.query_map(params![run_id], |r| {
            Ok((
                Finding {
                    risk_factor_id: r.get(0)?,
                    rule_code: r.get(1)?,
                    start: r.get(2)?,
                    end: r.get(3)?,
                    score: r.get(4)?,
                    severity: r.get(5)?,
                    suggested_action: r.get(6)?,
                    flagged_days: r.get(7)?,
                    metrics: serde_json::Value::Null,
                },
                r.get::<_, String>(8)?,
            ))
        })?;
        let mut result = Vec::new();
        for r in rows {
            let (mut finding, metrics) = r?;
            finding.metrics = serde_json::from_str(&metrics)?;
            result.push(finding);
        }
        Ok(result)
    }

    pub fn finding_count_for_run(&self, run_id: &str) -> DqResult<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM finding WHERE run_id=?1",
            params![run_id],
            |r| r.get(0),
        )?)
    }
}
