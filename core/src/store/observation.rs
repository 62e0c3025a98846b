//! Risk factor reference data and observation queries.

use super::DqStore;
use crate::{
    calendar::CalendarKind,
    error::DqResult,
    series::Observation,
    types::AssetClass,
};
use chrono::NaiveDate;
use rusqlite::params;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskFactorRecord {
    pub risk_factor_id: String,
    pub asset_class:    AssetClass,
    pub description:    String,
    pub unit:           String,
    pub calendar:       CalendarKind,
}

impl DqStore {
    pub fn upsert_risk_factor(&self, rf: &RiskFactorRecord) -> DqResult<()> {
        self.conn.execute(
            "INSERT INTO risk_factor (risk_factor_id, asset_class, description, unit, calendar)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(risk_factor_id) DO UPDATE SET
                asset_class=excluded.asset_class,
                description=excluded.description,
                unit=excluded.unit,
                calendar=excluded.calendar",
            params![rf.risk_factor_id, rf.asset_class, rf.description, rf.unit, rf.calendar],
        )?;
        Ok(())
    }

    pub fn get_risk_factor(&self, risk_factor_id: &str) -> DqResult<Option<RiskFactorRecord>> {
        use rusqlite::OptionalExtension;
        Ok(self
            .conn
            .query_row(
                "SELECT risk_factor_id, asset_class, description, unit, calendar
                 FROM risk_factor WHERE risk_factor_id=?1",
                params![risk_factor_id],
                row_to_risk_factor,
            )
            .optional()?)
    }

    /// All registered risk factors, optionally restricted to one asset class.
    pub fn list_risk_factors(&self, asset_class: Option<AssetClass>) -> DqResult<Vec<RiskFactorRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT risk_factor_id, asset_class, description, unit, calendar
             FROM risk_factor
             WHERE ?1 IS NULL OR asset_class=?1
             ORDER BY risk_factor_id",
        )?;
        let rows = stmt.query_map(params![asset_class], row_to_risk_factor)?;
        let mut result = Vec::new();
        for r in rows {
            result.push(r?);
        }
        Ok(result)
    }

    /// Insert prints. Identical rows (same key and `ingested_at`) are ignored.
    /// Returns the number of rows actually written.
    pub fn insert_observations(&self, observations: &[Observation]) -> DqResult<usize> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT OR IGNORE INTO observation
                (risk_factor_id, source, obs_date, value, ingested_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        let mut written = 0;
        for o in observations {
            written += stmt.execute(params![
                o.risk_factor_id,
                o.source,
                o.obs_date,
                o.value,
                o.ingested_at
            ])?;
        }
        Ok(written)
    }

    /// Every stored row (all ingestions) for a factor in `[start, end]`.
    pub fn observations(
        &self,
        risk_factor_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> DqResult<Vec<Observation>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT risk_factor_id, source, obs_date, value, ingested_at
             FROM observation
             WHERE risk_factor_id=?1 AND obs_date>=?2 AND obs_date<=?3
             ORDER BY source, obs_date, ingested_at",
        )?;
        let rows = stmt.query_map(params![risk_factor_id, start, end], |r| {
            Ok(Observation {
                risk_factor_id: r.get(0)?,
                source: r.get(1)?,
                obs_date: r.get(2)?,
                value: r.get(3)?,
                ingested_at: r.get(4)?,
            })
        })?;
        let mut result = Vec::new();
        for r in rows {
            result.push(r?);
        }
        Ok(result)
    }

    pub fn observation_count(&self) -> DqResult<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM observation", [], |r| r.get(0))?)
    }
}

fn row_to_risk_factor(r: &rusqlite::Row<'_>) -> rusqlite::Result<RiskFactorRecord> {
    Ok(RiskFactorRecord {
        risk_factor_id: r.get(0)?,
        asset_class: r.get(1)?,
        description: r.get(2)?,
        unit: r.get(3)?,
        calendar: r.get(4)?,
    })
}
