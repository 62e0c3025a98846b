//! Read-only in-memory views over stored observations.

use crate::types::RiskFactorId;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One immutable stored print. A correction is a new row with a later
/// `ingested_at`; nothing is overwritten.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Observation {
    pub risk_factor_id: RiskFactorId,
    pub source:         String,
    pub obs_date:       NaiveDate,
    pub value:          f64,
    pub ingested_at:    DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SeriesPoint {
    pub date:  NaiveDate,
    pub value: f64,
}

/// How day-over-day change is measured.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChangeMeasure {
    #[default]
    Difference,
    LogReturn,
}

/// Observations of one (risk factor, source) over `[start, end]`, one point per
/// date, ascending.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeSeriesView {
    pub risk_factor_id: RiskFactorId,
    pub source:         String,
    pub start:          NaiveDate,
    pub end:            NaiveDate,
    pub points:         Vec<SeriesPoint>,
}

impl TimeSeriesView {
    pub fn empty(risk_factor_id: &str, source: &str, start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            risk_factor_id: risk_factor_id.to_string(),
            source: source.to_string(),
            start,
            end,
            points: Vec::new(),
        }
    }

    /// Build from already-sorted points (tests, synthetic data).
    pub fn from_points(
        risk_factor_id: &str,
        source: &str,
        start: NaiveDate,
        end: NaiveDate,
        mut points: Vec<SeriesPoint>,
    ) -> Self {
        points.sort_by_key(|p| p.date);
        points.dedup_by_key(|p| p.date);
        points.retain(|p| p.date >= start && p.date <= end);
        Self {
            risk_factor_id: risk_factor_id.to_string(),
            source: source.to_string(),
            start,
            end,
            points,
        }
    }

    /// Resolve observations of one source to the latest ingestion per date.
    /// Rows of other sources or outside the window are ignored.
    pub fn from_observations(
        risk_factor_id: &str,
        source: &str,
        start: NaiveDate,
        end: NaiveDate,
        observations: &[Observation],
    ) -> Self {
        let mut latest: BTreeMap<NaiveDate, (DateTime<Utc>, f64)> = BTreeMap::new();
        for o in observations.iter().filter(|o| {
            o.risk_factor_id == risk_factor_id
                && o.source == source
                && o.obs_date >= start
                && o.obs_date <= end
        }) {
            match latest.get(&o.obs_date) {
                Some((at, _)) if *at >= o.ingested_at => {}
                _ => {
                    latest.insert(o.obs_date, (o.ingested_at, o.value));
                }
            }
        }
        Self {
            risk_factor_id: risk_factor_id.to_string(),
            source: source.to_string(),
            start,
            end,
            points: latest
                .into_iter()
                .map(|(date, (_, value))| SeriesPoint { date, value })
                .collect(),
        }
    }

    /// One view per source present in `observations`, keyed by source name.
    pub fn by_source(
        risk_factor_id: &str,
        start: NaiveDate,
        end: NaiveDate,
        observations: &[Observation],
    ) -> BTreeMap<String, TimeSeriesView> {
        let mut sources: Vec<&str> = observations
            .iter()
            .filter(|o| o.risk_factor_id == risk_factor_id)
            .map(|o| o.source.as_str())
            .collect();
        sources.sort_unstable();
        sources.dedup();
        sources
            .into_iter()
            .map(|s| {
                (
                    s.to_string(),
                    Self::from_observations(risk_factor_id, s, start, end, observations),
                )
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.points.first().map(|p| p.date)
    }

    pub fn dates(&self) -> Vec<NaiveDate> {
        self.points.iter().map(|p| p.date).collect()
    }

    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.value).collect()
    }

    pub fn value_on(&self, date: NaiveDate) -> Option<f64> {
        self.points
            .binary_search_by_key(&date, |p| p.date)
            .ok()
            .map(|i| self.points[i].value)
    }

    /// Last print strictly before `date`.
    pub fn value_before(&self, date: NaiveDate) -> Option<SeriesPoint> {
        let idx = self.points.partition_point(|p| p.date < date);
        idx.checked_sub(1).map(|i| self.points[i])
    }

    /// Changes between consecutive prints, dated at the later print.
    /// A log return against a non-positive level yields NaN, which the
    /// rules reject as non-finite.
    pub fn changes(&self, measure: ChangeMeasure) -> Vec<(NaiveDate, f64)> {
        self.points
            .windows(2)
            .map(|w| {
                let c = match measure {
                    ChangeMeasure::Difference => w[1].value - w[0].value,
                    ChangeMeasure::LogReturn => {
                        if w[0].value > 0.0 && w[1].value > 0.0 {
                            (w[1].value / w[0].value).ln()
                        } else {
                            f64::NAN
                        }
                    }
                };
                (w[1].date, c)
            })
            .collect()
    }
}
