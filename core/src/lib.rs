//! Market-data quality core: rule and reconciliation engines, the exception
//! lifecycle, and its append-only audit trail, persisted in SQLite.

pub mod audit;
pub mod calendar;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod exception_manager;
pub mod finding;
pub mod reconciliation;
pub mod reporting;
pub mod rng;
pub mod rules;
pub mod series;
pub mod stats;
pub mod store;
pub mod synthetic;
pub mod types;
