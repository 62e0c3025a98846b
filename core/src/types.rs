//! Shared primitive types used across the DQ core.

use serde::{Deserialize, Serialize};

pub type RiskFactorId = String;

/// SQLite row id of a `dq_exception`.
pub type ExceptionId = i64;

/// SQLite row id of an `audit_entry`.
pub type AuditEntryId = i64;

/// Deterministic run identifier: `RUN-{scope}-{asof}`.
pub type RunId = String;

/// Enums persisted as TEXT. The literal must match the serde snake_case name.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }

            pub fn parse(s: &str) -> Option<Self> {
                match s {
                    $($text => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.pad(self.as_str())
            }
        }

        impl rusqlite::types::ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
                Ok(rusqlite::types::ToSqlOutput::from(self.as_str()))
            }
        }

        impl rusqlite::types::FromSql for $name {
            fn column_result(
                value: rusqlite::types::ValueRef<'_>,
            ) -> rusqlite::types::FromSqlResult<Self> {
                let s = value.as_str()?;
                Self::parse(s).ok_or_else(|| {
                    let msg = format!("unknown {} '{}'", stringify!($name), s);
                    rusqlite::types::FromSqlError::Other(msg.into())
                })
            }
        }
    };
}
pub(crate) use text_enum;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AssetClass {
    Rates,
    Fx,
    Equities,
    Commodities,
}

text_enum!(AssetClass {
    Rates => "rates",
    Fx => "fx",
    Equities => "equities",
    Commodities => "commodities",
});

/// Ordered: a merge or extension always keeps the maximum.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

text_enum!(Severity {
    Low => "low",
    Medium => "medium",
    High => "high",
    Critical => "critical",
});

impl Severity {
    /// Bands over the 1..=100 rule score.
    pub fn from_score(score: u8) -> Self {
        match score {
            0..=49 => Self::Low,
            50..=69 => Self::Medium,
            70..=84 => Self::High,
            _ => Self::Critical,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SuggestedAction {
    Review,
    Winsorize,
    Remove,
    Interpolate,
    SourceSwitch,
}

text_enum!(SuggestedAction {
    Review => "review",
    Winsorize => "winsorize",
    Remove => "remove",
    Interpolate => "interpolate",
    SourceSwitch => "source_switch",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionState {
    Open,
    UnderReview,
    Resolved,
    Accepted,
    FalsePositive,
}

text_enum!(ExceptionState {
    Open => "open",
    UnderReview => "under_review",
    Resolved => "resolved",
    Accepted => "accepted",
    FalsePositive => "false_positive",
});

impl ExceptionState {
    /// OPEN or UNDER_REVIEW: at most one per (risk_factor_id, rule_code).
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Open | Self::UnderReview)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    /// Transitions an analyst may request. Auto-resolution is not listed here;
    /// it is driven by the exception manager only.
    pub fn analyst_can_move_to(&self, to: ExceptionState) -> bool {
        matches!(
            (self, to),
            (Self::Open, Self::UnderReview)
                | (Self::UnderReview, Self::Resolved)
                | (Self::UnderReview, Self::Accepted)
                | (Self::UnderReview, Self::FalsePositive)
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    CompletedWithWarnings,
    Aborted,
}

text_enum!(RunStatus {
    Running => "running",
    Completed => "completed",
    CompletedWithWarnings => "completed_with_warnings",
    Aborted => "aborted",
});
