//! Append-only audit trail.
//!
//! RULE: Entries are never updated or deleted. Every exception transition and
//! every run lifecycle event appends exactly one entry, written in the same
//! transaction as the change it records.

use crate::error::{DqError, DqResult};
use crate::store::DqStore;
use crate::types::{AuditEntryId, ExceptionId, RunId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum AuditSubject {
    Run(RunId),
    Exception(ExceptionId),
}

impl AuditSubject {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Run(_)       => "run",
            Self::Exception(_) => "exception",
        }
    }

    pub fn id(&self) -> String {
        match self {
            Self::Run(id)       => id.clone(),
            Self::Exception(id) => id.to_string(),
        }
    }

    pub(crate) fn decode(kind: &str, id: &str) -> DqResult<Self> {
        match kind {
            "run" => Ok(Self::Run(id.to_string())),
            "exception" => id
                .parse()
                .map(Self::Exception)
                .map_err(|e| anyhow::anyhow!("bad exception id '{id}': {e}").into()),
            other => Err(anyhow::anyhow!("unknown audit subject kind '{other}'").into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    /// `None` until appended.
    pub entry_id:    Option<AuditEntryId>,
    pub subject:     AuditSubject,
    pub action:      String,
    pub actor:       String,
    pub timestamp:   DateTime<Utc>,
    pub prior_state: Option<String>,
    pub new_state:   Option<String>,
    pub comment:     Option<String>,
    /// Run during which the entry was written, if any.
    pub run_id:      Option<RunId>,
    pub details:     serde_json::Value,
}

impl AuditEntry {
    pub fn new(subject: AuditSubject, action: &str, actor: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            entry_id: None,
            subject,
            action: action.to_string(),
            actor: actor.to_string(),
            timestamp,
            prior_state: None,
            new_state: None,
            comment: None,
            run_id: None,
            details: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn states(mut self, prior: Option<&str>, new: Option<&str>) -> Self {
        self.prior_state = prior.map(str::to_string);
        self.new_state = new.map(str::to_string);
        self
    }

    pub fn comment(mut self, comment: Option<&str>) -> Self {
        self.comment = comment.map(str::to_string);
        self
    }

    pub fn in_run(mut self, run_id: &str) -> Self {
        self.run_id = Some(run_id.to_string());
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Thin handle over the store's audit table.
pub struct AuditTrail<'a> {
    store: &'a DqStore,
}

impl<'a> AuditTrail<'a> {
    pub fn new(store: &'a DqStore) -> Self {
        Self { store }
    }

    pub fn append(&self, entry: &AuditEntry) -> DqResult<AuditEntryId> {
        if entry.actor.trim().is_empty() || entry.action.trim().is_empty() {
            return Err(DqError::Config(format!(
                "audit entry for {} {} needs an actor and an action",
                entry.subject.kind(),
                entry.subject.id()
            )));
        }
        let id = self.store.insert_audit_entry(entry)?;
        log::debug!(
            "audit #{id}: {} {} {} by {}",
            entry.subject.kind(),
            entry.subject.id(),
            entry.action,
            entry.actor
        );
        Ok(id)
    }

    /// Ordered by (timestamp, entry_id).
    pub fn history(&self, subject: &AuditSubject) -> DqResult<Vec<AuditEntry>> {
        self.store.audit_history(subject)
    }
}
