//! Audit trail persistence. Insert and select only; the schema's triggers
//! reject UPDATE and DELETE.

use super::DqStore;
use crate::{
    audit::{AuditEntry, AuditSubject},
    error::DqResult,
    types::AuditEntryId,
};
use rusqlite::params;

const AUDIT_COLUMNS: &str = "entry_id, subject_kind, subject_id, action, actor, timestamp,
    prior_state, new_state, comment, run_id, details";

impl DqStore {
    pub fn insert_audit_entry(&self, entry: &AuditEntry) -> DqResult<AuditEntryId> {
        self.conn.execute(
            "INSERT INTO audit_entry
                (subject_kind, subject_id, action, actor, timestamp, prior_state,
                 new_state, comment, run_id, details)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                entry.subject.kind(),
                entry.subject.id(),
                entry.action,
                entry.actor,
                entry.timestamp,
                entry.prior_state,
                entry.new_state,
                entry.comment,
                entry.run_id,
                serde_json::to_string(&entry.details)?,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Entries about `subject`, ordered by (timestamp, entry_id). For a run
    /// this also includes every entry written under that run's context.
    pub fn audit_history(&self, subject: &AuditSubject) -> DqResult<Vec<AuditEntry>> {
        let sql = match subject {
            AuditSubject::Run(_) => format!(
                "SELECT {AUDIT_COLUMNS} FROM audit_entry
                 WHERE (subject_kind=?1 AND subject_id=?2) OR run_id=?2
                 ORDER BY timestamp, entry_id"
            ),
            AuditSubject::Exception(_) => format!(
                "SELECT {AUDIT_COLUMNS} FROM audit_entry
                 WHERE subject_kind=?1 AND subject_id=?2
                 ORDER BY timestamp, entry_id"
            ),
        };
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![subject.kind(), subject.id()], |r| {
            Ok((
                r.get::<_, AuditEntryId>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                AuditEntry {
                    entry_id: None,
                    subject: AuditSubject::Run(String::new()),
                    action: r.get(3)?,
                    actor: r.get(4)?,
                    timestamp: r.get(5)?,
                    prior_state: r.get(6)?,
                    new_state: r.get(7)?,
                    comment: r.get(8)?,
                    run_id: r.get(9)?,
                    details: serde_json::Value::Null,
                },
                r.get::<_, String>(10)?,
            ))
        })?;
        let mut result = Vec::new();
        for r in rows {
            let (id, kind, subject_id, mut entry, details) = r?;
            entry.entry_id = Some(id);
            entry.subject = AuditSubject::decode(&kind, &subject_id)?;
            entry.details = serde_json::from_str(&details)?;
            result.push(entry);
        }
        Ok(result)
    }

    pub fn audit_entry_count(&self) -> DqResult<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM audit_entry", [], |r| r.get(0))?)
    }
}
