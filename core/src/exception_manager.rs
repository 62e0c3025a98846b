//! Exception lifecycle: folds each run's findings into tracked exceptions and
//! is the only entry point for analyst transitions.
//!
//! RULE: Exception state changes only here. Each change writes its audit
//! entry through the same store handle, so a caller that wraps a call in
//! `DqStore::atomically` gets both or neither.
//!
//! State machine:
//!   OPEN -> UNDER_REVIEW (analyst claims)
//!   UNDER_REVIEW -> RESOLVED | ACCEPTED | FALSE_POSITIVE (analyst, comment required)
//!   OPEN | UNDER_REVIEW -> RESOLVED (auto, after enough quiet runs)
//! Terminal states are never left. A recurrence after closure opens a new
//! exception that points back at the closed one.

use crate::audit::{AuditEntry, AuditSubject, AuditTrail};
use crate::clock::Clock;
use crate::config::AutoResolvePolicy;
use crate::error::{DqError, DqResult};
use crate::finding::Finding;
use crate::store::{DqStore, ExceptionRecord, NewException};
use crate::types::{
    text_enum, ExceptionId, ExceptionState, RiskFactorId, RunId, Severity, SuggestedAction,
};
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Created,
    Reopened,
    Updated,
    Claimed,
    Resolved,
    Accepted,
    FalsePositive,
    AutoResolved,
}

text_enum!(TransitionKind {
    Created => "created",
    Reopened => "reopened",
    Updated => "updated",
    Claimed => "claimed",
    Resolved => "resolved",
    Accepted => "accepted",
    FalsePositive => "false_positive",
    AutoResolved => "auto_resolved",
});

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppliedTransition {
    pub exception_id:   ExceptionId,
    pub risk_factor_id: RiskFactorId,
    pub rule_code:      String,
    pub kind:           TransitionKind,
    pub prior_state:    Option<ExceptionState>,
    pub new_state:      ExceptionState,
    pub severity:       Severity,
}

/// Per-run inputs to `apply`.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id:       RunId,
    pub asof:         NaiveDate,
    pub actor:        String,
    pub auto_resolve: AutoResolvePolicy,
}

/// Summary of one rule's findings for a factor within a run.
struct FindingSpan {
    start:    NaiveDate,
    end:      NaiveDate,
    score:    u8,
    severity: Severity,
    action:   SuggestedAction,
    count:    usize,
}

impl FindingSpan {
    fn of<'f>(findings: impl IntoIterator<Item = &'f Finding>) -> Option<Self> {
        let mut span: Option<Self> = None;
        for f in findings {
            match &mut span {
                None => {
                    span = Some(Self {
                        start: f.start,
                        end: f.end,
                        score: f.score,
                        severity: f.severity,
                        action: f.suggested_action,
                        count: 1,
                    })
                }
                Some(s) => {
                    s.start = s.start.min(f.start);
                    s.end = s.end.max(f.end);
                    s.severity = s.severity.max(f.severity);
                    if f.score > s.score {
                        s.score = f.score;
                        s.action = f.suggested_action;
                    }
                    s.count += 1;
                }
            }
        }
        span
    }
}

pub struct ExceptionManager<'a> {
    store:       &'a DqStore,
    clock:       &'a dyn Clock,
    max_retries: u32,
}

impl<'a> ExceptionManager<'a> {
    pub fn new(store: &'a DqStore, clock: &'a dyn Clock) -> Self {
        Self {
            store,
            clock,
            max_retries: 3,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Fold one factor's findings for a run into its exceptions, then age
    /// the factor's exceptions that did not recur. Does not open a
    /// transaction; the run coordinator wraps each factor's commit.
    pub fn apply(
        &self,
        risk_factor_id: &str,
        findings: &[Finding],
        ctx: &RunContext,
    ) -> DqResult<Vec<AppliedTransition>> {
        let mut by_rule: BTreeMap<&str, Vec<&Finding>> = BTreeMap::new();
        for f in findings.iter().filter(|f| f.risk_factor_id == risk_factor_id) {
            by_rule.entry(f.rule_code.as_str()).or_default().push(f);
        }

        let mut transitions = Vec::new();
        let mut recurred: BTreeSet<String> = BTreeSet::new();

        for (rule_code, group) in by_rule {
            match self.store.active_exception(risk_factor_id, rule_code)? {
                Some(active) => {
                    // A superseding exception never grows back over the closed one.
                    let closed = self.store.latest_closed_exception(risk_factor_id, rule_code)?;
                    let Some(span) = span_after(&group, closed.as_ref()) else {
                        continue;
                    };
                    let (updated, extended) = self.extend(&active, &span, ctx)?;
                    if extended {
                        recurred.insert(rule_code.to_string());
                    }
                    if let Some(t) = updated {
                        transitions.push(t);
                    }
                }
                None => {
                    if let Some(t) = self.open(risk_factor_id, rule_code, &group, ctx)? {
                        recurred.insert(rule_code.to_string());
                        transitions.push(t);
                    }
                }
            }
        }

        transitions.extend(self.age_quiet(risk_factor_id, &recurred, ctx)?);
        Ok(transitions)
    }

    /// Returns the `updated` transition, if the window or severity changed,
    /// and whether the window end moved forward.
    fn extend(
        &self,
        active: &ExceptionRecord,
        span: &FindingSpan,
        ctx: &RunContext,
    ) -> DqResult<(Option<AppliedTransition>, bool)> {
        let mut rec = active.clone();
        rec.window_start = rec.window_start.min(span.start);
        rec.window_end = rec.window_end.max(span.end);
        rec.severity = rec.severity.max(span.severity);
        if span.score > rec.peak_score {
            rec.peak_score = span.score;
            rec.suggested_action = span.action;
        }
        rec.last_seen = rec.last_seen.max(ctx.asof);

        let extended = rec.window_end > active.window_end;
        if extended {
            rec.quiet_runs = 0;
            rec.last_run_asof = rec.last_run_asof.max(ctx.asof);
        }
        if rec == *active {
            return Ok((None, extended));
        }
        let stored = self.store.update_exception(&rec)?;

        let window_changed =
            rec.window_start != active.window_start || rec.window_end != active.window_end;
        let severity_changed = rec.severity != active.severity;
        if !(window_changed || severity_changed) {
            return Ok((None, extended));
        }

        log::debug!(
            "exception {} {}/{} window {}..{} severity {}",
            stored.exception_id,
            stored.risk_factor_id,
            stored.rule_code,
            stored.window_start,
            stored.window_end,
            stored.severity
        );
        let state = stored.state.as_str();
        self.audit(
            &stored,
            TransitionKind::Updated,
            &ctx.actor,
            Some(state),
            Some(state),
            Some(&ctx.run_id),
            json!({
                "window_start": stored.window_start,
                "window_end": stored.window_end,
                "prior_window_start": active.window_start,
                "prior_window_end": active.window_end,
                "severity": stored.severity,
                "prior_severity": active.severity,
                "peak_score": stored.peak_score,
            }),
        )?;
        Ok((
            Some(transition_of(&stored, TransitionKind::Updated, Some(active.state))),
            extended,
        ))
    }

    /// No active exception for the key: create one, or supersede the latest
    /// closed one if the findings reach past its window. Findings already
    /// covered by a closed window are left alone.
    fn open(
        &self,
        risk_factor_id: &str,
        rule_code: &str,
        group: &[&Finding],
        ctx: &RunContext,
    ) -> DqResult<Option<AppliedTransition>> {
        let closed = self.store.latest_closed_exception(risk_factor_id, rule_code)?;
        let Some(span) = span_after(group, closed.as_ref()) else {
            return Ok(None);
        };
        let (kind, supersedes) = match &closed {
            Some(c) => (TransitionKind::Reopened, Some(c.exception_id)),
            None => (TransitionKind::Created, None),
        };

        let created = self.store.insert_exception(&NewException {
            risk_factor_id: risk_factor_id.to_string(),
            rule_code: rule_code.to_string(),
            window_start: span.start,
            window_end: span.end,
            severity: span.severity,
            peak_score: span.score,
            suggested_action: span.action,
            asof: ctx.asof,
            supersedes,
        })?;
        log::info!(
            "{kind} exception {} for {risk_factor_id}/{rule_code} [{}..{}] {}",
            created.exception_id,
            span.start,
            span.end,
            span.severity
        );
        self.audit(
            &created,
            kind,
            &ctx.actor,
            None,
            Some(ExceptionState::Open.as_str()),
            Some(&ctx.run_id),
            json!({
                "window_start": created.window_start,
                "window_end": created.window_end,
                "severity": created.severity,
                "peak_score": created.peak_score,
                "suggested_action": created.suggested_action,
                "findings": span.count,
                "supersedes": supersedes,
            }),
        )?;
        Ok(Some(transition_of(&created, kind, None)))
    }

    /// Count a quiet run for every active exception of the factor that did not
    /// recur and has not yet been evaluated at this as-of, and auto-resolve
    /// those that have been quiet long enough.
    fn age_quiet(
        &self,
        risk_factor_id: &str,
        recurred: &BTreeSet<String>,
        ctx: &RunContext,
    ) -> DqResult<Vec<AppliedTransition>> {
        let mut transitions = Vec::new();
        for mut rec in self.store.active_exceptions_for(risk_factor_id)? {
            if recurred.contains(&rec.rule_code) || ctx.asof <= rec.last_run_asof {
                continue;
            }
            let prior = rec.state;
            rec.quiet_runs += 1;
            rec.last_run_asof = ctx.asof;

            let resolve = ctx.auto_resolve.allows(&rec.rule_code)
                && rec.quiet_runs >= ctx.auto_resolve.quiet_runs;
            if resolve {
                rec.state = ExceptionState::Resolved;
            }
            let stored = self.store.update_exception(&rec)?;
            if resolve {
                log::info!(
                    "auto-resolved exception {} {}/{} after {} quiet runs",
                    stored.exception_id,
                    stored.risk_factor_id,
                    stored.rule_code,
                    stored.quiet_runs
                );
                self.audit(
                    &stored,
                    TransitionKind::AutoResolved,
                    &ctx.actor,
                    Some(prior.as_str()),
                    Some(stored.state.as_str()),
                    Some(&ctx.run_id),
                    json!({ "quiet_runs": stored.quiet_runs }),
                )?;
                transitions.push(transition_of(&stored, TransitionKind::AutoResolved, Some(prior)));
            }
        }
        Ok(transitions)
    }

    /// Analyst transition. Validated against the state machine, checked
    /// against the stored version, and audited in the same transaction.
    /// Retries on a version conflict with a fresh read.
    pub fn transition(
        &self,
        exception_id: ExceptionId,
        new_state: ExceptionState,
        actor: &str,
        comment: Option<&str>,
    ) -> DqResult<ExceptionRecord> {
        let mut attempt = 0;
        loop {
            let result = self.store.atomically(|store| {
                let current = store
                    .get_exception(exception_id)?
                    .ok_or(DqError::ExceptionNotFound { id: exception_id })?;
                if !current.state.analyst_can_move_to(new_state) {
                    return Err(DqError::IllegalTransition {
                        from: current.state,
                        to: new_state,
                    });
                }
                let comment = comment.map(str::trim).filter(|c| !c.is_empty());
                if new_state.is_terminal() && comment.is_none() {
                    return Err(DqError::CommentRequired { to: new_state });
                }
                let kind = match new_state {
                    ExceptionState::UnderReview   => TransitionKind::Claimed,
                    ExceptionState::Resolved      => TransitionKind::Resolved,
                    ExceptionState::Accepted      => TransitionKind::Accepted,
                    ExceptionState::FalsePositive => TransitionKind::FalsePositive,
                    ExceptionState::Open => {
                        return Err(DqError::IllegalTransition {
                            from: current.state,
                            to: new_state,
                        })
                    }
                };
                let stored = store.update_exception(&ExceptionRecord {
                    state: new_state,
                    ..current.clone()
                })?;
                let entry = AuditEntry::new(
                    AuditSubject::Exception(exception_id),
                    kind.as_str(),
                    actor,
                    self.clock.now(),
                )
                .states(Some(current.state.as_str()), Some(new_state.as_str()))
                .comment(comment)
                .details(json!({ "version": stored.version }));
                AuditTrail::new(store).append(&entry)?;
                Ok(stored)
            });
            match result {
                Err(DqError::PersistenceConflict { key }) if attempt < self.max_retries => {
                    attempt += 1;
                    log::warn!("conflict on {key}, retrying transition ({attempt})");
                }
                Ok(stored) => {
                    log::info!(
                        "exception {exception_id} -> {} by {actor}",
                        stored.state
                    );
                    return Ok(stored);
                }
                Err(e) => return Err(e),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn audit(
        &self,
        rec: &ExceptionRecord,
        kind: TransitionKind,
        actor: &str,
        prior: Option<&str>,
        new: Option<&str>,
        run_id: Option<&str>,
        details: serde_json::Value,
    ) -> DqResult<()> {
        let mut entry = AuditEntry::new(
            AuditSubject::Exception(rec.exception_id),
            kind.as_str(),
            actor,
            self.clock.now(),
        )
        .states(prior, new)
        .details(details);
        if let Some(run_id) = run_id {
            entry = entry.in_run(run_id);
        }
        AuditTrail::new(self.store).append(&entry)?;
        Ok(())
    }
}

/// Span of the findings that reach past `closed`, starting the day after its
/// window. With no closed exception every finding counts.
fn span_after(group: &[&Finding], closed: Option<&ExceptionRecord>) -> Option<FindingSpan> {
    match closed {
        Some(c) => {
            let mut span = FindingSpan::of(group.iter().copied().filter(|f| f.end > c.window_end))?;
            span.start = span.start.max(c.window_end + Duration::days(1));
            Some(span)
        }
        None => FindingSpan::of(group.iter().copied()),
    }
}

fn transition_of(
    rec: &ExceptionRecord,
    kind: TransitionKind,
    prior_state: Option<ExceptionState>,
) -> AppliedTransition {
    AppliedTransition {
        exception_id: rec.exception_id,
        risk_factor_id: rec.risk_factor_id.clone(),
        rule_code: rec.rule_code.clone(),
        kind,
        prior_state,
        new_state: rec.state,
        severity: rec.severity,
    }
}
