//! Run orchestration for one scope and as-of date.
//!
//! Phases:
//!   1. resolve the scope's risk factors and open (or bump) the run record
//!   2. load every needed view once, peers included
//!   3. evaluate rules and reconciliation per factor (rayon, pure)
//!   4. commit factor by factor in id order, one transaction each
//!   5. finalize the run record and its lifecycle audit entries atomically
//!
//! RULE: Only phase 4 and 5 write. A failure in phase 3 stays inside its rule
//! and factor; a store failure in phase 2 or 4 aborts the rest of the run
//! but leaves already committed factors in place.

use crate::audit::{AuditEntry, AuditSubject, AuditTrail};
use crate::calendar::CalendarKind;
use crate::clock::Clock;
use crate::config::{AutoResolvePolicy, DqConfig, RiskFactorPolicy};
use crate::error::{DqError, DqResult};
use crate::exception_manager::{AppliedTransition, ExceptionManager, RunContext};
use crate::finding::Finding;
use crate::reconciliation::ReconciliationEngine;
use crate::rules::{EvaluationReport, RuleContext, RuleEngine, RuleFailure};
use crate::series::TimeSeriesView;
use crate::store::{DqStore, RiskFactorRecord, RunRecord};
use crate::types::{AssetClass, RiskFactorId, RunId, RunStatus, Severity};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RunScope {
    All,
    AssetClass(AssetClass),
    RiskFactor(RiskFactorId),
}

impl RunScope {
    /// Stable key stored on the run record: `all`, `asset_class:fx`,
    /// `risk_factor:US10Y`.
    pub fn key(&self) -> String {
        match self {
            Self::All => "all".to_string(),
            Self::AssetClass(ac) => format!("asset_class:{ac}"),
            Self::RiskFactor(id) => format!("risk_factor:{id}"),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.split_once(':') {
            None if s == "all" => Some(Self::All),
            Some(("asset_class", ac)) => AssetClass::parse(ac).map(Self::AssetClass),
            Some(("risk_factor", id)) if !id.is_empty() => Some(Self::RiskFactor(id.to_string())),
            _ => None,
        }
    }

    pub fn run_id(&self, asof: NaiveDate) -> RunId {
        format!("RUN-{}-{asof}", self.key())
    }
}

/// Cooperative cancellation, checked before each factor's commit.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FactorOutcome {
    pub risk_factor_id: RiskFactorId,
    pub findings:       usize,
    pub by_severity:    BTreeMap<Severity, usize>,
    pub transitions:    usize,
    pub skipped_rules:  usize,
    pub failed_rules:   usize,
    /// Dates on which no source had a value.
    pub skipped_dates:  usize,
    pub committed:      bool,
    pub warning:        Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunResult {
    pub run:         RunRecord,
    /// True for a rerun attempt that changed no exception.
    pub noop:        bool,
    pub transitions: Vec<AppliedTransition>,
    pub outcomes:    Vec<FactorOutcome>,
}

impl RunResult {
    pub fn status(&self) -> RunStatus {
        self.run.status
    }
}

/// Everything phase 3 needs for one factor, owned so it can cross threads.
struct EvalJob {
    rf:       RiskFactorRecord,
    policy:   RiskFactorPolicy,
    views:    BTreeMap<String, TimeSeriesView>,
    primary:  TimeSeriesView,
    peers:    BTreeMap<RiskFactorId, TimeSeriesView>,
}

struct EvalOutput {
    risk_factor_id: RiskFactorId,
    report:         EvaluationReport,
    skipped_dates:  usize,
    auto_resolve:   AutoResolvePolicy,
}

pub struct RunCoordinator<'a> {
    store:  &'a DqStore,
    config: DqConfig,
    clock:  &'a dyn Clock,
}

impl<'a> RunCoordinator<'a> {
    pub fn new(store: &'a DqStore, config: DqConfig, clock: &'a dyn Clock) -> Self {
        Self { store, config, clock }
    }

    pub fn config(&self) -> &DqConfig {
        &self.config
    }

    /// Register every configured risk factor in the store.
    pub fn register_universe(&self) -> DqResult<()> {
        self.store.atomically(|s| {
            for rf in &self.config.risk_factors {
                s.upsert_risk_factor(&rf.record())?;
            }
            Ok(())
        })
    }

    pub fn run(&self, scope: &RunScope, asof: NaiveDate) -> DqResult<RunResult> {
        self.run_with_progress(scope, asof, &CancelToken::new(), |_, _, _| {})
    }

    pub fn run_with_cancel(
        &self,
        scope: &RunScope,
        asof: NaiveDate,
        cancel: &CancelToken,
    ) -> DqResult<RunResult> {
        self.run_with_progress(scope, asof, cancel, |_, _, _| {})
    }

    /// `on_factor(index, total, outcome)` is called after each factor's
    /// commit attempt, in commit order.
    pub fn run_with_progress<F>(
        &self,
        scope: &RunScope,
        asof: NaiveDate,
        cancel: &CancelToken,
        mut on_factor: F,
    ) -> DqResult<RunResult>
    where
        F: FnMut(usize, usize, &FactorOutcome),
    {
        let factors = self.resolve_scope(scope)?;
        let run_id = scope.run_id(asof);
        let scope_key = scope.key();

        self.close_stale_attempt(&scope_key, asof)?;
        let started_at = self.clock.now();
        let mut run = self
            .store
            .begin_run_attempt(&run_id, &scope_key, asof, started_at)?;
        log::info!(
            "{run_id}: attempt {} over {} risk factors",
            run.attempt,
            factors.len()
        );

        let mut outcomes = Vec::new();
        let mut transitions = Vec::new();
        let mut abort_reason: Option<String> = None;

        match self.load_jobs(&factors, asof) {
            Ok(jobs) => {
                let outputs = self.evaluate(jobs, asof);
                let total = outputs.len();
                let manager = ExceptionManager::new(self.store, self.clock)
                    .with_max_retries(self.config.max_conflict_retries);

                for (idx, output) in outputs.into_iter().enumerate() {
                    if cancel.is_cancelled() {
                        log::warn!("{run_id}: cancelled before {}", output.risk_factor_id);
                        abort_reason = Some(format!("cancelled after {idx} of {total} risk factors"));
                        break;
                    }
                    let ctx = RunContext {
                        run_id: run_id.clone(),
                        asof,
                        actor: self.config.engine_actor.clone(),
                        auto_resolve: output.auto_resolve.clone(),
                    };
                    match self.commit_factor(&manager, &output, &ctx) {
                        Ok((outcome, applied)) => {
                            transitions.extend(applied);
                            on_factor(idx, total, &outcome);
                            outcomes.push(outcome);
                        }
                        Err(e) => {
                            log::warn!("{run_id}: aborting at {}: {e}", output.risk_factor_id);
                            abort_reason = Some(format!("{}: {e}", output.risk_factor_id));
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                log::warn!("{run_id}: failed to load views: {e}");
                abort_reason = Some(format!("load failed: {e}"));
            }
        }

        summarize(&mut run, factors.len(), &outcomes, &transitions, abort_reason);
        let noop = run.attempt > 1 && transitions.is_empty() && run.status != RunStatus::Aborted;
        run.ended_at = Some(self.clock.now());

        let finalized = self.store.atomically(|s| {
            s.finalize_run(&run)?;
            self.append_lifecycle(s, &run, started_at, noop)
        });
        if let Err(e) = finalized {
            return Err(DqError::RunAborted {
                reason: format!("{run_id}: could not record run: {e}"),
            });
        }

        log::info!(
            "{run_id}: {} ({} findings, {} transitions, {} warnings)",
            run.status,
            run.finding_count,
            run.transition_count,
            run.warnings.len()
        );
        Ok(RunResult {
            run,
            noop,
            transitions,
            outcomes,
        })
    }

    fn resolve_scope(&self, scope: &RunScope) -> DqResult<Vec<RiskFactorRecord>> {
        match scope {
            RunScope::All => self.store.list_risk_factors(None),
            RunScope::AssetClass(ac) => self.store.list_risk_factors(Some(*ac)),
            RunScope::RiskFactor(id) => match self.store.get_risk_factor(id)? {
                Some(rf) => Ok(vec![rf]),
                None => Err(DqError::UnknownRiskFactor { id: id.clone() }),
            },
        }
    }

    /// A previous attempt left RUNNING never finalized; close it out in the
    /// trail before the new attempt starts.
    fn close_stale_attempt(&self, scope_key: &str, asof: NaiveDate) -> DqResult<()> {
        let Some(prev) = self.store.get_run(scope_key, asof)? else {
            return Ok(());
        };
        if prev.status != RunStatus::Running {
            return Ok(());
        }
        log::warn!("{}: attempt {} never finished, marking aborted", prev.run_id, prev.attempt);
        let actor = self.config.engine_actor.as_str();
        let reason = format!("attempt {} did not finish", prev.attempt);
        let now = self.clock.now();
        self.store.atomically(|s| {
            let trail = AuditTrail::new(s);
            trail.append(
                &AuditEntry::new(AuditSubject::Run(prev.run_id.clone()), "run_started", actor, prev.started_at)
                    .states(None, Some(RunStatus::Running.as_str()))
                    .in_run(&prev.run_id)
                    .details(json!({ "attempt": prev.attempt })),
            )?;
            trail.append(
                &AuditEntry::new(AuditSubject::Run(prev.run_id.clone()), "run_aborted", actor, now)
                    .states(Some(RunStatus::Running.as_str()), Some(RunStatus::Aborted.as_str()))
                    .comment(Some(&reason))
                    .in_run(&prev.run_id)
                    .details(json!({ "attempt": prev.attempt })),
            )?;
            let mut closed = prev.clone();
            closed.status = RunStatus::Aborted;
            closed.ended_at = Some(now);
            closed.abort_reason = Some(reason.clone());
            s.finalize_run(&closed)
        })
    }

    fn policy_of(&self, rf: &RiskFactorRecord) -> RiskFactorPolicy {
        match self.config.risk_factor(&rf.risk_factor_id) {
            Some(cfg) => self.config.policy_for(cfg),
            None => self
                .config
                .asset_class_policies
                .get(&rf.asset_class)
                .cloned()
                .unwrap_or_default(),
        }
    }

    /// Source views of one factor and its primary view: the first priority
    /// source with data, else the first source by name.
    fn load_factor(
        &self,
        id: &str,
        priority: &[String],
        asof: NaiveDate,
    ) -> DqResult<(BTreeMap<String, TimeSeriesView>, TimeSeriesView)> {
        let start = asof - Duration::days(i64::from(self.config.lookback_days));
        let observations = self.store.observations(id, start, asof)?;
        let views = TimeSeriesView::by_source(id, start, asof, &observations);
        let primary = priority
            .iter()
            .filter_map(|s| views.get(s))
            .find(|v| !v.is_empty())
            .or_else(|| views.values().next())
            .cloned()
            .unwrap_or_else(|| {
                let source = priority.first().map(String::as_str).unwrap_or("none");
                TimeSeriesView::empty(id, source, start, asof)
            });
        Ok((views, primary))
    }

    fn load_jobs(&self, factors: &[RiskFactorRecord], asof: NaiveDate) -> DqResult<Vec<EvalJob>> {
        let mut primaries: BTreeMap<RiskFactorId, TimeSeriesView> = BTreeMap::new();
        let mut jobs = Vec::with_capacity(factors.len());

        for rf in factors {
            let policy = self.policy_of(rf);
            let (views, primary) = self.load_factor(&rf.risk_factor_id, &policy.source_priority, asof)?;
            primaries.insert(rf.risk_factor_id.clone(), primary.clone());
            jobs.push(EvalJob {
                rf: rf.clone(),
                policy,
                views,
                primary,
                peers: BTreeMap::new(),
            });
        }

        // Peers outside the scope are loaded once and shared.
        for job in &mut jobs {
            let wanted: BTreeSet<RiskFactorId> =
                job.policy.rules.iter().flat_map(|r| r.peer_ids()).collect();
            for peer in wanted {
                if !primaries.contains_key(&peer) {
                    let priority = match self.store.get_risk_factor(&peer)? {
                        Some(prf) => self.policy_of(&prf).source_priority,
                        None => Vec::new(),
                    };
                    let (_, view) = self.load_factor(&peer, &priority, asof)?;
                    primaries.insert(peer.clone(), view);
                }
                if let Some(view) = primaries.get(&peer) {
                    job.peers.insert(peer, view.clone());
                }
            }
        }
        Ok(jobs)
    }

    fn evaluate(&self, jobs: Vec<EvalJob>, asof: NaiveDate) -> Vec<EvalOutput> {
        let mut outputs: Vec<EvalOutput> = if self.config.parallel {
            jobs.par_iter().map(|job| evaluate_job(job, asof)).collect()
        } else {
            jobs.iter().map(|job| evaluate_job(job, asof)).collect()
        };
        outputs.sort_by(|a, b| a.risk_factor_id.cmp(&b.risk_factor_id));
        outputs
    }

    /// Replace the factor's findings and fold them into exceptions in one
    /// transaction. A version conflict is retried with a fresh read; once
    /// retries run out the factor is left uncommitted with a warning. Any
    /// other error is returned and aborts the run.
    fn commit_factor(
        &self,
        manager: &ExceptionManager<'_>,
        output: &EvalOutput,
        ctx: &RunContext,
    ) -> DqResult<(FactorOutcome, Vec<AppliedTransition>)> {
        let id = output.risk_factor_id.as_str();
        let findings: &[Finding] = &output.report.findings;
        let mut by_severity = BTreeMap::new();
        for f in findings {
            *by_severity.entry(f.severity).or_default() += 1;
        }
        let mut outcome = FactorOutcome {
            risk_factor_id: id.to_string(),
            findings: findings.len(),
            by_severity,
            transitions: 0,
            skipped_rules: output.report.skipped.len(),
            failed_rules: output.report.failures.len(),
            skipped_dates: output.skipped_dates,
            committed: false,
            warning: None,
        };
        let failures = describe_failures(&output.report.failures);

        let mut retries = 0;
        loop {
            let attempt = self.store.atomically(|s| {
                s.replace_findings(&ctx.run_id, id, findings)?;
                manager.apply(id, findings, ctx)
            });
            match attempt {
                Ok(applied) => {
                    log::debug!("{id}: {} findings, {} transitions", findings.len(), applied.len());
                    outcome.transitions = applied.len();
                    outcome.committed = true;
                    outcome.warning = failures;
                    return Ok((outcome, applied));
                }
                Err(DqError::PersistenceConflict { key })
                    if retries < self.config.max_conflict_retries =>
                {
                    retries += 1;
                    log::warn!("{id}: conflict on {key}, retry {retries}");
                }
                Err(DqError::PersistenceConflict { key }) => {
                    log::warn!("{id}: conflict on {key}, giving up after {retries} retries");
                    let conflict = format!("{id}: persistence conflict on {key} after {retries} retries");
                    outcome.warning = Some(match failures {
                        Some(f) => format!("{f}; {conflict}"),
                        None => conflict,
                    });
                    return Ok((outcome, Vec::new()));
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn append_lifecycle(
        &self,
        store: &DqStore,
        run: &RunRecord,
        started_at: DateTime<Utc>,
        noop: bool,
    ) -> DqResult<()> {
        let trail = AuditTrail::new(store);
        let actor = self.config.engine_actor.as_str();
        let subject = AuditSubject::Run(run.run_id.clone());
        let ended_at = run.ended_at.unwrap_or(started_at);
        let summary = json!({
            "attempt": run.attempt,
            "scope": run.scope_key,
            "asof": run.asof,
            "findings": run.finding_count,
            "transitions": run.transition_count,
            "skipped_rules": run.skipped_rules,
            "severity_counts": run.severity_counts,
            "factors_committed": run.factors_committed,
            "factors_total": run.factors_total,
        });

        if noop {
            trail.append(
                &AuditEntry::new(subject, "run_noop", actor, ended_at)
                    .states(None, Some(run.status.as_str()))
                    .in_run(&run.run_id)
                    .details(summary),
            )?;
            return Ok(());
        }

        trail.append(
            &AuditEntry::new(subject.clone(), "run_started", actor, started_at)
                .states(None, Some(RunStatus::Running.as_str()))
                .in_run(&run.run_id)
                .details(json!({ "attempt": run.attempt, "scope": run.scope_key, "asof": run.asof })),
        )?;
        let action = if run.status == RunStatus::Aborted {
            "run_aborted"
        } else {
            "run_completed"
        };
        trail.append(
            &AuditEntry::new(subject, action, actor, ended_at)
                .states(Some(RunStatus::Running.as_str()), Some(run.status.as_str()))
                .comment(run.abort_reason.as_deref())
                .in_run(&run.run_id)
                .details(summary),
        )?;
        Ok(())
    }
}

fn evaluate_job(job: &EvalJob, asof: NaiveDate) -> EvalOutput {
    let calendar: CalendarKind = job.rf.calendar;
    let ctx = RuleContext {
        view: &job.primary,
        peers: &job.peers,
        calendar,
        asof,
    };
    let mut report = RuleEngine::evaluate(&ctx, &job.policy.rules);
    let mut skipped_dates = 0;

    if let Some(recon) = &job.policy.reconciliation {
        let engine = ReconciliationEngine::new(
            &job.rf.risk_factor_id,
            recon.clone(),
            job.policy.source_priority.clone(),
        );
        let dates: Vec<NaiveDate> = job
            .views
            .values()
            .flat_map(|v| v.dates())
            .filter(|d| *d <= asof)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        match engine.reconcile_window(&job.views, &dates, calendar) {
            Ok(recon_report) => {
                skipped_dates = recon_report.skipped_dates.len();
                report.findings.extend(recon_report.findings);
            }
            Err(e) => {
                log::warn!("{}: reconciliation failed: {e}", job.rf.risk_factor_id);
                report.failures.push(RuleFailure {
                    risk_factor_id: job.rf.risk_factor_id.clone(),
                    rule_code: engine.rule_code().to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }

    EvalOutput {
        risk_factor_id: job.rf.risk_factor_id.clone(),
        report,
        skipped_dates,
        auto_resolve: job.policy.auto_resolve.clone(),
    }
}

fn describe_failures(failures: &[RuleFailure]) -> Option<String> {
    if failures.is_empty() {
        return None;
    }
    Some(
        failures
            .iter()
            .map(|f| format!("{}: {} failed: {}", f.risk_factor_id, f.rule_code, f.reason))
            .collect::<Vec<_>>()
            .join("; "),
    )
}

fn summarize(
    run: &mut RunRecord,
    factors_total: usize,
    outcomes: &[FactorOutcome],
    transitions: &[AppliedTransition],
    abort_reason: Option<String>,
) {
    run.factors_total = factors_total;
    run.factors_committed = outcomes.iter().filter(|o| o.committed).count();
    run.finding_count = outcomes.iter().filter(|o| o.committed).map(|o| o.findings).sum();
    run.severity_counts = BTreeMap::new();
    for o in outcomes.iter().filter(|o| o.committed) {
        for (severity, n) in &o.by_severity {
            *run.severity_counts.entry(*severity).or_default() += n;
        }
    }
    run.skipped_rules = outcomes.iter().map(|o| o.skipped_rules).sum();
    run.transition_count = transitions.len();
    run.transition_counts = BTreeMap::new();
    for t in transitions {
        *run.transition_counts.entry(t.kind.as_str().to_string()).or_default() += 1;
    }
    run.warnings = outcomes.iter().filter_map(|o| o.warning.clone()).collect();
    run.status = match &abort_reason {
        Some(_) => RunStatus::Aborted,
        None if !run.warnings.is_empty() => RunStatus::CompletedWithWarnings,
        None => RunStatus::Completed,
    };
    run.abort_reason = abort_reason;
}
