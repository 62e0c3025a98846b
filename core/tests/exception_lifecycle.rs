//! Exception lifecycle tests.
//!
//! Tests cover: creation and audit, de-duplication and extension, the analyst
//! state machine, supersession after closure, auto-resolution after quiet
//! runs, and optimistic-concurrency conflicts.

use chrono::{NaiveDate, TimeZone, Utc};
use riskdq_core::{
    audit::AuditSubject,
    clock::FixedClock,
    config::AutoResolvePolicy,
    error::DqError,
    exception_manager::{ExceptionManager, RunContext, TransitionKind},
    finding::Finding,
    rules::{SPIKE, STALE},
    store::{DqStore, ExceptionFilter, NewException},
    types::{ExceptionState, Severity, SuggestedAction},
};
use serde_json::json;

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

fn build() -> (DqStore, FixedClock) {
    let store = DqStore::in_memory().expect("in-memory store");
    store.migrate().expect("migrate");
    let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 3, 5, 18, 0, 0).unwrap());
    (store, clock)
}

fn ctx(asof: NaiveDate) -> RunContext {
    RunContext {
        run_id: format!("RUN-test-{asof}"),
        asof,
        actor: "dq-engine".into(),
        auto_resolve: AutoResolvePolicy::default(),
    }
}

fn spike(date: NaiveDate, score: f64) -> Finding {
    Finding::on("US10Y", SPIKE, date, score, SuggestedAction::Winsorize, json!({}))
}

fn all(store: &DqStore) -> Vec<riskdq_core::store::ExceptionRecord> {
    store.list_exceptions(&ExceptionFilter::default()).unwrap()
}

// ── Creation and de-duplication ───────────────────────────────────────────────

#[test]
fn first_finding_opens_an_exception_with_one_audit_entry() {
    let (store, clock) = build();
    let manager = ExceptionManager::new(&store, &clock);
    let day = d(2024, 3, 5);

    let transitions = manager.apply("US10Y", &[spike(day, 90.0)], &ctx(day)).unwrap();
    assert_eq!(transitions.len(), 1);
    assert_eq!(transitions[0].kind, TransitionKind::Created);
    assert_eq!(transitions[0].prior_state, None);

    let exceptions = all(&store);
    assert_eq!(exceptions.len(), 1);
    let e = &exceptions[0];
    assert_eq!(e.state, ExceptionState::Open);
    assert_eq!((e.window_start, e.window_end), (day, day));
    assert_eq!(e.severity, Severity::Critical);
    assert_eq!(e.peak_score, 90);
    assert_eq!(e.first_seen, day);
    assert_eq!(e.version, 1);

    let history = store.audit_history(&AuditSubject::Exception(e.exception_id)).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].action, "created");
    assert_eq!(history[0].prior_state, None);
    assert_eq!(history[0].new_state.as_deref(), Some("open"));
    assert_eq!(history[0].run_id.as_deref(), Some("RUN-test-2024-03-05"));
}

#[test]
fn adjacent_finding_extends_the_active_exception() {
    let (store, clock) = build();
    let manager = ExceptionManager::new(&store, &clock);
    let (d1, d2) = (d(2024, 3, 5), d(2024, 3, 6));

    manager.apply("US10Y", &[spike(d1, 60.0)], &ctx(d1)).unwrap();
    let transitions = manager.apply("US10Y", &[spike(d1, 60.0), spike(d2, 75.0)], &ctx(d2)).unwrap();
    assert_eq!(transitions.len(), 1);
    assert_eq!(transitions[0].kind, TransitionKind::Updated);

    let exceptions = all(&store);
    assert_eq!(exceptions.len(), 1, "no duplicate exception for the same key");
    let e = &exceptions[0];
    assert_eq!((e.window_start, e.window_end), (d1, d2));
    assert_eq!(e.severity, Severity::High);
    assert_eq!(e.peak_score, 75);
    assert_eq!(e.last_seen, d2);
    assert_eq!(e.quiet_runs, 0);

    let history = store.audit_history(&AuditSubject::Exception(e.exception_id)).unwrap();
    let actions: Vec<&str> = history.iter().map(|h| h.action.as_str()).collect();
    assert_eq!(actions, vec!["created", "updated"]);
}

#[test]
fn reapplying_the_same_findings_changes_nothing() {
    let (store, clock) = build();
    let manager = ExceptionManager::new(&store, &clock);
    let day = d(2024, 3, 5);

    manager.apply("US10Y", &[spike(day, 90.0)], &ctx(day)).unwrap();
    let before = all(&store);
    let transitions = manager.apply("US10Y", &[spike(day, 90.0)], &ctx(day)).unwrap();
    assert!(transitions.is_empty(), "transitions: {transitions:?}");
    assert_eq!(all(&store), before);
    assert_eq!(store.audit_entry_count().unwrap(), 1);
}

#[test]
fn rules_are_tracked_separately() {
    let (store, clock) = build();
    let manager = ExceptionManager::new(&store, &clock);
    let day = d(2024, 3, 5);
    let stale = Finding::on("US10Y", STALE, day, 90.0, SuggestedAction::Review, json!({}));

    let transitions = manager.apply("US10Y", &[spike(day, 90.0), stale], &ctx(day)).unwrap();
    assert_eq!(transitions.len(), 2);
    assert_eq!(all(&store).len(), 2);
}

// ── Analyst state machine ─────────────────────────────────────────────────────

fn open_one(store: &DqStore, clock: &FixedClock) -> i64 {
    let day = d(2024, 3, 5);
    ExceptionManager::new(store, clock)
        .apply("US10Y", &[spike(day, 90.0)], &ctx(day))
        .unwrap()[0]
        .exception_id
}

#[test]
fn open_cannot_jump_straight_to_a_terminal_state() {
    let (store, clock) = build();
    let id = open_one(&store, &clock);
    let manager = ExceptionManager::new(&store, &clock);

    let err = manager
        .transition(id, ExceptionState::Resolved, "alice", Some("fixed upstream"))
        .unwrap_err();
    assert!(
        matches!(err, DqError::IllegalTransition { from: ExceptionState::Open, to: ExceptionState::Resolved }),
        "got {err:?}"
    );
    assert_eq!(store.get_exception(id).unwrap().unwrap().state, ExceptionState::Open);
}

#[test]
fn claim_then_accept_with_comment() {
    let (store, clock) = build();
    let id = open_one(&store, &clock);
    let manager = ExceptionManager::new(&store, &clock);

    let claimed = manager.transition(id, ExceptionState::UnderReview, "alice", None).unwrap();
    assert_eq!(claimed.state, ExceptionState::UnderReview);
    assert_eq!(claimed.version, 2);

    let err = manager
        .transition(id, ExceptionState::Accepted, "alice", Some("   "))
        .unwrap_err();
    assert!(matches!(err, DqError::CommentRequired { .. }), "got {err:?}");

    let accepted = manager
        .transition(id, ExceptionState::Accepted, "alice", Some("known vendor holiday print"))
        .unwrap();
    assert_eq!(accepted.state, ExceptionState::Accepted);

    let history = store.audit_history(&AuditSubject::Exception(id)).unwrap();
    let actions: Vec<&str> = history.iter().map(|h| h.action.as_str()).collect();
    assert_eq!(actions, vec!["created", "claimed", "accepted"]);
    let last = &history[2];
    assert_eq!(last.actor, "alice");
    assert_eq!(last.prior_state.as_deref(), Some("under_review"));
    assert_eq!(last.new_state.as_deref(), Some("accepted"));
    assert_eq!(last.comment.as_deref(), Some("known vendor holiday print"));
}

#[test]
fn terminal_states_are_never_left() {
    let (store, clock) = build();
    let id = open_one(&store, &clock);
    let manager = ExceptionManager::new(&store, &clock);
    manager.transition(id, ExceptionState::UnderReview, "alice", None).unwrap();
    manager
        .transition(id, ExceptionState::FalsePositive, "alice", Some("roll date"))
        .unwrap();

    for target in [ExceptionState::Open, ExceptionState::UnderReview, ExceptionState::Resolved] {
        let err = manager
            .transition(id, target, "bob", Some("reopen please"))
            .unwrap_err();
        assert!(matches!(err, DqError::IllegalTransition { .. }), "{target}: got {err:?}");
    }
    assert_eq!(
        store.audit_history(&AuditSubject::Exception(id)).unwrap().len(),
        3,
        "rejected transitions write no audit entries"
    );
}

#[test]
fn unknown_exception_is_not_found() {
    let (store, clock) = build();
    let err = ExceptionManager::new(&store, &clock)
        .transition(999, ExceptionState::UnderReview, "alice", None)
        .unwrap_err();
    assert!(matches!(err, DqError::ExceptionNotFound { id: 999 }), "got {err:?}");
}

// ── Recurrence after closure ──────────────────────────────────────────────────

#[test]
fn recurrence_after_closure_supersedes_the_closed_exception() {
    let (store, clock) = build();
    let manager = ExceptionManager::new(&store, &clock);
    let (d1, d2, d3) = (d(2024, 3, 5), d(2024, 3, 6), d(2024, 3, 7));

    let id = open_one(&store, &clock);
    manager.transition(id, ExceptionState::UnderReview, "alice", None).unwrap();
    manager
        .transition(id, ExceptionState::Resolved, "alice", Some("vendor corrected"))
        .unwrap();
    let closed = store.get_exception(id).unwrap().unwrap();

    // Still inside the closed window: nothing happens.
    let none = manager.apply("US10Y", &[spike(d1, 90.0)], &ctx(d2)).unwrap();
    assert!(none.is_empty(), "transitions: {none:?}");
    assert_eq!(all(&store).len(), 1);

    // Past it: a new exception that points back.
    let reopened = manager.apply("US10Y", &[spike(d1, 90.0), spike(d3, 70.0)], &ctx(d3)).unwrap();
    assert_eq!(reopened.len(), 1);
    assert_eq!(reopened[0].kind, TransitionKind::Reopened);

    let fresh = store.get_exception(reopened[0].exception_id).unwrap().unwrap();
    assert_eq!(fresh.supersedes, Some(id));
    assert_eq!(fresh.state, ExceptionState::Open);
    assert_eq!((fresh.window_start, fresh.window_end), (d3, d3));
    assert_eq!(store.get_exception(id).unwrap().unwrap(), closed, "closed record untouched");
}

#[test]
fn recurrence_window_is_clipped_after_the_closed_one() {
    let (store, clock) = build();
    let manager = ExceptionManager::new(&store, &clock);
    let id = open_one(&store, &clock);
    manager.transition(id, ExceptionState::UnderReview, "alice", None).unwrap();
    manager.transition(id, ExceptionState::Accepted, "alice", Some("ok")).unwrap();

    let wide = Finding::spanning(
        "US10Y",
        SPIKE,
        d(2024, 3, 4),
        d(2024, 3, 7),
        4,
        80.0,
        SuggestedAction::Review,
        json!({}),
    );
    let t = manager.apply("US10Y", &[wide], &ctx(d(2024, 3, 7))).unwrap();
    let fresh = store.get_exception(t[0].exception_id).unwrap().unwrap();
    assert_eq!((fresh.window_start, fresh.window_end), (d(2024, 3, 6), d(2024, 3, 7)));
}

/// The closed defect's prints stay in the lookback on later runs. They must
/// not drag the superseding exception's window or severity back over it.
#[test]
fn superseding_exception_does_not_regrow_over_the_closed_window() {
    let (store, clock) = build();
    let manager = ExceptionManager::new(&store, &clock);
    let (d1, d3, d4) = (d(2024, 3, 5), d(2024, 3, 7), d(2024, 3, 8));

    let id = open_one(&store, &clock);
    manager.transition(id, ExceptionState::UnderReview, "alice", None).unwrap();
    manager
        .transition(id, ExceptionState::Resolved, "alice", Some("vendor corrected"))
        .unwrap();

    let findings = [spike(d1, 90.0), spike(d3, 60.0)];
    let reopened = manager.apply("US10Y", &findings, &ctx(d3)).unwrap();
    assert_eq!(reopened.len(), 1);
    assert_eq!(reopened[0].kind, TransitionKind::Reopened);
    let new_id = reopened[0].exception_id;
    let before = store.get_exception(new_id).unwrap().unwrap();
    assert_eq!((before.window_start, before.window_end), (d3, d3));
    assert_eq!(before.severity, Severity::Medium);

    let next = manager.apply("US10Y", &findings, &ctx(d4)).unwrap();
    assert!(next.is_empty(), "transitions: {next:?}");

    let after = store.get_exception(new_id).unwrap().unwrap();
    assert_eq!(
        (after.window_start, after.window_end),
        (d3, d3),
        "window regrew: {}..{}",
        after.window_start,
        after.window_end
    );
    assert_eq!(after.severity, Severity::Medium);
    assert_eq!(after.peak_score, 60);

    let actions: Vec<String> = store
        .audit_history(&AuditSubject::Exception(new_id))
        .unwrap()
        .into_iter()
        .map(|h| h.action)
        .collect();
    assert_eq!(actions, vec!["reopened"]);
}

// ── Auto-resolution ───────────────────────────────────────────────────────────

#[test]
fn quiet_runs_auto_resolve_after_the_policy_count() {
    let (store, clock) = build();
    let manager = ExceptionManager::new(&store, &clock);
    let id = open_one(&store, &clock);

    // The original finding stays in the lookback but does not extend the window.
    let old = [spike(d(2024, 3, 5), 90.0)];
    assert!(manager.apply("US10Y", &old, &ctx(d(2024, 3, 6))).unwrap().is_empty());
    // Same as-of again: no double count.
    assert!(manager.apply("US10Y", &old, &ctx(d(2024, 3, 6))).unwrap().is_empty());
    assert_eq!(store.get_exception(id).unwrap().unwrap().quiet_runs, 1);

    assert!(manager.apply("US10Y", &[], &ctx(d(2024, 3, 7))).unwrap().is_empty());
    let resolved = manager.apply("US10Y", &[], &ctx(d(2024, 3, 8))).unwrap();
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].kind, TransitionKind::AutoResolved);
    assert_eq!(resolved[0].prior_state, Some(ExceptionState::Open));

    let e = store.get_exception(id).unwrap().unwrap();
    assert_eq!(e.state, ExceptionState::Resolved);
    assert_eq!(e.quiet_runs, 3);

    let history = store.audit_history(&AuditSubject::Exception(id)).unwrap();
    let last = history.last().unwrap();
    assert_eq!(last.action, "auto_resolved");
    assert_eq!(last.actor, "dq-engine");
}

#[test]
fn recurrence_resets_the_quiet_count() {
    let (store, clock) = build();
    let manager = ExceptionManager::new(&store, &clock);
    let id = open_one(&store, &clock);

    manager.apply("US10Y", &[], &ctx(d(2024, 3, 6))).unwrap();
    manager.apply("US10Y", &[], &ctx(d(2024, 3, 7))).unwrap();
    manager.apply("US10Y", &[spike(d(2024, 3, 8), 90.0)], &ctx(d(2024, 3, 8))).unwrap();
    let e = store.get_exception(id).unwrap().unwrap();
    assert_eq!(e.quiet_runs, 0);
    assert_eq!(e.state, ExceptionState::Open);
}

#[test]
fn exempt_rules_wait_for_an_analyst() {
    let (store, clock) = build();
    let manager = ExceptionManager::new(&store, &clock);
    let id = open_one(&store, &clock);

    let mut run = ctx(d(2024, 3, 6));
    run.auto_resolve.exempt_rules.insert(SPIKE.to_string());
    for day in [6, 7, 8, 11, 12] {
        run.asof = d(2024, 3, day);
        assert!(manager.apply("US10Y", &[], &run).unwrap().is_empty());
    }
    let e = store.get_exception(id).unwrap().unwrap();
    assert_eq!(e.state, ExceptionState::Open);
    assert_eq!(e.quiet_runs, 5);
}

// ── Concurrency ───────────────────────────────────────────────────────────────

#[test]
fn stale_version_update_is_a_conflict() {
    let (store, clock) = build();
    let id = open_one(&store, &clock);
    let snapshot = store.get_exception(id).unwrap().unwrap();

    let claimed = ExceptionManager::new(&store, &clock)
        .transition(id, ExceptionState::UnderReview, "alice", None)
        .unwrap();
    assert_eq!(claimed.version, snapshot.version + 1);

    let err = store
        .update_exception(&riskdq_core::store::ExceptionRecord {
            state: ExceptionState::Resolved,
            ..snapshot
        })
        .unwrap_err();
    assert!(matches!(err, DqError::PersistenceConflict { .. }), "got {err:?}");
    assert_eq!(store.get_exception(id).unwrap().unwrap().state, ExceptionState::UnderReview);
}

#[test]
fn second_active_exception_for_a_key_is_a_conflict() {
    let (store, _clock) = build();
    let new = NewException {
        risk_factor_id: "US10Y".into(),
        rule_code: SPIKE.into(),
        window_start: d(2024, 3, 5),
        window_end: d(2024, 3, 5),
        severity: Severity::High,
        peak_score: 80,
        suggested_action: SuggestedAction::Review,
        asof: d(2024, 3, 5),
        supersedes: None,
    };
    store.insert_exception(&new).unwrap();
    let err = store.insert_exception(&new).unwrap_err();
    assert!(matches!(err, DqError::PersistenceConflict { .. }), "got {err:?}");
}

/// Engine and analyst on separate connections to one file. While the engine
/// holds its write transaction the analyst's claim is a conflict, retried and
/// then reported; the engine's own read-then-write goes through untouched.
#[test]
fn analyst_claim_conflicts_while_the_engine_is_writing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("dq.db");
    let path = path.to_str().expect("utf-8 path");

    let engine_store = DqStore::open(path).expect("engine store");
    engine_store.migrate().expect("migrate");
    let analyst_store =
        DqStore::open_with_timeout(path, std::time::Duration::ZERO).expect("analyst store");
    let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 3, 5, 18, 0, 0).unwrap());
    let id = open_one(&engine_store, &clock);
    let analyst = ExceptionManager::new(&analyst_store, &clock).with_max_retries(2);

    let written = engine_store
        .atomically(|s| {
            let current = s.get_exception(id)?.expect("exception exists");
            let err = analyst
                .transition(id, ExceptionState::UnderReview, "alice", None)
                .unwrap_err();
            assert!(matches!(err, DqError::PersistenceConflict { .. }), "got {err:?}");
            s.update_exception(&riskdq_core::store::ExceptionRecord {
                quiet_runs: 1,
                ..current
            })
        })
        .expect("engine write");
    assert_eq!(written.version, 2);

    // Lock released: the claim reads the engine's write and lands on top of it.
    let claimed = analyst
        .transition(id, ExceptionState::UnderReview, "alice", None)
        .unwrap();
    assert_eq!(claimed.version, 3);
    assert_eq!(claimed.quiet_runs, 1);
    assert_eq!(claimed.state, ExceptionState::UnderReview);

    let actions: Vec<String> = engine_store
        .audit_history(&AuditSubject::Exception(id))
        .unwrap()
        .into_iter()
        .map(|h| h.action)
        .collect();
    assert_eq!(actions, vec!["created", "claimed"]);
}
