//! Missing-day and stale-print rules, plus calendar-aware merging of
//! adjacent findings.

use chrono::NaiveDate;
use riskdq_core::{
    calendar::CalendarKind,
    finding::{merge_adjacent, Finding},
    rules::{
        EvaluationReport, MissingDaysConfig, RuleContext, RuleEngine, RuleSpec, StaleConfig,
        MISSING_DAYS, SPIKE, STALE,
    },
    series::{SeriesPoint, TimeSeriesView},
    types::{Severity, SuggestedAction},
};
use serde_json::json;
use std::collections::BTreeMap;

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

fn view_on(dates: &[NaiveDate], values: &[f64]) -> TimeSeriesView {
    let points = dates
        .iter()
        .zip(values)
        .map(|(date, value)| SeriesPoint { date: *date, value: *value })
        .collect();
    TimeSeriesView::from_points("US10Y", "fred", dates[0], dates[dates.len() - 1], points)
}

fn evaluate(view: &TimeSeriesView, calendar: CalendarKind, rules: &[RuleSpec]) -> EvaluationReport {
    let peers = BTreeMap::new();
    let ctx = RuleContext {
        view,
        peers: &peers,
        calendar,
        asof: view.end,
    };
    RuleEngine::evaluate(&ctx, rules)
}

// ── Stale prints ──────────────────────────────────────────────────────────────

/// 2.60 printed five times in a row with N = 5 flags only the fifth print.
#[test]
fn stale_flags_the_nth_identical_print() {
    let dates = CalendarKind::Weekdays.business_days(d(2024, 1, 1), d(2024, 2, 29));
    let mut values: Vec<f64> = (0..=20).map(|k| 2.50 + 0.01 * k as f64).collect();
    values.extend([2.60; 5]);
    let dates = &dates[..values.len()];
    let view = view_on(dates, &values);

    let report = evaluate(
        &view,
        CalendarKind::Weekdays,
        &[RuleSpec::Stale(StaleConfig { min_repeats: 5, tolerance: 0.0 })],
    );
    assert_eq!(report.findings.len(), 1, "findings: {:?}", report.findings);
    let f = &report.findings[0];
    assert_eq!(f.rule_code, STALE);
    assert_eq!(f.start, view.end);
    assert_eq!(f.end, view.end);
    assert_eq!(f.metrics["repeats"], json!(5));
    assert_eq!(f.suggested_action, SuggestedAction::Review);
}

/// Four repeats with N = 5 is not stale.
#[test]
fn stale_below_n_is_clean() {
    let dates = CalendarKind::Weekdays.business_days(d(2024, 1, 1), d(2024, 1, 31));
    let values = [2.70, 2.71, 2.60, 2.60, 2.60, 2.60];
    let view = view_on(&dates[..values.len()], &values);
    let report = evaluate(
        &view,
        CalendarKind::Weekdays,
        &[RuleSpec::Stale(StaleConfig { min_repeats: 5, tolerance: 0.0 })],
    );
    assert!(report.findings.is_empty(), "findings: {:?}", report.findings);
}

/// A streak that keeps going past N produces one merged finding.
#[test]
fn long_stale_streak_merges_into_one_finding() {
    let dates = CalendarKind::Weekdays.business_days(d(2024, 1, 1), d(2024, 1, 31));
    let values = [1.0, 2.0, 2.0, 2.0, 2.0, 2.0];
    let view = view_on(&dates[..values.len()], &values);
    let report = evaluate(
        &view,
        CalendarKind::Weekdays,
        &[RuleSpec::Stale(StaleConfig { min_repeats: 3, tolerance: 0.0 })],
    );
    assert_eq!(report.findings.len(), 1);
    assert_eq!(report.findings[0].start, dates[3]);
    assert_eq!(report.findings[0].end, dates[5]);
    assert_eq!(report.findings[0].flagged_days, 3);
}

#[test]
fn stale_requires_two_repeats_at_least() {
    let dates = CalendarKind::Weekdays.business_days(d(2024, 1, 1), d(2024, 1, 31));
    let view = view_on(&dates[..3], &[1.0, 1.0, 1.0]);
    let report = evaluate(
        &view,
        CalendarKind::Weekdays,
        &[RuleSpec::Stale(StaleConfig { min_repeats: 1, tolerance: 0.0 })],
    );
    assert_eq!(report.failures.len(), 1);
}

// ── Missing days ──────────────────────────────────────────────────────────────

fn january_without(missing: &[NaiveDate]) -> TimeSeriesView {
    let dates: Vec<NaiveDate> = CalendarKind::Weekdays
        .business_days(d(2024, 1, 1), d(2024, 1, 31))
        .into_iter()
        .filter(|day| !missing.contains(day))
        .collect();
    let values: Vec<f64> = (0..dates.len()).map(|k| 4.0 + 0.01 * k as f64).collect();
    view_on(&dates, &values)
}

#[test]
fn missing_runs_become_one_finding_each() {
    let view = january_without(&[d(2024, 1, 10), d(2024, 1, 11), d(2024, 1, 22)]);
    let report = evaluate(
        &view,
        CalendarKind::Weekdays,
        &[RuleSpec::MissingDays(MissingDaysConfig::default())],
    );
    assert_eq!(report.findings.len(), 2, "findings: {:?}", report.findings);

    let first = &report.findings[0];
    assert_eq!(first.rule_code, MISSING_DAYS);
    assert_eq!((first.start, first.end), (d(2024, 1, 10), d(2024, 1, 11)));
    assert_eq!(first.flagged_days, 2);
    assert_eq!(first.suggested_action, SuggestedAction::Interpolate);

    let second = &report.findings[1];
    assert_eq!((second.start, second.end), (d(2024, 1, 22), d(2024, 1, 22)));
}

#[test]
fn missing_runs_shorter_than_minimum_are_ignored() {
    let view = january_without(&[d(2024, 1, 10), d(2024, 1, 11), d(2024, 1, 22)]);
    let report = evaluate(
        &view,
        CalendarKind::Weekdays,
        &[RuleSpec::MissingDays(MissingDaysConfig { min_consecutive: 2 })],
    );
    assert_eq!(report.findings.len(), 1);
    assert_eq!(report.findings[0].start, d(2024, 1, 10));
}

/// No print on MLK day is expected under the NYSE calendar.
#[test]
fn exchange_holidays_are_not_missing() {
    let dates = CalendarKind::Nyse.business_days(d(2024, 1, 2), d(2024, 1, 31));
    assert!(!dates.contains(&d(2024, 1, 15)));
    let values: Vec<f64> = (0..dates.len()).map(|k| 4.0 + 0.01 * k as f64).collect();
    let view = view_on(&dates, &values);

    let report = evaluate(
        &view,
        CalendarKind::Nyse,
        &[RuleSpec::MissingDays(MissingDaysConfig::default())],
    );
    assert!(report.findings.is_empty(), "findings: {:?}", report.findings);

    // The same prints under a plain weekday calendar miss MLK day.
    let report = evaluate(
        &view,
        CalendarKind::Weekdays,
        &[RuleSpec::MissingDays(MissingDaysConfig::default())],
    );
    assert_eq!(report.findings.len(), 1);
    assert_eq!(report.findings[0].start, d(2024, 1, 15));
}

// ── Merging adjacent findings ─────────────────────────────────────────────────

fn spike_on(date: NaiveDate, score: f64) -> Finding {
    Finding::on("US10Y", SPIKE, date, score, SuggestedAction::Review, json!({ "score": score }))
}

/// Friday and the following Monday are adjacent business days.
#[test]
fn friday_and_monday_findings_merge() {
    let merged = merge_adjacent(
        vec![spike_on(d(2024, 1, 8), 90.0), spike_on(d(2024, 1, 5), 60.0)],
        CalendarKind::Weekdays,
    );
    assert_eq!(merged.len(), 1, "merged: {merged:?}");
    let f = &merged[0];
    assert_eq!((f.start, f.end), (d(2024, 1, 5), d(2024, 1, 8)));
    assert_eq!(f.flagged_days, 2);
    assert_eq!(f.score, 90);
    assert_eq!(f.severity, Severity::Critical);
    assert_eq!(f.metrics["score"], json!(90.0));
}

#[test]
fn a_business_day_gap_keeps_findings_apart() {
    let merged = merge_adjacent(
        vec![spike_on(d(2024, 1, 5), 60.0), spike_on(d(2024, 1, 9), 60.0)],
        CalendarKind::Weekdays,
    );
    assert_eq!(merged.len(), 2);
}

/// Wednesday 3 July and Friday 5 July 2024 are adjacent across Independence Day.
#[test]
fn holidays_do_not_break_adjacency() {
    let findings = vec![spike_on(d(2024, 7, 3), 60.0), spike_on(d(2024, 7, 5), 60.0)];
    assert_eq!(merge_adjacent(findings.clone(), CalendarKind::Nyse).len(), 1);
    assert_eq!(merge_adjacent(findings, CalendarKind::Weekdays).len(), 2);
}

#[test]
fn different_rules_never_merge() {
    let mut other = spike_on(d(2024, 1, 8), 60.0);
    other.rule_code = STALE.to_string();
    let merged = merge_adjacent(vec![spike_on(d(2024, 1, 5), 60.0), other], CalendarKind::Weekdays);
    assert_eq!(merged.len(), 2);
}
