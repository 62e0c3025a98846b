//! Relationship rules: FX triangle, tenor ordering, correlation breaks.

use chrono::NaiveDate;
use riskdq_core::{
    calendar::CalendarKind,
    rules::{
        CorrelationBreakConfig, EvaluationReport, FxTriangleConfig, RuleContext, RuleEngine,
        RuleSpec, TenorOrderConfig, TenorRelation, CORR_BREAK, FX_TRIANGLE, TENOR_ORDER,
    },
    series::{ChangeMeasure, SeriesPoint, TimeSeriesView},
    types::{RiskFactorId, SuggestedAction},
};
use std::collections::BTreeMap;

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

fn days(n: usize) -> Vec<NaiveDate> {
    CalendarKind::Weekdays
        .business_days(d(2024, 1, 1), d(2024, 12, 31))
        .into_iter()
        .take(n)
        .collect()
}

fn series(rf: &str, dates: &[NaiveDate], values: &[f64]) -> TimeSeriesView {
    let points = dates
        .iter()
        .zip(values)
        .map(|(date, value)| SeriesPoint { date: *date, value: *value })
        .collect();
    TimeSeriesView::from_points(rf, "src", dates[0], dates[dates.len() - 1], points)
}

fn evaluate(
    view: &TimeSeriesView,
    peers: &BTreeMap<RiskFactorId, TimeSeriesView>,
    rules: &[RuleSpec],
) -> EvaluationReport {
    let ctx = RuleContext {
        view,
        peers,
        calendar: CalendarKind::Weekdays,
        asof: view.end,
    };
    RuleEngine::evaluate(&ctx, rules)
}

fn triangle() -> RuleSpec {
    RuleSpec::FxTriangle(FxTriangleConfig {
        leg_ab: "EURUSD".into(),
        leg_bc: "USDGBP".into(),
        rel_tolerance: 0.002,
    })
}

#[test]
fn fx_cross_off_its_implied_value_is_flagged() {
    let dates = days(3);
    let mut peers = BTreeMap::new();
    peers.insert("EURUSD".to_string(), series("EURUSD", &dates, &[1.10, 1.10, 1.10]));
    peers.insert("USDGBP".to_string(), series("USDGBP", &dates, &[0.78, 0.78, 0.78]));
    let cross = series("EURGBP", &dates, &[0.858, 0.858, 0.870]);

    let report = evaluate(&cross, &peers, &[triangle()]);
    assert_eq!(report.findings.len(), 1, "findings: {:?}", report.findings);
    let f = &report.findings[0];
    assert_eq!(f.rule_code, FX_TRIANGLE);
    assert_eq!(f.start, dates[2]);
    assert_eq!(f.suggested_action, SuggestedAction::SourceSwitch);
}

#[test]
fn fx_triangle_without_legs_is_skipped() {
    let dates = days(3);
    let cross = series("EURGBP", &dates, &[0.858, 0.858, 0.870]);
    let report = evaluate(&cross, &BTreeMap::new(), &[triangle()]);
    assert!(report.findings.is_empty());
    assert!(report.failures.is_empty());
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].rule_code, FX_TRIANGLE);
}

#[test]
fn tenor_inversion_beyond_tolerance_is_flagged() {
    let dates = days(2);
    let mut peers = BTreeMap::new();
    peers.insert("US10Y".to_string(), series("US10Y", &dates, &[4.2, 4.2]));
    let long_end = series("US30Y", &dates, &[4.5, 3.0]);
    let rule = RuleSpec::TenorOrder(TenorOrderConfig {
        peer: "US10Y".into(),
        relation: TenorRelation::AtLeast,
        tolerance: 0.5,
    });

    let report = evaluate(&long_end, &peers, &[rule]);
    assert_eq!(report.findings.len(), 1, "findings: {:?}", report.findings);
    assert_eq!(report.findings[0].rule_code, TENOR_ORDER);
    assert_eq!(report.findings[0].start, dates[1]);
    assert_eq!(report.findings[0].score, 100);
}

/// Changes that track the peer, then a regime whose changes are orthogonal
/// to the peer's over any window that is a multiple of four days.
#[test]
fn correlation_break_flags_only_the_decoupled_regime() {
    let dates = days(51);
    let tracked = [1.0, 2.0, -3.0];
    let mut own_changes = Vec::new();
    let mut peer_changes = Vec::new();
    for k in 0..30 {
        own_changes.push(tracked[k % 3]);
        peer_changes.push(tracked[k % 3]);
    }
    for k in 0..20 {
        own_changes.push(if k % 2 == 0 { 1.0 } else { -1.0 });
        peer_changes.push(if k % 4 < 2 { 1.0 } else { -1.0 });
    }
    let levels = |changes: &[f64]| {
        let mut level = 100.0;
        let mut out = vec![level];
        for c in changes {
            level += c;
            out.push(level);
        }
        out
    };

    let mut peers = BTreeMap::new();
    peers.insert("US2Y".to_string(), series("US2Y", &dates, &levels(&peer_changes)));
    let own = series("US10Y", &dates, &levels(&own_changes));
    let rule = RuleSpec::CorrelationBreak(CorrelationBreakConfig {
        peer: "US2Y".into(),
        window: 8,
        min_abs_corr: 0.2,
        measure: ChangeMeasure::Difference,
    });

    let report = evaluate(&own, &peers, &[rule]);
    assert!(!report.findings.is_empty(), "expected a correlation break");
    // The 31st change (dated dates[31]) is the first of the new regime.
    let regime_start = dates[31];
    for f in &report.findings {
        assert_eq!(f.rule_code, CORR_BREAK);
        assert!(
            f.start >= regime_start,
            "finding {}..{} starts before the regime change {regime_start}",
            f.start,
            f.end
        );
    }
    let last = report.findings.last().unwrap();
    assert_eq!(last.end, dates[50]);
}

#[test]
fn correlation_break_needs_a_warm_window() {
    let dates = days(30);
    let values: Vec<f64> = (0..30).map(|k| 100.0 + (k % 5) as f64).collect();
    let mut peers = BTreeMap::new();
    peers.insert("US2Y".to_string(), series("US2Y", &dates, &values));
    let own = series("US10Y", &dates, &values);
    let rule = RuleSpec::CorrelationBreak(CorrelationBreakConfig {
        peer: "US2Y".into(),
        window: 60,
        min_abs_corr: 0.2,
        measure: ChangeMeasure::Difference,
    });
    let report = evaluate(&own, &peers, &[rule]);
    assert_eq!(report.skipped.len(), 1);
    assert!(report.findings.is_empty());
}
