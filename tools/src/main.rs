//! dq-runner: headless DQ runner.
//!
//! Usage:
//!   dq-runner --demo --seed 42 --asof 2024-06-28 --runs 5
//!   dq-runner --db dq.db --universe data/universe.json --asof 2024-06-28 --scope asset_class:fx
//!   dq-runner --db dq.db --transition 7 under_review --actor alice
//!   dq-runner --db dq.db --transition 7 accepted --actor alice --comment "vendor holiday print"

use anyhow::{anyhow, Result};
use chrono::{Duration, NaiveDate, Utc};
use riskdq_core::{
    calendar::CalendarKind,
    clock::SystemClock,
    config::DqConfig,
    coordinator::{RunCoordinator, RunScope},
    exception_manager::ExceptionManager,
    reporting::Reporting,
    store::{DqStore, ExceptionFilter},
    synthetic::{Defect, SyntheticUniverse},
    types::ExceptionState,
};
use std::env;

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let seed = parse_arg(&args, "--seed", 42u64);
    let runs = parse_arg(&args, "--runs", 1u32).max(1);
    let demo = args.iter().any(|a| a == "--demo");
    let db = flag_value(&args, "--db").unwrap_or(":memory:");
    let scope_arg = flag_value(&args, "--scope").unwrap_or("all");
    let asof = match flag_value(&args, "--asof") {
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map_err(|e| anyhow!("bad --asof '{s}': {e}"))?,
        None => Utc::now().date_naive(),
    };

    let config = match flag_value(&args, "--universe") {
        Some(path) => DqConfig::load(path)?,
        None => DqConfig::default_test(),
    };

    // For :memory: use a named shared-memory URI; any further DqStore::open
    // on the same name within this process sees the same database.
    let db_effective: String = if db == ":memory:" {
        format!("file:dqrun_{}?mode=memory&cache=shared", uuid::Uuid::new_v4().simple())
    } else {
        db.to_string()
    };
    let store = DqStore::open(&db_effective)?;
    store.migrate()?;
    let clock = SystemClock;

    if let Some(pos) = args.iter().position(|a| a == "--transition") {
        return run_transition(&store, &clock, &args, pos);
    }

    let scope = RunScope::parse(scope_arg).ok_or_else(|| anyhow!("bad --scope '{scope_arg}'"))?;
    let coordinator = RunCoordinator::new(&store, config.clone(), &clock);
    coordinator.register_universe()?;

    // Business days of the widest calendar, oldest first.
    let mut run_dates = vec![asof];
    while run_dates.len() < runs as usize {
        let prev = CalendarKind::Weekdays.previous_business_day(run_dates[run_dates.len() - 1]);
        run_dates.push(prev);
    }
    run_dates.reverse();

    if demo {
        seed_demo(&store, &config, seed, run_dates[0], asof)?;
    }

    println!("riskdq dq-runner");
    println!("  db:        {db}");
    println!("  scope:     {}", scope.key());
    println!("  asof:      {asof}");
    println!("  runs:      {runs}");
    println!();

    for date in &run_dates {
        let result = coordinator.run(&scope, *date)?;
        println!(
            "  {}  attempt {}  {}  findings {}  transitions {}{}",
            result.run.run_id,
            result.run.attempt,
            result.run.status,
            result.run.finding_count,
            result.run.transition_count,
            if result.noop { "  (no-op)" } else { "" }
        );
    }
    println!();

    print_summary(&store, &scope, asof, config.lookback_days)
}

fn seed_demo(
    store: &DqStore,
    config: &DqConfig,
    seed: u64,
    first_run: NaiveDate,
    asof: NaiveDate,
) -> Result<()> {
    let start = asof - Duration::days(i64::from(config.lookback_days));
    let spike_day = CalendarKind::Weekdays.previous_business_day(first_run);
    let universe = SyntheticUniverse::new(seed, start, asof)
        .with_defect(Defect::Spike {
            risk_factor_id: "US10Y".into(),
            date: spike_day,
            sigmas: 15.0,
        })
        .with_defect(Defect::Stale {
            risk_factor_id: "EURUSD".into(),
            from: asof - Duration::days(6),
            days: 4,
        })
        .with_defect(Defect::SourceDrift {
            risk_factor_id: "SPX".into(),
            source: "yfinance".into(),
            from: asof - Duration::days(3),
            rel: 0.02,
        });
    let observations = universe.generate(config, Utc::now());
    let written = store.atomically(|s| s.insert_observations(&observations))?;
    log::info!("seeded {written} synthetic observations (seed {seed})");
    Ok(())
}

fn run_transition(store: &DqStore, clock: &SystemClock, args: &[String], pos: usize) -> Result<()> {
    let id: i64 = args
        .get(pos + 1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| anyhow!("--transition needs an exception id"))?;
    let state = args
        .get(pos + 2)
        .and_then(|s| ExceptionState::parse(s))
        .ok_or_else(|| anyhow!("--transition needs a target state"))?;
    let actor = flag_value(args, "--actor").ok_or_else(|| anyhow!("--actor is required"))?;
    let comment = flag_value(args, "--comment");

    let manager = ExceptionManager::new(store, clock);
    let record = manager.transition(id, state, actor, comment)?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

fn print_summary(store: &DqStore, scope: &RunScope, asof: NaiveDate, lookback_days: u32) -> Result<()> {
    let reporting = Reporting::new(store);
    let summary = reporting.run_summary(scope, asof)?;
    let queue = reporting.exception_queue(&ExceptionFilter {
        active_only: true,
        ..ExceptionFilter::default()
    })?;
    let pack = reporting.pack_summary(asof - Duration::days(i64::from(lookback_days)), asof)?;

    println!("=== RUN SUMMARY ===");
    println!("{}", serde_json::to_string_pretty(&summary)?);
    println!("=== EXCEPTION QUEUE ({}) ===", queue.len());
    for e in &queue {
        println!(
            "  #{:<4} {:<8} {:<22} {:<12} {}..{}  score {:>3}  {}",
            e.exception_id,
            e.risk_factor_id,
            e.rule_code,
            e.state,
            e.window_start,
            e.window_end,
            e.peak_score,
            e.suggested_action
        );
    }
    println!("=== DQ PACK ===");
    println!("{}", serde_json::to_string_pretty(&pack)?);
    Ok(())
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2)
        .find(|w| w[0] == flag)
        .map(|w| w[1].as_str())
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}
