//! funnel-runner: headless eligibility waterfall runner.
//!
//! Usage:
//!   funnel-runner --config campaign.json --records candidates.json
//!   funnel-runner --config campaign.json --synthetic 5000 --seed 7 --history history.db
//!   funnel-runner --config campaign.json --records c.json --out report.json --now 2024-03-01T00:00:00Z

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use funnel_core::{
    config::CampaignConfig,
    eligibility::{CandidateRecord, EligibilityPlan, EligibilitySet, FieldEvaluator, SegmentAssignment},
    engine::{FunnelEngine, GroupingFailure, RunOutcome},
    query::FlagTableExecutor,
    report::Report,
    store::HistoryStore,
    synthetic::{self, SyntheticSpec},
};
use std::collections::BTreeMap;
use std::env;
use std::process::ExitCode;

#[derive(serde::Serialize)]
struct RunnerOutput<'a> {
    run_id:      &'a str,
    report:      &'a Report,
    failures:    &'a [GroupingFailure],
    assignments: BTreeMap<String, Vec<SegmentAssignment>>,
}

fn main() -> Result<ExitCode> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let Some(config_path) = string_arg(&args, "--config") else {
        eprintln!("usage: funnel-runner --config <file> (--records <file> | --synthetic <n>) [--seed <n>] [--history <db>] [--out <file>] [--now <rfc3339>]");
        return Ok(ExitCode::from(2));
    };
    let records_path = string_arg(&args, "--records");
    let synthetic_n = parse_arg(&args, "--synthetic", 0usize);
    let seed = parse_arg(&args, "--seed", 42u64);
    let history_path = string_arg(&args, "--history");
    let out_path = string_arg(&args, "--out");
    let now = match string_arg(&args, "--now") {
        Some(s) => DateTime::parse_from_rfc3339(s)
            .with_context(|| format!("invalid --now '{s}'"))?
            .with_timezone(&Utc),
        None => Utc::now(),
    };

    let config = CampaignConfig::load(config_path)?;
    let validated = match config.validate() {
        Ok(v) => v,
        Err(errors) => {
            eprintln!("{config_path}: {errors}");
            return Ok(ExitCode::FAILURE);
        }
    };

    println!("funnel-runner");
    println!("  config:     {config_path}");
    println!("  table:      {}", validated.eligibility_table);
    println!("  checks:     {}", validated.conditions.len());
    println!("  groupings:  {}", validated.groupings.len());
    println!("  history:    {}", history_path.unwrap_or("(none)"));
    println!("  now:        {}", now.to_rfc3339());
    println!();

    let flags = load_flags(&validated.conditions, &validated.unique_identifiers, records_path, synthetic_n, seed)?;

    let store = match history_path {
        Some(path) if validated.history.is_some() => {
            let store = HistoryStore::open(path)?;
            store.migrate()?;
            Some(store)
        }
        Some(_) => {
            log::warn!("--history given but history is disabled in the config; ignoring");
            None
        }
        None => None,
    };

    let executor = FlagTableExecutor::new(&flags);
    let mut engine = FunnelEngine::new(&validated);
    if let Some(store) = &store {
        engine = engine.with_history(store);
    }
    let outcome = engine.run(&executor, now)?;

    let mut assignments = BTreeMap::new();
    for channel in &validated.output_channels {
        assignments.insert(channel.clone(), flags.assign_segments(&validated.conditions, channel)?);
    }

    let output = RunnerOutput {
        run_id:      &outcome.run_id,
        report:      &outcome.report,
        failures:    &outcome.failures,
        assignments,
    };
    let json = serde_json::to_string_pretty(&output)?;
    match out_path {
        Some(path) => std::fs::write(path, json).with_context(|| format!("cannot write {path}"))?,
        None => println!("{json}"),
    }

    print_summary(&outcome, &output.assignments);
    Ok(if outcome.is_complete() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn load_flags(
    model: &funnel_core::condition::ConditionModel,
    identifiers: &[String],
    records_path: Option<&str>,
    synthetic_n: usize,
    seed: u64,
) -> Result<EligibilitySet> {
    if let Some(path) = records_path {
        let content = std::fs::read_to_string(path).with_context(|| format!("cannot read {path}"))?;
        let records: Vec<CandidateRecord> = serde_json::from_str(&content)?;
        let plan = EligibilityPlan::compile(model, identifiers);
        return Ok(plan.evaluate(&records, &FieldEvaluator)?);
    }
    if synthetic_n > 0 {
        let set = synthetic::eligibility_set(model, identifiers, &SyntheticSpec::new(synthetic_n, seed))?;
        for (check, rate) in synthetic::observed_pass_rates(&set) {
            log::debug!("synthetic: check={check} pass_rate={rate:.3}");
        }
        return Ok(set);
    }
    anyhow::bail!("one of --records or --synthetic is required")
}

fn print_summary(outcome: &RunOutcome, assignments: &BTreeMap<String, Vec<SegmentAssignment>>) {
    println!("=== RUN SUMMARY ===");
    println!("  run_id:      {}", outcome.run_id);
    println!("  run at:      {}", outcome.run_timestamp.to_rfc3339());
    for column in &outcome.report.groupings {
        let previous = column
            .previous_starting_population
            .map_or_else(|| "-".to_string(), |p| p.to_string());
        println!(
            "  {:<28} start={:<8} previous={previous}",
            column.grouping, column.starting_population
        );
        for claims in &column.claims {
            println!(
                "    {:<26} eligible={} claimed={} unclaimed={}",
                claims.channel,
                claims.eligible,
                claims.total_claimed(),
                claims.unclaimed
            );
        }
    }
    for (channel, rows) in assignments {
        println!("  assigned {channel}: {} row(s)", rows.len());
    }
    if !outcome.failures.is_empty() {
        println!();
        println!("=== FAILURES ===");
        for f in &outcome.failures {
            println!("  {} [{:?}] {}", f.grouping, f.kind, f.message);
        }
    }
}

fn string_arg<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2).find(|w| w[0] == flag).map(|w| w[1].as_str())
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}
