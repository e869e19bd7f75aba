//! End-to-end runs: config → synthetic flags → engine → history → report.

use chrono::{DateTime, Duration, TimeZone, Utc};
use funnel_core::{
    config::{CampaignConfig, Grouping, ValidatedConfig},
    eligibility::EligibilitySet,
    engine::{FailureKind, FunnelEngine},
    query::{FlagTableExecutor, GroupFilter, QueryExecutor, SectionQuery, StatRow},
    store::HistoryStore,
    synthetic::{self, SyntheticSpec},
};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 6, 0, 0).unwrap()
}

fn setup(records: usize, seed: u64) -> (ValidatedConfig, EligibilitySet) {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = CampaignConfig::default_test().validate().expect("valid config");
    let flags = synthetic::eligibility_set(
        &config.conditions,
        &config.unique_identifiers,
        &SyntheticSpec::new(records, seed),
    )
    .expect("synthetic flags");
    (config, flags)
}

fn history() -> HistoryStore {
    let store = HistoryStore::in_memory().expect("in-memory store");
    store.migrate().expect("migration");
    store
}

/// Fails every query for one grouping.
struct FailFor<'a> {
    inner:    FlagTableExecutor<'a>,
    grouping: &'static str,
}

impl QueryExecutor for FailFor<'_> {
    fn count(&self, grouping: &Grouping, filter: &GroupFilter) -> anyhow::Result<i64> {
        if grouping.name == self.grouping {
            anyhow::bail!("statement timed out");
        }
        self.inner.count(grouping, filter)
    }

    fn stats(&self, query: &SectionQuery) -> anyhow::Result<Vec<StatRow>> {
        if query.grouping.name == self.grouping {
            anyhow::bail!("statement timed out");
        }
        self.inner.stats(query)
    }
}

#[test]
fn single_run_without_history_reports_current_only() {
    let (config, flags) = setup(400, 1);
    let outcome = FunnelEngine::new(&config)
        .run(&FlagTableExecutor::new(&flags), now())
        .expect("run");

    assert!(outcome.is_complete());
    assert!(outcome.baselines.is_empty());
    assert_eq!(outcome.funnels.len(), 2);
    assert_eq!(outcome.report.groupings.len(), 2);
    assert!(outcome.report.groupings.iter().all(|g| !g.has_history()));
    assert_eq!(outcome.report.rows.len(), config.conditions.len());
    assert_eq!(outcome.report.header.offer_code, "TEST-OFFER");

    // The composite grouping is at least as fine-grained as the customer one.
    let customers = outcome.funnel("customer_id").unwrap().starting_population;
    let accounts = outcome.funnel("customer_id_account_id").unwrap().starting_population;
    assert!(accounts >= customers);
    assert_eq!(accounts, 400, "every synthetic record has its own account");

    let seg_b = outcome.report.section_start("email", "seg_b").expect("seg_b section");
    let email = outcome.funnel("customer_id").unwrap().channel_claims("email").unwrap();
    assert_eq!(
        seg_b.populations[0],
        Some(email.eligible - email.claimed_by("seg_a").unwrap()),
        "seg_b starts with what seg_a left unclaimed"
    );
}

#[test]
fn second_run_compares_against_first() {
    let (config, flags) = setup(300, 2);
    let store = history();
    let executor = FlagTableExecutor::new(&flags);
    let engine = FunnelEngine::new(&config).with_history(&store);

    let first = engine.run(&executor, now() - Duration::days(10)).expect("first run");
    assert!(first.baselines.is_empty(), "nothing to compare against yet");
    assert_eq!(store.run_count().unwrap(), 1);

    let second = engine.run(&executor, now()).expect("second run");
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(store.run_count().unwrap(), 2);
    for column in &second.report.groupings {
        assert_eq!(column.baseline_run, Some(now() - Duration::days(10)));
        assert_eq!(column.previous_starting_population, Some(column.starting_population));
    }
    // Same flags both times: every delta is zero.
    for row in &second.report.rows {
        for cell in &row.cells {
            let d = cell.delta.expect("both sides present");
            assert_eq!(
                (d.unique_drops, d.incremental_drops, d.cumulative_drops, d.regain, d.remaining),
                (0, 0, 0, 0, 0),
                "check {}",
                row.check_name
            );
        }
    }
}

#[test]
fn failing_grouping_is_isolated() {
    let (config, flags) = setup(200, 3);
    let store = history();
    let executor = FailFor {
        inner:    FlagTableExecutor::new(&flags),
        grouping: "customer_id_account_id",
    };
    let outcome = FunnelEngine::new(&config)
        .with_history(&store)
        .run(&executor, now())
        .expect("run completes despite one failing grouping");

    assert!(!outcome.is_complete());
    let failed: Vec<&str> = outcome
        .failures_of(FailureKind::Query)
        .map(|f| f.grouping.as_str())
        .collect();
    assert_eq!(failed, vec!["customer_id_account_id"]);
    assert!(outcome.failures[0].message.contains("statement timed out"));

    assert!(outcome.funnel("customer_id").is_some());
    assert!(outcome.funnel("customer_id_account_id").is_none());
    assert_eq!(outcome.report.groupings.len(), 1);
    assert_eq!(outcome.report.failures.len(), 1);

    // Only the completed grouping was persisted.
    assert!(store.find_nearest("customer_id", now()).unwrap().is_some());
    assert!(store.find_nearest("customer_id_account_id", now()).unwrap().is_none());
}

#[test]
fn unreadable_history_falls_back_to_current_only() {
    let (config, flags) = setup(100, 4);
    // Not migrated: every read and write fails.
    let store = HistoryStore::in_memory().unwrap();
    let outcome = FunnelEngine::new(&config)
        .with_history(&store)
        .run(&FlagTableExecutor::new(&flags), now())
        .expect("history problems are not fatal");

    assert_eq!(outcome.funnels.len(), 2);
    assert!(outcome.baselines.is_empty());
    assert_eq!(outcome.failures_of(FailureKind::HistoryRead).count(), 2);
    assert_eq!(outcome.failures_of(FailureKind::HistoryWrite).count(), 2);
    assert!(outcome.failures_of(FailureKind::Query).next().is_none());
    assert!(outcome.report.rows.iter().all(|r| r.cells.iter().all(|c| c.current.is_some())));
}

#[test]
fn disabled_history_never_touches_the_store() {
    let mut raw = CampaignConfig::default_test();
    raw.history.enabled = false;
    let config = raw.validate().unwrap();
    let (_, flags) = setup(50, 5);
    let store = history();
    let outcome = FunnelEngine::new(&config)
        .with_history(&store)
        .run(&FlagTableExecutor::new(&flags), now())
        .unwrap();
    assert!(outcome.is_complete());
    assert_eq!(store.run_count().unwrap(), 0);
}

#[test]
fn claims_cover_every_eligible_group() {
    let (config, flags) = setup(1000, 6);
    let outcome = FunnelEngine::new(&config)
        .run(&FlagTableExecutor::new(&flags), now())
        .unwrap();
    for funnel in &outcome.funnels {
        let email = funnel.channel_claims("email").expect("email has segments");
        assert_eq!(email.total_claimed() + email.unclaimed, email.eligible);
        assert!(funnel.channel_claims("sms").is_none(), "sms has no segments");
    }

    // Row-level assignment agrees with the account-level claims.
    let assigned = flags.assign_segments(&config.conditions, "email").unwrap();
    let by_account = outcome.funnel("customer_id_account_id").unwrap();
    let claims = by_account.channel_claims("email").unwrap();
    assert_eq!(assigned.len() as u64, claims.total_claimed());
    for seg in ["seg_a", "seg_b"] {
        let n = assigned.iter().filter(|a| a.segment == seg).count() as u64;
        assert_eq!(Some(n), claims.claimed_by(seg), "segment {seg}");
    }
}
