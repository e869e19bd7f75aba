use chrono::{Duration, TimeZone, Utc};
use funnel_core::{
    condition::ConditionModel,
    config::{CampaignConfig, CheckConfig, ConditionsConfig, Grouping, MainConditions, ReportMeta},
    eligibility::{EligibilityRow, EligibilitySet},
    funnel::{FunnelCalculator, FunnelMetrics, GroupingFunnel},
    history::{Snapshot, SnapshotRow},
    query::FlagTableExecutor,
    report::{ReportAssembler, ReportFailure},
    synthetic::{self, SyntheticSpec},
};
use std::collections::HashMap;

fn model(names: &[&str]) -> ConditionModel {
    let base = names
        .iter()
        .map(|n| CheckConfig {
            name:        n.to_string(),
            predicate:   format!("{n}_flag"),
            description: Some(format!("{n} description")),
            prior:       None,
        })
        .collect();
    let config = ConditionsConfig { main: MainConditions { base }, channels: vec![] };
    ConditionModel::build(&config, &[]).unwrap()
}

/// 100 groups; A fails for the first `a_fail`, B for the next `b_fail`.
fn funnel(m: &ConditionModel, a_fail: usize, b_fail: usize) -> GroupingFunnel {
    let rows = (0..100)
        .map(|i| EligibilityRow {
            identifiers: vec![i.to_string()],
            flags:       vec![i >= a_fail, !(a_fail..a_fail + b_fail).contains(&i)],
        })
        .collect();
    let set = EligibilitySet::from_rows(vec!["customer_id".into()], m.check_names(), rows).unwrap();
    compute(m, &set)
}

fn meta() -> ReportMeta {
    ReportMeta {
        offer_code:       "OFFER-9".into(),
        campaign_planner: "planner".into(),
        lead:             "lead".into(),
    }
}

fn baseline(m: &ConditionModel, current: &GroupingFunnel, days_ago: i64) -> Snapshot {
    let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
    Snapshot {
        run_id:              "prev".into(),
        run_timestamp:       now - Duration::days(days_ago),
        grouping:            current.grouping.clone(),
        starting_population: current.starting_population,
        rows:                SnapshotRow::from_funnel(current, m),
    }
}

#[test]
fn no_history_yields_current_only_columns() {
    let m = model(&["A", "B"]);
    let current = funnel(&m, 10, 5);
    let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
    let meta = meta();

    let report = ReportAssembler::new(&m, &meta).assemble(
        now,
        std::slice::from_ref(&current),
        &HashMap::new(),
        vec![],
    );

    assert_eq!(report.header.offer_code, "OFFER-9");
    assert_eq!(report.header.run_timestamp, now);
    assert!(!report.groupings[0].has_history());
    assert_eq!(report.groupings[0].starting_population, 100);
    let names: Vec<&str> = report.rows.iter().map(|r| r.check_name.as_str()).collect();
    assert_eq!(names, vec!["A", "B"]);

    let cell = report.cell("B", "customer_id").unwrap();
    assert_eq!(cell.current.unwrap().remaining, 85);
    assert!(cell.previous.is_none() && cell.delta.is_none() && cell.pct_change.is_none());

    let main = report.section_start("main", "BA").unwrap();
    assert_eq!(main.populations, vec![Some(100)]);

    let row = report.row("A").unwrap();
    assert_eq!(row.section, "main");
    assert_eq!(row.template, "BA");
    assert_eq!(row.criteria.as_deref(), Some("A_flag"));
    assert_eq!(row.description.as_deref(), Some("A description"));
}

#[test]
fn history_adds_delta_and_percent_change() {
    let m = model(&["A", "B"]);
    let current = funnel(&m, 20, 5);
    let previous = funnel(&m, 10, 0);
    let mut baselines = HashMap::new();
    baselines.insert("customer_id".to_string(), baseline(&m, &previous, 7));
    let meta = meta();

    let report = ReportAssembler::new(&m, &meta).assemble(
        Utc::now(),
        std::slice::from_ref(&current),
        &baselines,
        vec![],
    );
    assert!(report.groupings[0].has_history());
    assert_eq!(report.groupings[0].previous_starting_population, Some(100));

    let a = report.cell("A", "customer_id").unwrap();
    assert_eq!(a.previous.unwrap().incremental_drops, 10);
    let delta = a.delta.unwrap();
    assert_eq!(delta.incremental_drops, 10);
    assert_eq!(delta.remaining, -10);
    let pct = a.pct_change.unwrap();
    assert_eq!(pct.incremental_drops, Some(100.0));
    assert!((pct.remaining.unwrap() - (-10.0 / 90.0 * 100.0)).abs() < 1e-9);

    // B dropped nobody last time: percent change is blank, not a crash.
    let b = report.cell("B", "customer_id").unwrap();
    assert_eq!(b.previous.unwrap().incremental_drops, 0);
    assert_eq!(b.delta.unwrap().incremental_drops, 5);
    assert_eq!(b.pct_change.unwrap().incremental_drops, None);
}

#[test]
fn checks_only_in_history_keep_their_row() {
    let old_model = model(&["A", "retired", "B"]);
    let new_model = model(&["A", "B", "added"]);

    let old_set = EligibilitySet::from_rows(
        vec!["customer_id".into()],
        old_model.check_names(),
        (0..10)
            .map(|i| EligibilityRow { identifiers: vec![i.to_string()], flags: vec![true, i > 0, true] })
            .collect(),
    )
    .unwrap();
    let old = compute(&old_model, &old_set);

    let new_set = EligibilitySet::from_rows(
        vec!["customer_id".into()],
        new_model.check_names(),
        (0..10)
            .map(|i| EligibilityRow { identifiers: vec![i.to_string()], flags: vec![true, true, i > 1] })
            .collect(),
    )
    .unwrap();
    let current = compute(&new_model, &new_set);

    let mut baselines = HashMap::new();
    baselines.insert("customer_id".to_string(), baseline(&old_model, &old, 7));
    let meta = meta();
    let report = ReportAssembler::new(&new_model, &meta).assemble(
        Utc::now(),
        std::slice::from_ref(&current),
        &baselines,
        vec![],
    );

    let names: Vec<&str> = report.rows.iter().map(|r| r.check_name.as_str()).collect();
    assert_eq!(names, vec!["A", "B", "added", "retired"], "retired row follows its section");

    let retired = report.row("retired").unwrap();
    assert!(!retired.in_current);
    assert_eq!(retired.criteria.as_deref(), Some("retired_flag"));
    let cell = &retired.cells[0];
    assert!(cell.current.is_none());
    assert_eq!(cell.previous.unwrap().incremental_drops, 1);
    assert!(cell.delta.is_none());

    let added = report.cell("added", "customer_id").unwrap();
    assert_eq!(added.current.unwrap().incremental_drops, 2);
    assert!(added.previous.is_none());
}

#[test]
fn retired_segment_check_stays_with_its_template() {
    let config = CampaignConfig::default_test().validate().unwrap();
    let m = &config.conditions;
    let flags = synthetic::eligibility_set(m, &config.unique_identifiers, &SyntheticSpec::new(200, 8))
        .unwrap();
    let current = compute(m, &flags);

    let mut previous = baseline(m, &current, 7);
    let mut retired = previous.row("email_seg_a_2").unwrap().clone();
    retired.check_name = "email_seg_a_old".into();
    retired.criteria = Some("tenure_months > 6".into());
    retired.position += 1;
    for r in previous.rows.iter_mut().filter(|r| r.position >= retired.position) {
        r.position += 1;
    }
    previous.rows.push(retired);
    previous.rows.sort_by_key(|r| r.position);

    let mut baselines = HashMap::new();
    baselines.insert("customer_id".to_string(), previous);
    let meta = meta();
    let report = ReportAssembler::new(m, &meta).assemble(
        Utc::now(),
        std::slice::from_ref(&current),
        &baselines,
        vec![],
    );

    let names: Vec<&str> = report.rows.iter().map(|r| r.check_name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "main_ba_1",
            "main_ba_2",
            "email_ba_1",
            "email_seg_a_1",
            "email_seg_a_2",
            "email_seg_a_old",
            "email_seg_b_1",
            "sms_ba_1",
        ]
    );
    let row = report.row("email_seg_a_old").unwrap();
    assert_eq!((row.section.as_str(), row.template.as_str()), ("email", "seg_a"));
    assert!(!row.in_current);
}

fn compute(m: &ConditionModel, set: &EligibilitySet) -> GroupingFunnel {
    FunnelCalculator::new(m)
        .compute(&Grouping::new(&["customer_id"]), &FlagTableExecutor::new(set))
        .unwrap()
}

#[test]
fn failures_are_listed_and_groupings_keep_their_order() {
    let m = model(&["A", "B"]);
    let mut by_account = funnel(&m, 1, 1);
    by_account.grouping = "account_id".into();
    let by_customer = funnel(&m, 2, 2);
    let meta = meta();

    let report = ReportAssembler::new(&m, &meta).assemble(
        Utc::now(),
        &[by_customer, by_account],
        &HashMap::new(),
        vec![ReportFailure { grouping: "household_id".into(), message: "boom".into() }],
    );
    assert_eq!(report.grouping_index("customer_id"), Some(0));
    assert_eq!(report.grouping_index("account_id"), Some(1));
    assert_eq!(report.grouping_index("household_id"), None);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.row("A").unwrap().cells.len(), 2);
    assert_eq!(
        report.cell("A", "account_id").unwrap().current,
        Some(FunnelMetrics {
            unique_drops:      1,
            incremental_drops: 1,
            cumulative_drops:  1,
            regain:            1,
            remaining:         99,
        })
    );
}

#[test]
fn report_serializes_blank_percent_as_null() {
    let m = model(&["A", "B"]);
    let current = funnel(&m, 5, 5);
    let previous = funnel(&m, 0, 5);
    let mut baselines = HashMap::new();
    baselines.insert("customer_id".to_string(), baseline(&m, &previous, 3));
    let meta = meta();
    let report = ReportAssembler::new(&m, &meta).assemble(
        Utc::now(),
        std::slice::from_ref(&current),
        &baselines,
        vec![],
    );
    let json = serde_json::to_value(&report).unwrap();
    let pct = &json["rows"][0]["cells"][0]["pct_change"];
    assert!(pct["incremental_drops"].is_null(), "got {pct}");
    assert_eq!(pct["remaining"], serde_json::json!(-5.0));
}
