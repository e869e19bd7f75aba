use funnel_core::{
    condition::ConditionModel,
    config::{CampaignConfig, CheckConfig, ConditionsConfig, MainConditions, PriorModifier},
    eligibility::{
        CandidateRecord, EligibilityPlan, EligibilityRow, EligibilitySet, FieldEvaluator,
        PriorRequirement,
    },
    error::FunnelError,
};
use serde_json::{json, Value};

fn record(v: Value) -> CandidateRecord {
    serde_json::from_value(v).expect("record is a JSON object")
}

fn check(name: &str, prior: Option<PriorModifier>) -> CheckConfig {
    CheckConfig {
        name:        name.into(),
        predicate:   name.into(),
        description: None,
        prior,
    }
}

fn main_only(checks: Vec<CheckConfig>) -> ConditionModel {
    let config = ConditionsConfig {
        main:     MainConditions { base: checks },
        channels: vec![],
    };
    ConditionModel::build(&config, &[]).expect("valid model")
}

fn ids() -> Vec<String> {
    vec!["customer_id".into()]
}

#[test]
fn prior_modifiers_are_resolved_once_at_compile_time() {
    let model = main_only(vec![
        check("a", None),
        check("b", Some(PriorModifier::PassAllPrior)),
        check("c", Some(PriorModifier::FailAllPrior)),
        check("d", None),
    ]);
    let plan = EligibilityPlan::compile(&model, &ids());
    let priors: Vec<&PriorRequirement> = plan.steps().iter().map(|s| &s.prior).collect();
    assert_eq!(
        priors,
        vec![
            &PriorRequirement::None,
            &PriorRequirement::AllPass(vec!["a".into()]),
            &PriorRequirement::AllFail(vec!["a".into(), "b".into()]),
            &PriorRequirement::None,
        ]
    );
}

#[test]
fn modifier_on_first_check_has_no_effect() {
    let model = main_only(vec![check("a", Some(PriorModifier::FailAllPrior))]);
    let plan = EligibilityPlan::compile(&model, &ids());
    assert_eq!(plan.steps()[0].prior, PriorRequirement::None);
}

#[test]
fn prior_modifiers_gate_flags_per_record() {
    let model = main_only(vec![
        check("a", None),
        check("b", Some(PriorModifier::PassAllPrior)),
        check("c", Some(PriorModifier::FailAllPrior)),
    ]);
    let records = vec![
        record(json!({ "customer_id": "1", "a": true,  "b": true, "c": true })),
        record(json!({ "customer_id": "2", "a": false, "b": true, "c": true })),
    ];
    let set = EligibilityPlan::compile(&model, &ids())
        .evaluate(&records, &FieldEvaluator)
        .expect("evaluate");

    // 1: a and b pass, so "c requires all prior failing" cannot pass.
    assert_eq!(set.flag(&["1"], "a"), Some(true));
    assert_eq!(set.flag(&["1"], "b"), Some(true));
    assert_eq!(set.flag(&["1"], "c"), Some(false));
    // 2: a fails, so b is gated off; then a and b both fail and c passes.
    assert_eq!(set.flag(&["2"], "b"), Some(false));
    assert_eq!(set.flag(&["2"], "c"), Some(true));
}

#[test]
fn no_record_is_dropped() {
    let model = main_only(vec![check("a", None), check("b", None)]);
    let records = vec![
        record(json!({ "customer_id": 1, "a": false, "b": false })),
        record(json!({ "customer_id": 2, "a": true, "b": true })),
    ];
    let set = EligibilityPlan::compile(&model, &ids())
        .evaluate(&records, &FieldEvaluator)
        .unwrap();
    assert_eq!(set.len(), 2, "a record failing every check still gets a row");
    assert_eq!(set.rows()[0].flags, vec![false, false]);
    // Numeric identifiers are rendered as text.
    assert_eq!(set.flag(&["1"], "a"), Some(false));
}

#[test]
fn duplicate_identifiers_merge_with_or() {
    let model = main_only(vec![check("a", None), check("b", None)]);
    let records = vec![
        record(json!({ "customer_id": "1", "a": true,  "b": false })),
        record(json!({ "customer_id": "1", "a": false, "b": true })),
    ];
    let set = EligibilityPlan::compile(&model, &ids())
        .evaluate(&records, &FieldEvaluator)
        .unwrap();
    assert_eq!(set.len(), 1);
    assert_eq!(set.rows()[0].flags, vec![true, true]);
}

#[test]
fn missing_identifier_is_an_error() {
    let model = main_only(vec![check("a", None)]);
    let records = vec![record(json!({ "a": true }))];
    let err = EligibilityPlan::compile(&model, &ids())
        .evaluate(&records, &FieldEvaluator)
        .unwrap_err();
    assert!(err.to_string().contains("customer_id"), "got {err}");
}

#[test]
fn predicate_errors_name_the_check() {
    let model = main_only(vec![check("a", None)]);
    let records = vec![record(json!({ "customer_id": "1" }))];
    let err = EligibilityPlan::compile(&model, &ids())
        .evaluate(&records, &FieldEvaluator)
        .unwrap_err();
    match err {
        FunnelError::Predicate { check, .. } => assert_eq!(check, "a"),
        other => panic!("expected predicate error, got {other}"),
    }
}

#[test]
fn custom_evaluators_plug_in_as_closures() {
    let model = main_only(vec![check("adult", None)]);
    let records = vec![
        record(json!({ "customer_id": "1", "age": 17 })),
        record(json!({ "customer_id": "2", "age": 40 })),
    ];
    let evaluator = |_predicate: &str, r: &CandidateRecord| -> anyhow::Result<bool> {
        Ok(r.get("age").and_then(Value::as_i64).unwrap_or(0) >= 18)
    };
    let set = EligibilityPlan::compile(&model, &ids())
        .evaluate(&records, &evaluator)
        .unwrap();
    assert_eq!(set.flag(&["1"], "adult"), Some(false));
    assert_eq!(set.flag(&["2"], "adult"), Some(true));
}

#[test]
fn flag_set_rejects_ragged_rows() {
    let err = EligibilitySet::from_rows(
        vec!["customer_id".into()],
        vec!["a".into(), "b".into()],
        vec![EligibilityRow { identifiers: vec!["1".into()], flags: vec![true] }],
    )
    .unwrap_err();
    assert!(err.to_string().contains("row 0"), "got {err}");
}

#[test]
fn flag_set_round_trips_through_json_with_index() {
    let set = EligibilitySet::from_rows(
        vec!["customer_id".into()],
        vec!["a".into()],
        vec![EligibilityRow { identifiers: vec!["7".into()], flags: vec![true] }],
    )
    .unwrap();
    let json = serde_json::to_string(&set).unwrap();
    let back: EligibilitySet = serde_json::from_str(&json).unwrap();
    assert_eq!(back.flag(&["7"], "a"), Some(true), "row index rebuilt on load");
}

#[test]
fn segments_are_assigned_first_match_wins() {
    let validated = CampaignConfig::default_test().validate().unwrap();
    let model = &validated.conditions;
    let checks = model.check_names();
    // main_ba_1 main_ba_2 email_ba_1 email_seg_a_1 email_seg_a_2 email_seg_b_1 sms_ba_1
    let rows = vec![
        ("c1", [true, true, true, true, true, true, true]),    // seg_a (also passes seg_b)
        ("c2", [true, true, true, true, false, true, true]),   // seg_b
        ("c3", [true, true, true, false, false, false, true]), // eligible, unclaimed
        ("c4", [true, false, true, true, true, true, true]),   // fails main base
        ("c5", [true, true, false, true, true, true, true]),   // fails email base
    ];
    let set = EligibilitySet::from_rows(
        vec!["customer_id".into(), "account_id".into()],
        checks,
        rows.into_iter()
            .map(|(id, flags)| EligibilityRow {
                identifiers: vec![id.into(), format!("{id}-acct")],
                flags:       flags.to_vec(),
            })
            .collect(),
    )
    .unwrap();

    let assigned = set.assign_segments(model, "email").unwrap();
    let pairs: Vec<(&str, &str)> = assigned
        .iter()
        .map(|a| (a.identifiers[0].as_str(), a.segment.as_str()))
        .collect();
    assert_eq!(pairs, vec![("c1", "seg_a"), ("c2", "seg_b")]);

    assert!(set.assign_segments(model, "sms").unwrap().is_empty());
    assert!(matches!(
        set.assign_segments(model, "push"),
        Err(FunnelError::UnknownChannel { .. })
    ));
}
