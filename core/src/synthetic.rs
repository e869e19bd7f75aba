//! Synthetic candidate populations for dry runs and invariant tests.
//!
//! Every distinct predicate gets a pass rate drawn once per seed; each
//! record then carries one boolean field per predicate, keyed by the
//! predicate text itself. `PredicateFlagEvaluator` reads those fields back,
//! so the full eligibility plan (prior modifiers included) runs unchanged.

use crate::{
    condition::ConditionModel,
    eligibility::{CandidateRecord, EligibilityPlan, EligibilitySet, PredicateEvaluator},
    error::FunnelResult,
    rng::{SampleRng, Stream},
};
use serde_json::{Map, Value};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticSpec {
    pub records:       usize,
    pub seed:          u64,
    /// Upper bound on records sharing the first identifier value.
    pub max_fanout:    u64,
    pub min_pass_rate: f64,
    pub max_pass_rate: f64,
}

impl SyntheticSpec {
    pub fn new(records: usize, seed: u64) -> Self {
        Self {
            records,
            seed,
            max_fanout:    3,
            min_pass_rate: 0.6,
            max_pass_rate: 0.98,
        }
    }
}

/// Generate `spec.records` candidate records for `model`.
///
/// The first identifier column groups 1..=max_fanout consecutive records;
/// every other identifier column is unique per record.
pub fn generate(
    model: &ConditionModel,
    identifier_columns: &[String],
    spec: &SyntheticSpec,
) -> Vec<CandidateRecord> {
    let mut rates_rng = SampleRng::new(spec.seed, Stream::PassRates);
    let mut flags_rng = SampleRng::new(spec.seed, Stream::Flags);
    let mut fanout_rng = SampleRng::new(spec.seed, Stream::Fanout);

    let spread = (spec.max_pass_rate - spec.min_pass_rate).max(0.0);
    let mut rates: Vec<(String, f64)> = Vec::new();
    for check in model.checks() {
        if rates.iter().all(|(p, _)| p != &check.predicate) {
            let rate = spec.min_pass_rate + rates_rng.next_f64() * spread;
            rates.push((check.predicate.clone(), rate));
        }
    }

    let max_fanout = spec.max_fanout.max(1);
    let mut group = 0u64;
    let mut left_in_group = 0u64;
    let mut records = Vec::with_capacity(spec.records);
    for i in 0..spec.records {
        if left_in_group == 0 {
            group += 1;
            left_in_group = 1 + fanout_rng.next_u64_below(max_fanout);
        }
        left_in_group -= 1;

        let mut fields = Map::new();
        for (n, column) in identifier_columns.iter().enumerate() {
            let value = if n == 0 {
                format!("{column}-{group}")
            } else {
                format!("{column}-{i}")
            };
            fields.insert(column.clone(), Value::String(value));
        }
        for (predicate, rate) in &rates {
            fields.insert(predicate.clone(), Value::Bool(flags_rng.chance(*rate)));
        }
        records.push(CandidateRecord::new(fields));
    }

    log::debug!(
        "synthetic: seed={} records={} groups={group} predicates={}",
        spec.seed,
        records.len(),
        rates.len()
    );
    records
}

/// Generate records and run them through the compiled eligibility plan.
pub fn eligibility_set(
    model: &ConditionModel,
    identifier_columns: &[String],
    spec: &SyntheticSpec,
) -> FunnelResult<EligibilitySet> {
    let records = generate(model, identifier_columns, spec);
    EligibilityPlan::compile(model, identifier_columns).evaluate(&records, &PredicateFlagEvaluator)
}

/// Reads the boolean field named by the whole predicate text.
#[derive(Debug, Clone, Copy, Default)]
pub struct PredicateFlagEvaluator;

impl PredicateEvaluator for PredicateFlagEvaluator {
    fn evaluate(&self, predicate: &str, record: &CandidateRecord) -> anyhow::Result<bool> {
        match record.get(predicate) {
            Some(Value::Bool(b)) => Ok(*b),
            Some(other) => anyhow::bail!("field '{predicate}' is not a boolean: {other}"),
            None => anyhow::bail!("field '{predicate}' not present on record"),
        }
    }
}

/// Pass rate actually observed per check in a flag set.
pub fn observed_pass_rates(set: &EligibilitySet) -> HashMap<String, f64> {
    let n = set.len().max(1) as f64;
    set.check_columns()
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let passed = set.rows().iter().filter(|r| r.flags[i]).count() as f64;
            (name.clone(), passed / n)
        })
        .collect()
}
