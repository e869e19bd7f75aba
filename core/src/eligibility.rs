//! Eligibility compiler: one 0/1 flag per check for every candidate record.
//!
//! `EligibilityPlan::compile` resolves the `pass_all_prior` / `fail_all_prior`
//! modifiers once into an ordered list of `FlagStep`s. `EligibilityPlan::evaluate`
//! then applies that plan uniformly to every record. No record is dropped:
//! records failing every check still get a full flag vector.

use crate::{
    condition::ConditionModel,
    config::PriorModifier,
    error::{FunnelError, FunnelResult},
    types::{CheckName, SegmentName},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// One candidate record: identifier columns and whatever attributes the
/// predicates need, as a flat JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CandidateRecord {
    pub fields: Map<String, Value>,
}

impl CandidateRecord {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Identifier value as text; numbers and booleans are rendered.
    fn identifier(&self, column: &str) -> Option<String> {
        match self.fields.get(column)? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

/// Evaluates an opaque check predicate against a record.
///
/// Implemented by whatever owns the predicate language; the compiler never
/// looks inside a predicate.
pub trait PredicateEvaluator {
    fn evaluate(&self, predicate: &str, record: &CandidateRecord) -> anyhow::Result<bool>;
}

impl<F> PredicateEvaluator for F
where
    F: Fn(&str, &CandidateRecord) -> anyhow::Result<bool>,
{
    fn evaluate(&self, predicate: &str, record: &CandidateRecord) -> anyhow::Result<bool> {
        self(predicate, record)
    }
}

/// Minimal built-in predicate language over record fields.
///
/// Grammar: `field`, `!field`, `field = literal`, `field != literal`.
/// A bare field is truthy when it is `true`, a non-zero number or a
/// non-empty string.
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldEvaluator;

impl PredicateEvaluator for FieldEvaluator {
    fn evaluate(&self, predicate: &str, record: &CandidateRecord) -> anyhow::Result<bool> {
        let predicate = predicate.trim();
        if let Some((field, literal)) = predicate.split_once("!=") {
            return Ok(!field_equals(record, field.trim(), literal.trim())?);
        }
        if let Some((field, literal)) = predicate.split_once('=') {
            return field_equals(record, field.trim(), literal.trim());
        }
        if let Some(field) = predicate.strip_prefix('!') {
            return Ok(!truthy(lookup(record, field.trim())?));
        }
        Ok(truthy(lookup(record, predicate)?))
    }
}

fn lookup<'r>(record: &'r CandidateRecord, field: &str) -> anyhow::Result<&'r Value> {
    record
        .get(field)
        .ok_or_else(|| anyhow::anyhow!("field '{field}' not present on record"))
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Null => false,
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn field_equals(record: &CandidateRecord, field: &str, literal: &str) -> anyhow::Result<bool> {
    let value = lookup(record, field)?;
    let literal = literal.trim_matches(|c| c == '\'' || c == '"');
    Ok(match value {
        Value::String(s) => s == literal,
        Value::Null => literal.eq_ignore_ascii_case("null"),
        other => other.to_string() == literal,
    })
}

// ── Compiled plan ───────────────────────────────────────────────────

/// What the prior checks of a chain must look like for a flag to be set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "checks", rename_all = "snake_case")]
pub enum PriorRequirement {
    None,
    AllPass(Vec<CheckName>),
    AllFail(Vec<CheckName>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagStep {
    pub check:     CheckName,
    pub predicate: String,
    pub prior:     PriorRequirement,
}

#[derive(Debug, Clone)]
pub struct EligibilityPlan {
    identifier_columns: Vec<String>,
    steps:              Vec<FlagStep>,
    /// Flag index of each check, for resolving prior requirements.
    slots:              HashMap<CheckName, usize>,
}

impl EligibilityPlan {
    /// Resolve every modifier into an explicit list of prior checks.
    pub fn compile(model: &ConditionModel, identifier_columns: &[String]) -> Self {
        let steps: Vec<FlagStep> = model
            .checks()
            .iter()
            .map(|check| {
                let chain = model.chain_before(&check.name).unwrap_or_default();
                let prior = match check.prior {
                    Some(PriorModifier::PassAllPrior) if !chain.is_empty() => {
                        PriorRequirement::AllPass(chain)
                    }
                    Some(PriorModifier::FailAllPrior) if !chain.is_empty() => {
                        PriorRequirement::AllFail(chain)
                    }
                    _ => PriorRequirement::None,
                };
                FlagStep {
                    check: check.name.clone(),
                    predicate: check.predicate.clone(),
                    prior,
                }
            })
            .collect();

        let slots = steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.check.clone(), i))
            .collect();

        Self {
            identifier_columns: identifier_columns.to_vec(),
            steps,
            slots,
        }
    }

    pub fn steps(&self) -> &[FlagStep] {
        &self.steps
    }

    pub fn identifier_columns(&self) -> &[String] {
        &self.identifier_columns
    }

    /// Materialize the flag set. Records sharing an identifier combination
    /// collapse into one row whose flag is set if any of them passes.
    pub fn evaluate<E: PredicateEvaluator + ?Sized>(
        &self,
        records: &[CandidateRecord],
        evaluator: &E,
    ) -> FunnelResult<EligibilitySet> {
        let mut set = EligibilitySet::empty(
            self.identifier_columns.clone(),
            self.steps.iter().map(|s| s.check.clone()).collect(),
        );

        for (i, record) in records.iter().enumerate() {
            let identifiers = self
                .identifier_columns
                .iter()
                .map(|col| {
                    record.identifier(col).ok_or_else(|| {
                        FunnelError::Other(anyhow::anyhow!(
                            "record {i} is missing identifier '{col}'"
                        ))
                    })
                })
                .collect::<FunnelResult<Vec<_>>>()?;

            let flags = self.evaluate_record(record, evaluator)?;
            set.merge_row(identifiers, flags);
        }

        log::info!(
            "eligibility: {} record(s) -> {} row(s), {} check(s)",
            records.len(),
            set.len(),
            self.steps.len()
        );
        Ok(set)
    }

    fn evaluate_record<E: PredicateEvaluator + ?Sized>(
        &self,
        record: &CandidateRecord,
        evaluator: &E,
    ) -> FunnelResult<Vec<bool>> {
        let mut flags = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            let passed = evaluator
                .evaluate(&step.predicate, record)
                .map_err(|e| FunnelError::Predicate {
                    check:   step.check.clone(),
                    message: e.to_string(),
                })?;
            let prior_ok = match &step.prior {
                PriorRequirement::None => true,
                PriorRequirement::AllPass(names) => names.iter().all(|n| flags[self.slots[n]]),
                PriorRequirement::AllFail(names) => names.iter().all(|n| !flags[self.slots[n]]),
            };
            flags.push(passed && prior_ok);
        }
        Ok(flags)
    }
}

// ── Materialized flag set ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EligibilityRow {
    /// Values in `identifier_columns` order.
    pub identifiers: Vec<String>,
    /// Values in `check_columns` order.
    pub flags:       Vec<bool>,
}

/// The read-only input to the funnel calculator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "FlagTable")]
pub struct EligibilitySet {
    identifier_columns: Vec<String>,
    check_columns:      Vec<CheckName>,
    rows:               Vec<EligibilityRow>,
    #[serde(skip)]
    row_index:          HashMap<Vec<String>, usize>,
}

/// On-disk shape of a flag table; the row index is rebuilt on load.
#[derive(Deserialize)]
struct FlagTable {
    identifier_columns: Vec<String>,
    check_columns:      Vec<CheckName>,
    rows:               Vec<EligibilityRow>,
}

impl TryFrom<FlagTable> for EligibilitySet {
    type Error = FunnelError;

    fn try_from(table: FlagTable) -> FunnelResult<Self> {
        Self::from_rows(table.identifier_columns, table.check_columns, table.rows)
    }
}

impl EligibilitySet {
    fn empty(identifier_columns: Vec<String>, check_columns: Vec<CheckName>) -> Self {
        Self {
            identifier_columns,
            check_columns,
            rows: Vec::new(),
            row_index: HashMap::new(),
        }
    }

    /// Build from an externally materialized flag table.
    pub fn from_rows(
        identifier_columns: Vec<String>,
        check_columns: Vec<CheckName>,
        rows: Vec<EligibilityRow>,
    ) -> FunnelResult<Self> {
        let mut set = Self::empty(identifier_columns, check_columns);
        for (i, row) in rows.into_iter().enumerate() {
            if row.identifiers.len() != set.identifier_columns.len()
                || row.flags.len() != set.check_columns.len()
            {
                return Err(FunnelError::Other(anyhow::anyhow!(
                    "row {i} has {} identifier(s) and {} flag(s), expected {} and {}",
                    row.identifiers.len(),
                    row.flags.len(),
                    set.identifier_columns.len(),
                    set.check_columns.len()
                )));
            }
            set.merge_row(row.identifiers, row.flags);
        }
        Ok(set)
    }

    fn merge_row(&mut self, identifiers: Vec<String>, flags: Vec<bool>) {
        match self.row_index.get(&identifiers) {
            Some(&i) => {
                for (slot, f) in self.rows[i].flags.iter_mut().zip(flags) {
                    *slot |= f;
                }
            }
            None => {
                self.row_index.insert(identifiers.clone(), self.rows.len());
                self.rows.push(EligibilityRow { identifiers, flags });
            }
        }
    }

    pub fn identifier_columns(&self) -> &[String] {
        &self.identifier_columns
    }

    pub fn check_columns(&self) -> &[CheckName] {
        &self.check_columns
    }

    pub fn rows(&self) -> &[EligibilityRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn identifier_index(&self, column: &str) -> Option<usize> {
        self.identifier_columns.iter().position(|c| c == column)
    }

    pub fn check_index(&self, name: &str) -> Option<usize> {
        self.check_columns.iter().position(|c| c == name)
    }

    /// Flag of `check` on the row identified by `identifiers`.
    pub fn flag(&self, identifiers: &[&str], check: &str) -> Option<bool> {
        let key: Vec<String> = identifiers.iter().map(|s| s.to_string()).collect();
        let row = self.row_index.get(&key).map(|&i| &self.rows[i])?;
        self.check_index(check).map(|c| row.flags[c])
    }

    /// Assign every row eligible for `channel` to the first segment whose
    /// checks it all passes. Rows claimed by no segment are left out.
    pub fn assign_segments(
        &self,
        model: &ConditionModel,
        channel: &str,
    ) -> FunnelResult<Vec<SegmentAssignment>> {
        let ch = model
            .channel(channel)
            .ok_or_else(|| FunnelError::UnknownChannel { name: channel.to_string() })?;

        let resolve = |names: &[CheckName]| -> FunnelResult<Vec<usize>> {
            names
                .iter()
                .map(|n| {
                    self.check_index(n)
                        .ok_or_else(|| FunnelError::UnknownCheck { name: n.clone() })
                })
                .collect()
        };

        let mut gate = resolve(model.main_base())?;
        gate.extend(resolve(&ch.base)?);
        let segments = ch
            .segments
            .iter()
            .map(|s| Ok((s.name.clone(), resolve(&s.checks)?)))
            .collect::<FunnelResult<Vec<_>>>()?;

        let assignments: Vec<SegmentAssignment> = self
            .rows
            .iter()
            .filter(|row| gate.iter().all(|&c| row.flags[c]))
            .filter_map(|row| {
                segments
                    .iter()
                    .find(|(_, checks)| checks.iter().all(|&c| row.flags[c]))
                    .map(|(name, _)| SegmentAssignment {
                        identifiers: row.identifiers.clone(),
                        segment:     name.clone(),
                    })
            })
            .collect();

        log::info!(
            "channel {channel}: {} row(s) assigned across {} segment(s)",
            assignments.len(),
            segments.len()
        );
        Ok(assignments)
    }
}

/// One row's segment (`template_id`) within a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentAssignment {
    pub identifiers: Vec<String>,
    pub segment:     SegmentName,
}
