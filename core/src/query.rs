//! Query descriptions handed to the executor, and the executor seam.
//!
//! RULE: the core only builds `GroupFilter` / `SectionQuery` values.
//! Turning them into dialect-specific text is the executor's business.
//!
//! Filters are evaluated per *group*: a group passes a check when any
//! eligibility row in the group passes it.

use crate::{
    config::Grouping,
    eligibility::EligibilitySet,
    types::CheckName,
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt};

/// One conjunct of a group filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "checks", rename_all = "snake_case")]
pub enum Clause {
    Passes(CheckName),
    Fails(CheckName),
    /// Fails at least one of the listed checks. Empty list never matches.
    FailsAnyOf(Vec<CheckName>),
}

/// A conjunction of clauses. The empty filter matches every group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupFilter {
    pub clauses: Vec<Clause>,
}

impl GroupFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn passes_all<'a>(mut self, names: impl IntoIterator<Item = &'a CheckName>) -> Self {
        self.clauses.extend(names.into_iter().cloned().map(Clause::Passes));
        self
    }

    pub fn passes(mut self, name: &str) -> Self {
        self.clauses.push(Clause::Passes(name.to_string()));
        self
    }

    pub fn fails(mut self, name: &str) -> Self {
        self.clauses.push(Clause::Fails(name.to_string()));
        self
    }

    pub fn fails_any_of(mut self, names: &[CheckName]) -> Self {
        self.clauses.push(Clause::FailsAnyOf(names.to_vec()));
        self
    }

    /// Conjoin another filter onto this one.
    pub fn and(mut self, other: &GroupFilter) -> Self {
        self.clauses.extend(other.clauses.iter().cloned());
        self
    }

    /// Every check name the filter reads.
    pub fn referenced_checks(&self) -> impl Iterator<Item = &CheckName> {
        self.clauses.iter().flat_map(|c| match c {
            Clause::Passes(n) | Clause::Fails(n) => std::slice::from_ref(n).iter(),
            Clause::FailsAnyOf(ns) => ns.iter(),
        })
    }

    /// Evaluate against one group, `flag(name)` giving the group's flag.
    pub fn matches(&self, flag: impl Fn(&str) -> bool) -> bool {
        self.clauses.iter().all(|c| match c {
            Clause::Passes(n) => flag(n),
            Clause::Fails(n) => !flag(n),
            Clause::FailsAnyOf(ns) => ns.iter().any(|n| !flag(n)),
        })
    }
}

/// Stats the executor is asked for. Cumulative drops are derived by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatName {
    UniqueDrops,
    IncrementalDrops,
    Remaining,
    Regain,
}

impl StatName {
    pub const ALL: [StatName; 4] = [
        StatName::UniqueDrops,
        StatName::IncrementalDrops,
        StatName::Remaining,
        StatName::Regain,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StatName::UniqueDrops      => "unique_drops",
            StatName::IncrementalDrops => "incremental_drops",
            StatName::Remaining        => "remaining",
            StatName::Regain           => "regain",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|n| n.as_str() == s)
    }
}

impl fmt::Display for StatName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Count of groups (within the section universe) matching `filter`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatSpec {
    pub check:  CheckName,
    pub stat:   StatName,
    pub filter: GroupFilter,
}

/// Everything needed to compute one funnel section in a single round trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionQuery {
    pub grouping: Grouping,
    /// Section label, for executor-side logging only.
    pub section:  String,
    pub universe: GroupFilter,
    pub stats:    Vec<StatSpec>,
}

/// One long-form result row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatRow {
    pub check_name: String,
    pub stat_name:  String,
    pub value:      i64,
}

/// The external query executor.
///
/// Errors are opaque to the core; the calculator attaches grouping and
/// section context before surfacing them.
pub trait QueryExecutor {
    /// Number of distinct groups matching `filter`.
    fn count(&self, grouping: &Grouping, filter: &GroupFilter) -> anyhow::Result<i64>;

    /// Long-form `(check_name, stat_name, value)` rows for `query`.
    fn stats(&self, query: &SectionQuery) -> anyhow::Result<Vec<StatRow>>;
}

/// Executes queries directly against a materialized `EligibilitySet`.
pub struct FlagTableExecutor<'a> {
    set: &'a EligibilitySet,
}

impl<'a> FlagTableExecutor<'a> {
    pub fn new(set: &'a EligibilitySet) -> Self {
        Self { set }
    }

    /// Collapse rows into per-group flag vectors (logical OR per check).
    fn group_flags(&self, grouping: &Grouping) -> anyhow::Result<Vec<Vec<bool>>> {
        let cols = grouping
            .columns
            .iter()
            .map(|c| {
                self.set
                    .identifier_index(c)
                    .ok_or_else(|| anyhow::anyhow!("unknown grouping column '{c}'"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let mut index: HashMap<Vec<&str>, usize> = HashMap::new();
        let mut groups: Vec<Vec<bool>> = Vec::new();
        for row in self.set.rows() {
            let key: Vec<&str> = cols.iter().map(|&i| row.identifiers[i].as_str()).collect();
            match index.get(&key) {
                Some(&g) => {
                    for (slot, f) in groups[g].iter_mut().zip(&row.flags) {
                        *slot |= *f;
                    }
                }
                None => {
                    index.insert(key, groups.len());
                    groups.push(row.flags.clone());
                }
            }
        }
        Ok(groups)
    }

    fn check_filter(&self, filter: &GroupFilter) -> anyhow::Result<()> {
        for name in filter.referenced_checks() {
            if self.set.check_index(name).is_none() {
                anyhow::bail!("unknown check column '{name}'");
            }
        }
        Ok(())
    }

    fn count_in(&self, groups: &[&Vec<bool>], filter: &GroupFilter) -> i64 {
        let set = self.set;
        groups
            .iter()
            .filter(|flags| {
                filter.matches(|n| set.check_index(n).is_some_and(|i| flags[i]))
            })
            .count() as i64
    }
}

impl QueryExecutor for FlagTableExecutor<'_> {
    fn count(&self, grouping: &Grouping, filter: &GroupFilter) -> anyhow::Result<i64> {
        self.check_filter(filter)?;
        let groups = self.group_flags(grouping)?;
        let refs: Vec<&Vec<bool>> = groups.iter().collect();
        Ok(self.count_in(&refs, filter))
    }

    fn stats(&self, query: &SectionQuery) -> anyhow::Result<Vec<StatRow>> {
        self.check_filter(&query.universe)?;
        for spec in &query.stats {
            self.check_filter(&spec.filter)?;
        }
        let groups = self.group_flags(&query.grouping)?;
        let set = self.set;
        let universe: Vec<&Vec<bool>> = groups
            .iter()
            .filter(|flags| {
                query
                    .universe
                    .matches(|n| set.check_index(n).is_some_and(|i| flags[i]))
            })
            .collect();

        log::trace!(
            "flag-table: grouping={} section={} universe={} stats={}",
            query.grouping.name,
            query.section,
            universe.len(),
            query.stats.len()
        );

        Ok(query
            .stats
            .iter()
            .map(|spec| StatRow {
                check_name: spec.check.clone(),
                stat_name:  spec.stat.as_str().to_string(),
                value:      self.count_in(&universe, &spec.filter),
            })
            .collect())
    }
}
