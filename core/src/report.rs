//! Report assembly: current funnels side by side per grouping, optionally
//! compared against each grouping's historical baseline.
//!
//! Rows follow the condition model's evaluation order. A check that exists
//! on only one side (added since the baseline, or removed from the config)
//! still gets a row, blank on the missing side.

use crate::{
    condition::{ConditionModel, Scope},
    config::ReportMeta,
    funnel::{ChannelClaims, FunnelMetrics, GroupingFunnel},
    history::Snapshot,
    types::{CheckName, RunTimestamp},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Signed `current - previous` per metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricDelta {
    pub unique_drops:      i64,
    pub incremental_drops: i64,
    pub cumulative_drops:  i64,
    pub regain:            i64,
    pub remaining:         i64,
}

/// Percent change per metric; `None` when the previous value is zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PercentChange {
    pub unique_drops:      Option<f64>,
    pub incremental_drops: Option<f64>,
    pub cumulative_drops:  Option<f64>,
    pub regain:            Option<f64>,
    pub remaining:         Option<f64>,
}

pub fn delta(current: &FunnelMetrics, previous: &FunnelMetrics) -> MetricDelta {
    let d = |c: u64, p: u64| c as i64 - p as i64;
    MetricDelta {
        unique_drops:      d(current.unique_drops, previous.unique_drops),
        incremental_drops: d(current.incremental_drops, previous.incremental_drops),
        cumulative_drops:  d(current.cumulative_drops, previous.cumulative_drops),
        regain:            d(current.regain, previous.regain),
        remaining:         d(current.remaining, previous.remaining),
    }
}

pub fn percent_change(current: u64, previous: u64) -> Option<f64> {
    if previous == 0 {
        return None;
    }
    Some((current as f64 - previous as f64) / previous as f64 * 100.0)
}

fn percent_changes(current: &FunnelMetrics, previous: &FunnelMetrics) -> PercentChange {
    PercentChange {
        unique_drops:      percent_change(current.unique_drops, previous.unique_drops),
        incremental_drops: percent_change(current.incremental_drops, previous.incremental_drops),
        cumulative_drops:  percent_change(current.cumulative_drops, previous.cumulative_drops),
        regain:            percent_change(current.regain, previous.regain),
        remaining:         percent_change(current.remaining, previous.remaining),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportCell {
    pub current:    Option<FunnelMetrics>,
    pub previous:   Option<FunnelMetrics>,
    pub delta:      Option<MetricDelta>,
    pub pct_change: Option<PercentChange>,
}

impl ReportCell {
    fn new(current: Option<FunnelMetrics>, previous: Option<FunnelMetrics>) -> Self {
        let (delta, pct_change) = match (&current, &previous) {
            (Some(c), Some(p)) => (Some(delta(c, p)), Some(percent_changes(c, p))),
            _ => (None, None),
        };
        Self { current, previous, delta, pct_change }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRow {
    pub section:     String,
    pub template:    String,
    pub check_name:  CheckName,
    pub criteria:    Option<String>,
    pub description: Option<String>,
    /// False for checks only present in a historical baseline.
    pub in_current:  bool,
    /// One cell per entry of `Report::groupings`, same order.
    pub cells:       Vec<ReportCell>,
}

/// Starting population of one section, one entry per grouping column;
/// `None` where that grouping has no such section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionStart {
    pub section:     String,
    pub template:    String,
    pub populations: Vec<Option<u64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupingColumn {
    pub grouping:                     String,
    pub starting_population:          u64,
    pub previous_starting_population: Option<u64>,
    pub baseline_run:                 Option<RunTimestamp>,
    pub claims:                       Vec<ChannelClaims>,
}

impl GroupingColumn {
    pub fn has_history(&self) -> bool {
        self.baseline_run.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportHeader {
    pub offer_code:       String,
    pub campaign_planner: String,
    pub lead:             String,
    pub run_timestamp:    RunTimestamp,
}

/// A grouping whose section was omitted, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportFailure {
    pub grouping: String,
    pub message:  String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub header:         ReportHeader,
    pub groupings:      Vec<GroupingColumn>,
    pub section_starts: Vec<SectionStart>,
    pub rows:           Vec<ReportRow>,
    pub failures:       Vec<ReportFailure>,
}

impl Report {
    pub fn row(&self, check: &str) -> Option<&ReportRow> {
        self.rows.iter().find(|r| r.check_name == check)
    }

    pub fn grouping_index(&self, grouping: &str) -> Option<usize> {
        self.groupings.iter().position(|g| g.grouping == grouping)
    }

    pub fn section_start(&self, section: &str, template: &str) -> Option<&SectionStart> {
        self.section_starts
            .iter()
            .find(|s| s.section == section && s.template == template)
    }

    /// The cell for `check` under `grouping`.
    pub fn cell(&self, check: &str, grouping: &str) -> Option<&ReportCell> {
        let i = self.grouping_index(grouping)?;
        self.row(check).and_then(|r| r.cells.get(i))
    }
}

pub struct ReportAssembler<'a> {
    model: &'a ConditionModel,
    meta:  &'a ReportMeta,
}

impl<'a> ReportAssembler<'a> {
    pub fn new(model: &'a ConditionModel, meta: &'a ReportMeta) -> Self {
        Self { model, meta }
    }

    /// Merge current funnels with their (optional) baselines.
    ///
    /// `previous` is keyed by grouping name; groupings without an entry are
    /// reported current-only.
    pub fn assemble(
        &self,
        run_timestamp: RunTimestamp,
        funnels: &[GroupingFunnel],
        previous: &HashMap<String, Snapshot>,
        failures: Vec<ReportFailure>,
    ) -> Report {
        let groupings: Vec<GroupingColumn> = funnels
            .iter()
            .map(|f| {
                let prev = previous.get(&f.grouping);
                GroupingColumn {
                    grouping:                     f.grouping.clone(),
                    starting_population:          f.starting_population,
                    previous_starting_population: prev.map(|s| s.starting_population),
                    baseline_run:                 prev.map(|s| s.run_timestamp),
                    claims:                       f.claims.clone(),
                }
            })
            .collect();

        let mut scopes: Vec<&Scope> = Vec::new();
        for check in self.model.checks() {
            if !scopes.contains(&&check.scope) {
                scopes.push(&check.scope);
            }
        }
        let section_starts = scopes
            .into_iter()
            .map(|scope| SectionStart {
                section:     scope.section().to_string(),
                template:    scope.template().to_string(),
                populations: funnels
                    .iter()
                    .map(|f| f.section(scope).map(|s| s.starting_population))
                    .collect(),
            })
            .collect();

        let cell_for = |check: &str| -> Vec<ReportCell> {
            funnels
                .iter()
                .map(|f| {
                    let current = f.row(check).map(|r| r.metrics);
                    let prev = previous
                        .get(&f.grouping)
                        .and_then(|s| s.row(check))
                        .map(|r| r.metrics);
                    ReportCell::new(current, prev)
                })
                .collect()
        };

        let mut rows: Vec<ReportRow> = self
            .model
            .checks()
            .iter()
            .map(|check| ReportRow {
                section:     check.scope.section().to_string(),
                template:    check.scope.template().to_string(),
                check_name:  check.name.clone(),
                criteria:    Some(check.predicate.clone()),
                description: check.description.clone(),
                in_current:  true,
                cells:       cell_for(&check.name),
            })
            .collect();

        // Checks that only exist in a baseline, placed after the last row of
        // their template, else of their section, else at the end.
        let mut orphans: Vec<&crate::history::SnapshotRow> = Vec::new();
        for f in funnels {
            if let Some(snapshot) = previous.get(&f.grouping) {
                for r in &snapshot.rows {
                    if self.model.get(&r.check_name).is_none()
                        && !orphans.iter().any(|o| o.check_name == r.check_name)
                    {
                        orphans.push(r);
                    }
                }
            }
        }
        orphans.sort_by_key(|r| r.position);
        for orphan in orphans {
            let row = ReportRow {
                section:     orphan.section.clone(),
                template:    orphan.template.clone(),
                check_name:  orphan.check_name.clone(),
                criteria:    orphan.criteria.clone(),
                description: orphan.description.clone(),
                in_current:  false,
                cells:       cell_for(&orphan.check_name),
            };
            let same_template = rows
                .iter()
                .rposition(|r| r.section == orphan.section && r.template == orphan.template);
            let slot = same_template.or_else(|| rows.iter().rposition(|r| r.section == orphan.section));
            match slot {
                Some(i) => rows.insert(i + 1, row),
                None => rows.push(row),
            }
        }

        Report {
            header: ReportHeader {
                offer_code:       self.meta.offer_code.clone(),
                campaign_planner: self.meta.campaign_planner.clone(),
                lead:             self.meta.lead.clone(),
                run_timestamp,
            },
            groupings,
            section_starts,
            rows,
            failures,
        }
    }
}
