//! Historical snapshots: what gets persisted per run, and how a baseline
//! run is chosen for comparison.
//!
//! RULE: snapshots are append-only. A baseline is always a *whole* run for
//! one grouping; rows from different runs are never mixed.

use crate::{
    condition::ConditionModel,
    error::FunnelResult,
    funnel::{FunnelMetrics, GroupingFunnel},
    store::HistoryStore,
    types::{CheckName, RunTimestamp},
};
use chrono::Duration;
use serde::{Deserialize, Serialize};

/// How the comparison baseline is selected. Exactly one is active per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookBack {
    /// Most recent run within the last `days` days.
    RecentWindow { days: i64 },
    /// Run closest to `days` days ago, before or after.
    NearestOffset { days: i64 },
}

impl LookBack {
    pub fn days(&self) -> i64 {
        match self {
            LookBack::RecentWindow { days } | LookBack::NearestOffset { days } => *days,
        }
    }

    /// Choose the baseline snapshot for `grouping` as of `now`.
    pub fn select(
        &self,
        store: &HistoryStore,
        grouping: &str,
        now: RunTimestamp,
    ) -> FunnelResult<Option<Snapshot>> {
        match *self {
            LookBack::RecentWindow { days } => {
                store.find_latest_between(grouping, now - Duration::days(days), now)
            }
            LookBack::NearestOffset { days } => {
                store.find_nearest(grouping, now - Duration::days(days))
            }
        }
    }
}

/// One persisted check row, with criteria copied at write time so the
/// history stays readable after the configuration changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRow {
    pub section:     String,
    pub template:    String,
    pub position:    usize,
    pub check_name:  CheckName,
    pub criteria:    Option<String>,
    pub description: Option<String>,
    pub metrics:     FunnelMetrics,
}

impl SnapshotRow {
    /// Denormalize a computed funnel against the model that produced it.
    pub fn from_funnel(funnel: &GroupingFunnel, model: &ConditionModel) -> Vec<SnapshotRow> {
        funnel
            .rows()
            .enumerate()
            .map(|(i, row)| {
                let check = model.get(&row.check_name);
                SnapshotRow {
                    section:     row.scope.section().to_string(),
                    template:    row.scope.template().to_string(),
                    position:    check.map_or(i, |c| c.position),
                    check_name:  row.check_name.clone(),
                    criteria:    check.map(|c| c.predicate.clone()),
                    description: check.and_then(|c| c.description.clone()),
                    metrics:     row.metrics,
                }
            })
            .collect()
    }
}

/// All rows of one run for one grouping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub run_id:              String,
    pub run_timestamp:       RunTimestamp,
    pub grouping:            String,
    pub starting_population: u64,
    pub rows:                Vec<SnapshotRow>,
}

impl Snapshot {
    pub fn row(&self, check: &str) -> Option<&SnapshotRow> {
        self.rows.iter().find(|r| r.check_name == check)
    }
}
