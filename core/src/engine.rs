//! The funnel engine: one batch run over every configured grouping.
//!
//! EXECUTION ORDER (fixed):
//!   1. Compute each grouping's funnel, in configured order
//!   2. Select each grouping's historical baseline (history enabled only)
//!   3. Append this run's snapshots, one atomic write per grouping
//!   4. Assemble the report
//!
//! RULES:
//!   - A failing grouping is logged, listed in the outcome and skipped;
//!     the other groupings continue.
//!   - Baselines are selected before this run is written, so a run never
//!     compares against itself.
//!   - A history read failure means "no history" for that grouping.
//!   - The flag set is read-only for the whole run.

use crate::{
    config::ValidatedConfig,
    error::FunnelResult,
    funnel::{FunnelCalculator, GroupingFunnel},
    history::{Snapshot, SnapshotRow},
    query::QueryExecutor,
    report::{Report, ReportAssembler, ReportFailure},
    store::HistoryStore,
    types::{LogScope, RunId, RunTimestamp},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The funnel could not be computed; the grouping is absent from the report.
    Query,
    /// The baseline could not be read; the grouping is reported current-only.
    HistoryRead,
    /// This run's snapshot was not persisted.
    HistoryWrite,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupingFailure {
    pub grouping: String,
    pub kind:     FailureKind,
    pub message:  String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id:        RunId,
    pub run_timestamp: RunTimestamp,
    pub funnels:       Vec<GroupingFunnel>,
    pub failures:      Vec<GroupingFailure>,
    /// Baseline per grouping name, for groupings that had one.
    pub baselines:     HashMap<String, Snapshot>,
    pub report:        Report,
}

impl RunOutcome {
    pub fn funnel(&self, grouping: &str) -> Option<&GroupingFunnel> {
        self.funnels.iter().find(|f| f.grouping == grouping)
    }

    pub fn failures_of(&self, kind: FailureKind) -> impl Iterator<Item = &GroupingFailure> {
        self.failures.iter().filter(move |f| f.kind == kind)
    }

    /// True when every grouping was computed and persisted.
    pub fn is_complete(&self) -> bool {
        self.failures_of(FailureKind::Query).next().is_none()
            && self.failures_of(FailureKind::HistoryWrite).next().is_none()
    }
}

pub struct FunnelEngine<'a> {
    config: &'a ValidatedConfig,
    store:  Option<&'a HistoryStore>,
}

impl<'a> FunnelEngine<'a> {
    pub fn new(config: &'a ValidatedConfig) -> Self {
        Self { config, store: None }
    }

    /// Attach a migrated history store. Ignored when history is disabled.
    pub fn with_history(mut self, store: &'a HistoryStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Run every grouping against `executor` as of `now`.
    ///
    /// Only errors that invalidate the whole run are returned as `Err`;
    /// per-grouping problems land in `RunOutcome::failures`.
    pub fn run<E: QueryExecutor + ?Sized>(
        &self,
        executor: &E,
        now: RunTimestamp,
    ) -> FunnelResult<RunOutcome> {
        let run_id = Uuid::new_v4().to_string();
        let model = &self.config.conditions;
        let calculator = FunnelCalculator::new(model);
        log::info!(
            "run={run_id} groupings={} checks={} history={}",
            self.config.groupings.len(),
            model.len(),
            self.history_enabled()
        );

        let mut funnels = Vec::with_capacity(self.config.groupings.len());
        let mut failures = Vec::new();
        for grouping in &self.config.groupings {
            let scope = LogScope::grouping(&grouping.name);
            match calculator.compute(grouping, executor) {
                Ok(funnel) => funnels.push(funnel),
                Err(e) => {
                    log::error!("{scope} skipped: {e}");
                    failures.push(GroupingFailure {
                        grouping: grouping.name.clone(),
                        kind:     FailureKind::Query,
                        message:  e.to_string(),
                    });
                }
            }
        }

        let baselines = self.select_baselines(&funnels, now, &mut failures);
        self.persist(&run_id, now, &funnels, &mut failures);

        let report_failures = failures
            .iter()
            .map(|f| ReportFailure {
                grouping: f.grouping.clone(),
                message:  f.message.clone(),
            })
            .collect();
        let report = ReportAssembler::new(model, &self.config.report).assemble(
            now,
            &funnels,
            &baselines,
            report_failures,
        );

        log::info!(
            "run={run_id} complete: {} grouping(s) reported, {} failure(s)",
            funnels.len(),
            failures.len()
        );
        Ok(RunOutcome {
            run_id,
            run_timestamp: now,
            funnels,
            failures,
            baselines,
            report,
        })
    }

    fn history_enabled(&self) -> bool {
        self.config.history.is_some() && self.store.is_some()
    }

    fn select_baselines(
        &self,
        funnels: &[GroupingFunnel],
        now: RunTimestamp,
        failures: &mut Vec<GroupingFailure>,
    ) -> HashMap<String, Snapshot> {
        let mut baselines = HashMap::new();
        let (Some(policy), Some(store)) = (self.config.history, self.store) else {
            return baselines;
        };
        for funnel in funnels {
            let scope = LogScope::grouping(&funnel.grouping);
            match policy.select(store, &funnel.grouping, now) {
                Ok(Some(snapshot)) => {
                    log::info!("{scope} baseline run={} at {}", snapshot.run_id, snapshot.run_timestamp);
                    baselines.insert(funnel.grouping.clone(), snapshot);
                }
                Ok(None) => log::info!("{scope} no history for {policy:?}"),
                Err(e) => {
                    log::warn!("{scope} history unavailable, reporting current only: {e}");
                    failures.push(GroupingFailure {
                        grouping: funnel.grouping.clone(),
                        kind:     FailureKind::HistoryRead,
                        message:  e.to_string(),
                    });
                }
            }
        }
        baselines
    }

    fn persist(
        &self,
        run_id: &str,
        now: RunTimestamp,
        funnels: &[GroupingFunnel],
        failures: &mut Vec<GroupingFailure>,
    ) {
        let Some(store) = self.store.filter(|_| self.config.history.is_some()) else {
            return;
        };
        if funnels.is_empty() {
            return;
        }
        if let Err(e) = self.write_run(store, run_id, now) {
            log::error!("run={run_id} could not be recorded: {e}");
            for funnel in funnels {
                failures.push(GroupingFailure {
                    grouping: funnel.grouping.clone(),
                    kind:     FailureKind::HistoryWrite,
                    message:  e.to_string(),
                });
            }
            return;
        }
        for funnel in funnels {
            let rows = SnapshotRow::from_funnel(funnel, &self.config.conditions);
            if let Err(e) =
                store.record(run_id, now, &funnel.grouping, &rows, funnel.starting_population)
            {
                log::error!("{} snapshot not written: {e}", LogScope::grouping(&funnel.grouping));
                failures.push(GroupingFailure {
                    grouping: funnel.grouping.clone(),
                    kind:     FailureKind::HistoryWrite,
                    message:  e.to_string(),
                });
            }
        }
    }

    fn write_run(&self, store: &HistoryStore, run_id: &str, now: RunTimestamp) -> FunnelResult<()> {
        store.insert_run(
            run_id,
            now,
            &self.config.eligibility_table,
            &self.config.report.offer_code,
            env!("CARGO_PKG_VERSION"),
        )
    }
}
