//! Funnel calculator: the waterfall for one grouping.
//!
//! SECTION ORDER (fixed):
//!   1. Main base            universe: every group
//!   2. For each channel:
//!      a. channel base      universe: passes all main base
//!      b. each segment      universe: passes main base + channel base, and
//!                           fails at least one check of every earlier segment
//!
//! Within a section, for check c_i of the section's chain c_1..c_n:
//!   unique_drops      fails c_i
//!   incremental_drops passes c_1..c_{i-1}, fails c_i
//!   remaining         passes c_1..c_i
//!   regain            passes every c_j (j != i), fails c_i
//!   cumulative_drops  section start - remaining
//!
//! A segment claims the groups that pass all of its checks within its
//! universe, so each eligible group is claimed by at most one segment.

use crate::{
    condition::{ConditionModel, Scope},
    config::Grouping,
    error::{FunnelError, FunnelResult},
    query::{GroupFilter, QueryExecutor, SectionQuery, StatName, StatRow, StatSpec},
    types::{ChannelName, CheckName, LogScope, SegmentName},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunnelMetrics {
    pub unique_drops:      u64,
    pub incremental_drops: u64,
    pub cumulative_drops:  u64,
    pub regain:            u64,
    pub remaining:         u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunnelRow {
    pub check_name: CheckName,
    pub scope:      Scope,
    pub metrics:    FunnelMetrics,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionFunnel {
    pub scope:               Scope,
    pub starting_population: u64,
    pub rows:                Vec<FunnelRow>,
}

impl SectionFunnel {
    /// Groups passing every check of the section.
    pub fn final_remaining(&self) -> u64 {
        self.rows.last().map_or(self.starting_population, |r| r.metrics.remaining)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentClaim {
    pub segment: SegmentName,
    pub claimed: u64,
}

/// Claim-and-exclude summary for one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelClaims {
    pub channel:   ChannelName,
    /// Groups passing main base and channel base.
    pub eligible:  u64,
    pub claims:    Vec<SegmentClaim>,
    pub unclaimed: u64,
}

impl ChannelClaims {
    pub fn total_claimed(&self) -> u64 {
        self.claims.iter().map(|c| c.claimed).sum()
    }

    pub fn claimed_by(&self, segment: &str) -> Option<u64> {
        self.claims.iter().find(|c| c.segment == segment).map(|c| c.claimed)
    }
}

/// All sections of one grouping's waterfall.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupingFunnel {
    pub grouping:            String,
    pub starting_population: u64,
    pub sections:            Vec<SectionFunnel>,
    pub claims:              Vec<ChannelClaims>,
}

impl GroupingFunnel {
    /// Every row, in evaluation order.
    pub fn rows(&self) -> impl Iterator<Item = &FunnelRow> {
        self.sections.iter().flat_map(|s| s.rows.iter())
    }

    pub fn row(&self, check: &str) -> Option<&FunnelRow> {
        self.rows().find(|r| r.check_name == check)
    }

    pub fn section(&self, scope: &Scope) -> Option<&SectionFunnel> {
        self.sections.iter().find(|s| &s.scope == scope)
    }

    pub fn channel_claims(&self, channel: &str) -> Option<&ChannelClaims> {
        self.claims.iter().find(|c| c.channel == channel)
    }
}

/// One section to compute: its universe and its ordered check chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionPlan {
    pub scope:    Scope,
    pub universe: GroupFilter,
    pub checks:   Vec<CheckName>,
}

impl SectionPlan {
    /// The long-form stat request for this section.
    pub fn query(&self, grouping: &Grouping) -> SectionQuery {
        let mut stats = Vec::with_capacity(self.checks.len() * StatName::ALL.len());
        for (i, check) in self.checks.iter().enumerate() {
            let before = &self.checks[..i];
            let others = self.checks.iter().filter(|c| *c != check);
            stats.push(StatSpec {
                check:  check.clone(),
                stat:   StatName::UniqueDrops,
                filter: GroupFilter::all().fails(check),
            });
            stats.push(StatSpec {
                check:  check.clone(),
                stat:   StatName::IncrementalDrops,
                filter: GroupFilter::all().passes_all(before).fails(check),
            });
            stats.push(StatSpec {
                check:  check.clone(),
                stat:   StatName::Remaining,
                filter: GroupFilter::all().passes_all(before).passes(check),
            });
            stats.push(StatSpec {
                check:  check.clone(),
                stat:   StatName::Regain,
                filter: GroupFilter::all().passes_all(others).fails(check),
            });
        }
        SectionQuery {
            grouping: grouping.clone(),
            section:  self.scope.to_string(),
            universe: self.universe.clone(),
            stats,
        }
    }
}

pub struct FunnelCalculator<'a> {
    model: &'a ConditionModel,
}

impl<'a> FunnelCalculator<'a> {
    pub fn new(model: &'a ConditionModel) -> Self {
        Self { model }
    }

    /// Main base plus every channel base section, in evaluation order.
    /// Segment sections depend on claims and are planned per channel.
    pub fn base_plans(&self) -> Vec<SectionPlan> {
        let main = self.model.main_base();
        let mut plans = vec![SectionPlan {
            scope:    Scope::MainBase,
            universe: GroupFilter::all(),
            checks:   main.to_vec(),
        }];
        for ch in self.model.channels() {
            plans.push(SectionPlan {
                scope:    Scope::ChannelBase { channel: ch.name.clone() },
                universe: GroupFilter::all().passes_all(main),
                checks:   ch.base.clone(),
            });
        }
        plans
    }

    /// Segment sections for `channel`, each excluding earlier segments' claims.
    pub fn segment_plans(&self, channel: &str) -> FunnelResult<Vec<SectionPlan>> {
        let ch = self
            .model
            .channel(channel)
            .ok_or_else(|| FunnelError::UnknownChannel { name: channel.to_string() })?;
        let mut universe = self.eligible_filter(channel)?;
        let mut plans = Vec::with_capacity(ch.segments.len());
        for seg in &ch.segments {
            plans.push(SectionPlan {
                scope: Scope::Segment {
                    channel: ch.name.clone(),
                    segment: seg.name.clone(),
                },
                universe: universe.clone(),
                checks: seg.checks.clone(),
            });
            universe = universe.fails_any_of(&seg.checks);
        }
        Ok(plans)
    }

    /// Groups eligible for `channel`'s segments.
    pub fn eligible_filter(&self, channel: &str) -> FunnelResult<GroupFilter> {
        let ch = self
            .model
            .channel(channel)
            .ok_or_else(|| FunnelError::UnknownChannel { name: channel.to_string() })?;
        Ok(GroupFilter::all().passes_all(self.model.main_base()).passes_all(&ch.base))
    }

    /// Compute every section of the waterfall for `grouping`.
    ///
    /// Any executor failure or malformed result aborts this grouping only.
    pub fn compute<E: QueryExecutor + ?Sized>(
        &self,
        grouping: &Grouping,
        executor: &E,
    ) -> FunnelResult<GroupingFunnel> {
        let scope = LogScope::grouping(&grouping.name);
        let starting_population =
            self.count(grouping, &GroupFilter::all(), executor, &scope.section("population"))?;
        log::info!("{scope} starting population {starting_population}");

        let mut plans = self.base_plans().into_iter();
        let mut sections = Vec::new();
        if let Some(main) = plans.next() {
            if !main.checks.is_empty() {
                sections.push(self.compute_section(grouping, &main, executor, &scope)?);
            }
        }

        let mut claims = Vec::new();
        for (ch, base_plan) in self.model.channels().iter().zip(plans) {
            if !base_plan.checks.is_empty() {
                sections.push(self.compute_section(grouping, &base_plan, executor, &scope)?);
            }
            if ch.segments.is_empty() {
                continue;
            }
            let ch_scope = scope.section(format!("{}/segments", ch.name));
            let eligible_filter = self.eligible_filter(&ch.name)?;
            let eligible = self.count(grouping, &eligible_filter, executor, &ch_scope)?;

            let mut channel_claims = Vec::with_capacity(ch.segments.len());
            for plan in self.segment_plans(&ch.name)? {
                let section = self.compute_section(grouping, &plan, executor, &scope)?;
                channel_claims.push(SegmentClaim {
                    segment: plan.scope.template().to_string(),
                    claimed: section.final_remaining(),
                });
                sections.push(section);
            }

            let unclaimed_filter = ch
                .segments
                .iter()
                .fold(eligible_filter, |f, seg| f.fails_any_of(&seg.checks));
            let unclaimed = self.count(grouping, &unclaimed_filter, executor, &ch_scope)?;

            let claims_for_channel = ChannelClaims {
                channel: ch.name.clone(),
                eligible,
                claims: channel_claims,
                unclaimed,
            };
            if claims_for_channel.total_claimed() + unclaimed != eligible {
                return Err(shape_error(
                    &ch_scope,
                    format!(
                        "segment claims {} + unclaimed {unclaimed} != eligible {eligible}",
                        claims_for_channel.total_claimed()
                    ),
                ));
            }
            log::info!(
                "{ch_scope} eligible={eligible} claimed={} unclaimed={unclaimed}",
                claims_for_channel.total_claimed()
            );
            claims.push(claims_for_channel);
        }

        Ok(GroupingFunnel {
            grouping: grouping.name.clone(),
            starting_population,
            sections,
            claims,
        })
    }

    fn compute_section<E: QueryExecutor + ?Sized>(
        &self,
        grouping: &Grouping,
        plan: &SectionPlan,
        executor: &E,
        scope: &LogScope,
    ) -> FunnelResult<SectionFunnel> {
        let scope = scope.section(&plan.scope);
        let start = self.count(grouping, &plan.universe, executor, &scope)?;
        let query = plan.query(grouping);
        let rows = executor
            .stats(&query)
            .map_err(|e| query_error(&scope, e))?;
        let pivot = pivot_stats(rows, &plan.checks, &scope)?;

        let mut out = Vec::with_capacity(plan.checks.len());
        let mut previous_remaining = start;
        for check in &plan.checks {
            let stats = &pivot[check];
            let (unique, incremental, remaining, regain) = (
                stats[&StatName::UniqueDrops],
                stats[&StatName::IncrementalDrops],
                stats[&StatName::Remaining],
                stats[&StatName::Regain],
            );
            if previous_remaining.checked_sub(incremental) != Some(remaining) {
                return Err(shape_error(
                    &scope,
                    format!(
                        "check '{check}': remaining {remaining} != previous {previous_remaining} - incremental {incremental}"
                    ),
                ));
            }
            if unique < incremental || unique > start || regain > incremental {
                return Err(shape_error(
                    &scope,
                    format!(
                        "check '{check}': inconsistent counts unique={unique} incremental={incremental} regain={regain} start={start}"
                    ),
                ));
            }
            out.push(FunnelRow {
                check_name: check.clone(),
                scope:      plan.scope.clone(),
                metrics: FunnelMetrics {
                    unique_drops:      unique,
                    incremental_drops: incremental,
                    cumulative_drops:  start - remaining,
                    regain,
                    remaining,
                },
            });
            previous_remaining = remaining;
        }

        log::debug!(
            "{scope} start={start} checks={} remaining={previous_remaining}",
            plan.checks.len()
        );
        Ok(SectionFunnel {
            scope: plan.scope.clone(),
            starting_population: start,
            rows: out,
        })
    }

    fn count<E: QueryExecutor + ?Sized>(
        &self,
        grouping: &Grouping,
        filter: &GroupFilter,
        executor: &E,
        scope: &LogScope,
    ) -> FunnelResult<u64> {
        let n = executor.count(grouping, filter).map_err(|e| query_error(scope, e))?;
        u64::try_from(n).map_err(|_| shape_error(scope, format!("negative count {n}")))
    }
}

/// Pivot long-form stat rows to `check -> stat -> value`, rejecting any
/// unknown, duplicate, missing or negative entry.
pub fn pivot_stats(
    rows: Vec<StatRow>,
    checks: &[CheckName],
    scope: &LogScope,
) -> FunnelResult<HashMap<CheckName, HashMap<StatName, u64>>> {
    let mut pivot: HashMap<CheckName, HashMap<StatName, u64>> =
        checks.iter().map(|c| (c.clone(), HashMap::new())).collect();

    for row in rows {
        let stat = StatName::parse(&row.stat_name).ok_or_else(|| {
            shape_error(scope, format!("unexpected stat '{}'", row.stat_name))
        })?;
        let value = u64::try_from(row.value).map_err(|_| {
            shape_error(
                scope,
                format!("negative {stat} {} for '{}'", row.value, row.check_name),
            )
        })?;
        let entry = pivot.get_mut(&row.check_name).ok_or_else(|| {
            shape_error(scope, format!("unexpected check '{}'", row.check_name))
        })?;
        if entry.insert(stat, value).is_some() {
            return Err(shape_error(
                scope,
                format!("duplicate {stat} for '{}'", row.check_name),
            ));
        }
    }

    for check in checks {
        for stat in StatName::ALL {
            if !pivot[check].contains_key(&stat) {
                return Err(shape_error(scope, format!("missing {stat} for '{check}'")));
            }
        }
    }
    Ok(pivot)
}

fn parts(scope: &LogScope) -> (String, String) {
    (
        scope.grouping.clone().unwrap_or_default(),
        scope.section.clone().unwrap_or_default(),
    )
}

fn query_error(scope: &LogScope, e: anyhow::Error) -> FunnelError {
    let (grouping, section) = parts(scope);
    FunnelError::QueryFailed { grouping, section, message: format!("{e:#}") }
}

fn shape_error(scope: &LogScope, message: String) -> FunnelError {
    let (grouping, section) = parts(scope);
    FunnelError::ShapeMismatch { grouping, section, message }
}
