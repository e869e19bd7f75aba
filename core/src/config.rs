//! Campaign configuration: the nested check tree, groupings and history
//! policy, loaded from JSON and validated once into `ValidatedConfig`.

use crate::{
    condition::ConditionModel,
    error::{ConfigError, ConfigErrors, FunnelResult},
    history::LookBack,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

// ── Checks ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckConfig {
    pub name: String,
    /// Opaque boolean expression; only the predicate evaluator reads it.
    #[serde(alias = "sql")]
    pub predicate: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub prior: Option<PriorModifier>,
}

/// Ties a check to the outcome of the checks evaluated before it in its chain.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PriorModifier {
    PassAllPrior,
    FailAllPrior,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SegmentConfig {
    pub name: String,
    pub checks: Vec<CheckConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MainConditions {
    #[serde(rename = "BA", default)]
    pub base: Vec<CheckConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelConfig {
    pub name: String,
    #[serde(rename = "BA", default)]
    pub base: Vec<CheckConfig>,
    /// Claim priority is the order of this list.
    #[serde(default)]
    pub segments: Vec<SegmentConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConditionsConfig {
    #[serde(default)]
    pub main: MainConditions,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

// ── Eligibility / waterfall ─────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EligibilityConfig {
    pub eligibility_table: String,
    pub unique_identifiers: Vec<String>,
    pub conditions: ConditionsConfig,
}

/// One `count_columns` entry: a single column or a composite list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum GroupingSpec {
    Single(String),
    Composite(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaterfallConfig {
    pub count_columns: Vec<GroupingSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub recent_window_days: Option<i64>,
    #[serde(default)]
    pub nearest_offset_days: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportMeta {
    #[serde(default)]
    pub offer_code: String,
    #[serde(default)]
    pub campaign_planner: String,
    #[serde(default)]
    pub lead: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignConfig {
    pub eligibility: EligibilityConfig,
    pub waterfall: WaterfallConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    /// Channels whose segment assignment is exported downstream.
    #[serde(default)]
    pub output_channels: Vec<String>,
    #[serde(default)]
    pub report: ReportMeta,
}

/// A named set of identifier columns over which a funnel is aggregated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grouping {
    pub name: String,
    pub columns: Vec<String>,
}

impl Grouping {
    pub fn new(columns: &[&str]) -> Self {
        let columns: Vec<String> = columns.iter().map(|c| strip_alias(c).to_string()).collect();
        Self { name: columns.join("_"), columns }
    }
}

/// The immutable result of a successful validation pass.
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    pub eligibility_table:  String,
    pub unique_identifiers: Vec<String>,
    pub conditions:         ConditionModel,
    pub groupings:          Vec<Grouping>,
    /// `None` when history tracking is disabled.
    pub history:            Option<LookBack>,
    pub output_channels:    Vec<String>,
    pub report:             ReportMeta,
}

/// `t.customer_id` → `customer_id`.
pub fn strip_alias(column: &str) -> &str {
    column.rsplit('.').next().unwrap_or(column)
}

impl CampaignConfig {
    /// Read a JSON config file. Does not validate.
    pub fn load(path: &str) -> FunnelResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let config: CampaignConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Validate every section in one pass, collecting all problems.
    pub fn validate(&self) -> Result<ValidatedConfig, ConfigErrors> {
        let mut errors = Vec::new();

        let unique_identifiers: Vec<String> = self
            .eligibility
            .unique_identifiers
            .iter()
            .map(|u| strip_alias(u).to_string())
            .collect();
        if unique_identifiers.is_empty() {
            errors.push(ConfigError::NoUniqueIdentifiers);
        }

        let conditions =
            match ConditionModel::build(&self.eligibility.conditions, &self.output_channels) {
                Ok(model) => Some(model),
                Err(ConfigErrors(mut found)) => {
                    errors.append(&mut found);
                    None
                }
            };

        let groupings = self.validate_groupings(&unique_identifiers, &mut errors);
        let history = self.validate_history(&mut errors);

        match conditions {
            Some(conditions) if errors.is_empty() => Ok(ValidatedConfig {
                eligibility_table: self.eligibility.eligibility_table.clone(),
                unique_identifiers,
                conditions,
                groupings,
                history,
                output_channels: self.output_channels.clone(),
                report: self.report.clone(),
            }),
            _ => Err(ConfigErrors(errors)),
        }
    }

    fn validate_groupings(
        &self,
        unique_identifiers: &[String],
        errors: &mut Vec<ConfigError>,
    ) -> Vec<Grouping> {
        let mut groupings = Vec::new();
        let mut seen = HashSet::new();
        for (index, spec) in self.waterfall.count_columns.iter().enumerate() {
            let columns: Vec<&str> = match spec {
                GroupingSpec::Single(c) => vec![c.as_str()],
                GroupingSpec::Composite(cs) => cs.iter().map(String::as_str).collect(),
            };
            if columns.is_empty() {
                errors.push(ConfigError::EmptyGrouping { index });
                continue;
            }
            let grouping = Grouping::new(&columns);
            for column in &grouping.columns {
                if !unique_identifiers.contains(column) {
                    errors.push(ConfigError::UnknownGroupingColumn {
                        column:      column.clone(),
                        identifiers: unique_identifiers.to_vec(),
                    });
                }
            }
            if !seen.insert(grouping.name.clone()) {
                errors.push(ConfigError::DuplicateGrouping { name: grouping.name.clone() });
                continue;
            }
            groupings.push(grouping);
        }
        groupings
    }

    fn validate_history(&self, errors: &mut Vec<ConfigError>) -> Option<LookBack> {
        let h = &self.history;
        if !h.enabled {
            return None;
        }
        let policy = match (h.recent_window_days, h.nearest_offset_days) {
            (Some(days), None) => LookBack::RecentWindow { days },
            (None, Some(days)) => LookBack::NearestOffset { days },
            _ => {
                errors.push(ConfigError::AmbiguousHistoryPolicy);
                return None;
            }
        };
        if policy.days() <= 0 {
            errors.push(ConfigError::InvalidLookBack { days: policy.days() });
            return None;
        }
        Some(policy)
    }

    /// Config with hardcoded defaults for use in tests.
    ///
    /// Main base `[main_ba_1, main_ba_2]`; channel `email` with one base
    /// check and segments `[seg_a, seg_b]`; channel `sms` with one base
    /// check and no segments. Groupings `customer_id` and
    /// `customer_id_account_id`.
    pub fn default_test() -> Self {
        fn check(name: &str) -> CheckConfig {
            CheckConfig {
                name:        name.into(),
                predicate:   name.into(),
                description: Some(format!("{name} passes")),
                prior:       None,
            }
        }

        CampaignConfig {
            eligibility: EligibilityConfig {
                eligibility_table:  "campaign_elig".into(),
                unique_identifiers: vec!["c.customer_id".into(), "a.account_id".into()],
                conditions: ConditionsConfig {
                    main: MainConditions {
                        base: vec![check("main_ba_1"), check("main_ba_2")],
                    },
                    channels: vec![
                        ChannelConfig {
                            name: "email".into(),
                            base: vec![check("email_ba_1")],
                            segments: vec![
                                SegmentConfig {
                                    name:   "seg_a".into(),
                                    checks: vec![check("email_seg_a_1"), check("email_seg_a_2")],
                                },
                                SegmentConfig {
                                    name:   "seg_b".into(),
                                    checks: vec![check("email_seg_b_1")],
                                },
                            ],
                        },
                        ChannelConfig {
                            name:     "sms".into(),
                            base:     vec![check("sms_ba_1")],
                            segments: vec![],
                        },
                    ],
                },
            },
            waterfall: WaterfallConfig {
                count_columns: vec![
                    GroupingSpec::Single("c.customer_id".into()),
                    GroupingSpec::Composite(vec!["c.customer_id".into(), "a.account_id".into()]),
                ],
            },
            history: HistoryConfig {
                enabled:             true,
                recent_window_days:  None,
                nearest_offset_days: Some(7),
            },
            output_channels: vec!["email".into()],
            report: ReportMeta {
                offer_code:       "TEST-OFFER".into(),
                campaign_planner: "planner".into(),
                lead:             "lead".into(),
            },
        }
    }
}
