//! Condition model: the check hierarchy, flattened into evaluation order.
//!
//! EVALUATION ORDER (fixed):
//!   1. Main base checks
//!   2. For each channel, in configured order:
//!      a. the channel's base checks
//!      b. each segment's checks, segments in configured (claim) order
//!
//! `ConditionModel::build` is the only constructor; the result is immutable.

use crate::{
    config::{CheckConfig, ConditionsConfig, PriorModifier},
    error::{ConfigError, ConfigErrors},
    types::{ChannelName, CheckName, SegmentName, BASE_TEMPLATE, MAIN_SECTION},
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt};

/// Where a check sits in the hierarchy. Also identifies a funnel section.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Scope {
    MainBase,
    ChannelBase { channel: ChannelName },
    Segment { channel: ChannelName, segment: SegmentName },
}

impl Scope {
    /// Report section label: `main` or the channel name.
    pub fn section(&self) -> &str {
        match self {
            Scope::MainBase => MAIN_SECTION,
            Scope::ChannelBase { channel } | Scope::Segment { channel, .. } => channel,
        }
    }

    /// Report template label: `BA` for base scopes, else the segment name.
    pub fn template(&self) -> &str {
        match self {
            Scope::MainBase | Scope::ChannelBase { .. } => BASE_TEMPLATE,
            Scope::Segment { segment, .. } => segment,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.section(), self.template())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Check {
    pub name:        CheckName,
    pub predicate:   String,
    pub description: Option<String>,
    pub scope:       Scope,
    pub prior:       Option<PriorModifier>,
    /// Index in the flat evaluation order.
    pub position:    usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentChecks {
    pub name:   SegmentName,
    pub checks: Vec<CheckName>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelChecks {
    pub name:     ChannelName,
    pub base:     Vec<CheckName>,
    pub segments: Vec<SegmentChecks>,
}

#[derive(Debug, Clone)]
pub struct ConditionModel {
    checks:    Vec<Check>,
    index:     HashMap<CheckName, usize>,
    main_base: Vec<CheckName>,
    channels:  Vec<ChannelChecks>,
}

impl ConditionModel {
    /// Flatten and validate the nested check configuration.
    ///
    /// All problems are collected before returning, so a single call reports
    /// every duplicate and every unknown output channel.
    pub fn build(
        config: &ConditionsConfig,
        output_channels: &[String],
    ) -> Result<Self, ConfigErrors> {
        let mut builder = Builder::default();

        for check in &config.main.base {
            builder.push(check, Scope::MainBase);
        }
        let main_base: Vec<CheckName> =
            config.main.base.iter().map(|c| c.name.clone()).collect();

        let mut channels: Vec<ChannelChecks> = Vec::with_capacity(config.channels.len());
        for channel in &config.channels {
            if channels.iter().any(|c| c.name == channel.name) {
                builder
                    .errors
                    .push(ConfigError::DuplicateChannel { channel: channel.name.clone() });
                continue;
            }
            for check in &channel.base {
                builder.push(check, Scope::ChannelBase { channel: channel.name.clone() });
            }
            let mut segments: Vec<SegmentChecks> = Vec::with_capacity(channel.segments.len());
            for segment in &channel.segments {
                if segments.iter().any(|s| s.name == segment.name) {
                    builder.errors.push(ConfigError::DuplicateSegment {
                        channel: channel.name.clone(),
                        segment: segment.name.clone(),
                    });
                    continue;
                }
                if segment.checks.is_empty() {
                    builder.errors.push(ConfigError::EmptySegment {
                        channel: channel.name.clone(),
                        segment: segment.name.clone(),
                    });
                }
                for check in &segment.checks {
                    if let Some(existing) = builder.scope_of(&check.name) {
                        if !matches!(existing, Scope::Segment { .. }) {
                            builder.errors.push(ConfigError::SegmentReusesBaseCheck {
                                channel: channel.name.clone(),
                                segment: segment.name.clone(),
                                name:    check.name.clone(),
                            });
                            continue;
                        }
                    }
                    builder.push(
                        check,
                        Scope::Segment {
                            channel: channel.name.clone(),
                            segment: segment.name.clone(),
                        },
                    );
                }
                segments.push(SegmentChecks {
                    name:   segment.name.clone(),
                    checks: segment.checks.iter().map(|c| c.name.clone()).collect(),
                });
            }
            channels.push(ChannelChecks {
                name: channel.name.clone(),
                base: channel.base.iter().map(|c| c.name.clone()).collect(),
                segments,
            });
        }

        for wanted in output_channels {
            if !channels.iter().any(|c| &c.name == wanted) {
                builder.errors.push(ConfigError::UnknownOutputChannel { channel: wanted.clone() });
            }
        }

        if !builder.errors.is_empty() {
            return Err(ConfigErrors(builder.errors));
        }

        Ok(Self {
            checks: builder.checks,
            index: builder.index,
            main_base,
            channels,
        })
    }

    /// All checks in evaluation order.
    pub fn checks(&self) -> &[Check] {
        &self.checks
    }

    pub fn check_names(&self) -> Vec<CheckName> {
        self.checks.iter().map(|c| c.name.clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&Check> {
        self.index.get(name).map(|&i| &self.checks[i])
    }

    pub fn scope_of(&self, name: &str) -> Option<&Scope> {
        self.get(name).map(|c| &c.scope)
    }

    pub fn main_base(&self) -> &[CheckName] {
        &self.main_base
    }

    pub fn channels(&self) -> &[ChannelChecks] {
        &self.channels
    }

    pub fn channel(&self, name: &str) -> Option<&ChannelChecks> {
        self.channels.iter().find(|c| c.name == name)
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// The checks a `pass_all_prior` / `fail_all_prior` modifier refers to.
    ///
    /// - main base: earlier main base checks
    /// - channel base: all main base, then earlier base checks of the channel
    /// - segment: all main base, all base checks of the channel, then earlier
    ///   checks of the same segment
    pub fn chain_before(&self, name: &str) -> Option<Vec<CheckName>> {
        let check = self.get(name)?;
        let mut chain = Vec::new();
        match &check.scope {
            Scope::MainBase => {
                chain.extend(take_until(&self.main_base, name));
            }
            Scope::ChannelBase { channel } => {
                let ch = self.channel(channel)?;
                chain.extend(self.main_base.iter().cloned());
                chain.extend(take_until(&ch.base, name));
            }
            Scope::Segment { channel, segment } => {
                let ch = self.channel(channel)?;
                let seg = ch.segments.iter().find(|s| &s.name == segment)?;
                chain.extend(self.main_base.iter().cloned());
                chain.extend(ch.base.iter().cloned());
                chain.extend(take_until(&seg.checks, name));
            }
        }
        Some(chain)
    }
}

fn take_until(list: &[CheckName], name: &str) -> Vec<CheckName> {
    list.iter().take_while(|c| c.as_str() != name).cloned().collect()
}

#[derive(Default)]
struct Builder {
    checks: Vec<Check>,
    index:  HashMap<CheckName, usize>,
    errors: Vec<ConfigError>,
}

impl Builder {
    fn scope_of(&self, name: &str) -> Option<&Scope> {
        self.index.get(name).map(|&i| &self.checks[i].scope)
    }

    fn push(&mut self, check: &CheckConfig, scope: Scope) {
        if check.name.trim().is_empty() {
            self.errors.push(ConfigError::EmptyCheckName { location: scope.to_string() });
            return;
        }
        if let Some(&i) = self.index.get(&check.name) {
            self.errors.push(ConfigError::DuplicateCheck {
                name:   check.name.clone(),
                first:  self.checks[i].scope.to_string(),
                second: scope.to_string(),
            });
            return;
        }
        let position = self.checks.len();
        self.index.insert(check.name.clone(), position);
        self.checks.push(Check {
            name: check.name.clone(),
            predicate: check.predicate.clone(),
            description: check.description.clone(),
            scope,
            prior: check.prior,
            position,
        });
    }
}
