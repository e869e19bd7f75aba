//! funnel-core: eligibility waterfall computation for campaign targeting.
//!
//! PIPELINE:
//!   config  → ConditionModel          (validated once, immutable)
//!   records → EligibilitySet          (one flag per check per record)
//!   flags   → GroupingFunnel          (per grouping, via a QueryExecutor)
//!   funnels → Snapshot + Report       (history comparison optional)

pub mod condition;
pub mod config;
pub mod eligibility;
pub mod engine;
pub mod error;
pub mod funnel;
pub mod history;
pub mod query;
pub mod report;
pub mod rng;
pub mod store;
pub mod synthetic;
pub mod types;
