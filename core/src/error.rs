use std::fmt;
use thiserror::Error;

/// One configuration problem, naming the offending item.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Duplicate check name '{name}' (first used in {first}, again in {second})")]
    DuplicateCheck { name: String, first: String, second: String },

    #[error("Segment '{segment}' in channel '{channel}' reuses base check name '{name}'")]
    SegmentReusesBaseCheck { channel: String, segment: String, name: String },

    #[error("Duplicate channel name '{channel}'")]
    DuplicateChannel { channel: String },

    #[error("Duplicate segment name '{segment}' in channel '{channel}'")]
    DuplicateSegment { channel: String, segment: String },

    #[error("Segment '{segment}' in channel '{channel}' has no checks")]
    EmptySegment { channel: String, segment: String },

    #[error("Output channel '{channel}' is not defined in the condition tree")]
    UnknownOutputChannel { channel: String },

    #[error("Grouping column '{column}' is not one of the unique identifiers {identifiers:?}")]
    UnknownGroupingColumn { column: String, identifiers: Vec<String> },

    #[error("Duplicate grouping name '{name}'")]
    DuplicateGrouping { name: String },

    #[error("Grouping at position {index} has no columns")]
    EmptyGrouping { index: usize },

    #[error("At least one unique identifier is required")]
    NoUniqueIdentifiers,

    #[error("Check name must not be empty (in {location})")]
    EmptyCheckName { location: String },

    #[error("History policy must set exactly one of recent_window_days / nearest_offset_days")]
    AmbiguousHistoryPolicy,

    #[error("History look-back days must be positive, got {days}")]
    InvalidLookBack { days: i64 },
}

/// The full list of problems found by a single validation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigErrors(pub Vec<ConfigError>);

impl fmt::Display for ConfigErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} configuration error(s)", self.0.len())?;
        for e in &self.0 {
            write!(f, "\n  - {e}")?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum FunnelError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(ConfigErrors),

    #[error("Query failed for grouping '{grouping}' section '{section}': {message}")]
    QueryFailed { grouping: String, section: String, message: String },

    #[error("Malformed result for grouping '{grouping}' section '{section}': {message}")]
    ShapeMismatch { grouping: String, section: String, message: String },

    #[error("Predicate evaluation failed for check '{check}': {message}")]
    Predicate { check: String, message: String },

    #[error("Unknown check '{name}'")]
    UnknownCheck { name: String },

    #[error("Unknown channel '{name}'")]
    UnknownChannel { name: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<ConfigErrors> for FunnelError {
    fn from(errors: ConfigErrors) -> Self {
        FunnelError::Config(errors)
    }
}

pub type FunnelResult<T> = Result<T, FunnelError>;
