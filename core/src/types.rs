//! Shared primitive types used across the entire pipeline.

use std::fmt;

/// A stable, unique check identifier (also the flag column name).
pub type CheckName = String;

/// The name of a channel in the condition tree (e.g. "email", "sms").
pub type ChannelName = String;

/// The name of a mutually-exclusive segment within a channel.
pub type SegmentName = String;

/// The canonical run identifier.
pub type RunId = String;

/// Run timestamps are always UTC.
pub type RunTimestamp = chrono::DateTime<chrono::Utc>;

/// Section label used for the main (campaign-wide) scope.
pub const MAIN_SECTION: &str = "main";

/// Template label used for base checks, in the main scope and in channels.
pub const BASE_TEMPLATE: &str = "BA";

/// Explicit logging context, passed into every log call that needs one.
///
/// Renders as `grouping=<g> section=<s>`; fields that are not set are
/// omitted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogScope {
    pub grouping: Option<String>,
    pub section:  Option<String>,
}

impl LogScope {
    pub fn grouping(name: &str) -> Self {
        Self { grouping: Some(name.to_string()), section: None }
    }

    /// A nested scope for one section of the current grouping.
    pub fn section(&self, section: impl fmt::Display) -> Self {
        Self {
            grouping: self.grouping.clone(),
            section:  Some(section.to_string()),
        }
    }
}

impl fmt::Display for LogScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        if let Some(g) = &self.grouping {
            write!(f, "grouping={g}")?;
            first = false;
        }
        if let Some(s) = &self.section {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "section={s}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_scope_renders_nested_context() {
        let root = LogScope::grouping("customer_id");
        assert_eq!(root.to_string(), "grouping=customer_id");

        let nested = root.section("email/BA");
        assert_eq!(nested.to_string(), "grouping=customer_id section=email/BA");
        // The parent scope is untouched.
        assert_eq!(root.section, None);
    }

    #[test]
    fn empty_scope_renders_nothing() {
        assert_eq!(LogScope::default().to_string(), "");
    }
}
