//! Execution status (state machine) and exit status (outcome label).

use serde::{Deserialize, Serialize};

/// Lifecycle status of a job or step execution.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    /// Record created, nothing executed yet
    Starting,
    /// Currently executing
    Started,
    /// Stop requested; honoured at the next chunk boundary
    Stopping,
    /// Stopped on request; restartable
    Stopped,
    /// Finished successfully
    Completed,
    /// Finished with an error; restartable
    Failed,
    /// Given up on; never restarted
    Abandoned,
    /// State could not be determined
    Unknown,
}

impl BatchStatus {
    pub fn is_running(self) -> bool {
        matches!(
            self,
            BatchStatus::Starting | BatchStatus::Started | BatchStatus::Stopping
        )
    }

    pub fn is_unsuccessful(self) -> bool {
        matches!(
            self,
            BatchStatus::Failed | BatchStatus::Abandoned | BatchStatus::Unknown
        )
    }

    /// Whether an instance whose last execution ended in this status may run again.
    pub fn is_restartable(self) -> bool {
        matches!(self, BatchStatus::Failed | BatchStatus::Stopped)
    }

    fn rank(self) -> u8 {
        match self {
            BatchStatus::Completed => 0,
            BatchStatus::Starting => 1,
            BatchStatus::Started => 2,
            BatchStatus::Stopping => 3,
            BatchStatus::Stopped => 4,
            BatchStatus::Failed => 5,
            BatchStatus::Abandoned => 6,
            BatchStatus::Unknown => 7,
        }
    }

    /// Combine two statuses. Once either side is past `Started` the more
    /// severe one wins; otherwise `Completed` beats a running status.
    pub fn upgrade_to(self, other: BatchStatus) -> BatchStatus {
        let started = BatchStatus::Started.rank();
        if self.rank() > started || other.rank() > started {
            if self.rank() >= other.rank() { self } else { other }
        } else if self == BatchStatus::Completed || other == BatchStatus::Completed {
            BatchStatus::Completed
        } else if self.rank() >= other.rank() {
            self
        } else {
            other
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Starting => "STARTING",
            BatchStatus::Started => "STARTED",
            BatchStatus::Stopping => "STOPPING",
            BatchStatus::Stopped => "STOPPED",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Failed => "FAILED",
            BatchStatus::Abandoned => "ABANDONED",
            BatchStatus::Unknown => "UNKNOWN",
        }
    }
}

impl core::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome label of an execution: a code plus a free-text description.
///
/// Unlike [`BatchStatus`], the code is open-ended so listeners can attach
/// custom outcomes (e.g. `COMPLETED WITH SKIPS`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExitStatus {
    exit_code: String,
    exit_description: String,
}

impl ExitStatus {
    pub const UNKNOWN: &'static str = "UNKNOWN";
    pub const EXECUTING: &'static str = "EXECUTING";
    pub const COMPLETED: &'static str = "COMPLETED";
    pub const NOOP: &'static str = "NOOP";
    pub const FAILED: &'static str = "FAILED";
    pub const STOPPED: &'static str = "STOPPED";

    pub fn new(exit_code: impl Into<String>) -> Self {
        Self {
            exit_code: exit_code.into(),
            exit_description: String::new(),
        }
    }

    pub fn with_description(exit_code: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            exit_code: exit_code.into(),
            exit_description: description.into(),
        }
    }

    pub fn unknown() -> Self {
        Self::new(Self::UNKNOWN)
    }

    pub fn executing() -> Self {
        Self::new(Self::EXECUTING)
    }

    pub fn completed() -> Self {
        Self::new(Self::COMPLETED)
    }

    pub fn noop() -> Self {
        Self::new(Self::NOOP)
    }

    pub fn failed() -> Self {
        Self::new(Self::FAILED)
    }

    pub fn stopped() -> Self {
        Self::new(Self::STOPPED)
    }

    pub fn exit_code(&self) -> &str {
        &self.exit_code
    }

    pub fn exit_description(&self) -> &str {
        &self.exit_description
    }

    /// Default exit status for a terminal batch status.
    pub fn for_status(status: BatchStatus) -> Self {
        match status {
            BatchStatus::Completed => Self::completed(),
            BatchStatus::Failed => Self::failed(),
            BatchStatus::Stopped | BatchStatus::Stopping => Self::stopped(),
            BatchStatus::Starting | BatchStatus::Started => Self::executing(),
            BatchStatus::Abandoned | BatchStatus::Unknown => Self::unknown(),
        }
    }

    /// Ordering used when merging: higher wins. Custom codes rank highest.
    fn severity(&self) -> u8 {
        match self.exit_code.as_str() {
            c if c.starts_with(Self::EXECUTING) => 1,
            c if c.starts_with(Self::COMPLETED) => 2,
            c if c.starts_with(Self::NOOP) => 3,
            c if c.starts_with(Self::STOPPED) => 4,
            c if c.starts_with(Self::FAILED) => 5,
            c if c.starts_with(Self::UNKNOWN) => 6,
            _ => 7,
        }
    }

    /// Merge two statuses: keep the more severe code, concatenate descriptions.
    pub fn and(&self, other: &ExitStatus) -> ExitStatus {
        let mut merged = self.add_description(&other.exit_description);
        if self.severity() < other.severity() {
            merged.exit_code = other.exit_code.clone();
        }
        merged
    }

    /// Same code, with `description` appended (separated by `; `).
    pub fn add_description(&self, description: &str) -> ExitStatus {
        let description = description.trim();
        let exit_description = if description.is_empty() || self.exit_description == description {
            self.exit_description.clone()
        } else if self.exit_description.is_empty() {
            description.to_string()
        } else {
            format!("{}; {}", self.exit_description, description)
        };
        ExitStatus {
            exit_code: self.exit_code.clone(),
            exit_description,
        }
    }

    /// Append an error and its source chain to the description.
    pub fn with_error(&self, error: &(dyn std::error::Error + 'static)) -> ExitStatus {
        let mut text = error.to_string();
        let mut source = error.source();
        while let Some(cause) = source {
            text.push_str(": ");
            text.push_str(&cause.to_string());
            source = cause.source();
        }
        self.add_description(&text)
    }

    pub fn replace_code(&self, exit_code: impl Into<String>) -> ExitStatus {
        ExitStatus {
            exit_code: exit_code.into(),
            exit_description: self.exit_description.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.exit_code == Self::EXECUTING || self.exit_code == Self::UNKNOWN
    }
}

impl Default for ExitStatus {
    fn default() -> Self {
        Self::unknown()
    }
}

impl core::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.exit_description.is_empty() {
            f.write_str(&self.exit_code)
        } else {
            write!(f, "{} ({})", self.exit_code, self.exit_description)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn and_keeps_more_severe_code() {
        let merged = ExitStatus::completed().and(&ExitStatus::failed());
        assert_eq!(merged.exit_code(), ExitStatus::FAILED);

        let merged = ExitStatus::failed().and(&ExitStatus::completed());
        assert_eq!(merged.exit_code(), ExitStatus::FAILED);
    }

    #[test]
    fn custom_codes_outrank_builtin_ones() {
        // prefix match keeps it in the COMPLETED band, so the receiver's code wins
        let custom = ExitStatus::new("COMPLETED WITH SKIPS");
        assert_eq!(ExitStatus::completed().and(&custom).exit_code(), ExitStatus::COMPLETED);
        assert_eq!(custom.and(&ExitStatus::completed()).exit_code(), "COMPLETED WITH SKIPS");

        let custom = ExitStatus::new("PARTIAL");
        assert_eq!(ExitStatus::failed().and(&custom).exit_code(), "PARTIAL");
    }

    #[test]
    fn descriptions_are_concatenated() {
        let a = ExitStatus::with_description("FAILED", "reader broke");
        let b = ExitStatus::with_description("FAILED", "listener broke");
        assert_eq!(a.and(&b).exit_description(), "reader broke; listener broke");
        assert_eq!(a.and(&a).exit_description(), "reader broke");
    }

    #[test]
    fn for_status_maps_terminal_states() {
        assert_eq!(ExitStatus::for_status(BatchStatus::Completed), ExitStatus::completed());
        assert_eq!(ExitStatus::for_status(BatchStatus::Failed), ExitStatus::failed());
        assert_eq!(ExitStatus::for_status(BatchStatus::Stopped), ExitStatus::stopped());
    }

    #[test]
    fn running_statuses() {
        assert!(BatchStatus::Started.is_running());
        assert!(BatchStatus::Stopping.is_running());
        assert!(!BatchStatus::Completed.is_running());
        assert!(BatchStatus::Failed.is_restartable());
        assert!(!BatchStatus::Abandoned.is_restartable());
    }

    #[test]
    fn upgrade_keeps_the_more_severe_status() {
        assert_eq!(BatchStatus::Completed.upgrade_to(BatchStatus::Failed), BatchStatus::Failed);
        assert_eq!(BatchStatus::Stopped.upgrade_to(BatchStatus::Completed), BatchStatus::Stopped);
        assert_eq!(BatchStatus::Started.upgrade_to(BatchStatus::Completed), BatchStatus::Completed);
        assert_eq!(BatchStatus::Starting.upgrade_to(BatchStatus::Started), BatchStatus::Started);
    }

    #[test]
    fn status_serializes_screaming_case() {
        let json = serde_json::to_string(&BatchStatus::Completed).unwrap();
        assert_eq!(json, "\"COMPLETED\"");
    }
}
