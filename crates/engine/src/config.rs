//! Launcher configuration.

use std::str::FromStr;

/// Environment variable read by [`LauncherConfig::from_env`].
pub const COMPLETED_POLICY_ENV: &str = "BATCHLINE_COMPLETED_POLICY";

/// What `run` does when the instance for the given parameters already completed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CompletedInstancePolicy {
    /// Refuse with `LaunchError::AlreadyComplete`.
    #[default]
    Reject,
    /// Return the completed execution without running anything.
    Noop,
    /// Create a new execution and run every step again.
    Rerun,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown completed-instance policy '{0}' (expected reject, noop or rerun)")]
    UnknownPolicy(String),
}

impl FromStr for CompletedInstancePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "noop" => Ok(Self::Noop),
            "rerun" => Ok(Self::Rerun),
            other => Err(ConfigError::UnknownPolicy(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LauncherConfig {
    pub completed_policy: CompletedInstancePolicy,
}

impl LauncherConfig {
    pub fn with_completed_policy(mut self, policy: CompletedInstancePolicy) -> Self {
        self.completed_policy = policy;
        self
    }

    /// Defaults overridden by `BATCHLINE_COMPLETED_POLICY` when it is set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(policy) = lookup(COMPLETED_POLICY_ENV) {
            config.completed_policy = policy.parse()?;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_parses_case_insensitively() {
        assert_eq!("NOOP".parse(), Ok(CompletedInstancePolicy::Noop));
        assert_eq!(" rerun ".parse(), Ok(CompletedInstancePolicy::Rerun));
        assert_eq!(
            "sometimes".parse::<CompletedInstancePolicy>(),
            Err(ConfigError::UnknownPolicy("sometimes".into()))
        );
    }

    #[test]
    fn lookup_overrides_default() {
        let config = LauncherConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.completed_policy, CompletedInstancePolicy::Reject);

        let config = LauncherConfig::from_lookup(|key| (key == COMPLETED_POLICY_ENV).then(|| "noop".to_string())).unwrap();
        assert_eq!(config.completed_policy, CompletedInstancePolicy::Noop);

        assert!(LauncherConfig::from_lookup(|_| Some("x".into())).is_err());
    }
}
