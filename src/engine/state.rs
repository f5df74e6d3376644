//! Process-wide engine state, mutated only through the controller.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Fallback decision applied when no rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    Allow,
    Deny,
}

impl Default for Policy {
    fn default() -> Self {
        Policy::Deny
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Policy::Allow => write!(f, "allow"),
            Policy::Deny => write!(f, "deny"),
        }
    }
}

impl FromStr for Policy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "allow" => Ok(Policy::Allow),
            "deny" => Ok(Policy::Deny),
            other => Err(format!("unknown policy: {}", other)),
        }
    }
}

/// How much of each decision is serialized to the log sink. Never affects
/// the decision itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    /// Denied connections only.
    Low,
    /// Denials plus rule-matched allows.
    Medium,
    /// Every decision.
    High,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Low
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Off => write!(f, "off"),
            LogLevel::Low => write!(f, "low"),
            LogLevel::Medium => write!(f, "medium"),
            LogLevel::High => write!(f, "high"),
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(LogLevel::Off),
            "low" => Ok(LogLevel::Low),
            "medium" => Ok(LogLevel::Medium),
            "high" => Ok(LogLevel::High),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

/// Mutable engine state. Created once at startup with the engine disabled
/// and torn down with the process; persistence is a collaborator concern.
#[derive(Debug, Clone)]
pub struct EngineState {
    pub enabled: bool,
    pub default_policy: Policy,
    pub log_level: LogLevel,
    /// Names of currently active profiles, mirrored from the rule store.
    pub active_profiles: Vec<String>,
}

impl EngineState {
    pub fn new(default_policy: Policy, log_level: LogLevel) -> Self {
        Self {
            enabled: false,
            default_policy,
            log_level,
            active_profiles: Vec::new(),
        }
    }
}

impl Default for EngineState {
    fn default() -> Self {
        Self::new(Policy::default(), LogLevel::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_starts_disabled() {
        let state = EngineState::default();
        assert!(!state.enabled);
        assert_eq!(state.default_policy, Policy::Deny);
        assert_eq!(state.log_level, LogLevel::Low);
    }

    #[test]
    fn test_log_level_ordering() {
        assert!(LogLevel::Off < LogLevel::Low);
        assert!(LogLevel::Low < LogLevel::Medium);
        assert!(LogLevel::Medium < LogLevel::High);
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("allow".parse::<Policy>(), Ok(Policy::Allow));
        assert_eq!("DENY".parse::<Policy>(), Ok(Policy::Deny));
        assert!("drop".parse::<Policy>().is_err());
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!("medium".parse::<LogLevel>(), Ok(LogLevel::Medium));
        assert!("verbose".parse::<LogLevel>().is_err());
    }
}
