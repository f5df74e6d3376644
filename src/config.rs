//! Configuration management for Netguard.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::engine::{LogLevel, Policy, Profile, RateLimit, SourcePattern, DEFAULT_LEDGER_CAPACITY};
use crate::error::{NetguardError, Result};

/// Main configuration for the Netguard engine.
///
/// Everything has a default: an empty file yields a deny-by-default engine
/// with no profiles, no trusted zones, and the stock rate limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetguardConfig {
    /// Fallback decision when no rule matches.
    #[serde(default)]
    pub default_policy: Policy,

    /// Decision-log verbosity.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Capacity of the connection ledger ring.
    #[serde(default = "default_ledger_capacity")]
    pub ledger_capacity: usize,

    /// Global rate limit applied per (source, port) key.
    #[serde(default)]
    pub rate_limit: RateLimit,

    /// Per-port rate limit overrides.
    #[serde(default)]
    pub port_overrides: HashMap<u16, RateLimit>,

    /// Source addresses or CIDR blocks exempted from evaluation.
    #[serde(default)]
    pub trusted_zones: Vec<SourcePattern>,

    /// Profiles registered at startup, activated on demand.
    #[serde(default)]
    pub profiles: Vec<Profile>,
}

impl Default for NetguardConfig {
    fn default() -> Self {
        Self {
            default_policy: Policy::default(),
            log_level: LogLevel::default(),
            ledger_capacity: default_ledger_capacity(),
            rate_limit: RateLimit::default(),
            port_overrides: HashMap::new(),
            trusted_zones: Vec::new(),
            profiles: Vec::new(),
        }
    }
}

fn default_ledger_capacity() -> usize {
    DEFAULT_LEDGER_CAPACITY
}

impl NetguardConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| NetguardError::Config(format!("Failed to parse config: {}", e)))
    }
}
