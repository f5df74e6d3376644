//! Public facade over the engine: administrative mutation and the single
//! hot-path call, `evaluate`.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use tracing::info;

use super::bans::{BanTable, TrustedZones};
use super::connection::{Connection, Decision};
use super::evaluator::Evaluator;
use super::ledger::{ConnectionLedger, LedgerEntry};
use super::ratelimit::{RateLimit, RateLimiter};
use super::rules::{Profile, Rule, RuleEntry, RuleId, RuleStore, SourcePattern};
use super::state::{EngineState, LogLevel, Policy};
use crate::config::NetguardConfig;
use crate::error::Result;

/// Snapshot of engine state plus ledger statistics.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub enabled: bool,
    pub default_policy: Policy,
    pub log_level: LogLevel,
    pub active_profiles: Vec<String>,
    pub total_rules: usize,
    pub allowed_count: u64,
    pub denied_count: u64,
}

/// Composes the engine's tables and owns the evaluator.
///
/// Administrative calls mutate the tables; they never run on the hot path.
/// The controller is cheap to share: wrap it in an `Arc` and hand clones to
/// the packet path and the administrative surface.
pub struct Controller {
    state: Arc<RwLock<EngineState>>,
    rules: Arc<RuleStore>,
    bans: Arc<BanTable>,
    trusted: Arc<TrustedZones>,
    limiter: Arc<RateLimiter>,
    ledger: Arc<ConnectionLedger>,
    evaluator: Evaluator,
}

impl Controller {
    /// Build an engine from configuration. The engine starts disabled;
    /// configured profiles are registered but not activated, and configured
    /// trusted zones and overrides are installed.
    pub fn from_config(config: &NetguardConfig) -> Self {
        let controller = Self::with_tables(
            EngineState::new(config.default_policy, config.log_level),
            config.ledger_capacity,
        );

        controller.limiter.set_default_limit(config.rate_limit);
        for (port, limit) in &config.port_overrides {
            controller.limiter.set_override(*port, *limit);
        }
        for zone in &config.trusted_zones {
            controller.trusted.add(*zone);
        }
        for profile in &config.profiles {
            controller.rules.add_profile(profile.clone());
        }
        controller
    }

    /// Build an engine with default configuration.
    pub fn new() -> Self {
        Self::with_tables(EngineState::default(), super::ledger::DEFAULT_LEDGER_CAPACITY)
    }

    fn with_tables(initial: EngineState, ledger_capacity: usize) -> Self {
        let state = Arc::new(RwLock::new(initial));
        let rules = Arc::new(RuleStore::new());
        let bans = Arc::new(BanTable::new());
        let trusted = Arc::new(TrustedZones::new());
        let limiter = Arc::new(RateLimiter::default());
        let ledger = Arc::new(ConnectionLedger::new(ledger_capacity));

        let evaluator = Evaluator::new(
            Arc::clone(&state),
            Arc::clone(&rules),
            Arc::clone(&bans),
            Arc::clone(&trusted),
            Arc::clone(&limiter),
            Arc::clone(&ledger),
        );

        Self {
            state,
            rules,
            bans,
            trusted,
            limiter,
            ledger,
            evaluator,
        }
    }

    // --- lifecycle -------------------------------------------------------

    /// Enable evaluation. Idempotent.
    pub fn enable(&self) {
        let mut state = self.state.write();
        if !state.enabled {
            state.enabled = true;
            info!("Engine enabled");
        }
    }

    /// Disable evaluation; all traffic passes unexamined. Idempotent.
    pub fn disable(&self) {
        let mut state = self.state.write();
        if state.enabled {
            state.enabled = false;
            info!("Engine disabled");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.state.read().enabled
    }

    pub fn set_default_policy(&self, policy: Policy) {
        info!(policy = %policy, "Default policy set");
        self.state.write().default_policy = policy;
    }

    pub fn set_log_level(&self, level: LogLevel) {
        info!(level = %level, "Log level set");
        self.state.write().log_level = level;
    }

    // --- rules -----------------------------------------------------------

    pub fn add_rule(&self, rule: Rule) -> RuleId {
        self.rules.add_rule(rule)
    }

    /// Idempotent removal; reports whether the rule existed.
    pub fn remove_rule(&self, id: RuleId) -> bool {
        self.rules.remove_rule(id)
    }

    pub fn list_rules(&self) -> Vec<RuleEntry> {
        self.rules.rules_in_priority_order()
    }

    // --- profiles --------------------------------------------------------

    pub fn add_profile(&self, profile: Profile) {
        self.rules.add_profile(profile);
    }

    pub fn list_profiles(&self) -> Vec<String> {
        self.rules.profile_names()
    }

    /// Activate a profile's rules atomically. Idempotent when already
    /// active.
    pub fn enable_profile(&self, name: &str) -> Result<()> {
        self.rules.activate_profile(name)?;
        self.refresh_active_profiles();
        Ok(())
    }

    /// Remove exactly the rule set the profile's activation added.
    pub fn disable_profile(&self, name: &str) -> Result<()> {
        self.rules.deactivate_profile(name)?;
        self.refresh_active_profiles();
        Ok(())
    }

    /// Re-read the store's active set while holding the state lock. Toggles
    /// serialize here, so the snapshot written last reflects every store
    /// mutation that preceded it.
    fn refresh_active_profiles(&self) {
        let mut state = self.state.write();
        state.active_profiles = self.rules.active_profile_names();
    }

    // --- bans, zones, limits ---------------------------------------------

    pub fn block_ip(&self, address: IpAddr) {
        self.bans.block(address);
    }

    pub fn unblock_ip(&self, address: IpAddr) {
        self.bans.unblock(address);
    }

    /// Temporary ban, e.g. from an external intrusion-detection signal.
    pub fn temp_block_ip(&self, address: IpAddr, duration: Duration, now: DateTime<Utc>) {
        self.bans.temp_block(address, duration, now);
    }

    pub fn add_trusted_zone(&self, zone: SourcePattern) {
        self.trusted.add(zone);
    }

    pub fn set_rate_limit(&self, limit: RateLimit) {
        self.limiter.set_default_limit(limit);
    }

    pub fn set_port_rate_limit(&self, port: u16, limit: RateLimit) {
        self.limiter.set_override(port, limit);
    }

    /// Evict rate-limit state whose windows have aged out. Administrative
    /// maintenance; the hot path never needs it.
    pub fn prune_rate_state(&self, now: DateTime<Utc>) {
        self.evaluator.prune_rate_state(now);
    }

    // --- observation -----------------------------------------------------

    /// Snapshot of engine state and statistics.
    pub fn status(&self) -> EngineStatus {
        let (enabled, default_policy, log_level, active_profiles) = {
            let state = self.state.read();
            (
                state.enabled,
                state.default_policy,
                state.log_level,
                state.active_profiles.clone(),
            )
        };
        EngineStatus {
            enabled,
            default_policy,
            log_level,
            active_profiles,
            total_rules: self.rules.rule_count(),
            allowed_count: self.ledger.allowed_count(),
            denied_count: self.ledger.denied_count(),
        }
    }

    /// The most recent `n` ledger entries, newest last.
    pub fn recent_connections(&self, n: usize) -> Vec<LedgerEntry> {
        self.ledger.recent(n)
    }

    // --- hot path --------------------------------------------------------

    /// Evaluate one connection attempt. The only call the packet path makes.
    pub fn evaluate(&self, connection: &Connection, now: DateTime<Utc>) -> Decision {
        self.evaluator.evaluate(connection, now)
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}
