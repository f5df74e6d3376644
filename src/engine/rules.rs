//! Access rules, named profiles, and the ordered rule store.
//!
//! Rules are evaluated in (priority, insertion order) so the first match is
//! deterministic across any interleaving of adds and removes. Profiles are
//! named bundles of rules that activate and deactivate atomically.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::connection::{Action, Connection, Protocol};
use super::ratelimit::RateLimit;
use crate::error::{NetguardError, Result};

/// Identifier assigned to a rule when it enters the store. Unique for the
/// lifetime of the store, never reused.
pub type RuleId = u64;

/// A source matcher: a single address or a CIDR block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SourcePattern {
    Exact(IpAddr),
    Cidr(IpAddr, u8),
}

impl SourcePattern {
    /// Test whether an address falls within this pattern.
    pub fn matches(&self, ip: IpAddr) -> bool {
        match self {
            SourcePattern::Exact(addr) => *addr == ip,
            SourcePattern::Cidr(network, prefix_len) => cidr_contains(*network, *prefix_len, ip),
        }
    }
}

/// Check whether an address falls inside `network/prefix_len`. Mixed
/// address families never match.
fn cidr_contains(network: IpAddr, prefix_len: u8, ip: IpAddr) -> bool {
    match (network, ip) {
        (IpAddr::V4(net), IpAddr::V4(addr)) => {
            if prefix_len == 0 {
                return true;
            }
            if prefix_len >= 32 {
                return net == addr;
            }
            let mask = u32::MAX << (32 - prefix_len);
            (u32::from(net) & mask) == (u32::from(addr) & mask)
        }
        (IpAddr::V6(net), IpAddr::V6(addr)) => {
            if prefix_len == 0 {
                return true;
            }
            if prefix_len >= 128 {
                return net == addr;
            }
            let mask = u128::MAX << (128 - prefix_len);
            (u128::from(net) & mask) == (u128::from(addr) & mask)
        }
        _ => false,
    }
}

impl fmt::Display for SourcePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourcePattern::Exact(addr) => write!(f, "{}", addr),
            SourcePattern::Cidr(network, prefix_len) => write!(f, "{}/{}", network, prefix_len),
        }
    }
}

impl FromStr for SourcePattern {
    type Err = NetguardError;

    fn from_str(s: &str) -> Result<Self> {
        if let Some((addr, prefix)) = s.split_once('/') {
            let network: IpAddr = addr
                .parse()
                .map_err(|_| NetguardError::InvalidTarget(format!("bad address: {}", s)))?;
            let prefix_len: u8 = prefix
                .parse()
                .map_err(|_| NetguardError::InvalidTarget(format!("bad prefix length: {}", s)))?;
            let max = match network {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            if prefix_len > max {
                return Err(NetguardError::InvalidTarget(format!(
                    "prefix length out of range: {}",
                    s
                )));
            }
            Ok(SourcePattern::Cidr(network, prefix_len))
        } else {
            let addr: IpAddr = s
                .parse()
                .map_err(|_| NetguardError::InvalidTarget(format!("bad address: {}", s)))?;
            Ok(SourcePattern::Exact(addr))
        }
    }
}

impl TryFrom<String> for SourcePattern {
    type Error = NetguardError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<SourcePattern> for String {
    fn from(pattern: SourcePattern) -> Self {
        pattern.to_string()
    }
}

/// A single access-control rule.
///
/// `source` and `destination_port` of `None` match anything. A `Limit` rule
/// may carry its own `rate_limit`; when absent the evaluator applies a
/// built-in default window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Lower priority is evaluated first. Ties keep insertion order.
    #[serde(default)]
    pub priority: i32,
    pub action: Action,
    #[serde(default = "default_protocol")]
    pub protocol: Protocol,
    #[serde(default)]
    pub source: Option<SourcePattern>,
    #[serde(default)]
    pub destination_port: Option<u16>,
    /// When true, only packets of already-established flows match.
    #[serde(default)]
    pub established_only: bool,
    /// Rule-scoped limit consulted by `Limit` rules, independent of the
    /// global rate limiter.
    #[serde(default)]
    pub rate_limit: Option<RateLimit>,
}

fn default_protocol() -> Protocol {
    Protocol::Any
}

impl Rule {
    /// Whether this rule's predicate matches the connection.
    pub fn matches(&self, connection: &Connection) -> bool {
        if !self.protocol.matches(connection.protocol) {
            return false;
        }
        if let Some(port) = self.destination_port {
            if port != connection.destination_port {
                return false;
            }
        }
        if let Some(ref source) = self.source {
            if !source.matches(connection.source_ip) {
                return false;
            }
        }
        if self.established_only && connection.is_new {
            return false;
        }
        true
    }
}

/// A rule as stored: the rule plus its id and insertion sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleEntry {
    pub id: RuleId,
    /// Monotonic insertion counter, the tie-breaker for equal priorities.
    seq: u64,
    pub rule: Rule,
}

/// A named, immutable bundle of rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub rules: Vec<Rule>,
}

#[derive(Debug, Default)]
struct StoreInner {
    /// Always sorted by (priority, seq).
    rules: Vec<RuleEntry>,
    next_id: RuleId,
    next_seq: u64,
    /// Registered profile definitions, activated or not.
    profiles: HashMap<String, Profile>,
    /// Rule-id sets recorded at activation time, keyed by profile name.
    /// Deactivation removes exactly these ids, regardless of how the
    /// profile definition may have changed since.
    active: HashMap<String, Vec<RuleId>>,
}

impl StoreInner {
    fn insert(&mut self, rule: Rule) -> RuleId {
        let id = self.next_id;
        self.next_id += 1;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.rules.push(RuleEntry { id, seq, rule });
        self.rules.sort_by_key(|e| (e.rule.priority, e.seq));
        id
    }
}

/// The ordered set of access rules plus registered profiles.
///
/// Thread-safe: all operations take the internal lock for a short, bounded
/// critical section. Profile activation inserts its whole rule batch under a
/// single write lock, so concurrent evaluations see all of the profile's
/// rules or none of them.
#[derive(Debug, Default)]
pub struct RuleStore {
    inner: RwLock<StoreInner>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a rule and return its assigned id. Always succeeds.
    pub fn add_rule(&self, rule: Rule) -> RuleId {
        let mut inner = self.inner.write();
        let id = inner.insert(rule);
        debug!(rule_id = id, "Rule added");
        id
    }

    /// Remove a rule by id. Removal is idempotent; the returned bool reports
    /// whether the rule was present, for the administrative surface.
    pub fn remove_rule(&self, id: RuleId) -> bool {
        let mut inner = self.inner.write();
        let before = inner.rules.len();
        inner.rules.retain(|e| e.id != id);
        let removed = inner.rules.len() != before;
        if removed {
            debug!(rule_id = id, "Rule removed");
        }
        removed
    }

    /// Snapshot of all rules in evaluation order.
    pub fn rules_in_priority_order(&self) -> Vec<RuleEntry> {
        self.inner.read().rules.clone()
    }

    /// First rule matching the connection, in priority order. Runs under the
    /// read lock without cloning the whole list; this is the hot-path entry.
    pub fn first_match(&self, connection: &Connection) -> Option<RuleEntry> {
        let inner = self.inner.read();
        inner
            .rules
            .iter()
            .find(|e| e.rule.matches(connection))
            .cloned()
    }

    pub fn rule_count(&self) -> usize {
        self.inner.read().rules.len()
    }

    /// Look up a rule by id.
    pub fn get_rule(&self, id: RuleId) -> Option<RuleEntry> {
        self.inner.read().rules.iter().find(|e| e.id == id).cloned()
    }

    /// Register a profile definition without activating it. Re-registering a
    /// name replaces the definition; an already-active profile keeps its
    /// recorded rule set until deactivated.
    pub fn add_profile(&self, profile: Profile) {
        let mut inner = self.inner.write();
        debug!(profile = %profile.name, rules = profile.rules.len(), "Profile registered");
        inner.profiles.insert(profile.name.clone(), profile);
    }

    /// Unregister a profile definition. Does not touch rules already
    /// activated from it.
    pub fn remove_profile(&self, name: &str) {
        let mut inner = self.inner.write();
        inner.profiles.remove(name);
    }

    /// Names of all registered profiles.
    pub fn profile_names(&self) -> Vec<String> {
        let inner = self.inner.read();
        let mut names: Vec<String> = inner.profiles.keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of currently active profiles.
    pub fn active_profile_names(&self) -> Vec<String> {
        let inner = self.inner.read();
        let mut names: Vec<String> = inner.active.keys().cloned().collect();
        names.sort();
        names
    }

    /// Insert all of the profile's rules and record the resulting rule-id
    /// set. Activating an already-active profile is a no-op. The whole batch
    /// goes in under one write lock.
    pub fn activate_profile(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.active.contains_key(name) {
            debug!(profile = %name, "Profile already active");
            return Ok(());
        }
        let rules = match inner.profiles.get(name) {
            Some(profile) => profile.rules.clone(),
            None => return Err(NetguardError::ProfileNotFound(name.to_string())),
        };
        let ids: Vec<RuleId> = rules.into_iter().map(|r| inner.insert(r)).collect();
        info!(profile = %name, rules = ids.len(), "Profile activated");
        inner.active.insert(name.to_string(), ids);
        Ok(())
    }

    /// Remove exactly the rule set recorded when the profile was activated.
    pub fn deactivate_profile(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let ids = inner
            .active
            .remove(name)
            .ok_or_else(|| NetguardError::ProfileNotActive(name.to_string()))?;
        inner.rules.retain(|e| !ids.contains(&e.id));
        info!(profile = %name, rules = ids.len(), "Profile deactivated");
        Ok(())
    }
}
