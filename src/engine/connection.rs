//! Connection descriptors and evaluation decisions.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use super::rules::RuleId;

/// Transport protocol of a connection or rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    /// Matches any protocol. Only meaningful on rules, never on connections.
    Any,
}

impl Protocol {
    /// Whether a rule carrying this protocol matches a connection's protocol.
    pub fn matches(&self, other: Protocol) -> bool {
        matches!(self, Protocol::Any) || *self == other
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
            Protocol::Icmp => write!(f, "icmp"),
            Protocol::Any => write!(f, "any"),
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "icmp" => Ok(Protocol::Icmp),
            "any" => Ok(Protocol::Any),
            other => Err(format!("unknown protocol: {}", other)),
        }
    }
}

/// Action a rule can take when it matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Deny,
    /// Deny, and have the network layer send a rejection notice.
    Reject,
    /// Allow while under the rule's own rate limit, deny once over it.
    Limit,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Allow => write!(f, "allow"),
            Action::Deny => write!(f, "deny"),
            Action::Reject => write!(f, "reject"),
            Action::Limit => write!(f, "limit"),
        }
    }
}

/// Final outcome of an evaluation: the only two things the packet path
/// can do with a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Allow,
    Deny,
}

impl Verdict {
    pub fn is_allow(&self) -> bool {
        matches!(self, Verdict::Allow)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Allow => write!(f, "allow"),
            Verdict::Deny => write!(f, "deny"),
        }
    }
}

/// Why an evaluation reached its verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    /// The engine is disabled; traffic passes through unexamined.
    EngineDisabled,
    /// Source address is under a temporary ban that has not yet expired.
    TemporaryBlock,
    /// Source address is permanently blocked.
    PermanentBlock,
    /// Source address is in a trusted zone and bypasses all other checks.
    TrustedZone,
    /// The global rate limiter rejected the source.
    RateLimited,
    /// A rule matched; carries the id of the matching rule.
    MatchedRule(RuleId),
    /// No rule matched; the default policy decided.
    DefaultPolicy,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reason::EngineDisabled => write!(f, "engine_disabled"),
            Reason::TemporaryBlock => write!(f, "temporary_block"),
            Reason::PermanentBlock => write!(f, "permanent_block"),
            Reason::TrustedZone => write!(f, "trusted_zone"),
            Reason::RateLimited => write!(f, "rate_limited"),
            Reason::MatchedRule(id) => write!(f, "matched_rule({})", id),
            Reason::DefaultPolicy => write!(f, "default_policy"),
        }
    }
}

/// A single connection attempt to be evaluated.
///
/// Constructed once per evaluation by the packet path and never mutated.
/// Carries metadata only; payload content never reaches the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub source_ip: IpAddr,
    pub destination_ip: IpAddr,
    pub destination_port: u16,
    pub protocol: Protocol,
    /// Interface the connection arrived on, when the caller knows it.
    pub interface: Option<String>,
    /// False for packets belonging to an already-established flow.
    pub is_new: bool,
}

impl Connection {
    /// Build a new-connection descriptor with no interface attribution.
    pub fn new(
        source_ip: IpAddr,
        destination_ip: IpAddr,
        destination_port: u16,
        protocol: Protocol,
    ) -> Self {
        Self {
            source_ip,
            destination_ip,
            destination_port,
            protocol,
            interface: None,
            is_new: true,
        }
    }
}

/// The engine's decision for one connection attempt.
///
/// `verdict` is all the packet path acts on. `action` preserves which of the
/// four rule actions produced the verdict (Reject is a Deny whose rejection
/// notice is sent by the network layer), and `reason` records which pipeline
/// stage decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub verdict: Verdict,
    pub reason: Reason,
    pub action: Action,
}

impl Decision {
    pub fn allow(reason: Reason) -> Self {
        Self {
            verdict: Verdict::Allow,
            reason,
            action: Action::Allow,
        }
    }

    pub fn deny(reason: Reason) -> Self {
        Self {
            verdict: Verdict::Deny,
            reason,
            action: Action::Deny,
        }
    }

    /// Decision produced by a matched rule, preserving the rule's action.
    pub fn from_rule(id: RuleId, action: Action, over_limit: bool) -> Self {
        let verdict = match action {
            Action::Allow => Verdict::Allow,
            Action::Deny | Action::Reject => Verdict::Deny,
            Action::Limit => {
                if over_limit {
                    Verdict::Deny
                } else {
                    Verdict::Allow
                }
            }
        };
        Self {
            verdict,
            reason: Reason::MatchedRule(id),
            action,
        }
    }
}
