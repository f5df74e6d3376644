//! The decision pipeline: one bounded, infallible evaluation per connection.
//!
//! Order is fixed and short-circuiting: disabled bypass, ban table, trusted
//! zones, global rate limiter, rule store, default policy. Every evaluation
//! ends in the ledger and, depending on the configured log level, in one
//! structured event for the log sink.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info};

use super::bans::{BanKind, BanTable, TrustedZones};
use super::connection::{Action, Connection, Decision, Reason, Verdict};
use super::ledger::ConnectionLedger;
use super::ratelimit::{RateLimit, RateLimiter, SlidingWindow};
use super::rules::{RuleId, RuleStore};
use super::state::{EngineState, LogLevel, Policy};

/// Window applied by `Limit` rules that carry no explicit rate limit:
/// six connections in thirty seconds.
const DEFAULT_RULE_LIMIT: RateLimit = RateLimit {
    max_requests: 6,
    window_seconds: 30,
};

/// Evaluates connections against the engine's tables.
///
/// Reads from the rule store, ban table, trusted zones, and rate limiter;
/// writes only to the ledger and its own rule-scoped windows. Tables are
/// consulted one at a time and no lock is held across stages.
pub struct Evaluator {
    state: Arc<RwLock<EngineState>>,
    rules: Arc<RuleStore>,
    bans: Arc<BanTable>,
    trusted: Arc<TrustedZones>,
    limiter: Arc<RateLimiter>,
    ledger: Arc<ConnectionLedger>,
    /// Windows for `Limit` rules, independent of the global rate limiter.
    rule_windows: DashMap<(RuleId, IpAddr), SlidingWindow>,
}

impl Evaluator {
    pub fn new(
        state: Arc<RwLock<EngineState>>,
        rules: Arc<RuleStore>,
        bans: Arc<BanTable>,
        trusted: Arc<TrustedZones>,
        limiter: Arc<RateLimiter>,
        ledger: Arc<ConnectionLedger>,
    ) -> Self {
        Self {
            state,
            rules,
            bans,
            trusted,
            limiter,
            ledger,
            rule_windows: DashMap::new(),
        }
    }

    /// Evaluate one connection attempt. Never fails: every connection
    /// receives a decision.
    pub fn evaluate(&self, connection: &Connection, now: DateTime<Utc>) -> Decision {
        let (enabled, default_policy, log_level) = {
            let state = self.state.read();
            (state.enabled, state.default_policy, state.log_level)
        };

        let decision = if !enabled {
            // Bypass: no table is consulted while the engine is off.
            Decision::allow(Reason::EngineDisabled)
        } else {
            self.decide(connection, default_policy, now)
        };

        self.ledger.record(connection.clone(), decision, now);
        self.emit(connection, &decision, log_level, now);
        decision
    }

    fn decide(&self, connection: &Connection, default_policy: Policy, now: DateTime<Utc>) -> Decision {
        if let Some(kind) = self.bans.check(connection.source_ip, now) {
            let reason = match kind {
                BanKind::Temporary => Reason::TemporaryBlock,
                BanKind::Permanent => Reason::PermanentBlock,
            };
            return Decision::deny(reason);
        }

        // Trusted zones bypass rate limiting and rule matching.
        if self.trusted.contains(connection.source_ip) {
            return Decision::allow(Reason::TrustedZone);
        }

        if !self
            .limiter
            .check_and_record(connection.source_ip, connection.destination_port, now)
        {
            return Decision::deny(Reason::RateLimited);
        }

        if let Some(entry) = self.rules.first_match(connection) {
            let over_limit = entry.rule.action == Action::Limit
                && !self.check_rule_limit(entry.id, entry.rule.rate_limit, connection, now);
            return Decision::from_rule(entry.id, entry.rule.action, over_limit);
        }

        let reason = Reason::DefaultPolicy;
        match default_policy {
            Policy::Allow => Decision::allow(reason),
            Policy::Deny => Decision::deny(reason),
        }
    }

    /// Rule-scoped window check for `Limit` rules. Keyed by (rule, source)
    /// so each source burns its own budget against the rule.
    fn check_rule_limit(
        &self,
        rule_id: RuleId,
        limit: Option<RateLimit>,
        connection: &Connection,
        now: DateTime<Utc>,
    ) -> bool {
        let limit = limit.unwrap_or(DEFAULT_RULE_LIMIT);
        let mut window = self
            .rule_windows
            .entry((rule_id, connection.source_ip))
            .or_default();
        window.check_and_record(&limit, now)
    }

    /// Evict rate-limit state that can no longer affect a decision: limiter
    /// buckets with no in-window hits, and rule windows whose hits have aged
    /// out or whose rule has been removed.
    pub fn prune_rate_state(&self, now: DateTime<Utc>) {
        self.limiter.prune(now);
        self.rule_windows
            .retain(|&(rule_id, _), window| match self.rules.get_rule(rule_id) {
                Some(entry) => {
                    let limit = entry.rule.rate_limit.unwrap_or(DEFAULT_RULE_LIMIT);
                    window.prune(&limit, now)
                }
                None => false,
            });
    }

    /// Number of live rule-scoped windows. Observer for tests and status
    /// reporting.
    pub fn rule_window_count(&self) -> usize {
        self.rule_windows.len()
    }

    /// Emit one structured event for the log sink, gated by log level:
    /// Low logs denials, Medium adds rule-matched allows, High logs
    /// everything. Verbosity never changes the decision.
    fn emit(
        &self,
        connection: &Connection,
        decision: &Decision,
        log_level: LogLevel,
        now: DateTime<Utc>,
    ) {
        let loggable = match (decision.verdict, decision.reason) {
            _ if log_level == LogLevel::Off => false,
            (Verdict::Deny, _) => log_level >= LogLevel::Low,
            (Verdict::Allow, Reason::MatchedRule(_)) => log_level >= LogLevel::Medium,
            (Verdict::Allow, _) => log_level >= LogLevel::High,
        };
        if !loggable {
            return;
        }

        if decision.verdict.is_allow() {
            debug!(
                timestamp = %now,
                outcome = %decision.verdict,
                reason = %decision.reason,
                action = %decision.action,
                source_ip = %connection.source_ip,
                dest_ip = %connection.destination_ip,
                port = connection.destination_port,
                protocol = %connection.protocol,
                "Connection allowed"
            );
        } else {
            info!(
                timestamp = %now,
                outcome = %decision.verdict,
                reason = %decision.reason,
                action = %decision.action,
                source_ip = %connection.source_ip,
                dest_ip = %connection.destination_ip,
                port = connection.destination_port,
                protocol = %connection.protocol,
                "Connection denied"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::connection::Protocol;
    use crate::engine::rules::Rule;
    use std::net::Ipv4Addr;

    fn addr(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, last))
    }

    fn conn(source: IpAddr, port: u16) -> Connection {
        Connection::new(source, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), port, Protocol::Tcp)
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    struct Fixture {
        state: Arc<RwLock<EngineState>>,
        rules: Arc<RuleStore>,
        bans: Arc<BanTable>,
        trusted: Arc<TrustedZones>,
        limiter: Arc<RateLimiter>,
        ledger: Arc<ConnectionLedger>,
        evaluator: Evaluator,
    }

    fn fixture() -> Fixture {
        let mut initial = EngineState::default();
        initial.enabled = true;
        let state = Arc::new(RwLock::new(initial));
        let rules = Arc::new(RuleStore::new());
        let bans = Arc::new(BanTable::new());
        let trusted = Arc::new(TrustedZones::new());
        let limiter = Arc::new(RateLimiter::default());
        let ledger = Arc::new(ConnectionLedger::default());
        let evaluator = Evaluator::new(
            Arc::clone(&state),
            Arc::clone(&rules),
            Arc::clone(&bans),
            Arc::clone(&trusted),
            Arc::clone(&limiter),
            Arc::clone(&ledger),
        );
        Fixture {
            state,
            rules,
            bans,
            trusted,
            limiter,
            ledger,
            evaluator,
        }
    }

    #[test]
    fn test_disabled_engine_allows_without_consulting_tables() {
        let f = fixture();
        f.state.write().enabled = false;
        f.bans.block(addr(1));

        let decision = f.evaluator.evaluate(&conn(addr(1), 80), t0());
        assert_eq!(decision.verdict, Verdict::Allow);
        assert_eq!(decision.reason, Reason::EngineDisabled);

        // The rate limiter saw nothing: no bucket was created.
        assert_eq!(f.limiter.bucket_count(), 0);
        // But the evaluation was still recorded.
        assert_eq!(f.ledger.allowed_count(), 1);
    }

    #[test]
    fn test_ban_check_precedes_everything() {
        let f = fixture();
        let now = t0();
        f.bans.block(addr(1));
        f.bans.temp_block(addr(2), chrono::Duration::seconds(30), now);

        let permanent = f.evaluator.evaluate(&conn(addr(1), 80), now);
        assert_eq!(permanent.reason, Reason::PermanentBlock);
        assert_eq!(permanent.verdict, Verdict::Deny);

        let temporary = f.evaluator.evaluate(&conn(addr(2), 80), now);
        assert_eq!(temporary.reason, Reason::TemporaryBlock);

        // Banned sources never reach the rate limiter.
        assert_eq!(f.limiter.bucket_count(), 0);
    }

    #[test]
    fn test_trusted_zone_bypasses_rate_limit_and_rules() {
        let f = fixture();
        let now = t0();
        f.trusted.add("203.0.113.9".parse().unwrap());
        f.limiter.set_default_limit(RateLimit::new(1, 60));
        f.rules.add_rule(Rule {
            priority: 0,
            action: Action::Deny,
            protocol: Protocol::Any,
            source: None,
            destination_port: None,
            established_only: false,
            rate_limit: None,
        });

        // Exhaust the limiter from an untrusted source.
        f.evaluator.evaluate(&conn(addr(50), 80), now);
        let limited = f.evaluator.evaluate(&conn(addr(50), 80), now);
        assert_eq!(limited.reason, Reason::RateLimited);

        // Trusted source still sails through, past both limiter and rules.
        let trusted = f.evaluator.evaluate(&conn(addr(9), 80), now);
        assert_eq!(trusted.verdict, Verdict::Allow);
        assert_eq!(trusted.reason, Reason::TrustedZone);
        assert_eq!(f.limiter.current_count(addr(9), 80, now), None);
    }

    #[test]
    fn test_rate_limited_sources_are_denied() {
        let f = fixture();
        let now = t0();
        f.limiter.set_default_limit(RateLimit::new(2, 60));

        assert_eq!(
            f.evaluator.evaluate(&conn(addr(1), 80), now).reason,
            Reason::DefaultPolicy
        );
        assert_eq!(
            f.evaluator.evaluate(&conn(addr(1), 80), now).reason,
            Reason::DefaultPolicy
        );
        let third = f.evaluator.evaluate(&conn(addr(1), 80), now);
        assert_eq!(third.verdict, Verdict::Deny);
        assert_eq!(third.reason, Reason::RateLimited);
    }

    #[test]
    fn test_first_matching_rule_decides() {
        let f = fixture();
        let now = t0();
        let allow_id = f.rules.add_rule(Rule {
            priority: 10,
            action: Action::Allow,
            protocol: Protocol::Tcp,
            source: None,
            destination_port: Some(22),
            established_only: false,
            rate_limit: None,
        });

        let ssh = f.evaluator.evaluate(&conn(addr(1), 22), now);
        assert_eq!(ssh.verdict, Verdict::Allow);
        assert_eq!(ssh.reason, Reason::MatchedRule(allow_id));

        // No rule for port 80; default policy (deny) applies.
        let web = f.evaluator.evaluate(&conn(addr(1), 80), now);
        assert_eq!(web.verdict, Verdict::Deny);
        assert_eq!(web.reason, Reason::DefaultPolicy);
    }

    #[test]
    fn test_reject_rule_denies_but_records_action() {
        let f = fixture();
        f.rules.add_rule(Rule {
            priority: 0,
            action: Action::Reject,
            protocol: Protocol::Tcp,
            source: None,
            destination_port: Some(23),
            established_only: false,
            rate_limit: None,
        });

        let decision = f.evaluator.evaluate(&conn(addr(1), 23), t0());
        assert_eq!(decision.verdict, Verdict::Deny);
        assert_eq!(decision.action, Action::Reject);
    }

    #[test]
    fn test_limit_rule_uses_its_own_window() {
        let f = fixture();
        let now = t0();
        let id = f.rules.add_rule(Rule {
            priority: 0,
            action: Action::Limit,
            protocol: Protocol::Tcp,
            source: None,
            destination_port: Some(22),
            established_only: false,
            rate_limit: Some(RateLimit::new(2, 30)),
        });

        for _ in 0..2 {
            let decision = f.evaluator.evaluate(&conn(addr(1), 22), now);
            assert_eq!(decision.verdict, Verdict::Allow);
            assert_eq!(decision.reason, Reason::MatchedRule(id));
        }

        let over = f.evaluator.evaluate(&conn(addr(1), 22), now);
        assert_eq!(over.verdict, Verdict::Deny);
        assert_eq!(over.reason, Reason::MatchedRule(id));
        assert_eq!(over.action, Action::Limit);

        // A different source has its own budget against the same rule.
        let other = f.evaluator.evaluate(&conn(addr(2), 22), now);
        assert_eq!(other.verdict, Verdict::Allow);
    }

    #[test]
    fn test_prune_drops_stale_rule_windows() {
        let f = fixture();
        let now = t0();
        let kept = f.rules.add_rule(Rule {
            priority: 0,
            action: Action::Limit,
            protocol: Protocol::Tcp,
            source: None,
            destination_port: Some(22),
            established_only: false,
            rate_limit: Some(RateLimit::new(5, 3600)),
        });
        let removed = f.rules.add_rule(Rule {
            priority: 0,
            action: Action::Limit,
            protocol: Protocol::Tcp,
            source: None,
            destination_port: Some(80),
            established_only: false,
            rate_limit: Some(RateLimit::new(5, 3600)),
        });

        f.evaluator.evaluate(&conn(addr(1), 22), now);
        f.evaluator.evaluate(&conn(addr(1), 80), now);
        assert_eq!(f.evaluator.rule_window_count(), 2);

        // A deleted rule's windows go with it; the live rule's stay.
        f.rules.remove_rule(removed);
        f.evaluator.prune_rate_state(now);
        assert_eq!(f.evaluator.rule_window_count(), 1);
        assert!(f.rules.get_rule(kept).is_some());

        // Once its hits age out, the live rule's window goes too, along
        // with the limiter's idle buckets.
        f.evaluator.prune_rate_state(now + chrono::Duration::seconds(3601));
        assert_eq!(f.evaluator.rule_window_count(), 0);
        assert_eq!(f.limiter.bucket_count(), 0);
    }

    #[test]
    fn test_default_policy_allow() {
        let f = fixture();
        f.state.write().default_policy = Policy::Allow;

        let decision = f.evaluator.evaluate(&conn(addr(1), 12345), t0());
        assert_eq!(decision.verdict, Verdict::Allow);
        assert_eq!(decision.reason, Reason::DefaultPolicy);
    }

    #[test]
    fn test_every_evaluation_is_recorded() {
        let f = fixture();
        let now = t0();
        f.bans.block(addr(1));

        f.evaluator.evaluate(&conn(addr(1), 80), now);
        f.evaluator.evaluate(&conn(addr(2), 80), now);
        f.state.write().enabled = false;
        f.evaluator.evaluate(&conn(addr(3), 80), now);

        assert_eq!(f.ledger.len(), 3);
        assert_eq!(f.ledger.denied_count(), 1);
        assert_eq!(f.ledger.allowed_count(), 2);
    }
}
