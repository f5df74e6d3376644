//! The access-control engine: rule store, rate limiter, ban table,
//! connection ledger, evaluator, and the controller facade.

mod bans;
mod connection;
mod controller;
mod evaluator;
mod ledger;
mod ratelimit;
mod rules;
mod state;

pub use bans::{BanKind, BanTable, TrustedZones};
pub use connection::{Action, Connection, Decision, Protocol, Reason, Verdict};
pub use controller::{Controller, EngineStatus};
pub use evaluator::Evaluator;
pub use ledger::{ConnectionLedger, LedgerEntry, DEFAULT_LEDGER_CAPACITY};
pub use ratelimit::{RateLimit, RateLimiter, SlidingWindow};
pub use rules::{Profile, Rule, RuleEntry, RuleId, RuleStore, SourcePattern};
pub use state::{EngineState, LogLevel, Policy};
