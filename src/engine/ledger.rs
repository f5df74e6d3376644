//! Bounded, append-only log of evaluated connections plus aggregate counters.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::connection::{Connection, Decision};

/// Default ring capacity when none is configured.
pub const DEFAULT_LEDGER_CAPACITY: usize = 1000;

/// One recorded evaluation.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub timestamp: DateTime<Utc>,
    pub connection: Connection,
    pub decision: Decision,
}

/// Fixed-capacity ring of recent evaluations with running allow/deny
/// counters. The ring overwrites its oldest entry once full and never grows;
/// the counters cover every evaluation ever recorded.
#[derive(Debug)]
pub struct ConnectionLedger {
    entries: Mutex<VecDeque<LedgerEntry>>,
    capacity: usize,
    allowed: AtomicU64,
    denied: AtomicU64,
}

impl ConnectionLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            allowed: AtomicU64::new(0),
            denied: AtomicU64::new(0),
        }
    }

    /// Append an evaluation and bump the matching counter. A capacity of
    /// zero keeps the counters but retains no entries.
    pub fn record(&self, connection: Connection, decision: Decision, now: DateTime<Utc>) {
        if decision.verdict.is_allow() {
            self.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.denied.fetch_add(1, Ordering::Relaxed);
        }

        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(LedgerEntry {
            timestamp: now,
            connection,
            decision,
        });
    }

    /// The most recent `n` entries, newest last.
    pub fn recent(&self, n: usize) -> Vec<LedgerEntry> {
        let entries = self.entries.lock();
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn allowed_count(&self) -> u64 {
        self.allowed.load(Ordering::Relaxed)
    }

    pub fn denied_count(&self) -> u64 {
        self.denied.load(Ordering::Relaxed)
    }

    /// Number of entries currently held in the ring.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for ConnectionLedger {
    fn default() -> Self {
        Self::new(DEFAULT_LEDGER_CAPACITY)
    }
}
