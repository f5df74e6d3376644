//! Permanent blocks, temporary bans with expiry, and trusted zones.
//!
//! Temporary bans expire lazily: `check` evicts stale entries as it sees
//! them instead of relying on a background sweep, so behavior is fully
//! determined by the call sequence and the caller-supplied `now`.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use tracing::{debug, info};

use super::rules::SourcePattern;

/// Kind of ban currently in force for an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanKind {
    Permanent,
    Temporary,
}

#[derive(Debug, Default)]
struct BanInner {
    permanent: HashSet<IpAddr>,
    /// Address -> expiry. An address never appears here and in `permanent`
    /// at the same time.
    temporary: HashMap<IpAddr, DateTime<Utc>>,
}

/// Block list: permanent entries plus temporary bans with expiry.
#[derive(Debug, Default)]
pub struct BanTable {
    inner: RwLock<BanInner>,
}

impl BanTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Permanently block an address. Clears any temporary entry; permanent
    /// always wins.
    pub fn block(&self, address: IpAddr) {
        let mut inner = self.inner.write();
        inner.temporary.remove(&address);
        if inner.permanent.insert(address) {
            info!(address = %address, "Address permanently blocked");
        }
    }

    /// Remove both permanent and temporary entries for the address.
    pub fn unblock(&self, address: IpAddr) {
        let mut inner = self.inner.write();
        let was_permanent = inner.permanent.remove(&address);
        let was_temporary = inner.temporary.remove(&address).is_some();
        if was_permanent || was_temporary {
            info!(address = %address, "Address unblocked");
        }
    }

    /// Ban an address until `now + duration`. Overwrites an existing
    /// temporary expiry; a permanent block is left untouched.
    pub fn temp_block(&self, address: IpAddr, duration: Duration, now: DateTime<Utc>) {
        let mut inner = self.inner.write();
        if inner.permanent.contains(&address) {
            return;
        }
        let expires_at = now + duration;
        debug!(address = %address, expires_at = %expires_at, "Address temporarily blocked");
        inner.temporary.insert(address, expires_at);
    }

    /// The ban in force for an address, if any. Evicts an expired temporary
    /// entry when it finds one.
    pub fn check(&self, address: IpAddr, now: DateTime<Utc>) -> Option<BanKind> {
        {
            let inner = self.inner.read();
            if inner.permanent.contains(&address) {
                return Some(BanKind::Permanent);
            }
            match inner.temporary.get(&address) {
                Some(expires_at) if *expires_at > now => return Some(BanKind::Temporary),
                Some(_) => {} // expired, fall through to evict
                None => return None,
            }
        }
        // Upgrade to a write lock only for eviction. Re-check under the
        // write lock: the entry may have been refreshed in between.
        let mut inner = self.inner.write();
        match inner.temporary.get(&address) {
            Some(expires_at) if *expires_at > now => Some(BanKind::Temporary),
            Some(_) => {
                inner.temporary.remove(&address);
                debug!(address = %address, "Expired temporary ban evicted");
                None
            }
            None => None,
        }
    }

    /// Whether any ban is in force for the address.
    pub fn is_blocked(&self, address: IpAddr, now: DateTime<Utc>) -> bool {
        self.check(address, now).is_some()
    }

    /// Number of live entries (permanent + unexpired temporary is not
    /// distinguished here; expired entries may still be counted until a
    /// check evicts them).
    pub fn len(&self) -> usize {
        let inner = self.inner.read();
        inner.permanent.len() + inner.temporary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Source addresses exempted from rate limiting and rule evaluation.
///
/// An administrative override: traffic from a trusted zone is allowed before
/// the rate limiter or rule store is ever consulted.
#[derive(Debug, Default)]
pub struct TrustedZones {
    zones: RwLock<Vec<SourcePattern>>,
}

impl TrustedZones {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, pattern: SourcePattern) {
        let mut zones = self.zones.write();
        if !zones.contains(&pattern) {
            info!(zone = %pattern, "Trusted zone added");
            zones.push(pattern);
        }
    }

    pub fn remove(&self, pattern: &SourcePattern) {
        self.zones.write().retain(|z| z != pattern);
    }

    pub fn contains(&self, address: IpAddr) -> bool {
        self.zones.read().iter().any(|z| z.matches(address))
    }

    pub fn list(&self) -> Vec<SourcePattern> {
        self.zones.read().clone()
    }
}
