//! Identity Correlation Cache
//!
//! Multi-key lookup store correlating the two client channels. Any of
//! {one-time nonce, opaque auth token, network address, friend code} resolves
//! to a single [`AuthRecord`]. The token index is primary; the other three are
//! secondary indices that map back to a token.
//!
//! Records expire a fixed interval after *creation* (no sliding expiration):
//! a record issued once and never re-validated disappears even while in use,
//! forcing periodic re-authentication. Expiry is lazy (checked on lookup)
//! plus a throttled sweep that bulk-prunes all four indices.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::net::protocol::UserId;

/// How long a record lives, measured from creation.
pub const RECORD_TTL: Duration = Duration::from_secs(600);

/// Minimum interval between bulk sweeps.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// One validated authentication event.
///
/// Never mutated after creation except for nonce-index attachment, which
/// lives outside the record itself.
#[derive(Debug, Clone)]
pub struct AuthRecord {
    /// Persistent user id from the identity provider.
    pub user_id: UserId,
    /// Opaque auth token (primary key).
    pub token: String,
    /// Stable friend code, if the provider supplied one.
    pub friend_code: Option<String>,
    /// Source address at registration time, canonicalized.
    pub address: Option<IpAddr>,
    /// Display name at registration time.
    pub name: Option<String>,
    /// Wall-clock creation time, for diagnostics.
    pub created_at: DateTime<Utc>,
    /// Monotonic creation time, for TTL math.
    created: Instant,
}

impl AuthRecord {
    fn expired(&self, ttl: Duration) -> bool {
        self.created.elapsed() >= ttl
    }
}

/// Diagnostic snapshot of index sizes. No side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of live primary (token) entries, expired or not.
    pub token_count: usize,
    /// Number of address index entries.
    pub address_index_count: usize,
}

/// Canonicalize an address for indexing and lookup.
///
/// IPv4-mapped IPv6 addresses collapse to their IPv4 form, otherwise
/// dual-stack clients fail address-based correlation.
pub fn normalize_addr(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => addr,
        },
        IpAddr::V4(_) => addr,
    }
}

#[derive(Debug)]
struct Indices {
    by_token: HashMap<String, AuthRecord>,
    by_nonce: HashMap<u32, String>,
    by_addr: HashMap<IpAddr, String>,
    by_code: HashMap<String, String>,
    last_sweep: Instant,
}

impl Indices {
    fn new() -> Self {
        Self {
            by_token: HashMap::new(),
            by_nonce: HashMap::new(),
            by_addr: HashMap::new(),
            by_code: HashMap::new(),
            last_sweep: Instant::now(),
        }
    }

    /// Drop all secondary entries pointing at `token`.
    fn unindex(&mut self, token: &str) {
        self.by_nonce.retain(|_, t| t != token);
        self.by_addr.retain(|_, t| t != token);
        self.by_code.retain(|_, t| t != token);
    }

    /// Remove a primary entry and everything pointing at it.
    fn evict(&mut self, token: &str) {
        self.by_token.remove(token);
        self.unindex(token);
    }

    /// Bulk-prune expired primaries and now-dangling secondaries.
    fn sweep(&mut self, ttl: Duration) -> usize {
        let expired: Vec<String> = self
            .by_token
            .iter()
            .filter(|(_, r)| r.expired(ttl))
            .map(|(t, _)| t.clone())
            .collect();
        for token in &expired {
            self.by_token.remove(token);
        }

        let live = &self.by_token;
        self.by_nonce.retain(|_, t| live.contains_key(t));
        self.by_addr.retain(|_, t| live.contains_key(t));
        self.by_code.retain(|_, t| live.contains_key(t));

        self.last_sweep = Instant::now();
        expired.len()
    }
}

/// The process-wide correlation cache.
///
/// Constructed explicitly at server startup and injected into the components
/// that need it; every test gets a fresh instance. All operations are safe
/// under arbitrary interleaving with no external locking by callers.
#[derive(Debug)]
pub struct IdentityCache {
    inner: RwLock<Indices>,
    ttl: Duration,
    sweep_interval: Duration,
}

impl IdentityCache {
    /// Create a cache with production TTL and sweep cadence.
    pub fn new() -> Self {
        Self::with_ttl(RECORD_TTL, SWEEP_INTERVAL)
    }

    /// Create a cache with explicit timings. Tests use a zero TTL to get
    /// instant expiry instead of sleeping.
    pub fn with_ttl(ttl: Duration, sweep_interval: Duration) -> Self {
        Self {
            inner: RwLock::new(Indices::new()),
            ttl,
            sweep_interval,
        }
    }

    /// Insert or overwrite the record for `token`.
    ///
    /// Secondary indices for address and friend code are updated when
    /// provided. Last write wins for a token; a token is issued once per
    /// external authentication event, so concurrent overwrites are benign.
    pub async fn put(
        &self,
        user_id: UserId,
        token: String,
        friend_code: Option<String>,
        address: Option<IpAddr>,
        name: Option<String>,
    ) {
        let address = address.map(normalize_addr);
        let record = AuthRecord {
            user_id,
            token: token.clone(),
            friend_code: friend_code.clone(),
            address,
            name,
            created_at: Utc::now(),
            created: Instant::now(),
        };

        let mut inner = self.inner.write().await;

        // Overwrite: stale secondaries for this token must not survive.
        if inner.by_token.contains_key(&token) {
            inner.unindex(&token);
        }

        if let Some(addr) = address {
            inner.by_addr.insert(addr, token.clone());
        }
        if let Some(code) = friend_code {
            inner.by_code.insert(code, token.clone());
        }
        inner.by_token.insert(token.clone(), record);

        trace!(token = %redact(&token), "auth record stored");
        self.maybe_sweep(&mut inner);
    }

    /// Attach a nonce index to an existing token entry.
    ///
    /// If the token is absent the index simply dangles and is pruned on
    /// lookup failure; no error is reported.
    pub async fn bind_nonce(&self, token: &str, nonce: u32) {
        let mut inner = self.inner.write().await;
        inner.by_nonce.insert(nonce, token.to_owned());
        trace!(nonce = %format_args!("{nonce:08x}"), "nonce bound");
    }

    /// Whether a nonce index is currently installed.
    ///
    /// Used by the pre-auth listener to guarantee uniqueness at issuance.
    pub async fn is_nonce_bound(&self, nonce: u32) -> bool {
        self.inner.read().await.by_nonce.contains_key(&nonce)
    }

    /// Resolve a nonce to its record, if present and unexpired.
    pub async fn lookup_by_nonce(&self, nonce: u32) -> Option<AuthRecord> {
        let mut inner = self.inner.write().await;
        let token = match inner.by_nonce.get(&nonce) {
            Some(t) => t.clone(),
            None => return None,
        };
        match self.live_record(&mut inner, &token) {
            Some(record) => Some(record),
            None => {
                // Dangling secondary: prune opportunistically.
                inner.by_nonce.remove(&nonce);
                None
            }
        }
    }

    /// Resolve a token to its record, if present and unexpired.
    pub async fn lookup_by_token(&self, token: &str) -> Option<AuthRecord> {
        let mut inner = self.inner.write().await;
        self.live_record(&mut inner, token)
    }

    /// Resolve an address to its record, if present and unexpired.
    pub async fn lookup_by_address(&self, address: IpAddr) -> Option<AuthRecord> {
        let address = normalize_addr(address);
        let mut inner = self.inner.write().await;
        let token = match inner.by_addr.get(&address) {
            Some(t) => t.clone(),
            None => return None,
        };
        match self.live_record(&mut inner, &token) {
            Some(record) => Some(record),
            None => {
                inner.by_addr.remove(&address);
                None
            }
        }
    }

    /// Resolve a friend code to its record, if present and unexpired.
    pub async fn lookup_by_friend_code(&self, code: &str) -> Option<AuthRecord> {
        let mut inner = self.inner.write().await;
        let token = match inner.by_code.get(code) {
            Some(t) => t.clone(),
            None => return None,
        };
        match self.live_record(&mut inner, &token) {
            Some(record) => Some(record),
            None => {
                inner.by_code.remove(code);
                None
            }
        }
    }

    /// Diagnostic snapshot of index sizes.
    pub async fn stats(&self) -> CacheStats {
        let inner = self.inner.read().await;
        CacheStats {
            token_count: inner.by_token.len(),
            address_index_count: inner.by_addr.len(),
        }
    }

    /// Fetch a primary record, treating expiry as a miss and evicting it.
    fn live_record(&self, inner: &mut Indices, token: &str) -> Option<AuthRecord> {
        match inner.by_token.get(token) {
            Some(record) if !record.expired(self.ttl) => Some(record.clone()),
            Some(_) => {
                inner.evict(token);
                debug!(token = %redact(token), "expired auth record evicted");
                None
            }
            None => None,
        }
    }

    /// Run the bulk sweep at most once per cleanup cycle.
    fn maybe_sweep(&self, inner: &mut Indices) {
        if inner.last_sweep.elapsed() < self.sweep_interval {
            return;
        }
        let evicted = inner.sweep(self.ttl);
        if evicted > 0 {
            debug!(evicted, "auth cache sweep");
        }
    }
}

impl Default for IdentityCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Log-safe rendering of an opaque token.
fn redact(token: &str) -> String {
    let head: String = token.chars().take(6).collect();
    format!("{head}…")
}
