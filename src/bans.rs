//! Ban Surfaces
//!
//! Two distinct surfaces consulted during join:
//!
//! - [`BanCheck`]: the synchronous predicate backed by the persisted ban
//!   service. Ban-list mutation lives behind the HTTP administration surface,
//!   which is an external collaborator; the core only asks yes/no.
//! - [`AddressBanList`]: a lighter-weight, in-memory-only address list fed by
//!   in-game kick-with-ban commands. It does not survive restart.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::RwLock;

use crate::auth::cache::normalize_addr;

/// The ban-service predicate.
pub trait BanCheck: Send + Sync {
    /// Whether a player with this friend code and/or address is banned.
    fn is_banned(&self, friend_code: Option<&str>, address: IpAddr) -> bool;
}

/// A ban service that bans nobody. Default wiring for tests and standalone
/// deployments.
#[derive(Debug, Default)]
pub struct NoBans;

impl BanCheck for NoBans {
    fn is_banned(&self, _friend_code: Option<&str>, _address: IpAddr) -> bool {
        false
    }
}

/// In-memory ban list implementing the service predicate. Used where no
/// external ban service is wired up.
#[derive(Debug, Default)]
pub struct MemoryBanList {
    codes: RwLock<HashSet<String>>,
    addrs: RwLock<HashSet<IpAddr>>,
}

impl MemoryBanList {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ban a friend code.
    pub fn ban_code(&self, code: &str) {
        self.codes
            .write()
            .expect("ban list lock poisoned")
            .insert(code.to_owned());
    }

    /// Ban an address.
    pub fn ban_address(&self, address: IpAddr) {
        self.addrs
            .write()
            .expect("ban list lock poisoned")
            .insert(normalize_addr(address));
    }
}

impl BanCheck for MemoryBanList {
    fn is_banned(&self, friend_code: Option<&str>, address: IpAddr) -> bool {
        if let Some(code) = friend_code {
            if self
                .codes
                .read()
                .expect("ban list lock poisoned")
                .contains(code)
            {
                return true;
            }
        }
        self.addrs
            .read()
            .expect("ban list lock poisoned")
            .contains(&normalize_addr(address))
    }
}

/// The in-memory address ban list fed by kick-with-ban.
#[derive(Debug, Default)]
pub struct AddressBanList {
    addrs: RwLock<HashSet<IpAddr>>,
}

impl AddressBanList {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an address ban.
    pub fn ban(&self, address: IpAddr) {
        self.addrs
            .write()
            .expect("address ban lock poisoned")
            .insert(normalize_addr(address));
    }

    /// Lift an address ban. Returns whether it existed.
    pub fn unban(&self, address: IpAddr) -> bool {
        self.addrs
            .write()
            .expect("address ban lock poisoned")
            .remove(&normalize_addr(address))
    }

    /// Whether an address is banned.
    pub fn contains(&self, address: IpAddr) -> bool {
        self.addrs
            .read()
            .expect("address ban lock poisoned")
            .contains(&normalize_addr(address))
    }

    /// Number of banned addresses.
    pub fn len(&self) -> usize {
        self.addrs.read().expect("address ban lock poisoned").len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
