//! Exclusivity Mapper
//!
//! Bidirectional map enforcing that a persistent user id is bound to at most
//! one live local session at a time. A reconnecting user whose old session is
//! still registered is rejected at bind time ("already connected elsewhere")
//! rather than displacing it: displacement could let a disconnected but not
//! yet cleaned-up session be hijacked.

use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::net::protocol::{LocalId, UserId};

#[derive(Debug, Default)]
struct Bindings {
    by_local: HashMap<LocalId, UserId>,
    by_user: HashMap<UserId, LocalId>,
}

/// Process-wide user-id ⇄ local-id binding table.
///
/// Both directions are installed and removed as a pair under one write guard,
/// so a user id present in one direction is always present in the other with
/// the same counterpart.
#[derive(Debug, Default)]
pub struct ExclusivityMap {
    inner: RwLock<Bindings>,
}

impl ExclusivityMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `user_id` to `local_id` iff the user is not already bound to a
    /// different local id. Atomic: for any race on the same user id, exactly
    /// one caller succeeds. Rebinding the identical pair is a success.
    pub async fn try_bind(&self, local_id: LocalId, user_id: UserId) -> bool {
        let mut inner = self.inner.write().await;
        match inner.by_user.get(&user_id) {
            Some(existing) if *existing != local_id => {
                debug!(%user_id, bound = %existing, rejected = %local_id, "exclusivity bind refused");
                false
            }
            _ => {
                inner.by_local.insert(local_id, user_id.clone());
                inner.by_user.insert(user_id, local_id);
                true
            }
        }
    }

    /// Remove both directions for `local_id`. Idempotent: a second call for
    /// the same id returns `false`, not an error.
    pub async fn unbind(&self, local_id: LocalId) -> bool {
        let mut inner = self.inner.write().await;
        match inner.by_local.remove(&local_id) {
            Some(user_id) => {
                inner.by_user.remove(&user_id);
                debug!(%user_id, %local_id, "exclusivity binding released");
                true
            }
            None => false,
        }
    }

    /// Whether `user_id` currently has a live binding.
    pub async fn is_bound(&self, user_id: &UserId) -> bool {
        self.inner.read().await.by_user.contains_key(user_id)
    }

    /// The local id currently bound to `user_id`, if any.
    pub async fn resolve(&self, user_id: &UserId) -> Option<LocalId> {
        self.inner.read().await.by_user.get(user_id).copied()
    }

    /// Number of live bindings.
    pub async fn len(&self) -> usize {
        self.inner.read().await.by_user.len()
    }

    /// Whether no bindings exist.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.by_user.is_empty()
    }
}
