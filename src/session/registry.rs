//! Session Registration Cascade
//!
//! Turns a new game-channel connection plus its handshake into a registered
//! session: version gate, name validation, address normalization, identity
//! resolution, local-id assignment, exclusivity bind, session construction.
//! Every rejection path closes the connection with a specific reason and
//! registers nothing.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::auth::cache::{normalize_addr, IdentityCache};
use crate::auth::exclusive::ExclusivityMap;
use crate::events::{EventDispatcher, LifecycleEvent};
use crate::net::protocol::{
    DisconnectReason, Handshake, LocalId, ProtocolVersion, UserId, VersionCheck,
    MAX_SUPPORTED_VERSION, MIN_SUPPORTED_VERSION,
};
use crate::net::transport::ClientLink;
use crate::session::resolve::{resolve_identity, ResolveContext, ResolvedIdentity};

/// Upper bound on display-name length, in characters.
pub const MAX_NAME_LEN: usize = 32;

/// Registration errors. Each maps onto a client-displayable disconnect
/// reason.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    /// Client protocol version below the supported range.
    #[error("client version too old")]
    VersionTooOld,

    /// Client protocol version above the supported range.
    #[error("client version too new")]
    VersionTooNew,

    /// Client protocol version unrecognizable.
    #[error("client version unknown")]
    VersionUnknown,

    /// Display name exceeds the length bound.
    #[error("name too long")]
    NameTooLong,

    /// Display name empty or whitespace-only.
    #[error("illegal name")]
    IllegalName,

    /// Persistent identity already bound to another live session.
    #[error("identity already connected elsewhere")]
    DuplicateIdentity,
}

impl RegisterError {
    /// The disconnect reason sent to the client.
    pub fn reason(&self) -> DisconnectReason {
        match self {
            Self::VersionTooOld => DisconnectReason::OutdatedClient,
            Self::VersionTooNew => DisconnectReason::TooNewClient,
            Self::VersionUnknown => DisconnectReason::Error,
            Self::NameTooLong => DisconnectReason::UsernameTooLong,
            Self::IllegalName => DisconnectReason::IllegalUsername,
            Self::DuplicateIdentity => DisconnectReason::DuplicateIdentity,
        }
    }
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Oldest accepted protocol version.
    pub min_version: ProtocolVersion,
    /// Newest accepted protocol version.
    pub max_version: ProtocolVersion,
    /// Escape hatch: admit future versions (with a logged warning) when the
    /// handshake carried platform metadata.
    pub allow_future_versions: bool,
    /// Display-name length bound.
    pub max_name_len: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            min_version: MIN_SUPPORTED_VERSION,
            max_version: MAX_SUPPORTED_VERSION,
            allow_future_versions: false,
            max_name_len: MAX_NAME_LEN,
        }
    }
}

/// One registered client on the game channel.
#[derive(Debug)]
pub struct Session {
    /// Local session id, unique among online sessions.
    pub local_id: LocalId,
    /// Persistent identity; `None` for unauthenticated fallbacks.
    pub user_id: Option<UserId>,
    /// Friend code (cache-corroborated, self-reported, or derived).
    pub friend_code: Option<String>,
    /// Display name.
    pub name: String,
    /// Canonicalized source address.
    pub address: IpAddr,
    /// Declared protocol version.
    pub version: ProtocolVersion,
    /// Transport handle for this connection.
    pub link: ClientLink,
}

impl Session {
    /// Whether this session resolved to a cache-backed identity.
    pub fn authenticated(&self) -> bool {
        self.user_id.is_some()
    }
}

/// The registration service. Owns the online-session table and the local-id
/// counter; reads the correlation cache and writes the exclusivity map.
pub struct SessionRegistry {
    cache: Arc<IdentityCache>,
    exclusivity: Arc<ExclusivityMap>,
    events: Arc<EventDispatcher>,
    config: RegistryConfig,
    next_id: AtomicU32,
    sessions: RwLock<HashMap<LocalId, Arc<Session>>>,
}

impl SessionRegistry {
    /// Create a registry over the shared services.
    pub fn new(
        cache: Arc<IdentityCache>,
        exclusivity: Arc<ExclusivityMap>,
        events: Arc<EventDispatcher>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            cache,
            exclusivity,
            events,
            config,
            next_id: AtomicU32::new(1),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Run the registration cascade for a new connection.
    ///
    /// On rejection the connection is closed with the specific reason before
    /// the error is returned, and no state is left behind.
    pub async fn register(
        &self,
        link: ClientLink,
        hello: Handshake,
    ) -> Result<Arc<Session>, RegisterError> {
        if let Err(e) = self.gate_version(&hello) {
            return self.reject(&link, e).await;
        }
        if let Err(e) = self.validate_name(&hello.name) {
            return self.reject(&link, e).await;
        }

        let address = normalize_addr(link.ip());
        let mut ctx = ResolveContext {
            token: hello.token.clone(),
            friend_code: hello.friend_code.clone(),
            address,
            name: hello.name.clone(),
        };
        let identity: ResolvedIdentity = resolve_identity(&self.cache, &mut ctx).await;

        let local_id = self.next_local_id().await;

        // Exclusivity applies to authenticated identities only; fallback
        // identities are per-connection and not shared.
        if let Some(user_id) = identity.user_id.clone() {
            if !self.exclusivity.try_bind(local_id, user_id).await {
                return self.reject(&link, RegisterError::DuplicateIdentity).await;
            }
        }

        let session = Arc::new(Session {
            local_id,
            user_id: identity.user_id.clone(),
            friend_code: identity.friend_code,
            name: hello.name.trim().to_owned(),
            address,
            version: hello.version,
            link,
        });

        self.sessions
            .write()
            .await
            .insert(local_id, session.clone());

        info!(
            %local_id,
            authenticated = session.authenticated(),
            name = %session.name,
            "session registered"
        );
        self.events.emit(LifecycleEvent::ConnectionEstablished {
            local_id,
            user_id: identity.user_id,
            address,
        });

        Ok(session)
    }

    /// Remove a session and release its exclusivity binding.
    pub async fn unregister(&self, local_id: LocalId) -> Option<Arc<Session>> {
        let session = self.sessions.write().await.remove(&local_id)?;
        self.exclusivity.unbind(local_id).await;
        debug!(%local_id, "session unregistered");
        Some(session)
    }

    /// Look up an online session.
    pub async fn get(&self, local_id: LocalId) -> Option<Arc<Session>> {
        self.sessions.read().await.get(&local_id).cloned()
    }

    /// Number of online sessions.
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Step 1: protocol-version gate.
    fn gate_version(&self, hello: &Handshake) -> Result<(), RegisterError> {
        let outcome = if hello.version == 0 {
            VersionCheck::Unknown
        } else if hello.version < self.config.min_version {
            VersionCheck::ClientTooOld
        } else if hello.version > self.config.max_version {
            VersionCheck::ClientTooNew
        } else {
            VersionCheck::Compatible
        };

        match outcome {
            VersionCheck::Compatible => Ok(()),
            VersionCheck::ClientTooNew
                if self.config.allow_future_versions && hello.platform.is_some() =>
            {
                warn!(
                    version = hello.version,
                    "admitting future protocol version via escape hatch"
                );
                Ok(())
            }
            VersionCheck::ClientTooOld => Err(RegisterError::VersionTooOld),
            VersionCheck::ClientTooNew => Err(RegisterError::VersionTooNew),
            VersionCheck::Unknown => Err(RegisterError::VersionUnknown),
        }
    }

    /// Step 2: display-name validation.
    fn validate_name(&self, name: &str) -> Result<(), RegisterError> {
        if name.trim().is_empty() {
            return Err(RegisterError::IllegalName);
        }
        if name.chars().count() > self.config.max_name_len {
            return Err(RegisterError::NameTooLong);
        }
        Ok(())
    }

    /// Step 5: allocate the next local id.
    ///
    /// Monotonic, wrapping past overflow back to 1, skipping 0 and any id
    /// still online. The counter hands out distinct candidates, so a
    /// collision requires a full u32 wrap while the original session is
    /// still connected.
    async fn next_local_id(&self) -> LocalId {
        let sessions = self.sessions.read().await;
        loop {
            let raw = self.next_id.fetch_add(1, Ordering::Relaxed);
            if raw == 0 {
                continue;
            }
            let candidate = LocalId(raw);
            if !sessions.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Close the connection with the error's reason and propagate it.
    async fn reject<T>(
        &self,
        link: &ClientLink,
        error: RegisterError,
    ) -> Result<T, RegisterError> {
        warn!(endpoint = %link.endpoint(), %error, "registration rejected");
        link.disconnect(error.reason()).await;
        Err(error)
    }
}
