//! Lifecycle Event Pipeline
//!
//! Fire-and-forget notifications for loosely-coupled collaborators (recorders,
//! email, admin dashboards). The core never blocks on subscribers: events go
//! out over a broadcast channel and slow receivers lag or drop.
//!
//! The one exception is the pre-join hook: an external collaborator may veto
//! a join before it completes. That single case is a synchronous callback
//! returning an optional denial, distinct from all other notifications.

use std::net::IpAddr;
use std::sync::RwLock;
use tokio::sync::broadcast;

use crate::net::protocol::{DisconnectReason, GameId, LocalId, UserId};

/// Lifecycle notifications emitted by the core.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// A session finished registration.
    ConnectionEstablished {
        /// Assigned local id.
        local_id: LocalId,
        /// Persistent identity, if authenticated.
        user_id: Option<UserId>,
        /// Canonicalized source address.
        address: IpAddr,
    },
    /// A game was created.
    GameCreated {
        /// The game.
        game: GameId,
    },
    /// A player was admitted into a game.
    PlayerJoined {
        /// The game.
        game: GameId,
        /// The player.
        local_id: LocalId,
    },
    /// A player left or was removed from a game.
    PlayerLeft {
        /// The game.
        game: GameId,
        /// The player.
        local_id: LocalId,
    },
    /// A game started.
    GameStarted {
        /// The game.
        game: GameId,
    },
    /// A game ended.
    GameEnded {
        /// The game.
        game: GameId,
    },
    /// Game options (privacy) changed.
    OptionsChanged {
        /// The game.
        game: GameId,
        /// Whether the game is now public.
        public: bool,
    },
    /// A player was kicked, and possibly banned.
    PlayerKicked {
        /// The game.
        game: GameId,
        /// The player.
        local_id: LocalId,
        /// Whether an address ban was recorded.
        banned: bool,
    },
    /// A game was destroyed.
    GameDestroyed {
        /// The game.
        game: GameId,
    },
}

/// A pre-join veto from an external collaborator.
#[derive(Debug, Clone)]
pub struct JoinDenial {
    /// Client-displayable reason.
    pub reason: DisconnectReason,
}

/// Inputs available to pre-join hooks.
#[derive(Debug, Clone)]
pub struct PreJoinContext {
    /// Target game.
    pub game: GameId,
    /// Joining session's local id.
    pub local_id: LocalId,
    /// Persistent identity, if authenticated.
    pub user_id: Option<UserId>,
    /// Friend code, if known.
    pub friend_code: Option<String>,
    /// Source address.
    pub address: IpAddr,
}

type PreJoinHook = Box<dyn Fn(&PreJoinContext) -> Option<JoinDenial> + Send + Sync>;

/// The event dispatcher handed to every component that emits lifecycle
/// notifications.
pub struct EventDispatcher {
    tx: broadcast::Sender<LifecycleEvent>,
    pre_join_hooks: RwLock<Vec<PreJoinHook>>,
}

impl EventDispatcher {
    /// Create a dispatcher with a bounded broadcast buffer.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            tx,
            pre_join_hooks: RwLock::new(Vec::new()),
        }
    }

    /// Emit an event. Never blocks; an event with no subscribers is dropped.
    pub fn emit(&self, event: LifecycleEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }

    /// Register a synchronous pre-join veto hook.
    pub fn register_pre_join_hook<F>(&self, hook: F)
    where
        F: Fn(&PreJoinContext) -> Option<JoinDenial> + Send + Sync + 'static,
    {
        self.pre_join_hooks
            .write()
            .expect("pre-join hook lock poisoned")
            .push(Box::new(hook));
    }

    /// Consult the hooks; the first denial wins.
    pub fn pre_join(&self, ctx: &PreJoinContext) -> Option<JoinDenial> {
        let hooks = self
            .pre_join_hooks
            .read()
            .expect("pre-join hook lock poisoned");
        hooks.iter().find_map(|hook| hook(ctx))
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
