//! Game State
//!
//! One game (lobby) instance: its lifecycle state, host, member table, and
//! broadcast plumbing. Membership mutation beyond plain reads goes through
//! the join and command paths, which serialize on the game's join lock.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::trace;

use crate::game::watchdog::SpawnWatchdog;
use crate::net::protocol::{GameId, LocalId, PlayerSummary, ServerMessage, UserId};
use crate::session::Session;

/// Lifecycle of a game.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameState {
    /// Lobby open, not yet started.
    NotStarted,
    /// Start requested, transition in flight.
    Starting,
    /// Play in progress.
    Started,
    /// A round finished; members may rejoin for another.
    Ended,
    /// Torn down; joins are refused and the instance is awaiting removal.
    Destroyed,
}

/// Per-player limbo status within a game.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimboState {
    /// Just admitted; promoted once the room has been told.
    PreSpawn,
    /// Rejoined an ended game before the recognized host returned.
    WaitingForHost,
    /// Fully active.
    NotLimbo,
}

/// Per-game configuration, fixed at creation.
#[derive(Debug, Clone)]
pub struct GameConfig {
    /// Member capacity.
    pub max_players: usize,
    /// Whether the game starts publicly listed.
    pub public: bool,
    /// Whether members may run mixed protocol versions.
    pub allow_version_mixing: bool,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            max_players: 10,
            public: false,
            allow_version_mixing: false,
        }
    }
}

/// The recognized host. The user id (when present) survives the host's
/// disconnect, which is how an ended game recognizes its returning host.
#[derive(Debug, Clone)]
pub struct HostInfo {
    /// The host's current local id.
    pub local_id: LocalId,
    /// The host's persistent identity, if authenticated.
    pub user_id: Option<UserId>,
}

/// One member of a game.
#[derive(Debug)]
pub struct Player {
    /// The member's session.
    pub session: Arc<Session>,
    /// Limbo status.
    pub limbo: LimboState,
    /// Spawn-confirmation timer.
    pub watchdog: SpawnWatchdog,
}

impl Player {
    /// Wrap a session as a newly admitted member.
    pub fn new(session: Arc<Session>, limbo: LimboState) -> Self {
        Self {
            session,
            limbo,
            watchdog: SpawnWatchdog::new(),
        }
    }

    /// A wire summary of this member.
    pub fn summary(&self) -> PlayerSummary {
        PlayerSummary {
            local_id: self.session.local_id,
            name: self.session.name.clone(),
            friend_code: self.session.friend_code.clone(),
        }
    }
}

/// One game instance. Shared as `Arc<Game>`.
pub struct Game {
    /// Game id.
    pub id: GameId,
    /// Creation-time configuration.
    pub config: GameConfig,
    state: RwLock<GameState>,
    host: RwLock<Option<HostInfo>>,
    players: RwLock<BTreeMap<LocalId, Player>>,
    public: RwLock<bool>,
    // Serializes join and removal so capacity checks and host migration see
    // a consistent member table.
    join_lock: Mutex<()>,
}

impl Game {
    /// Create an empty game in the `NotStarted` state.
    pub fn new(id: GameId, config: GameConfig) -> Self {
        let public = config.public;
        Self {
            id,
            config,
            state: RwLock::new(GameState::NotStarted),
            host: RwLock::new(None),
            players: RwLock::new(BTreeMap::new()),
            public: RwLock::new(public),
            join_lock: Mutex::new(()),
        }
    }

    /// Acquire the join/removal lock.
    pub async fn lock_membership(&self) -> MutexGuard<'_, ()> {
        self.join_lock.lock().await
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> GameState {
        *self.state.read().await
    }

    /// Transition lifecycle state.
    pub async fn set_state(&self, state: GameState) {
        trace!(game = %self.id, ?state, "state transition");
        *self.state.write().await = state;
    }

    /// Current host.
    pub async fn host(&self) -> Option<HostInfo> {
        self.host.read().await.clone()
    }

    /// Replace the host.
    pub async fn set_host(&self, host: Option<HostInfo>) {
        *self.host.write().await = host;
    }

    /// Whether the game is publicly listed.
    pub async fn is_public(&self) -> bool {
        *self.public.read().await
    }

    /// Alter public listing.
    pub async fn set_public(&self, public: bool) {
        *self.public.write().await = public;
    }

    /// Number of members, limbo included.
    pub async fn player_count(&self) -> usize {
        self.players.read().await.len()
    }

    /// Whether a local id is a member.
    pub async fn contains(&self, local_id: LocalId) -> bool {
        self.players.read().await.contains_key(&local_id)
    }

    /// A member's limbo status.
    pub async fn limbo_of(&self, local_id: LocalId) -> Option<LimboState> {
        self.players.read().await.get(&local_id).map(|p| p.limbo)
    }

    /// Find the member slot (if any) held by a persistent identity.
    pub async fn find_by_user(&self, user_id: &UserId) -> Option<LocalId> {
        self.players
            .read()
            .await
            .values()
            .find(|p| p.session.user_id.as_ref() == Some(user_id))
            .map(|p| p.session.local_id)
    }

    /// Wire summaries of all members, in local-id order.
    pub async fn summaries(&self) -> Vec<PlayerSummary> {
        self.players
            .read()
            .await
            .values()
            .map(Player::summary)
            .collect()
    }

    /// Lowest-local-id member, the host-migration candidate.
    pub async fn oldest_member(&self) -> Option<LocalId> {
        self.players.read().await.keys().next().copied()
    }

    /// Run `f` with write access to the member table.
    pub async fn with_players<R>(&self, f: impl FnOnce(&mut BTreeMap<LocalId, Player>) -> R) -> R {
        f(&mut *self.players.write().await)
    }

    /// Send to one member, limbo or not.
    pub async fn send_to(&self, local_id: LocalId, msg: ServerMessage) -> bool {
        let link = {
            let players = self.players.read().await;
            match players.get(&local_id) {
                Some(p) => p.session.link.clone(),
                None => return false,
            }
        };
        link.send(msg).await
    }

    /// Broadcast to all active (non-limbo) members.
    pub async fn broadcast(&self, msg: ServerMessage) {
        self.broadcast_filtered(msg, |_| true).await;
    }

    /// Broadcast to all active members except one.
    pub async fn broadcast_except(&self, except: LocalId, msg: ServerMessage) {
        self.broadcast_filtered(msg, move |id| id != except).await;
    }

    async fn broadcast_filtered(&self, msg: ServerMessage, keep: impl Fn(LocalId) -> bool) {
        let links: Vec<_> = {
            let players = self.players.read().await;
            players
                .values()
                .filter(|p| p.limbo == LimboState::NotLimbo && keep(p.session.local_id))
                .map(|p| p.session.link.clone())
                .collect()
        };
        for link in links {
            link.send(msg.clone()).await;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::net::protocol::MAX_SUPPORTED_VERSION;
    use crate::net::transport::{ClientLink, Outbound};
    use std::net::SocketAddr;
    use tokio::sync::mpsc;

    pub(crate) fn test_session(
        local_id: u32,
        user: Option<&str>,
        port: u16,
    ) -> (Arc<Session>, mpsc::Receiver<Outbound>) {
        let addr: SocketAddr = format!("1.2.3.4:{port}").parse().unwrap();
        let (link, rx) = ClientLink::channel(addr, 16);
        let session = Arc::new(Session {
            local_id: LocalId(local_id),
            user_id: user.map(|u| UserId(u.to_owned())),
            friend_code: None,
            name: format!("player-{local_id}"),
            address: addr.ip(),
            version: MAX_SUPPORTED_VERSION,
            link,
        });
        (session, rx)
    }

    #[tokio::test]
    async fn test_new_game_is_empty_and_not_started() {
        let game = Game::new(GameId(1), GameConfig::default());
        assert_eq!(game.state().await, GameState::NotStarted);
        assert_eq!(game.player_count().await, 0);
        assert!(game.host().await.is_none());
    }

    #[tokio::test]
    async fn test_broadcast_skips_limbo_members() {
        let game = Game::new(GameId(1), GameConfig::default());
        let (active, mut active_rx) = test_session(1, None, 5001);
        let (limbo, mut limbo_rx) = test_session(2, None, 5002);

        game.with_players(|players| {
            players.insert(LocalId(1), Player::new(active, LimboState::NotLimbo));
            players.insert(LocalId(2), Player::new(limbo, LimboState::PreSpawn));
        })
        .await;

        game.broadcast(ServerMessage::GameStarted { game: GameId(1) })
            .await;

        assert!(matches!(
            active_rx.try_recv(),
            Ok(Outbound::Message(ServerMessage::GameStarted { .. }))
        ));
        assert!(limbo_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_find_by_user_matches_persistent_identity() {
        let game = Game::new(GameId(1), GameConfig::default());
        let (s, _rx) = test_session(7, Some("u7"), 5007);
        game.with_players(|players| {
            players.insert(LocalId(7), Player::new(s, LimboState::NotLimbo));
        })
        .await;

        assert_eq!(
            game.find_by_user(&UserId("u7".into())).await,
            Some(LocalId(7))
        );
        assert!(game.find_by_user(&UserId("u8".into())).await.is_none());
    }

    #[tokio::test]
    async fn test_oldest_member_is_lowest_local_id() {
        let game = Game::new(GameId(1), GameConfig::default());
        for id in [9u32, 3, 6] {
            let (s, _rx) = test_session(id, None, 5000 + id as u16);
            game.with_players(|players| {
                players.insert(LocalId(id), Player::new(s, LimboState::NotLimbo));
            })
            .await;
        }
        assert_eq!(game.oldest_member().await, Some(LocalId(3)));
    }
}
