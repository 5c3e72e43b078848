//! Join State Machine
//!
//! Admission of a session into a game: ban checks, version cross-check,
//! lifecycle gating, capacity, external veto, and the ended-game rejoin
//! flow with host recognition. The whole machine runs under the game's
//! membership lock so checks and insertion are atomic.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::bans::{AddressBanList, BanCheck};
use crate::events::{EventDispatcher, LifecycleEvent, PreJoinContext};
use crate::game::commands::abandon_unspawned;
use crate::game::state::{Game, GameState, HostInfo, LimboState, Player};
use crate::net::protocol::{DisconnectReason, ServerMessage};
use crate::session::Session;

/// How long a join attempt waits for the membership lock before giving up.
pub const JOIN_LOCK_WAIT: Duration = Duration::from_secs(60);

/// Why a join was refused. The connection survives; the client gets a
/// [`ServerMessage::JoinDenied`] and may try another game.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JoinError {
    /// The joiner is banned from this game.
    #[error("banned")]
    Banned,

    /// The game is at capacity.
    #[error("game full")]
    GameFull,

    /// The game already started.
    #[error("game already started")]
    AlreadyStarted,

    /// The game was destroyed.
    #[error("game destroyed")]
    GameDestroyed,

    /// The joiner is in an unusable state: already an active member, or the
    /// membership lock could not be acquired in time.
    #[error("invalid client state")]
    InvalidClient,

    /// Protocol version differs from the host's.
    #[error("protocol version mismatch")]
    VersionMismatch {
        /// Whether the joiner is newer than the host.
        client_newer: bool,
    },

    /// An external collaborator vetoed the join.
    #[error("join vetoed")]
    Denied(DisconnectReason),
}

impl JoinError {
    /// The client-displayable denial reason.
    pub fn reason(&self) -> DisconnectReason {
        match self {
            Self::Banned => DisconnectReason::Banned,
            Self::GameFull => DisconnectReason::GameFull,
            Self::AlreadyStarted => DisconnectReason::AlreadyStarted,
            Self::GameDestroyed => DisconnectReason::GameDestroyed,
            Self::InvalidClient => DisconnectReason::Error,
            Self::VersionMismatch { client_newer: true } => DisconnectReason::TooNewClient,
            Self::VersionMismatch { client_newer: false } => DisconnectReason::OutdatedClient,
            Self::Denied(reason) => reason.clone(),
        }
    }
}

/// Shared collaborators the join path needs.
#[derive(Clone)]
pub struct JoinDeps {
    /// The persisted ban-service predicate.
    pub bans: Arc<dyn BanCheck>,
    /// The in-memory kick-ban address list.
    pub address_bans: Arc<AddressBanList>,
    /// Lifecycle events and pre-join hooks.
    pub events: Arc<EventDispatcher>,
    /// Membership-lock acquisition bound.
    pub lock_wait: Duration,
    /// Spawn-confirmation window for fresh joiners.
    pub spawn_timeout: Duration,
}

/// Admit a session into a game, or refuse with a reason.
pub async fn add_client(
    game: &Arc<Game>,
    session: Arc<Session>,
    deps: &JoinDeps,
) -> Result<(), JoinError> {
    let _guard = match timeout(deps.lock_wait, game.lock_membership()).await {
        Ok(guard) => guard,
        Err(_) => {
            warn!(game = %game.id, joiner = %session.local_id, "membership lock wait expired");
            return Err(JoinError::InvalidClient);
        }
    };

    check_bans(game, &session, deps)?;
    let state = gate_state(game, &session).await?;

    let ctx = PreJoinContext {
        game: game.id,
        local_id: session.local_id,
        user_id: session.user_id.clone(),
        friend_code: session.friend_code.clone(),
        address: session.address,
    };
    if let Some(denial) = deps.events.pre_join(&ctx) {
        debug!(game = %game.id, joiner = %session.local_id, "join vetoed by hook");
        return Err(JoinError::Denied(denial.reason));
    }

    match state {
        GameState::Ended => rejoin(game, session, deps).await,
        _ => fresh_join(game, session, deps).await,
    }
}

/// Ban surfaces, consulted before anything else.
fn check_bans(game: &Game, session: &Session, deps: &JoinDeps) -> Result<(), JoinError> {
    if deps
        .bans
        .is_banned(session.friend_code.as_deref(), session.address)
        || deps.address_bans.contains(session.address)
    {
        info!(game = %game.id, joiner = %session.local_id, "banned joiner refused");
        return Err(JoinError::Banned);
    }
    Ok(())
}

/// Version, lifecycle, capacity, and re-entrancy gating, in that order.
/// Returns the observed state so the caller can pick the admission path.
async fn gate_state(game: &Game, session: &Session) -> Result<GameState, JoinError> {
    if !game.config.allow_version_mixing {
        if let Some(host) = game.host().await {
            if let Some(host_version) = member_version(game, host.local_id).await {
                if host_version != session.version {
                    return Err(JoinError::VersionMismatch {
                        client_newer: session.version > host_version,
                    });
                }
            }
        }
    }

    let state = game.state().await;
    match state {
        GameState::Starting | GameState::Started => return Err(JoinError::AlreadyStarted),
        GameState::Destroyed => return Err(JoinError::GameDestroyed),
        GameState::NotStarted | GameState::Ended => {}
    }

    let holds_slot = slot_for(game, session).await.is_some();
    if !holds_slot && game.player_count().await >= game.config.max_players {
        return Err(JoinError::GameFull);
    }

    // An active member asking to join again is confused, not rejoining.
    if game.limbo_of(session.local_id).await == Some(LimboState::NotLimbo) {
        return Err(JoinError::InvalidClient);
    }

    Ok(state)
}

async fn member_version(game: &Game, local_id: crate::net::protocol::LocalId) -> Option<u32> {
    game.with_players(|players| players.get(&local_id).map(|p| p.session.version))
        .await
}

/// The slot already held by this session's persistent identity, if any.
async fn slot_for(game: &Game, session: &Session) -> Option<crate::net::protocol::LocalId> {
    let user_id = session.user_id.as_ref()?;
    game.find_by_user(user_id).await
}

/// Admission into a game that has not yet started.
async fn fresh_join(
    game: &Arc<Game>,
    session: Arc<Session>,
    deps: &JoinDeps,
) -> Result<(), JoinError> {
    let local_id = session.local_id;

    if game.host().await.is_none() {
        game.set_host(Some(HostInfo {
            local_id,
            user_id: session.user_id.clone(),
        }))
        .await;
    }

    let player = Player::new(session.clone(), LimboState::PreSpawn);
    let summary = player.summary();
    arm_spawn_watchdog(game, deps, &player);
    game.with_players(|players| {
        players.insert(local_id, player);
    })
    .await;

    // Announced while the joiner is still in limbo, so the broadcast reaches
    // existing members only. The watchdog keeps the promotion honest: a
    // client that never spawns a character is removed when it fires.
    game.broadcast(ServerMessage::PlayerJoined {
        game: game.id,
        player: summary,
    })
    .await;
    game.with_players(|players| {
        if let Some(player) = players.get_mut(&local_id) {
            player.limbo = LimboState::NotLimbo;
        }
    })
    .await;

    let host = game.host().await.map(|h| h.local_id);
    session
        .link
        .send(ServerMessage::JoinedGame {
            game: game.id,
            local_id,
            host,
            players: game.summaries().await,
        })
        .await;
    session
        .link
        .send(ServerMessage::PrivacyChanged {
            game: game.id,
            public: game.is_public().await,
        })
        .await;

    info!(game = %game.id, joiner = %local_id, "player joined");
    deps.events.emit(LifecycleEvent::PlayerJoined {
        game: game.id,
        local_id,
    });
    Ok(())
}

/// Rejoin of an ended game. The recognized host resets the game for another
/// round; everyone else waits in limbo until the host returns.
async fn rejoin(game: &Arc<Game>, session: Arc<Session>, deps: &JoinDeps) -> Result<(), JoinError> {
    let local_id = session.local_id;
    let host = game.host().await;
    let is_host = match (&host, &session.user_id) {
        (Some(h), Some(user_id)) => h.user_id.as_ref() == Some(user_id),
        _ => false,
    };

    // A returning identity reclaims its old slot under its new local id.
    if let Some(stale) = slot_for(game, &session).await {
        if stale != local_id {
            game.with_players(|players| {
                if let Some(old) = players.remove(&stale) {
                    old.watchdog.cancel();
                }
            })
            .await;
        }
    }

    if is_host {
        game.with_players(|players| {
            players.insert(local_id, Player::new(session.clone(), LimboState::NotLimbo));
            for player in players.values_mut() {
                if player.limbo == LimboState::WaitingForHost {
                    player.limbo = LimboState::NotLimbo;
                }
            }
        })
        .await;
        game.set_host(Some(HostInfo {
            local_id,
            user_id: session.user_id.clone(),
        }))
        .await;
        game.set_state(GameState::NotStarted).await;

        session
            .link
            .send(ServerMessage::JoinedGame {
                game: game.id,
                local_id,
                host: Some(local_id),
                players: game.summaries().await,
            })
            .await;
        game.broadcast_except(
            local_id,
            ServerMessage::HostRejoined {
                game: game.id,
                host: local_id,
            },
        )
        .await;

        info!(game = %game.id, host = %local_id, "host rejoined, game reset");
    } else {
        game.with_players(|players| {
            players.insert(
                local_id,
                Player::new(session.clone(), LimboState::WaitingForHost),
            );
        })
        .await;
        session
            .link
            .send(ServerMessage::WaitForHost { game: game.id })
            .await;
        info!(game = %game.id, joiner = %local_id, "rejoiner parked until host returns");
    }

    deps.events.emit(LifecycleEvent::PlayerJoined {
        game: game.id,
        local_id,
    });
    Ok(())
}

/// Arm the timer that abandons a joiner whose client never confirms spawn.
fn arm_spawn_watchdog(game: &Arc<Game>, deps: &JoinDeps, player: &Player) {
    let game = game.clone();
    let events = deps.events.clone();
    let local_id = player.session.local_id;
    player.watchdog.arm(deps.spawn_timeout, async move {
        warn!(game = %game.id, player = %local_id, "spawn never confirmed, removing");
        abandon_unspawned(&game, &events, local_id).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bans::{MemoryBanList, NoBans};
    use crate::events::JoinDenial;
    use crate::game::state::tests::test_session;
    use crate::game::state::GameConfig;
    use crate::net::protocol::GameId;
    use crate::net::transport::Outbound;
    use tokio::sync::mpsc;

    fn deps() -> JoinDeps {
        JoinDeps {
            bans: Arc::new(NoBans),
            address_bans: Arc::new(AddressBanList::new()),
            events: Arc::new(EventDispatcher::new()),
            lock_wait: Duration::from_secs(1),
            spawn_timeout: Duration::from_secs(60),
        }
    }

    fn game() -> Arc<Game> {
        Arc::new(Game::new(GameId(1), GameConfig::default()))
    }

    async fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(Outbound::Message(msg)) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    async fn confirm_spawn(game: &Arc<Game>, local_id: u32) {
        game.with_players(|players| {
            let p = players
                .get_mut(&crate::net::protocol::LocalId(local_id))
                .unwrap();
            p.watchdog.cancel();
        })
        .await;
    }

    #[tokio::test]
    async fn test_first_joiner_becomes_host() {
        let game = game();
        let deps = deps();
        let (session, mut rx) = test_session(1, Some("u1"), 5001);

        add_client(&game, session, &deps).await.unwrap();

        let host = game.host().await.unwrap();
        assert_eq!(host.local_id, crate::net::protocol::LocalId(1));
        assert_eq!(game.limbo_of(host.local_id).await, Some(LimboState::NotLimbo));

        let msgs = drain(&mut rx).await;
        assert!(matches!(msgs[0], ServerMessage::JoinedGame { host: Some(h), .. } if h == host.local_id));
        assert!(matches!(msgs[1], ServerMessage::PrivacyChanged { .. }));
    }

    #[tokio::test]
    async fn test_members_hear_player_joined() {
        let game = game();
        let deps = deps();
        let (a, mut rx_a) = test_session(1, None, 5001);
        add_client(&game, a, &deps).await.unwrap();
        confirm_spawn(&game, 1).await;
        drain(&mut rx_a).await;

        let (b, _rx_b) = test_session(2, None, 5002);
        add_client(&game, b, &deps).await.unwrap();

        let msgs = drain(&mut rx_a).await;
        assert!(msgs.iter().any(|m| matches!(
            m,
            ServerMessage::PlayerJoined { player, .. }
                if player.local_id == crate::net::protocol::LocalId(2)
        )));
    }

    #[tokio::test]
    async fn test_full_game_refuses_new_joiner() {
        let game = Arc::new(Game::new(
            GameId(1),
            GameConfig {
                max_players: 1,
                ..Default::default()
            },
        ));
        let deps = deps();
        let (a, _rx) = test_session(1, None, 5001);
        add_client(&game, a, &deps).await.unwrap();

        let (b, _rx) = test_session(2, None, 5002);
        let err = add_client(&game, b, &deps).await.unwrap_err();
        assert_eq!(err, JoinError::GameFull);
        assert_eq!(err.reason(), DisconnectReason::GameFull);
    }

    #[tokio::test]
    async fn test_started_game_refuses_joiner() {
        let game = game();
        let deps = deps();
        game.set_state(GameState::Started).await;

        let (s, _rx) = test_session(1, None, 5001);
        let err = add_client(&game, s, &deps).await.unwrap_err();
        assert_eq!(err, JoinError::AlreadyStarted);
    }

    #[tokio::test]
    async fn test_destroyed_game_refuses_joiner() {
        let game = game();
        let deps = deps();
        game.set_state(GameState::Destroyed).await;

        let (s, _rx) = test_session(1, None, 5001);
        let err = add_client(&game, s, &deps).await.unwrap_err();
        assert_eq!(err, JoinError::GameDestroyed);
    }

    #[tokio::test]
    async fn test_banned_address_refused_before_state_checks() {
        let game = game();
        let mut deps = deps();
        let bans = MemoryBanList::new();
        bans.ban_address("1.2.3.4".parse().unwrap());
        deps.bans = Arc::new(bans);

        // Even a destroyed game reports the ban first.
        game.set_state(GameState::Destroyed).await;
        let (s, _rx) = test_session(1, None, 5001);
        let err = add_client(&game, s, &deps).await.unwrap_err();
        assert_eq!(err, JoinError::Banned);
    }

    #[tokio::test]
    async fn test_kick_ban_list_blocks_rejoin() {
        let game = game();
        let deps = deps();
        deps.address_bans.ban("1.2.3.4".parse().unwrap());

        let (s, _rx) = test_session(1, None, 5001);
        let err = add_client(&game, s, &deps).await.unwrap_err();
        assert_eq!(err, JoinError::Banned);
    }

    #[tokio::test]
    async fn test_version_mismatch_against_host() {
        let game = game();
        let deps = deps();
        let (host, _rx) = test_session(1, None, 5001);
        add_client(&game, host, &deps).await.unwrap();

        let (mut newer, _rx2) = test_session(2, None, 5002);
        {
            let s = Arc::get_mut(&mut newer).unwrap();
            s.version += 1;
        }
        let err = add_client(&game, newer, &deps).await.unwrap_err();
        assert_eq!(err, JoinError::VersionMismatch { client_newer: true });
        assert_eq!(err.reason(), DisconnectReason::TooNewClient);
    }

    #[tokio::test]
    async fn test_version_mismatch_outranks_started_state() {
        let game = game();
        let deps = deps();
        let (host, _rx) = test_session(1, None, 5001);
        add_client(&game, host, &deps).await.unwrap();
        confirm_spawn(&game, 1).await;
        game.set_state(GameState::Started).await;

        let (mut newer, _rx2) = test_session(2, None, 5002);
        {
            let s = Arc::get_mut(&mut newer).unwrap();
            s.version += 1;
        }
        let err = add_client(&game, newer, &deps).await.unwrap_err();
        assert_eq!(err, JoinError::VersionMismatch { client_newer: true });
    }

    #[tokio::test]
    async fn test_concurrent_joins_admit_exactly_one_into_last_seat() {
        let game = Arc::new(Game::new(
            GameId(1),
            GameConfig {
                max_players: 1,
                ..Default::default()
            },
        ));
        let deps = deps();

        let tasks: Vec<_> = (1..=8u32)
            .map(|id| {
                let game = game.clone();
                let deps = deps.clone();
                let (session, rx) = test_session(id, None, 5000 + id as u16);
                tokio::spawn(async move {
                    let _rx = rx;
                    add_client(&game, session, &deps).await
                })
            })
            .collect();

        let mut wins = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(()) => wins += 1,
                Err(err) => assert_eq!(err, JoinError::GameFull),
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(game.player_count().await, 1);
    }

    #[tokio::test]
    async fn test_version_mixing_config_admits_mismatch() {
        let game = Arc::new(Game::new(
            GameId(1),
            GameConfig {
                allow_version_mixing: true,
                ..Default::default()
            },
        ));
        let deps = deps();
        let (host, _rx) = test_session(1, None, 5001);
        add_client(&game, host, &deps).await.unwrap();

        let (mut newer, _rx2) = test_session(2, None, 5002);
        {
            let s = Arc::get_mut(&mut newer).unwrap();
            s.version += 1;
        }
        add_client(&game, newer, &deps).await.unwrap();
    }

    #[tokio::test]
    async fn test_active_member_rejoining_is_invalid() {
        let game = game();
        let deps = deps();
        let (s, _rx) = test_session(1, None, 5001);
        add_client(&game, s.clone(), &deps).await.unwrap();
        confirm_spawn(&game, 1).await;

        let err = add_client(&game, s, &deps).await.unwrap_err();
        assert_eq!(err, JoinError::InvalidClient);
    }

    #[tokio::test]
    async fn test_pre_join_hook_vetoes() {
        let game = game();
        let deps = deps();
        deps.events.register_pre_join_hook(|_| {
            Some(JoinDenial {
                reason: DisconnectReason::Banned,
            })
        });

        let (s, _rx) = test_session(1, None, 5001);
        let err = add_client(&game, s, &deps).await.unwrap_err();
        assert_eq!(err, JoinError::Denied(DisconnectReason::Banned));
    }

    #[tokio::test]
    async fn test_nonhost_rejoin_of_ended_game_waits_for_host() {
        let game = game();
        let deps = deps();
        let (host, _hrx) = test_session(1, Some("host"), 5001);
        add_client(&game, host, &deps).await.unwrap();
        confirm_spawn(&game, 1).await;
        game.set_state(GameState::Ended).await;

        let (other, mut rx) = test_session(2, Some("other"), 5002);
        add_client(&game, other, &deps).await.unwrap();

        assert_eq!(
            game.limbo_of(crate::net::protocol::LocalId(2)).await,
            Some(LimboState::WaitingForHost)
        );
        let msgs = drain(&mut rx).await;
        assert!(matches!(msgs[0], ServerMessage::WaitForHost { .. }));
    }

    #[tokio::test]
    async fn test_host_rejoin_resets_game_and_promotes_waiters() {
        let game = game();
        let deps = deps();
        let (host, _hrx) = test_session(1, Some("host"), 5001);
        add_client(&game, host, &deps).await.unwrap();
        confirm_spawn(&game, 1).await;
        game.set_state(GameState::Ended).await;

        // Host drops; a non-host rejoins and waits.
        game.with_players(|players| {
            players.remove(&crate::net::protocol::LocalId(1));
        })
        .await;
        let (waiter, mut waiter_rx) = test_session(2, Some("other"), 5002);
        add_client(&game, waiter, &deps).await.unwrap();
        drain(&mut waiter_rx).await;

        // Host returns under a new local id.
        let (host_again, mut host_rx) = test_session(3, Some("host"), 5003);
        add_client(&game, host_again, &deps).await.unwrap();

        assert_eq!(game.state().await, GameState::NotStarted);
        let host = game.host().await.unwrap();
        assert_eq!(host.local_id, crate::net::protocol::LocalId(3));
        assert_eq!(
            game.limbo_of(crate::net::protocol::LocalId(2)).await,
            Some(LimboState::NotLimbo)
        );

        let host_msgs = drain(&mut host_rx).await;
        assert!(matches!(host_msgs[0], ServerMessage::JoinedGame { .. }));
        let waiter_msgs = drain(&mut waiter_rx).await;
        assert!(waiter_msgs
            .iter()
            .any(|m| matches!(m, ServerMessage::HostRejoined { .. })));
    }

    #[tokio::test]
    async fn test_rejoining_identity_reclaims_slot_under_new_id() {
        let game = game();
        let deps = deps();
        let (host, _hrx) = test_session(1, Some("host"), 5001);
        add_client(&game, host, &deps).await.unwrap();
        confirm_spawn(&game, 1).await;
        let (member, _mrx) = test_session(2, Some("other"), 5002);
        add_client(&game, member, &deps).await.unwrap();
        confirm_spawn(&game, 2).await;
        game.set_state(GameState::Ended).await;

        // Same identity, fresh connection and local id.
        let (again, _rx) = test_session(9, Some("other"), 5009);
        add_client(&game, again, &deps).await.unwrap();

        assert!(!game.contains(crate::net::protocol::LocalId(2)).await);
        assert!(game.contains(crate::net::protocol::LocalId(9)).await);
        assert_eq!(game.player_count().await, 2);
    }
}
