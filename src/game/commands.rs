//! Game Commands
//!
//! Host-gated lifecycle commands plus the shared removal path. Removal owns
//! host migration and empty-game teardown; the kick and watchdog paths both
//! funnel into it so the bookkeeping lives in one place.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::bans::AddressBanList;
use crate::events::{EventDispatcher, LifecycleEvent};
use crate::game::state::{Game, GameState, HostInfo};
use crate::net::protocol::{LocalId, ServerMessage};

/// Why a command was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// The actor is not the host.
    #[error("only the host may do that")]
    NotHost,

    /// The target is not a member of the game.
    #[error("no such player")]
    UnknownPlayer,

    /// The game is in the wrong lifecycle state for the command.
    #[error("invalid game state")]
    InvalidState,
}

async fn require_host(game: &Game, actor: LocalId) -> Result<(), CommandError> {
    match game.host().await {
        Some(h) if h.local_id == actor => Ok(()),
        _ => Err(CommandError::NotHost),
    }
}

/// Host requests game start.
pub async fn start_game(
    game: &Arc<Game>,
    events: &EventDispatcher,
    actor: LocalId,
) -> Result<(), CommandError> {
    require_host(game, actor).await?;
    if game.state().await != GameState::NotStarted {
        return Err(CommandError::InvalidState);
    }

    game.set_state(GameState::Starting).await;
    game.set_state(GameState::Started).await;
    game.broadcast(ServerMessage::GameStarted { game: game.id })
        .await;
    info!(game = %game.id, "game started");
    events.emit(LifecycleEvent::GameStarted { game: game.id });
    Ok(())
}

/// Host requests game end. Members stay registered so they can rejoin for
/// another round.
pub async fn end_game(
    game: &Arc<Game>,
    events: &EventDispatcher,
    actor: LocalId,
) -> Result<(), CommandError> {
    require_host(game, actor).await?;
    match game.state().await {
        GameState::Starting | GameState::Started => {}
        _ => return Err(CommandError::InvalidState),
    }

    game.set_state(GameState::Ended).await;
    game.broadcast(ServerMessage::GameEnded { game: game.id })
        .await;
    info!(game = %game.id, "game ended");
    events.emit(LifecycleEvent::GameEnded { game: game.id });
    Ok(())
}

/// Host alters public listing.
pub async fn alter_privacy(
    game: &Arc<Game>,
    events: &EventDispatcher,
    actor: LocalId,
    public: bool,
) -> Result<(), CommandError> {
    require_host(game, actor).await?;
    game.set_public(public).await;
    game.broadcast(ServerMessage::PrivacyChanged {
        game: game.id,
        public,
    })
    .await;
    debug!(game = %game.id, public, "privacy altered");
    events.emit(LifecycleEvent::OptionsChanged {
        game: game.id,
        public,
    });
    Ok(())
}

/// The client confirmed character spawn: cancel the watchdog.
pub async fn character_spawned(game: &Arc<Game>, local_id: LocalId) -> Result<(), CommandError> {
    game.with_players(|players| {
        let player = players.get_mut(&local_id).ok_or(CommandError::UnknownPlayer)?;
        player.watchdog.cancel();
        Ok(())
    })
    .await
}

/// Host kicks another member, optionally recording an address ban.
pub async fn kick_player(
    game: &Arc<Game>,
    events: &EventDispatcher,
    address_bans: &AddressBanList,
    actor: LocalId,
    target: LocalId,
    ban: bool,
) -> Result<(), CommandError> {
    require_host(game, actor).await?;
    if target == actor {
        return Err(CommandError::UnknownPlayer);
    }

    let _guard = game.lock_membership().await;
    let address = game
        .with_players(|players| players.get(&target).map(|p| p.session.address))
        .await
        .ok_or(CommandError::UnknownPlayer)?;

    if ban {
        address_bans.ban(address);
    }

    // Announced before removal so the target hears why they are leaving.
    game.broadcast(ServerMessage::PlayerKicked {
        game: game.id,
        local_id: target,
        banned: ban,
    })
    .await;
    info!(game = %game.id, %target, banned = ban, "player kicked");
    events.emit(LifecycleEvent::PlayerKicked {
        game: game.id,
        local_id: target,
        banned: ban,
    });

    remove_inner(game, events, target).await;
    Ok(())
}

/// A member leaves, or the server removes them.
pub async fn remove_player(
    game: &Arc<Game>,
    events: &EventDispatcher,
    local_id: LocalId,
) -> Result<(), CommandError> {
    let _guard = game.lock_membership().await;
    if !game.contains(local_id).await {
        return Err(CommandError::UnknownPlayer);
    }
    remove_inner(game, events, local_id).await;
    Ok(())
}

/// Watchdog expiry: the client never confirmed a spawn, remove it. The task
/// only runs if nothing cancelled the watchdog first.
pub async fn abandon_unspawned(game: &Arc<Game>, events: &EventDispatcher, local_id: LocalId) {
    let _guard = game.lock_membership().await;
    remove_inner(game, events, local_id).await;
}

/// Shared removal path. Caller holds the membership lock.
async fn remove_inner(game: &Arc<Game>, events: &EventDispatcher, local_id: LocalId) {
    let removed = game
        .with_players(|players| players.remove(&local_id))
        .await;
    let Some(removed) = removed else { return };
    removed.watchdog.cancel();

    game.broadcast(ServerMessage::PlayerLeft {
        game: game.id,
        local_id,
    })
    .await;
    debug!(game = %game.id, %local_id, "player removed");
    events.emit(LifecycleEvent::PlayerLeft {
        game: game.id,
        local_id,
    });

    if game.player_count().await == 0 {
        game.set_state(GameState::Destroyed).await;
        info!(game = %game.id, "game empty, destroyed");
        events.emit(LifecycleEvent::GameDestroyed { game: game.id });
        return;
    }

    // Host migration: the lowest local id inherits. An ended game keeps its
    // old host record so the returning host is still recognized.
    let host_left = matches!(game.host().await, Some(h) if h.local_id == local_id);
    if host_left && game.state().await != GameState::Ended {
        if let Some(next) = game.oldest_member().await {
            let user_id = game
                .with_players(|players| {
                    players.get(&next).and_then(|p| p.session.user_id.clone())
                })
                .await;
            game.set_host(Some(HostInfo {
                local_id: next,
                user_id,
            }))
            .await;
            warn!(game = %game.id, new_host = %next, "host migrated");
            game.broadcast(ServerMessage::HostRejoined {
                game: game.id,
                host: next,
            })
            .await;
        }
    }
}
