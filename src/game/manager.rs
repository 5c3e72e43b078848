//! Game Manager
//!
//! Owns the table of live games: creation with random non-zero ids, lookup,
//! and reaping of destroyed instances.

use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::events::{EventDispatcher, LifecycleEvent};
use crate::game::state::{Game, GameConfig, GameState};
use crate::net::protocol::GameId;

/// The table of live games.
pub struct GameManager {
    games: RwLock<BTreeMap<GameId, Arc<Game>>>,
    events: Arc<EventDispatcher>,
}

impl GameManager {
    /// Create an empty manager.
    pub fn new(events: Arc<EventDispatcher>) -> Self {
        Self {
            games: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    /// Create a new game with a fresh random id.
    pub async fn create_game(&self, config: GameConfig) -> Arc<Game> {
        let mut games = self.games.write().await;
        let id = loop {
            let candidate = GameId(rand::thread_rng().gen_range(1..=u32::MAX));
            if !games.contains_key(&candidate) {
                break candidate;
            }
        };

        let game = Arc::new(Game::new(id, config));
        games.insert(id, game.clone());
        info!(game = %id, "game created");
        self.events.emit(LifecycleEvent::GameCreated { game: id });
        game
    }

    /// Look up a live game.
    pub async fn get(&self, id: GameId) -> Option<Arc<Game>> {
        self.games.read().await.get(&id).cloned()
    }

    /// Remove a game regardless of state.
    pub async fn remove(&self, id: GameId) -> Option<Arc<Game>> {
        let removed = self.games.write().await.remove(&id);
        if removed.is_some() {
            debug!(game = %id, "game removed");
        }
        removed
    }

    /// Ids of publicly listed joinable games.
    pub async fn public_games(&self) -> Vec<GameId> {
        let games: Vec<Arc<Game>> = self.games.read().await.values().cloned().collect();
        let mut out = Vec::new();
        for game in games {
            if game.is_public().await && game.state().await == GameState::NotStarted {
                out.push(game.id);
            }
        }
        out
    }

    /// Reap destroyed games. Returns how many were removed.
    pub async fn cleanup(&self) -> usize {
        let candidates: Vec<Arc<Game>> = self.games.read().await.values().cloned().collect();
        let mut dead = Vec::new();
        for game in candidates {
            if game.state().await == GameState::Destroyed {
                dead.push(game.id);
            }
        }

        let mut games = self.games.write().await;
        let mut removed = 0;
        for id in dead {
            if games.remove(&id).is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "reaped destroyed games");
        }
        removed
    }

    /// Number of live games.
    pub async fn count(&self) -> usize {
        self.games.read().await.len()
    }
}
