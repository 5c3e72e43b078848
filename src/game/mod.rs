//! Game Layer
//!
//! Game instances and everything that mutates them.
//!
//! ## Module Structure
//!
//! - `state`: Game lifecycle, members, limbo, broadcast plumbing
//! - `join`: The admission state machine, including ended-game rejoin
//! - `commands`: Host commands and the shared removal path
//! - `watchdog`: Spawn-confirmation timers
//! - `manager`: The table of live games

pub mod commands;
pub mod join;
pub mod manager;
pub mod state;
pub mod watchdog;

// Re-export key types
pub use commands::CommandError;
pub use join::{add_client, JoinDeps, JoinError, JOIN_LOCK_WAIT};
pub use manager::GameManager;
pub use state::{Game, GameConfig, GameState, HostInfo, LimboState, Player};
pub use watchdog::{SpawnWatchdog, SPAWN_TIMEOUT};
