//! # Meridian Session Server
//!
//! Multiplayer game session server: identity correlation between a secured
//! pre-authentication channel and the game-data channel, per-user session
//! exclusivity, the registration cascade, and the game join state machine.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    MERIDIAN SERVER                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  auth/           - Identity correlation                      │
//! │  ├── cache.rs    - TTL'd identity cache, four lookup keys    │
//! │  ├── exclusive.rs- One live session per persistent user      │
//! │  ├── preauth.rs  - Pre-auth listener, nonce issuance         │
//! │  └── token.rs    - Provider JWT intake                       │
//! │                                                              │
//! │  session/        - Registration                              │
//! │  ├── resolve.rs  - Identity resolution cascade               │
//! │  └── registry.rs - Registration cascade, online sessions     │
//! │                                                              │
//! │  game/           - Games and membership                      │
//! │  ├── state.rs    - Lifecycle, members, limbo, broadcast      │
//! │  ├── join.rs     - Join state machine, rejoin flow           │
//! │  ├── commands.rs - Host commands, removal, migration         │
//! │  ├── watchdog.rs - Spawn-confirmation timers                 │
//! │  └── manager.rs  - Table of live games                       │
//! │                                                              │
//! │  net/            - Wire plumbing                             │
//! │  ├── protocol.rs - Message types                             │
//! │  ├── transport.rs- Per-connection link abstraction           │
//! │  └── server.rs   - WebSocket accept loop                     │
//! │                                                              │
//! │  bans.rs         - Ban surfaces     events.rs - Lifecycle    │
//! │  config.rs       - Process configuration      notifications  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Channel Correlation
//!
//! Clients first present a credential on the pre-auth channel and receive a
//! one-time nonce. On the game channel they hand the nonce back inside the
//! handshake; the correlation cache ties the two connections to one identity.
//! Clients that skip pre-auth fall through a cascade of weaker strategies
//! down to a deterministic unauthenticated fallback, so registration never
//! fails for lack of identity.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod auth;
pub mod bans;
pub mod config;
pub mod events;
pub mod game;
pub mod net;
pub mod session;

// Re-export commonly used types
pub use auth::{ExclusivityMap, IdentityCache, PreAuthListener};
pub use config::Config;
pub use events::{EventDispatcher, LifecycleEvent};
pub use game::{Game, GameManager, JoinDeps};
pub use net::{ClientMessage, GameId, GameServer, LocalId, ServerMessage, UserId};
pub use session::{Session, SessionRegistry};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
