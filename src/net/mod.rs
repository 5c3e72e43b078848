//! Network Layer
//!
//! Wire messages, the transport abstraction, and the game-channel accept
//! loop. The pre-auth channel's listener lives in `auth::preauth` next to
//! the cache it feeds.

pub mod protocol;
pub mod server;
pub mod transport;

pub use protocol::{
    ClientMessage, DisconnectReason, GameId, Handshake, LocalId, PlayerSummary,
    PreAuthRequest, PreAuthResponse, ProtocolVersion, ServerMessage, UserId, VersionCheck,
    MAX_SUPPORTED_VERSION, MIN_SUPPORTED_VERSION,
};
pub use server::{GameServer, GameServerError, ServerConfig};
pub use transport::{ClientLink, Outbound};
