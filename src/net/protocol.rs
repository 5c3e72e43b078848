//! Protocol Messages
//!
//! Wire format for client-server communication on both channels.
//! All messages are serialized as JSON for debugging ease,
//! with optional binary (bincode) for production.
//!
//! The byte-level framing, reliability and encryption of the underlying
//! transport are out of scope; this module only defines the structured
//! messages the core exchanges once the transport has delivered them.

use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Local session id: a small monotonic integer assigned at registration.
///
/// Never reused while the session is online; wraps past overflow back to 1.
/// Zero is reserved as "no session".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LocalId(pub u32);

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Persistent user id issued by the external identity provider.
///
/// Long-lived and independent of any particular connection or address.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Game (lobby) identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct GameId(pub u32);

impl fmt::Display for GameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "G{:08X}", self.0)
    }
}

// =============================================================================
// PROTOCOL VERSIONS
// =============================================================================

/// Declared client protocol version.
pub type ProtocolVersion = u32;

/// Oldest protocol version this server still accepts.
pub const MIN_SUPPORTED_VERSION: ProtocolVersion = 4;

/// Newest protocol version this server knows about.
pub const MAX_SUPPORTED_VERSION: ProtocolVersion = 6;

/// Outcome of comparing a declared version against the supported range.
///
/// Classification lives in the session registry, where the range is
/// operator-configurable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionCheck {
    /// Version is inside the supported range.
    Compatible,
    /// Client is older than the oldest supported version.
    ClientTooOld,
    /// Client is newer than the newest supported version.
    ClientTooNew,
    /// Version is zero or otherwise unrecognizable.
    Unknown,
}

// =============================================================================
// DISCONNECT REASONS
// =============================================================================

/// The contract of distinct disconnect/denial reasons surfaced to clients.
///
/// Exact wording is a localization concern; the *set* of reasons is part of
/// the protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// Client protocol version is older than supported.
    OutdatedClient,
    /// Client protocol version is newer than supported.
    TooNewClient,
    /// Display name exceeds the length bound.
    UsernameTooLong,
    /// Display name is empty or otherwise unusable.
    IllegalUsername,
    /// Target game no longer exists.
    GameDestroyed,
    /// Target game is at capacity.
    GameFull,
    /// Target game already started.
    AlreadyStarted,
    /// Player is banned from the game.
    Banned,
    /// The persistent identity is already bound to another live session.
    DuplicateIdentity,
    /// Generic error with no more specific cause.
    Error,
    /// Free-form reason (used by the pre-auth channel's generic rejections).
    Custom { message: String },
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutdatedClient => write!(f, "your client is out of date"),
            Self::TooNewClient => write!(f, "your client is newer than this server supports"),
            Self::UsernameTooLong => write!(f, "username is too long"),
            Self::IllegalUsername => write!(f, "username is not allowed"),
            Self::GameDestroyed => write!(f, "the game no longer exists"),
            Self::GameFull => write!(f, "the game is full"),
            Self::AlreadyStarted => write!(f, "the game has already started"),
            Self::Banned => write!(f, "you are banned from this game"),
            Self::DuplicateIdentity => write!(f, "this account is already connected elsewhere"),
            Self::Error => write!(f, "an error occurred"),
            Self::Custom { message } => f.write_str(message),
        }
    }
}

// =============================================================================
// PRE-AUTH CHANNEL MESSAGES
// =============================================================================

// Message enums are externally tagged: bincode cannot decode internally
// tagged enums, and both codecs must share one derive.

/// Request on the secured pre-authentication channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreAuthRequest {
    /// Present an externally-issued credential for nonce issuance.
    Credential {
        /// Opaque auth token previously admitted into the cache.
        token: String,
    },
}

/// Response on the secured pre-authentication channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreAuthResponse {
    /// Credential matched: carry this nonce to the game channel.
    NonceGrant {
        /// Non-zero one-time nonce bound to the matched record.
        nonce: u32,
    },
    /// Credential rejected. Deliberately generic.
    Rejected {
        /// Client-displayable reason.
        reason: DisconnectReason,
    },
}

// =============================================================================
// GAME CHANNEL: CLIENT -> SERVER
// =============================================================================

/// Platform metadata optionally carried in the handshake.
///
/// Required for the future-version escape hatch to apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformInfo {
    /// Platform family ("pc", "mobile", "console").
    pub kind: String,
    /// Client build string.
    pub build: String,
}

/// Handshake payload read before a session is fully established.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handshake {
    /// Declared display name.
    pub name: String,
    /// Declared protocol version.
    pub version: ProtocolVersion,
    /// Opaque token string, or a nonce reference of the form `nonce:<u32>`.
    #[serde(default)]
    pub token: Option<String>,
    /// Self-reported friend code.
    #[serde(default)]
    pub friend_code: Option<String>,
    /// Optional platform metadata.
    #[serde(default)]
    pub platform: Option<PlatformInfo>,
}

/// Messages sent from client to server on the game channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientMessage {
    /// Initial handshake; must be the first message.
    Hello(Handshake),

    /// Create a new game and join it as host.
    HostGame {
        /// Whether the game is publicly listed.
        public: bool,
    },

    /// Join (or rejoin) a game.
    JoinGame {
        /// Target game.
        game: GameId,
    },

    /// Leave the current game.
    LeaveGame,

    /// The client spawned its character (cancels the spawn watchdog).
    CharacterSpawned,

    /// Host requests game start.
    StartGame,

    /// Host requests game end.
    EndGame,

    /// Host alters game privacy.
    AlterPrivacy {
        /// Whether the game is publicly listed.
        public: bool,
    },

    /// Host kicks (optionally bans) another player.
    KickPlayer {
        /// Player to remove.
        target: LocalId,
        /// Whether to also address-ban them.
        ban: bool,
    },

    /// Ping for latency measurement.
    Ping {
        /// Client timestamp echoed back.
        timestamp: u64,
    },
}

// =============================================================================
// GAME CHANNEL: SERVER -> CLIENT
// =============================================================================

/// Summary of one player in a game, for join snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerSummary {
    /// Local session id.
    pub local_id: LocalId,
    /// Display name.
    pub name: String,
    /// Friend code, if known.
    pub friend_code: Option<String>,
}

/// Messages sent from server to client on the game channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerMessage {
    /// Registration succeeded.
    Welcome {
        /// Assigned local session id.
        local_id: LocalId,
    },

    /// The client was admitted into a game.
    JoinedGame {
        /// The game joined.
        game: GameId,
        /// The joiner's local id.
        local_id: LocalId,
        /// Current host, if any.
        host: Option<LocalId>,
        /// Current members.
        players: Vec<PlayerSummary>,
    },

    /// A join attempt was denied. The connection stays usable.
    JoinDenied {
        /// The game that denied the join.
        game: GameId,
        /// Why.
        reason: DisconnectReason,
    },

    /// Another player joined the room.
    PlayerJoined {
        /// The game.
        game: GameId,
        /// The new member.
        player: PlayerSummary,
    },

    /// A player left or was removed.
    PlayerLeft {
        /// The game.
        game: GameId,
        /// Who left.
        local_id: LocalId,
    },

    /// A player was kicked, and possibly banned.
    PlayerKicked {
        /// The game.
        game: GameId,
        /// Who was kicked.
        local_id: LocalId,
        /// Whether they were also banned.
        banned: bool,
    },

    /// Joiner must wait for the recognized host to return.
    WaitForHost {
        /// The ended game being rejoined.
        game: GameId,
    },

    /// The recognized host rejoined an ended game; play may resume.
    HostRejoined {
        /// The game.
        game: GameId,
        /// The host's local id.
        host: LocalId,
    },

    /// The game started.
    GameStarted {
        /// The game.
        game: GameId,
    },

    /// The game ended; clients return to the lobby flow.
    GameEnded {
        /// The game.
        game: GameId,
    },

    /// Game privacy changed.
    PrivacyChanged {
        /// The game.
        game: GameId,
        /// Whether the game is publicly listed.
        public: bool,
    },

    /// Latency probe response.
    Pong {
        /// Echoed client timestamp.
        timestamp: u64,
    },

    /// The server is closing this connection.
    Disconnect {
        /// Why.
        reason: DisconnectReason,
    },
}

// =============================================================================
// CODEC HELPERS
// =============================================================================

/// Codec error for message (de)serialization.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encode/decode failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// Binary encode/decode failure.
    #[error("binary error: {0}")]
    Binary(#[from] bincode::Error),
}

macro_rules! impl_codec {
    ($ty:ty) => {
        impl $ty {
            /// Serialize to a JSON string.
            pub fn to_json(&self) -> Result<String, CodecError> {
                Ok(serde_json::to_string(self)?)
            }

            /// Deserialize from a JSON string.
            pub fn from_json(text: &str) -> Result<Self, CodecError> {
                Ok(serde_json::from_str(text)?)
            }

            /// Serialize to compact binary.
            pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
                Ok(bincode::serialize(self)?)
            }

            /// Deserialize from compact binary.
            pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
                Ok(bincode::deserialize(bytes)?)
            }
        }
    };
}

impl_codec!(ClientMessage);
impl_codec!(ServerMessage);
impl_codec!(PreAuthRequest);
impl_codec!(PreAuthResponse);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_json_round_trip() {
        let msg = ClientMessage::Hello(Handshake {
            name: "Bob".into(),
            version: MAX_SUPPORTED_VERSION,
            token: Some("nonce:42".into()),
            friend_code: None,
            platform: Some(PlatformInfo {
                kind: "pc".into(),
                build: "1.2.3".into(),
            }),
        });

        let text = msg.to_json().unwrap();
        let back = ClientMessage::from_json(&text).unwrap();
        match back {
            ClientMessage::Hello(h) => {
                assert_eq!(h.name, "Bob");
                assert_eq!(h.token.as_deref(), Some("nonce:42"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_server_message_binary_round_trip() {
        let msg = ServerMessage::JoinDenied {
            game: GameId(7),
            reason: DisconnectReason::GameFull,
        };
        let bytes = msg.to_bytes().unwrap();
        let back = ServerMessage::from_bytes(&bytes).unwrap();
        match back {
            ServerMessage::JoinDenied { game, reason } => {
                assert_eq!(game, GameId(7));
                assert_eq!(reason, DisconnectReason::GameFull);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_client_message_binary_round_trip() {
        let msg = ClientMessage::Hello(Handshake {
            name: "Bob".into(),
            version: MIN_SUPPORTED_VERSION,
            token: Some("nonce:7".into()),
            friend_code: Some("BOB#0007".into()),
            platform: None,
        });
        let bytes = msg.to_bytes().unwrap();
        match ClientMessage::from_bytes(&bytes).unwrap() {
            ClientMessage::Hello(h) => {
                assert_eq!(h.name, "Bob");
                assert_eq!(h.version, MIN_SUPPORTED_VERSION);
                assert_eq!(h.token.as_deref(), Some("nonce:7"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_preauth_binary_round_trip() {
        let req = PreAuthRequest::Credential {
            token: "tok-1".into(),
        };
        let bytes = req.to_bytes().unwrap();
        let PreAuthRequest::Credential { token } = PreAuthRequest::from_bytes(&bytes).unwrap();
        assert_eq!(token, "tok-1");

        let resp = PreAuthResponse::NonceGrant { nonce: 99 };
        let bytes = resp.to_bytes().unwrap();
        match PreAuthResponse::from_bytes(&bytes).unwrap() {
            PreAuthResponse::NonceGrant { nonce } => assert_eq!(nonce, 99),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn test_disconnect_reason_wording_is_distinct() {
        let reasons = [
            DisconnectReason::OutdatedClient,
            DisconnectReason::TooNewClient,
            DisconnectReason::UsernameTooLong,
            DisconnectReason::IllegalUsername,
            DisconnectReason::GameDestroyed,
            DisconnectReason::GameFull,
            DisconnectReason::AlreadyStarted,
            DisconnectReason::Banned,
            DisconnectReason::DuplicateIdentity,
            DisconnectReason::Error,
        ];
        let mut texts: Vec<String> = reasons.iter().map(|r| r.to_string()).collect();
        texts.sort();
        texts.dedup();
        assert_eq!(texts.len(), reasons.len());
    }

    #[test]
    fn test_handshake_optional_fields_default() {
        let h: Handshake =
            serde_json::from_str(r#"{"name":"Ada","version":5}"#).unwrap();
        assert!(h.token.is_none());
        assert!(h.friend_code.is_none());
        assert!(h.platform.is_none());
    }
}
