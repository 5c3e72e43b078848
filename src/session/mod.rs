//! Session Layer
//!
//! Identity resolution and session registration: the cascade of resolver
//! strategies that turns handshake inputs into an identity, and the registry
//! that validates, assigns local ids, and tracks online sessions.

pub mod registry;
pub mod resolve;

pub use registry::{RegisterError, RegistryConfig, Session, SessionRegistry, MAX_NAME_LEN};
pub use resolve::{fallback_friend_code, resolve_identity, ResolveContext, ResolvedIdentity};
