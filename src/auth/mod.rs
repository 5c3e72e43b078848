//! Authentication Layer
//!
//! Correlates the secured pre-authentication channel with the game-data
//! channel: the correlation cache holds validated identities under four keys,
//! the exclusivity map pins each persistent user to one live session, the
//! pre-auth listener turns credentials into one-time nonces, and the intake
//! shim admits provider JWTs into the cache.

pub mod cache;
pub mod exclusive;
pub mod preauth;
pub mod token;

pub use cache::{normalize_addr, AuthRecord, CacheStats, IdentityCache, RECORD_TTL};
pub use exclusive::ExclusivityMap;
pub use preauth::{issue_nonce, mint_nonce, PreAuthConfig, PreAuthError, PreAuthListener};
pub use token::{admit_credential, decode_credential, CredentialError, IdpConfig, ProviderClaims};
