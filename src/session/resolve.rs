//! Identity Resolution Cascade
//!
//! Turns a game-channel handshake into an identity by trying an ordered list
//! of resolver strategies: nonce reference, opaque token, declared friend
//! code, source address. Misses fall through silently; the deterministic
//! fallback guarantees the cascade always terminates in success.
//!
//! Fallback identities carry no persistent user id and are therefore exempt
//! from the exclusivity bind. That exemption is a known gap in the identity
//! model: fallback identities are per-connection and not considered
//! security-sensitive.

use sha2::{Digest, Sha256};
use std::net::IpAddr;

use crate::auth::cache::IdentityCache;
use crate::net::protocol::UserId;

/// Handshake-derived inputs to the cascade. The nonce strategy consumes the
/// token field, so the context is mutable.
#[derive(Debug, Clone)]
pub struct ResolveContext {
    /// Opaque token string or `nonce:<u32>` reference, if declared.
    pub token: Option<String>,
    /// Self-reported friend code, if declared.
    pub friend_code: Option<String>,
    /// Canonicalized source address.
    pub address: IpAddr,
    /// Declared display name.
    pub name: String,
}

/// Outcome of the cascade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    /// Persistent user id; `None` for unauthenticated fallbacks.
    pub user_id: Option<UserId>,
    /// Friend code, cache-corroborated or self-reported or derived.
    pub friend_code: Option<String>,
}

impl ResolvedIdentity {
    /// Whether this identity is backed by a cache record.
    pub fn authenticated(&self) -> bool {
        self.user_id.is_some()
    }
}

/// Resolve an identity, trying each strategy only if the previous produced
/// none. Never fails.
pub async fn resolve_identity(cache: &IdentityCache, ctx: &mut ResolveContext) -> ResolvedIdentity {
    if let Some(identity) = by_nonce(cache, ctx).await {
        return identity;
    }
    if let Some(identity) = by_token(cache, ctx).await {
        return identity;
    }
    if let Some(identity) = by_friend_code(cache, ctx).await {
        return identity;
    }
    if let Some(identity) = by_address(cache, ctx).await {
        return identity;
    }
    fallback(ctx)
}

/// Parse a `nonce:<decimal u32>` reference out of a handshake token.
pub fn parse_nonce_reference(token: &str) -> Option<u32> {
    let digits = token.strip_prefix("nonce:")?;
    digits.parse::<u32>().ok().filter(|n| *n != 0)
}

/// Strategy: the token looks like a nonce reference.
///
/// Hit or miss, the token is cleared from further consideration: a consumed
/// nonce must not be double-processed, and a dead nonce string must not fall
/// back to token lookup.
async fn by_nonce(cache: &IdentityCache, ctx: &mut ResolveContext) -> Option<ResolvedIdentity> {
    let nonce = parse_nonce_reference(ctx.token.as_deref()?)?;
    ctx.token = None;

    let record = cache.lookup_by_nonce(nonce).await?;
    Some(ResolvedIdentity {
        user_id: Some(record.user_id),
        friend_code: record.friend_code,
    })
}

/// Strategy: opaque token lookup.
async fn by_token(cache: &IdentityCache, ctx: &mut ResolveContext) -> Option<ResolvedIdentity> {
    let token = ctx.token.as_deref()?;
    let record = cache.lookup_by_token(token).await?;
    Some(ResolvedIdentity {
        user_id: Some(record.user_id),
        friend_code: record.friend_code,
    })
}

/// Strategy: declared friend code.
///
/// On a cache miss the declared code is still adopted as-is, preserving the
/// client's self-reported identity without fabricating one.
async fn by_friend_code(
    cache: &IdentityCache,
    ctx: &mut ResolveContext,
) -> Option<ResolvedIdentity> {
    let code = ctx.friend_code.clone()?;
    match cache.lookup_by_friend_code(&code).await {
        Some(record) => Some(ResolvedIdentity {
            user_id: Some(record.user_id),
            friend_code: record.friend_code.or(Some(code)),
        }),
        None => Some(ResolvedIdentity {
            user_id: None,
            friend_code: Some(code),
        }),
    }
}

/// Strategy: source address correlation.
async fn by_address(cache: &IdentityCache, ctx: &mut ResolveContext) -> Option<ResolvedIdentity> {
    let record = cache.lookup_by_address(ctx.address).await?;
    Some(ResolvedIdentity {
        user_id: Some(record.user_id),
        friend_code: record.friend_code,
    })
}

/// Terminal strategy: deterministic unauthenticated pseudo-identity.
///
/// Derived from a hash of address and name so repeated connections from the
/// same unauthenticated source get a consistent fallback friend code.
fn fallback(ctx: &ResolveContext) -> ResolvedIdentity {
    ResolvedIdentity {
        user_id: None,
        friend_code: Some(fallback_friend_code(ctx.address, &ctx.name)),
    }
}

/// Deterministic fallback friend code for an unauthenticated source.
pub fn fallback_friend_code(address: IpAddr, name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"meridian-guest:");
    hasher.update(address.to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(name.as_bytes());
    let digest = hasher.finalize();

    let tag = u16::from_le_bytes([digest[4], digest[5]]) % 10_000;
    format!("GUEST-{}#{tag:04}", hex::encode(&digest[..3]).to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn uid(s: &str) -> UserId {
        UserId(s.to_owned())
    }

    fn addr() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4))
    }

    fn ctx(token: Option<&str>, code: Option<&str>) -> ResolveContext {
        ResolveContext {
            token: token.map(str::to_owned),
            friend_code: code.map(str::to_owned),
            address: addr(),
            name: "Bob".into(),
        }
    }

    async fn seeded() -> IdentityCache {
        let cache = IdentityCache::new();
        cache
            .put(
                uid("u1"),
                "tok-1".into(),
                Some("ABCD#0001".into()),
                Some(addr()),
                Some("Bob".into()),
            )
            .await;
        cache
    }

    #[test]
    fn test_parse_nonce_reference() {
        assert_eq!(parse_nonce_reference("nonce:42"), Some(42));
        assert_eq!(parse_nonce_reference("nonce:0"), None);
        assert_eq!(parse_nonce_reference("nonce:abc"), None);
        assert_eq!(parse_nonce_reference("tok-1"), None);
    }

    #[tokio::test]
    async fn test_nonce_hit_adopts_record_identity() {
        let cache = seeded().await;
        cache.bind_nonce("tok-1", 42).await;

        let mut ctx = ctx(Some("nonce:42"), None);
        let identity = resolve_identity(&cache, &mut ctx).await;

        assert_eq!(identity.user_id, Some(uid("u1")));
        assert_eq!(identity.friend_code.as_deref(), Some("ABCD#0001"));
        assert!(ctx.token.is_none(), "consumed nonce must be cleared");
    }

    #[tokio::test]
    async fn test_dead_nonce_does_not_fall_back_to_token_lookup() {
        let cache = seeded().await;
        // No nonce bound; "nonce:42" must not be retried as an opaque token,
        // and with no other inputs the cascade lands on address correlation.
        let mut context = ctx(Some("nonce:42"), None);
        let identity = resolve_identity(&cache, &mut context).await;

        assert!(context.token.is_none());
        assert_eq!(identity.user_id, Some(uid("u1"))); // via address
    }

    #[tokio::test]
    async fn test_token_lookup() {
        let cache = seeded().await;
        let mut ctx = ctx(Some("tok-1"), None);
        let identity = resolve_identity(&cache, &mut ctx).await;
        assert_eq!(identity.user_id, Some(uid("u1")));
    }

    #[tokio::test]
    async fn test_friend_code_miss_adopts_declared_code() {
        let cache = IdentityCache::new();
        let mut ctx = ctx(None, Some("ZZZZ#9999"));
        let identity = resolve_identity(&cache, &mut ctx).await;

        assert!(identity.user_id.is_none());
        assert!(!identity.authenticated());
        assert_eq!(identity.friend_code.as_deref(), Some("ZZZZ#9999"));
    }

    #[tokio::test]
    async fn test_friend_code_hit_authenticates() {
        let cache = seeded().await;
        let mut ctx = ctx(None, Some("ABCD#0001"));
        let identity = resolve_identity(&cache, &mut ctx).await;
        assert_eq!(identity.user_id, Some(uid("u1")));
    }

    #[tokio::test]
    async fn test_address_correlation_as_last_cache_strategy() {
        let cache = seeded().await;
        let mut ctx = ctx(None, None);
        let identity = resolve_identity(&cache, &mut ctx).await;
        assert_eq!(identity.user_id, Some(uid("u1")));
    }

    #[tokio::test]
    async fn test_fallback_is_deterministic_per_source() {
        let cache = IdentityCache::new();

        let first = resolve_identity(&cache, &mut ctx(None, None)).await;
        let second = resolve_identity(&cache, &mut ctx(None, None)).await;

        assert!(!first.authenticated());
        assert_eq!(first.friend_code, second.friend_code);

        // A different name derives a different code.
        let mut other = ResolveContext {
            name: "Alice".into(),
            ..ctx(None, None)
        };
        let third = resolve_identity(&cache, &mut other).await;
        assert_ne!(first.friend_code, third.friend_code);
    }

    proptest::proptest! {
        #[test]
        fn prop_fallback_code_shape(name in ".{0,32}", octets: [u8; 4]) {
            let address = IpAddr::V4(Ipv4Addr::from(octets));
            let code = fallback_friend_code(address, &name);

            proptest::prop_assert!(code.starts_with("GUEST-"));
            let tag = code.rsplit('#').next().unwrap();
            proptest::prop_assert_eq!(tag.len(), 4);
            proptest::prop_assert!(tag.chars().all(|c| c.is_ascii_digit()));
            // Stable for a given source.
            proptest::prop_assert_eq!(fallback_friend_code(address, &name), code);
        }
    }
}
