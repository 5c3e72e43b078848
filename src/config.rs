//! Server Configuration
//!
//! One aggregate configuration for the whole process, assembled from
//! defaults and `MERIDIAN_*` environment variables. Identity-provider
//! settings are separate (`auth::token::IdpConfig`, `IDP_*` variables).

use std::time::Duration;

use crate::auth::cache::{RECORD_TTL, SWEEP_INTERVAL};
use crate::auth::preauth::PreAuthConfig;
use crate::game::join::JOIN_LOCK_WAIT;
use crate::game::watchdog::SPAWN_TIMEOUT;
use crate::net::server::ServerConfig;
use crate::session::registry::RegistryConfig;

/// Aggregate process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Game-channel server settings.
    pub server: ServerConfig,
    /// Pre-auth listener settings.
    pub preauth: PreAuthConfig,
    /// Registration cascade settings.
    pub registry: RegistryConfig,
    /// Correlation-cache record lifetime.
    pub auth_ttl: Duration,
    /// Correlation-cache sweep cadence.
    pub sweep_interval: Duration,
    /// Membership-lock acquisition bound for joins.
    pub lock_wait: Duration,
    /// Spawn-confirmation window.
    pub spawn_timeout: Duration,
    /// Cadence of the destroyed-game reaper.
    pub cleanup_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            preauth: PreAuthConfig::default(),
            registry: RegistryConfig::default(),
            auth_ttl: RECORD_TTL,
            sweep_interval: SWEEP_INTERVAL,
            lock_wait: JOIN_LOCK_WAIT,
            spawn_timeout: SPAWN_TIMEOUT,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl Config {
    /// Build from `MERIDIAN_*` environment variables, falling back to the
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(addr) = env_parse("MERIDIAN_BIND") {
            config.server.bind_addr = addr;
        }
        if let Some(addr) = env_parse("MERIDIAN_PREAUTH_BIND") {
            config.preauth.bind_addr = addr;
        }
        if let Some(n) = env_parse("MERIDIAN_MAX_CONNECTIONS") {
            config.server.max_connections = n;
        }
        if let Some(n) = env_parse("MERIDIAN_MAX_PLAYERS") {
            config.server.max_players = n;
        }
        if let Some(secs) = env_parse("MERIDIAN_AUTH_TTL_SECS") {
            config.auth_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("MERIDIAN_SPAWN_TIMEOUT_SECS") {
            config.spawn_timeout = Duration::from_secs(secs);
        }
        if let Some(flag) = env_parse("MERIDIAN_ALLOW_FUTURE_VERSIONS") {
            config.registry.allow_future_versions = flag;
        }
        if let Some(flag) = env_parse("MERIDIAN_ALLOW_VERSION_MIXING") {
            config.server.allow_version_mixing = flag;
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_coherent() {
        let config = Config::default();
        assert_eq!(config.auth_ttl, Duration::from_secs(600));
        assert_eq!(config.lock_wait, Duration::from_secs(60));
        assert!(config.auth_ttl > config.sweep_interval);
        assert_eq!(config.server.max_players, 10);
    }

    #[test]
    fn test_env_parse_rejects_garbage() {
        std::env::set_var("MERIDIAN_TEST_GARBAGE", "not-a-number");
        assert_eq!(env_parse::<u64>("MERIDIAN_TEST_GARBAGE"), None);
        std::env::remove_var("MERIDIAN_TEST_GARBAGE");
        assert_eq!(env_parse::<u64>("MERIDIAN_TEST_GARBAGE"), None);
    }
}
