//! Meridian Session Server
//!
//! Process entry point: wires the shared services together, starts the
//! pre-auth listener and the destroyed-game reaper, then runs the game
//! channel accept loop until it stops.

use std::sync::Arc;
use anyhow::Context;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use meridian::auth::cache::IdentityCache;
use meridian::auth::exclusive::ExclusivityMap;
use meridian::auth::preauth::PreAuthListener;
use meridian::auth::token::IdpConfig;
use meridian::bans::NoBans;
use meridian::config::Config;
use meridian::events::EventDispatcher;
use meridian::game::join::JoinDeps;
use meridian::game::manager::GameManager;
use meridian::net::server::GameServer;
use meridian::session::registry::SessionRegistry;
use meridian::VERSION;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    let config = Config::from_env();
    info!("Meridian Session Server v{}", VERSION);
    info!("game channel: {}", config.server.bind_addr);
    info!("pre-auth channel: {}", config.preauth.bind_addr);

    let idp = IdpConfig::from_env();
    if idp.is_configured() {
        info!("identity provider intake configured");
    } else {
        info!("no identity provider configured, pre-seeded credentials only");
    }

    let events = Arc::new(EventDispatcher::new());
    let cache = Arc::new(IdentityCache::with_ttl(
        config.auth_ttl,
        config.sweep_interval,
    ));
    let exclusivity = Arc::new(ExclusivityMap::new());
    let registry = Arc::new(SessionRegistry::new(
        cache.clone(),
        exclusivity,
        events.clone(),
        config.registry.clone(),
    ));
    let manager = Arc::new(GameManager::new(events.clone()));
    let join_deps = JoinDeps {
        bans: Arc::new(NoBans),
        address_bans: Arc::new(meridian::bans::AddressBanList::new()),
        events,
        lock_wait: config.lock_wait,
        spawn_timeout: config.spawn_timeout,
    };

    let preauth = Arc::new(PreAuthListener::new(cache, config.preauth.clone()));
    let preauth_task = {
        let preauth = preauth.clone();
        tokio::spawn(async move {
            if let Err(e) = preauth.run().await {
                tracing::error!("pre-auth listener failed: {}", e);
            }
        })
    };

    let reaper_task = {
        let manager = manager.clone();
        let cadence = config.cleanup_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cadence);
            loop {
                ticker.tick().await;
                manager.cleanup().await;
            }
        })
    };

    let server = GameServer::new(config.server.clone(), registry, manager, join_deps);
    let result = server.run().await;

    preauth.shutdown();
    preauth_task.abort();
    reaper_task.abort();

    result.context("game server failed")
}
