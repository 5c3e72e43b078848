//! Pre-Authentication Listener
//!
//! Accepts short-lived secured connections, validates an externally-issued
//! credential against the identity correlation cache, mints a one-time nonce,
//! binds it to the matched record, returns the nonce, and closes.
//!
//! Per-connection state machine:
//!
//! ```text
//! Connected → (credential parsed) → (cache lookup) → NonceIssued → Closed
//! Connected → Rejected → Closed       (on any failure)
//! ```
//!
//! After sending the nonce the connection is kept open for a short fixed
//! linger so the client's transport can acknowledge receipt, then forcibly
//! closed. The linger is deliberately not cancellable; the listener's accept
//! loop itself shuts down cleanly via a broadcast signal.

use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::auth::cache::IdentityCache;
use crate::net::protocol::{DisconnectReason, PreAuthRequest, PreAuthResponse};

/// How long a client may take to present its credential.
const CREDENTIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Pre-auth listener errors.
#[derive(Debug, thiserror::Error)]
pub enum PreAuthError {
    /// The client never presented a parseable credential.
    #[error("missing or malformed credential")]
    MissingCredential,

    /// The credential matched no unexpired cache record.
    #[error("unknown credential")]
    UnknownCredential,

    /// Failed to bind the listen address.
    #[error("failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),
}

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct PreAuthConfig {
    /// Bind address for the secured channel.
    pub bind_addr: SocketAddr,
    /// Post-send linger before forced teardown.
    pub linger: Duration,
}

impl Default for PreAuthConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8443".parse().expect("static addr"),
            linger: Duration::from_millis(750),
        }
    }
}

/// Mint a non-zero random 32-bit nonce.
///
/// Zero is reserved as "no nonce"; generation retries until non-zero.
pub fn mint_nonce() -> u32 {
    let mut rng = rand::thread_rng();
    loop {
        let nonce: u32 = rng.gen();
        if nonce != 0 {
            return nonce;
        }
    }
}

/// Validate a credential and bind a freshly minted nonce to its record.
///
/// This is the listener's whole decision path, factored out of the socket
/// loop so it is testable without a network.
pub async fn issue_nonce(cache: &IdentityCache, token: &str) -> Result<u32, PreAuthError> {
    let record = cache
        .lookup_by_token(token)
        .await
        .ok_or(PreAuthError::UnknownCredential)?;

    // Unique at time of issuance: re-mint on the (rare) live collision.
    let mut nonce = mint_nonce();
    while cache.is_nonce_bound(nonce).await {
        nonce = mint_nonce();
    }

    cache.bind_nonce(&record.token, nonce).await;
    debug!(user_id = %record.user_id, nonce = %format_args!("{nonce:08x}"), "nonce issued");
    Ok(nonce)
}

/// The pre-authentication accept loop.
pub struct PreAuthListener {
    cache: Arc<IdentityCache>,
    config: PreAuthConfig,
    shutdown_tx: broadcast::Sender<()>,
}

impl PreAuthListener {
    /// Create a listener over the shared cache.
    pub fn new(cache: Arc<IdentityCache>, config: PreAuthConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            cache,
            config,
            shutdown_tx,
        }
    }

    /// Run the accept loop until shutdown.
    pub async fn run(&self) -> Result<(), PreAuthError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("pre-auth listener on {}", self.config.bind_addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let cache = self.cache.clone();
                            let linger = self.config.linger;
                            tokio::spawn(async move {
                                handle_connection(stream, addr, cache, linger).await;
                            });
                        }
                        Err(e) => warn!("pre-auth accept error: {e}"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("pre-auth listener shutting down");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Stop accepting new connections.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Drive one secured connection through the state machine.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    cache: Arc<IdentityCache>,
    linger: Duration,
) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("pre-auth handshake failed for {addr}: {e}");
            return;
        }
    };
    let (mut sink, mut source) = ws.split();

    let outcome = read_credential(&mut source).await;
    let response = match &outcome {
        Ok(token) => match issue_nonce(&cache, token).await {
            Ok(nonce) => PreAuthResponse::NonceGrant { nonce },
            Err(e) => {
                warn!("pre-auth rejection for {addr}: {e}");
                rejection()
            }
        },
        Err(e) => {
            warn!("pre-auth rejection for {addr}: {e}");
            rejection()
        }
    };

    let granted = matches!(response, PreAuthResponse::NonceGrant { .. });
    if let Ok(text) = response.to_json() {
        let _ = sink.send(Message::Text(text)).await;
    }

    if granted {
        // Give the client's transport time to acknowledge before teardown.
        tokio::time::sleep(linger).await;
    }
    let _ = sink.close().await;
    debug!(%addr, granted, "pre-auth connection closed");
}

/// Read and parse the single expected credential message.
async fn read_credential<S>(source: &mut S) -> Result<String, PreAuthError>
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let frame = tokio::time::timeout(CREDENTIAL_TIMEOUT, source.next())
        .await
        .map_err(|_| PreAuthError::MissingCredential)?;

    match frame {
        Some(Ok(Message::Text(text))) => match PreAuthRequest::from_json(&text) {
            Ok(PreAuthRequest::Credential { token }) => Ok(token),
            Err(_) => Err(PreAuthError::MissingCredential),
        },
        Some(Ok(Message::Binary(bytes))) => match PreAuthRequest::from_bytes(&bytes) {
            Ok(PreAuthRequest::Credential { token }) => Ok(token),
            Err(_) => Err(PreAuthError::MissingCredential),
        },
        _ => Err(PreAuthError::MissingCredential),
    }
}

/// The single generic rejection this channel ever sends.
fn rejection() -> PreAuthResponse {
    PreAuthResponse::Rejected {
        reason: DisconnectReason::Custom {
            message: "authentication failed".into(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::protocol::UserId;

    #[test]
    fn test_mint_nonce_is_nonzero() {
        for _ in 0..64 {
            assert_ne!(mint_nonce(), 0);
        }
    }

    #[tokio::test]
    async fn test_issue_nonce_binds_to_matched_record() {
        let cache = IdentityCache::new();
        cache
            .put(UserId("u1".into()), "tok-1".into(), None, None, None)
            .await;

        let nonce = issue_nonce(&cache, "tok-1").await.expect("grant");
        assert_ne!(nonce, 0);

        let record = cache.lookup_by_nonce(nonce).await.expect("hit");
        assert_eq!(record.user_id, UserId("u1".into()));
    }

    #[tokio::test]
    async fn test_issue_nonce_unknown_token_leaves_cache_unchanged() {
        let cache = IdentityCache::new();
        let before = cache.stats().await;

        let result = issue_nonce(&cache, "no-such-token").await;
        assert!(matches!(result, Err(PreAuthError::UnknownCredential)));
        assert_eq!(cache.stats().await, before);
    }

    #[tokio::test]
    async fn test_issue_nonce_twice_yields_distinct_nonces() {
        let cache = IdentityCache::new();
        cache
            .put(UserId("u1".into()), "tok-1".into(), None, None, None)
            .await;

        let a = issue_nonce(&cache, "tok-1").await.unwrap();
        let b = issue_nonce(&cache, "tok-1").await.unwrap();
        assert_ne!(a, b);
        // Both remain resolvable until the record expires.
        assert!(cache.lookup_by_nonce(a).await.is_some());
        assert!(cache.lookup_by_nonce(b).await.is_some());
    }

    #[tokio::test]
    async fn test_listener_shutdown_stops_accept_loop() {
        let cache = Arc::new(IdentityCache::new());
        let config = PreAuthConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            linger: Duration::from_millis(1),
        };
        let listener = Arc::new(PreAuthListener::new(cache, config));

        let runner = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.run().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        listener.shutdown();

        let result = tokio::time::timeout(Duration::from_secs(1), runner)
            .await
            .expect("loop exits")
            .expect("task joins");
        assert!(result.is_ok());
    }
}
