//! WebSocket Game Server
//!
//! The game-data channel accept loop. Each connection is pumped through a
//! [`ClientLink`] so the rest of the crate never touches sockets: one task
//! drains outbound traffic onto the WebSocket sink, the connection task reads
//! the handshake, runs registration, and then dispatches client messages
//! until the peer goes away.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::game::commands::{
    alter_privacy, character_spawned, end_game, kick_player, remove_player, start_game,
};
use crate::game::join::{add_client, JoinDeps};
use crate::game::manager::GameManager;
use crate::game::state::{Game, GameConfig};
use crate::net::protocol::{ClientMessage, DisconnectReason, ServerMessage};
use crate::net::transport::{ClientLink, Outbound};
use crate::session::{Session, SessionRegistry};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address for the game channel.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// How long a connection may idle before its handshake must arrive.
    pub handshake_timeout: Duration,
    /// Per-connection outbound buffer depth.
    pub channel_capacity: usize,
    /// Member capacity for hosted games.
    pub max_players: usize,
    /// Whether hosted games allow mixed protocol versions.
    pub allow_version_mixing: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".parse().expect("static addr"),
            max_connections: 1000,
            handshake_timeout: Duration::from_secs(10),
            channel_capacity: 64,
            max_players: 10,
            allow_version_mixing: false,
        }
    }
}

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// The game-channel server.
pub struct GameServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    manager: Arc<GameManager>,
    join_deps: JoinDeps,
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a server over the shared services.
    pub fn new(
        config: ServerConfig,
        registry: Arc<SessionRegistry>,
        manager: Arc<GameManager>,
        join_deps: JoinDeps,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            registry,
            manager,
            join_deps,
            shutdown_tx,
        }
    }

    /// Run the accept loop until shutdown.
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("game server listening on {}", self.config.bind_addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.registry.count().await >= self.config.max_connections {
                                warn!("connection limit reached, rejecting {}", addr);
                                continue;
                            }
                            debug!("new connection from {}", addr);
                            self.spawn_connection(stream, addr);
                        }
                        Err(e) => error!("accept error: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Signal shutdown to the accept loop and all connections.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    fn spawn_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let registry = self.registry.clone();
        let manager = self.manager.clone();
        let join_deps = self.join_deps.clone();
        let config = self.config.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    debug!("websocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };
            let (ws_sender, ws_receiver) = ws_stream.split();

            let (link, outbound_rx) = ClientLink::channel(addr, config.channel_capacity);
            let pump = tokio::spawn(pump_outbound(outbound_rx, ws_sender));

            let conn = Connection {
                registry,
                manager,
                join_deps,
                config,
                link,
                addr,
            };
            conn.run(ws_receiver, shutdown_rx).await;

            pump.await.ok();
            debug!("connection {} cleaned up", addr);
        });
    }
}

/// Drain the outbound channel onto the WebSocket sink. A disconnect delivers
/// the reason and then closes.
async fn pump_outbound<S>(mut rx: mpsc::Receiver<Outbound>, mut sink: S)
where
    S: SinkExt<Message> + Unpin,
{
    while let Some(out) = rx.recv().await {
        match out {
            Outbound::Message(msg) => {
                let text = match msg.to_json() {
                    Ok(t) => t,
                    Err(e) => {
                        error!("failed to serialize message: {}", e);
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            Outbound::Disconnect(reason) => {
                if let Ok(text) = (ServerMessage::Disconnect { reason }).to_json() {
                    let _ = sink.send(Message::Text(text)).await;
                }
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
    let _ = sink.close().await;
}

type WsReceiver =
    futures_util::stream::SplitStream<tokio_tungstenite::WebSocketStream<TcpStream>>;

/// One accepted connection's server-side state.
struct Connection {
    registry: Arc<SessionRegistry>,
    manager: Arc<GameManager>,
    join_deps: JoinDeps,
    config: ServerConfig,
    link: ClientLink,
    addr: SocketAddr,
}

impl Connection {
    async fn run(self, mut ws: WsReceiver, mut shutdown_rx: broadcast::Receiver<()>) {
        let session = match self.establish(&mut ws).await {
            Some(session) => session,
            None => return,
        };
        self.link
            .send(ServerMessage::Welcome {
                local_id: session.local_id,
            })
            .await;

        let mut current_game: Option<Arc<Game>> = None;
        loop {
            tokio::select! {
                msg = ws.next() => {
                    let Some(msg) = decode_frame(self.addr, msg) else { break };
                    let Some(msg) = msg else { continue };
                    self.dispatch(&session, &mut current_game, msg).await;
                }
                _ = shutdown_rx.recv() => {
                    self.link
                        .disconnect(DisconnectReason::Custom {
                            message: "server shutting down".into(),
                        })
                        .await;
                    break;
                }
            }
        }

        if let Some(game) = current_game.take() {
            let _ = remove_player(&game, &self.join_deps.events, session.local_id).await;
        }
        self.registry.unregister(session.local_id).await;
    }

    /// Read the handshake and run registration. Anything other than a timely
    /// `Hello` ends the connection.
    async fn establish(&self, ws: &mut WsReceiver) -> Option<Arc<Session>> {
        let hello = loop {
            let frame = timeout(self.config.handshake_timeout, ws.next()).await;
            let msg = match frame {
                Ok(msg) => decode_frame(self.addr, msg)?,
                Err(_) => {
                    debug!("handshake timeout for {}", self.addr);
                    self.link.disconnect(DisconnectReason::Error).await;
                    return None;
                }
            };
            match msg {
                Some(ClientMessage::Hello(hello)) => break hello,
                Some(other) => {
                    debug!("{} sent {:?} before handshake", self.addr, other);
                    self.link.disconnect(DisconnectReason::Error).await;
                    return None;
                }
                None => continue,
            }
        };

        // The registry delivers its own disconnect reason on rejection.
        self.registry
            .register(self.link.clone(), hello)
            .await
            .ok()
    }

    async fn dispatch(
        &self,
        session: &Arc<Session>,
        current_game: &mut Option<Arc<Game>>,
        msg: ClientMessage,
    ) {
        match msg {
            ClientMessage::Hello(_) => {
                debug!("{} repeated handshake, ignoring", session.local_id);
            }
            ClientMessage::HostGame { public } => {
                let game = self
                    .manager
                    .create_game(GameConfig {
                        max_players: self.config.max_players,
                        public,
                        allow_version_mixing: self.config.allow_version_mixing,
                    })
                    .await;
                let admitted = self.join_switch(session, current_game, game.clone()).await;
                if !admitted && game.player_count().await == 0 {
                    // Stillborn lobby; reap it instead of leaving it listed.
                    self.manager.remove(game.id).await;
                }
            }
            ClientMessage::JoinGame { game } => {
                match self.manager.get(game).await {
                    Some(target) => {
                        self.join_switch(session, current_game, target).await;
                    }
                    None => {
                        self.link
                            .send(ServerMessage::JoinDenied {
                                game,
                                reason: DisconnectReason::GameDestroyed,
                            })
                            .await;
                    }
                }
            }
            ClientMessage::LeaveGame => {
                self.leave_current(session, current_game).await;
            }
            ClientMessage::CharacterSpawned => {
                if let Some(game) = current_game {
                    if let Err(e) = character_spawned(game, session.local_id).await {
                        debug!(%e, "spawn confirmation refused");
                    }
                }
            }
            ClientMessage::StartGame => {
                if let Some(game) = current_game {
                    if let Err(e) = start_game(game, &self.join_deps.events, session.local_id).await
                    {
                        debug!(%e, "start refused");
                    }
                }
            }
            ClientMessage::EndGame => {
                if let Some(game) = current_game {
                    if let Err(e) = end_game(game, &self.join_deps.events, session.local_id).await {
                        debug!(%e, "end refused");
                    }
                }
            }
            ClientMessage::AlterPrivacy { public } => {
                if let Some(game) = current_game {
                    if let Err(e) =
                        alter_privacy(game, &self.join_deps.events, session.local_id, public).await
                    {
                        debug!(%e, "privacy change refused");
                    }
                }
            }
            ClientMessage::KickPlayer { target, ban } => {
                if let Some(game) = current_game {
                    if let Err(e) = kick_player(
                        game,
                        &self.join_deps.events,
                        &self.join_deps.address_bans,
                        session.local_id,
                        target,
                        ban,
                    )
                    .await
                    {
                        debug!(%e, "kick refused");
                    }
                }
            }
            ClientMessage::Ping { timestamp } => {
                self.link.send(ServerMessage::Pong { timestamp }).await;
            }
        }
    }

    /// Admit into `game`, leaving the current game only once admission has
    /// succeeded. A denied switch leaves the current membership untouched.
    async fn join_switch(
        &self,
        session: &Arc<Session>,
        current_game: &mut Option<Arc<Game>>,
        game: Arc<Game>,
    ) -> bool {
        match add_client(&game, session.clone(), &self.join_deps).await {
            Ok(()) => {
                if let Some(old) = current_game.take() {
                    if old.id != game.id {
                        let _ = remove_player(&old, &self.join_deps.events, session.local_id).await;
                    }
                }
                *current_game = Some(game);
                true
            }
            Err(e) => {
                self.link
                    .send(ServerMessage::JoinDenied {
                        game: game.id,
                        reason: e.reason(),
                    })
                    .await;
                false
            }
        }
    }

    async fn leave_current(&self, session: &Arc<Session>, current_game: &mut Option<Arc<Game>>) {
        if let Some(game) = current_game.take() {
            let _ = remove_player(&game, &self.join_deps.events, session.local_id).await;
        }
    }
}

/// Decode one WebSocket frame. `None` means the connection is over;
/// `Some(None)` means the frame carried nothing dispatchable.
fn decode_frame(
    addr: SocketAddr,
    frame: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
) -> Option<Option<ClientMessage>> {
    match frame {
        Some(Ok(Message::Text(text))) => match ClientMessage::from_json(&text) {
            Ok(msg) => Some(Some(msg)),
            Err(e) => {
                debug!("invalid message from {}: {}", addr, e);
                Some(None)
            }
        },
        Some(Ok(Message::Binary(data))) => match ClientMessage::from_bytes(&data) {
            Ok(msg) => Some(Some(msg)),
            Err(e) => {
                debug!("invalid binary message from {}: {}", addr, e);
                Some(None)
            }
        },
        Some(Ok(Message::Close(_))) | None => {
            debug!("client {} disconnected", addr);
            None
        }
        Some(Ok(_)) => Some(None),
        Some(Err(e)) => {
            debug!("websocket error for {}: {}", addr, e);
            None
        }
    }
}
