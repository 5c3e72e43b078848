//! Transport Abstraction
//!
//! The core never talks to sockets directly. A [`ClientLink`] is the given
//! transport surface for one connection: a remote endpoint, a send primitive,
//! and a disconnect-with-reason primitive. The accept loops in `net::server`
//! and `auth::preauth` pump these channels onto real sockets; tests pump them
//! into buffers.

use std::net::{IpAddr, SocketAddr};
use tokio::sync::mpsc;

use crate::net::protocol::{DisconnectReason, ServerMessage};

/// Outbound traffic for one connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// A structured message for the client.
    Message(ServerMessage),
    /// Close the connection, telling the client why.
    Disconnect(DisconnectReason),
}

/// Handle to one client connection.
///
/// Cheap to clone; all clones feed the same connection.
#[derive(Debug, Clone)]
pub struct ClientLink {
    addr: SocketAddr,
    tx: mpsc::Sender<Outbound>,
}

impl ClientLink {
    /// Wrap an outbound channel as a client link.
    pub fn new(addr: SocketAddr, tx: mpsc::Sender<Outbound>) -> Self {
        Self { addr, tx }
    }

    /// Create a link backed by an in-process channel, returning the
    /// receiving half. Used by the accept loops and by tests.
    pub fn channel(addr: SocketAddr, capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(addr, tx), rx)
    }

    /// The remote endpoint as observed at accept time.
    pub fn endpoint(&self) -> SocketAddr {
        self.addr
    }

    /// The remote IP address.
    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    /// Send a message. Returns `false` if the connection is gone;
    /// callers treat that as the network layer having already failed.
    pub async fn send(&self, msg: ServerMessage) -> bool {
        self.tx.send(Outbound::Message(msg)).await.is_ok()
    }

    /// Disconnect with a client-displayable reason.
    ///
    /// The reason is delivered before teardown where the transport still
    /// functions; a dead transport is ignored.
    pub async fn disconnect(&self, reason: DisconnectReason) {
        let _ = self.tx.send(Outbound::Disconnect(reason)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::protocol::GameId;

    fn addr() -> SocketAddr {
        "10.0.0.1:4000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_send_delivers_message() {
        let (link, mut rx) = ClientLink::channel(addr(), 8);
        assert!(link.send(ServerMessage::Pong { timestamp: 9 }).await);
        assert_eq!(
            rx.recv().await,
            Some(Outbound::Message(ServerMessage::Pong { timestamp: 9 }))
        );
    }

    #[tokio::test]
    async fn test_disconnect_carries_reason() {
        let (link, mut rx) = ClientLink::channel(addr(), 8);
        link.disconnect(DisconnectReason::GameFull).await;
        assert_eq!(
            rx.recv().await,
            Some(Outbound::Disconnect(DisconnectReason::GameFull))
        );
    }

    #[tokio::test]
    async fn test_send_after_receiver_dropped_reports_failure() {
        let (link, rx) = ClientLink::channel(addr(), 8);
        drop(rx);
        assert!(
            !link
                .send(ServerMessage::GameEnded { game: GameId(1) })
                .await
        );
        // Disconnect on a dead link must not panic.
        link.disconnect(DisconnectReason::Error).await;
    }
}
