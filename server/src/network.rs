//! Relay network layer: WebSocket termination and frame dispatch
//!
//! One task per connection runs a `select!` loop over the outbound mailbox
//! and the inbound socket, so every registry effect of a frame happens under
//! one lock acquisition and outbound delivery can never block another
//! connection. Mailboxes hold at most [`MAILBOX_CAPACITY`] frames: rather
//! than queue past the cap, the registry prunes the connection outright.
//! A pruned connection's sender is dropped, and the closed mailbox is what
//! makes its task here shut the socket down.

use crate::registry::{ConnId, MAILBOX_CAPACITY, RoomRegistry};
use duel_shared::protocol::{self, ClientFrame, ServerFrame};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

/// The relay: a listener plus the registry shared with every connection task
/// and the liveness monitor.
pub struct RelayServer {
    listener: TcpListener,
    registry: Arc<RwLock<RoomRegistry>>,
}

impl RelayServer {
    /// Binds the listener. `addr` may name port 0 to get an ephemeral port;
    /// see [`RelayServer::local_addr`].
    pub async fn bind(addr: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(addr).await?;
        info!("Relay listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            registry: Arc::new(RwLock::new(RoomRegistry::new())),
        })
    }

    /// The actually bound address.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle to the registry, for the liveness monitor and for tests.
    pub fn registry(&self) -> Arc<RwLock<RoomRegistry>> {
        Arc::clone(&self.registry)
    }

    /// Accept loop. Each connection gets its own task; the loop itself only
    /// stops if the listener fails.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let registry = Arc::clone(&self.registry);
            tokio::spawn(async move {
                handle_connection(registry, stream, peer).await;
            });
        }
    }
}

/// Drives one connection from handshake to cleanup.
async fn handle_connection(
    registry: Arc<RwLock<RoomRegistry>>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake with {} failed: {}", peer, e);
            return;
        }
    };

    let (mut write, mut read) = ws.split();
    let (tx, mut rx) = mpsc::channel::<Message>(MAILBOX_CAPACITY);

    let conn_id = {
        let mut reg = registry.write().await;
        let id = reg.add_connection(tx);
        // Greeting goes through the mailbox so it is the first frame out.
        reg.send_to(id, &ServerFrame::Connected { ts: unix_millis() }.encode());
        id
    };
    info!("Connection {} accepted from {}", conn_id, peer);

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(msg) => {
                        if let Err(e) = write.send(msg).await {
                            debug!("Send to connection {} failed: {}", conn_id, e);
                            break;
                        }
                    }
                    // The registry dropped us; close the socket out.
                    None => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            inbound = read.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match protocol::decode_client_frame(&text) {
                            Some(frame) => handle_frame(&registry, conn_id, frame).await,
                            None => debug!("Dropping malformed frame from connection {}", conn_id),
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Ping(_))) => {
                        registry.write().await.mark_alive(conn_id);
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!("Connection {} sent close", conn_id);
                        break;
                    }
                    Some(Ok(_)) => {
                        // Binary frames are not part of the protocol.
                    }
                    Some(Err(e)) => {
                        debug!("Connection {} read error: {}", conn_id, e);
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    disconnect(&registry, conn_id).await;
    info!("Connection {} from {} closed", conn_id, peer);
}

/// Applies one decoded frame to the registry and queues the replies.
///
/// Every arm runs under a single write lock, which is what serializes all
/// registry mutation across connection tasks.
async fn handle_frame(registry: &RwLock<RoomRegistry>, conn_id: ConnId, frame: ClientFrame) {
    let mut reg = registry.write().await;
    reg.mark_alive(conn_id);

    match frame {
        ClientFrame::Hello { room, user } => {
            let presence = user.is_some();
            let vacated = reg.join(conn_id, &room, user);
            reg.send_to(conn_id, &ServerFrame::Ack { room: room.clone() }.encode());
            if presence {
                let snapshot = reg.snapshot(&room).encode();
                reg.broadcast(&room, &snapshot, None);
            }
            if let Some(prior) = vacated {
                let snapshot = reg.snapshot(&prior).encode();
                reg.broadcast(&prior, &snapshot, None);
            }
        }
        ClientFrame::Ready { ready } => {
            if let Some(room) = reg.set_ready(conn_id, ready) {
                let snapshot = reg.snapshot(&room).encode();
                reg.broadcast(&room, &snapshot, None);
            }
        }
        ClientFrame::HelloUser { user } => {
            reg.set_user(conn_id, user);
            reg.send_to(conn_id, &ServerFrame::AckUser.encode());
        }
        ClientFrame::Notify {
            to_user_id,
            event,
            payload,
        } => {
            let notice = protocol::notice_frame(&event, &payload);
            let delivered = reg.send_to_user(&to_user_id, &notice);
            debug!(
                "NOTIFY {} for user {} reached {} connection(s)",
                event, to_user_id, delivered
            );
        }
        ClientFrame::Leave => {
            let departure = reg.leave(conn_id);
            reg.announce_departure(departure);
        }
        ClientFrame::Ping => {
            reg.send_to(conn_id, &ServerFrame::Pong.encode());
        }
        ClientFrame::Event { room, payload } => {
            let frame = ServerFrame::Event {
                room: room.clone(),
                payload,
            };
            reg.broadcast(&room, &frame.encode(), Some(conn_id));
        }
    }
}

/// Removes a closed connection and notifies its room.
async fn disconnect(registry: &RwLock<RoomRegistry>, conn_id: ConnId) {
    let mut reg = registry.write().await;
    let departure = reg.remove_connection(conn_id);
    reg.announce_departure(departure);
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}
