//! Dual-channel transport
//!
//! A [`DuelChannel`] gives the duel layer one send/receive pair backed by
//! two delivery paths at once: the in-process [`LocalBus`] for peers on the
//! same device, and a WebSocket to the relay for everyone else. Payloads
//! sent before the socket finishes opening are queued and flushed in FIFO
//! order right after HELLO; closing the channel hands any still-undelivered
//! payloads back to the caller instead of dropping them silently.
//!
//! The socket never reconnects within one channel's lifetime. When it drops,
//! the channel surfaces [`ChannelEvent::Closed`] and keeps working on the
//! local path alone; a fresh channel re-sends HELLO.

use crate::local_bus::{LocalBus, LocalDelivery};
use duel_shared::protocol::{self, ClientFrame, RoomUser, ServerFrame, UserProfile};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Error)]
pub enum ChannelError {
    /// The channel's background task is gone; nothing can be sent anymore.
    #[error("channel closed")]
    Closed,
}

/// Everything a channel can surface to its consumer, from either path.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The relay acknowledged HELLO; the room join is effective.
    Ack { room: String },
    /// The relay acknowledged HELLO_USER.
    AckUser,
    /// A duel payload, from the local path or relayed by the server.
    Message(Value),
    /// Presence roster of the room.
    Snapshot { room: String, users: Vec<RoomUser> },
    /// A member left the room.
    Left { room: String, user_id: String },
    /// Relay greeting carrying its wall-clock timestamp.
    Connected { ts: u64 },
    /// Reply to an application-level PING.
    Pong,
    /// A directed notification addressed to this user.
    Notice { event: String, payload: Value },
    /// The socket is gone. Local delivery continues; the relay does not.
    Closed,
}

enum Command {
    Send(Value),
    Ready(bool),
    Leave,
    Ping,
    Close(oneshot::Sender<Vec<Value>>),
}

/// Room-scoped handle over both delivery paths.
pub struct DuelChannel {
    room: String,
    origin: u64,
    bus: Arc<LocalBus>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    events_rx: mpsc::UnboundedReceiver<ChannelEvent>,
    pump: JoinHandle<()>,
}

impl DuelChannel {
    /// Opens a channel for `room`. The socket handshake runs in the
    /// background; sends are accepted immediately and queue until it is up.
    /// With `user` set the relay puts this connection on the room roster.
    pub async fn open(
        bus: Arc<LocalBus>,
        url: &str,
        room: &str,
        user: Option<UserProfile>,
    ) -> Self {
        let origin = bus.next_origin();
        let local_rx = bus.subscribe(room).await;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let pump = tokio::spawn(run_local_pump(local_rx, origin, events_tx.clone()));
        tokio::spawn(run_socket(
            url.to_string(),
            room.to_string(),
            user,
            cmd_rx,
            events_tx,
        ));

        Self {
            room: room.to_string(),
            origin,
            bus,
            cmd_tx,
            events_rx,
            pump,
        }
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    /// Sends a payload over both paths. Local fan-out happens right away;
    /// the socket copy goes out now or queues until the socket opens.
    pub async fn send(&self, payload: Value) -> Result<(), ChannelError> {
        self.bus
            .publish(&self.room, self.origin, payload.clone())
            .await;
        self.cmd_tx
            .send(Command::Send(payload))
            .map_err(|_| ChannelError::Closed)
    }

    /// Flips this connection's ready flag on the relay roster.
    pub fn set_ready(&self, ready: bool) -> Result<(), ChannelError> {
        self.cmd_tx
            .send(Command::Ready(ready))
            .map_err(|_| ChannelError::Closed)
    }

    /// Leaves the room on the relay without closing the channel.
    pub fn leave(&self) -> Result<(), ChannelError> {
        self.cmd_tx
            .send(Command::Leave)
            .map_err(|_| ChannelError::Closed)
    }

    /// Application-level ping; the relay answers with [`ChannelEvent::Pong`].
    pub fn ping(&self) -> Result<(), ChannelError> {
        self.cmd_tx
            .send(Command::Ping)
            .map_err(|_| ChannelError::Closed)
    }

    /// Next event from either path. `None` once the channel is fully gone.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.events_rx.recv().await
    }

    /// Closes the socket with a normal-closure code and returns the payloads
    /// that never made it out, oldest first. The queue is the caller's to
    /// deal with; an explicit LEAVE beforehand is their choice.
    pub async fn close(self) -> Vec<Value> {
        self.pump.abort();
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Close(reply_tx)).is_err() {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }
}

/// Forwards local deliveries into the unified event stream, dropping the
/// channel's own echo.
async fn run_local_pump(
    mut local_rx: broadcast::Receiver<LocalDelivery>,
    origin: u64,
    events: mpsc::UnboundedSender<ChannelEvent>,
) {
    loop {
        match local_rx.recv().await {
            Ok(delivery) => {
                if delivery.origin == origin {
                    continue;
                }
                if events.send(ChannelEvent::Message(delivery.payload)).is_err() {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Local channel lagged, {} deliveries dropped", n);
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// The socket half of a channel: connect, HELLO, flush the queue, then
/// relay commands out and frames in until either side goes away.
async fn run_socket(
    url: String,
    room: String,
    user: Option<UserProfile>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ChannelEvent>,
) {
    let mut queue: VecDeque<Value> = VecDeque::new();

    // While the handshake is in flight, sends pile into the queue.
    let connect = connect_async(url.clone());
    tokio::pin!(connect);
    let connected = loop {
        tokio::select! {
            result = &mut connect => break result,
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Send(payload)) => queue.push_back(payload),
                Some(Command::Close(reply)) => {
                    let _ = reply.send(queue.into());
                    return;
                }
                Some(Command::Ready(_)) | Some(Command::Leave) | Some(Command::Ping) => {
                    debug!("Control frame before socket open dropped");
                }
                None => return,
            },
        }
    };

    let ws = match connected {
        Ok((ws, _response)) => ws,
        Err(e) => {
            warn!("Socket connect to {} failed: {}", url, e);
            socket_lost(&events, cmd_rx, queue).await;
            return;
        }
    };
    info!("Socket open for room {}", room);
    let (mut sink, mut stream) = ws.split();

    let hello = ClientFrame::Hello {
        room: room.clone(),
        user,
    }
    .encode();
    if sink.send(Message::Text(hello)).await.is_err() {
        socket_lost(&events, cmd_rx, queue).await;
        return;
    }

    // FIFO flush of everything sent before the socket opened.
    while let Some(payload) = queue.pop_front() {
        let frame = ClientFrame::Event {
            room: room.clone(),
            payload: payload.clone(),
        }
        .encode();
        if sink.send(Message::Text(frame)).await.is_err() {
            queue.push_front(payload);
            socket_lost(&events, cmd_rx, queue).await;
            return;
        }
    }

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Send(payload)) => {
                    let frame = ClientFrame::Event {
                        room: room.clone(),
                        payload: payload.clone(),
                    }
                    .encode();
                    if let Err(e) = sink.send(Message::Text(frame)).await {
                        debug!("Socket send failed: {}", e);
                        queue.push_back(payload);
                        break;
                    }
                }
                Some(Command::Ready(ready)) => {
                    let frame = ClientFrame::Ready { ready }.encode();
                    if sink.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                Some(Command::Leave) => {
                    if sink.send(Message::Text(ClientFrame::Leave.encode())).await.is_err() {
                        break;
                    }
                }
                Some(Command::Ping) => {
                    if sink.send(Message::Text(ClientFrame::Ping.encode())).await.is_err() {
                        break;
                    }
                }
                Some(Command::Close(reply)) => {
                    let close = Message::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "".into(),
                    }));
                    let _ = sink.send(close).await;
                    let _ = reply.send(Vec::new());
                    return;
                }
                None => {
                    let _ = sink.close().await;
                    return;
                }
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match translate(&text) {
                        Some(event) => {
                            if events.send(event).is_err() {
                                let _ = sink.close().await;
                                return;
                            }
                        }
                        None => debug!("Dropping unrecognized frame"),
                    }
                }
                Some(Ok(Message::Ping(_))) => {
                    // tungstenite answers pings on its own while we poll.
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!("Socket for room {} closed by server", room);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Socket read error: {}", e);
                    break;
                }
            },
        }
    }

    socket_lost(&events, cmd_rx, queue).await;
}

/// Socket-gone tail: surface Closed once, then keep accepting sends into
/// the queue so close() can hand them back.
async fn socket_lost(
    events: &mpsc::UnboundedSender<ChannelEvent>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    queue: VecDeque<Value>,
) {
    let _ = events.send(ChannelEvent::Closed);
    drain_commands(cmd_rx, queue).await;
}

async fn drain_commands(mut cmd_rx: mpsc::UnboundedReceiver<Command>, mut queue: VecDeque<Value>) {
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            Command::Send(payload) => queue.push_back(payload),
            Command::Close(reply) => {
                let _ = reply.send(queue.into());
                return;
            }
            Command::Ready(_) | Command::Leave | Command::Ping => {}
        }
    }
}

/// Maps an inbound text frame to a channel event. NOTIFY deliveries arrive
/// tagged with the event name itself, so anything the closed frame set does
/// not match is tried as a notice before being dropped.
fn translate(text: &str) -> Option<ChannelEvent> {
    if let Some(frame) = protocol::decode_server_frame(text) {
        return Some(match frame {
            ServerFrame::Ack { room } => ChannelEvent::Ack { room },
            ServerFrame::AckUser => ChannelEvent::AckUser,
            ServerFrame::Snapshot { room, users } => ChannelEvent::Snapshot { room, users },
            ServerFrame::Left { room, user_id } => ChannelEvent::Left { room, user_id },
            ServerFrame::Connected { ts } => ChannelEvent::Connected { ts },
            ServerFrame::Pong => ChannelEvent::Pong,
            ServerFrame::Event { payload, .. } => ChannelEvent::Message(payload),
        });
    }
    protocol::decode_notice(text).map(|(event, payload)| ChannelEvent::Notice { event, payload })
}

enum NoticeCommand {
    Notify {
        to_user_id: String,
        event: String,
        payload: Value,
    },
    Close,
}

/// Room-less socket for identity association and directed notifications.
///
/// Where a [`DuelChannel`] says HELLO, this says HELLO_USER: the relay
/// records the identity without any room membership, NOTIFY frames sent
/// here reach the addressee wherever they are, and notices addressed to
/// this user surface as [`ChannelEvent::Notice`].
pub struct NoticeLink {
    cmd_tx: mpsc::UnboundedSender<NoticeCommand>,
    events_rx: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl NoticeLink {
    pub fn open(url: &str, user: UserProfile) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_notice_socket(url.to_string(), user, cmd_rx, events_tx));
        Self { cmd_tx, events_rx }
    }

    /// Sends `{type: event, payload}` to every connection of `to_user_id`.
    /// Queued while the socket is still opening.
    pub fn notify(
        &self,
        to_user_id: &str,
        event: &str,
        payload: Value,
    ) -> Result<(), ChannelError> {
        self.cmd_tx
            .send(NoticeCommand::Notify {
                to_user_id: to_user_id.to_string(),
                event: event.to_string(),
                payload,
            })
            .map_err(|_| ChannelError::Closed)
    }

    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.events_rx.recv().await
    }

    pub fn close(self) {
        let _ = self.cmd_tx.send(NoticeCommand::Close);
    }
}

async fn run_notice_socket(
    url: String,
    user: UserProfile,
    mut cmd_rx: mpsc::UnboundedReceiver<NoticeCommand>,
    events: mpsc::UnboundedSender<ChannelEvent>,
) {
    let mut pending: VecDeque<ClientFrame> = VecDeque::new();

    let connect = connect_async(url.clone());
    tokio::pin!(connect);
    let connected = loop {
        tokio::select! {
            result = &mut connect => break result,
            cmd = cmd_rx.recv() => match cmd {
                Some(NoticeCommand::Notify { to_user_id, event, payload }) => {
                    pending.push_back(ClientFrame::Notify { to_user_id, event, payload });
                }
                Some(NoticeCommand::Close) | None => return,
            },
        }
    };

    let ws = match connected {
        Ok((ws, _response)) => ws,
        Err(e) => {
            warn!("Notice socket connect to {} failed: {}", url, e);
            let _ = events.send(ChannelEvent::Closed);
            while let Some(cmd) = cmd_rx.recv().await {
                if matches!(cmd, NoticeCommand::Close) {
                    return;
                }
                debug!("Notification dropped, socket never opened");
            }
            return;
        }
    };
    let (mut sink, mut stream) = ws.split();

    let hello = ClientFrame::HelloUser { user }.encode();
    if sink.send(Message::Text(hello)).await.is_err() {
        let _ = events.send(ChannelEvent::Closed);
        return;
    }
    while let Some(frame) = pending.pop_front() {
        if sink.send(Message::Text(frame.encode())).await.is_err() {
            let _ = events.send(ChannelEvent::Closed);
            return;
        }
    }

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(NoticeCommand::Notify { to_user_id, event, payload }) => {
                    let frame = ClientFrame::Notify { to_user_id, event, payload }.encode();
                    if let Err(e) = sink.send(Message::Text(frame)).await {
                        debug!("Notice send failed: {}", e);
                        break;
                    }
                }
                Some(NoticeCommand::Close) => {
                    let close = Message::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "".into(),
                    }));
                    let _ = sink.send(close).await;
                    return;
                }
                None => {
                    let _ = sink.close().await;
                    return;
                }
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match translate(&text) {
                        Some(event) => {
                            if events.send(event).is_err() {
                                let _ = sink.close().await;
                                return;
                            }
                        }
                        None => debug!("Dropping unrecognized frame"),
                    }
                }
                Some(Ok(Message::Ping(_))) => {}
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Notice socket read error: {}", e);
                    break;
                }
            },
        }
    }

    let _ = events.send(ChannelEvent::Closed);
    while let Some(cmd) = cmd_rx.recv().await {
        if matches!(cmd, NoticeCommand::Close) {
            return;
        }
    }
}
