//! Room membership and connection bookkeeping for the relay
//!
//! This module owns the server-side view of every live connection:
//! - connection records (outbound sender, room, user identity, ready flag)
//! - the room index mapping room ids to member connections
//! - room-scoped broadcast and server-wide user-directed delivery
//! - LEFT and roster fan-out when a member drops
//! - the alive flags the liveness sweep works from
//!
//! The registry is plain data behind the relay's lock; it never touches a
//! socket itself. Delivery goes through each connection's bounded outbound
//! mailbox and never blocks or buffers past [`MAILBOX_CAPACITY`]: a
//! connection that cannot take a frame, whether its task is gone or its
//! mailbox is jammed, is pruned on the spot and announced to its room like
//! any other departure.

use duel_shared::protocol::{RoomUser, ServerFrame, UserProfile};
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::Message;

/// Server-assigned identifier of one WebSocket connection.
pub type ConnId = u64;

/// Outbound frames buffered per connection before the relay gives up on it.
///
/// Fan-out never blocks on one slow peer: a member that falls this far
/// behind a burst is pruned like a dead connection instead of buffering
/// more.
pub const MAILBOX_CAPACITY: usize = 256;

/// What a connection left behind, for LEFT/SNAPSHOT notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub room: String,
    pub user: Option<UserProfile>,
}

/// One live connection and its metadata.
///
/// The room field is a back-reference only; membership itself lives in the
/// registry's room index so the two can never disagree for long.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnId,
    /// Outbound path to this connection's socket task.
    pub sender: mpsc::Sender<Message>,
    pub room: Option<String>,
    pub user: Option<UserProfile>,
    pub ready: bool,
    /// Cleared by each liveness sweep, re-armed by inbound traffic.
    pub alive: bool,
}

impl Connection {
    /// Hands a frame to this connection's socket task without blocking.
    ///
    /// `false` means the mailbox is full or its task is gone; either way the
    /// connection cannot take frames any more and should be pruned.
    fn queue(&self, msg: Message) -> bool {
        match self.sender.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("Mailbox of connection {} is full", self.id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Mailbox of connection {} is gone", self.id);
                false
            }
        }
    }
}

/// All connections and rooms of one relay instance.
///
/// Owned by the server and shared behind a lock; there is no global state.
/// Rooms are created lazily on the first join and deleted as soon as their
/// last member leaves, so a room id lookup after teardown finds nothing.
pub struct RoomRegistry {
    connections: HashMap<ConnId, Connection>,
    rooms: HashMap<String, HashSet<ConnId>>,
    next_conn_id: ConnId,
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            connections: HashMap::new(),
            rooms: HashMap::new(),
            next_conn_id: 1,
        }
    }

    /// Registers a freshly accepted connection and returns its id.
    pub fn add_connection(&mut self, sender: mpsc::Sender<Message>) -> ConnId {
        let id = self.next_conn_id;
        self.next_conn_id += 1;
        self.connections.insert(
            id,
            Connection {
                id,
                sender,
                room: None,
                user: None,
                ready: false,
                alive: true,
            },
        );
        info!("Connection {} registered", id);
        id
    }

    /// Drops a connection entirely, leaving its room first.
    ///
    /// Returns the departure record if the connection was in a room, for the
    /// caller to fan out LEFT and SNAPSHOT. Dropping the stored sender ends
    /// the connection's socket task, which closes the socket.
    pub fn remove_connection(&mut self, id: ConnId) -> Option<Departure> {
        let departure = self.leave(id);
        if self.connections.remove(&id).is_some() {
            info!("Connection {} removed", id);
        }
        departure
    }

    /// Puts a connection into `room`, creating the room lazily.
    ///
    /// Idempotent for the same room. A connection sits in at most one room,
    /// so joining another room moves it; the vacated room id is returned so
    /// the caller can refresh that roster. A carried user identity replaces
    /// the recorded one; joining always resets the ready flag.
    pub fn join(&mut self, id: ConnId, room: &str, user: Option<UserProfile>) -> Option<String> {
        let prior = {
            let conn = self.connections.get_mut(&id)?;
            conn.room.as_deref().filter(|r| *r != room).map(String::from)
        };
        if let Some(prior_room) = &prior {
            self.drop_membership(id, prior_room);
        }

        if let Some(conn) = self.connections.get_mut(&id) {
            conn.room = Some(room.to_string());
            conn.ready = false;
            if user.is_some() {
                conn.user = user;
            }
            self.rooms.entry(room.to_string()).or_default().insert(id);
            debug!("Connection {} joined room {}", id, room);
        }
        prior
    }

    /// Takes a connection out of its room; deletes the room when it empties.
    ///
    /// Returns what was left behind, or `None` if the connection had no room.
    /// The user identity survives, only room and ready flag are cleared.
    pub fn leave(&mut self, id: ConnId) -> Option<Departure> {
        let conn = self.connections.get_mut(&id)?;
        let room = conn.room.take()?;
        conn.ready = false;
        let user = conn.user.clone();
        self.drop_membership(id, &room);
        debug!("Connection {} left room {}", id, room);
        Some(Departure { room, user })
    }

    /// Records a user identity without touching room membership.
    pub fn set_user(&mut self, id: ConnId, user: UserProfile) {
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.user = Some(user);
        }
    }

    /// Sets the ready flag and returns the connection's room for the roster
    /// broadcast, or `None` when the connection is unknown or roomless.
    pub fn set_ready(&mut self, id: ConnId, ready: bool) -> Option<String> {
        let conn = self.connections.get_mut(&id)?;
        let room = conn.room.clone()?;
        conn.ready = ready;
        Some(room)
    }

    /// Re-arms the alive flag, called for every inbound frame and pong.
    pub fn mark_alive(&mut self, id: ConnId) {
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.alive = true;
        }
    }

    /// One liveness pass: connections whose flag is still cleared from the
    /// previous pass are returned as dead; everyone else has the flag
    /// cleared and gets a protocol-level ping to answer before the next
    /// pass. A connection whose mailbox cannot even take the ping is
    /// returned with the dead ones.
    pub fn sweep_liveness(&mut self) -> Vec<ConnId> {
        let mut dead = Vec::new();
        for conn in self.connections.values_mut() {
            if conn.alive {
                conn.alive = false;
                if !conn.queue(Message::Ping(Vec::new())) {
                    dead.push(conn.id);
                }
            } else {
                dead.push(conn.id);
            }
        }
        dead
    }

    /// Sends a text frame to one connection. A connection whose mailbox
    /// rejects the frame is pruned.
    pub fn send_to(&mut self, id: ConnId, text: &str) {
        let queued = match self.connections.get(&id) {
            Some(conn) => conn.queue(Message::Text(text.to_string())),
            None => return,
        };
        if !queued {
            self.prune_stalled(vec![id]);
        }
    }

    /// Sends a text frame to every member of `room` except `exclude`.
    ///
    /// A broadcast never blocks and never aborts early: members whose
    /// mailbox rejects the frame are pruned afterwards and their departure
    /// announced, so one stalled peer cannot hold the room back.
    pub fn broadcast(&mut self, room: &str, text: &str, exclude: Option<ConnId>) {
        let stalled = self.fan_out(room, text, exclude);
        self.prune_stalled(stalled);
    }

    /// Delivers a text frame to every connection recorded under `user_id`,
    /// regardless of room. Returns how many connections were reached.
    pub fn send_to_user(&mut self, user_id: &str, text: &str) -> usize {
        let mut delivered = 0;
        let mut stalled = Vec::new();
        for conn in self.connections.values() {
            let matches = conn.user.as_ref().map_or(false, |u| u.id == user_id);
            if !matches {
                continue;
            }
            if conn.queue(Message::Text(text.to_string())) {
                delivered += 1;
            } else {
                stalled.push(conn.id);
            }
        }
        self.prune_stalled(stalled);
        delivered
    }

    /// Fans LEFT and the shrunk roster out to a vacated room.
    ///
    /// Members whose mailbox rejects the news are pruned in turn, since the
    /// announcement of one departure may surface the next.
    pub fn announce_departure(&mut self, departure: Option<Departure>) {
        let stalled = self.queue_departure(departure);
        self.prune_stalled(stalled);
    }

    /// Current presence roster of `room` as a SNAPSHOT frame. Connections
    /// without a user identity relay fine but stay off the roster.
    pub fn snapshot(&self, room: &str) -> ServerFrame {
        let mut users: Vec<RoomUser> = self
            .rooms
            .get(room)
            .into_iter()
            .flatten()
            .filter_map(|id| self.connections.get(id))
            .filter_map(|conn| {
                conn.user.as_ref().map(|user| RoomUser {
                    id: user.id.clone(),
                    name: user.name.clone(),
                    ready: conn.ready,
                })
            })
            .collect();
        users.sort_by(|a, b| a.id.cmp(&b.id));
        ServerFrame::Snapshot {
            room: room.to_string(),
            users,
        }
    }

    pub fn has_room(&self, room: &str) -> bool {
        self.rooms.contains_key(room)
    }

    pub fn room_size(&self, room: &str) -> usize {
        self.rooms.get(room).map_or(0, HashSet::len)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    fn drop_membership(&mut self, id: ConnId, room: &str) {
        if let Some(members) = self.rooms.get_mut(room) {
            members.remove(&id);
            if members.is_empty() {
                self.rooms.remove(room);
                debug!("Room {} emptied and deleted", room);
            }
        }
    }

    /// Queues `text` for every member of `room` except `exclude` and returns
    /// the members whose mailbox would not take it.
    fn fan_out(&self, room: &str, text: &str, exclude: Option<ConnId>) -> Vec<ConnId> {
        let mut stalled = Vec::new();
        let Some(members) = self.rooms.get(room) else {
            return stalled;
        };
        for id in members {
            if Some(*id) == exclude {
                continue;
            }
            let Some(conn) = self.connections.get(id) else {
                continue;
            };
            if !conn.queue(Message::Text(text.to_string())) {
                stalled.push(*id);
            }
        }
        stalled
    }

    /// Queues the LEFT and SNAPSHOT frames for a departure and returns the
    /// recipients whose mailbox would not take them.
    fn queue_departure(&self, departure: Option<Departure>) -> Vec<ConnId> {
        let Some(departure) = departure else {
            return Vec::new();
        };
        let mut stalled = Vec::new();
        if let Some(user) = &departure.user {
            let left = ServerFrame::Left {
                room: departure.room.clone(),
                user_id: user.id.clone(),
            };
            stalled.extend(self.fan_out(&departure.room, &left.encode(), None));
        }
        let snapshot = self.snapshot(&departure.room).encode();
        stalled.extend(self.fan_out(&departure.room, &snapshot, None));
        stalled
    }

    /// Removes connections whose mailbox rejected a frame and tells their
    /// rooms. Announcing one departure queues more frames, so pruning can
    /// surface further stalled members; the loop runs until delivery
    /// settles.
    fn prune_stalled(&mut self, mut stalled: Vec<ConnId>) {
        while let Some(id) = stalled.pop() {
            if !self.connections.contains_key(&id) {
                continue;
            }
            warn!("Connection {} stopped draining its mailbox, pruning", id);
            let departure = self.remove_connection(id);
            stalled.extend(self.queue_departure(departure));
        }
    }
}
