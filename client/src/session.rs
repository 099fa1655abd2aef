//! Duel session driver
//!
//! Owns one replica of the duel's [`RoomState`] and keeps it converged with
//! the peer's replica. Every state change goes through the same pure
//! reducer, whether the action was produced here (applied optimistically,
//! then relayed) or arrived from the peer (replayed on receipt). The session
//! also runs the two wall-clock rules the reducer cannot: firing
//! ROUND_TIMEOUT at the round deadline and NEXT_ROUND after the scoring
//! pause. Both peers fire them independently; the reducer's status guards
//! make the second application a no-op.
//!
//! Timers are recomputed from `roundStartedAt` on every wait rather than
//! counted down, so a suspended process resynchronizes instead of drifting.

use crate::transport::{ChannelError, ChannelEvent, DuelChannel};
use duel_shared::duel::{self, DuelAction, DuelStatus, Player, Question, RoomState};
use log::{debug, info};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::Instant;

/// Pause between scoring and the next round.
pub const AUTO_ADVANCE_MS: u64 = 3000;

/// What peers exchange as EVENT payloads: the reducer's actions, plus the
/// WHO introduction that bootstraps the roster after (re)connect.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    /// "I am here, this is my player." Sent on ACK; answered with JOIN.
    Who { player: Player },
    /// A reducer action to replay.
    Action(DuelAction),
}

/// Serializes a peer message for a channel payload.
pub fn encode_peer_message(message: &PeerMessage) -> Value {
    match message {
        PeerMessage::Who { player } => json!({ "type": "WHO", "player": player }),
        PeerMessage::Action(action) => duel::encode_action(action),
    }
}

/// Decodes a channel payload. Payloads this build does not know come back
/// as `None` and are ignored.
pub fn decode_peer_message(payload: &Value) -> Option<PeerMessage> {
    if payload.get("type").and_then(Value::as_str) == Some("WHO") {
        let player = serde_json::from_value(payload.get("player")?.clone()).ok()?;
        return Some(PeerMessage::Who { player });
    }
    duel::decode_action(payload).map(PeerMessage::Action)
}

/// One player's session: a state replica plus the channel to the peer.
///
/// All methods run on the caller's task; the session is single-threaded by
/// construction and needs no locking.
pub struct DuelSession {
    channel: DuelChannel,
    state: RoomState,
    me: Player,
    ready: bool,
    advance_at: Option<u64>,
    epoch: Instant,
}

impl DuelSession {
    /// Builds a session and applies the local player's JOIN. The peer learns
    /// about it through the WHO exchange once the relay ACKs.
    pub fn new(
        channel: DuelChannel,
        room_id: &str,
        best_of: u32,
        questions: Vec<Question>,
        me: Player,
    ) -> Self {
        let mut session = Self {
            channel,
            state: RoomState::new(room_id, best_of, questions),
            me: me.clone(),
            ready: false,
            advance_at: None,
            epoch: Instant::now(),
        };
        session.apply_local(DuelAction::Join { player: me });
        session
    }

    pub fn state(&self) -> &RoomState {
        &self.state
    }

    pub fn player_id(&self) -> &str {
        &self.me.id
    }

    /// This session's player record inside the replica.
    pub fn my_player(&self) -> Option<&Player> {
        self.state.players.get(&self.me.id)
    }

    /// Milliseconds since the session started; the clock domain of every
    /// timestamp in this replica.
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Applies an action locally and relays it to the peer.
    pub async fn dispatch(&mut self, action: DuelAction) -> Result<(), ChannelError> {
        self.apply_local(action.clone());
        self.send_peer(PeerMessage::Action(action)).await
    }

    /// Marks this player ready, on the relay roster and in the duel.
    pub async fn set_ready(&mut self, ready: bool) -> Result<(), ChannelError> {
        self.ready = ready;
        self.channel.set_ready(ready)?;
        self.dispatch(DuelAction::Ready {
            player_id: self.me.id.clone(),
            ready,
        })
        .await
    }

    /// Selects an option for this player. Repeatable until confirmed.
    pub async fn pick(&mut self, option_id: &str) -> Result<(), ChannelError> {
        self.dispatch(DuelAction::Pick {
            player_id: self.me.id.clone(),
            option_id: option_id.to_string(),
        })
        .await
    }

    /// Locks this player's current selection.
    pub async fn confirm(&mut self) -> Result<(), ChannelError> {
        self.dispatch(DuelAction::Confirm {
            player_id: self.me.id.clone(),
        })
        .await
    }

    /// Reacts to one channel event.
    pub async fn handle_event(&mut self, event: ChannelEvent) -> Result<(), ChannelError> {
        match event {
            ChannelEvent::Ack { .. } => self.announce().await?,
            ChannelEvent::Message(payload) => match decode_peer_message(&payload) {
                Some(message) => self.handle_peer(message).await?,
                None => debug!("Ignoring foreign duel payload"),
            },
            ChannelEvent::Left { user_id, .. } => {
                // The relay noticed the peer is gone. Local knowledge only;
                // the peer hears the same from its own relay connection.
                self.apply_local(DuelAction::Leave { player_id: user_id });
            }
            ChannelEvent::Closed => {
                info!("Relay connection lost; continuing on the local path");
            }
            ChannelEvent::Snapshot { .. }
            | ChannelEvent::Connected { .. }
            | ChannelEvent::Pong
            | ChannelEvent::Notice { .. }
            | ChannelEvent::AckUser => {}
        }
        Ok(())
    }

    /// Time until the next timer this session must fire, if any.
    pub fn next_timer(&self) -> Option<Duration> {
        let due = match self.state.status {
            DuelStatus::Active => self.state.round_deadline_ms(),
            DuelStatus::RoundComplete => self.advance_at,
            _ => None,
        }?;
        Some(Duration::from_millis(due.saturating_sub(self.now_ms())))
    }

    /// Fires whichever timer is due. Harmless to call early or twice.
    pub async fn fire_timers(&mut self) -> Result<(), ChannelError> {
        let now = self.now_ms();
        match self.state.status {
            DuelStatus::Active => {
                if self.state.round_deadline_ms().map_or(false, |d| now >= d) {
                    self.dispatch(DuelAction::RoundTimeout).await?;
                }
            }
            DuelStatus::RoundComplete => {
                if self.advance_at.map_or(false, |d| now >= d) {
                    self.dispatch(DuelAction::NextRound).await?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Waits for the next channel event or timer expiry and applies it.
    /// Returns `false` once the channel is exhausted.
    pub async fn step(&mut self) -> Result<bool, ChannelError> {
        let wakeup = self.next_timer();
        tokio::select! {
            event = self.channel.recv() => match event {
                Some(event) => {
                    self.handle_event(event).await?;
                    Ok(true)
                }
                None => Ok(false),
            },
            _ = sleep_for(wakeup), if wakeup.is_some() => {
                self.fire_timers().await?;
                Ok(true)
            }
        }
    }

    /// Clean exit: LEAVE, then close the socket. Returns payloads the socket
    /// never delivered.
    pub async fn close(self) -> Vec<Value> {
        let _ = self.channel.leave();
        self.channel.close().await
    }

    /// The ACK half of peer discovery: introduce this player to the room.
    async fn announce(&mut self) -> Result<(), ChannelError> {
        let player = self.me_snapshot();
        self.send_peer(PeerMessage::Who { player }).await
    }

    /// The local player as the replica currently knows it, so announcements
    /// and replies carry up-to-date ready and score values.
    fn me_snapshot(&self) -> Player {
        self.state
            .players
            .get(&self.me.id)
            .cloned()
            .unwrap_or_else(|| self.me.clone())
    }

    async fn handle_peer(&mut self, message: PeerMessage) -> Result<(), ChannelError> {
        match message {
            PeerMessage::Who { player } => {
                debug!("Peer {} announced itself", player.id);
                self.apply_local(DuelAction::Join { player });
                // Introduce ourselves back so the late side also gets a
                // full roster, including our ready flag if already set.
                self.dispatch(DuelAction::Join {
                    player: self.me_snapshot(),
                })
                .await?;
                if self.ready {
                    self.dispatch(DuelAction::Ready {
                        player_id: self.me.id.clone(),
                        ready: true,
                    })
                    .await?;
                }
            }
            PeerMessage::Action(action) => self.apply_local(action),
        }
        Ok(())
    }

    async fn send_peer(&self, message: PeerMessage) -> Result<(), ChannelError> {
        self.channel.send(encode_peer_message(&message)).await
    }

    fn apply_local(&mut self, action: DuelAction) {
        let before = self.state.status;
        self.state = duel::reduce(&self.state, &action, self.now_ms());
        if self.state.status != before {
            self.on_status_change(before);
        }
    }

    fn on_status_change(&mut self, before: DuelStatus) {
        info!(
            "Duel {}: {:?} -> {:?} (round {})",
            self.state.room_id, before, self.state.status, self.state.round_number
        );
        self.advance_at = match self.state.status {
            DuelStatus::RoundComplete => Some(self.now_ms() + AUTO_ADVANCE_MS),
            _ => None,
        };
        if self.state.status == DuelStatus::Completed {
            for player in self.state.players.values() {
                info!("Final score {}: {}", player.name, player.score);
            }
        }
    }
}

async fn sleep_for(wakeup: Option<Duration>) {
    match wakeup {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}
