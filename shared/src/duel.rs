//! Duel session state machine
//!
//! A duel is replicated, not arbitrated: each client owns a [`RoomState`] and
//! feeds every action through the same pure [`reduce`] function, whether the
//! action came from the local player or arrived over the relay. Both replicas
//! converge because the transitions are deterministic and the time-sensitive
//! ones (CONFIRM, ROUND_TIMEOUT, NEXT_ROUND) are idempotent, so duplicated or
//! reordered delivery cannot corrupt a round.
//!
//! Lifecycle: `Pending` until at least two connected players are all ready,
//! then `Active` rounds alternate with `RoundComplete` scoring pauses until
//! the round count reaches `best_of`, which ends in `Completed`.
//!
//! The clock is an explicit `now_ms` argument (milliseconds on the caller's
//! monotonic clock) so the reducer stays a pure function and tests can pin
//! time exactly. `round_started_at` lives in the same clock domain; a
//! player's `answered_at_ms` is the offset from round start.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Points for the fastest correct answer of a round.
pub const POINTS_FIRST: u32 = 3;
/// Points for the second correct answer of a round.
pub const POINTS_SECOND: u32 = 2;

/// Where a duel is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuelStatus {
    /// Waiting for at least two connected players to all toggle ready.
    Pending,
    /// A round timer is running; picks and confirms are accepted.
    Active,
    /// Scoring for the round is done; waiting for the advance delay.
    RoundComplete,
    /// Terminal. The round count reached `best_of`.
    Completed,
}

/// One participant, keyed by id in [`RoomState::players`].
///
/// Players are never deleted, only marked disconnected, so scores survive a
/// dropped socket and a rejoin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    pub id: String,
    pub name: String,
    pub ready: bool,
    pub score: u32,
    pub selected_option_id: Option<String>,
    pub answered_at_ms: Option<u64>,
    pub is_connected: bool,
}

impl Player {
    /// Fresh player: not ready, no score, connected.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ready: false,
            score: 0,
            selected_option_id: None,
            answered_at_ms: None,
            is_connected: true,
        }
    }
}

/// One answer option of a question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub id: String,
    pub text: String,
}

/// An immutable quiz question played for exactly one round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub id: String,
    pub stem: String,
    pub options: Vec<QuestionOption>,
    pub correct_option_id: String,
    pub time_limit_seconds: u32,
}

/// The replicated duel state.
///
/// `questions` is the rotation both peers agreed on before the duel; round N
/// plays entry `(N - 1) mod len`. The peers must construct their states from
/// the same list or they will score different questions, which the relay by
/// design does not detect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomState {
    pub room_id: String,
    pub status: DuelStatus,
    pub best_of: u32,
    pub round_number: u32,
    pub round_started_at: Option<u64>,
    pub question: Option<Question>,
    pub correct_option_id: Option<String>,
    pub players: BTreeMap<String, Player>,
    pub questions: Vec<Question>,
}

impl RoomState {
    /// New duel in `Pending` with no players yet.
    pub fn new(room_id: impl Into<String>, best_of: u32, questions: Vec<Question>) -> Self {
        Self {
            room_id: room_id.into(),
            status: DuelStatus::Pending,
            best_of,
            round_number: 0,
            round_started_at: None,
            question: None,
            correct_option_id: None,
            players: BTreeMap::new(),
            questions,
        }
    }

    /// Absolute deadline of the running round on the local clock, if a round
    /// with a timed question is running.
    pub fn round_deadline_ms(&self) -> Option<u64> {
        let started = self.round_started_at?;
        let limit_ms = u64::from(self.question.as_ref()?.time_limit_seconds) * 1000;
        Some(started + limit_ms)
    }
}

/// Everything that can change a [`RoomState`].
///
/// Actions are serialized as EVENT payloads on the relay; the tags below are
/// the wire contract between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DuelAction {
    /// Upsert a player, preserving score and ready flag on rejoin.
    Join { player: Player },
    /// Toggle a ready flag. When all connected players (at least two) are
    /// ready in `Pending`, round one starts.
    #[serde(rename_all = "camelCase")]
    Ready { player_id: String, ready: bool },
    /// Select an option. Repeatable; last write wins until the answer locks.
    #[serde(rename_all = "camelCase")]
    Pick { player_id: String, option_id: String },
    /// Lock the current selection and record the answer time.
    #[serde(rename_all = "camelCase")]
    Confirm { player_id: String },
    /// Deadline reached: every unanswered player answers at the deadline.
    RoundTimeout,
    /// Leave the scoring pause for the next round, or finish the duel.
    NextRound,
    /// A player's connection went away. Keeps the player and their score.
    #[serde(rename_all = "camelCase")]
    Leave { player_id: String },
}

/// Applies one action to a state and returns the successor state.
///
/// Unknown player ids and actions invalid for the current status leave the
/// state unchanged. This is the single entry point for both locally produced
/// and relayed actions; nothing else may mutate a [`RoomState`].
pub fn reduce(state: &RoomState, action: &DuelAction, now_ms: u64) -> RoomState {
    let mut next = state.clone();
    match action {
        DuelAction::Join { player } => apply_join(&mut next, player),
        DuelAction::Ready { player_id, ready } => apply_ready(&mut next, player_id, *ready, now_ms),
        DuelAction::Pick {
            player_id,
            option_id,
        } => apply_pick(&mut next, player_id, option_id),
        DuelAction::Confirm { player_id } => apply_confirm(&mut next, player_id, now_ms),
        DuelAction::RoundTimeout => apply_round_timeout(&mut next, now_ms),
        DuelAction::NextRound => apply_next_round(&mut next, now_ms),
        DuelAction::Leave { player_id } => apply_leave(&mut next, player_id),
    }
    next
}

/// Serializes an action for an EVENT payload.
pub fn encode_action(action: &DuelAction) -> Value {
    serde_json::to_value(action).expect("action serialization cannot fail")
}

/// Decodes an EVENT payload back into an action. Foreign payloads are `None`.
pub fn decode_action(payload: &Value) -> Option<DuelAction> {
    serde_json::from_value(payload.clone()).ok()
}

fn apply_join(state: &mut RoomState, player: &Player) {
    match state.players.get_mut(&player.id) {
        Some(existing) => {
            // Rejoin: identity may be refreshed, progress is kept.
            existing.name = player.name.clone();
            existing.is_connected = true;
        }
        None => {
            let mut player = player.clone();
            player.is_connected = true;
            state.players.insert(player.id.clone(), player);
        }
    }
}

fn apply_ready(state: &mut RoomState, player_id: &str, ready: bool, now_ms: u64) {
    let Some(player) = state.players.get_mut(player_id) else {
        return;
    };
    player.ready = ready;

    if state.status != DuelStatus::Pending {
        return;
    }
    let connected: Vec<&Player> = state.players.values().filter(|p| p.is_connected).collect();
    if connected.len() >= 2 && connected.iter().all(|p| p.ready) {
        state.status = DuelStatus::Active;
        state.round_number = 1;
        start_round(state, now_ms);
    }
}

fn apply_pick(state: &mut RoomState, player_id: &str, option_id: &str) {
    if state.status != DuelStatus::Active {
        return;
    }
    let Some(player) = state.players.get_mut(player_id) else {
        return;
    };
    // Locked answers stay locked for the round.
    if player.answered_at_ms.is_some() {
        return;
    }
    player.selected_option_id = Some(option_id.to_string());
}

fn apply_confirm(state: &mut RoomState, player_id: &str, now_ms: u64) {
    if state.status != DuelStatus::Active {
        return;
    }
    let Some(started) = state.round_started_at else {
        return;
    };
    let Some(player) = state.players.get_mut(player_id) else {
        return;
    };
    if player.selected_option_id.is_none() || player.answered_at_ms.is_some() {
        return;
    }
    player.answered_at_ms = Some(now_ms.saturating_sub(started));
    finish_round_if_all_answered(state);
}

fn apply_round_timeout(state: &mut RoomState, now_ms: u64) {
    if state.status != DuelStatus::Active {
        return;
    }
    let Some(started) = state.round_started_at else {
        return;
    };
    let at_deadline = now_ms.saturating_sub(started);
    for player in state.players.values_mut() {
        if player.answered_at_ms.is_none() {
            player.answered_at_ms = Some(at_deadline);
        }
    }
    finish_round_if_all_answered(state);
}

fn apply_next_round(state: &mut RoomState, now_ms: u64) {
    if state.status != DuelStatus::RoundComplete {
        return;
    }
    if state.round_number + 1 > state.best_of {
        state.status = DuelStatus::Completed;
        return;
    }
    state.round_number += 1;
    state.status = DuelStatus::Active;
    start_round(state, now_ms);
}

fn apply_leave(state: &mut RoomState, player_id: &str) {
    if let Some(player) = state.players.get_mut(player_id) {
        player.is_connected = false;
    }
}

/// Enters the round at `state.round_number`: next question from the
/// rotation, fresh selections, timer origin at `now_ms`.
fn start_round(state: &mut RoomState, now_ms: u64) {
    let index = state.round_number.saturating_sub(1) as usize;
    state.question = if state.questions.is_empty() {
        None
    } else {
        Some(state.questions[index % state.questions.len()].clone())
    };
    state.correct_option_id = state
        .question
        .as_ref()
        .map(|q| q.correct_option_id.clone());
    state.round_started_at = Some(now_ms);
    for player in state.players.values_mut() {
        player.selected_option_id = None;
        player.answered_at_ms = None;
    }
}

fn finish_round_if_all_answered(state: &mut RoomState) {
    if state.players.is_empty() {
        return;
    }
    if state.players.values().all(|p| p.answered_at_ms.is_some()) {
        apply_round_scores(state);
        state.status = DuelStatus::RoundComplete;
    }
}

/// Awards the round: correct answers ranked by ascending answer time get
/// 3 then 2 points. Equal times rank by player id so every replica agrees.
fn apply_round_scores(state: &mut RoomState) {
    let Some(correct) = state.correct_option_id.clone() else {
        return;
    };
    let mut ranked: Vec<(u64, String)> = state
        .players
        .values()
        .filter(|p| p.selected_option_id.as_deref() == Some(correct.as_str()))
        .filter_map(|p| p.answered_at_ms.map(|at| (at, p.id.clone())))
        .collect();
    ranked.sort();

    for (rank, (_, id)) in ranked.iter().enumerate() {
        let points = match rank {
            0 => POINTS_FIRST,
            1 => POINTS_SECOND,
            _ => 0,
        };
        if points > 0 {
            if let Some(player) = state.players.get_mut(id) {
                player.score += points;
            }
        }
    }
}
