//! # Duel Client Library
//!
//! This library implements the client half of the duel subsystem: the
//! dual-channel transport that moves payloads between peers and the session
//! layer that keeps both players' view of a live 1v1 duel converged.
//!
//! ## Architecture Overview
//!
//! ### Replicated State, No Arbiter
//! Each player runs their own copy of the duel state. Every action, local or
//! remote, passes through one pure reducer, so two replicas that see the
//! same actions end up in the same state. The relay only moves bytes; it
//! never rules on the duel.
//!
//! ### Optimistic Local Apply
//! A player's own action is applied to their replica immediately and relayed
//! afterwards. The peer replays it on receipt. Idempotent transitions make
//! this safe even when deliveries arrive late or twice.
//!
//! ### Two Delivery Paths
//! Payloads travel over an in-process bus (instant, for peers on the same
//! device) and over a WebSocket to the relay (for everyone else). Consumers
//! see a single unified stream and never care which path delivered.
//!
//! ## Module Organization
//!
//! ### Local Bus Module (`local_bus`)
//! The same-device fan-out: per-room broadcast channels with
//! publisher-stamped deliveries so receivers can drop their own echo.
//!
//! ### Transport Module (`transport`)
//! `DuelChannel` (HELLO handshake, send queue with FIFO flush-on-open, the
//! unified event stream) and `NoticeLink` (identity association and
//! directed notifications).
//!
//! ### Session Module (`session`)
//! `DuelSession`: owns a state replica, dispatches and replays actions,
//! answers WHO peer discovery, and fires the round deadline and the
//! auto-advance delay.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use duel_client::local_bus::LocalBus;
//! use duel_client::session::DuelSession;
//! use duel_client::transport::DuelChannel;
//! use duel_shared::duel::{DuelStatus, Player, Question};
//! use duel_shared::protocol::UserProfile;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // The question rotation comes from the quiz backend, out of band.
//!     let questions: Vec<Question> = Vec::new();
//!
//!     let bus = Arc::new(LocalBus::new());
//!     let user = UserProfile {
//!         id: "u1".to_string(),
//!         name: "Ada".to_string(),
//!     };
//!     let channel = DuelChannel::open(
//!         Arc::clone(&bus),
//!         "ws://127.0.0.1:4000",
//!         "room-1",
//!         Some(user),
//!     )
//!     .await;
//!
//!     let mut session =
//!         DuelSession::new(channel, "room-1", 3, questions, Player::new("u1", "Ada"));
//!     session.set_ready(true).await?;
//!     while session.state().status != DuelStatus::Completed {
//!         if !session.step().await? {
//!             break;
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod local_bus;
pub mod session;
pub mod transport;
