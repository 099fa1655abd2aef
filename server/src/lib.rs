//! # Duel Relay Server Library
//!
//! This library implements the relay half of the duel subsystem: a WebSocket
//! endpoint that groups connections into rooms and forwards opaque payloads
//! between room members. The relay never interprets duel payloads; every
//! rule of the duel itself is evaluated by the clients.
//!
//! ## Core Responsibilities
//!
//! ### Room Membership
//! Tracks which connection sits in which room, together with the optional
//! user identity and ready flag attached to it. Membership changes produce
//! roster snapshots so every member always knows who is present.
//!
//! ### Frame Relay
//! EVENT frames are fanned out verbatim to every other member of the named
//! room. The sender is excluded, which is what lets clients treat their own
//! local echo and the relayed copy as the same stream without duplicates.
//!
//! ### Directed Notification
//! NOTIFY frames are routed by user id rather than by room, reaching every
//! connection that identified as that user anywhere on the server.
//!
//! ### Liveness
//! A periodic sweep probes idle connections and prunes those that stay
//! silent, announcing the departure to their room exactly like a clean
//! leave. Without it, half-open sockets would hold roster slots forever.
//!
//! ## Architecture Design
//!
//! Each connection is served by a single task that selects over its inbound
//! socket and an outbound mailbox. All shared state lives in one registry
//! behind an async `RwLock`; each inbound frame takes the write lock once,
//! applies its effects, and queues replies into the affected mailboxes.
//! Delivery happens later on each target's own task, so one slow socket
//! cannot stall the relay.
//!
//! ## Module Organization
//!
//! ### Registry Module (`registry`)
//! The in-memory connection and room bookkeeping: ids, identities, ready
//! flags, liveness marks, and the send/broadcast primitives.
//!
//! ### Network Module (`network`)
//! The TCP accept loop, WebSocket handshake, per-connection task, and the
//! dispatch of every inbound frame type.
//!
//! ### Liveness Module (`liveness`)
//! The sweep interval and the task that runs it against the registry.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use duel_server::liveness::spawn_liveness_monitor;
//! use duel_server::network::RelayServer;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = RelayServer::bind("127.0.0.1:4000").await?;
//!     spawn_liveness_monitor(server.registry());
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod liveness;
pub mod network;
pub mod registry;
