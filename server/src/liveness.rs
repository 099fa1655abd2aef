//! Periodic liveness sweep
//!
//! Browsers and NATs drop WebSocket connections without a close frame, so
//! the relay probes every connection on a fixed interval. A connection that
//! produced no traffic for a full interval gets a ping; one that stayed
//! silent through a second interval, or cannot even take the ping, is
//! pruned and its room is told it left.

use crate::registry::RoomRegistry;
use log::warn;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::interval;

/// Time between sweeps. A vanished peer is reclaimed within two intervals.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Spawns the sweep task for a relay's registry. Runs until aborted.
pub fn spawn_liveness_monitor(registry: Arc<RwLock<RoomRegistry>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(HEARTBEAT_INTERVAL);
        // The first tick completes immediately; skip it so every connection
        // gets a full interval before its first probe.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            sweep(&registry).await;
        }
    })
}

/// One sweep pass: prune connections that stayed silent since the previous
/// pass, probe the rest. A probe that cannot be queued counts as silence.
/// Pruned connections are announced to their rooms exactly like a clean
/// LEAVE, and dropping their mailbox sender makes the connection task close
/// the socket.
pub async fn sweep(registry: &RwLock<RoomRegistry>) {
    let mut reg = registry.write().await;
    for id in reg.sweep_liveness() {
        warn!("Connection {} failed liveness probe, pruning", id);
        let departure = reg.remove_connection(id);
        reg.announce_departure(departure);
    }
}
