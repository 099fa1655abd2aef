//! Same-device fan-out
//!
//! Channels on the same device skip the relay for each other: a publish
//! lands instantly on every other subscriber of the same room. The bus is
//! one shared instance per process, handed to each channel on open.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tokio::sync::Mutex;

/// Capacity of one room's delivery buffer. A subscriber that falls this far
/// behind loses the oldest deliveries; the local path is best-effort.
const ROOM_BUFFER: usize = 64;

/// One delivery on the local path, stamped with its publisher so receivers
/// can drop their own echo.
#[derive(Debug, Clone)]
pub struct LocalDelivery {
    pub origin: u64,
    pub payload: Value,
}

/// Per-room broadcast registry for the local delivery path.
///
/// Rooms are created lazily on first subscribe and forgotten as soon as a
/// publish finds no remaining listeners, so an abandoned room does not keep
/// its buffer alive.
pub struct LocalBus {
    rooms: Mutex<HashMap<String, broadcast::Sender<LocalDelivery>>>,
    next_origin: AtomicU64,
}

impl LocalBus {
    pub fn new() -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            next_origin: AtomicU64::new(1),
        }
    }

    /// A fresh publisher id, unique within this bus.
    pub fn next_origin(&self) -> u64 {
        self.next_origin.fetch_add(1, Ordering::Relaxed)
    }

    /// Subscribes to a room, creating its channel on first use.
    pub async fn subscribe(&self, room: &str) -> broadcast::Receiver<LocalDelivery> {
        let mut rooms = self.rooms.lock().await;
        rooms
            .entry(room.to_string())
            .or_insert_with(|| broadcast::channel(ROOM_BUFFER).0)
            .subscribe()
    }

    /// Best-effort publish to every subscriber of `room`, including the
    /// publisher's own receiver (receivers filter by origin).
    pub async fn publish(&self, room: &str, origin: u64, payload: Value) {
        let mut rooms = self.rooms.lock().await;
        let delivered = match rooms.get(room) {
            Some(sender) => sender.send(LocalDelivery { origin, payload }).is_ok(),
            None => return,
        };
        if !delivered {
            rooms.remove(room);
        }
    }

    /// Number of rooms currently tracked.
    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.len()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::broadcast::error::TryRecvError;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let bus = LocalBus::new();
        let mut rx_a = bus.subscribe("alpha").await;
        let mut rx_b = bus.subscribe("alpha").await;

        bus.publish("alpha", 7, json!({"n": 1})).await;

        for rx in [&mut rx_a, &mut rx_b] {
            let delivery = rx.recv().await.unwrap();
            assert_eq!(delivery.origin, 7);
            assert_eq!(delivery.payload, json!({"n": 1}));
        }
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let bus = LocalBus::new();
        let mut rx_alpha = bus.subscribe("alpha").await;
        let mut rx_beta = bus.subscribe("beta").await;

        bus.publish("alpha", 1, json!("only alpha")).await;

        assert!(rx_alpha.try_recv().is_ok());
        assert!(matches!(rx_beta.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_publish_without_room_is_a_noop() {
        let bus = LocalBus::new();
        bus.publish("nowhere", 1, json!(0)).await;
        assert_eq!(bus.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_abandoned_room_is_forgotten() {
        let bus = LocalBus::new();
        let rx = bus.subscribe("alpha").await;
        assert_eq!(bus.room_count().await, 1);
        drop(rx);

        bus.publish("alpha", 1, json!(0)).await;

        assert_eq!(bus.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_traffic() {
        let bus = LocalBus::new();
        let _keep_alive = bus.subscribe("alpha").await;
        bus.publish("alpha", 1, json!("early")).await;

        let mut late = bus.subscribe("alpha").await;
        assert!(matches!(late.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_origins_are_unique() {
        let bus = LocalBus::new();
        let a = bus.next_origin();
        let b = bus.next_origin();
        assert_ne!(a, b);
    }
}
