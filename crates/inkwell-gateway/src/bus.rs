use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tracing::warn;
use uuid::Uuid;

use inkwell_types::events::BusEvent;

/// Default number of ordered dispatch shards.
pub const DEFAULT_SHARDS: usize = 8;

/// Typed publish side of the event bus.
///
/// Every event is routed to one shard by its ordering key, so all events of
/// one container travel through the same FIFO queue. Shards are independent;
/// there is no ordering across containers.
#[derive(Clone)]
pub struct EventBus {
    shards: Arc<[mpsc::UnboundedSender<BusEvent>]>,
}

/// Receiving end of one shard.
///
/// The receiver sits behind a mutex so a restarted worker can pick the queue
/// back up; events published while no worker runs stay queued.
#[derive(Clone)]
pub struct ShardSubscription {
    pub index: usize,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<BusEvent>>>,
}

impl EventBus {
    /// Creates the bus together with every shard subscription. Subscriptions
    /// exist before any publisher can hold the bus.
    pub fn new(shards: usize) -> (Self, Vec<ShardSubscription>) {
        let shards = shards.max(1);
        let mut senders = Vec::with_capacity(shards);
        let mut subscriptions = Vec::with_capacity(shards);

        for index in 0..shards {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            subscriptions.push(ShardSubscription { index, rx: Arc::new(Mutex::new(rx)) });
        }

        (Self { shards: senders.into() }, subscriptions)
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_for(&self, key: Uuid) -> usize {
        (key.as_u128() % self.shards.len() as u128) as usize
    }

    /// Fire-and-forget. Never blocks and never fails the caller.
    pub fn publish(&self, event: BusEvent) {
        let shard = self.shard_for(event.ordering_key());
        if let Err(e) = self.shards[shard].send(event) {
            warn!("Event bus shard {} is closed, dropping {:?}", shard, e.0.kind());
        }
    }
}

impl ShardSubscription {
    /// Next event in publish order, `None` once every publisher is gone.
    pub async fn recv(&self) -> Option<BusEvent> {
        self.rx.lock().await.recv().await
    }

    /// Drains whatever is queued right now without waiting.
    pub async fn drain(&self) -> Vec<BusEvent> {
        let mut rx = self.rx.lock().await;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inkwell_types::models::ContainerId;

    fn read(container: ContainerId, position: u64) -> BusEvent {
        BusEvent::ReadAdvanced { user_id: Uuid::nil(), container, position }
    }

    #[tokio::test]
    async fn same_container_lands_on_one_shard_in_order() {
        let (bus, subs) = EventBus::new(4);
        let container = ContainerId::Channel(Uuid::new_v4());
        for position in 1..=5 {
            bus.publish(read(container, position));
        }

        let shard = bus.shard_for(container.id());
        let events = subs[shard].drain().await;
        let positions: Vec<u64> = events
            .iter()
            .map(|e| match e {
                BusEvent::ReadAdvanced { position, .. } => *position,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(positions, vec![1, 2, 3, 4, 5]);

        for (index, sub) in subs.iter().enumerate() {
            if index != shard {
                assert!(sub.drain().await.is_empty());
            }
        }
    }

    #[tokio::test]
    async fn publish_without_worker_keeps_events_queued() {
        let (bus, subs) = EventBus::new(1);
        bus.publish(read(ContainerId::Conversation(Uuid::new_v4()), 1));
        assert!(subs[0].recv().await.is_some());
    }

    #[test]
    fn zero_shards_is_clamped() {
        let (bus, subs) = EventBus::new(0);
        assert_eq!(bus.shard_count(), 1);
        assert_eq!(subs.len(), 1);
    }
}
