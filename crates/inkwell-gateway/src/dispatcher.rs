use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use inkwell_db::Database;
use inkwell_directory::{SharedIdentity, display_identity};
use inkwell_types::events::{
    BusEvent, MembershipChange, MessageView, PushBody, PushEvent, ReactionChange, ReadAdvancedPayload,
};
use inkwell_types::models::ContainerId;

use crate::bus::ShardSubscription;
use crate::registry::{ConnectionRegistry, Frame};

/// Turns bus events into pushes for every live connection of every affected
/// user.
///
/// Stateless: users without a live connection are skipped and pick up the
/// authoritative state on their next fetch. No per-user backlog is kept.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    registry: ConnectionRegistry,
    db: Arc<Database>,
    identity: SharedIdentity,
}

impl Dispatcher {
    pub fn new(registry: ConnectionRegistry, db: Arc<Database>, identity: SharedIdentity) -> Self {
        Self { inner: Arc::new(DispatcherInner { registry, db, identity }) }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    /// Spawns one long-lived worker per shard. Each worker handles its queue
    /// one event at a time, which keeps per-container publish order. A worker
    /// that panics is restarted on the same queue.
    pub fn start(&self, subscriptions: Vec<ShardSubscription>) -> Vec<JoinHandle<()>> {
        info!("Starting broadcast dispatcher with {} shards", subscriptions.len());
        subscriptions
            .into_iter()
            .map(|sub| {
                let dispatcher = self.clone();
                tokio::spawn(async move { dispatcher.supervise(sub).await })
            })
            .collect()
    }

    async fn supervise(self, sub: ShardSubscription) {
        loop {
            let worker = tokio::spawn(self.clone().run_shard(sub.clone()));
            match worker.await {
                Ok(()) => {
                    debug!("Dispatch shard {} closed", sub.index);
                    return;
                }
                Err(e) if e.is_panic() => {
                    error!("Dispatch shard {} panicked, restarting: {}", sub.index, e);
                }
                Err(e) => {
                    warn!("Dispatch shard {} cancelled: {}", sub.index, e);
                    return;
                }
            }
        }
    }

    async fn run_shard(self, sub: ShardSubscription) {
        while let Some(event) = sub.recv().await {
            match self.dispatch(&event).await {
                Ok(delivered) => {
                    debug!("Pushed {:?} to {} connections", event.kind(), delivered)
                }
                Err(e) => warn!("Dropping push for {:?}: {:#}", event.kind(), e),
            }
        }
    }

    /// Renders one event and fans it out. Returns the number of connections
    /// that accepted the frame.
    pub async fn dispatch(&self, event: &BusEvent) -> Result<usize> {
        let audience = self.audience(event).await?;
        if audience.is_empty() {
            return Ok(0);
        }

        let push = self.render(event).await;
        let frame: Frame = serde_json::to_string(&push).context("serializing push")?.into();

        let mut delivered = 0;
        for user_id in audience {
            delivered += self.inner.registry.send_to_user(user_id, &frame).await;
        }
        Ok(delivered)
    }

    /// Users affected by an event.
    pub async fn audience(&self, event: &BusEvent) -> Result<Vec<Uuid>> {
        match event {
            BusEvent::ReadAdvanced { user_id, .. } => Ok(vec![*user_id]),
            BusEvent::MessageAppended { message } | BusEvent::MessageDeleted { message, .. } => {
                self.members(message.container).await
            }
            BusEvent::ReactionChanged { container: Some(container), .. } => self.members(*container).await,
            BusEvent::ReactionChanged { container: None, user_id, .. } => Ok(vec![*user_id]),
            BusEvent::MembershipChanged { group_id, user_id, .. } => {
                let db = self.inner.db.clone();
                let group_id = *group_id;
                let mut users: Vec<Uuid> = tokio::task::spawn_blocking(move || db.group_members(group_id))
                    .await
                    .context("spawn_blocking join error")??
                    .into_iter()
                    .map(|m| m.user_id)
                    .collect();
                // A removed user is no longer a member but still hears about it.
                if !users.contains(user_id) {
                    users.push(*user_id);
                }
                Ok(users)
            }
        }
    }

    async fn members(&self, container: ContainerId) -> Result<Vec<Uuid>> {
        let db = self.inner.db.clone();
        Ok(tokio::task::spawn_blocking(move || db.container_members(container))
            .await
            .context("spawn_blocking join error")??)
    }

    /// Wire payload for an event. Message payloads use the same renderer as
    /// the pull path.
    pub async fn render(&self, event: &BusEvent) -> PushEvent {
        match event {
            BusEvent::MessageAppended { message } => {
                let author = display_identity(self.inner.identity.as_ref(), message.author_id).await;
                PushEvent {
                    container_id: Some(message.container),
                    sequence: Some(message.sequence),
                    body: PushBody::MessageAppended(MessageView::render(message, author, Vec::new())),
                }
            }
            BusEvent::MessageDeleted { message, .. } => {
                let author = display_identity(self.inner.identity.as_ref(), message.author_id).await;
                PushEvent {
                    container_id: Some(message.container),
                    sequence: Some(message.sequence),
                    body: PushBody::MessageDeleted(MessageView::render(message, author, Vec::new())),
                }
            }
            BusEvent::ReactionChanged {
                target,
                container,
                user_id,
                emoji,
                added,
                correlation_id,
                reactions,
            } => PushEvent {
                container_id: *container,
                sequence: None,
                body: PushBody::ReactionChanged(ReactionChange {
                    target: *target,
                    user_id: *user_id,
                    emoji: emoji.clone(),
                    added: *added,
                    correlation_id: *correlation_id,
                    reactions: reactions.clone(),
                }),
            },
            BusEvent::ReadAdvanced { user_id, container, position } => PushEvent {
                container_id: Some(*container),
                sequence: None,
                body: PushBody::ReadAdvanced(ReadAdvancedPayload { user_id: *user_id, position: *position }),
            },
            BusEvent::MembershipChanged { group_id, user_id, role, .. } => PushEvent {
                container_id: None,
                sequence: None,
                body: PushBody::MembershipChanged(MembershipChange {
                    group_id: *group_id,
                    user_id: *user_id,
                    role: *role,
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::registry::ConnectionHandle;
    use inkwell_directory::StaticDirectory;
    use inkwell_types::events::PushKind;
    use inkwell_types::models::{ReactionTarget, ReactionTargetKind, Role};
    use std::time::Duration;

    struct Fixture {
        db: Arc<Database>,
        dispatcher: Dispatcher,
        author: Uuid,
        reader: Uuid,
        outsider: Uuid,
        channel: ContainerId,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let author = Uuid::new_v4();
        let reader = Uuid::new_v4();
        let outsider = Uuid::new_v4();
        let group = db.create_group("g", false, author).unwrap();
        db.set_role(group.id, reader, Role::Member).unwrap();
        let channel = db.create_channel(group.id, "general").unwrap();

        let identity = Arc::new(StaticDirectory::new().with_user(author, "Author"));
        let dispatcher = Dispatcher::new(ConnectionRegistry::new(), db.clone(), identity);
        Fixture { db, dispatcher, author, reader, outsider, channel: ContainerId::Channel(channel.id) }
    }

    async fn connect(dispatcher: &Dispatcher, user: Uuid) -> tokio::sync::mpsc::UnboundedReceiver<Frame> {
        let (handle, rx) = ConnectionHandle::new(user);
        dispatcher.registry().register(handle).await;
        rx
    }

    fn decode(frame: Frame) -> PushEvent {
        serde_json::from_str(&frame).unwrap()
    }

    #[tokio::test]
    async fn appended_message_reaches_members_only() {
        let f = fixture();
        let mut author_rx = connect(&f.dispatcher, f.author).await;
        let mut reader_rx = connect(&f.dispatcher, f.reader).await;
        let mut outsider_rx = connect(&f.dispatcher, f.outsider).await;

        let message = f.db.append_message(f.channel, f.author, "hello", None).unwrap().message;
        let delivered = f.dispatcher.dispatch(&BusEvent::MessageAppended { message }).await.unwrap();
        assert_eq!(delivered, 2);

        let push = decode(reader_rx.recv().await.unwrap());
        assert_eq!(push.kind(), PushKind::MessageAppended);
        assert_eq!(push.sequence, Some(1));
        match push.body {
            PushBody::MessageAppended(view) => assert_eq!(view.author.display_name, "Author"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(author_rx.recv().await.is_some());
        assert!(outsider_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn read_advance_reaches_only_the_reader() {
        let f = fixture();
        let mut reader_rx = connect(&f.dispatcher, f.reader).await;
        let mut author_rx = connect(&f.dispatcher, f.author).await;

        let event = BusEvent::ReadAdvanced { user_id: f.reader, container: f.channel, position: 4 };
        assert_eq!(f.dispatcher.dispatch(&event).await.unwrap(), 1);
        let push = decode(reader_rx.recv().await.unwrap());
        assert_eq!(push.kind(), PushKind::ReadAdvanced);
        assert!(push.sequence.is_none());
        assert!(author_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn opaque_reaction_goes_to_the_reactor() {
        let f = fixture();
        let mut reader_rx = connect(&f.dispatcher, f.reader).await;
        let event = BusEvent::ReactionChanged {
            target: ReactionTarget { kind: ReactionTargetKind::Review, id: Uuid::new_v4() },
            container: None,
            user_id: f.reader,
            emoji: "❤️".into(),
            added: true,
            correlation_id: None,
            reactions: vec![],
        };
        assert_eq!(f.dispatcher.audience(&event).await.unwrap(), vec![f.reader]);
        f.dispatcher.dispatch(&event).await.unwrap();
        assert!(reader_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn removed_member_still_hears_about_removal() {
        let f = fixture();
        let group_id = f.db.container_group(f.channel).unwrap().unwrap();
        f.db.remove_member(group_id, f.reader).unwrap();

        let event = BusEvent::MembershipChanged { group_id, user_id: f.reader, role: None, actor_id: f.author };
        let audience = f.dispatcher.audience(&event).await.unwrap();
        assert!(audience.contains(&f.reader));
        assert!(audience.contains(&f.author));
    }

    #[tokio::test]
    async fn users_without_connections_are_skipped() {
        let f = fixture();
        let message = f.db.append_message(f.channel, f.author, "nobody home", None).unwrap().message;
        assert_eq!(f.dispatcher.dispatch(&BusEvent::MessageAppended { message }).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn shard_workers_preserve_container_order() {
        let f = fixture();
        let mut reader_rx = connect(&f.dispatcher, f.reader).await;
        let (bus, subs) = EventBus::new(2);
        let _workers = f.dispatcher.start(subs);

        for i in 0..5 {
            let message = f.db.append_message(f.channel, f.author, &format!("m{i}"), None).unwrap().message;
            bus.publish(BusEvent::MessageAppended { message });
        }

        let mut sequences = Vec::new();
        for _ in 0..5 {
            let frame = tokio::time::timeout(Duration::from_secs(5), reader_rx.recv())
                .await
                .unwrap()
                .unwrap();
            sequences.push(decode(frame).sequence.unwrap());
        }
        assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
    }
}
