use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};
use uuid::Uuid;

use inkwell_db::{Database, StoreError};
use inkwell_directory::{SharedContent, SharedIdentity, display_identity};
use inkwell_gateway::bus::EventBus;
use inkwell_types::api::{ConversationView, GroupView, MessagesPage, ToggleReactionResponse, UnreadSummary};
use inkwell_types::events::{AuthorView, BusEvent, MessageView};
use inkwell_types::models::{
    Channel, ContainerId, Conversation, Group, Message, ReactionTarget, ReactionTargetKind, ReadAdvance, Role,
};

use crate::error::{ApiError, ApiResult};
use crate::unread::UnreadAggregator;

pub const DEFAULT_PULL_LIMIT: u32 = 100;
pub const MAX_PULL_LIMIT: u32 = 500;

const MAX_BODY_CHARS: usize = 4000;
const MAX_EMOJI_BYTES: usize = 32;
const MAX_NAME_CHARS: usize = 64;
const DEFAULT_CHANNEL: &str = "general";
const ORDERING_STRIPES: usize = 64;

/// The write path and the authorized read path of the messaging core.
///
/// Every mutation commits to the store, folds the change into the unread
/// aggregator and publishes exactly one event, in that order. Replayed
/// writes and no-op writes publish nothing.
#[derive(Clone)]
pub struct MessagingService {
    inner: Arc<ServiceInner>,
}

pub(crate) struct ServiceInner {
    pub(crate) db: Arc<Database>,
    unread: UnreadAggregator,
    bus: EventBus,
    identity: SharedIdentity,
    content: SharedContent,
    pull_limit: u32,
    /// Write-then-publish runs under the stripe of its ordering key, so the
    /// bus sees a container's events in commit order.
    ordering: Box<[Mutex<()>]>,
}

impl MessagingService {
    pub fn new(
        db: Arc<Database>,
        bus: EventBus,
        identity: SharedIdentity,
        content: SharedContent,
        pull_limit: u32,
    ) -> Self {
        let unread = UnreadAggregator::new(db.clone());
        Self {
            inner: Arc::new(ServiceInner {
                db,
                unread,
                bus,
                identity,
                content,
                pull_limit: pull_limit.clamp(1, MAX_PULL_LIMIT),
                ordering: (0..ORDERING_STRIPES).map(|_| Mutex::new(())).collect(),
            }),
        }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.inner.db
    }

    pub(crate) fn content(&self) -> &SharedContent {
        &self.inner.content
    }

    /// Runs store work off the async runtime.
    pub(crate) async fn blocking<T, F>(&self, f: F) -> ApiResult<T>
    where
        F: FnOnce(&ServiceInner) -> ApiResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&inner)).await?
    }

    async fn author(&self, user_id: Uuid) -> AuthorView {
        display_identity(self.inner.identity.as_ref(), user_id).await
    }

    // -- Messages --

    pub async fn send_message(
        &self,
        actor: Uuid,
        container: ContainerId,
        body: String,
        correlation_id: Option<Uuid>,
    ) -> ApiResult<MessageView> {
        validate_body(&body)?;

        let (message, reactions) = self
            .blocking(move |s| {
                let _order = s.ordered(container.id());
                let appended = s.db.append_message(container, actor, &body, correlation_id)?;
                let message = appended.message;
                if !appended.created {
                    let reactions = s.db.reactions_for(ReactionTarget::message(message.id))?;
                    return Ok((message, reactions));
                }
                debug!("{} appended #{} to {}", actor, message.sequence, container);
                s.commit(BusEvent::MessageAppended { message: message.clone() });
                Ok((message, Vec::new()))
            })
            .await?;

        let author = self.author(message.author_id).await;
        Ok(MessageView::render(&message, author, reactions))
    }

    pub async fn delete_message(&self, actor: Uuid, message_id: Uuid) -> ApiResult<MessageView> {
        let message = self
            .blocking(move |s| {
                let container = s
                    .db
                    .get_message(message_id)?
                    .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?
                    .container;
                let _order = s.ordered(container.id());
                let (message, changed) = s.db.soft_delete(message_id, actor)?;
                if changed {
                    info!("{} deleted message {} in {}", actor, message_id, message.container);
                    s.commit(BusEvent::MessageDeleted { message: message.clone(), deleted_by: actor });
                }
                Ok(message)
            })
            .await?;

        let author = self.author(message.author_id).await;
        Ok(MessageView::render(&message, author, Vec::new()))
    }

    /// Pull path: messages with a sequence strictly greater than `after`.
    pub async fn messages_after(
        &self,
        actor: Uuid,
        container: ContainerId,
        after: u64,
        limit: Option<u32>,
    ) -> ApiResult<MessagesPage> {
        let limit = limit.unwrap_or(self.inner.pull_limit).clamp(1, self.inner.pull_limit);

        let (messages, mut reactions) = self
            .blocking(move |s| {
                s.require_member(container, actor)?;
                let messages = s.db.messages_after(container, after, limit)?;
                let live: Vec<Uuid> = messages.iter().filter(|m| !m.deleted).map(|m| m.id).collect();
                let reactions = s.db.reactions_for_messages(&live)?;
                Ok((messages, reactions))
            })
            .await?;

        let authors = self.authors(&messages).await;
        let messages = messages
            .iter()
            .map(|message| {
                let author = authors
                    .get(&message.author_id)
                    .cloned()
                    .unwrap_or_else(|| AuthorView::raw(message.author_id));
                MessageView::render(message, author, reactions.remove(&message.id).unwrap_or_default())
            })
            .collect();

        Ok(MessagesPage { container, messages })
    }

    async fn authors(&self, messages: &[Message]) -> HashMap<Uuid, AuthorView> {
        let mut authors = HashMap::new();
        for message in messages {
            if !authors.contains_key(&message.author_id) {
                let view = self.author(message.author_id).await;
                authors.insert(message.author_id, view);
            }
        }
        authors
    }

    // -- Reactions --

    pub async fn toggle_reaction(
        &self,
        actor: Uuid,
        target: ReactionTarget,
        emoji: String,
        correlation_id: Option<Uuid>,
    ) -> ApiResult<ToggleReactionResponse> {
        validate_emoji(&emoji)?;

        self.blocking(move |s| {
            let container = match target.kind {
                ReactionTargetKind::Message => {
                    let message = s
                        .db
                        .get_message(target.id)?
                        .ok_or_else(|| StoreError::NotFound(format!("message {}", target.id)))?;
                    s.require_member(message.container, actor)?;
                    Some(message.container)
                }
                ReactionTargetKind::Comment | ReactionTargetKind::Review => None,
            };

            let _order = s.ordered(container.map_or(target.id, |c| c.id()));
            let toggle = s.db.toggle_reaction(target, actor, &emoji, correlation_id)?;
            if !toggle.replayed {
                s.commit(BusEvent::ReactionChanged {
                    target,
                    container,
                    user_id: actor,
                    emoji,
                    added: toggle.added,
                    correlation_id,
                    reactions: toggle.reactions.clone(),
                });
            }
            Ok(ToggleReactionResponse { added: toggle.added, reactions: toggle.reactions })
        })
        .await
    }

    /// Registers an external comment or review so it can carry reactions.
    pub async fn register_reaction_target(&self, target: ReactionTarget) -> ApiResult<bool> {
        self.blocking(move |s| Ok(s.db.register_reaction_target(target)?)).await
    }

    // -- Read state --

    pub async fn advance_read(&self, actor: Uuid, container: ContainerId, position: u64) -> ApiResult<ReadAdvance> {
        self.blocking(move |s| {
            s.require_member(container, actor)?;
            let _order = s.ordered(container.id());
            let advance = s.db.advance_read_position(actor, container, position)?;
            if advance.advanced {
                s.commit(BusEvent::ReadAdvanced { user_id: actor, container, position: advance.position });
            } else {
                debug!("Ignored stale read advance of {} in {} to {}", actor, container, position);
            }
            Ok(advance)
        })
        .await
    }

    pub async fn unread_summary(&self, actor: Uuid) -> ApiResult<UnreadSummary> {
        self.blocking(move |s| Ok(s.unread.summary(actor)?)).await
    }

    pub async fn unread(&self, actor: Uuid, container: ContainerId) -> ApiResult<Option<u64>> {
        self.blocking(move |s| Ok(s.unread.unread(actor, container)?)).await
    }

    // -- Conversations --

    /// Finds or lazily creates the conversation between `actor` and `peer`.
    pub async fn open_conversation(&self, actor: Uuid, peer: Uuid) -> ApiResult<ConversationView> {
        let (conversation, created) = self
            .blocking(move |s| Ok(s.db.find_or_create_conversation(actor, peer)?))
            .await?;
        if created {
            info!("Opened conversation {} between {} and {}", conversation.id, actor, peer);
        }
        Ok(self.conversation_view(actor, conversation, created).await)
    }

    pub async fn list_conversations(&self, actor: Uuid) -> ApiResult<Vec<ConversationView>> {
        let conversations = self.blocking(move |s| Ok(s.db.conversations_for_user(actor)?)).await?;
        let mut views = Vec::with_capacity(conversations.len());
        for conversation in conversations {
            views.push(self.conversation_view(actor, conversation, false).await);
        }
        Ok(views)
    }

    async fn conversation_view(&self, actor: Uuid, conversation: Conversation, created: bool) -> ConversationView {
        let peer = conversation.peer_of(actor).unwrap_or(actor);
        ConversationView { peer: self.author(peer).await, conversation, created }
    }

    // -- Groups --

    /// Creates a group with a default channel. The creator is its
    /// administrator.
    pub async fn create_group(&self, actor: Uuid, name: String, private: bool) -> ApiResult<GroupView> {
        validate_name(&name)?;
        self.blocking(move |s| {
            let group = s.db.create_group(&name, private, actor)?;
            let channel = s.db.create_channel(group.id, DEFAULT_CHANNEL)?;
            info!("{} created group {} ({})", actor, group.name, group.id);
            s.commit(BusEvent::MembershipChanged {
                group_id: group.id,
                user_id: actor,
                role: Some(Role::Administrator),
                actor_id: actor,
            });
            Ok(GroupView { group, channels: vec![channel], role: Some(Role::Administrator) })
        })
        .await
    }

    pub async fn create_channel(&self, actor: Uuid, group_id: Uuid, name: String) -> ApiResult<Channel> {
        validate_name(&name)?;
        self.blocking(move |s| {
            s.require_group(group_id)?;
            s.require_admin(group_id, actor)?;
            let channel = s.db.create_channel(group_id, &name)?;
            info!("{} created channel {} in group {}", actor, channel.name, group_id);
            Ok(channel)
        })
        .await
    }

    /// Group with its channels. Private groups are visible to members only.
    pub async fn group(&self, actor: Uuid, group_id: Uuid) -> ApiResult<GroupView> {
        self.blocking(move |s| {
            let group = s.require_group(group_id)?;
            let role = s.db.role_of(group_id, actor)?;
            if group.private && role.is_none() {
                return Err(StoreError::Forbidden(format!("group {group_id} is private")).into());
            }
            let channels = s.db.list_channels(group_id)?;
            Ok(GroupView { group, channels, role })
        })
        .await
    }

    pub async fn list_groups(&self, actor: Uuid) -> ApiResult<Vec<GroupView>> {
        self.blocking(move |s| {
            s.db.groups_for_user(actor)?
                .into_iter()
                .map(|(group, role)| -> ApiResult<GroupView> {
                    let channels = s.db.list_channels(group.id)?;
                    Ok(GroupView { group, channels, role: Some(role) })
                })
                .collect()
        })
        .await
    }

    /// Joins a public group as a member. Joining twice is a no-op.
    pub async fn join_group(&self, actor: Uuid, group_id: Uuid) -> ApiResult<GroupView> {
        self.blocking(move |s| {
            let _order = s.ordered(group_id);
            let group = s.require_group(group_id)?;
            let role = match s.db.role_of(group_id, actor)? {
                Some(role) => role,
                None if group.private => {
                    return Err(StoreError::Forbidden(format!("group {group_id} is private")).into());
                }
                None => {
                    if s.db.set_role(group_id, actor, Role::Member)? {
                        info!("{} joined group {}", actor, group_id);
                        s.commit(BusEvent::MembershipChanged {
                            group_id,
                            user_id: actor,
                            role: Some(Role::Member),
                            actor_id: actor,
                        });
                    }
                    Role::Member
                }
            };
            let channels = s.db.list_channels(group_id)?;
            Ok(GroupView { group, channels, role: Some(role) })
        })
        .await
    }

    /// Administrators only. Returns whether the stored role changed. The
    /// store refuses to demote the last administrator.
    pub async fn set_role(&self, actor: Uuid, group_id: Uuid, user_id: Uuid, role: Role) -> ApiResult<bool> {
        self.blocking(move |s| {
            // Checks and write share the group's stripe.
            let _order = s.ordered(group_id);
            s.require_group(group_id)?;
            s.require_admin(group_id, actor)?;
            let changed = s.db.set_role(group_id, user_id, role)?;
            if changed {
                info!("{} set role of {} in {} to {}", actor, user_id, group_id, role.as_str());
                s.commit(BusEvent::MembershipChanged { group_id, user_id, role: Some(role), actor_id: actor });
            }
            Ok(changed)
        })
        .await
    }

    /// Administrators may remove anyone; any member may remove themselves.
    pub async fn remove_member(&self, actor: Uuid, group_id: Uuid, user_id: Uuid) -> ApiResult<bool> {
        self.blocking(move |s| {
            let _order = s.ordered(group_id);
            s.require_group(group_id)?;
            if actor != user_id {
                s.require_admin(group_id, actor)?;
            }
            let removed = s.db.remove_member(group_id, user_id)?;
            if removed {
                info!("{} removed {} from group {}", actor, user_id, group_id);
                s.commit(BusEvent::MembershipChanged { group_id, user_id, role: None, actor_id: actor });
            }
            Ok(removed)
        })
        .await
    }
}

impl ServiceInner {
    fn ordered(&self, key: Uuid) -> MutexGuard<'_, ()> {
        let stripe = &self.ordering[(key.as_u128() % self.ordering.len() as u128) as usize];
        stripe.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Folds a committed mutation into the unread cache, then publishes it.
    fn commit(&self, event: BusEvent) {
        if let Err(e) = self.unread.apply(&event) {
            warn!("Unread aggregator failed on {:?}: {}", event.kind(), e);
        }
        self.bus.publish(event);
    }

    pub(crate) fn require_member(&self, container: ContainerId, user_id: Uuid) -> ApiResult<()> {
        if self.db.is_container_member(container, user_id)? {
            Ok(())
        } else {
            Err(StoreError::Forbidden(format!("{user_id} is not a member of {container}")).into())
        }
    }

    pub(crate) fn require_group(&self, group_id: Uuid) -> ApiResult<Group> {
        Ok(self
            .db
            .get_group(group_id)?
            .ok_or_else(|| StoreError::NotFound(format!("group {group_id}")))?)
    }

    fn require_admin(&self, group_id: Uuid, user_id: Uuid) -> ApiResult<()> {
        match self.db.role_of(group_id, user_id)? {
            Some(Role::Administrator) => Ok(()),
            _ => Err(StoreError::Forbidden(format!("{user_id} is not an administrator of {group_id}")).into()),
        }
    }
}

fn validate_body(body: &str) -> ApiResult<()> {
    if body.trim().is_empty() {
        return Err(ApiError::BadRequest("message body is empty".into()));
    }
    if body.chars().count() > MAX_BODY_CHARS {
        return Err(ApiError::BadRequest(format!("message body exceeds {MAX_BODY_CHARS} characters")));
    }
    Ok(())
}

fn validate_emoji(emoji: &str) -> ApiResult<()> {
    if emoji.trim().is_empty() || emoji.len() > MAX_EMOJI_BYTES {
        return Err(ApiError::BadRequest("invalid emoji".into()));
    }
    Ok(())
}

fn validate_name(name: &str) -> ApiResult<()> {
    let len = name.trim().chars().count();
    if len == 0 || len > MAX_NAME_CHARS {
        return Err(ApiError::BadRequest(format!("name must be 1 to {MAX_NAME_CHARS} characters")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use inkwell_directory::StaticDirectory;
    use inkwell_gateway::bus::ShardSubscription;
    use inkwell_types::events::PushKind;

    struct Harness {
        service: MessagingService,
        subs: Vec<ShardSubscription>,
        alice: Uuid,
        bob: Uuid,
    }

    fn harness() -> Harness {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let (bus, subs) = EventBus::new(1);
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let directory = Arc::new(StaticDirectory::new().with_user(alice, "Alice").with_user(bob, "Bob"));
        let service = MessagingService::new(db, bus, directory.clone(), directory, DEFAULT_PULL_LIMIT);
        Harness { service, subs, alice, bob }
    }

    impl Harness {
        async fn published(&self) -> Vec<PushKind> {
            self.subs[0].drain().await.iter().map(BusEvent::kind).collect()
        }
    }

    #[tokio::test]
    async fn every_mutation_publishes_exactly_once() {
        let h = harness();
        let group = h.service.create_group(h.alice, "club".into(), false).await.unwrap();
        let general = ContainerId::Channel(group.channels[0].id);
        h.service.join_group(h.bob, group.group.id).await.unwrap();
        assert_eq!(h.published().await, vec![PushKind::MembershipChanged, PushKind::MembershipChanged]);

        let correlation = Some(Uuid::new_v4());
        let sent = h.service.send_message(h.bob, general, "hi".into(), correlation).await.unwrap();
        let retry = h.service.send_message(h.bob, general, "hi".into(), correlation).await.unwrap();
        assert_eq!(sent.id, retry.id);
        assert_eq!(sent.author.display_name, "Bob");
        assert_eq!(sent.group_id, Some(group.group.id));
        assert_eq!(h.published().await, vec![PushKind::MessageAppended]);

        h.service.advance_read(h.alice, general, 1).await.unwrap();
        h.service.advance_read(h.alice, general, 1).await.unwrap();
        assert_eq!(h.published().await, vec![PushKind::ReadAdvanced]);

        h.service.toggle_reaction(h.alice, ReactionTarget::message(sent.id), "👍".into(), None).await.unwrap();
        h.service.delete_message(h.bob, sent.id).await.unwrap();
        h.service.delete_message(h.bob, sent.id).await.unwrap();
        assert_eq!(h.published().await, vec![PushKind::ReactionChanged, PushKind::MessageDeleted]);
    }

    #[tokio::test]
    async fn outsiders_cannot_read_or_post() {
        let h = harness();
        let group = h.service.create_group(h.alice, "club".into(), true).await.unwrap();
        let general = ContainerId::Channel(group.channels[0].id);

        let err = h.service.send_message(h.bob, general, "let me in".into(), None).await.unwrap_err();
        assert!(matches!(err, ApiError::Store(StoreError::Forbidden(_))));
        let err = h.service.messages_after(h.bob, general, 0, None).await.unwrap_err();
        assert!(matches!(err, ApiError::Store(StoreError::Forbidden(_))));
        let err = h.service.join_group(h.bob, group.group.id).await.unwrap_err();
        assert!(matches!(err, ApiError::Store(StoreError::Forbidden(_))));
    }

    #[tokio::test]
    async fn only_admins_manage_roles_but_anyone_may_leave() {
        let h = harness();
        let group = h.service.create_group(h.alice, "club".into(), false).await.unwrap();
        let group_id = group.group.id;
        h.service.join_group(h.bob, group_id).await.unwrap();

        let err = h.service.set_role(h.bob, group_id, h.bob, Role::Administrator).await.unwrap_err();
        assert!(matches!(err, ApiError::Store(StoreError::Forbidden(_))));
        assert!(h.service.set_role(h.alice, group_id, h.bob, Role::Moderator).await.unwrap());
        assert!(!h.service.set_role(h.alice, group_id, h.bob, Role::Moderator).await.unwrap());

        let err = h.service.remove_member(h.alice, group_id, h.alice).await.unwrap_err();
        assert!(matches!(err, ApiError::Store(StoreError::Conflict(_))));

        assert!(h.service.remove_member(h.bob, group_id, h.bob).await.unwrap());
        assert!(!h.service.remove_member(h.alice, group_id, h.bob).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_demotions_keep_one_administrator() {
        let h = harness();
        for _ in 0..20 {
            let group = h.service.create_group(h.alice, "club".into(), false).await.unwrap();
            let group_id = group.group.id;
            h.service.join_group(h.bob, group_id).await.unwrap();
            h.service.set_role(h.alice, group_id, h.bob, Role::Administrator).await.unwrap();

            let (a, b) = tokio::join!(
                h.service.set_role(h.alice, group_id, h.bob, Role::Member),
                h.service.set_role(h.bob, group_id, h.alice, Role::Member),
            );
            assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1, "{a:?} {b:?}");

            let admins = h
                .service
                .db()
                .group_members(group_id)
                .unwrap()
                .into_iter()
                .filter(|m| m.role == Role::Administrator)
                .count();
            assert_eq!(admins, 1);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_joins_publish_once() {
        let h = harness();
        for _ in 0..20 {
            let group = h.service.create_group(h.alice, "club".into(), false).await.unwrap();
            h.published().await;

            let (a, b) = tokio::join!(
                h.service.join_group(h.bob, group.group.id),
                h.service.join_group(h.bob, group.group.id),
            );
            assert_eq!(a.unwrap().role, Some(Role::Member));
            assert_eq!(b.unwrap().role, Some(Role::Member));
            assert_eq!(h.published().await, vec![PushKind::MembershipChanged]);
        }
    }

    #[tokio::test]
    async fn pull_includes_tombstones_and_reactions() {
        let h = harness();
        let (conversation, _) = h.service.db().find_or_create_conversation(h.alice, h.bob).unwrap();
        let dm = ContainerId::Conversation(conversation.id);

        let first = h.service.send_message(h.alice, dm, "one".into(), None).await.unwrap();
        let second = h.service.send_message(h.bob, dm, "two".into(), None).await.unwrap();
        h.service.toggle_reaction(h.alice, ReactionTarget::message(second.id), "🔥".into(), None).await.unwrap();
        h.service.delete_message(h.alice, first.id).await.unwrap();

        let page = h.service.messages_after(h.bob, dm, 0, Some(10)).await.unwrap();
        assert_eq!(page.messages.len(), 2);
        assert!(page.messages.iter().all(|m| m.group_id.is_none()));
        assert!(page.messages[0].deleted);
        assert!(page.messages[0].body.is_empty());
        assert_eq!(page.messages[1].reactions[0].emoji, "🔥");
    }

    #[tokio::test]
    async fn input_is_validated_before_any_write() {
        let h = harness();
        let dm = ContainerId::Conversation(Uuid::new_v4());
        let err = h.service.send_message(h.alice, dm, "   ".into(), None).await.unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
        let err = h.service.create_group(h.alice, String::new(), false).await.unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
        assert!(h.published().await.is_empty());
    }
}
