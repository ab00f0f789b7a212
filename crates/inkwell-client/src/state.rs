use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use uuid::Uuid;

use inkwell_types::api::{ContainerUnread, GroupUnread, UnreadSummary};
use inkwell_types::events::{AuthorView, MembershipChange, MessageView, PushBody, PushEvent, ReactionChange};
use inkwell_types::models::{ContainerId, ReactionGroup, ReactionTarget};

use crate::reconcile::{FailureNotice, Ledger, MutationKind, MutationState};
use crate::transport::{Comment, Review};

/// Undismissed failure notices kept; the oldest goes first.
const MAX_NOTICES: usize = 32;

/// Messages of one container as the client currently sees them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Timeline {
    /// Authoritative messages keyed by sequence.
    pub confirmed: BTreeMap<u64, MessageView>,
    /// Optimistic sends not yet confirmed, in send order.
    pub pending: Vec<MessageView>,
}

impl Timeline {
    pub fn last_sequence(&self) -> u64 {
        self.confirmed.keys().next_back().copied().unwrap_or(0)
    }

    fn is_empty(&self) -> bool {
        self.confirmed.is_empty() && self.pending.is_empty()
    }

    fn message_mut(&mut self, id: Uuid) -> Option<&mut MessageView> {
        self.confirmed.values_mut().find(|m| m.id == id)
    }
}

/// Everything a user can see. Rollback restores parts of this exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientData {
    pub timelines: HashMap<ContainerId, Timeline>,
    pub reactions: HashMap<ReactionTarget, Vec<ReactionGroup>>,
    pub comments: HashMap<Uuid, Vec<Comment>>,
    pub reviews: HashMap<Uuid, Vec<Review>>,
    pub unread: UnreadSummary,
    pub read_positions: HashMap<ContainerId, u64>,
}

impl ClientData {
    pub fn unread(&self, container: ContainerId) -> u64 {
        self.unread.container(container).unwrap_or(0)
    }

    fn find_message_mut(&mut self, id: Uuid) -> Option<&mut MessageView> {
        self.timelines.values_mut().find_map(|t| t.message_mut(id))
    }

    fn reactions_of(&self, target: ReactionTarget) -> Vec<ReactionGroup> {
        if let Some(groups) = self.reactions.get(&target) {
            return groups.clone();
        }
        self.timelines
            .values()
            .flat_map(|t| t.confirmed.values())
            .find(|m| m.id == target.id)
            .map(|m| m.reactions.clone())
            .unwrap_or_default()
    }

    fn set_reactions(&mut self, target: ReactionTarget, groups: Vec<ReactionGroup>) {
        if let Some(message) = self.find_message_mut(target.id) {
            message.reactions = groups.clone();
        }
        self.reactions.insert(target, groups);
    }

    /// Moves the unread mirror of `container` by `delta`, keeping the group
    /// sum and the total consistent with the per-container rows.
    ///
    /// `group_id` is the owning group carried by channel messages. A row
    /// first seen through a push takes its group from there; a row without a
    /// group only counts toward the total until the next summary.
    fn bump_unread(&mut self, container: ContainerId, group_id: Option<Uuid>, delta: i64) {
        let summary = &mut self.unread;
        let index = match summary.per_container.iter().position(|c| c.container == container) {
            Some(i) => i,
            None => {
                summary.per_container.push(ContainerUnread { container, group_id: None, unread: 0 });
                summary.per_container.len() - 1
            }
        };
        let row = &mut summary.per_container[index];

        let mut adopted = 0;
        if row.group_id.is_none() && group_id.is_some() {
            row.group_id = group_id;
            adopted = row.unread;
        }
        let before = row.unread;
        row.unread = before.saturating_add_signed(delta);
        let applied = row.unread as i64 - before as i64;

        if let Some(group_id) = row.group_id {
            let group = match summary.per_group.iter().position(|g| g.group_id == group_id) {
                Some(i) => &mut summary.per_group[i],
                None => {
                    summary.per_group.push(GroupUnread { group_id, unread: 0 });
                    let last = summary.per_group.len() - 1;
                    &mut summary.per_group[last]
                }
            };
            group.unread = (group.unread + adopted).saturating_add_signed(applied);
        }
        summary.total = summary.total.saturating_add_signed(applied);
    }

    fn set_unread(&mut self, container: ContainerId, value: u64) {
        let current = self.unread(container) as i64;
        self.bump_unread(container, None, value as i64 - current);
    }

    fn drop_group(&mut self, group_id: Uuid) {
        let removed: Vec<ContainerId> = self
            .unread
            .per_container
            .iter()
            .filter(|c| c.group_id == Some(group_id))
            .map(|c| c.container)
            .collect();
        self.unread.per_container.retain(|c| c.group_id != Some(group_id));
        self.unread.per_group.retain(|g| g.group_id != group_id);
        self.unread.total = self.unread.per_container.iter().map(|c| c.unread).sum();
        for container in removed {
            self.timelines.remove(&container);
            self.read_positions.remove(&container);
        }
    }
}

/// What the client needs to undo one optimistic write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Snapshot {
    Message { container: ContainerId, had_timeline: bool },
    Reaction { target: ReactionTarget, stored: Option<Vec<ReactionGroup>>, on_message: Option<Vec<ReactionGroup>> },
    Comment { content_id: Uuid, had_thread: bool },
    Review { content_id: Uuid, had_thread: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientState {
    pub user_id: Uuid,
    pub data: ClientData,
    pub ledger: Ledger,
    pub notices: Vec<FailureNotice>,
}

impl ClientState {
    pub fn new(user_id: Uuid) -> Self {
        Self { user_id, data: ClientData::default(), ledger: Ledger::default(), notices: Vec::new() }
    }

    pub fn mutation(&self, correlation_id: Uuid) -> Option<MutationState> {
        self.ledger.state(correlation_id)
    }

    // -- Optimistic writes --

    pub fn begin_message(&mut self, container: ContainerId, body: &str, correlation_id: Uuid) -> Snapshot {
        let had_timeline = self.data.timelines.contains_key(&container);
        let guess = MessageView {
            id: correlation_id,
            container,
            sequence: 0,
            author: AuthorView::raw(self.user_id),
            body: body.to_string(),
            correlation_id: Some(correlation_id),
            deleted: false,
            created_at: Utc::now(),
            reactions: Vec::new(),
            group_id: None,
        };
        self.data.timelines.entry(container).or_default().pending.push(guess);
        self.ledger.begin(correlation_id, MutationKind::SendMessage);
        Snapshot::Message { container, had_timeline }
    }

    pub fn begin_reaction(&mut self, target: ReactionTarget, emoji: &str, correlation_id: Uuid) -> Snapshot {
        let snapshot = Snapshot::Reaction {
            target,
            stored: self.data.reactions.get(&target).cloned(),
            on_message: self.data.find_message_mut(target.id).map(|m| m.reactions.clone()),
        };

        let me = self.user_id;
        let mut present = false;
        let mut pairs = Vec::new();
        for group in self.data.reactions_of(target) {
            for user_id in group.user_ids {
                if group.emoji == emoji && user_id == me {
                    present = true;
                } else {
                    pairs.push((group.emoji.clone(), user_id));
                }
            }
        }
        if !present {
            pairs.push((emoji.to_string(), me));
        }
        self.data.set_reactions(target, ReactionGroup::collect(pairs));
        self.ledger.begin(correlation_id, MutationKind::ToggleReaction);
        snapshot
    }

    pub fn begin_comment(&mut self, content_id: Uuid, body: &str, correlation_id: Uuid) -> Snapshot {
        let had_thread = self.data.comments.contains_key(&content_id);
        let guess = Comment {
            id: correlation_id,
            content_id,
            author_id: self.user_id,
            body: body.to_string(),
            correlation_id: Some(correlation_id),
            created_at: Utc::now(),
        };
        self.data.comments.entry(content_id).or_default().push(guess);
        self.ledger.begin(correlation_id, MutationKind::PostComment);
        Snapshot::Comment { content_id, had_thread }
    }

    pub fn begin_review(&mut self, content_id: Uuid, rating: u8, body: &str, correlation_id: Uuid) -> Snapshot {
        let had_thread = self.data.reviews.contains_key(&content_id);
        let guess = Review {
            id: correlation_id,
            content_id,
            author_id: self.user_id,
            rating,
            body: body.to_string(),
            correlation_id: Some(correlation_id),
            created_at: Utc::now(),
        };
        self.data.reviews.entry(content_id).or_default().push(guess);
        self.ledger.begin(correlation_id, MutationKind::PostReview);
        Snapshot::Review { content_id, had_thread }
    }

    // -- Authoritative responses --

    /// Replaces the local guess with the canonical message. A push may have
    /// delivered it already, in which case the merge is a no-op.
    pub fn confirm_message(&mut self, message: MessageView) {
        if let Some(correlation_id) = message.correlation_id {
            self.ledger.confirm(correlation_id);
        }
        self.merge_message(message);
    }

    /// Applies the server's reaction set unless a push got there first and
    /// already carried a state at least as new.
    pub fn confirm_reaction(&mut self, correlation_id: Uuid, target: ReactionTarget, reactions: Vec<ReactionGroup>) {
        if self.ledger.confirm(correlation_id) {
            self.data.set_reactions(target, reactions);
        }
    }

    pub fn confirm_comment(&mut self, correlation_id: Uuid, comment: Comment) {
        self.ledger.confirm(correlation_id);
        let thread = self.data.comments.entry(comment.content_id).or_default();
        match thread.iter_mut().find(|c| c.correlation_id == Some(correlation_id)) {
            Some(slot) => *slot = comment,
            None => thread.push(comment),
        }
    }

    pub fn confirm_review(&mut self, correlation_id: Uuid, review: Review) {
        self.ledger.confirm(correlation_id);
        let thread = self.data.reviews.entry(review.content_id).or_default();
        match thread.iter_mut().find(|r| r.correlation_id == Some(correlation_id)) {
            Some(slot) => *slot = review,
            None => thread.push(review),
        }
    }

    /// Restores `snapshot`, marks the write rolled back and records a notice.
    /// Does nothing if a push already confirmed the write.
    pub fn roll_back(&mut self, correlation_id: Uuid, kind: MutationKind, snapshot: Snapshot, reason: String) {
        if !self.ledger.roll_back(correlation_id) {
            return;
        }
        match snapshot {
            Snapshot::Message { container, had_timeline } => {
                if let Some(timeline) = self.data.timelines.get_mut(&container) {
                    timeline.pending.retain(|m| m.correlation_id != Some(correlation_id));
                    if !had_timeline && timeline.is_empty() {
                        self.data.timelines.remove(&container);
                    }
                }
            }
            Snapshot::Reaction { target, stored, on_message } => {
                match stored {
                    Some(groups) => self.data.reactions.insert(target, groups),
                    None => self.data.reactions.remove(&target),
                };
                if let (Some(groups), Some(message)) = (on_message, self.data.find_message_mut(target.id)) {
                    message.reactions = groups;
                }
            }
            Snapshot::Comment { content_id, had_thread } => {
                if let Some(thread) = self.data.comments.get_mut(&content_id) {
                    thread.retain(|c| c.correlation_id != Some(correlation_id));
                    if !had_thread && thread.is_empty() {
                        self.data.comments.remove(&content_id);
                    }
                }
            }
            Snapshot::Review { content_id, had_thread } => {
                if let Some(thread) = self.data.reviews.get_mut(&content_id) {
                    thread.retain(|r| r.correlation_id != Some(correlation_id));
                    if !had_thread && thread.is_empty() {
                        self.data.reviews.remove(&content_id);
                    }
                }
            }
        }
        if self.notices.len() == MAX_NOTICES {
            self.notices.remove(0);
        }
        self.notices.push(FailureNotice { correlation_id, kind, reason });
    }

    pub fn dismiss_notice(&mut self, correlation_id: Uuid) {
        self.notices.retain(|n| n.correlation_id != correlation_id);
    }

    // -- Server state --

    /// Merges one pushed event. Safe to call more than once with the same
    /// event and in any interleaving with pulled pages.
    pub fn apply_push(&mut self, event: PushEvent) {
        match event.body {
            PushBody::MessageAppended(message) => {
                if let Some(correlation_id) = message.correlation_id {
                    self.ledger.confirm(correlation_id);
                }
                self.merge_message(message);
            }
            PushBody::MessageDeleted(message) => self.merge_tombstone(message),
            PushBody::ReactionChanged(change) => self.merge_reaction(change),
            PushBody::ReadAdvanced(payload) => {
                if payload.user_id != self.user_id {
                    return;
                }
                if let Some(container) = event.container_id {
                    self.merge_read_position(container, payload.position);
                }
            }
            PushBody::MembershipChanged(MembershipChange { group_id, user_id, role }) => {
                if user_id == self.user_id && role.is_none() {
                    self.data.drop_group(group_id);
                }
            }
        }
    }

    /// Merges one pulled page. Pages and pushes carry the same objects.
    pub fn apply_page(&mut self, messages: Vec<MessageView>) {
        for message in messages {
            if message.deleted {
                self.merge_tombstone(message);
            } else {
                self.merge_message(message);
            }
        }
    }

    /// Replaces the unread mirror with the server's authoritative summary.
    pub fn apply_summary(&mut self, summary: UnreadSummary) {
        self.data.unread = summary;
    }

    pub fn merge_read_position(&mut self, container: ContainerId, position: u64) {
        let stored = self.data.read_positions.entry(container).or_insert(0);
        if position <= *stored {
            return;
        }
        *stored = position;
        let remaining = self.data.timelines.get(&container).map_or(0, |t| {
            t.confirmed.range(position + 1..).filter(|(_, m)| self.counts_as_unread(m)).count() as u64
        });
        if remaining < self.data.unread(container) {
            self.data.set_unread(container, remaining);
        }
    }

    fn counts_as_unread(&self, message: &MessageView) -> bool {
        !message.deleted && message.author.id != self.user_id
    }

    fn read_position(&self, container: ContainerId) -> u64 {
        self.data.read_positions.get(&container).copied().unwrap_or(0)
    }

    fn merge_message(&mut self, message: MessageView) {
        let container = message.container;
        let counts = self.counts_as_unread(&message) && message.sequence > self.read_position(container);
        let timeline = self.data.timelines.entry(container).or_default();
        if let Some(correlation_id) = message.correlation_id {
            timeline.pending.retain(|m| m.correlation_id != Some(correlation_id));
        }
        if timeline.confirmed.contains_key(&message.sequence) {
            return;
        }
        let group_id = message.group_id;
        timeline.confirmed.insert(message.sequence, message);
        if counts {
            self.data.bump_unread(container, group_id, 1);
        }
    }

    fn merge_tombstone(&mut self, message: MessageView) {
        let container = message.container;
        let read_position = self.read_position(container);
        let me = self.user_id;
        let timeline = self.data.timelines.entry(container).or_default();
        let was_unread = timeline
            .confirmed
            .get(&message.sequence)
            .is_some_and(|m| !m.deleted && m.author.id != me && m.sequence > read_position);
        let group_id = message.group_id;
        timeline.confirmed.insert(message.sequence, message);
        if was_unread {
            self.data.bump_unread(container, group_id, -1);
        }
    }

    fn merge_reaction(&mut self, change: ReactionChange) {
        if let Some(correlation_id) = change.correlation_id {
            if change.user_id == self.user_id {
                self.ledger.confirm(correlation_id);
            }
        }
        self.data.set_reactions(change.target, change.reactions);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inkwell_types::events::ReadAdvancedPayload;

    fn view(container: ContainerId, sequence: u64, author: Uuid, correlation_id: Option<Uuid>) -> MessageView {
        MessageView {
            id: Uuid::new_v4(),
            container,
            sequence,
            author: AuthorView::raw(author),
            body: format!("m{sequence}"),
            correlation_id,
            deleted: false,
            created_at: Utc::now(),
            reactions: Vec::new(),
            group_id: None,
        }
    }

    fn appended(message: MessageView) -> PushEvent {
        PushEvent {
            container_id: Some(message.container),
            sequence: Some(message.sequence),
            body: PushBody::MessageAppended(message),
        }
    }

    #[test]
    fn duplicate_pushes_merge_once() {
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        let container = ContainerId::Channel(Uuid::new_v4());
        let mut state = ClientState::new(me);

        let event = appended(view(container, 1, other, None));
        state.apply_push(event.clone());
        state.apply_push(event);

        assert_eq!(state.data.timelines[&container].confirmed.len(), 1);
        assert_eq!(state.data.unread(container), 1);
        assert_eq!(state.data.unread.total, 1);
    }

    #[test]
    fn push_confirms_pending_send() {
        let me = Uuid::new_v4();
        let container = ContainerId::Conversation(Uuid::new_v4());
        let mut state = ClientState::new(me);
        let correlation_id = Uuid::new_v4();

        state.begin_message(container, "hello", correlation_id);
        assert_eq!(state.mutation(correlation_id), Some(MutationState::Pending));

        let canonical = view(container, 3, me, Some(correlation_id));
        state.apply_push(appended(canonical.clone()));
        assert_eq!(state.mutation(correlation_id), Some(MutationState::Confirmed));

        // The late HTTP response changes nothing.
        state.confirm_message(canonical);
        let timeline = &state.data.timelines[&container];
        assert!(timeline.pending.is_empty());
        assert_eq!(timeline.confirmed.len(), 1);
        assert_eq!(state.data.unread(container), 0);
    }

    #[test]
    fn rolled_back_send_leaves_no_trace() {
        let mut state = ClientState::new(Uuid::new_v4());
        let container = ContainerId::Channel(Uuid::new_v4());
        let before = state.data.clone();
        let correlation_id = Uuid::new_v4();

        let snapshot = state.begin_message(container, "lost", correlation_id);
        state.roll_back(correlation_id, MutationKind::SendMessage, snapshot, "unavailable".into());

        assert_eq!(state.data, before);
        assert_eq!(state.mutation(correlation_id), Some(MutationState::RolledBack));
        assert_eq!(state.notices.len(), 1);
    }

    #[test]
    fn failure_notices_are_capped() {
        let mut state = ClientState::new(Uuid::new_v4());
        let container = ContainerId::Conversation(Uuid::new_v4());
        let mut last = Uuid::nil();
        for _ in 0..MAX_NOTICES + 5 {
            last = Uuid::new_v4();
            let snapshot = state.begin_message(container, "lost", last);
            state.roll_back(last, MutationKind::SendMessage, snapshot, "unavailable".into());
        }
        assert_eq!(state.notices.len(), MAX_NOTICES);
        assert_eq!(state.notices.last().map(|n| n.correlation_id), Some(last));
        assert!(state.ledger.pending().next().is_none());
    }

    #[test]
    fn own_read_push_clears_loaded_unread() {
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        let container = ContainerId::Channel(Uuid::new_v4());
        let mut state = ClientState::new(me);
        for seq in 1..=3 {
            state.apply_push(appended(view(container, seq, other, None)));
        }
        assert_eq!(state.data.unread(container), 3);

        let read = |user_id, position| PushEvent {
            container_id: Some(container),
            sequence: None,
            body: PushBody::ReadAdvanced(ReadAdvancedPayload { user_id, position }),
        };
        state.apply_push(read(other, 3));
        assert_eq!(state.data.unread(container), 3);

        state.apply_push(read(me, 2));
        assert_eq!(state.data.unread(container), 1);

        // Stale tab.
        state.apply_push(read(me, 1));
        assert_eq!(state.data.read_positions[&container], 2);
        assert_eq!(state.data.unread(container), 1);
    }

    #[test]
    fn tombstone_removes_unread_message() {
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        let container = ContainerId::Channel(Uuid::new_v4());
        let mut state = ClientState::new(me);

        let message = view(container, 1, other, None);
        state.apply_push(appended(message.clone()));
        let tombstone = MessageView { deleted: true, body: String::new(), ..message };
        let event = PushEvent {
            container_id: Some(container),
            sequence: Some(1),
            body: PushBody::MessageDeleted(tombstone),
        };
        state.apply_push(event.clone());
        state.apply_push(event);

        assert_eq!(state.data.unread(container), 0);
        assert!(state.data.timelines[&container].confirmed[&1].deleted);
    }

    #[test]
    fn unread_mirror_keeps_group_sum() {
        let me = Uuid::new_v4();
        let group_id = Uuid::new_v4();
        let (c1, c2) = (ContainerId::Channel(Uuid::new_v4()), ContainerId::Channel(Uuid::new_v4()));
        let mut state = ClientState::new(me);
        state.apply_summary(UnreadSummary {
            per_container: vec![
                ContainerUnread { container: c1, group_id: Some(group_id), unread: 3 },
                ContainerUnread { container: c2, group_id: Some(group_id), unread: 5 },
            ],
            per_group: vec![GroupUnread { group_id, unread: 8 }],
            total: 8,
        });

        state.data.set_unread(c1, 0);
        assert_eq!(state.data.unread.group(group_id), Some(5));
        assert_eq!(state.data.unread.total, 5);

        state.apply_push(PushEvent {
            container_id: None,
            sequence: None,
            body: PushBody::MembershipChanged(MembershipChange { group_id, user_id: me, role: None }),
        });
        assert_eq!(state.data.unread.total, 0);
        assert!(state.data.unread.group(group_id).is_none());
    }

    #[test]
    fn pushes_for_unsummarized_channels_join_their_group() {
        let (me, other) = (Uuid::new_v4(), Uuid::new_v4());
        let group_id = Uuid::new_v4();
        let known = ContainerId::Channel(Uuid::new_v4());
        let fresh = ContainerId::Channel(Uuid::new_v4());
        let mut state = ClientState::new(me);
        state.apply_summary(UnreadSummary {
            per_container: vec![ContainerUnread { container: known, group_id: Some(group_id), unread: 2 }],
            per_group: vec![GroupUnread { group_id, unread: 2 }],
            total: 2,
        });

        let mut message = view(fresh, 1, other, None);
        message.group_id = Some(group_id);
        state.apply_push(appended(message));

        assert_eq!(state.data.unread(fresh), 1);
        assert_eq!(state.data.unread.group(group_id), Some(3));
        assert_eq!(state.data.unread.total, 3);

        let other_group = Uuid::new_v4();
        let mut message = view(ContainerId::Channel(Uuid::new_v4()), 1, other, None);
        message.group_id = Some(other_group);
        state.apply_push(appended(message));
        assert_eq!(state.data.unread.group(other_group), Some(1));
        assert_eq!(state.data.unread.total, 4);
    }

    #[test]
    fn reaction_toggle_is_local_round_trip() {
        let me = Uuid::new_v4();
        let mut state = ClientState::new(me);
        let target = ReactionTarget::message(Uuid::new_v4());

        let first = Uuid::new_v4();
        state.begin_reaction(target, "👍", first);
        assert_eq!(state.data.reactions[&target][0].user_ids, vec![me]);

        let second = Uuid::new_v4();
        state.begin_reaction(target, "👍", second);
        assert!(state.data.reactions[&target].is_empty());
    }
}
