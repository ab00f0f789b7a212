use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use inkwell_types::api::{SendMessageRequest, ToggleReactionRequest};
use inkwell_types::events::{MessageView, PushEvent};
use inkwell_types::models::{ContainerId, ReactionTarget};

use crate::reconcile::{MutationKind, MutationState};
use crate::state::{ClientState, Snapshot};
use crate::transport::{Comment, NewComment, NewReview, Review, Transport, TransportError};

pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// A signed-in user's view of the system.
///
/// Every write is applied locally first, then sent to the server. The call
/// returns only once the write is `Confirmed` or `RolledBack`.
pub struct ClientSession<T: Transport> {
    transport: T,
    state: Arc<Mutex<ClientState>>,
    write_timeout: Duration,
}

impl<T: Transport> ClientSession<T> {
    pub fn new(transport: T, user_id: Uuid) -> Self {
        Self {
            transport,
            state: Arc::new(Mutex::new(ClientState::new(user_id))),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Clone of the current state.
    pub fn state(&self) -> ClientState {
        self.with_state(|s| s.clone())
    }

    /// Shared handle for the push listener.
    pub fn shared_state(&self) -> Arc<Mutex<ClientState>> {
        self.state.clone()
    }

    // The lock is never held across an await.
    fn with_state<R>(&self, f: impl FnOnce(&mut ClientState) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    async fn bounded<R>(&self, call: impl Future<Output = Result<R, TransportError>>) -> Result<R, TransportError> {
        tokio::time::timeout(self.write_timeout, call)
            .await
            .unwrap_or(Err(TransportError::Timeout(self.write_timeout)))
    }

    pub fn apply_push(&self, event: PushEvent) {
        self.with_state(|s| s.apply_push(event));
    }

    pub async fn send_message(&self, container: ContainerId, body: &str) -> MutationState {
        let correlation_id = Uuid::new_v4();
        let snapshot = self.with_state(|s| s.begin_message(container, body, correlation_id));
        let req = SendMessageRequest { body: body.to_string(), correlation_id: Some(correlation_id) };

        match self.bounded(self.transport.send_message(container, &req)).await {
            Ok(message) => self.with_state(|s| {
                s.confirm_message(message);
                s.mutation(correlation_id).unwrap_or(MutationState::Confirmed)
            }),
            Err(e) => self.fail(correlation_id, MutationKind::SendMessage, snapshot, e),
        }
    }

    /// Toggles `emoji` on `target`. A retry after a timeout is safe because
    /// the server treats a replayed correlation id as the same toggle.
    pub async fn toggle_reaction(&self, target: ReactionTarget, emoji: &str) -> MutationState {
        let correlation_id = Uuid::new_v4();
        let snapshot = self.with_state(|s| s.begin_reaction(target, emoji, correlation_id));
        let req = ToggleReactionRequest { emoji: emoji.to_string(), correlation_id: Some(correlation_id) };

        match self.bounded(self.transport.toggle_reaction(target, &req)).await {
            Ok(resp) => self.with_state(|s| {
                s.confirm_reaction(correlation_id, target, resp.reactions);
                s.mutation(correlation_id).unwrap_or(MutationState::Confirmed)
            }),
            Err(e) => self.fail(correlation_id, MutationKind::ToggleReaction, snapshot, e),
        }
    }

    pub async fn post_comment(&self, content_id: Uuid, body: &str) -> MutationState {
        let correlation_id = Uuid::new_v4();
        let snapshot = self.with_state(|s| s.begin_comment(content_id, body, correlation_id));
        let req = NewComment { body: body.to_string(), correlation_id };

        match self.bounded(self.transport.post_comment(content_id, &req)).await {
            Ok(comment) => self.with_state(|s| {
                s.confirm_comment(correlation_id, comment);
                MutationState::Confirmed
            }),
            Err(e) => self.fail(correlation_id, MutationKind::PostComment, snapshot, e),
        }
    }

    pub async fn post_review(&self, content_id: Uuid, rating: u8, body: &str) -> MutationState {
        let correlation_id = Uuid::new_v4();
        let snapshot = self.with_state(|s| s.begin_review(content_id, rating, body, correlation_id));
        let req = NewReview { rating, body: body.to_string(), correlation_id };

        match self.bounded(self.transport.post_review(content_id, &req)).await {
            Ok(review) => self.with_state(|s| {
                s.confirm_review(correlation_id, review);
                MutationState::Confirmed
            }),
            Err(e) => self.fail(correlation_id, MutationKind::PostReview, snapshot, e),
        }
    }

    fn fail(
        &self,
        correlation_id: Uuid,
        kind: MutationKind,
        snapshot: Snapshot,
        error: TransportError,
    ) -> MutationState {
        warn!("{:?} {} failed: {}", kind, correlation_id, error);
        self.with_state(|s| {
            s.roll_back(correlation_id, kind, snapshot, error.to_string());
            s.mutation(correlation_id).unwrap_or(MutationState::RolledBack)
        })
    }

    /// Marks everything loaded in `container` as read. Best effort: a failure
    /// is logged and the next summary pull corrects the local mirror.
    pub async fn mark_read(&self, container: ContainerId) {
        let position = self.with_state(|s| s.data.timelines.get(&container).map_or(0, |t| t.last_sequence()));
        if position == 0 {
            return;
        }
        match self.bounded(self.transport.advance_read(container, position)).await {
            Ok(advance) => self.with_state(|s| s.merge_read_position(container, advance.position)),
            Err(e) => debug!("read advance for {} failed: {}", container, e),
        }
    }

    /// Pulls what was missed in `container` while disconnected, then
    /// refreshes the unread mirror.
    pub async fn catch_up(&self, container: ContainerId) -> Result<Vec<MessageView>, TransportError> {
        let mut fetched = Vec::new();
        loop {
            let after = self.with_state(|s| s.data.timelines.get(&container).map_or(0, |t| t.last_sequence()));
            let page = self.bounded(self.transport.messages_after(container, after)).await?;
            if page.messages.is_empty() {
                break;
            }
            fetched.extend(page.messages.iter().cloned());
            self.with_state(|s| s.apply_page(page.messages));
            if self.with_state(|s| s.data.timelines.get(&container).map_or(0, |t| t.last_sequence())) <= after {
                break;
            }
        }

        let summary = self.bounded(self.transport.unread_summary()).await?;
        self.with_state(|s| s.apply_summary(summary));
        Ok(fetched)
    }

    pub fn comments(&self, content_id: Uuid) -> Vec<Comment> {
        self.with_state(|s| s.data.comments.get(&content_id).cloned().unwrap_or_default())
    }

    pub fn reviews(&self, content_id: Uuid) -> Vec<Review> {
        self.with_state(|s| s.data.reviews.get(&content_id).cloned().unwrap_or_default())
    }
}
