use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::{AuthorView, MessageView};
use crate::models::{Channel, ContainerId, Conversation, Group, ReactionGroup, Role};

// -- Auth --

/// JWT claims issued by the external auth service. Shared by the REST
/// middleware and the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub exp: usize,
}

// -- Messages --

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SendMessageRequest {
    pub body: String,
    /// Client-generated id echoed back on the canonical message and the push.
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesQuery {
    /// Return messages with a sequence strictly greater than this.
    #[serde(default, alias = "afterSequence")]
    pub after: u64,
    pub limit: Option<u32>,
}

// -- Reactions --

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ToggleReactionRequest {
    pub emoji: String,
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleReactionResponse {
    pub added: bool,
    pub reactions: Vec<ReactionGroup>,
}

// -- Read positions --

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AdvanceReadRequest {
    pub position: u64,
}

// -- Unread summary --

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerUnread {
    pub container: ContainerId,
    /// Owning group for channels.
    pub group_id: Option<Uuid>,
    pub unread: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupUnread {
    pub group_id: Uuid,
    /// Sum of the group's channel counts.
    pub unread: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadSummary {
    pub per_container: Vec<ContainerUnread>,
    pub per_group: Vec<GroupUnread>,
    pub total: u64,
}

impl UnreadSummary {
    pub fn container(&self, container: ContainerId) -> Option<u64> {
        self.per_container.iter().find(|c| c.container == container).map(|c| c.unread)
    }

    pub fn group(&self, group_id: Uuid) -> Option<u64> {
        self.per_group.iter().find(|g| g.group_id == group_id).map(|g| g.unread)
    }
}

// -- Conversations, groups --

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OpenConversationRequest {
    pub peer_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationView {
    pub conversation: Conversation,
    pub peer: AuthorView,
    pub created: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateGroupRequest {
    pub name: String,
    #[serde(default)]
    pub private: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateChannelRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SetRoleRequest {
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupView {
    pub group: Group,
    pub channels: Vec<Channel>,
    pub role: Option<Role>,
}

// -- Deep links --

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentRef {
    pub id: Uuid,
    pub title: String,
}

/// Resolved deep link. Access-denied and not-found are reported as errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeepLinkView {
    Conversation { conversation: ConversationView },
    Group { group: GroupView },
    /// Public group the requester has not joined.
    GroupPreview { group: Group, channels: Vec<Channel> },
    Content { content: ContentRef },
}

// -- Pull path --

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesPage {
    pub container: ContainerId,
    pub messages: Vec<MessageView>,
}

// -- Errors --

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}
