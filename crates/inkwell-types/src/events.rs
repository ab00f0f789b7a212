use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ContainerId, Message, ReactionGroup, ReactionTarget, Role};

// -- Bus events (in-process) --

/// A committed state mutation. Exactly one is published per write.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    MessageAppended {
        message: Message,
    },
    MessageDeleted {
        message: Message,
        deleted_by: Uuid,
    },
    ReactionChanged {
        target: ReactionTarget,
        /// Container of the reacted message; `None` for opaque targets.
        container: Option<ContainerId>,
        user_id: Uuid,
        emoji: String,
        added: bool,
        correlation_id: Option<Uuid>,
        reactions: Vec<ReactionGroup>,
    },
    ReadAdvanced {
        user_id: Uuid,
        container: ContainerId,
        position: u64,
    },
    MembershipChanged {
        group_id: Uuid,
        user_id: Uuid,
        /// `None` when the user was removed from the group.
        role: Option<Role>,
        actor_id: Uuid,
    },
}

impl BusEvent {
    pub fn container(&self) -> Option<ContainerId> {
        match self {
            Self::MessageAppended { message } | Self::MessageDeleted { message, .. } => {
                Some(message.container)
            }
            Self::ReactionChanged { container, .. } => *container,
            Self::ReadAdvanced { container, .. } => Some(*container),
            Self::MembershipChanged { .. } => None,
        }
    }

    /// Key used to pick the ordered dispatch shard. Events for the same
    /// container always share a key.
    pub fn ordering_key(&self) -> Uuid {
        match self {
            Self::ReactionChanged { container: None, target, .. } => target.id,
            Self::MembershipChanged { group_id, .. } => *group_id,
            other => other.container().map(|c| c.id()).unwrap_or_default(),
        }
    }

    pub fn kind(&self) -> PushKind {
        match self {
            Self::MessageAppended { .. } => PushKind::MessageAppended,
            Self::MessageDeleted { .. } => PushKind::MessageDeleted,
            Self::ReactionChanged { .. } => PushKind::ReactionChanged,
            Self::ReadAdvanced { .. } => PushKind::ReadAdvanced,
            Self::MembershipChanged { .. } => PushKind::MembershipChanged,
        }
    }
}

// -- Push events (wire) --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PushKind {
    MessageAppended,
    MessageDeleted,
    ReactionChanged,
    ReadAdvanced,
    MembershipChanged,
}

/// Stable wire shape pushed to clients:
/// `{ type, containerId, sequence?, payload }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushEvent {
    pub container_id: Option<ContainerId>,
    /// Present only for container-ordered events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    #[serde(flatten)]
    pub body: PushBody,
}

impl PushEvent {
    pub fn kind(&self) -> PushKind {
        match &self.body {
            PushBody::MessageAppended(_) => PushKind::MessageAppended,
            PushBody::MessageDeleted(_) => PushKind::MessageDeleted,
            PushBody::ReactionChanged(_) => PushKind::ReactionChanged,
            PushBody::ReadAdvanced(_) => PushKind::ReadAdvanced,
            PushBody::MembershipChanged(_) => PushKind::MembershipChanged,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum PushBody {
    MessageAppended(MessageView),
    MessageDeleted(MessageView),
    ReactionChanged(ReactionChange),
    ReadAdvanced(ReadAdvancedPayload),
    MembershipChanged(MembershipChange),
}

/// Display identity attached to rendered payloads. Falls back to the raw id
/// when the identity service cannot be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorView {
    pub id: Uuid,
    pub display_name: String,
    pub avatar: Option<String>,
}

impl AuthorView {
    pub fn raw(id: Uuid) -> Self {
        Self { id, display_name: id.to_string(), avatar: None }
    }
}

/// Rendered message, shared by the push path and the pull path so both
/// produce identical objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub id: Uuid,
    pub container: ContainerId,
    pub sequence: u64,
    pub author: AuthorView,
    /// Empty once the message is deleted.
    pub body: String,
    pub correlation_id: Option<Uuid>,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub reactions: Vec<ReactionGroup>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<Uuid>,
}

impl MessageView {
    pub fn render(message: &Message, author: AuthorView, reactions: Vec<ReactionGroup>) -> Self {
        Self {
            id: message.id,
            container: message.container,
            sequence: message.sequence,
            author,
            body: if message.deleted { String::new() } else { message.body.clone() },
            correlation_id: message.correlation_id,
            deleted: message.deleted,
            created_at: message.created_at,
            reactions,
            group_id: message.group_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionChange {
    pub target: ReactionTarget,
    pub user_id: Uuid,
    pub emoji: String,
    pub added: bool,
    pub correlation_id: Option<Uuid>,
    /// Full reaction set of the target after the change.
    pub reactions: Vec<ReactionGroup>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadAdvancedPayload {
    pub user_id: Uuid,
    pub position: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipChange {
    pub group_id: Uuid,
    pub user_id: Uuid,
    pub role: Option<Role>,
}

// -- Gateway handshake --

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection (legacy clients that cannot pass
    /// the token on the upgrade request)
    Identify { token: String },

    /// Application-level keepalive for clients that cannot answer Ping frames
    Heartbeat,
}

/// First frame sent on every authenticated connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "ready", rename_all = "camelCase")]
pub struct Ready {
    pub user_id: Uuid,
    pub connection_id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_event_has_stable_wire_shape() {
        let user_id = Uuid::from_u128(7);
        let container = ContainerId::Channel(Uuid::from_u128(9));
        let event = PushEvent {
            container_id: Some(container),
            sequence: None,
            body: PushBody::ReadAdvanced(ReadAdvancedPayload { user_id, position: 10 }),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "read-advanced");
        assert_eq!(json["containerId"]["kind"], "channel");
        assert_eq!(json["payload"]["position"], 10);
        assert!(json.get("sequence").is_none());

        let back: PushEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn ordering_key_groups_by_container() {
        let container = ContainerId::Conversation(Uuid::from_u128(3));
        let read = BusEvent::ReadAdvanced { user_id: Uuid::new_v4(), container, position: 1 };
        let reaction = BusEvent::ReactionChanged {
            target: ReactionTarget::message(Uuid::new_v4()),
            container: Some(container),
            user_id: Uuid::new_v4(),
            emoji: "👍".into(),
            added: true,
            correlation_id: None,
            reactions: vec![],
        };
        assert_eq!(read.ordering_key(), reaction.ordering_key());
    }
}
