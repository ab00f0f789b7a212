use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The unit messages are sequenced in and read positions are tracked against.
///
/// A message carries exactly one of these, so a message belonging to both a
/// conversation and a channel cannot be expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ContainerId {
    Conversation(Uuid),
    Channel(Uuid),
}

impl ContainerId {
    pub fn kind(&self) -> ContainerKind {
        match self {
            Self::Conversation(_) => ContainerKind::Conversation,
            Self::Channel(_) => ContainerKind::Channel,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Self::Conversation(id) | Self::Channel(id) => *id,
        }
    }

    pub fn from_parts(kind: ContainerKind, id: Uuid) -> Self {
        match kind {
            ContainerKind::Conversation => Self::Conversation(id),
            ContainerKind::Channel => Self::Channel(id),
        }
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind().as_str(), self.id())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerKind {
    Conversation,
    Channel,
}

impl ContainerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conversation => "conversation",
            Self::Channel => "channel",
        }
    }
}

impl FromStr for ContainerKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "conversation" => Ok(Self::Conversation),
            "channel" => Ok(Self::Channel),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Returned when a stored or requested enum label is not recognised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant(pub String);

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown variant '{}'", self.0)
    }
}

impl std::error::Error for UnknownVariant {}

// -- Conversations, groups, channels --

/// One-to-one conversation. Stored with `user_a < user_b` so each unordered
/// pair maps to exactly one row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: Uuid,
    pub user_a: Uuid,
    pub user_b: Uuid,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn includes(&self, user_id: Uuid) -> bool {
        self.user_a == user_id || self.user_b == user_id
    }

    /// The participant that is not `user_id`.
    pub fn peer_of(&self, user_id: Uuid) -> Option<Uuid> {
        if self.user_a == user_id {
            Some(self.user_b)
        } else if self.user_b == user_id {
            Some(self.user_a)
        } else {
            None
        }
    }
}

/// Orders a pair of users canonically.
pub fn canonical_pair(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
    if a <= b { (a, b) } else { (b, a) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: Uuid,
    pub name: String,
    pub private: bool,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: Uuid,
    pub group_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Member,
    Moderator,
    Administrator,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Member => "member",
            Self::Moderator => "moderator",
            Self::Administrator => "administrator",
        }
    }

    /// Moderators and administrators may delete other members' messages.
    pub fn can_moderate(&self) -> bool {
        matches!(self, Self::Moderator | Self::Administrator)
    }
}

impl FromStr for Role {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "member" => Ok(Self::Member),
            "moderator" => Ok(Self::Moderator),
            "administrator" => Ok(Self::Administrator),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub group_id: Uuid,
    pub user_id: Uuid,
    pub role: Role,
}

// -- Messages --

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub container: ContainerId,
    /// Strictly increasing within `container`, starting at 1.
    pub sequence: u64,
    pub author_id: Uuid,
    pub body: String,
    pub correlation_id: Option<Uuid>,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    /// Owning group of a channel message.
    pub group_id: Option<Uuid>,
}

// -- Reactions --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionTargetKind {
    Message,
    Comment,
    Review,
}

impl ReactionTargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Comment => "comment",
            Self::Review => "review",
        }
    }
}

impl FromStr for ReactionTargetKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(Self::Message),
            "comment" => Ok(Self::Comment),
            "review" => Ok(Self::Review),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Opaque `(kind, id)` pair. The core knows nothing about comments or
/// reviews beyond this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionTarget {
    pub kind: ReactionTargetKind,
    pub id: Uuid,
}

impl ReactionTarget {
    pub fn message(id: Uuid) -> Self {
        Self { kind: ReactionTargetKind::Message, id }
    }
}

impl fmt::Display for ReactionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionGroup {
    pub emoji: String,
    pub count: usize,
    pub user_ids: Vec<Uuid>,
}

impl ReactionGroup {
    /// Groups `(emoji, user)` pairs, sorted by emoji then user so equal sets
    /// compare equal regardless of storage order.
    pub fn collect(pairs: impl IntoIterator<Item = (String, Uuid)>) -> Vec<Self> {
        let mut map: std::collections::BTreeMap<String, Vec<Uuid>> = std::collections::BTreeMap::new();
        for (emoji, user_id) in pairs {
            map.entry(emoji).or_default().push(user_id);
        }
        map.into_iter()
            .map(|(emoji, mut user_ids)| {
                user_ids.sort();
                user_ids.dedup();
                Self { emoji, count: user_ids.len(), user_ids }
            })
            .collect()
    }
}

// -- Read positions --

/// Outcome of a read-position advance. `position` is always the stored value
/// after the call, whether or not it moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadAdvance {
    pub position: u64,
    pub advanced: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_id_wire_shape() {
        let id = Uuid::nil();
        let json = serde_json::to_value(ContainerId::Channel(id)).unwrap();
        assert_eq!(json, serde_json::json!({ "kind": "channel", "id": id }));
        assert_eq!(ContainerId::Channel(id).to_string(), format!("channel:{id}"));
    }

    #[test]
    fn canonical_pair_is_order_independent() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(canonical_pair(a, b), canonical_pair(b, a));
    }

    #[test]
    fn reaction_groups_are_sorted_and_deduped() {
        let u1 = Uuid::from_u128(1);
        let u2 = Uuid::from_u128(2);
        let groups = ReactionGroup::collect(vec![
            ("👍".to_string(), u2),
            ("🔥".to_string(), u1),
            ("👍".to_string(), u1),
            ("👍".to_string(), u1),
        ]);
        assert_eq!(groups.len(), 2);
        let thumbs = groups.iter().find(|g| g.emoji == "👍").unwrap();
        assert_eq!(thumbs.user_ids, vec![u1, u2]);
        assert_eq!(thumbs.count, 2);
    }

    #[test]
    fn roles_round_trip_through_labels() {
        for role in [Role::Member, Role::Moderator, Role::Administrator] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("owner".parse::<Role>().is_err());
        assert!(!Role::Member.can_moderate());
        assert!(Role::Moderator.can_moderate());
    }
}
