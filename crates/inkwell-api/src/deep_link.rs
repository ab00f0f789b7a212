use std::fmt;

use uuid::Uuid;

use inkwell_db::StoreError;
use inkwell_types::api::{DeepLinkView, GroupView};

use crate::error::{ApiError, ApiResult};
use crate::service::MessagingService;

/// A shareable reference to a user, a group or a piece of content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeepLink {
    User(Uuid),
    Group(Uuid),
    Content(Uuid),
}

impl DeepLink {
    /// Builds a link from its path form, `/{kind}/{id}`.
    pub fn parse(kind: &str, id: Uuid) -> ApiResult<Self> {
        match kind {
            "user" => Ok(Self::User(id)),
            "group" => Ok(Self::Group(id)),
            "content" => Ok(Self::Content(id)),
            other => Err(ApiError::BadRequest(format!("unknown deep link kind '{other}'"))),
        }
    }
}

impl fmt::Display for DeepLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user/{id}"),
            Self::Group(id) => write!(f, "group/{id}"),
            Self::Content(id) => write!(f, "content/{id}"),
        }
    }
}

impl MessagingService {
    /// Resolves a deep link for `actor`.
    ///
    /// A user link opens (and lazily creates) the conversation with that
    /// user. Group links never write: members get the group, non-members of a
    /// public group get a preview, and a private group is access-denied.
    pub async fn open_deep_link(&self, actor: Uuid, link: DeepLink) -> ApiResult<DeepLinkView> {
        match link {
            DeepLink::User(peer) => {
                let conversation = self.open_conversation(actor, peer).await?;
                Ok(DeepLinkView::Conversation { conversation })
            }
            DeepLink::Group(group_id) => {
                self.blocking(move |s| {
                    let group = s.require_group(group_id)?;
                    let role = s.db.role_of(group_id, actor)?;
                    if role.is_none() && group.private {
                        return Err(StoreError::Forbidden(format!("group {group_id} is private")).into());
                    }
                    let channels = s.db.list_channels(group_id)?;
                    Ok(match role {
                        Some(role) => DeepLinkView::Group { group: GroupView { group, channels, role: Some(role) } },
                        None => DeepLinkView::GroupPreview { group, channels },
                    })
                })
                .await
            }
            DeepLink::Content(content_id) => {
                let content = self
                    .content()
                    .lookup(content_id)
                    .await
                    .map_err(|e| StoreError::Unavailable(format!("content lookup failed: {e:#}")))?
                    .ok_or_else(|| StoreError::NotFound(format!("content {content_id}")))?;
                Ok(DeepLinkView::Content { content })
            }
        }
    }
}
