use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use inkwell_types::api::{
    AdvanceReadRequest, ErrorBody, MessagesPage, SendMessageRequest, ToggleReactionRequest, ToggleReactionResponse,
    UnreadSummary,
};
use inkwell_types::events::MessageView;
use inkwell_types::models::{ContainerId, ReactionTarget, ReadAdvance};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("gateway connection failed: {0}")]
    Gateway(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("no response within {0:?}")]
    Timeout(Duration),
}

// -- Comments and reviews (owned by the content service) --

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewComment {
    pub body: String,
    pub correlation_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: Uuid,
    pub content_id: Uuid,
    pub author_id: Uuid,
    pub body: String,
    pub correlation_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewReview {
    pub rating: u8,
    pub body: String,
    pub correlation_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Review {
    pub id: Uuid,
    pub content_id: Uuid,
    pub author_id: Uuid,
    pub rating: u8,
    pub body: String,
    pub correlation_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// The authoritative writes and reads a client session depends on.
pub trait Transport: Send + Sync {
    fn send_message(
        &self,
        container: ContainerId,
        req: &SendMessageRequest,
    ) -> impl Future<Output = Result<MessageView, TransportError>> + Send;

    fn toggle_reaction(
        &self,
        target: ReactionTarget,
        req: &ToggleReactionRequest,
    ) -> impl Future<Output = Result<ToggleReactionResponse, TransportError>> + Send;

    fn post_comment(
        &self,
        content_id: Uuid,
        req: &NewComment,
    ) -> impl Future<Output = Result<Comment, TransportError>> + Send;

    fn post_review(
        &self,
        content_id: Uuid,
        req: &NewReview,
    ) -> impl Future<Output = Result<Review, TransportError>> + Send;

    fn advance_read(
        &self,
        container: ContainerId,
        position: u64,
    ) -> impl Future<Output = Result<ReadAdvance, TransportError>> + Send;

    fn messages_after(
        &self,
        container: ContainerId,
        after: u64,
    ) -> impl Future<Output = Result<MessagesPage, TransportError>> + Send;

    fn unread_summary(&self) -> impl Future<Output = Result<UnreadSummary, TransportError>> + Send;
}

/// REST client for the messaging API and the content service.
pub struct HttpTransport {
    client: Client,
    api_url: String,
    content_url: String,
    token: String,
}

impl HttpTransport {
    pub fn new(
        api_url: impl Into<String>,
        content_url: impl Into<String>,
        token: impl Into<String>,
    ) -> Result<Self, TransportError> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            content_url: content_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn container_url(&self, container: ContainerId) -> String {
        match container {
            ContainerId::Conversation(id) => format!("{}/conversations/{}", self.api_url, id),
            ContainerId::Channel(id) => format!("{}/channels/{}", self.api_url, id),
        }
    }

    async fn call<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, TransportError> {
        let response = request.bearer_auth(&self.token).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<ErrorBody>()
                .await
                .map(|body| body.message)
                .unwrap_or_else(|_| status.to_string());
            return Err(TransportError::Status { status: status.as_u16(), message });
        }
        Ok(response.json().await?)
    }
}

impl Transport for HttpTransport {
    async fn send_message(
        &self,
        container: ContainerId,
        req: &SendMessageRequest,
    ) -> Result<MessageView, TransportError> {
        let url = format!("{}/messages", self.container_url(container));
        self.call(self.client.post(url).json(req)).await
    }

    async fn toggle_reaction(
        &self,
        target: ReactionTarget,
        req: &ToggleReactionRequest,
    ) -> Result<ToggleReactionResponse, TransportError> {
        let url = format!("{}/reactions/{}/{}", self.api_url, target.kind.as_str(), target.id);
        self.call(self.client.post(url).json(req)).await
    }

    async fn post_comment(&self, content_id: Uuid, req: &NewComment) -> Result<Comment, TransportError> {
        let url = format!("{}/content/{}/comments", self.content_url, content_id);
        self.call(self.client.post(url).json(req)).await
    }

    async fn post_review(&self, content_id: Uuid, req: &NewReview) -> Result<Review, TransportError> {
        let url = format!("{}/content/{}/reviews", self.content_url, content_id);
        self.call(self.client.post(url).json(req)).await
    }

    async fn advance_read(&self, container: ContainerId, position: u64) -> Result<ReadAdvance, TransportError> {
        let url = format!("{}/read", self.container_url(container));
        self.call(self.client.post(url).json(&AdvanceReadRequest { position })).await
    }

    async fn messages_after(&self, container: ContainerId, after: u64) -> Result<MessagesPage, TransportError> {
        let url = format!("{}/messages", self.container_url(container));
        self.call(self.client.get(url).query(&[("after", after)])).await
    }

    async fn unread_summary(&self) -> Result<UnreadSummary, TransportError> {
        let url = format!("{}/unread-summary", self.api_url);
        self.call(self.client.get(url)).await
    }
}
