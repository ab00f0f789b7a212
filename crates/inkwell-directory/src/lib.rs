//! Clients for the platform services the messaging core depends on but does
//! not own: the identity lookup (display name and avatar for a user id) and
//! the content-reference lookup (title and existence of a book or news item).
//!
//! Both are side-effect free. Identity failures degrade to the raw id at the
//! call site via [`display_identity`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use inkwell_types::api::ContentRef;
use inkwell_types::events::AuthorView;

/// Upper bound on a single lookup round-trip.
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(3);
/// How long a resolved identity is served before it is fetched again.
const IDENTITY_TTL: Duration = Duration::from_secs(300);
const IDENTITY_CACHE_CAP: usize = 10_000;

pub trait IdentityLookup: Send + Sync {
    fn lookup(&self, user_id: Uuid) -> BoxFuture<'_, Result<AuthorView>>;
}

pub trait ContentLookup: Send + Sync {
    /// `Ok(None)` means the content does not exist.
    fn lookup(&self, content_id: Uuid) -> BoxFuture<'_, Result<Option<ContentRef>>>;
}

pub type SharedIdentity = Arc<dyn IdentityLookup>;
pub type SharedContent = Arc<dyn ContentLookup>;

/// Resolves a display identity, falling back to the raw id on any failure.
pub async fn display_identity(identity: &dyn IdentityLookup, user_id: Uuid) -> AuthorView {
    match identity.lookup(user_id).await {
        Ok(view) => view,
        Err(e) => {
            debug!("Identity lookup for {} failed, using raw id: {:#}", user_id, e);
            AuthorView::raw(user_id)
        }
    }
}

// -- HTTP --

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityResponse {
    display_name: String,
    #[serde(default)]
    avatar: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentResponse {
    title: String,
}

/// Resolved identities with a fixed time to live and a size cap. When full,
/// expired entries go first, then everything.
struct IdentityCache {
    ttl: Duration,
    cap: usize,
    entries: HashMap<Uuid, (Instant, AuthorView)>,
}

impl IdentityCache {
    fn new(ttl: Duration, cap: usize) -> Self {
        Self { ttl, cap, entries: HashMap::new() }
    }

    fn get(&self, user_id: Uuid, now: Instant) -> Option<AuthorView> {
        self.entries
            .get(&user_id)
            .filter(|(stored, _)| now.duration_since(*stored) < self.ttl)
            .map(|(_, view)| view.clone())
    }

    fn insert(&mut self, view: AuthorView, now: Instant) {
        if self.entries.len() >= self.cap && !self.entries.contains_key(&view.id) {
            let ttl = self.ttl;
            self.entries.retain(|_, (stored, _)| now.duration_since(*stored) < ttl);
            if self.entries.len() >= self.cap {
                debug!("Identity cache full, clearing {} entries", self.entries.len());
                self.entries.clear();
            }
        }
        self.entries.insert(view.id, (now, view));
    }
}

/// `GET {base}/users/{id}` against the identity service. Successful answers
/// are cached for a few minutes so renamed users catch up.
pub struct HttpIdentityLookup {
    client: reqwest::Client,
    base_url: String,
    cache: RwLock<IdentityCache>,
}

impl HttpIdentityLookup {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(LOOKUP_TIMEOUT)
            .build()
            .context("building identity client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            cache: RwLock::new(IdentityCache::new(IDENTITY_TTL, IDENTITY_CACHE_CAP)),
        })
    }

    async fn fetch(&self, user_id: Uuid) -> Result<AuthorView> {
        if let Some(hit) = self.cache.read().ok().and_then(|c| c.get(user_id, Instant::now())) {
            return Ok(hit);
        }

        let url = format!("{}/users/{}", self.base_url, user_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()?;
        let body: IdentityResponse = response.json().await.context("decoding identity")?;

        let view = AuthorView { id: user_id, display_name: body.display_name, avatar: body.avatar };
        match self.cache.write() {
            Ok(mut cache) => {
                cache.insert(view.clone(), Instant::now());
            }
            Err(e) => warn!("Identity cache lock poisoned: {}", e),
        }
        Ok(view)
    }
}

impl IdentityLookup for HttpIdentityLookup {
    fn lookup(&self, user_id: Uuid) -> BoxFuture<'_, Result<AuthorView>> {
        Box::pin(self.fetch(user_id))
    }
}

/// `GET {base}/content/{id}` against the content catalog; 404 means missing.
pub struct HttpContentLookup {
    client: reqwest::Client,
    base_url: String,
}

impl HttpContentLookup {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(LOOKUP_TIMEOUT)
            .build()
            .context("building content client")?;
        Ok(Self { client, base_url: base_url.into().trim_end_matches('/').to_string() })
    }

    async fn fetch(&self, content_id: Uuid) -> Result<Option<ContentRef>> {
        let url = format!("{}/content/{}", self.base_url, content_id);
        let response = self.client.get(&url).send().await.with_context(|| format!("GET {url}"))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: ContentResponse = response.error_for_status()?.json().await.context("decoding content")?;
        Ok(Some(ContentRef { id: content_id, title: body.title }))
    }
}

impl ContentLookup for HttpContentLookup {
    fn lookup(&self, content_id: Uuid) -> BoxFuture<'_, Result<Option<ContentRef>>> {
        Box::pin(self.fetch(content_id))
    }
}

// -- Static --

/// In-process directory, used when no service URL is configured and in tests.
/// Unknown users are an error, so renderers fall back to raw ids.
#[derive(Default)]
pub struct StaticDirectory {
    users: RwLock<HashMap<Uuid, AuthorView>>,
    content: RwLock<HashMap<Uuid, ContentRef>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user_id: Uuid, display_name: &str) -> Self {
        if let Ok(users) = self.users.get_mut() {
            users.insert(
                user_id,
                AuthorView { id: user_id, display_name: display_name.to_string(), avatar: None },
            );
        }
        self
    }

    pub fn with_content(mut self, content_id: Uuid, title: &str) -> Self {
        if let Ok(content) = self.content.get_mut() {
            content.insert(content_id, ContentRef { id: content_id, title: title.to_string() });
        }
        self
    }
}

impl IdentityLookup for StaticDirectory {
    fn lookup(&self, user_id: Uuid) -> BoxFuture<'_, Result<AuthorView>> {
        let found = self.users.read().ok().and_then(|u| u.get(&user_id).cloned());
        Box::pin(async move { found.with_context(|| format!("unknown user {user_id}")) })
    }
}

impl ContentLookup for StaticDirectory {
    fn lookup(&self, content_id: Uuid) -> BoxFuture<'_, Result<Option<ContentRef>>> {
        let found = self.content.read().ok().and_then(|c| c.get(&content_id).cloned());
        Box::pin(async move { Ok(found) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_identity_degrades_to_raw_id() {
        let known = Uuid::new_v4();
        let unknown = Uuid::new_v4();
        let directory = StaticDirectory::new().with_user(known, "Ada");

        assert_eq!(display_identity(&directory, known).await.display_name, "Ada");
        assert_eq!(display_identity(&directory, unknown).await, AuthorView::raw(unknown));
    }

    #[tokio::test]
    async fn unreachable_identity_service_degrades_to_raw_id() {
        let identity = HttpIdentityLookup::new("http://127.0.0.1:9").unwrap();
        let user = Uuid::new_v4();
        assert_eq!(display_identity(&identity, user).await, AuthorView::raw(user));
    }

    #[test]
    fn identity_cache_expires_and_stays_bounded() {
        let mut cache = IdentityCache::new(Duration::from_secs(60), 2);
        let start = Instant::now();
        let ada = AuthorView { id: Uuid::new_v4(), display_name: "Ada".into(), avatar: None };
        cache.insert(ada.clone(), start);

        assert_eq!(cache.get(ada.id, start + Duration::from_secs(59)), Some(ada.clone()));
        assert_eq!(cache.get(ada.id, start + Duration::from_secs(60)), None);

        let later = start + Duration::from_secs(61);
        cache.insert(AuthorView::raw(Uuid::new_v4()), later);
        cache.insert(AuthorView::raw(Uuid::new_v4()), later);
        assert_eq!(cache.entries.len(), 2);
        assert!(!cache.entries.contains_key(&ada.id));

        cache.insert(AuthorView::raw(Uuid::new_v4()), later);
        assert_eq!(cache.entries.len(), 1);
    }

    #[tokio::test]
    async fn content_lookup_reports_missing_references() {
        let book = Uuid::new_v4();
        let directory = StaticDirectory::new().with_content(book, "Dune");

        let found = ContentLookup::lookup(&directory, book).await.unwrap();
        assert_eq!(found.map(|c| c.title), Some("Dune".to_string()));
        assert!(ContentLookup::lookup(&directory, Uuid::new_v4()).await.unwrap().is_none());
    }
}
