pub mod config;

use std::sync::Arc;

use axum::Router;
use tokio::task::JoinHandle;
use tracing::info;

use inkwell_api::{AppStateInner, MessagingService};
use inkwell_db::Database;
use inkwell_directory::{HttpContentLookup, HttpIdentityLookup, SharedContent, SharedIdentity, StaticDirectory};
use inkwell_gateway::bus::EventBus;
use inkwell_gateway::dispatcher::Dispatcher;
use inkwell_gateway::registry::ConnectionRegistry;

pub use config::ServerConfig;

/// The assembled server: the HTTP app plus its running dispatch workers.
pub struct Server {
    pub app: Router,
    pub workers: Vec<JoinHandle<()>>,
}

/// Wires the store, bus, dispatcher and API together. Must run inside a
/// tokio runtime since the dispatch workers are spawned here.
pub fn build(config: &ServerConfig, db: Database) -> anyhow::Result<Server> {
    let db = Arc::new(db);

    let fallback = Arc::new(StaticDirectory::new());
    let identity: SharedIdentity = match &config.identity_url {
        Some(url) => Arc::new(HttpIdentityLookup::new(url.clone())?),
        None => {
            info!("INKWELL_IDENTITY_URL unset, rendering raw user ids");
            fallback.clone()
        }
    };
    let content: SharedContent = match &config.content_url {
        Some(url) => Arc::new(HttpContentLookup::new(url.clone())?),
        None => {
            info!("INKWELL_CONTENT_URL unset, content deep links will not resolve");
            fallback
        }
    };

    let (bus, subscriptions) = EventBus::new(config.dispatch_shards);
    let registry = ConnectionRegistry::new();
    let dispatcher = Dispatcher::new(registry.clone(), db.clone(), identity.clone());
    let workers = dispatcher.start(subscriptions);

    let service = MessagingService::new(db, bus, identity, content, config.pull_limit);
    let state = AppStateInner::new(service, registry, config.jwt_secret.clone());

    Ok(Server { app: inkwell_api::router(state), workers })
}
