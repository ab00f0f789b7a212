use std::sync::Arc;

use inkwell_gateway::registry::ConnectionRegistry;

use crate::service::MessagingService;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub service: MessagingService,
    /// Live gateway connections. Shared with the dispatcher.
    pub registry: ConnectionRegistry,
    pub jwt_secret: String,
}

impl AppStateInner {
    pub fn new(service: MessagingService, registry: ConnectionRegistry, jwt_secret: impl Into<String>) -> AppState {
        Arc::new(Self { service, registry, jwt_secret: jwt_secret.into() })
    }
}
