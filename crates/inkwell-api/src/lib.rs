//! HTTP surface of the messaging core: the [`service::MessagingService`]
//! write path, the unread aggregator, and the axum router that exposes them.

pub mod conversations;
pub mod deep_link;
pub mod error;
pub mod groups;
pub mod messages;
pub mod middleware;
pub mod reactions;
pub mod reads;
pub mod router;
pub mod service;
pub mod state;
pub mod unread;

pub use error::{ApiError, ApiResult};
pub use router::router;
pub use service::MessagingService;
pub use state::{AppState, AppStateInner};
