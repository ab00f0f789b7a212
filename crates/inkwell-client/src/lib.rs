pub mod push;
pub mod reconcile;
pub mod session;
pub mod state;
pub mod transport;

pub use reconcile::{FailureNotice, MutationKind, MutationState};
pub use session::ClientSession;
pub use state::{ClientData, ClientState};
pub use transport::{HttpTransport, Transport, TransportError};
