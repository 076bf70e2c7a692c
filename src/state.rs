use std::sync::Arc;
use std::time::Duration;

use crate::auth::IdentityVerifier;
use crate::chat::store::MessageStore;
use crate::presence::PresenceRegistry;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// Persistence boundary for chat messages
    pub store: MessageStore,
    /// Live connections per user; the only cross-session shared state
    pub registry: Arc<PresenceRegistry>,
    /// Credential -> identity collaborator used by the WS handshake
    pub verifier: Arc<dyn IdentityVerifier>,
    /// JWT signing secret (256-bit random key), injected for the REST
    /// Claims extractor
    pub jwt_secret: Vec<u8>,
    /// Idle read deadline for WS sessions; heartbeat ticks at 90% of it
    pub read_deadline: Duration,
}
