//! Streaming document-chat client: WebSocket protocol engine, config and
//! request correlation. Used by the `doc-chat` CLI.

pub mod backoff;
pub mod config;
pub mod connection;
pub mod engine;
pub mod ids;
pub mod messages;
pub mod registry;
pub mod router;

pub use backoff::Backoff;
pub use config::{
    default_config_path, AbandonPolicy, Config, ConfigError, ConnectionSection, RetrievalSection,
    ServerSection,
};
pub use connection::{ConnectionError, ConnectionManager, SocketState, TransportEvent};
pub use engine::{ChatEngine, SendError};
pub use ids::{RequestIdSource, SequentialRequestIds, UuidRequestIds};
pub use messages::{Citation, ClientEvent, Scope, ScopeMode, ServerEvent, UserMessage};
pub use registry::{PendingRequest, RegistryError, RequestRegistry, RequestStatus};
pub use router::{ConversationAssignment, ErrorNotice, Handlers, StreamRouter};
