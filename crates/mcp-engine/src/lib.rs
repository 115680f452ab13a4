#![doc = include_str!("../README.md")]

mod error;
pub use error::{EngineError, ErrorData};

/// JSON-RPC 2.0 message model and MCP data types
pub mod model;

pub mod dispatcher;
pub use dispatcher::{Dispatcher, Middleware, PendingRequests, Role};

pub mod session;
pub use session::{InMemorySessionStore, Session, SessionStatus, SessionStore};

pub mod registry;
pub use registry::{CapabilitiesProvider, Gateway, Identity, Registry};

pub mod event_store;
pub use event_store::{EventStore, InMemoryEventStore, SseEvent};

pub mod pubsub;
pub use pubsub::{InProcessAdapter, PollingAdapter, PubSubAdapter, SessionListener};

pub mod transport;
pub use transport::{Transport, TransportConfig, TransportKind, create_transport};

mod engine;
pub use engine::{
    Engine, EngineBuilder, EngineConfig, ProcessOutcome, StreamFrame, session_stream_channel,
};

mod client;
pub use client::{ClientSession, ClientSessionConfig, RequestError};
