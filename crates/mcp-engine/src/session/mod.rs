//! Session lifecycle and protocol-version negotiation.
//!
//! A session is created when a connection first shows up, walks through the
//! `initialize` handshake, and is soft-closed on explicit termination or by
//! the expiry sweep. The negotiated protocol version is written exactly once
//! during the handshake and is immutable for the session's lifetime.

mod store;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::model::{
    ClientCapabilities, ErrorCode, ErrorData, Implementation, InitializeRequestParam,
    InitializeResult, ProtocolVersion, ServerCapabilities, method,
};
use crate::registry::SessionCapabilities;

pub use store::{InMemorySessionStore, SessionMutator, SessionStore};

pub type SessionId = Arc<str>;

pub fn session_id() -> SessionId {
    uuid::Uuid::new_v4().to_string().into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Exists, handshake not started.
    Created,
    /// `initialize` accepted, waiting for `notifications/initialized`.
    Initializing,
    Initialized,
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("session closed: {0}")]
    Closed(String),
}

/// One logical client conversation. Mutated only through [`SessionStore`],
/// which serializes writers; everything handed out is a snapshot.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub status: SessionStatus,
    /// Set exactly once by [`Session::initialize`], never rewritten.
    pub protocol_version: Option<ProtocolVersion>,
    pub client_info: Option<Implementation>,
    pub client_capabilities: Option<ClientCapabilities>,
    pub server_info: Implementation,
    pub server_capabilities: ServerCapabilities,
    /// Per-session visibility; `None` per section means unrestricted.
    enabled_tools: Option<HashSet<String>>,
    enabled_prompts: Option<HashSet<String>>,
    enabled_resources: Option<HashSet<String>>,
    pub logging_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(
        server_info: Implementation,
        server_capabilities: ServerCapabilities,
        capabilities: SessionCapabilities,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: session_id(),
            status: SessionStatus::Created,
            protocol_version: None,
            client_info: None,
            client_capabilities: None,
            server_info,
            server_capabilities,
            enabled_tools: capabilities.tools.map(|t| t.into_iter().collect()),
            enabled_prompts: capabilities.prompts.map(|p| p.into_iter().collect()),
            enabled_resources: capabilities.resources.map(|r| r.into_iter().collect()),
            logging_enabled: capabilities.logging,
            created_at: now,
            updated_at: now,
            ended_at: None,
        }
    }

    /// Run the `initialize` handshake. An unsupported requested version is
    /// answered with the unsupported-protocol-version error carrying
    /// `{requested, supported}` and leaves the session un-negotiated.
    pub fn initialize(
        &mut self,
        param: InitializeRequestParam,
    ) -> Result<InitializeResult, ErrorData> {
        if self.status == SessionStatus::Closed {
            return Err(ErrorData::invalid_request("session closed"));
        }
        // The negotiated version is write-once; a repeated initialize
        // cannot move it.
        if self.protocol_version.is_some() {
            return Err(ErrorData::invalid_request("session already initialized"));
        }
        if !param.protocol_version.is_supported() {
            return Err(ErrorData::new(
                ErrorCode::UNSUPPORTED_PROTOCOL_VERSION,
                "Unsupported protocol version",
                Some(json!({
                    "requested": param.protocol_version,
                    "supported": ProtocolVersion::supported(),
                })),
            ));
        }
        self.protocol_version = Some(param.protocol_version.clone());
        self.client_info = Some(param.client_info);
        self.client_capabilities = Some(param.capabilities);
        self.status = SessionStatus::Initializing;
        self.touch();
        Ok(InitializeResult {
            protocol_version: param.protocol_version,
            capabilities: self.server_capabilities.clone(),
            server_info: self.server_info.clone(),
            instructions: None,
        })
    }

    /// `notifications/initialized` arrived; the session is fully open.
    pub fn mark_initialized(&mut self) {
        if self.status == SessionStatus::Initializing {
            self.status = SessionStatus::Initialized;
            self.touch();
        }
    }

    /// Soft close: record the end time and stop accepting writes. The
    /// record stays around so late readers see not-found, not a panic.
    pub fn close(&mut self) {
        if self.status != SessionStatus::Closed {
            self.status = SessionStatus::Closed;
            self.ended_at = Some(Utc::now());
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn is_closed(&self) -> bool {
        self.status == SessionStatus::Closed
    }

    /// Lifecycle gate for inbound requests. Requests racing ahead of
    /// `notifications/initialized` are rejected rather than queued; `ping`,
    /// `initialize` and notifications stay exempt.
    pub fn gate_request(&self, method_name: &str) -> Result<(), ErrorData> {
        if self.status == SessionStatus::Closed {
            return Err(ErrorData::invalid_request("session not found"));
        }
        if Self::is_lifecycle_exempt(method_name) {
            return Ok(());
        }
        match self.status {
            SessionStatus::Initialized => Ok(()),
            _ => Err(ErrorData::invalid_request(
                "session not yet initialized",
            )),
        }
    }

    /// Header gate: once negotiated, an explicit `MCP-Protocol-Version`
    /// header must match exactly. Absent headers pass for backward
    /// compatibility.
    pub fn validate_protocol_header(
        &self,
        method_name: &str,
        header: Option<&str>,
    ) -> Result<(), ErrorData> {
        if Self::is_lifecycle_exempt(method_name) {
            return Ok(());
        }
        let (Some(header), Some(negotiated)) = (header, self.protocol_version.as_ref()) else {
            return Ok(());
        };
        if header == negotiated.as_str() {
            Ok(())
        } else {
            Err(ErrorData::invalid_request(format!(
                "protocol version header {header} does not match negotiated version {negotiated}"
            )))
        }
    }

    fn is_lifecycle_exempt(method_name: &str) -> bool {
        method_name == method::INITIALIZE
            || method_name == method::PING
            || method_name.starts_with("notifications/")
    }

    pub fn tool_visible(&self, name: &str) -> bool {
        self.enabled_tools
            .as_ref()
            .is_none_or(|set| set.contains(name))
    }

    pub fn prompt_visible(&self, name: &str) -> bool {
        self.enabled_prompts
            .as_ref()
            .is_none_or(|set| set.contains(name))
    }

    pub fn resource_visible(&self, name: &str) -> bool {
        self.enabled_resources
            .as_ref()
            .is_none_or(|set| set.contains(name))
    }
}
