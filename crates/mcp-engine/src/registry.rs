//! Collaborator seams the engine consumes but does not implement: keyed
//! registries for tools/prompts/resource templates, the authentication
//! gateway, and the per-profile capability configuration. Each ships with a
//! trivial in-memory form for embedding and tests; production embedders
//! bring their own.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::model::ErrorData;

/// One named entry in a registry. `definition` is the serialized descriptor
/// (a `Tool`, `Prompt` or `ResourceTemplate`) the list methods hand back.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub name: String,
    pub definition: Value,
}

/// Keyed lookup-and-invoke store. `lookup` misses are `None`; `call` errors
/// come back as wire-ready [`ErrorData`] so the dispatcher can answer the
/// request without translation.
#[async_trait]
pub trait Registry: Send + Sync {
    fn lookup(&self, name: &str) -> Option<RegistryEntry>;
    fn entries(&self) -> Vec<RegistryEntry>;
    async fn call(&self, entry: &RegistryEntry, arguments: Option<Value>)
    -> Result<Value, ErrorData>;
}

/// Handler signature for [`StaticRegistry`] entries.
pub type RegistryHandler = Arc<
    dyn Fn(Option<Value>) -> Result<Value, ErrorData> + Send + Sync,
>;

/// In-memory registry for embedding and tests. Entries are fixed at
/// construction; there is no runtime registration surface.
#[derive(Default)]
pub struct StaticRegistry {
    entries: HashMap<String, (RegistryEntry, RegistryHandler)>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(
        mut self,
        name: impl Into<String>,
        definition: Value,
        handler: RegistryHandler,
    ) -> Self {
        let name = name.into();
        let entry = RegistryEntry {
            name: name.clone(),
            definition,
        };
        self.entries.insert(name, (entry, handler));
        self
    }
}

#[async_trait]
impl Registry for StaticRegistry {
    fn lookup(&self, name: &str) -> Option<RegistryEntry> {
        self.entries.get(name).map(|(entry, _)| entry.clone())
    }

    fn entries(&self) -> Vec<RegistryEntry> {
        let mut entries: Vec<_> = self
            .entries
            .values()
            .map(|(entry, _)| entry.clone())
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    async fn call(
        &self,
        entry: &RegistryEntry,
        arguments: Option<Value>,
    ) -> Result<Value, ErrorData> {
        let (_, handler) = self
            .entries
            .get(&entry.name)
            .ok_or_else(|| ErrorData::method_not_found(&entry.name))?;
        handler(arguments)
    }
}

/// The recognized identity roles. A fixed set: gateways cannot attach
/// arbitrary attributes to an identity, only pick a role and a subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentityRole {
    User,
    Agent,
    Service,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub role: IdentityRole,
    pub subject: String,
}

/// Credentials extracted from an inbound HTTP request before dispatch.
#[derive(Debug, Clone, Default)]
pub struct AuthRequest {
    pub bearer_token: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, thiserror::Error)]
#[error("unauthorized: {reason}")]
pub struct Unauthorized {
    pub reason: String,
}

/// Pluggable identity resolution. The engine only ever calls
/// `authenticate`; what strategy chain sits behind it is not its concern.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn authenticate(&self, request: &AuthRequest) -> Result<Identity, Unauthorized>;
}

/// Development gateway: everyone is an anonymous user.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllGateway;

#[async_trait]
impl Gateway for AllowAllGateway {
    async fn authenticate(&self, _request: &AuthRequest) -> Result<Identity, Unauthorized> {
        Ok(Identity {
            role: IdentityRole::User,
            subject: "anonymous".to_string(),
        })
    }
}

/// Per-session visibility as resolved from a configuration profile. `None`
/// for a section means every registered name is visible.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionCapabilities {
    pub tools: Option<Vec<String>>,
    pub prompts: Option<Vec<String>>,
    pub resources: Option<Vec<String>>,
    pub logging: bool,
}

/// Resolves a profile name to the capability sets a session starts with.
/// The profile travels as an explicit parameter through the call chain;
/// there is no ambient active-profile state.
pub trait CapabilitiesProvider: Send + Sync {
    fn capabilities_for(&self, profile: &str) -> SessionCapabilities;
}

/// Fixed mapping from profile name to capabilities, falling back to a
/// default profile for unknown names.
pub struct StaticCapabilitiesProvider {
    profiles: HashMap<String, SessionCapabilities>,
    default: SessionCapabilities,
}

impl Default for StaticCapabilitiesProvider {
    fn default() -> Self {
        Self {
            profiles: HashMap::new(),
            default: SessionCapabilities {
                logging: true,
                ..Default::default()
            },
        }
    }
}

impl StaticCapabilitiesProvider {
    pub fn new(default: SessionCapabilities) -> Self {
        Self {
            profiles: HashMap::new(),
            default,
        }
    }

    pub fn with_profile(
        mut self,
        name: impl Into<String>,
        capabilities: SessionCapabilities,
    ) -> Self {
        self.profiles.insert(name.into(), capabilities);
        self
    }
}

impl CapabilitiesProvider for StaticCapabilitiesProvider {
    fn capabilities_for(&self, profile: &str) -> SessionCapabilities {
        self.profiles
            .get(profile)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}
