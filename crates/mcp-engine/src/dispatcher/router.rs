//! Role-specific method routers. The server router resolves against the
//! injected registries and the session's visibility sets; the client
//! router serves the requests a server may issue back at a client.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::model::{
    CallToolRequestParam, CompleteRequestParam, CompleteResult, CompletionInfo,
    CompletionReference, CreateMessageRequestParam, CreateMessageResult, EmptyResult, ErrorCode,
    ErrorData, GetPromptRequestParam, JsonRpcRequest, ListPromptsResult, ListResourceTemplatesResult,
    ListResourcesResult, ListRootsResult, ListToolsResult, Prompt, ReadResourceRequestParam,
    Resource, ResourceTemplate, SetLoggingLevelRequestParam, SubscribeRequestParam, Tool,
    UnsubscribeRequestParam, method,
};
use crate::registry::Registry;
use crate::session::Session;

fn parse_params<T: serde::de::DeserializeOwned>(
    request: &JsonRpcRequest,
) -> Result<T, ErrorData> {
    let params = request.params.clone().unwrap_or(Value::Null);
    serde_json::from_value(params)
        .map_err(|e| ErrorData::invalid_params(format!("invalid params: {e}"), None))
}

fn to_result<T: serde::Serialize>(result: &T) -> Result<Value, ErrorData> {
    serde_json::to_value(result).map_err(|e| ErrorData::internal_error(e.to_string()))
}

/// Routes `tools/`, `prompts/`, `resources/`, `completion/complete` and
/// `client/setLoggingLevel`. Registry `call` results are passed through
/// verbatim as the JSON-RPC result payload; shaping them is the registry's
/// contract.
pub struct ServerRouter {
    pub tools: Arc<dyn Registry>,
    pub prompts: Arc<dyn Registry>,
    pub resources: Arc<dyn Registry>,
    pub resource_templates: Arc<dyn Registry>,
}

impl ServerRouter {
    pub async fn handle(
        &self,
        request: &JsonRpcRequest,
        session: &Session,
    ) -> Result<Value, ErrorData> {
        match request.method.as_str() {
            method::TOOLS_LIST => self.list_tools(session),
            method::TOOLS_CALL => self.call_tool(request, session).await,
            method::PROMPTS_LIST => self.list_prompts(session),
            method::PROMPTS_GET => self.get_prompt(request, session).await,
            method::RESOURCES_LIST => self.list_resources(session),
            method::RESOURCES_TEMPLATES_LIST => self.list_resource_templates(session),
            method::RESOURCES_READ => self.read_resource(request, session).await,
            method::RESOURCES_SUBSCRIBE => {
                let param: SubscribeRequestParam = parse_params(request)?;
                self.require_resource(&param.uri, session)?;
                to_result(&EmptyResult {})
            }
            method::RESOURCES_UNSUBSCRIBE => {
                let param: UnsubscribeRequestParam = parse_params(request)?;
                self.require_resource(&param.uri, session)?;
                to_result(&EmptyResult {})
            }
            method::COMPLETION_COMPLETE => self.complete(request).await,
            method::SET_LOGGING_LEVEL => {
                let param: SetLoggingLevelRequestParam = parse_params(request)?;
                if !session.logging_enabled {
                    return Err(ErrorData::invalid_request(
                        "logging capability not enabled for this session",
                    ));
                }
                tracing::debug!(session_id = %session.id, level = ?param.level, "logging level set");
                to_result(&EmptyResult {})
            }
            other => Err(ErrorData::method_not_found(other)),
        }
    }

    fn list_tools(&self, session: &Session) -> Result<Value, ErrorData> {
        let tools: Vec<Tool> = self
            .tools
            .entries()
            .into_iter()
            .filter(|entry| session.tool_visible(&entry.name))
            .filter_map(|entry| match serde_json::from_value(entry.definition) {
                Ok(tool) => Some(tool),
                Err(e) => {
                    tracing::warn!(name = %entry.name, "skipping malformed tool definition: {e}");
                    None
                }
            })
            .collect();
        to_result(&ListToolsResult {
            tools,
            next_cursor: None,
        })
    }

    async fn call_tool(
        &self,
        request: &JsonRpcRequest,
        session: &Session,
    ) -> Result<Value, ErrorData> {
        let param: CallToolRequestParam = parse_params(request)?;
        let entry = self
            .tools
            .lookup(&param.name)
            .filter(|_| session.tool_visible(&param.name))
            .ok_or_else(|| {
                ErrorData::new(
                    ErrorCode::METHOD_NOT_FOUND,
                    format!("tool not found: {}", param.name),
                    None,
                )
            })?;
        self.tools.call(&entry, param.arguments).await
    }

    fn list_prompts(&self, session: &Session) -> Result<Value, ErrorData> {
        let prompts: Vec<Prompt> = self
            .prompts
            .entries()
            .into_iter()
            .filter(|entry| session.prompt_visible(&entry.name))
            .filter_map(|entry| serde_json::from_value(entry.definition).ok())
            .collect();
        to_result(&ListPromptsResult {
            prompts,
            next_cursor: None,
        })
    }

    async fn get_prompt(
        &self,
        request: &JsonRpcRequest,
        session: &Session,
    ) -> Result<Value, ErrorData> {
        let param: GetPromptRequestParam = parse_params(request)?;
        let entry = self
            .prompts
            .lookup(&param.name)
            .filter(|_| session.prompt_visible(&param.name))
            .ok_or_else(|| {
                ErrorData::new(
                    ErrorCode::METHOD_NOT_FOUND,
                    format!("prompt not found: {}", param.name),
                    None,
                )
            })?;
        self.prompts.call(&entry, param.arguments).await
    }

    fn list_resources(&self, session: &Session) -> Result<Value, ErrorData> {
        let resources: Vec<Resource> = self
            .resources
            .entries()
            .into_iter()
            .filter(|entry| session.resource_visible(&entry.name))
            .filter_map(|entry| serde_json::from_value(entry.definition).ok())
            .collect();
        to_result(&ListResourcesResult {
            resources,
            next_cursor: None,
        })
    }

    fn list_resource_templates(&self, session: &Session) -> Result<Value, ErrorData> {
        let resource_templates: Vec<ResourceTemplate> = self
            .resource_templates
            .entries()
            .into_iter()
            .filter(|entry| session.resource_visible(&entry.name))
            .filter_map(|entry| serde_json::from_value(entry.definition).ok())
            .collect();
        to_result(&ListResourceTemplatesResult {
            resource_templates,
            next_cursor: None,
        })
    }

    async fn read_resource(
        &self,
        request: &JsonRpcRequest,
        session: &Session,
    ) -> Result<Value, ErrorData> {
        let param: ReadResourceRequestParam = parse_params(request)?;
        let entry = self.require_resource(&param.uri, session)?;
        self.resources
            .call(&entry, Some(serde_json::json!({"uri": param.uri})))
            .await
    }

    /// Resources are keyed by uri in their registry. A miss is the MCP
    /// domain error, not method_not_found.
    fn require_resource(
        &self,
        uri: &str,
        session: &Session,
    ) -> Result<crate::registry::RegistryEntry, ErrorData> {
        self.resources
            .lookup(uri)
            .filter(|entry| session.resource_visible(&entry.name))
            .ok_or_else(|| ErrorData::resource_not_found(uri))
    }

    async fn complete(&self, request: &JsonRpcRequest) -> Result<Value, ErrorData> {
        let param: CompleteRequestParam = parse_params(request)?;
        let (registry, key) = match &param.r#ref {
            CompletionReference::Prompt { name } => (&self.prompts, name.clone()),
            CompletionReference::Resource { uri } => (&self.resource_templates, uri.clone()),
        };
        let Some(entry) = registry.lookup(&key) else {
            return Err(ErrorData::invalid_params(
                format!("unknown completion reference: {key}"),
                None,
            ));
        };
        let arguments = serde_json::json!({
            "complete": {
                "argument": param.argument,
            }
        });
        let result = registry.call(&entry, Some(arguments)).await?;
        if result.is_null() {
            // Reference exists but offers no completions.
            return to_result(&CompleteResult {
                completion: CompletionInfo {
                    values: Vec::new(),
                    total: Some(0),
                    has_more: Some(false),
                },
            });
        }
        Ok(result)
    }
}

/// Client-side provider for `roots/list`.
#[async_trait]
pub trait RootsProvider: Send + Sync {
    async fn list_roots(&self) -> Result<ListRootsResult, ErrorData>;
}

/// Client-side provider for `sampling/createMessage`.
#[async_trait]
pub trait SamplingHandler: Send + Sync {
    async fn create_message(
        &self,
        params: CreateMessageRequestParam,
    ) -> Result<CreateMessageResult, ErrorData>;
}

/// Routes the requests a server issues to a client: `roots/` and
/// `sampling/`. Providers are optional; a missing provider answers
/// method_not_found so the peer knows the capability is absent.
#[derive(Default)]
pub struct ClientRouter {
    pub roots: Option<Arc<dyn RootsProvider>>,
    pub sampling: Option<Arc<dyn SamplingHandler>>,
}

impl ClientRouter {
    pub async fn handle(&self, request: &JsonRpcRequest) -> Result<Value, ErrorData> {
        match request.method.as_str() {
            method::ROOTS_LIST => match &self.roots {
                Some(provider) => to_result(&provider.list_roots().await?),
                None => Err(ErrorData::method_not_found(method::ROOTS_LIST)),
            },
            method::SAMPLING_CREATE_MESSAGE => match &self.sampling {
                Some(handler) => {
                    let params: CreateMessageRequestParam = parse_params(request)?;
                    to_result(&handler.create_message(params).await?)
                }
                None => Err(ErrorData::method_not_found(method::SAMPLING_CREATE_MESSAGE)),
            },
            other => Err(ErrorData::method_not_found(other)),
        }
    }
}
