//! Maps inbound requests to a provider and a JSON-RPC message.
//!
//! Provider resolution, highest priority first:
//!
//! 1. namespace prefix of the tool name (`supabase.list-tables`);
//! 2. `provider` query parameter;
//! 3. `provider` field of the request body;
//! 4. the default provider.
//!
//! An explicitly named provider that is not registered is an error; it never
//! falls back to the default. `all` fans a `tools/list` out to every provider
//! and is rejected for anything else.

use crate::{
    config::ALL_PROVIDERS,
    error::{BridgeError, Result},
    registry::ProviderRegistry,
    session::RpcSession,
};
use futures::future::join_all;
use serde_json::{Value, json};
use std::sync::Arc;
use toolbridge_common::message::{self, MessageKind, RequestId, RpcError};
use tracing::{debug, warn};

/// Separator between provider key and tool name.
pub const NAMESPACE_SEPARATOR: char = '.';

/// Which provider(s) a request targets, before namespace resolution.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ProviderSelector {
    #[default]
    Default,
    Named(String),
    All,
}

impl ProviderSelector {
    /// Interpret an optional `provider` hint. Blank means no hint.
    pub fn from_hint(hint: Option<&str>) -> Self {
        match hint.map(str::trim) {
            None | Some("") => ProviderSelector::Default,
            Some(key) if key.eq_ignore_ascii_case(ALL_PROVIDERS) => ProviderSelector::All,
            Some(key) => ProviderSelector::Named(key.to_string()),
        }
    }

    /// The first explicit selector wins.
    pub fn or(self, fallback: ProviderSelector) -> Self {
        match self {
            ProviderSelector::Default => fallback,
            explicit => explicit,
        }
    }
}

/// Split `provider.tool` at the first separator. Both parts must be non-empty.
pub fn split_namespace(tool_name: &str) -> Option<(&str, &str)> {
    tool_name
        .split_once(NAMESPACE_SEPARATOR)
        .filter(|(provider, tool)| !provider.is_empty() && !tool.is_empty())
}

/// A tool call target after routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolTarget {
    pub provider: String,
    pub tool_name: String,
}

/// Remove and return a top-level `provider` field from a request body.
pub fn take_body_hint(body: &mut Value) -> ProviderSelector {
    let hint = body
        .as_object_mut()
        .and_then(|object| object.remove("provider"));
    ProviderSelector::from_hint(hint.as_ref().and_then(Value::as_str))
}

pub struct ProviderRouter {
    registry: Arc<ProviderRegistry>,
}

impl ProviderRouter {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Resolve the provider and bare tool name of a `tools/call`.
    pub fn resolve_tool(&self, tool_name: &str, selector: &ProviderSelector) -> Result<ToolTarget> {
        if let Some((provider, tool)) = split_namespace(tool_name) {
            return Ok(ToolTarget {
                provider: provider.to_string(),
                tool_name: tool.to_string(),
            });
        }

        let provider = self.resolve_single(selector, "tools/call")?;
        Ok(ToolTarget {
            provider,
            tool_name: tool_name.to_string(),
        })
    }

    /// Resolve a selector that must name exactly one provider.
    pub fn resolve_single(&self, selector: &ProviderSelector, method: &str) -> Result<String> {
        match selector {
            ProviderSelector::Default => Ok(self.registry.default_provider().to_string()),
            ProviderSelector::Named(key) => Ok(key.clone()),
            ProviderSelector::All => Err(BridgeError::InvalidRequest(format!(
                "provider={ALL_PROVIDERS} is not supported for {method}"
            ))),
        }
    }

    /// Invoke one tool and return the provider's raw response.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: Value,
        selector: &ProviderSelector,
    ) -> Result<Value> {
        let target = self.resolve_tool(tool_name, selector)?;
        debug!(provider = %target.provider, tool = %target.tool_name, "Routing tool call");

        let session = self.registry.ensure(&target.provider).await?;
        session
            .call(
                "tools/call",
                Some(json!({ "name": target.tool_name, "arguments": arguments })),
            )
            .await
    }

    /// List tools of one provider (raw response) or of all of them (merged).
    pub async fn list_tools(&self, selector: &ProviderSelector) -> Result<Value> {
        match selector {
            ProviderSelector::All => self.list_all_tools(None).await,
            selector => {
                let key = self.resolve_single(selector, "tools/list")?;
                self.registry.ensure(&key).await?.call("tools/list", None).await
            }
        }
    }

    /// Forward an arbitrary JSON-RPC message.
    ///
    /// Returns `None` for notifications, which get no response.
    pub async fn forward(&self, mut message: Value, selector: ProviderSelector) -> Result<Option<Value>> {
        let kind = MessageKind::of(&message);
        if !matches!(kind, MessageKind::Request | MessageKind::Notification) {
            return Err(BridgeError::InvalidRequest(
                "expected a JSON-RPC request or notification".to_string(),
            ));
        }
        let method = message
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let provider = match method.as_str() {
            "tools/call" => {
                let tool_name = message
                    .pointer("/params/name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        BridgeError::InvalidRequest("tools/call requires params.name".to_string())
                    })?
                    .to_string();
                let target = self.resolve_tool(&tool_name, &selector)?;
                message["params"]["name"] = Value::from(target.tool_name);
                target.provider
            }
            "tools/list" if selector == ProviderSelector::All => {
                if kind == MessageKind::Notification {
                    return Err(BridgeError::InvalidRequest(
                        "tools/list requires an id".to_string(),
                    ));
                }
                let caller_id = RequestId::from_message(&message);
                return self.list_all_tools(caller_id).await.map(Some);
            }
            method => self.resolve_single(&selector, method)?,
        };

        debug!(provider = %provider, method = %method, "Forwarding message");
        let session = self.registry.ensure(&provider).await?;
        if kind == MessageKind::Notification {
            session
                .notify(&method, message.get("params").cloned())
                .await?;
            return Ok(None);
        }
        session.send(message).await.map(Some)
    }

    /// Fan `tools/list` out to every provider and merge the listings.
    ///
    /// Tools keep registration order, then each provider's own order, and
    /// are renamed `provider.tool`. A provider that fails is skipped; if all
    /// fail the first error is returned.
    async fn list_all_tools(&self, caller_id: Option<RequestId>) -> Result<Value> {
        let listings = join_all(
            self.registry
                .providers()
                .iter()
                .map(|session| list_provider_tools(&self.registry, session)),
        )
        .await;

        let mut tools = Vec::new();
        let mut first_error = None;
        let mut succeeded = 0usize;
        for (session, listing) in self.registry.providers().iter().zip(listings) {
            match listing {
                Ok(provider_tools) => {
                    succeeded += 1;
                    tools.extend(provider_tools.into_iter().map(|tool| namespaced(session.name(), tool)));
                }
                Err(e) => {
                    warn!(provider = %session.name(), "Skipping provider in tool listing: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        if succeeded == 0
            && let Some(e) = first_error
        {
            return Err(e);
        }

        let mut response = json!({
            "jsonrpc": message::JSONRPC_VERSION,
            "result": { "tools": tools },
        });
        if let Some(id) = caller_id {
            response["id"] = Value::from(id);
        }
        Ok(response)
    }
}

async fn list_provider_tools(registry: &ProviderRegistry, session: &RpcSession) -> Result<Vec<Value>> {
    let session = registry.ensure(session.name()).await?;
    let response = session.call("tools/list", None).await?;
    if let Some(error) = RpcError::from_response(&response) {
        return Err(BridgeError::Protocol {
            provider: session.name().to_string(),
            code: error.code,
            message: error.message,
        });
    }
    Ok(response
        .pointer("/result/tools")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default())
}

fn namespaced(provider: &str, mut tool: Value) -> Value {
    if let Some(name) = tool.get("name").and_then(Value::as_str) {
        let name = format!("{provider}{NAMESPACE_SEPARATOR}{name}");
        tool["name"] = Value::from(name);
    }
    tool
}
