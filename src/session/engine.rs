//! Per-session JSON-RPC tool engine.

use crate::connections::TenantConfig;
use crate::guard::WriteAccessGuard;
use crate::upstream::{find_tool, TaskApi, TOOLS};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const PROTOCOL_VERSION: &str = "2025-03-26";

/// Body that is not JSON at all. Answered by the transport, not the engine.
pub const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const SESSION_CLOSED: i64 = -32000;

/// A running protocol engine bound to one session.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Handles one JSON-RPC message. Returns `None` for notifications.
    async fn handle(&self, message: Value) -> Option<Value>;

    /// Stops the engine. Later messages are answered with an error.
    async fn shutdown(&self);

    fn is_closed(&self) -> bool;
}

/// Builds engines for new sessions.
pub trait EngineFactory: Send + Sync {
    fn build(&self, session_id: &str, config: Arc<TenantConfig>) -> Arc<dyn Engine>;
}

/// Builds [`ProtocolEngine`]s sharing one upstream client.
pub struct ProtocolEngineFactory {
    api: Arc<dyn TaskApi>,
}

impl ProtocolEngineFactory {
    pub fn new(api: Arc<dyn TaskApi>) -> Self {
        Self { api }
    }
}

impl EngineFactory for ProtocolEngineFactory {
    fn build(&self, session_id: &str, config: Arc<TenantConfig>) -> Arc<dyn Engine> {
        Arc::new(ProtocolEngine::new(session_id, config, Arc::clone(&self.api)))
    }
}

/// Serves `initialize`, `ping`, `tools/list` and `tools/call` for one tenant.
pub struct ProtocolEngine {
    session_id: String,
    config: Arc<TenantConfig>,
    api: Arc<dyn TaskApi>,
    guard: WriteAccessGuard,
    closed: AtomicBool,
}

impl ProtocolEngine {
    pub fn new(session_id: &str, config: Arc<TenantConfig>, api: Arc<dyn TaskApi>) -> Self {
        Self {
            session_id: session_id.to_string(),
            config,
            guard: WriteAccessGuard::new(Arc::clone(&api)),
            api,
            closed: AtomicBool::new(false),
        }
    }

    async fn dispatch(&self, method: &str, params: &Value) -> Result<Value, (i64, String)> {
        match method {
            "initialize" => Ok(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": { "listChanged": false } },
                "serverInfo": { "name": "taskbridge", "version": env!("CARGO_PKG_VERSION") }
            })),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(tool_list()),
            "tools/call" => self.call_tool(params).await,
            other => Err((METHOD_NOT_FOUND, format!("method not found: {}", other))),
        }
    }

    async fn call_tool(&self, params: &Value) -> Result<Value, (i64, String)> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| (INVALID_PARAMS, "missing tool name".to_string()))?;
        let tool = find_tool(name).ok_or_else(|| (INVALID_PARAMS, format!("unknown tool: {}", name)))?;
        let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
        if !arguments.is_object() {
            return Err((INVALID_PARAMS, "arguments must be an object".to_string()));
        }

        if tool.mutating {
            if let Err(denied) = self.guard.check(tool.name, &self.config, &arguments).await {
                return Ok(tool_result(denied.to_string(), true));
            }
        }

        match self.api.call_tool(&self.config, tool, &arguments).await {
            Ok(value) => {
                debug!(session_id = %self.session_id, tool = tool.name, "Tool call succeeded");
                Ok(tool_result(value.to_string(), false))
            }
            Err(e) => {
                warn!(session_id = %self.session_id, tool = tool.name, error = %e, "Tool call failed upstream");
                Ok(tool_result(format!("upstream request failed: {}", e), true))
            }
        }
    }
}

#[async_trait]
impl Engine for ProtocolEngine {
    async fn handle(&self, message: Value) -> Option<Value> {
        let Some(object) = message.as_object() else {
            return Some(error_response(Value::Null, INVALID_REQUEST, "expected a JSON-RPC object"));
        };
        let id = object.get("id").cloned();
        let method = object.get("method").and_then(Value::as_str);

        let (Some(method), Some("2.0")) = (method, object.get("jsonrpc").and_then(Value::as_str)) else {
            // Responses from the client carry no method and need no answer
            return id.map(|id| error_response(id, INVALID_REQUEST, "invalid JSON-RPC request"));
        };

        let Some(id) = id else {
            debug!(session_id = %self.session_id, method = %method, "Notification received");
            return None;
        };

        if self.is_closed() {
            return Some(error_response(id, SESSION_CLOSED, "session closed"));
        }

        let params = object.get("params").cloned().unwrap_or(Value::Null);
        Some(match self.dispatch(method, &params).await {
            Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
            Err((code, message)) => error_response(id, code, &message),
        })
    }

    async fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(session_id = %self.session_id, "Engine shut down");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn tool_list() -> Value {
    let tools: Vec<Value> = TOOLS
        .iter()
        .map(|tool| {
            json!({
                "name": tool.name,
                "description": tool.description,
                "inputSchema": { "type": "object", "additionalProperties": true },
                "annotations": { "readOnlyHint": !tool.mutating }
            })
        })
        .collect();
    json!({ "tools": tools })
}

fn tool_result(text: String, is_error: bool) -> Value {
    json!({
        "content": [{ "type": "text", "text": text }],
        "isError": is_error
    })
}

fn error_response(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message }
    })
}
