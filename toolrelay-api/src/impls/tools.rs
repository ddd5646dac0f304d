//! Tool registry and the protocol handler served behind the relay
//!
//! Two request shapes are accepted on the same endpoint: the shorthand
//! `{"tool": name, "args": {...}}`, answered with `{"result": value}`, and
//! JSON-RPC 2.0 (`initialize`, `ping`, `tools/list`, `tools/call`).

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use http::{Method, StatusCode};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use toolrelay_cluster::{ProtocolHandler, ResponseWriter, SessionContext, TransportRequest};
use tracing::{debug, warn};

use super::jsonrpc::{
    JsonRpcError, JsonRpcId, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    ToolCallParams, MCP_PROTOCOL_VERSION,
};

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("Tool already registered: {0}")]
    DuplicateName(String),
}

/// What a tool can see of the request it serves
pub struct ToolContext {
    pub session: SessionContext,
    pub progress_token: Option<Value>,
}

impl ToolContext {
    /// Emit `notifications/progress` on the session's event stream when the
    /// caller asked for progress.
    pub async fn report_progress(&self, progress: f64, total: Option<f64>) {
        let Some(token) = &self.progress_token else {
            return;
        };
        let mut params = json!({ "progressToken": token, "progress": progress });
        if let Some(total) = total {
            params["total"] = json!(total);
        }
        let notification = JsonRpcNotification::new("notifications/progress", params);
        let message = match serde_json::to_value(&notification) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Failed to serialize progress notification");
                return;
            }
        };
        if let Err(e) = self.session.emit(&message).await {
            warn!(error = %e, "Failed to emit progress notification");
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> Value;

    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError>;
}

/// Returns its `message` argument
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo back the provided message"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "message": { "type": "string", "description": "Text to echo back" }
            },
            "required": ["message"]
        })
    }

    async fn call(&self, args: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        match args.get("message") {
            Some(Value::String(message)) => Ok(Value::String(message.clone())),
            Some(_) => Err(ToolError::InvalidArguments("'message' must be a string".to_string())),
            None => Err(ToolError::InvalidArguments("missing 'message'".to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: DashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in tools
    #[must_use]
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        registry.tools.insert("echo".to_string(), Arc::new(EchoTool));
        registry
    }

    pub fn register(&self, tool: Arc<dyn Tool>) -> Result<(), RegistrationError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(RegistrationError::DuplicateName(name));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|entry| Arc::clone(entry.value()))
    }

    #[must_use]
    pub fn list(&self) -> Vec<ToolDescriptor> {
        let mut tools: Vec<ToolDescriptor> = self
            .tools
            .iter()
            .map(|entry| {
                let tool = entry.value();
                ToolDescriptor {
                    name: tool.name().to_string(),
                    description: tool.description().to_string(),
                    input_schema: tool.input_schema(),
                }
            })
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Protocol handler dispatching to a [`ToolRegistry`]
pub struct ToolHandler {
    tools: Arc<ToolRegistry>,
    server_name: String,
    server_version: String,
}

impl ToolHandler {
    pub fn new(tools: Arc<ToolRegistry>) -> Self {
        Self {
            tools,
            server_name: env!("CARGO_PKG_NAME").to_string(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    async fn handle_shorthand(&self, message: &Value, ctx: SessionContext) -> (StatusCode, Value) {
        let Some(name) = message.get("tool").and_then(Value::as_str) else {
            return (StatusCode::BAD_REQUEST, json!({ "error": "'tool' must be a string" }));
        };
        let Some(tool) = self.tools.get(name) else {
            return (
                StatusCode::NOT_FOUND,
                json!({ "error": format!("Unknown tool: {name}") }),
            );
        };

        let args = message.get("args").cloned().unwrap_or_else(|| json!({}));
        let ctx = ToolContext {
            session: ctx,
            progress_token: None,
        };
        match tool.call(args, &ctx).await {
            Ok(result) => (StatusCode::OK, json!({ "result": result })),
            Err(e @ ToolError::InvalidArguments(_)) => {
                (StatusCode::BAD_REQUEST, json!({ "error": e.to_string() }))
            }
            Err(e @ ToolError::Failed(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": e.to_string() }))
            }
        }
    }

    async fn handle_rpc(&self, request: JsonRpcRequest, ctx: SessionContext) -> Option<JsonRpcResponse> {
        if request.is_notification() {
            debug!(method = %request.method, "Notification received");
            return None;
        }
        let id = request.id.clone().unwrap_or(JsonRpcId::Null);

        let result = match request.method.as_str() {
            "initialize" => Ok(json!({
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": { "tools": { "listChanged": false } },
                "serverInfo": { "name": self.server_name, "version": self.server_version }
            })),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({ "tools": self.tools.list() })),
            "tools/call" => self.call_tool(request.params, ctx).await,
            other => Err(JsonRpcError::method_not_found(other)),
        };

        Some(match result {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(error) => JsonRpcResponse::error(id, error),
        })
    }

    async fn call_tool(&self, params: Option<Value>, ctx: SessionContext) -> Result<Value, JsonRpcError> {
        let params: ToolCallParams = serde_json::from_value(params.unwrap_or(Value::Null))
            .map_err(|e| JsonRpcError::invalid_params(e.to_string()))?;
        let tool = self
            .tools
            .get(&params.name)
            .ok_or_else(|| JsonRpcError::invalid_params(format!("Unknown tool: {}", params.name)))?;

        let ctx = ToolContext {
            session: ctx,
            progress_token: params.meta.and_then(|meta| meta.progress_token),
        };
        let arguments = if params.arguments.is_null() {
            json!({})
        } else {
            params.arguments
        };

        match tool.call(arguments, &ctx).await {
            Ok(value) => {
                ctx.report_progress(1.0, Some(1.0)).await;
                let text = match value {
                    Value::String(text) => text,
                    other => other.to_string(),
                };
                Ok(json!({
                    "content": [{ "type": "text", "text": text }],
                    "isError": false
                }))
            }
            Err(ToolError::InvalidArguments(message)) => Err(JsonRpcError::invalid_params(message)),
            Err(ToolError::Failed(message)) => Ok(json!({
                "content": [{ "type": "text", "text": message }],
                "isError": true
            })),
        }
    }
}

#[async_trait]
impl ProtocolHandler for ToolHandler {
    async fn handle(
        &self,
        ctx: SessionContext,
        request: TransportRequest,
        mut response: Box<dyn ResponseWriter>,
    ) -> anyhow::Result<()> {
        if request.method() != Method::POST {
            response.send_json(
                StatusCode::METHOD_NOT_ALLOWED,
                &json!({ "error": "Method not allowed" }),
            );
            return Ok(());
        }

        let body = request
            .body_stream()
            .fold(Vec::new(), |mut body, chunk| async move {
                body.extend_from_slice(&chunk);
                body
            })
            .await;
        let message: Value = match serde_json::from_slice(&body) {
            Ok(message) => message,
            Err(e) => {
                let error = JsonRpcResponse::error(
                    JsonRpcId::Null,
                    JsonRpcError::parse_error(format!("Invalid JSON: {e}")),
                );
                response.send_json(StatusCode::BAD_REQUEST, &serde_json::to_value(error)?);
                return Ok(());
            }
        };

        if message.get("tool").is_some() {
            let (status, body) = self.handle_shorthand(&message, ctx).await;
            response.send_json(status, &body);
            return Ok(());
        }

        if message.get("jsonrpc").is_some() {
            let request: JsonRpcRequest = match serde_json::from_value(message) {
                Ok(request) => request,
                Err(e) => {
                    let error = JsonRpcResponse::error(
                        JsonRpcId::Null,
                        JsonRpcError::invalid_request(e.to_string()),
                    );
                    response.send_json(StatusCode::BAD_REQUEST, &serde_json::to_value(error)?);
                    return Ok(());
                }
            };
            match self.handle_rpc(request, ctx).await {
                Some(reply) => response.send_json(StatusCode::OK, &serde_json::to_value(reply)?),
                None => response.send_status(StatusCode::ACCEPTED),
            }
            return Ok(());
        }

        response.send_json(
            StatusCode::BAD_REQUEST,
            &json!({ "error": "Expected a JSON-RPC message or a {\"tool\", \"args\"} object" }),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::HeaderMap;
    use std::time::Duration;
    use toolrelay_cluster::transport::CapturedResponse;
    use toolrelay_cluster::{Broker, MemoryBroker};
    use toolrelay_core::models::channel;
    use toolrelay_core::SessionId;

    fn handler() -> ToolHandler {
        ToolHandler::new(Arc::new(ToolRegistry::with_builtin()))
    }

    async fn call(
        handler: &ToolHandler,
        ctx: SessionContext,
        method: Method,
        body: &str,
    ) -> (StatusCode, String) {
        let request = TransportRequest::new(
            method,
            "/mcp".parse().unwrap(),
            HeaderMap::new(),
            Bytes::from(body.to_string()),
        );
        let (writer, completion) = CapturedResponse::new();
        handler.handle(ctx, request, Box::new(writer)).await.unwrap();
        let captured = completion.wait(Duration::from_secs(1)).await.unwrap();
        (
            captured.status,
            String::from_utf8(captured.body.to_vec()).unwrap(),
        )
    }

    fn json_body(body: &str) -> Value {
        serde_json::from_str(body).unwrap()
    }

    #[tokio::test]
    async fn test_shorthand_echo() {
        let (status, body) = call(
            &handler(),
            SessionContext::stateless(),
            Method::POST,
            r#"{"tool":"echo","args":{"message":"hi"}}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(&body), json!({ "result": "hi" }));
    }

    #[tokio::test]
    async fn test_shorthand_errors() {
        let h = handler();
        let (status, _) = call(&h, SessionContext::stateless(), Method::POST, r#"{"tool":"nope"}"#).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&h, SessionContext::stateless(), Method::POST, r#"{"tool":"echo","args":{}}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&h, SessionContext::stateless(), Method::POST, "{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&h, SessionContext::stateless(), Method::GET, "").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_jsonrpc_initialize_and_list() {
        let h = handler();
        let (status, body) = call(
            &h,
            SessionContext::stateless(),
            Method::POST,
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let body = json_body(&body);
        assert_eq!(body["id"], 1);
        assert_eq!(body["result"]["protocolVersion"], MCP_PROTOCOL_VERSION);

        let (_, body) = call(
            &h,
            SessionContext::stateless(),
            Method::POST,
            r#"{"jsonrpc":"2.0","id":"l","method":"tools/list"}"#,
        )
        .await;
        let body = json_body(&body);
        assert_eq!(body["result"]["tools"][0]["name"], "echo");
        assert!(body["result"]["tools"][0]["inputSchema"].is_object());
    }

    #[tokio::test]
    async fn test_jsonrpc_errors_and_notifications() {
        let h = handler();
        let (status, body) = call(
            &h,
            SessionContext::stateless(),
            Method::POST,
            r#"{"jsonrpc":"2.0","id":2,"method":"resources/list"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(&body)["error"]["code"], -32601);

        let (_, body) = call(
            &h,
            SessionContext::stateless(),
            Method::POST,
            r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"missing"}}"#,
        )
        .await;
        assert_eq!(json_body(&body)["error"]["code"], -32602);

        let (status, body) = call(
            &h,
            SessionContext::stateless(),
            Method::POST,
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_null_id_gets_a_reply() {
        let (status, body) = call(
            &handler(),
            SessionContext::stateless(),
            Method::POST,
            r#"{"jsonrpc":"2.0","id":null,"method":"ping"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let body = json_body(&body);
        assert_eq!(body.get("id"), Some(&Value::Null));
        assert_eq!(body["result"], json!({}));
    }

    #[tokio::test]
    async fn test_tools_call_emits_progress_on_session_events() {
        let broker = Arc::new(MemoryBroker::new());
        let session_id = SessionId::new();
        let mut events = broker.subscribe(&channel::events(&session_id)).await.unwrap();
        let ctx = SessionContext::new(session_id, broker.clone());

        let (status, body) = call(
            &handler(),
            ctx,
            Method::POST,
            r#"{"jsonrpc":"2.0","id":4,"method":"tools/call","params":{"name":"echo","arguments":{"message":"hi"},"_meta":{"progressToken":"p1"}}}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let body = json_body(&body);
        assert_eq!(body["result"]["content"][0]["text"], "hi");
        assert_eq!(body["result"]["isError"], false);

        let event = json_body(&events.recv().await.unwrap());
        assert_eq!(event["method"], "notifications/progress");
        assert_eq!(event["params"]["progressToken"], "p1");
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = ToolRegistry::with_builtin();
        assert!(matches!(
            registry.register(Arc::new(EchoTool)),
            Err(RegistrationError::DuplicateName(_))
        ));
        assert_eq!(registry.len(), 1);
    }
}
