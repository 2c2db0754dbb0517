use crate::client::ApiClient;
use crate::protocol::{
    CallToolParams, JsonRpcRequest, JsonRpcResponse, RpcError, INTERNAL_ERROR, INVALID_PARAMS,
    METHOD_NOT_FOUND, PARSE_ERROR, PROTOCOL_VERSION,
};
use crate::tools::DispatchError;
use std::future::Future;
use crate::registry;
use crate::tools::Dispatcher;
use anyhow::Result;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, warn};

/// Newline-delimited JSON-RPC over any reader/writer pair until EOF.
pub async fn run<R, W>(mut reader: R, mut writer: W, dispatcher: &Dispatcher) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            info!("stdin closed, shutting down");
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        debug!("← {trimmed}");

        let request: JsonRpcRequest = match serde_json::from_str(trimmed) {
            Ok(r) => r,
            Err(e) => {
                error!("Failed to parse JSON-RPC request: {e}");
                let resp = JsonRpcResponse::err(None, PARSE_ERROR, format!("Parse error: {e}"));
                send(&mut writer, &resp).await?;
                continue;
            }
        };

        if request.id.is_none() {
            info!("Notification: {}", request.method);
            continue;
        }

        let id = request.id.clone();
        let resp = match handle(&request, dispatcher).await {
            Ok(result) => JsonRpcResponse::ok(id, result),
            Err(e) => JsonRpcResponse::err(id, e.code, e.message),
        };

        send(&mut writer, &resp).await?;
    }

    Ok(())
}

pub async fn handle(req: &JsonRpcRequest, dispatcher: &Dispatcher) -> Result<Value, RpcError> {
    match req.method.as_str() {
        "initialize" => {
            info!("Client initialised");
            Ok(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {
                    "tools": {}
                },
                "serverInfo": {
                    "name": "quarri-mcp",
                    "version": env!("CARGO_PKG_VERSION"),
                    "description": "Query and analyse Quarri databases from LLM agents"
                }
            }))
        }

        "ping" => Ok(json!({})),

        "tools/list" => Ok(registry::tool_list()),

        "tools/call" => {
            let params = req.params.clone().ok_or_else(|| RpcError {
                code: INVALID_PARAMS,
                message: "tools/call requires params".into(),
            })?;
            let params: CallToolParams = serde_json::from_value(params).map_err(|e| RpcError {
                code: INVALID_PARAMS,
                message: format!("tools/call: {e}"),
            })?;

            info!("Tool call: {}", params.name);
            let dispatcher = dispatcher.clone();
            isolated(params.name.clone(), async move {
                dispatcher.dispatch(&params.name, &params.arguments).await
            })
            .await
        }

        other => {
            warn!("Unknown method: {other}");
            Err(RpcError { code: METHOD_NOT_FOUND, message: format!("Method not found: {other}") })
        }
    }
}

/// Runs one tool call on its own task so a panic inside it becomes a
/// `-32603` reply instead of ending the session.
async fn isolated<F>(tool: String, call: F) -> Result<Value, RpcError>
where
    F: Future<Output = std::result::Result<Value, DispatchError>> + Send + 'static,
{
    match tokio::spawn(call).await {
        Ok(reply) => reply.map_err(|e| RpcError { code: e.code(), message: e.to_string() }),
        Err(e) => {
            error!("{tool} aborted: {e}");
            Err(RpcError { code: INTERNAL_ERROR, message: format!("Internal error while running {tool}") })
        }
    }
}

/// Best-effort reachability check; never blocks startup.
pub async fn probe_health(client: ApiClient) {
    match client.health().await {
        Ok(_) => info!("backend reachable at {}", client.base_url()),
        Err(e) => warn!("backend health check failed for {}: {e}", client.base_url()),
    }
}

async fn send<W: AsyncWrite + Unpin>(writer: &mut W, resp: &JsonRpcResponse) -> Result<()> {
    let mut json = serde_json::to_string(resp)?;
    json.push('\n');
    debug!("→ {}", json.trim());
    writer.write_all(json.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
