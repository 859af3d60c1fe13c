//! JSON-RPC server implementation with Unix socket support.
//!
//! One JSON-RPC 2.0 request per line, one response per line. Params are a
//! single named object per method.

use super::handlers::{ApiState, BookhubApiImpl, BookhubApiServer};
use anyhow::{Context, Result};
use jsonrpsee::core::RpcResult;
use jsonrpsee::types::{ErrorCode, ErrorObject};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Handle to a running RPC server
pub struct ServerHandle {
    shutdown: Arc<Mutex<Option<tokio::sync::mpsc::Sender<()>>>>,
    join_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

/// Start the JSON-RPC server on a Unix socket.
///
/// A stale socket file at `socket_path` is removed first.
pub async fn start_server(socket_path: &Path, state: ApiState) -> Result<ServerHandle> {
    if socket_path.exists() {
        warn!("Removing existing socket at {:?}", socket_path);
        std::fs::remove_file(socket_path)
            .with_context(|| format!("Failed to remove existing socket at {:?}", socket_path))?;
    }

    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create socket directory {:?}", parent))?;
    }

    info!("Starting JSON-RPC server on {:?}", socket_path);

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("Failed to bind Unix socket at {:?}", socket_path))?;

    let api = Arc::new(BookhubApiImpl::new(state));

    let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(1);

    let server_task: JoinHandle<()> = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = rx.recv() => {
                    debug!("Server shutdown signal received");
                    break;
                }
                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let api = api.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, api).await {
                                    warn!("Connection handler error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }
    });

    info!("JSON-RPC server started and listening");

    Ok(ServerHandle {
        shutdown: Arc::new(Mutex::new(Some(tx))),
        join_handle: Arc::new(Mutex::new(Some(server_task))),
    })
}

async fn handle_connection(mut stream: UnixStream, api: Arc<BookhubApiImpl>) -> Result<()> {
    let (reader, mut writer) = stream.split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;

        if n == 0 {
            break;
        }

        if line.trim().is_empty() {
            continue;
        }

        // Request bodies carry passwords and tokens.
        debug!("Received request ({} bytes)", line.len());

        let response = match serde_json::from_str::<Value>(&line) {
            Ok(request) => process_request(request, &api).await,
            Err(e) => serde_json::json!({
                "jsonrpc": "2.0",
                "error": {
                    "code": ErrorCode::ParseError.code(),
                    "message": format!("Parse error: {}", e)
                },
                "id": null
            }),
        };

        writer.write_all(response.to_string().as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }

    Ok(())
}

async fn process_request(request: Value, api: &Arc<BookhubApiImpl>) -> Value {
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let method = match request.get("method").and_then(|m| m.as_str()) {
        Some(m) => m,
        None => {
            return serde_json::json!({
                "jsonrpc": "2.0",
                "error": {
                    "code": ErrorCode::InvalidRequest.code(),
                    "message": "Invalid Request: missing method"
                },
                "id": id
            });
        }
    };

    let params = request.get("params").cloned().unwrap_or(Value::Null);
    let api = api.as_ref();

    let result = match method {
        "password_login" => call(params, move |p| api.password_login(p)).await,
        "federated_login" => call(params, move |p| api.federated_login(p)).await,
        "update_credits" => call(params, move |p| api.update_credits(p)).await,
        "unlock_chapter" => call(params, move |p| api.unlock_chapter(p)).await,
        "issue_handoff" => call(params, move |p| api.issue_handoff(p)).await,
        "redeem_handoff" => call(params, move |p| api.redeem_handoff(p)).await,
        "cross_promo" => call(params, move |p| api.cross_promo(p)).await,
        "profile" => call(params, move |p| api.profile(p)).await,
        "ledger_history" => call(params, move |p| api.ledger_history(p)).await,
        "books" => to_result(api.books().await),
        "shelf" => call(params, move |p| api.shelf(p)).await,
        "record_progress" => call(params, move |p| api.record_progress(p)).await,
        _ => Err(ErrorObject::owned(
            ErrorCode::MethodNotFound.code(),
            "Method not found",
            None::<()>,
        )),
    };

    match result {
        Ok(value) => serde_json::json!({
            "jsonrpc": "2.0",
            "result": value,
            "id": id
        }),
        Err(error) => serde_json::json!({
            "jsonrpc": "2.0",
            "error": error,
            "id": id
        }),
    }
}

/// Decode named params into `P`, run the handler and encode its result.
async fn call<P, R, F, Fut>(params: Value, handler: F) -> Result<Value, ErrorObject<'static>>
where
    P: DeserializeOwned,
    R: Serialize,
    F: FnOnce(P) -> Fut,
    Fut: Future<Output = RpcResult<R>>,
{
    let params: P = serde_json::from_value(params).map_err(|e| {
        ErrorObject::owned(
            ErrorCode::InvalidParams.code(),
            format!("Invalid params: {}", e),
            None::<()>,
        )
    })?;

    to_result(handler(params).await)
}

fn to_result<R: Serialize>(result: RpcResult<R>) -> Result<Value, ErrorObject<'static>> {
    let value = result?;
    serde_json::to_value(value).map_err(|e| {
        warn!("Failed to encode RPC result: {}", e);
        ErrorObject::owned(ErrorCode::InternalError.code(), "Internal error", None::<()>)
    })
}

impl ServerHandle {
    /// Stop accepting connections and wait for the accept loop to exit.
    pub async fn stop(&self) -> Result<()> {
        if let Some(tx) = self.shutdown.lock().await.take() {
            let _ = tx.send(()).await;
        }

        if let Some(handle) = self.join_handle.lock().await.take() {
            handle.await?;
        }

        Ok(())
    }
}
