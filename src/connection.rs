//! One live connection to a spawned MCP tool-server process.
//!
//! The connection owns the child process exclusively: its stdin is the only
//! write path (serialized behind a mutex so concurrent senders never
//! interleave partial lines), its stdout is drained by exactly one
//! background receive loop, and termination always goes through
//! [`McpConnection::close`] so the receive loop's end-of-stream detection
//! stays consistent.

use crate::config::ServerSpec;
use crate::error::McpError;
use crate::protocol::{
    self, ClientCapabilities, ClientInfo, InboundMessage, InitializeParams, InitializeResult,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ServerCapabilities, ServerInfo,
    ToolCallParams, ToolDescriptor, ToolsListResult, codec,
};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle of a connection. `Failed` is terminal for routing purposes:
/// the manager discards the connection instead of retrying it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Created,
    Ready,
    Failed,
    Closed,
}

/// How far the shutdown escalation had to go before the process exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStep {
    /// Closing stdin was enough.
    Requested,
    /// The process needed a kill signal after the grace period.
    Terminating,
    /// The process survived the signal and was force-killed.
    Killed,
}

/// Per-connection tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    /// How long a caller waits for a matching response before its pending
    /// slot is reclaimed.
    pub request_timeout: Duration,
    /// How long each step of the shutdown escalation waits for exit.
    pub shutdown_grace: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

#[derive(Clone, Debug)]
pub struct McpConnection {
    inner: Arc<ConnectionInner>,
}

#[derive(Debug)]
struct ConnectionInner {
    name: String,
    options: ConnectionOptions,
    state: AsyncMutex<ConnectionState>,
    child: AsyncMutex<Option<Child>>,
    writer: AsyncMutex<Option<BufWriter<ChildStdin>>>,
    pending: AsyncMutex<HashMap<u64, oneshot::Sender<Result<Value, McpError>>>>,
    id_counter: AtomicU64,
    capabilities: AsyncMutex<ServerCapabilities>,
    server_info: AsyncMutex<Option<ServerInfo>>,
    tools: AsyncMutex<Vec<ToolDescriptor>>,
}

impl McpConnection {
    /// Spawn the tool-server process and start its receive loop. The
    /// connection is not usable for tool calls until [`initialize`]
    /// succeeds.
    ///
    /// [`initialize`]: McpConnection::initialize
    pub fn spawn(name: impl Into<String>, spec: &ServerSpec) -> Result<Self, McpError> {
        Self::spawn_with_options(name, spec, ConnectionOptions::default())
    }

    pub fn spawn_with_options(
        name: impl Into<String>,
        spec: &ServerSpec,
        options: ConnectionOptions,
    ) -> Result<Self, McpError> {
        let name = name.into();
        if spec.command.is_empty() {
            return Err(McpError::MissingCommand { server: name });
        }

        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        for (key, value) in &spec.env {
            command.env(key, value);
        }
        if let Some(dir) = &spec.cwd {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| McpError::Spawn {
            server: name.clone(),
            source,
        })?;

        let stdin = child.stdin.take().ok_or_else(|| McpError::Transport {
            server: name.clone(),
            message: "failed to capture server stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| McpError::Transport {
            server: name.clone(),
            message: "failed to capture server stdout".to_string(),
        })?;

        let inner = Arc::new(ConnectionInner {
            name,
            options,
            state: AsyncMutex::new(ConnectionState::Created),
            child: AsyncMutex::new(Some(child)),
            writer: AsyncMutex::new(Some(BufWriter::new(stdin))),
            pending: AsyncMutex::new(HashMap::new()),
            id_counter: AtomicU64::new(1),
            capabilities: AsyncMutex::new(ServerCapabilities::default()),
            server_info: AsyncMutex::new(None),
            tools: AsyncMutex::new(Vec::new()),
        });

        let reader = Arc::clone(&inner);
        tokio::spawn(async move {
            reader.receive_loop(stdout).await;
        });

        Ok(Self { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub async fn state(&self) -> ConnectionState {
        *self.inner.state.lock().await
    }

    /// Run the capability-negotiation handshake: `initialize` request,
    /// `initialized` notification, then an initial tool fetch when the
    /// server advertises tool support. Only after all of that does the
    /// connection become `Ready`; any failure leaves it `Failed` and the
    /// caller decides whether to discard it.
    pub async fn initialize(&self) -> Result<(), McpError> {
        match self.inner.handshake().await {
            Ok(server_info) => {
                *self.inner.state.lock().await = ConnectionState::Ready;
                info!(
                    server = %self.inner.name,
                    remote = server_info.as_deref().unwrap_or("unknown"),
                    "MCP server initialized"
                );
                Ok(())
            }
            Err(err) => {
                let mut state = self.inner.state.lock().await;
                if *state != ConnectionState::Closed {
                    *state = ConnectionState::Failed;
                }
                drop(state);
                warn!(server = %self.inner.name, %err, "failed to initialize MCP server");
                Err(err)
            }
        }
    }

    /// Cached tool descriptors; never touches the network.
    pub async fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.inner.tools.lock().await.clone()
    }

    /// Re-fetch the tool catalogue. No-op unless the connection is `Ready`
    /// and the server advertised tool support; on failure the previous
    /// cache is kept.
    pub async fn refresh_tools(&self) -> Result<(), McpError> {
        self.inner.guarded_refresh().await
    }

    pub async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value, McpError> {
        self.call_tool_with_timeout(tool, arguments, self.inner.options.request_timeout)
            .await
    }

    /// Invoke a tool, waiting up to `wait` for its response. Fails before
    /// sending anything if the connection never completed its handshake.
    pub async fn call_tool_with_timeout(
        &self,
        tool: &str,
        arguments: Value,
        wait: Duration,
    ) -> Result<Value, McpError> {
        match self.state().await {
            ConnectionState::Ready => {}
            ConnectionState::Closed => {
                return Err(McpError::ConnectionClosed {
                    server: self.inner.name.clone(),
                });
            }
            _ => {
                return Err(McpError::NotInitialized {
                    server: self.inner.name.clone(),
                });
            }
        }

        let params = ToolCallParams {
            name: tool.to_string(),
            arguments: match arguments {
                Value::Null => json!({}),
                other => other,
            },
        };
        let params = serde_json::to_value(&params).map_err(|source| McpError::Encode { source })?;
        self.inner
            .send_request_with_timeout(protocol::METHOD_TOOLS_CALL, Some(params), wait)
            .await
    }

    pub async fn capabilities(&self) -> ServerCapabilities {
        self.inner.capabilities.lock().await.clone()
    }

    pub async fn server_info(&self) -> Option<ServerInfo> {
        self.inner.server_info.lock().await.clone()
    }

    /// Number of requests still waiting for a response.
    pub async fn pending_requests(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    /// Orderly shutdown with escalation: close stdin and wait for exit;
    /// signal and wait again; force-kill. Idempotent and infallible; every
    /// remaining waiter is failed with `ConnectionClosed`.
    pub async fn close(&self) -> ShutdownStep {
        self.inner.shutdown().await
    }
}

impl ConnectionInner {
    async fn handshake(&self) -> Result<Option<String>, McpError> {
        let params = InitializeParams {
            protocol_version: protocol::PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: ClientInfo {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };
        let params = serde_json::to_value(&params).map_err(|source| McpError::Encode { source })?;
        let result = self
            .send_request(protocol::METHOD_INITIALIZE, Some(params))
            .await?;
        let negotiated: InitializeResult =
            serde_json::from_value(result).map_err(|source| McpError::Decode { source })?;

        let advertises_tools = negotiated.capabilities.tools.is_some();
        let remote_name = negotiated
            .server_info
            .as_ref()
            .map(|info| info.name.clone());
        {
            *self.capabilities.lock().await = negotiated.capabilities;
        }
        {
            *self.server_info.lock().await = negotiated.server_info;
        }

        self.send_notification(protocol::NOTIFICATION_INITIALIZED, None)
            .await?;

        if advertises_tools {
            self.fetch_tools().await?;
        }

        Ok(remote_name)
    }

    /// Refresh gated on state and capability, shared by the public
    /// `refresh_tools` and the `tools/list_changed` notification path.
    async fn guarded_refresh(&self) -> Result<(), McpError> {
        if *self.state.lock().await != ConnectionState::Ready {
            return Ok(());
        }
        if self.capabilities.lock().await.tools.is_none() {
            return Ok(());
        }
        self.fetch_tools().await
    }

    /// Unconditional `tools/list`; the cache is replaced wholesale and only
    /// on success.
    async fn fetch_tools(&self) -> Result<(), McpError> {
        let result = self
            .send_request(protocol::METHOD_TOOLS_LIST, None)
            .await?;
        let listing: ToolsListResult =
            serde_json::from_value(result).map_err(|source| McpError::Decode { source })?;
        info!(
            server = %self.name,
            count = listing.tools.len(),
            "tool catalogue refreshed"
        );
        *self.tools.lock().await = listing.tools;
        Ok(())
    }

    async fn send_request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        self.send_request_with_timeout(method, params, self.options.request_timeout)
            .await
    }

    async fn send_request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        wait: Duration,
    ) -> Result<Value, McpError> {
        let id = self.id_counter.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        // Insert before writing: a fast response must always find its slot.
        {
            let mut pending = self.pending.lock().await;
            pending.insert(id, tx);
        }

        let request = JsonRpcRequest::new(id, method, params);
        let line = match codec::encode(&request) {
            Ok(line) => line,
            Err(err) => {
                self.pending.lock().await.remove(&id);
                return Err(err);
            }
        };
        if let Err(err) = self.write_line(&line).await {
            self.pending.lock().await.remove(&id);
            return Err(err);
        }

        match timeout(wait, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(McpError::ConnectionClosed {
                server: self.name.clone(),
            }),
            Err(_) => {
                // Reclaim the slot; a response arriving later finds no
                // entry and is dropped by the receive loop.
                self.pending.lock().await.remove(&id);
                Err(McpError::Timeout {
                    server: self.name.clone(),
                    method: method.to_string(),
                    timeout: wait,
                })
            }
        }
    }

    async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let notification = JsonRpcNotification::new(method, params);
        let line = codec::encode(&notification)?;
        self.write_line(&line).await
    }

    async fn send_response(&self, response: &JsonRpcResponse) -> Result<(), McpError> {
        let line = codec::encode(response)?;
        self.write_line(&line).await
    }

    async fn write_line(&self, line: &str) -> Result<(), McpError> {
        let mut writer = self.writer.lock().await;
        let stream = writer.as_mut().ok_or_else(|| McpError::Transport {
            server: self.name.clone(),
            message: "connection is closed".to_string(),
        })?;
        stream
            .write_all(line.as_bytes())
            .await
            .map_err(|source| self.transport_error(source.to_string()))?;
        stream
            .flush()
            .await
            .map_err(|source| self.transport_error(source.to_string()))?;
        Ok(())
    }

    async fn receive_loop(self: Arc<Self>, stdout: ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(raw)) => {
                    let line = raw.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match codec::decode(line) {
                        Ok(InboundMessage::Response(response)) => {
                            self.complete_pending(response).await;
                        }
                        Ok(InboundMessage::Notification(notification)) => {
                            self.dispatch_notification(notification);
                        }
                        Ok(InboundMessage::Request(request)) => {
                            self.answer_server_request(request).await;
                        }
                        Err(err) => {
                            warn!(
                                server = %self.name,
                                line,
                                %err,
                                "dropping undecodable line from MCP server"
                            );
                        }
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(server = %self.name, %err, "error reading from MCP server");
                    break;
                }
            }
        }

        debug!(server = %self.name, "receive loop finished");
        self.fail_all_pending().await;
    }

    async fn complete_pending(&self, response: JsonRpcResponse) {
        let slot = {
            let mut pending = self.pending.lock().await;
            pending.remove(&response.id)
        };
        let Some(sender) = slot else {
            // Already timed out or never ours; late responses are dropped.
            debug!(
                server = %self.name,
                id = response.id,
                "dropping response for unknown or expired request"
            );
            return;
        };

        let outcome = match response.error {
            Some(error) => Err(McpError::Rpc {
                server: self.name.clone(),
                code: error.code,
                message: error.message,
                data: error.data,
            }),
            None => Ok(response.result.unwrap_or(Value::Null)),
        };
        let _ = sender.send(outcome);
    }

    fn dispatch_notification(self: &Arc<Self>, notification: JsonRpcNotification) {
        match notification.method.as_str() {
            protocol::NOTIFICATION_TOOLS_LIST_CHANGED => {
                // The refresh must not run on the receive loop itself: the
                // tools/list response could never be read while the loop is
                // awaiting it.
                let connection = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(err) = connection.guarded_refresh().await {
                        warn!(
                            server = %connection.name,
                            %err,
                            "failed to refresh tool catalogue"
                        );
                    }
                });
            }
            other => {
                debug!(
                    server = %self.name,
                    method = other,
                    "ignoring unrecognized notification"
                );
            }
        }
    }

    async fn answer_server_request(&self, request: JsonRpcRequest) {
        let response = match request.method.as_str() {
            "ping" => JsonRpcResponse::success(request.id, json!({})),
            other => {
                warn!(
                    server = %self.name,
                    method = other,
                    "server sent unsupported request"
                );
                JsonRpcResponse::failure(
                    request.id,
                    -32601,
                    format!("client does not implement method '{other}'"),
                )
            }
        };
        if let Err(err) = self.send_response(&response).await {
            debug!(server = %self.name, %err, "failed to answer server request");
        }
    }

    async fn fail_all_pending(&self) {
        let mut pending = self.pending.lock().await;
        for (_, sender) in pending.drain() {
            let _ = sender.send(Err(McpError::ConnectionClosed {
                server: self.name.clone(),
            }));
        }
    }

    async fn shutdown(&self) -> ShutdownStep {
        {
            let mut state = self.state.lock().await;
            if *state == ConnectionState::Closed {
                return ShutdownStep::Requested;
            }
            *state = ConnectionState::Closed;
        }

        // Dropping the writer closes stdin, the polite way to ask a
        // stdio-transport server to exit.
        {
            self.writer.lock().await.take();
        }

        let child = { self.child.lock().await.take() };
        let step = match child {
            Some(mut child) => {
                if timeout(self.options.shutdown_grace, child.wait())
                    .await
                    .is_ok()
                {
                    ShutdownStep::Requested
                } else {
                    if let Err(err) = child.start_kill() {
                        debug!(
                            server = %self.name,
                            %err,
                            "failed to signal MCP server (may have already exited)"
                        );
                    }
                    if timeout(self.options.shutdown_grace, child.wait())
                        .await
                        .is_ok()
                    {
                        ShutdownStep::Terminating
                    } else {
                        if let Err(err) = child.kill().await {
                            debug!(server = %self.name, %err, "failed to kill MCP server");
                        }
                        ShutdownStep::Killed
                    }
                }
            }
            None => ShutdownStep::Requested,
        };

        info!(server = %self.name, step = ?step, "MCP server shut down");
        self.fail_all_pending().await;
        self.tools.lock().await.clear();
        step
    }

    fn transport_error(&self, message: impl Into<String>) -> McpError {
        McpError::Transport {
            server: self.name.clone(),
            message: message.into(),
        }
    }
}
