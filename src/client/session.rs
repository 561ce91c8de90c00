//! Language server session
//!
//! A `Session` owns one running server and everything protocol-related:
//! the framed transport, the dispatch task multiplexing both directions,
//! the correlation table for in-flight requests, the composed capability
//! registry and the ref-counted document store. It walks a fixed state
//! machine: `Idle` → `Starting` → `Handshaking` → `Ready`, then
//! `Draining` → `Terminated` on close. Session-fatal conditions (a lost
//! connection, a server request nothing handles) park an error that every
//! subsequent call surfaces.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::capability::{CapabilityRegistry, units};
use crate::client::builder::SessionConfig;
use crate::client::error::SessionError;
use crate::config::ConfigurationMap;
use crate::document::{DocumentState, DocumentStateManager, read_text_file, write_text_file};
use crate::io::transport::{StreamTransport, Transport as _};
use crate::jsonrpc::correlation::CorrelationTable;
use crate::jsonrpc::error::RpcError;
use crate::jsonrpc::framing::FramedTransport;
use crate::jsonrpc::types::{
    JsonRpcErrorResponse, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, id_key,
};
use crate::server::RunningServer;
use crate::server::select::BackendSelector;
use crate::workspace::{Workspace, path_to_uri};

/// How long `close` waits for the dispatch task to flush and exit
const DISPATCH_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle phase of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Handshaking,
    Ready,
    Draining,
    Terminated,
}

/// Condition that permanently fails a session
#[derive(Debug, Clone)]
enum FatalError {
    UnhandledServerRequest { method: String },
    Transport(String),
}

impl FatalError {
    fn to_session_error(&self) -> SessionError {
        match self {
            FatalError::UnhandledServerRequest { method } => SessionError::UnhandledServerRequest {
                method: method.clone(),
            },
            FatalError::Transport(message) => {
                SessionError::Rpc(RpcError::transport(message.clone()))
            }
        }
    }
}

/// State shared between the session API and the dispatch task
struct SessionShared {
    correlation: CorrelationTable,
    fatal: Mutex<Option<FatalError>>,
}

impl SessionShared {
    fn new() -> Self {
        Self {
            correlation: CorrelationTable::new(),
            fatal: Mutex::new(None),
        }
    }

    /// Record the first fatal error and fail all in-flight requests
    fn set_fatal(&self, error: FatalError) {
        {
            // Intentional .unwrap() - poisoned mutex indicates serious bug
            let mut slot = self.fatal.lock().unwrap();
            if slot.is_none() {
                warn!("Session failed: {error:?}");
                *slot = Some(error);
            }
        }
        self.correlation.abort_all();
    }

    fn fatal_error(&self) -> Option<SessionError> {
        // Intentional .unwrap() - poisoned mutex indicates serious bug
        self.fatal.lock().unwrap().as_ref().map(FatalError::to_session_error)
    }
}

/// An active connection to one language server
pub struct Session {
    state: SessionState,
    profile_name: String,
    language_id: String,
    workspace: Workspace,
    request_timeout: Duration,
    sync_file_changes: bool,
    unmanaged: bool,

    outbound: mpsc::UnboundedSender<String>,
    shared: Arc<SessionShared>,
    registry: Arc<CapabilityRegistry>,
    documents: tokio::sync::Mutex<DocumentStateManager>,
    configuration: Arc<RwLock<ConfigurationMap>>,

    server: RunningServer,
    server_capabilities: Option<lsp_types::ServerCapabilities>,
    server_info: Option<lsp_types::ServerInfo>,
    dispatch_task: JoinHandle<()>,
}

impl Session {
    /// Start a session: select and launch a backend, spawn the dispatch
    /// task and run the initialize handshake (unless unmanaged).
    pub async fn start(config: SessionConfig) -> Result<Self, SessionError> {
        let settings = config.effective_configuration();
        let SessionConfig {
            profile,
            workspace,
            server: choice,
            enable_container,
            request_timeout,
            sync_file_changes,
            unmanaged,
            initialization_options,
            extra_capabilities,
            ..
        } = config;

        info!(profile = %profile.name, "Starting language server session");

        let configuration = Arc::new(RwLock::new(ConfigurationMap::new()));
        let mut capability_units = vec![
            units::text_document_sync(),
            units::dynamic_registration(),
            units::workspace_configuration(Arc::clone(&configuration)),
            units::workspace_folders(workspace.clone()),
            units::window_messages(),
        ];
        capability_units.extend(extra_capabilities);
        let registry = Arc::new(CapabilityRegistry::compose(capability_units));
        debug!(units = ?registry.unit_names(), "Composed capability registry");

        let selector = BackendSelector::new(profile.servers)
            .with_choice(choice)
            .with_container_enabled(enable_container);
        let mut server = selector.select_and_start(&workspace).await?;
        info!(backend = %server.name(), "Server started");

        let transport = server.take_transport().ok_or_else(|| {
            SessionError::Rpc(RpcError::transport("backend produced no transport"))
        })?;

        let shared = Arc::new(SessionShared::new());
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let dispatch_task = tokio::spawn(dispatch_loop(
            FramedTransport::new(transport),
            outbound_rx,
            reply_rx,
            reply_tx,
            Arc::clone(&shared),
            Arc::clone(&registry),
        ));

        let mut session = Session {
            state: SessionState::Handshaking,
            profile_name: profile.name,
            language_id: profile.language_id,
            workspace,
            request_timeout,
            sync_file_changes,
            unmanaged,
            outbound: outbound_tx,
            shared,
            registry,
            documents: tokio::sync::Mutex::new(DocumentStateManager::new()),
            configuration,
            server,
            server_capabilities: None,
            server_info: None,
            dispatch_task,
        };

        if session.unmanaged {
            debug!("Unmanaged session, skipping initialize handshake");
        } else if let Err(e) = session.initialize(initialization_options, settings).await {
            warn!("Handshake failed, tearing down server: {e}");
            session.server.stop().await;
            session.dispatch_task.abort();
            session.state = SessionState::Terminated;
            return Err(e);
        }

        session.state = SessionState::Ready;
        info!("Session ready");
        Ok(session)
    }

    /// The initialize handshake: advertise the composed capabilities,
    /// validate the server's answer and push the initial configuration.
    async fn initialize(
        &mut self,
        initialization_options: Option<Value>,
        settings: Option<Value>,
    ) -> Result<(), SessionError> {
        let root_uri = self
            .workspace
            .root()
            .and_then(|folder| folder.uri.parse::<lsp_types::Uri>().ok());

        let params = lsp_types::InitializeParams {
            process_id: Some(std::process::id()),
            #[allow(deprecated)]
            root_path: None,
            #[allow(deprecated)]
            root_uri,
            initialization_options,
            work_done_progress_params: lsp_types::WorkDoneProgressParams::default(),
            capabilities: self.registry.client_capabilities().clone(),
            trace: Some(lsp_types::TraceValue::Verbose),
            workspace_folders: Some(self.workspace.lsp_folders()),
            client_info: Some(lsp_types::ClientInfo {
                name: self.profile_name.clone(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
            locale: None,
        };

        let result: lsp_types::InitializeResult = self
            .request_as(
                "initialize",
                Some(serde_json::to_value(params).map_err(RpcError::from)?),
            )
            .await?;

        // Capability assertions are a development aid, not a runtime gate
        #[cfg(debug_assertions)]
        self.registry.validate_server(&result.capabilities)?;

        info!(server = ?result.server_info, "Initialize handshake complete");
        self.server_capabilities = Some(result.capabilities);
        self.server_info = result.server_info;

        self.notify("initialized", Some(json!({})))?;

        if let Some(settings) = settings {
            // Intentional .unwrap() - poisoned lock indicates serious bug
            self.configuration
                .write()
                .unwrap()
                .update_global(settings.clone());
            self.notify(
                "workspace/didChangeConfiguration",
                Some(json!({ "settings": settings })),
            )?;
        }

        Ok(())
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn backend_name(&self) -> &str {
        self.server.name()
    }

    /// Capabilities the server reported during initialize; `None` for
    /// unmanaged sessions.
    pub fn server_capabilities(&self) -> Option<&lsp_types::ServerCapabilities> {
        self.server_capabilities.as_ref()
    }

    pub fn server_info(&self) -> Option<&lsp_types::ServerInfo> {
        self.server_info.as_ref()
    }

    fn check_fatal(&self) -> Result<(), SessionError> {
        match self.shared.fatal_error() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn ensure_ready(&self) -> Result<(), SessionError> {
        self.check_fatal()?;
        match self.state {
            SessionState::Handshaking | SessionState::Ready | SessionState::Draining => Ok(()),
            actual => Err(SessionError::InvalidState {
                actual,
                required: SessionState::Ready,
            }),
        }
    }

    fn send_message(&self, message: &JsonRpcMessage) -> Result<(), SessionError> {
        let body = message.to_json()?;
        self.outbound
            .send(body)
            .map_err(|_| SessionError::Rpc(RpcError::transport("dispatch loop terminated")))
    }

    /// Send a request and wait for the matching response.
    ///
    /// Times out after the session's request timeout; the correlation slot
    /// is abandoned so a late answer is dropped instead of leaking.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, SessionError> {
        self.ensure_ready()?;

        let id = uuid::Uuid::new_v4().to_string();
        let receiver = self.shared.correlation.reserve(&id);
        debug!(method, id = %id, "Sending request");

        let message = JsonRpcMessage::Request(JsonRpcRequest::new(id.as_str(), method, params));
        self.send_message(&message)?;

        match tokio::time::timeout(self.request_timeout, receiver).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(error))) => Err(SessionError::ServerError(error)),
            Ok(Err(_)) => {
                // The waiter was dropped; a fatal error explains why
                self.check_fatal()?;
                Err(SessionError::Rpc(RpcError::ChannelClosed { id }))
            }
            Err(_) => {
                self.shared.correlation.abandon(&id);
                Err(SessionError::Rpc(RpcError::request_timeout(
                    method,
                    self.request_timeout,
                )))
            }
        }
    }

    /// `request` with the result deserialized into a typed value
    pub async fn request_as<R: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<R, SessionError> {
        let value = self.request(method, params).await?;
        Ok(serde_json::from_value(value).map_err(RpcError::from)?)
    }

    /// Send a notification; no response is expected
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<(), SessionError> {
        self.ensure_ready()?;
        debug!(method, "Sending notification");
        let message = JsonRpcMessage::Notification(crate::jsonrpc::types::JsonRpcNotification::new(
            method, params,
        ));
        self.send_message(&message)
    }

    /// Merge settings into the global configuration and notify the server
    pub fn update_configuration(&self, settings: Value) -> Result<(), SessionError> {
        self.ensure_ready()?;
        // Intentional .unwrap() - poisoned lock indicates serious bug
        self.configuration
            .write()
            .unwrap()
            .update_global(settings.clone());
        self.notify(
            "workspace/didChangeConfiguration",
            Some(json!({ "settings": settings })),
        )
    }

    /// Open documents with the server, ref-counting repeats.
    ///
    /// Files not yet tracked are read from disk and announced via
    /// `textDocument/didOpen`. Returns the URIs that were newly opened.
    pub async fn open_files<P: AsRef<Path>>(
        &self,
        paths: &[P],
    ) -> Result<Vec<String>, SessionError> {
        self.ensure_ready()?;

        let files: Vec<(String, PathBuf)> = paths
            .iter()
            .map(|p| {
                let path = p.as_ref().to_path_buf();
                (path_to_uri(&path), path)
            })
            .collect();

        let mut documents = self.documents.lock().await;
        let opened = documents.open(&files).await?;
        for uri in &opened {
            if let Some(state) = documents.get(uri) {
                self.notify(
                    "textDocument/didOpen",
                    Some(json!({
                        "textDocument": {
                            "uri": uri,
                            "languageId": self.language_id,
                            "version": state.version,
                            "text": state.content,
                        }
                    })),
                )?;
            }
        }
        Ok(opened)
    }

    /// Release one reference per file, closing documents that reach zero
    /// via `textDocument/didClose`. Returns the URIs that were evicted.
    pub async fn close_files<P: AsRef<Path>>(
        &self,
        paths: &[P],
    ) -> Result<Vec<String>, SessionError> {
        self.ensure_ready()?;

        let uris: Vec<String> = paths.iter().map(|p| path_to_uri(p.as_ref())).collect();
        let mut documents = self.documents.lock().await;
        let evicted = documents.close(&uris);
        for uri in &evicted {
            self.notify(
                "textDocument/didClose",
                Some(json!({ "textDocument": { "uri": uri } })),
            )?;
        }
        Ok(evicted)
    }

    /// Run an operation with the given files open, closing them again on
    /// both the success and the error path.
    pub async fn with_open_files<P, F, Fut, T>(
        &self,
        paths: &[P],
        operation: F,
    ) -> Result<T, SessionError>
    where
        P: AsRef<Path>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SessionError>>,
    {
        self.open_files(paths).await?;
        let result = operation().await;
        let closed = self.close_files(paths).await;
        match (result, closed) {
            (Ok(value), Ok(_)) => Ok(value),
            (Ok(_), Err(close_error)) => Err(close_error),
            (Err(error), _) => Err(error),
        }
    }

    /// Content of a file: the tracked snapshot if open, disk otherwise
    pub async fn read_file<P: AsRef<Path>>(&self, path: P) -> Result<String, SessionError> {
        self.ensure_ready()?;
        let path = path.as_ref();
        let uri = path_to_uri(path);

        {
            let documents = self.documents.lock().await;
            if let Some(state) = documents.get(&uri) {
                return Ok(state.content.clone());
            }
        }

        let (content, _) = read_text_file(path).await?;
        Ok(content)
    }

    /// Write a file to disk. Tracked documents keep their detected
    /// encoding, get a version bump and (unless disabled) a whole-document
    /// `textDocument/didChange`; the new version is returned. Untracked
    /// files are written as UTF-8 and return `None`.
    pub async fn write_file<P: AsRef<Path>>(
        &self,
        path: P,
        content: &str,
    ) -> Result<Option<i32>, SessionError> {
        self.ensure_ready()?;
        let path = path.as_ref();
        let uri = path_to_uri(path);

        let mut documents = self.documents.lock().await;
        let Some(encoding) = documents.get(&uri).map(|state| state.encoding) else {
            drop(documents);
            tokio::fs::write(path, content).await?;
            return Ok(None);
        };

        write_text_file(path, content, encoding).await?;
        let version = documents.update_content(&uri, content.to_string());
        if let Some(version) = version
            && self.sync_file_changes
        {
            self.notify(
                "textDocument/didChange",
                Some(json!({
                    "textDocument": { "uri": uri, "version": version },
                    "contentChanges": [{ "text": content }],
                })),
            )?;
        }
        Ok(version)
    }

    /// Snapshot of a tracked document, if any
    pub async fn document_state<P: AsRef<Path>>(&self, path: P) -> Option<DocumentState> {
        let uri = path_to_uri(path.as_ref());
        self.documents.lock().await.get(&uri).cloned()
    }

    /// Close the session: drain in-flight requests, run the shutdown
    /// handshake (managed sessions only) and stop the server.
    pub async fn close(mut self) -> Result<(), SessionError> {
        info!("Closing session");
        self.state = SessionState::Draining;

        if let Err(e) = self
            .shared
            .correlation
            .wait_until_empty(Some(self.request_timeout))
            .await
        {
            warn!("Proceeding with shutdown: {e}");
        }

        if !self.unmanaged && self.check_fatal().is_ok() {
            match self.request("shutdown", None).await {
                Ok(_) => {
                    if let Err(e) = self.notify("exit", None) {
                        warn!("Failed to send exit notification: {e}");
                    }
                }
                Err(e) => warn!("Shutdown request failed: {e}"),
            }
        }

        // Closing the outbound channel tells the dispatch task to flush
        // queued messages and exit
        let (closed_sender, _) = mpsc::unbounded_channel();
        drop(std::mem::replace(&mut self.outbound, closed_sender));

        if tokio::time::timeout(DISPATCH_EXIT_TIMEOUT, &mut self.dispatch_task)
            .await
            .is_err()
        {
            warn!("Dispatch task did not exit in time; aborting it");
            self.dispatch_task.abort();
        }

        self.server.stop().await;
        self.state = SessionState::Terminated;
        info!("Session terminated");
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state != SessionState::Terminated {
            warn!("Session dropped without close(); force killing server");
            self.dispatch_task.abort();
            self.server.kill_sync();
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("profile", &self.profile_name)
            .field("backend", &self.server.name())
            .finish()
    }
}

/// The single task that owns the framed transport.
///
/// Multiplexes three sources: messages the session wants to send, replies
/// produced by capability handlers, and inbound traffic from the server.
/// Exits when the session closes its outbound channel or the transport
/// fails.
async fn dispatch_loop(
    mut framed: FramedTransport<StreamTransport>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    mut replies: mpsc::UnboundedReceiver<String>,
    reply_sender: mpsc::UnboundedSender<String>,
    shared: Arc<SessionShared>,
    registry: Arc<CapabilityRegistry>,
) {
    let mut to_send: Option<String> = None;
    loop {
        if let Some(body) = to_send.take() {
            if let Err(e) = framed.send(&body).await {
                shared.set_fatal(FatalError::Transport(format!("failed to send message: {e}")));
                break;
            }
        }

        tokio::select! {
            queued = outbound.recv() => match queued {
                Some(body) => to_send = Some(body),
                None => break,
            },
            reply = replies.recv() => match reply {
                Some(body) => to_send = Some(body),
                None => break,
            },
            received = framed.receive() => match received {
                Ok(body) => {
                    if !handle_inbound(&body, &shared, &registry, &reply_sender) {
                        break;
                    }
                }
                Err(e) => {
                    shared.set_fatal(FatalError::Transport(e.to_string()));
                    break;
                }
            },
        }
    }

    shared.correlation.abort_all();
    if let Err(e) = framed.close().await {
        debug!("Error closing transport: {e}");
    }
    debug!("Dispatch loop terminated");
}

/// Route one inbound message. Returns `false` when the session must stop.
fn handle_inbound(
    body: &str,
    shared: &Arc<SessionShared>,
    registry: &Arc<CapabilityRegistry>,
    replies: &mpsc::UnboundedSender<String>,
) -> bool {
    let message = match JsonRpcMessage::from_json(body) {
        Ok(message) => message,
        Err(e) => {
            shared.set_fatal(FatalError::Transport(format!(
                "invalid message from server: {e}"
            )));
            return false;
        }
    };

    match message {
        JsonRpcMessage::Response(response) => {
            shared
                .correlation
                .complete(&id_key(&response.id), Ok(response.result));
            true
        }
        JsonRpcMessage::ErrorResponse(response) => {
            shared
                .correlation
                .complete(&id_key(&response.id), Err(response.error));
            true
        }
        JsonRpcMessage::Request(request) => {
            let Some(handler) = registry.request_handler(&request.method) else {
                // The server is now blocked on an answer this client will
                // never produce; failing loudly beats a silent deadlock
                error!(
                    "No handler for server request '{}'; failing session",
                    request.method
                );
                shared.set_fatal(FatalError::UnhandledServerRequest {
                    method: request.method,
                });
                return false;
            };

            debug!(method = %request.method, "Dispatching server request");
            let replies = replies.clone();
            tokio::spawn(async move {
                let id = request.id.clone();
                let method = request.method.clone();
                let reply = match handler(request).await {
                    Ok(result) => JsonRpcMessage::Response(JsonRpcResponse::new(id, result)),
                    Err(error) => {
                        JsonRpcMessage::ErrorResponse(JsonRpcErrorResponse::new(id, error))
                    }
                };
                match reply.to_json() {
                    Ok(body) => {
                        if replies.send(body).is_err() {
                            debug!("Dispatch loop gone before reply to '{method}' was sent");
                        }
                    }
                    Err(e) => error!("Failed to serialize reply to '{method}': {e}"),
                }
            });
            true
        }
        JsonRpcMessage::Notification(notification) => {
            let handlers = registry.notification_handlers(&notification.method);
            if handlers.is_empty() {
                warn!(
                    "No handler for server notification '{}'",
                    notification.method
                );
            }
            for handler in handlers {
                let notification = notification.clone();
                tokio::spawn(async move {
                    handler(notification).await;
                });
            }
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::builder::{ServerProfile, SessionBuilder};
    use crate::server::error::BackendError;
    use crate::server::select::{DefaultServers, ServerChoice};
    use crate::server::{ContainerServer, LocalServer, RunningServer, ServerBackend};
    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Backend whose "server" is the other end of an in-memory pipe
    struct PipeBackend {
        transport: Mutex<Option<StreamTransport>>,
    }

    #[async_trait]
    impl ServerBackend for PipeBackend {
        fn name(&self) -> String {
            "pipe".to_string()
        }

        async fn check_availability(&self) -> Result<(), BackendError> {
            Ok(())
        }

        async fn start(&self, _workspace: &Workspace) -> Result<RunningServer, BackendError> {
            let transport = self
                .transport
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| BackendError::runtime("transport already taken"))?;
            Ok(RunningServer::from_transport("pipe".to_string(), transport))
        }
    }

    /// Scripted peer driving the server side of the pipe
    struct FakeServer {
        io: DuplexStream,
        buffer: Vec<u8>,
    }

    impl FakeServer {
        fn pipe() -> (PipeBackend, FakeServer) {
            let (client_end, server_end) = tokio::io::duplex(64 * 1024);
            let (read_half, write_half) = tokio::io::split(client_end);
            (
                PipeBackend {
                    transport: Mutex::new(Some(StreamTransport::new(read_half, write_half))),
                },
                FakeServer {
                    io: server_end,
                    buffer: Vec::new(),
                },
            )
        }

        async fn recv(&mut self) -> Value {
            loop {
                if let Some(body) = self.try_extract() {
                    return serde_json::from_str(&body).unwrap();
                }
                let mut chunk = [0u8; 4096];
                let n = self.io.read(&mut chunk).await.unwrap();
                assert!(n > 0, "client closed the connection mid-read");
                self.buffer.extend_from_slice(&chunk[..n]);
            }
        }

        fn try_extract(&mut self) -> Option<String> {
            let header_end = self.buffer.windows(4).position(|w| w == b"\r\n\r\n")? + 4;
            let header = std::str::from_utf8(&self.buffer[..header_end]).unwrap();
            let length: usize = header
                .lines()
                .find_map(|line| line.strip_prefix("Content-Length:"))
                .unwrap()
                .trim()
                .parse()
                .unwrap();
            if self.buffer.len() < header_end + length {
                return None;
            }
            let body =
                String::from_utf8(self.buffer[header_end..header_end + length].to_vec()).unwrap();
            self.buffer.drain(..header_end + length);
            Some(body)
        }

        async fn send(&mut self, message: &Value) {
            let body = serde_json::to_string(message).unwrap();
            let frame = format!("Content-Length: {}\r\n\r\n{}", body.len(), body);
            self.io.write_all(frame.as_bytes()).await.unwrap();
        }

        /// Answer `initialize` and swallow the `initialized` notification
        async fn serve_handshake(&mut self) -> Value {
            let initialize = self.recv().await;
            assert_eq!(initialize["method"], "initialize");
            self.send(&json!({
                "jsonrpc": "2.0",
                "id": initialize["id"],
                "result": {
                    "capabilities": { "textDocumentSync": 1 },
                    "serverInfo": { "name": "fake-server" }
                }
            }))
            .await;
            let initialized = self.recv().await;
            assert_eq!(initialized["method"], "initialized");
            initialize
        }

        async fn serve_shutdown(&mut self) {
            let shutdown = self.recv().await;
            assert_eq!(shutdown["method"], "shutdown");
            self.send(&json!({ "jsonrpc": "2.0", "id": shutdown["id"], "result": null }))
                .await;
            let exit = self.recv().await;
            assert_eq!(exit["method"], "exit");
        }
    }

    fn test_profile() -> ServerProfile {
        ServerProfile::new(
            "fake",
            "python",
            DefaultServers {
                local: LocalServer::new("fake-language-server"),
                container: ContainerServer::new("fake/image:latest"),
            },
        )
    }

    fn builder(backend: PipeBackend, workspace: Workspace) -> SessionBuilder {
        SessionBuilder::new(test_profile(), workspace)
            .server(ServerChoice::Instance(Box::new(backend)))
            .request_timeout(Duration::from_secs(5))
    }

    async fn start_session(backend: PipeBackend, server: &mut FakeServer) -> Session {
        let (session, initialize) = tokio::join!(
            builder(backend, Workspace::single("/tmp/ws")).start(),
            server.serve_handshake()
        );
        assert_eq!(initialize["params"]["clientInfo"]["name"], "fake");
        session.unwrap()
    }

    #[tokio::test]
    async fn test_handshake_request_and_clean_close() {
        let (backend, mut server) = FakeServer::pipe();
        let session = start_session(backend, &mut server).await;

        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.server_info().unwrap().name, "fake-server");

        let (result, _) = tokio::join!(session.request("custom/echo", Some(json!({"x": 1}))), async {
            let request = server.recv().await;
            assert_eq!(request["method"], "custom/echo");
            server
                .send(&json!({
                    "jsonrpc": "2.0",
                    "id": request["id"],
                    "result": request["params"],
                }))
                .await;
        });
        assert_eq!(result.unwrap(), json!({"x": 1}));

        let (closed, _) = tokio::join!(session.close(), server.serve_shutdown());
        closed.unwrap();
    }

    #[tokio::test]
    async fn test_server_error_response_surfaces() {
        let (backend, mut server) = FakeServer::pipe();
        let session = start_session(backend, &mut server).await;

        let (result, _) = tokio::join!(session.request("custom/fail", None), async {
            let request = server.recv().await;
            server
                .send(&json!({
                    "jsonrpc": "2.0",
                    "id": request["id"],
                    "error": { "code": -32601, "message": "Method not found" },
                }))
                .await;
        });

        match result {
            Err(SessionError::ServerError(error)) => assert_eq!(error.code, -32601),
            other => panic!("Expected server error, got: {other:?}"),
        }

        let (closed, _) = tokio::join!(session.close(), server.serve_shutdown());
        closed.unwrap();
    }

    #[tokio::test]
    async fn test_configuration_request_answered_from_map() {
        let (backend, mut server) = FakeServer::pipe();
        let session = start_session(backend, &mut server).await;

        session
            .update_configuration(json!({"telemetry": {"enabled": false}}))
            .unwrap();
        let notification = server.recv().await;
        assert_eq!(notification["method"], "workspace/didChangeConfiguration");
        assert_eq!(
            notification["params"]["settings"]["telemetry"]["enabled"],
            json!(false)
        );

        server
            .send(&json!({
                "jsonrpc": "2.0",
                "id": 100,
                "method": "workspace/configuration",
                "params": { "items": [{ "section": "telemetry.enabled" }] },
            }))
            .await;
        let reply = server.recv().await;
        assert_eq!(reply["id"], json!(100));
        assert_eq!(reply["result"], json!([false]));

        let (closed, _) = tokio::join!(session.close(), server.serve_shutdown());
        closed.unwrap();
    }

    #[tokio::test]
    async fn test_unhandled_server_request_is_fatal() {
        let (backend, mut server) = FakeServer::pipe();
        let session = start_session(backend, &mut server).await;

        server
            .send(&json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "workspace/applyEdit",
                "params": {},
            }))
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        match session.request("custom/anything", None).await {
            Err(SessionError::UnhandledServerRequest { method }) => {
                assert_eq!(method, "workspace/applyEdit");
            }
            other => panic!("Expected unhandled-request error, got: {other:?}"),
        }

        // Close succeeds but skips the shutdown handshake
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_write_read_close_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.py");
        std::fs::write(&path, "x = 1").unwrap();

        let (backend, mut server) = FakeServer::pipe();
        let (session, _) = tokio::join!(
            builder(backend, Workspace::single(dir.path())).start(),
            server.serve_handshake()
        );
        let session = session.unwrap();

        let opened = session.open_files(&[&path]).await.unwrap();
        assert_eq!(opened.len(), 1);
        let did_open = server.recv().await;
        assert_eq!(did_open["method"], "textDocument/didOpen");
        assert_eq!(did_open["params"]["textDocument"]["text"], "x = 1");
        assert_eq!(did_open["params"]["textDocument"]["languageId"], "python");
        assert_eq!(did_open["params"]["textDocument"]["version"], 0);

        // Second open: ref count bump, no second didOpen
        assert!(session.open_files(&[&path]).await.unwrap().is_empty());

        let version = session.write_file(&path, "x = 2").await.unwrap();
        assert_eq!(version, Some(1));
        let did_change = server.recv().await;
        assert_eq!(did_change["method"], "textDocument/didChange");
        assert_eq!(did_change["params"]["textDocument"]["version"], 1);
        assert_eq!(did_change["params"]["contentChanges"][0]["text"], "x = 2");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "x = 2");

        assert_eq!(session.read_file(&path).await.unwrap(), "x = 2");

        // First close drops a reference, second evicts and notifies
        assert!(session.close_files(&[&path]).await.unwrap().is_empty());
        let evicted = session.close_files(&[&path]).await.unwrap();
        assert_eq!(evicted.len(), 1);
        let did_close = server.recv().await;
        assert_eq!(did_close["method"], "textDocument/didClose");
        assert!(session.document_state(&path).await.is_none());

        let (closed, _) = tokio::join!(session.close(), server.serve_shutdown());
        closed.unwrap();
    }

    #[tokio::test]
    async fn test_write_untracked_file_returns_no_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");

        let (backend, mut server) = FakeServer::pipe();
        let (session, _) = tokio::join!(
            builder(backend, Workspace::single(dir.path())).start(),
            server.serve_handshake()
        );
        let session = session.unwrap();

        assert_eq!(session.write_file(&path, "hello").await.unwrap(), None);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");

        let (closed, _) = tokio::join!(session.close(), server.serve_shutdown());
        closed.unwrap();
    }

    #[tokio::test]
    async fn test_request_timeout_abandons_correlation_slot() {
        let (backend, mut server) = FakeServer::pipe();
        let (session, _) = tokio::join!(
            builder(backend, Workspace::single("/tmp/ws"))
                .request_timeout(Duration::from_millis(100))
                .start(),
            server.serve_handshake()
        );
        let session = session.unwrap();

        let (result, _) = tokio::join!(session.request("custom/slow", None), async {
            // Receive the request but never answer it
            let request = server.recv().await;
            assert_eq!(request["method"], "custom/slow");
        });

        assert!(matches!(
            result,
            Err(SessionError::Rpc(RpcError::RequestTimeout { .. }))
        ));
        assert!(session.shared.correlation.is_empty());
    }

    #[tokio::test]
    async fn test_unmanaged_session_skips_handshakes() {
        let (backend, mut server) = FakeServer::pipe();
        let session = builder(backend, Workspace::single("/tmp/ws"))
            .unmanaged()
            .start()
            .await
            .unwrap();

        assert_eq!(session.state(), SessionState::Ready);
        assert!(session.server_capabilities().is_none());

        // The very first message is ours, proving no initialize happened
        session.notify("custom/ping", None).unwrap();
        let ping = server.recv().await;
        assert_eq!(ping["method"], "custom/ping");

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_with_open_files_closes_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.py");
        std::fs::write(&path, "x = 1").unwrap();

        let (backend, mut server) = FakeServer::pipe();
        let (session, _) = tokio::join!(
            builder(backend, Workspace::single(dir.path())).start(),
            server.serve_handshake()
        );
        let session = session.unwrap();

        let result: Result<(), SessionError> = session
            .with_open_files(&[&path], || async {
                Err(SessionError::Rpc(RpcError::parse("operation failed")))
            })
            .await;
        assert!(result.is_err());

        let did_open = server.recv().await;
        assert_eq!(did_open["method"], "textDocument/didOpen");
        let did_close = server.recv().await;
        assert_eq!(did_close["method"], "textDocument/didClose");
        assert!(session.document_state(&path).await.is_none());

        let (closed, _) = tokio::join!(session.close(), server.serve_shutdown());
        closed.unwrap();
    }
}
