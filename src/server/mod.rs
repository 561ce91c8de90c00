//! Server backends
//!
//! Three ways to reach a language server: spawn it locally, run it inside
//! an OCI container, or connect to one already listening on a socket. Each
//! backend health-checks itself and produces a `RunningServer` holding the
//! live transport plus whatever is needed to tear the server down again.
//! The selector tries candidates in order and aggregates their failures.

pub mod container;
pub mod error;
pub mod install;
pub mod local;
pub mod select;
pub mod socket;

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::io::process::ChildProcessManager;
use crate::io::transport::{StreamTransport, Transport as _};
use crate::workspace::Workspace;

pub use container::{ContainerServer, MountSpec};
pub use error::{BackendError, BackendSelectionError};
pub use install::InstallHook;
pub use local::LocalServer;
pub use select::{BackendSelector, DefaultServers, ServerChoice};
pub use socket::{SocketEndpoint, SocketServer};

/// A way to obtain a running language server
#[async_trait]
pub trait ServerBackend: Send + Sync {
    /// Human-readable backend name, used in logs and aggregated errors
    fn name(&self) -> String;

    /// Cheap health check: would `start` have a chance of succeeding?
    async fn check_availability(&self) -> Result<(), BackendError>;

    /// Start the server for the given workspace
    async fn start(&self, workspace: &Workspace) -> Result<RunningServer, BackendError>;
}

/// A started server: its transport (taken once by the session) and the
/// handle needed to stop it. Socket-backed servers have no process; their
/// teardown is closing the connection.
pub struct RunningServer {
    name: String,
    transport: Option<StreamTransport>,
    process: Option<ChildProcessManager>,
    shutdown_timeout: Duration,
}

impl std::fmt::Debug for RunningServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningServer")
            .field("name", &self.name)
            .field("has_transport", &self.transport.is_some())
            .field("has_process", &self.process.is_some())
            .finish()
    }
}

impl RunningServer {
    pub fn from_process(
        name: String,
        mut process: ChildProcessManager,
        shutdown_timeout: Duration,
    ) -> Result<Self, BackendError> {
        let transport = process.take_transport()?;
        Ok(Self {
            name,
            transport: Some(transport),
            process: Some(process),
            shutdown_timeout,
        })
    }

    pub fn from_transport(name: String, transport: StreamTransport) -> Self {
        Self {
            name,
            transport: Some(transport),
            process: None,
            shutdown_timeout: Duration::ZERO,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take the transport. Available once.
    pub fn take_transport(&mut self) -> Option<StreamTransport> {
        self.transport.take()
    }

    pub fn is_running(&self) -> bool {
        match &self.process {
            Some(process) => process.is_running(),
            None => self.transport.is_some(),
        }
    }

    /// Stop the server: graceful termination with escalation for process
    /// backends, connection close for socket backends.
    pub async fn stop(&mut self) {
        if let Some(mut transport) = self.transport.take()
            && let Err(e) = transport.close().await
        {
            warn!("Failed to close transport of {}: {e}", self.name);
        }

        if let Some(process) = &mut self.process
            && process.is_running()
            && let Err(e) = process.stop_graceful(self.shutdown_timeout).await
        {
            warn!("Failed to stop server {}: {e}", self.name);
        }
    }

    /// Synchronous kill for Drop paths
    pub fn kill_sync(&mut self) {
        if let Some(process) = &mut self.process {
            process.kill_sync();
        }
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        if self.process.as_ref().is_some_and(|p| p.is_running()) {
            warn!(
                "RunningServer '{}' dropped while still running; force killing",
                self.name
            );
            self.kill_sync();
        }
    }
}
