//! Backend selection
//!
//! Given a profile's default local and container backends and the caller's
//! preferences, try candidates in a fixed order until one starts:
//!
//! 1. an explicitly chosen backend, alone;
//! 2. the default local server, if its health check passes;
//! 3. the default container server, if container use is enabled;
//! 4. the default local server again, this time allowed to install its
//!    binary on demand.
//!
//! Every candidate failure is kept; if nothing starts, the caller gets all
//! of them in one aggregated error.

use tracing::{info, warn};

use crate::server::container::ContainerServer;
use crate::server::error::{BackendError, BackendSelectionError};
use crate::server::local::LocalServer;
use crate::server::{RunningServer, ServerBackend};
use crate::workspace::Workspace;

/// The backends a profile falls back to when none is chosen explicitly
#[derive(Debug, Clone)]
pub struct DefaultServers {
    pub local: LocalServer,
    pub container: ContainerServer,
}

/// An explicit backend choice, bypassing the fallback ladder
pub enum ServerChoice {
    /// The profile's default local server
    Local,
    /// The profile's default container server
    Container,
    /// A caller-supplied backend instance
    Instance(Box<dyn ServerBackend>),
}

impl std::fmt::Debug for ServerChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerChoice::Local => write!(f, "Local"),
            ServerChoice::Container => write!(f, "Container"),
            ServerChoice::Instance(backend) => write!(f, "Instance({})", backend.name()),
        }
    }
}

/// Candidate ladder runner
pub struct BackendSelector {
    pub defaults: DefaultServers,
    pub choice: Option<ServerChoice>,
    pub enable_container: bool,
}

impl BackendSelector {
    pub fn new(defaults: DefaultServers) -> Self {
        Self {
            defaults,
            choice: None,
            enable_container: false,
        }
    }

    pub fn with_choice(mut self, choice: Option<ServerChoice>) -> Self {
        self.choice = choice;
        self
    }

    pub fn with_container_enabled(mut self, enabled: bool) -> Self {
        self.enable_container = enabled;
        self
    }

    /// Try candidates in order; return the first server that starts.
    pub async fn select_and_start(
        self,
        workspace: &Workspace,
    ) -> Result<RunningServer, BackendSelectionError> {
        let mut attempts: Vec<(String, BackendError)> = Vec::new();

        // An explicit choice is tried first; the ladder still runs when it
        // fails, with the failure retained in the aggregate.
        match self.choice {
            Some(ServerChoice::Instance(backend)) => {
                match try_backend(backend.as_ref(), workspace).await {
                    Ok(running) => return Ok(running),
                    Err(error) => {
                        warn!("Requested backend {} unavailable: {error}", backend.name());
                        attempts.push((backend.name(), error));
                    }
                }
            }
            Some(ServerChoice::Local) => {
                match start_local_with_install(&self.defaults.local, workspace).await {
                    Ok(running) => return Ok(running),
                    Err(error) => {
                        warn!("Requested local server unavailable: {error}");
                        attempts.push((self.defaults.local.name(), error));
                    }
                }
            }
            Some(ServerChoice::Container) => {
                match try_backend(&self.defaults.container, workspace).await {
                    Ok(running) => return Ok(running),
                    Err(error) => {
                        warn!("Requested container server unavailable: {error}");
                        attempts.push((self.defaults.container.name(), error));
                    }
                }
            }
            None => {}
        }

        // Ladder: local, container, local-with-install
        match try_backend(&self.defaults.local, workspace).await {
            Ok(running) => return Ok(running),
            Err(error) => {
                warn!("Local server unavailable: {error}");
                attempts.push((self.defaults.local.name(), error));
            }
        }

        if self.enable_container {
            match try_backend(&self.defaults.container, workspace).await {
                Ok(running) => return Ok(running),
                Err(error) => {
                    warn!("Container server unavailable: {error}");
                    attempts.push((self.defaults.container.name(), error));
                }
            }
        }

        match start_local_with_install(&self.defaults.local, workspace).await {
            Ok(running) => return Ok(running),
            Err(error) => {
                attempts.push((format!("{}+install", self.defaults.local.name()), error));
            }
        }

        Err(BackendSelectionError { attempts })
    }
}

/// Health-check a backend, then start it
async fn try_backend(
    backend: &dyn ServerBackend,
    workspace: &Workspace,
) -> Result<RunningServer, BackendError> {
    backend.check_availability().await?;
    info!("Selected backend {}", backend.name());
    backend.start(workspace).await
}

/// Install the local binary if needed, then start
async fn start_local_with_install(
    local: &LocalServer,
    workspace: &Workspace,
) -> Result<RunningServer, BackendError> {
    local.ensure_installed().await?;
    info!("Selected backend {} (after install check)", local.name());
    local.start(workspace).await
}
