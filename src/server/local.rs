//! Local process backend
//!
//! Spawns the language server as a child process with piped stdio, working
//! directory at the workspace root. Availability means the binary resolves
//! on PATH; an optional install hook can fix that on demand.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::io::process::ChildProcessManager;
use crate::server::error::BackendError;
use crate::server::install::InstallHook;
use crate::server::{RunningServer, ServerBackend};
use crate::workspace::Workspace;

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Language server spawned as a local child process
#[derive(Debug, Clone)]
pub struct LocalServer {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub install: Option<InstallHook>,
    pub shutdown_timeout: Duration,
}

impl LocalServer {
    pub fn new<P: Into<String>>(program: P) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            install: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_install(mut self, hook: InstallHook) -> Self {
        self.install = Some(hook);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Run the install hook if the binary is missing and a hook exists
    pub async fn ensure_installed(&self) -> Result<(), BackendError> {
        match &self.install {
            Some(hook) => hook.ensure_installed().await,
            None => self.check_availability().await,
        }
    }
}

#[async_trait]
impl ServerBackend for LocalServer {
    fn name(&self) -> String {
        format!("local({})", self.program)
    }

    async fn check_availability(&self) -> Result<(), BackendError> {
        which::which(&self.program)
            .map(|_| ())
            .map_err(|_| BackendError::BinaryNotFound {
                program: self.program.clone(),
            })
    }

    async fn start(&self, workspace: &Workspace) -> Result<RunningServer, BackendError> {
        info!("Starting local server '{}'", self.program);

        let working_dir = workspace.root().map(|folder| folder.path.clone());
        let mut process = ChildProcessManager::new(
            self.program.clone(),
            self.args.clone(),
            self.env.clone(),
            working_dir,
        );
        process.start().await?;

        RunningServer::from_process(self.name(), process, self.shutdown_timeout)
    }
}
