//! Install-on-demand hooks
//!
//! A local backend can carry a hook describing how to install its binary:
//! either a sequence of commands (e.g. `npm install -g pyright`) or a
//! remote install script that gets downloaded and executed. The hook is a
//! no-op when the binary already resolves on PATH, and installation only
//! counts as successful once it does.

use std::io::Write as _;

use tokio::process::Command;
use tracing::{debug, info};

use crate::server::error::BackendError;

/// How to install a server binary that is missing from PATH
#[derive(Debug, Clone)]
pub enum InstallHook {
    /// Run a fixed sequence of commands
    Commands {
        binary: String,
        commands: Vec<Vec<String>>,
        error_message: Option<String>,
    },
    /// Download a shell script and execute it
    Script {
        binary: String,
        url: String,
        error_message: Option<String>,
    },
}

impl InstallHook {
    /// The binary this hook provides
    pub fn binary(&self) -> &str {
        match self {
            InstallHook::Commands { binary, .. } => binary,
            InstallHook::Script { binary, .. } => binary,
        }
    }

    fn error_message(&self) -> Option<&str> {
        match self {
            InstallHook::Commands { error_message, .. } => error_message.as_deref(),
            InstallHook::Script { error_message, .. } => error_message.as_deref(),
        }
    }

    /// Install the binary unless it is already on PATH.
    pub async fn ensure_installed(&self) -> Result<(), BackendError> {
        let binary = self.binary();
        if which::which(binary).is_ok() {
            debug!("Binary '{binary}' already installed, skipping installation");
            return Ok(());
        }

        info!("Installing '{binary}'");
        match self {
            InstallHook::Commands { commands, .. } => self.run_commands(commands).await?,
            InstallHook::Script { url, .. } => self.run_script(url).await?,
        }

        if which::which(binary).is_err() {
            return Err(BackendError::installation_failed(
                binary,
                self.error_message()
                    .unwrap_or("binary still missing from PATH after installation"),
            ));
        }

        info!("Installed '{binary}'");
        Ok(())
    }

    async fn run_commands(&self, commands: &[Vec<String>]) -> Result<(), BackendError> {
        for argv in commands {
            let Some((program, args)) = argv.split_first() else {
                continue;
            };

            debug!("Running install command: {argv:?}");
            let status = Command::new(program)
                .args(args)
                .status()
                .await
                .map_err(|e| self.failure(format!("failed to run {program}: {e}")))?;

            if !status.success() {
                return Err(self.failure(format!("{program} exited with {status}")));
            }
        }
        Ok(())
    }

    async fn run_script(&self, url: &str) -> Result<(), BackendError> {
        debug!("Downloading install script from {url}");
        let script = reqwest::get(url)
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| self.failure(format!("failed to download install script: {e}")))?
            .text()
            .await
            .map_err(|e| self.failure(format!("failed to read install script: {e}")))?;

        let mut file = tempfile::Builder::new()
            .prefix("lsp-install-")
            .suffix(if cfg!(unix) { ".sh" } else { ".ps1" })
            .tempfile()
            .map_err(|e| self.failure(format!("failed to create temp script: {e}")))?;
        file.write_all(script.as_bytes())
            .map_err(|e| self.failure(format!("failed to write temp script: {e}")))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt as _;
            let permissions = std::fs::Permissions::from_mode(0o755);
            std::fs::set_permissions(file.path(), permissions)
                .map_err(|e| self.failure(format!("failed to chmod temp script: {e}")))?;
        }

        let shell = if cfg!(unix) {
            if which::which("bash").is_ok() { "bash" } else { "sh" }
        } else {
            "powershell"
        };

        let status = Command::new(shell)
            .arg(file.path())
            .status()
            .await
            .map_err(|e| self.failure(format!("failed to run install script: {e}")))?;

        if !status.success() {
            return Err(self.failure(format!("install script exited with {status}")));
        }
        Ok(())
    }

    fn failure(&self, reason: String) -> BackendError {
        match self.error_message() {
            Some(message) => {
                BackendError::installation_failed(self.binary(), format!("{message} ({reason})"))
            }
            None => BackendError::installation_failed(self.binary(), reason),
        }
    }
}
