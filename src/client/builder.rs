//! Session configuration and builder
//!
//! A `ServerProfile` bundles everything that is specific to one language
//! server product: its default local and container backends, the language
//! id it speaks and the settings payload it expects. `SessionBuilder`
//! combines a profile with a workspace and per-session overrides, then
//! hands off to `Session::start`.

use std::time::Duration;

use serde_json::Value;

use crate::capability::CapabilityDescriptor;
use crate::client::error::SessionError;
use crate::client::session::Session;
use crate::server::select::{DefaultServers, ServerChoice};
use crate::workspace::Workspace;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Static description of one language server product
#[derive(Debug, Clone)]
pub struct ServerProfile {
    /// Human-readable name, used in logs and `clientInfo`
    pub name: String,
    /// Language id reported in `textDocument/didOpen`
    pub language_id: String,
    /// Default backends the selection ladder falls back to
    pub servers: DefaultServers,
    /// Settings pushed via `workspace/didChangeConfiguration` right
    /// after the handshake, unless overridden per session
    pub default_configuration: Option<Value>,
}

impl ServerProfile {
    pub fn new(
        name: impl Into<String>,
        language_id: impl Into<String>,
        servers: DefaultServers,
    ) -> Self {
        Self {
            name: name.into(),
            language_id: language_id.into(),
            servers,
            default_configuration: None,
        }
    }

    pub fn with_default_configuration(mut self, settings: Value) -> Self {
        self.default_configuration = Some(settings);
        self
    }
}

/// Fully resolved session parameters, consumed by `Session::start`
pub struct SessionConfig {
    pub profile: ServerProfile,
    pub workspace: Workspace,
    /// Explicit backend choice; `None` runs the fallback ladder
    pub server: Option<ServerChoice>,
    pub enable_container: bool,
    pub request_timeout: Duration,
    /// Mirror `write_file` edits to the server via `textDocument/didChange`
    pub sync_file_changes: bool,
    /// Skip initialize/shutdown; the server is assumed to be mid-session
    /// already (e.g. an externally managed socket endpoint)
    pub unmanaged: bool,
    pub initialization_options: Option<Value>,
    /// Overrides the profile's default configuration when set
    pub configuration: Option<Value>,
    pub extra_capabilities: Vec<CapabilityDescriptor>,
}

impl SessionConfig {
    /// Settings to push after the handshake: session override first,
    /// profile default otherwise.
    pub(crate) fn effective_configuration(&self) -> Option<Value> {
        self.configuration
            .clone()
            .or_else(|| self.profile.default_configuration.clone())
    }
}

pub struct SessionBuilder {
    config: SessionConfig,
}

impl SessionBuilder {
    pub fn new(profile: ServerProfile, workspace: Workspace) -> Self {
        Self {
            config: SessionConfig {
                profile,
                workspace,
                server: None,
                enable_container: false,
                request_timeout: DEFAULT_REQUEST_TIMEOUT,
                sync_file_changes: true,
                unmanaged: false,
                initialization_options: None,
                configuration: None,
                extra_capabilities: Vec::new(),
            },
        }
    }

    pub fn server(mut self, choice: ServerChoice) -> Self {
        self.config.server = Some(choice);
        self
    }

    pub fn enable_container(mut self, enabled: bool) -> Self {
        self.config.enable_container = enabled;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn sync_file_changes(mut self, sync: bool) -> Self {
        self.config.sync_file_changes = sync;
        self
    }

    /// Attach to an already-initialized server: no initialize handshake
    /// on start and no shutdown/exit on close.
    pub fn unmanaged(mut self) -> Self {
        self.config.unmanaged = true;
        self
    }

    pub fn initialization_options(mut self, options: Value) -> Self {
        self.config.initialization_options = Some(options);
        self
    }

    pub fn configuration(mut self, settings: Value) -> Self {
        self.config.configuration = Some(settings);
        self
    }

    /// Add a capability unit on top of the built-in set
    pub fn capability(mut self, unit: CapabilityDescriptor) -> Self {
        self.config.extra_capabilities.push(unit);
        self
    }

    pub fn build(self) -> SessionConfig {
        self.config
    }

    pub async fn start(self) -> Result<Session, SessionError> {
        Session::start(self.config).await
    }
}
