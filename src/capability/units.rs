//! Built-in capability units
//!
//! The units every session composes by default: text document sync,
//! dynamic capability registration, workspace configuration lookups,
//! workspace folder queries and window messages. Profile-specific feature
//! units stack on top of these.

use std::sync::{Arc, RwLock};

use lsp_types::{
    DidChangeConfigurationClientCapabilities, ShowMessageRequestClientCapabilities,
    TextDocumentSyncClientCapabilities,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::capability::CapabilityDescriptor;
use crate::config::ConfigurationMap;
use crate::workspace::Workspace;

/// Text document synchronization: declares didOpen/didChange/didClose
/// support and asserts the server can sync at all.
pub fn text_document_sync() -> CapabilityDescriptor {
    CapabilityDescriptor::new("textDocument/synchronize")
        .declare(|caps| {
            let text_document = caps.text_document.get_or_insert_with(Default::default);
            text_document.synchronization = Some(TextDocumentSyncClientCapabilities {
                dynamic_registration: Some(false),
                will_save: Some(false),
                will_save_wait_until: Some(false),
                did_save: Some(true),
            });
        })
        .check_server(|caps| {
            if caps.text_document_sync.is_some() {
                Ok(())
            } else {
                Err("server does not advertise text document sync".to_string())
            }
        })
}

/// Accept `client/registerCapability` and `client/unregisterCapability`.
///
/// Registrations are acknowledged and logged; the session does not track
/// them further.
pub fn dynamic_registration() -> CapabilityDescriptor {
    CapabilityDescriptor::new("client/registerCapability")
        .on_request("client/registerCapability", |request| async move {
            if let Some(registrations) = request
                .params
                .as_ref()
                .and_then(|p| p.get("registrations"))
                .and_then(Value::as_array)
            {
                for registration in registrations {
                    let method = registration
                        .get("method")
                        .and_then(|v| v.as_str())
                        .unwrap_or("?");
                    debug!("Server registered capability: {method}");
                }
            }
            Ok(Value::Null)
        })
        .on_request("client/unregisterCapability", |_request| async {
            Ok(Value::Null)
        })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigurationItem {
    #[serde(default)]
    scope_uri: Option<String>,
    #[serde(default)]
    section: Option<String>,
}

/// Answer `workspace/configuration` requests out of the shared
/// configuration map, one resolved value per requested item.
pub fn workspace_configuration(config: Arc<RwLock<ConfigurationMap>>) -> CapabilityDescriptor {
    CapabilityDescriptor::new("workspace/configuration")
        .declare(|caps| {
            let workspace = caps.workspace.get_or_insert_with(Default::default);
            workspace.configuration = Some(true);
            workspace.did_change_configuration = Some(DidChangeConfigurationClientCapabilities {
                dynamic_registration: Some(false),
            });
        })
        .on_request("workspace/configuration", move |request| {
            let config = Arc::clone(&config);
            async move {
                let items: Vec<ConfigurationItem> = request
                    .params
                    .as_ref()
                    .and_then(|p| p.get("items"))
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()
                    .unwrap_or_default()
                    .unwrap_or_default();

                // Intentional .unwrap() - poisoned lock indicates serious bug
                let config = config.read().unwrap();
                let values: Vec<Value> = items
                    .iter()
                    .map(|item| config.resolve(item.scope_uri.as_deref(), item.section.as_deref()))
                    .collect();
                Ok(Value::Array(values))
            }
        })
}

/// Answer `workspace/workspaceFolders` with the session's folders
pub fn workspace_folders(workspace: Workspace) -> CapabilityDescriptor {
    CapabilityDescriptor::new("workspace/workspaceFolders")
        .declare(|caps| {
            let workspace_caps = caps.workspace.get_or_insert_with(Default::default);
            workspace_caps.workspace_folders = Some(true);
        })
        .on_request("workspace/workspaceFolders", move |_request| {
            let folders = workspace.lsp_folders();
            async move {
                Ok(serde_json::to_value(folders).unwrap_or(Value::Null))
            }
        })
}

/// Route `window/showMessage` and `window/logMessage` into the log.
/// `window/showMessageRequest` is acknowledged without picking an action.
pub fn window_messages() -> CapabilityDescriptor {
    CapabilityDescriptor::new("window/showMessage")
        .declare(|caps| {
            let window = caps.window.get_or_insert_with(Default::default);
            window.show_message = Some(ShowMessageRequestClientCapabilities {
                message_action_item: None,
            });
        })
        .on_notification("window/showMessage", |notification| async move {
            log_window_message("show", notification.params.as_ref());
        })
        .on_notification("window/logMessage", |notification| async move {
            log_window_message("log", notification.params.as_ref());
        })
        .on_request("window/showMessageRequest", |request| async move {
            log_window_message("show", request.params.as_ref());
            Ok(Value::Null)
        })
}

fn log_window_message(kind: &str, params: Option<&Value>) {
    let default = json!({});
    let params = params.unwrap_or(&default);
    let message = params.get("message").and_then(Value::as_str).unwrap_or("");

    // MessageType: 1 = error, 2 = warning, 3 = info, 4 = log, 5 = debug
    match params.get("type").and_then(Value::as_i64) {
        Some(1) => error!("Server {kind} message: {message}"),
        Some(2) => warn!("Server {kind} message: {message}"),
        Some(3) => info!("Server {kind} message: {message}"),
        _ => debug!("Server {kind} message: {message}"),
    }
}
