//! Capability registry
//!
//! A client is assembled from capability units. Each unit bundles what one
//! protocol feature needs: a mutation of the advertised
//! `ClientCapabilities`, an optional assertion against the server's
//! capabilities, and handlers for the server-initiated requests and
//! notifications the feature entails. Units compose in order into a
//! `CapabilityRegistry`; later units win on declaration conflicts, and a
//! duplicate request handler replaces the earlier one with a warning.

pub mod units;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use lsp_types::{ClientCapabilities, ServerCapabilities};
use serde_json::Value;
use tracing::warn;

use crate::jsonrpc::types::{JsonRpcErrorObject, JsonRpcNotification, JsonRpcRequest};

/// Boxed future returned by capability handlers
pub type HandlerFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Handler for a server-initiated request; the returned value (or error
/// object) goes back on the wire under the request's id.
pub type RequestHandler =
    Arc<dyn Fn(JsonRpcRequest) -> HandlerFuture<Result<Value, JsonRpcErrorObject>> + Send + Sync>;

/// Handler for a server-initiated notification
pub type NotificationHandler = Arc<dyn Fn(JsonRpcNotification) -> HandlerFuture<()> + Send + Sync>;

type DeclareFn = Arc<dyn Fn(&mut ClientCapabilities) + Send + Sync>;
type ServerCheckFn = Arc<dyn Fn(&ServerCapabilities) -> Result<(), String> + Send + Sync>;

/// One composable protocol feature
#[derive(Clone)]
pub struct CapabilityDescriptor {
    name: String,
    declare: Option<DeclareFn>,
    server_check: Option<ServerCheckFn>,
    request_handlers: Vec<(String, RequestHandler)>,
    notification_handlers: Vec<(String, NotificationHandler)>,
}

impl CapabilityDescriptor {
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self {
            name: name.into(),
            declare: None,
            server_check: None,
            request_handlers: Vec::new(),
            notification_handlers: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mutate the advertised client capabilities
    pub fn declare<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut ClientCapabilities) + Send + Sync + 'static,
    {
        self.declare = Some(Arc::new(f));
        self
    }

    /// Assert something about the server's capabilities after initialize.
    /// Checks only run in debug builds.
    pub fn check_server<F>(mut self, f: F) -> Self
    where
        F: Fn(&ServerCapabilities) -> Result<(), String> + Send + Sync + 'static,
    {
        self.server_check = Some(Arc::new(f));
        self
    }

    /// Handle a server-initiated request method
    pub fn on_request<M, F, Fut>(mut self, method: M, f: F) -> Self
    where
        M: Into<String>,
        F: Fn(JsonRpcRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, JsonRpcErrorObject>> + Send + 'static,
    {
        let handler: RequestHandler = Arc::new(move |request| Box::pin(f(request)));
        self.request_handlers.push((method.into(), handler));
        self
    }

    /// Handle a server-initiated notification method
    pub fn on_notification<M, F, Fut>(mut self, method: M, f: F) -> Self
    where
        M: Into<String>,
        F: Fn(JsonRpcNotification) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: NotificationHandler = Arc::new(move |notification| Box::pin(f(notification)));
        self.notification_handlers.push((method.into(), handler));
        self
    }
}

impl std::fmt::Debug for CapabilityDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityDescriptor")
            .field("name", &self.name)
            .field(
                "request_methods",
                &self
                    .request_handlers
                    .iter()
                    .map(|(m, _)| m.as_str())
                    .collect::<Vec<_>>(),
            )
            .field(
                "notification_methods",
                &self
                    .notification_handlers
                    .iter()
                    .map(|(m, _)| m.as_str())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Server capability assertions that failed during validation
#[derive(Debug)]
pub struct CapabilityMismatch {
    /// (unit name, reason) pairs
    pub failures: Vec<(String, String)>,
}

impl std::error::Error for CapabilityMismatch {}

impl std::fmt::Display for CapabilityMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Server capability check failed:")?;
        for (unit, reason) in &self.failures {
            write!(f, " [{unit}] {reason};")?;
        }
        Ok(())
    }
}

/// Composed view over an ordered list of capability units
pub struct CapabilityRegistry {
    declaration: ClientCapabilities,
    request_handlers: HashMap<String, (String, RequestHandler)>,
    notification_handlers: HashMap<String, Vec<NotificationHandler>>,
    server_checks: Vec<(String, ServerCheckFn)>,
    unit_names: Vec<String>,
}

impl CapabilityRegistry {
    /// Compose units in order. Declarations apply sequentially (last unit
    /// wins on conflicts); notification handlers accumulate per method.
    pub fn compose(units: Vec<CapabilityDescriptor>) -> Self {
        let mut declaration = ClientCapabilities::default();
        let mut request_handlers: HashMap<String, (String, RequestHandler)> = HashMap::new();
        let mut notification_handlers: HashMap<String, Vec<NotificationHandler>> = HashMap::new();
        let mut server_checks = Vec::new();
        let mut unit_names = Vec::new();

        for unit in units {
            if let Some(declare) = &unit.declare {
                declare(&mut declaration);
            }
            if let Some(check) = unit.server_check {
                server_checks.push((unit.name.clone(), check));
            }
            for (method, handler) in unit.request_handlers {
                if let Some((previous_unit, _)) =
                    request_handlers.insert(method.clone(), (unit.name.clone(), handler))
                {
                    warn!(
                        "Request handler for '{method}' from unit '{previous_unit}' replaced by unit '{}'",
                        unit.name
                    );
                }
            }
            for (method, handler) in unit.notification_handlers {
                notification_handlers.entry(method).or_default().push(handler);
            }
            unit_names.push(unit.name);
        }

        Self {
            declaration,
            request_handlers,
            notification_handlers,
            server_checks,
            unit_names,
        }
    }

    /// The merged capabilities to advertise during initialize
    pub fn client_capabilities(&self) -> &ClientCapabilities {
        &self.declaration
    }

    pub fn unit_names(&self) -> &[String] {
        &self.unit_names
    }

    /// Handler for a server-initiated request method, if any unit claims it
    pub fn request_handler(&self, method: &str) -> Option<RequestHandler> {
        self.request_handlers
            .get(method)
            .map(|(_, handler)| Arc::clone(handler))
    }

    /// All handlers registered for a notification method
    pub fn notification_handlers(&self, method: &str) -> Vec<NotificationHandler> {
        self.notification_handlers
            .get(method)
            .map(|handlers| handlers.iter().map(Arc::clone).collect())
            .unwrap_or_default()
    }

    /// Run every unit's server-capability assertion, collecting failures
    pub fn validate_server(
        &self,
        capabilities: &ServerCapabilities,
    ) -> Result<(), CapabilityMismatch> {
        let failures: Vec<(String, String)> = self
            .server_checks
            .iter()
            .filter_map(|(unit, check)| check(capabilities).err().map(|reason| (unit.clone(), reason)))
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CapabilityMismatch { failures })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn unit_declaring_sync(name: &str, did_save: bool) -> CapabilityDescriptor {
        CapabilityDescriptor::new(name).declare(move |caps| {
            let text_document = caps.text_document.get_or_insert_with(Default::default);
            text_document.synchronization = Some(lsp_types::TextDocumentSyncClientCapabilities {
                did_save: Some(did_save),
                ..Default::default()
            });
        })
    }

    #[test]
    fn test_declarations_merge_last_wins() {
        let registry = CapabilityRegistry::compose(vec![
            unit_declaring_sync("first", false),
            unit_declaring_sync("second", true),
        ]);

        let sync = registry
            .client_capabilities()
            .text_document
            .as_ref()
            .unwrap()
            .synchronization
            .as_ref()
            .unwrap();
        assert_eq!(sync.did_save, Some(true));
        assert_eq!(registry.unit_names(), ["first", "second"]);
    }

    #[tokio::test]
    async fn test_request_handler_dispatch() {
        let unit = CapabilityDescriptor::new("config").on_request(
            "workspace/configuration",
            |_request| async { Ok(json!([null])) },
        );
        let registry = CapabilityRegistry::compose(vec![unit]);

        let handler = registry.request_handler("workspace/configuration").unwrap();
        let request = JsonRpcRequest::new("1", "workspace/configuration", None);
        assert_eq!(handler(request).await.unwrap(), json!([null]));

        assert!(registry.request_handler("unknown/method").is_none());
    }

    #[tokio::test]
    async fn test_duplicate_request_handler_last_wins() {
        let first = CapabilityDescriptor::new("first")
            .on_request("m", |_| async { Ok(json!("first")) });
        let second = CapabilityDescriptor::new("second")
            .on_request("m", |_| async { Ok(json!("second")) });

        let registry = CapabilityRegistry::compose(vec![first, second]);
        let handler = registry.request_handler("m").unwrap();
        let outcome = handler(JsonRpcRequest::new("1", "m", None)).await.unwrap();
        assert_eq!(outcome, json!("second"));
    }

    #[tokio::test]
    async fn test_notification_handlers_accumulate() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let counter = Arc::new(AtomicUsize::new(0));

        let make_unit = |name: &str| {
            let counter = Arc::clone(&counter);
            CapabilityDescriptor::new(name).on_notification("n", move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        let registry = CapabilityRegistry::compose(vec![make_unit("a"), make_unit("b")]);
        let handlers = registry.notification_handlers("n");
        assert_eq!(handlers.len(), 2);

        for handler in handlers {
            handler(JsonRpcNotification::new("n", None)).await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        assert!(registry.notification_handlers("other").is_empty());
    }

    #[test]
    fn test_validate_server_collects_failures() {
        let good = CapabilityDescriptor::new("good").check_server(|_| Ok(()));
        let bad_a =
            CapabilityDescriptor::new("bad-a").check_server(|_| Err("no hover".to_string()));
        let bad_b =
            CapabilityDescriptor::new("bad-b").check_server(|_| Err("no sync".to_string()));

        let registry = CapabilityRegistry::compose(vec![good, bad_a, bad_b]);
        let mismatch = registry
            .validate_server(&ServerCapabilities::default())
            .unwrap_err();

        assert_eq!(
            mismatch.failures,
            vec![
                ("bad-a".to_string(), "no hover".to_string()),
                ("bad-b".to_string(), "no sync".to_string())
            ]
        );
    }
}
